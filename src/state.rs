// Keyed state store: remote first, local area plus broadcast as fallback

use crate::accessor::RemoteAccessor;
use crate::channel::ListenerGuard;
use crate::broadcast::{Broadcaster, Deduplicator, Origin};
use crate::config::Config;
use crate::local::LocalStore;
use crate::remote::{ChangeEvent, RemoteSubscription};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

type Delivery = Rc<Deduplicator<Box<dyn Fn(Option<Value>)>>>;

/// Persists JSON state under string keys and replicates changes.
///
/// Every call resolves to a value or a no-op. When the remote store fails,
/// the accessor is invalidated and the call is served from the local area;
/// local writes are broadcast so other clients of the origin still see them.
pub struct StateStore {
    accessor: Rc<RemoteAccessor>,
    local: LocalStore,
    broadcaster: Broadcaster,
}

impl StateStore {
    pub fn new(accessor: Rc<RemoteAccessor>, local: LocalStore, broadcaster: Broadcaster) -> Self {
        Self {
            accessor,
            local,
            broadcaster,
        }
    }

    /// Attach a new client of `origin`
    pub fn attach(accessor: Rc<RemoteAccessor>, origin: &Origin, namespace: &str) -> Self {
        let local = LocalStore::new(origin.attach(), namespace);
        let broadcaster = Broadcaster::new(local.clone(), origin.hub.clone());
        Self::new(accessor, local, broadcaster)
    }

    /// Client of `origin` whose remote store comes from configuration
    pub fn connect(config: &Config, origin: &Origin) -> Self {
        let accessor = Rc::new(RemoteAccessor::from_config(&config.remote));
        Self::attach(accessor, origin, &config.local.namespace)
    }

    pub fn accessor(&self) -> &Rc<RemoteAccessor> {
        &self.accessor
    }

    pub fn load_value(&self, key: &str) -> Option<Value> {
        if let Some(remote) = self.accessor.get() {
            match remote.select_state(key) {
                Ok(payload) => return payload,
                Err(e) => {
                    warn!(key, error = %e, "Remote load failed, using local state");
                    self.accessor.invalidate();
                }
            }
        }

        self.local.read(key)
    }

    /// Load and deserialize; a payload of the wrong shape reads as absent
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.load_value(key)?;
        match serde_json::from_value(value) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(key, error = %e, "Stored state has unexpected shape");
                None
            }
        }
    }

    pub fn save_value(&self, key: &str, payload: &Value) {
        if let Some(remote) = self.accessor.get() {
            match remote.upsert_state(key, payload) {
                Ok(()) => {
                    debug!(key, "Saved state remotely");
                    return;
                }
                Err(e) => {
                    warn!(key, error = %e, "Remote save failed, saving locally");
                    self.accessor.invalidate();
                }
            }
        }

        self.local.write(key, payload);
        self.broadcaster.publish(key, Some(payload));
    }

    pub fn save<T: Serialize>(&self, key: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.save_value(key, &value),
            Err(e) => warn!(key, error = %e, "Failed to serialize state"),
        }
    }

    /// Observe changes to `key`: the new payload, or `None` on deletion.
    ///
    /// Uses the remote change feed when available and switches to the local
    /// broadcaster if the feed cannot be opened or fails later. Repeated
    /// deliveries of an identical payload are suppressed.
    pub fn subscribe_value(&self, key: &str, handler: impl Fn(Option<Value>) + 'static) -> Subscription {
        let boxed: Box<dyn Fn(Option<Value>)> = Box::new(handler);
        let deliver: Delivery = Rc::new(Deduplicator::new(boxed));

        let core = Rc::new(SubscriptionCore {
            key: key.to_string(),
            route: RefCell::new(Route::Pending),
        });

        let Some(remote) = self.accessor.get() else {
            core.set_route(Route::Local(self.listen_locally(key, &deliver)));
            return Subscription { core };
        };

        let sink = {
            let weak = Rc::downgrade(&core);
            let accessor = self.accessor.clone();
            let broadcaster = self.broadcaster.clone();
            let deliver = deliver.clone();
            move |event: ChangeEvent| match event {
                ChangeEvent::Upserted(payload) => {
                    deliver.deliver(Some(payload));
                }
                ChangeEvent::Deleted => {
                    deliver.deliver(None);
                }
                ChangeEvent::Failed(reason) => {
                    fail_over(&weak, &accessor, &broadcaster, &deliver, &reason);
                }
            }
        };

        match remote.subscribe_state(key, Box::new(sink)) {
            Ok(mut subscription) => {
                if core.is_pending() {
                    core.set_route(Route::Remote(subscription));
                    debug!(key, "Subscribed to remote change feed");
                } else {
                    // The feed failed while it was being opened
                    subscription.cancel();
                }
            }
            Err(e) => {
                warn!(key, error = %e, "Remote subscribe failed, listening locally");
                self.accessor.invalidate();
                core.set_route(Route::Local(self.listen_locally(key, &deliver)));
            }
        }

        Subscription { core }
    }

    /// Typed `subscribe_value`; payloads that don't deserialize are skipped
    pub fn subscribe<T, F>(&self, key: &str, handler: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(Option<T>) + 'static,
    {
        let owned_key = key.to_string();
        self.subscribe_value(key, move |payload| match payload {
            None => handler(None),
            Some(value) => match serde_json::from_value(value) {
                Ok(typed) => handler(Some(typed)),
                Err(e) => warn!(key = %owned_key, error = %e, "Ignoring state change with unexpected shape"),
            },
        })
    }

    fn listen_locally(&self, key: &str, deliver: &Delivery) -> ListenerGuard {
        listen_locally(&self.broadcaster, key, deliver)
    }
}

fn listen_locally(broadcaster: &Broadcaster, key: &str, deliver: &Delivery) -> ListenerGuard {
    let deliver = deliver.clone();
    broadcaster.listen(key, move |payload| {
        deliver.deliver(payload);
    })
}

fn fail_over(
    core: &Weak<SubscriptionCore>,
    accessor: &RemoteAccessor,
    broadcaster: &Broadcaster,
    deliver: &Delivery,
    reason: &str,
) {
    accessor.invalidate();

    let Some(core) = core.upgrade() else {
        return;
    };
    if core.is_closed() {
        return;
    }

    info!(key = %core.key, reason, "Remote change feed failed, listening locally");
    let guard = listen_locally(broadcaster, &core.key, deliver);
    core.set_route(Route::Local(guard));
}

enum Route {
    Pending,
    Remote(RemoteSubscription),
    Local(ListenerGuard),
    Closed,
}

struct SubscriptionCore {
    key: String,
    route: RefCell<Route>,
}

impl SubscriptionCore {
    /// Swap in `route` and tear down the previous one
    fn set_route(&self, route: Route) {
        let previous = std::mem::replace(&mut *self.route.borrow_mut(), route);
        drop(previous);
    }

    fn is_pending(&self) -> bool {
        matches!(*self.route.borrow(), Route::Pending)
    }

    fn is_closed(&self) -> bool {
        matches!(*self.route.borrow(), Route::Closed)
    }
}

/// Live subscription returned by [`StateStore::subscribe`].
///
/// `unsubscribe` detaches whichever path is active and may be called any
/// number of times; dropping the subscription also unsubscribes.
pub struct Subscription {
    core: Rc<SubscriptionCore>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.core.is_closed() {
            debug!(key = %self.core.key, "Unsubscribed");
        }
        self.core.set_route(Route::Closed);
    }

    pub fn key(&self) -> &str {
        &self.core.key
    }

    pub fn is_remote(&self) -> bool {
        matches!(*self.core.route.borrow(), Route::Remote(_))
    }

    pub fn is_local(&self) -> bool {
        matches!(*self.core.route.borrow(), Route::Local(_))
    }

    pub fn is_active(&self) -> bool {
        self.is_remote() || self.is_local()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
