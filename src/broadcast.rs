// Cross-client notification: storage events plus a per-key broadcast channel

use crate::area::{AreaClient, StorageArea};
use crate::channel::{ListenerGuard, Topic};
use crate::config::LocalConfig;
use crate::local::LocalStore;
use crate::record::BroadcastMessage;
use eyre::Result;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Same-origin publish/subscribe, one broadcast channel per name
#[derive(Clone, Default)]
pub struct ChannelHub {
    channels: Rc<RefCell<HashMap<String, Topic<BroadcastMessage>>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, channel: &str) -> Option<Topic<BroadcastMessage>> {
        self.channels.borrow().get(channel).cloned()
    }

    /// Deliver `message` to every subscriber of `channel`.
    ///
    /// Returns the number of subscribers reached.
    pub fn post(&self, channel: &str, message: &BroadcastMessage) -> usize {
        match self.topic(channel) {
            Some(topic) => topic.publish(message.clone()),
            None => 0,
        }
    }

    pub fn subscribe(&self, channel: &str, handler: impl Fn(&BroadcastMessage) + 'static) -> ListenerGuard {
        let topic = self
            .channels
            .borrow_mut()
            .entry(channel.to_string())
            .or_default()
            .clone();
        topic.subscribe(handler)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.topic(channel).map_or(0, |t| t.subscriber_count())
    }
}

/// Everything the clients of one origin share
#[derive(Clone)]
pub struct Origin {
    pub area: StorageArea,
    pub hub: ChannelHub,
}

impl Origin {
    pub fn open(config: &LocalConfig) -> Result<Self> {
        Ok(Self {
            area: StorageArea::open(&config.dir, config.quota_bytes)?,
            hub: ChannelHub::new(),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            area: StorageArea::in_memory(None),
            hub: ChannelHub::new(),
        }
    }

    pub fn attach(&self) -> AreaClient {
        self.area.attach()
    }
}

/// Publishes local writes and listens for other clients' writes
#[derive(Clone)]
pub struct Broadcaster {
    local: LocalStore,
    hub: ChannelHub,
}

impl Broadcaster {
    pub fn new(local: LocalStore, hub: ChannelHub) -> Self {
        Self { local, hub }
    }

    fn channel_name(&self, key: &str) -> String {
        self.local.storage_key(key)
    }

    /// Fire-and-forget notification of a write (`Some`) or deletion (`None`)
    pub fn publish(&self, key: &str, payload: Option<&Value>) {
        let message = BroadcastMessage {
            key: key.to_string(),
            payload: payload.cloned(),
        };
        let reached = self.hub.post(&self.channel_name(key), &message);
        debug!(key, reached, "Published state change");
    }

    /// Feed both the storage-event path and the channel path for `key` into
    /// `handler`. Dropping or releasing the guard detaches both.
    pub fn listen(&self, key: &str, handler: impl Fn(Option<Value>) + 'static) -> ListenerGuard {
        let handler: Rc<dyn Fn(Option<Value>)> = Rc::new(handler);

        let storage_key = self.local.storage_key(key);
        let on_storage = handler.clone();
        let storage = self.local.client().on_change(move |event| {
            if event.key != storage_key {
                return;
            }
            match &event.new_value {
                None => on_storage(None),
                Some(raw) => match serde_json::from_str(raw) {
                    Ok(value) => on_storage(Some(value)),
                    Err(e) => debug!(key = %event.key, error = %e, "Ignoring undecodable storage event"),
                },
            }
        });

        let wanted = key.to_string();
        let on_message = handler;
        let channel = self.hub.subscribe(&self.channel_name(key), move |message| {
            if message.key == wanted {
                on_message(message.payload.clone());
            }
        });

        ListenerGuard::new(move || {
            drop(storage);
            drop(channel);
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Snapshot {
    Absent,
    Json(String),
}

/// Suppresses a delivery whose serialized snapshot equals the previous one
pub struct Deduplicator<F> {
    handler: F,
    last: RefCell<Option<Snapshot>>,
}

impl<F: Fn(Option<Value>)> Deduplicator<F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            last: RefCell::new(None),
        }
    }

    /// Returns whether the payload was passed on
    pub fn deliver(&self, payload: Option<Value>) -> bool {
        let snapshot = match &payload {
            None => Snapshot::Absent,
            Some(value) => Snapshot::Json(value.to_string()),
        };

        if self.last.borrow().as_ref() == Some(&snapshot) {
            return false;
        }
        *self.last.borrow_mut() = Some(snapshot);
        (self.handler)(payload);
        true
    }
}
