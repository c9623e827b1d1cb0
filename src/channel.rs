// Synchronous fan-out over tokio broadcast channels
//
// Each subscriber owns a broadcast receiver. Publishing sends once and then
// drains every receiver with `try_recv`, so delivery happens before `publish`
// returns and no runtime is needed.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;

/// Messages buffered per receiver between a send and the drain that follows it
pub const CHANNEL_CAPACITY: usize = 64;

struct Subscriber<T> {
    id: u64,
    receiver: RefCell<broadcast::Receiver<T>>,
    handler: Box<dyn Fn(&T)>,
    active: Cell<bool>,
}

struct TopicInner<T> {
    tx: broadcast::Sender<T>,
    subscribers: RefCell<Vec<Rc<Subscriber<T>>>>,
    next_id: Cell<u64>,
}

/// One broadcast channel with callback subscribers. Cloning shares the channel.
pub struct Topic<T> {
    inner: Rc<TopicInner<T>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Default for Topic<T> {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY)
    }
}

impl<T: Clone + 'static> Topic<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            inner: Rc::new(TopicInner {
                tx,
                subscribers: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    /// Send `message` and run every subscriber's handler on it.
    ///
    /// Returns the number of receivers the message reached.
    pub fn publish(&self, message: T) -> usize {
        let reached = self.inner.tx.send(message).unwrap_or(0);
        self.drain();
        reached
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + 'static) -> ListenerGuard {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);

        self.inner.subscribers.borrow_mut().push(Rc::new(Subscriber {
            id,
            receiver: RefCell::new(self.inner.tx.subscribe()),
            handler: Box::new(handler),
            active: Cell::new(true),
        }));

        let weak: Weak<TopicInner<T>> = Rc::downgrade(&self.inner);
        ListenerGuard::new(move || {
            if let Some(inner) = weak.upgrade() {
                detach(&inner, |s| s.id == id);
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// Detach every subscriber. Returns how many there were.
    pub fn close(&self) -> usize {
        let before = self.inner.subscribers.borrow().len();
        detach(&self.inner, |_| true);
        before
    }

    fn drain(&self) {
        // Handlers may subscribe, unsubscribe or publish again; iterate a snapshot
        let subscribers: Vec<Rc<Subscriber<T>>> = self.inner.subscribers.borrow().clone();

        for subscriber in subscribers {
            while subscriber.active.get() {
                let next = subscriber.receiver.borrow_mut().try_recv();
                match next {
                    Ok(message) => (subscriber.handler)(&message),
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(subscriber = subscriber.id, skipped, "Channel subscriber lagged");
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }
    }
}

fn detach<T>(inner: &TopicInner<T>, mut which: impl FnMut(&Subscriber<T>) -> bool) {
    let removed: Vec<Rc<Subscriber<T>>> = {
        let mut subscribers = inner.subscribers.borrow_mut();
        let (removed, kept): (Vec<_>, Vec<_>) = subscribers.drain(..).partition(|s| which(s.as_ref()));
        *subscribers = kept;
        removed
    };
    for subscriber in &removed {
        subscriber.active.set(false);
    }
}

/// Unregisters a listener when released or dropped. Releasing twice is a no-op.
pub struct ListenerGuard {
    teardown: Option<Box<dyn FnOnce()>>,
}

impl ListenerGuard {
    pub fn new(teardown: impl FnOnce() + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    pub fn release(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }

    pub fn is_active(&self) -> bool {
        self.teardown.is_some()
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.release();
    }
}
