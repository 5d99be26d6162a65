//! Notifications about changes to cached files.
//!
//! The cache subscribes to every cached file and to its parent directory. Any [Event] on either
//! destroys the affected entries: content cached from a file that is being rewritten, deleted, or
//! renamed can no longer be trusted.

use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Mutex},
};
use tracing::debug;

/// A change to a watched path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The path was opened for writing.
    OpenedForWrite,
    /// The path was deleted.
    Deleted,
    /// The path was moved (renamed).
    Moved,
}

/// Invoked for every [Event] on a subscribed path.
pub type Callback = Arc<dyn Fn(Event) + Send + Sync>;

/// Token identifying a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subscription(pub u64);

/// Delivers [Event]s for subscribed paths.
pub trait Watcher: Send + Sync + 'static {
    /// Invoke `callback` for every subsequent event on `path`.
    fn subscribe(&self, path: &str, callback: Callback) -> io::Result<Subscription>;

    /// Stop delivering events for `subscription`.
    fn unsubscribe(&self, subscription: Subscription);
}

#[derive(Default)]
struct Subscribers {
    next: u64,
    callbacks: BTreeMap<u64, (String, Callback)>,
}

/// A [Watcher] whose events are raised explicitly with [Manual::notify].
#[derive(Clone, Default)]
pub struct Manual {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl Manual {
    /// Deliver `event` to every subscriber of `path`, returning how many were notified.
    pub fn notify(&self, path: &str, event: Event) -> usize {
        // Callbacks may unsubscribe, so invoke them without holding the lock
        let callbacks: Vec<Callback> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers
                .callbacks
                .values()
                .filter(|(subscribed, _)| subscribed == path)
                .map(|(_, callback)| callback.clone())
                .collect()
        };
        debug!(path, ?event, subscribers = callbacks.len(), "notifying");
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    /// Returns true if anything is subscribed to `path`.
    pub fn is_subscribed(&self, path: &str) -> bool {
        let subscribers = self.subscribers.lock().unwrap();
        subscribers
            .callbacks
            .values()
            .any(|(subscribed, _)| subscribed == path)
    }

    /// Number of active subscriptions.
    pub fn subscriptions(&self) -> usize {
        self.subscribers.lock().unwrap().callbacks.len()
    }
}

impl Watcher for Manual {
    fn subscribe(&self, path: &str, callback: Callback) -> io::Result<Subscription> {
        let mut subscribers = self.subscribers.lock().unwrap();
        let id = subscribers.next;
        subscribers.next += 1;
        subscribers
            .callbacks
            .insert(id, (path.to_string(), callback));
        Ok(Subscription(id))
    }

    fn unsubscribe(&self, subscription: Subscription) {
        self.subscribers
            .lock()
            .unwrap()
            .callbacks
            .remove(&subscription.0);
    }
}
