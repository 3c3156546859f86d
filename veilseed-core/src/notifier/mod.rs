//! Topic-based publish/subscribe.
//!
//! Components announce lifecycle events (circuit ready, capacity degraded,
//! shutdown progress) through a [`Notifier`] shared by the whole session.
//! Handlers run synchronously on the publishing task, in subscription order.
//! A handler that returns an error or panics is logged and skipped; the
//! remaining handlers still run.
//!
//! Async consumers can call [`Notifier::listen`] and receive every
//! notification as a [`Notification`] over a broadcast channel.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Structured notification payload
pub type Payload = Map<String, Value>;

/// Subscriber callback
pub type Handler = Arc<dyn Fn(&Payload) -> anyhow::Result<()> + Send + Sync>;

/// Capacity of the async listener channel
const LISTENER_CAPACITY: usize = 256;

/// Notification topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Session shutdown progress, payload `{"state": <step>}`
    ShutdownState,
    /// A circuit reached READY
    CircuitReady,
    /// A circuit was closed
    CircuitClosed,
    /// A tier cannot keep its minimum number of READY circuits
    CapacityDegraded,
    /// A peer misbehaved during circuit construction
    PeerPenalized,
    /// Discovery learned a new peer
    PeerDiscovered,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::ShutdownState => "shutdown_state",
            Topic::CircuitReady => "circuit_ready",
            Topic::CircuitClosed => "circuit_closed",
            Topic::CapacityDegraded => "capacity_degraded",
            Topic::PeerPenalized => "peer_penalized",
            Topic::PeerDiscovered => "peer_discovered",
        };
        f.write_str(name)
    }
}

/// Handle returned by [`Notifier::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A notification as seen by async listeners
#[derive(Debug, Clone)]
pub struct Notification {
    pub topic: Topic,
    pub payload: Payload,
}

/// Build a payload from key/value pairs
pub fn payload<const N: usize>(fields: [(&str, Value); N]) -> Payload {
    fields
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

struct Inner {
    subscribers: RwLock<HashMap<Topic, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
    listeners: broadcast::Sender<Notification>,
}

/// Shared publish/subscribe hub. Cloning is cheap.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Inner>,
}

impl Notifier {
    pub fn new() -> Self {
        let (listeners, _) = broadcast::channel(LISTENER_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                listeners,
            }),
        }
    }

    /// Register a handler for a topic
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, topic: Topic, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(handlers) = subscribers.get_mut(&topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        before != handlers.len()
    }

    /// Deliver a payload to every handler currently subscribed to `topic`.
    ///
    /// Handlers added or removed while a delivery is in flight take effect
    /// from the next delivery. Returns the number of handlers that
    /// completed without error.
    pub fn notify(&self, topic: Topic, payload: Payload) -> usize {
        let handlers: Vec<(SubscriptionId, Handler)> = {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers.get(&topic).cloned().unwrap_or_default()
        };

        debug!(%topic, handlers = handlers.len(), "Delivering notification");

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&payload))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(%topic, subscription = id.0, error = %e, "Notification handler failed")
                }
                Err(_) => warn!(%topic, subscription = id.0, "Notification handler panicked"),
            }
        }

        // No listeners is not an error
        let _ = self.inner.listeners.send(Notification { topic, payload });

        delivered
    }

    /// Receive every notification asynchronously
    pub fn listen(&self) -> broadcast::Receiver<Notification> {
        self.inner.listeners.subscribe()
    }

    /// Number of handlers registered for a topic
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let notifier = Notifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = seen.clone();
            notifier.subscribe(Topic::CircuitReady, move |_| {
                seen.lock().unwrap().push(n);
                Ok(())
            });
        }

        let delivered = notifier.notify(Topic::CircuitReady, payload([("circuit_id", json!(7))]));
        assert_eq!(delivered, 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let notifier = Notifier::new();
        let hits = Arc::new(Mutex::new(0));

        notifier.subscribe(Topic::ShutdownState, |_| anyhow::bail!("boom"));
        notifier.subscribe(Topic::ShutdownState, |_| panic!("handler panic"));
        let counter = hits.clone();
        notifier.subscribe(Topic::ShutdownState, move |payload| {
            assert_eq!(payload["state"], json!("Stopping overlay"));
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        let delivered =
            notifier.notify(Topic::ShutdownState, payload([("state", json!("Stopping overlay"))]));
        assert_eq!(delivered, 1);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let notifier = Notifier::new();
        let id = notifier.subscribe(Topic::PeerDiscovered, |_| Ok(()));

        assert!(notifier.unsubscribe(Topic::PeerDiscovered, id));
        assert!(!notifier.unsubscribe(Topic::PeerDiscovered, id));
        assert!(!notifier.unsubscribe(Topic::CircuitClosed, id));
        assert_eq!(notifier.notify(Topic::PeerDiscovered, Payload::new()), 0);
    }

    #[test]
    fn test_topics_are_isolated() {
        let notifier = Notifier::new();
        notifier.subscribe(Topic::CircuitClosed, |_| Ok(()));

        assert_eq!(notifier.notify(Topic::CircuitReady, Payload::new()), 0);
        assert_eq!(notifier.subscriber_count(Topic::CircuitClosed), 1);
    }

    #[tokio::test]
    async fn test_listen_receives_notifications() {
        let notifier = Notifier::new();
        let mut rx = notifier.listen();

        notifier.notify(Topic::CapacityDegraded, payload([("tier", json!(3))]));

        let note = rx.recv().await.unwrap();
        assert_eq!(note.topic, Topic::CapacityDegraded);
        assert_eq!(note.payload["tier"], json!(3));
    }
}
