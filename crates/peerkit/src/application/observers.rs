//! Observer traits and the weak registry that holds them.
//!
//! Components never keep their observers alive: a registry stores `Weak`
//! references, silently drops the ones whose owner has gone away, and hands
//! out an [`ObserverHandle`] for explicit removal.  Handle ids are never
//! reused, so removing through a stale handle can never unregister a newer
//! observer by accident.
//!
//! Notification always works on a snapshot: the registry lock is released
//! before any observer is called, so an observer may register or unregister
//! others from inside its callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use peerkit_core::{PeerIdentity, CATCH_ALL_EVENT};

/// Receives one call per observable change of a peer's connection.
pub trait PeerObserver: Send + Sync {
    fn peer_updated(&self, peer: &PeerIdentity);
}

/// Receives the new host after every host change.  `None` means no host.
pub trait HostObserver: Send + Sync {
    fn host_updated(&self, host: Option<&PeerIdentity>);
}

/// Receives inbound payloads routed by event name.
pub trait DataHandler: Send + Sync {
    fn data_received(&self, data: &[u8], from: &PeerIdentity);
}

impl<F> DataHandler for F
where
    F: Fn(&[u8], &PeerIdentity) + Send + Sync,
{
    fn data_received(&self, data: &[u8], from: &PeerIdentity) {
        self(data, from)
    }
}

/// Returned by every `add_*` call; pass it back to remove the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle {
    id: u64,
}

struct Entry<T: ?Sized> {
    id: u64,
    topic: Option<String>,
    observer: Weak<T>,
}

/// A list of weakly held observers, optionally keyed by topic.
pub struct ObserverRegistry<T: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T: ?Sized> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, observer: Weak<T>) -> ObserverHandle {
        self.insert(None, observer)
    }

    /// Registers `observer` for payloads published under `topic` only.
    pub fn register_topic(&self, topic: impl Into<String>, observer: Weak<T>) -> ObserverHandle {
        self.insert(Some(topic.into()), observer)
    }

    /// Removes the registration.  Returns `false` if it was already gone.
    pub fn unregister(&self, handle: ObserverHandle) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e.id != handle.id);
        entries.len() != before
    }

    /// Live observers registered without a topic, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.collect(|topic| topic.is_none())
    }

    /// Live observers registered under exactly `topic`, in registration order.
    pub fn snapshot_topic(&self, topic: &str) -> Vec<Arc<T>> {
        self.collect(|t| t == Some(topic))
    }

    fn insert(&self, topic: Option<String>, observer: Weak<T>) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry {
                id,
                topic,
                observer,
            });
        ObserverHandle { id }
    }

    fn collect(&self, matches: impl Fn(Option<&str>) -> bool) -> Vec<Arc<T>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|e| e.observer.strong_count() > 0);
        entries
            .iter()
            .filter(|e| matches(e.topic.as_deref()))
            .filter_map(|e| e.observer.upgrade())
            .collect()
    }
}

impl<T: ?Sized> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverRegistry<dyn DataHandler> {
    /// Hands `data` to the handlers for `event_name`, then to the catch-all
    /// handlers.  Returns the number of handlers called.
    pub fn dispatch(&self, event_name: &str, data: &[u8], from: &PeerIdentity) -> usize {
        let mut handlers = self.snapshot_topic(event_name);
        if event_name != CATCH_ALL_EVENT {
            handlers.extend(self.snapshot_topic(CATCH_ALL_EVENT));
        }
        for handler in &handlers {
            handler.data_received(data, from);
        }
        handlers.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use peerkit_core::PeerId;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<PeerId>>,
    }

    impl PeerObserver for Recorder {
        fn peer_updated(&self, peer: &PeerIdentity) {
            self.seen.lock().unwrap().push(peer.id());
        }
    }

    fn as_weak(observer: &Arc<Recorder>) -> Weak<dyn PeerObserver> {
        let observer: Arc<dyn PeerObserver> = observer.clone();
        Arc::downgrade(&observer)
    }

    #[test]
    fn test_snapshot_returns_live_observers_in_order() {
        // Arrange
        let registry: ObserverRegistry<dyn PeerObserver> = ObserverRegistry::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        registry.register(as_weak(&first));
        registry.register(as_weak(&second));

        // Act
        let peer = PeerIdentity::remote(PeerId::new(), "p");
        for observer in registry.snapshot() {
            observer.peer_updated(&peer);
        }

        // Assert
        assert_eq!(first.seen.lock().unwrap().as_slice(), &[peer.id()]);
        assert_eq!(second.seen.lock().unwrap().as_slice(), &[peer.id()]);
    }

    #[test]
    fn test_dropped_observer_is_pruned() {
        let registry: ObserverRegistry<dyn PeerObserver> = ObserverRegistry::new();
        let kept = Arc::new(Recorder::default());
        let dropped = Arc::new(Recorder::default());
        registry.register(as_weak(&kept));
        registry.register(as_weak(&dropped));

        drop(dropped);

        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_unregister_removes_only_that_registration() {
        // Arrange
        let registry: ObserverRegistry<dyn PeerObserver> = ObserverRegistry::new();
        let observer = Arc::new(Recorder::default());
        let first = registry.register(as_weak(&observer));
        let second = registry.register(as_weak(&observer));

        // Act
        let removed = registry.unregister(first);

        // Assert
        assert!(removed);
        assert!(!registry.unregister(first), "handle is single-use");
        assert_eq!(registry.snapshot().len(), 1);
        assert!(registry.unregister(second));
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_topic_snapshot_filters_by_name() {
        // Arrange
        let registry: ObserverRegistry<dyn DataHandler> = ObserverRegistry::new();
        let hits = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let chat_hits = Arc::clone(&hits);
        let chat: Arc<dyn DataHandler> = Arc::new(move |_: &[u8], _: &PeerIdentity| {
            chat_hits.lock().unwrap().push("chat");
        });
        let score_hits = Arc::clone(&hits);
        let score: Arc<dyn DataHandler> = Arc::new(move |_: &[u8], _: &PeerIdentity| {
            score_hits.lock().unwrap().push("score");
        });
        registry.register_topic("chat", Arc::downgrade(&chat));
        registry.register_topic("score", Arc::downgrade(&score));

        // Act
        let from = PeerIdentity::remote(PeerId::new(), "p");
        for handler in registry.snapshot_topic("chat") {
            handler.data_received(b"{}", &from);
        }

        // Assert
        assert_eq!(hits.lock().unwrap().as_slice(), &["chat"]);
        assert!(registry.snapshot().is_empty(), "topic entries are not untagged");
    }
}
