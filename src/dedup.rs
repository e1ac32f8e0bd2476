//! Short-lived duplicate suppression for gateway redeliveries
//!
//! The gateway has been observed to re-deliver the same (event kind, message
//! id) pair within a short window. Keys pair the kind with the message id
//! because one message id legitimately shows up across sent, delivered and
//! failed events.

use crate::events::EventKind;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Seen-set of dedup keys with first-seen timestamps
pub struct DedupCache {
    seen: RwLock<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self {
            seen: RwLock::new(HashMap::new()),
        }
    }

    /// The dedup key for an event
    pub fn key(kind: EventKind, message_id: &str) -> String {
        format!("{}-{}", kind.short(), message_id)
    }

    /// Atomically check-and-record a key. Returns true when the key was
    /// already present (the event is a duplicate).
    pub fn seen_and_mark(&self, key: &str) -> bool {
        let mut seen = self.seen.write().unwrap();
        if seen.contains_key(key) {
            return true;
        }
        seen.insert(key.to_string(), Instant::now());
        false
    }

    /// Drop entries older than the TTL
    pub fn sweep(&self, ttl: Duration) {
        let mut seen = self.seen.write().unwrap();
        let before = seen.len();
        seen.retain(|_, first_seen| first_seen.elapsed() <= ttl);
        let swept = before - seen.len();
        if swept > 0 {
            debug!(swept, remaining = seen.len(), "Swept dedup cache");
        }
    }

    pub fn len(&self) -> usize {
        self.seen.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, key: &str, age: Duration) {
        if let Some(first_seen) = self.seen.write().unwrap().get_mut(key) {
            *first_seen = Instant::now() - age;
        }
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic sweeper; runs until shutdown is signalled
pub async fn run_sweeper(
    cache: Arc<DedupCache>,
    interval: Duration,
    ttl: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                cache.sweep(ttl);
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sight_marks() {
        let cache = DedupCache::new();
        assert!(!cache.seen_and_mark("received-m1"));
        assert!(cache.seen_and_mark("received-m1"));
        assert!(!cache.seen_and_mark("received-m2"));
    }

    #[test]
    fn test_same_message_id_across_kinds_is_distinct() {
        let cache = DedupCache::new();
        let sent = DedupCache::key(EventKind::Sent, "m3");
        let delivered = DedupCache::key(EventKind::Delivered, "m3");
        assert_ne!(sent, delivered);

        assert!(!cache.seen_and_mark(&sent));
        assert!(!cache.seen_and_mark(&delivered));
        assert!(cache.seen_and_mark(&sent));
    }

    #[test]
    fn test_sweep_expires_old_entries() {
        let cache = DedupCache::new();
        cache.seen_and_mark("received-old");
        cache.seen_and_mark("received-new");
        cache.backdate("received-old", Duration::from_secs(600));

        cache.sweep(Duration::from_secs(300));

        assert_eq!(cache.len(), 1);
        // the swept key is treated as unseen again
        assert!(!cache.seen_and_mark("received-old"));
        assert!(cache.seen_and_mark("received-new"));
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let cache = Arc::new(DedupCache::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_sweeper(
            Arc::clone(&cache),
            Duration::from_millis(10),
            Duration::from_secs(300),
            shutdown_rx,
        ));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
