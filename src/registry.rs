//! Soft-state subscriber registry
//!
//! Subscribers are remote services that registered to receive forwarded
//! events. They re-register periodically as a heartbeat; anything quiet for
//! longer than the TTL is pruned. No explicit deregistration is needed, which
//! keeps the set self-healing when subscribers restart.

use crate::allowlist::Ring;
use crate::events::EventKinds;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// A registered subscriber
#[derive(Debug, Clone, Serialize)]
pub struct Subscriber {
    pub id: String,
    pub webhook_url: String,
    pub ring: Ring,
    #[serde(flatten)]
    pub kinds: EventKinds,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Input to an upsert; timestamps are assigned by the registry
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,
    pub webhook_url: String,
    pub ring: Ring,
    pub kinds: EventKinds,
}

/// In-memory subscriber set keyed by id
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    ttl: Duration,
}

impl SubscriberRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Insert or refresh a subscriber. Re-registration preserves the original
    /// `registered_at` and never moves `last_seen` backwards.
    pub fn upsert(&self, registration: Registration) {
        let now = Utc::now();
        let mut subscribers = self.subscribers.write().unwrap();

        let (registered_at, last_seen) = match subscribers.get(&registration.id) {
            Some(existing) => (existing.registered_at, existing.last_seen.max(now)),
            None => (now, now),
        };

        subscribers.insert(
            registration.id.clone(),
            Subscriber {
                id: registration.id,
                webhook_url: registration.webhook_url,
                ring: registration.ring,
                kinds: registration.kinds,
                registered_at,
                last_seen,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<Subscriber> {
        self.subscribers.read().unwrap().get(id).cloned()
    }

    /// Snapshot of all subscribers; fan-out works from this copy so
    /// concurrent registrations and prunes cannot affect an event in flight
    pub fn snapshot(&self) -> Vec<Subscriber> {
        self.subscribers.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove subscribers whose last heartbeat is older than the TTL
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.ttl;
        let mut subscribers = self.subscribers.write().unwrap();
        let before = subscribers.len();
        subscribers.retain(|_, sub| {
            match (now - sub.last_seen).to_std() {
                Ok(age) => age <= ttl,
                // last_seen in the future reads as fresh
                Err(_) => true,
            }
        });
        before - subscribers.len()
    }

    #[cfg(test)]
    pub(crate) fn set_last_seen(&self, id: &str, last_seen: DateTime<Utc>) {
        if let Some(sub) = self.subscribers.write().unwrap().get_mut(id) {
            sub.last_seen = last_seen;
        }
    }
}

/// Periodic pruner; runs until shutdown is signalled
pub async fn run_pruner(
    registry: Arc<SubscriberRegistry>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let removed = registry.prune(Utc::now());
                if removed > 0 {
                    info!(removed, remaining = registry.len(), "Pruned stale subscribers");
                }
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
    use crate::events::EventKind;

    fn registration(id: &str) -> Registration {
        Registration {
            id: id.to_string(),
            webhook_url: format!("http://{}.example", id),
            ring: Ring::Prod,
            kinds: EventKinds {
                received: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_upsert_inserts_with_timestamps() {
        let registry = SubscriberRegistry::new(Duration::from_secs(60));
        registry.upsert(registration("a"));

        let sub = registry.get("a").unwrap();
        assert_eq!(sub.webhook_url, "http://a.example");
        assert_eq!(sub.registered_at, sub.last_seen);
        assert!(sub.kinds.accepts(EventKind::Received));
        assert!(!sub.kinds.accepts(EventKind::Sent));
    }

    #[test]
    fn test_reregistration_preserves_registered_at() {
        let registry = SubscriberRegistry::new(Duration::from_secs(60));
        registry.upsert(registration("a"));
        let first = registry.get("a").unwrap();

        let mut updated = registration("a");
        updated.webhook_url = "http://elsewhere.example".to_string();
        updated.ring = Ring::Ppe;
        registry.upsert(updated);

        let second = registry.get("a").unwrap();
        assert_eq!(second.registered_at, first.registered_at);
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(second.webhook_url, "http://elsewhere.example");
        assert_eq!(second.ring, Ring::Ppe);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_prune_removes_only_stale() {
        let registry = SubscriberRegistry::new(Duration::from_secs(60));
        registry.upsert(registration("stale"));
        registry.upsert(registration("fresh"));

        let now = Utc::now();
        registry.set_last_seen("stale", now - chrono::Duration::seconds(70));

        let removed = registry.prune(now);
        assert_eq!(removed, 1);
        assert!(registry.get("stale").is_none());
        assert!(registry.get("fresh").is_some());
    }

    #[test]
    fn test_prune_keeps_exactly_at_ttl() {
        let registry = SubscriberRegistry::new(Duration::from_secs(60));
        registry.upsert(registration("edge"));

        let now = Utc::now();
        registry.set_last_seen("edge", now - chrono::Duration::seconds(60));
        assert_eq!(registry.prune(now), 0);

        registry.set_last_seen("edge", now - chrono::Duration::seconds(61));
        assert_eq!(registry.prune(now), 1);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = SubscriberRegistry::new(Duration::from_secs(60));
        registry.upsert(registration("a"));

        let snapshot = registry.snapshot();
        registry.upsert(registration("b"));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_pruner_stops_on_shutdown() {
        let registry = Arc::new(SubscriberRegistry::new(Duration::from_secs(60)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_pruner(
            Arc::clone(&registry),
            Duration::from_millis(10),
            shutdown_rx,
        ));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pruner did not stop")
            .unwrap();
    }
}
