//! Subscription-id bookkeeping and end-of-stored-events waits.
//!
//! The tracker soft-caps how many subscription ids stay open per relay;
//! ids carrying a recognized priority prefix bypass the cap. The prefix
//! sets are an informal contract with the embedding application and are
//! kept here as configuration rather than being re-derived.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use nostr::{RelayUrl, SubscriptionId};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;

use crate::constants::MAX_SUBSCRIPTIONS_PER_RELAY;
use crate::pool::{PoolSignal, RelayPool};

/// Subscription categories that must never be capacity-limited.
pub const PRIORITY_SUB_PREFIXES: &[&str] = &[
    "follows",
    "dms",
    "notifications",
    "thread",
    "user",
    "engagement",
];

/// Subscription categories where cross-relay re-delivery is expected and
/// must not be dropped by the dedup cache (thread, profile, and
/// notification loads).
pub const DEDUP_BYPASS_PREFIXES: &[&str] = &["thread", "user", "notifications"];

/// Whether this subscription id skips the seen-event cache.
pub fn bypasses_dedup(subscription_id: &SubscriptionId) -> bool {
    let id = subscription_id.to_string();
    DEDUP_BYPASS_PREFIXES.iter().any(|p| id.starts_with(p))
}

fn is_priority(subscription_id: &str) -> bool {
    PRIORITY_SUB_PREFIXES.iter().any(|p| subscription_id.starts_with(p))
}

/// Per-relay soft cap on concurrently open subscription ids.
#[derive(Default)]
pub struct SubscriptionTracker {
    active: Mutex<HashMap<RelayUrl, HashSet<String>>>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `subscription_id` may be opened on `relay`. Priority
    /// prefixes always have room; everything else counts against the soft
    /// cap.
    pub fn has_capacity(&self, relay: &RelayUrl, subscription_id: &SubscriptionId) -> bool {
        let id = subscription_id.to_string();
        if is_priority(&id) {
            return true;
        }
        let active = self.active.lock();
        active
            .get(relay)
            .map_or(true, |ids| ids.len() < MAX_SUBSCRIPTIONS_PER_RELAY)
    }

    /// Record an opened subscription.
    pub fn track(&self, relay: &RelayUrl, subscription_id: &SubscriptionId) {
        self.active
            .lock()
            .entry(relay.clone())
            .or_default()
            .insert(subscription_id.to_string());
    }

    /// Forget a closed subscription.
    pub fn untrack(&self, relay: &RelayUrl, subscription_id: &SubscriptionId) {
        let mut active = self.active.lock();
        if let Some(ids) = active.get_mut(relay) {
            ids.remove(&subscription_id.to_string());
            if ids.is_empty() {
                active.remove(relay);
            }
        }
    }

    /// How many ids are open on `relay`.
    pub fn count(&self, relay: &RelayUrl) -> usize {
        self.active.lock().get(relay).map_or(0, HashSet::len)
    }
}

/// Awaits end-of-stored-events signals for subscription ids.
pub struct SubscriptionManager {
    pool: RelayPool,
}

impl SubscriptionManager {
    pub fn new(pool: RelayPool) -> Self {
        Self { pool }
    }

    /// Resolve on the first matching EOSE. One-shot: the signal listener
    /// is dropped when this returns.
    pub async fn await_eose(&self, subscription_id: &SubscriptionId) -> RelayUrl {
        let mut signals = self.pool.signals();
        loop {
            match signals.recv().await {
                Ok(PoolSignal::Eose {
                    relay,
                    subscription_id: sid,
                }) if &sid == subscription_id => return relay,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("EOSE wait lagged {skipped} signals");
                }
                Err(RecvError::Closed) => {
                    // Pool torn down; park forever rather than fabricate a
                    // relay. Callers use the timeout variants in practice.
                    futures_util::future::pending::<()>().await;
                }
            }
        }
    }

    /// Like `await_eose`, but returns false instead of blocking past the
    /// timeout.
    pub async fn await_eose_with_timeout(
        &self,
        subscription_id: &SubscriptionId,
        timeout: Duration,
    ) -> bool {
        tokio::time::timeout(timeout, self.await_eose(subscription_id))
            .await
            .is_ok()
    }

    /// Count matching EOSE signals up to `want` or until the timeout,
    /// returning however many arrived.
    pub async fn await_eose_count(
        &self,
        subscription_id: &SubscriptionId,
        want: usize,
        timeout: Duration,
    ) -> usize {
        let mut signals = self.pool.signals();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut seen = 0;

        while seen < want {
            let next = tokio::time::timeout_at(deadline, signals.recv()).await;
            match next {
                Ok(Ok(PoolSignal::Eose {
                    subscription_id: sid,
                    ..
                })) if &sid == subscription_id => seen += 1,
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(_))) => {}
                Ok(Err(RecvError::Closed)) => break,
                Err(_) => break,
            }
        }
        seen
    }

    /// Issue a CLOSE frame on every tracked and ephemeral connection.
    pub fn close_subscription(&self, subscription_id: &SubscriptionId) {
        self.pool.close_subscription(subscription_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use roost_core::MemoryStore;

    use crate::connection::{ConnectionEvent, RelayFrame};
    use crate::health::RelayHealthTracker;
    use crate::proxy::ProxyService;

    use super::*;

    fn relay(n: usize) -> RelayUrl {
        RelayUrl::parse(&format!("wss://relay{n}.example.com")).expect("valid url")
    }

    fn test_pool() -> RelayPool {
        let health = Arc::new(RelayHealthTracker::new(
            Arc::new(MemoryStore::new()),
            "test-identity",
        ));
        RelayPool::new(Arc::new(ProxyService::disabled()), health)
    }

    #[test]
    fn test_tracker_soft_cap() {
        let tracker = SubscriptionTracker::new();
        let relay = relay(1);

        for i in 0..MAX_SUBSCRIPTIONS_PER_RELAY {
            let id = SubscriptionId::new(format!("search-{i}"));
            assert!(tracker.has_capacity(&relay, &id));
            tracker.track(&relay, &id);
        }

        let over = SubscriptionId::new("search-overflow");
        assert!(!tracker.has_capacity(&relay, &over));

        tracker.untrack(&relay, &SubscriptionId::new("search-0"));
        assert!(tracker.has_capacity(&relay, &over));
    }

    #[test]
    fn test_priority_prefixes_bypass_cap() {
        let tracker = SubscriptionTracker::new();
        let relay = relay(1);

        for i in 0..MAX_SUBSCRIPTIONS_PER_RELAY {
            tracker.track(&relay, &SubscriptionId::new(format!("search-{i}")));
        }

        assert!(tracker.has_capacity(&relay, &SubscriptionId::new("follows-feed")));
        assert!(tracker.has_capacity(&relay, &SubscriptionId::new("dms-inbox")));
        assert!(tracker.has_capacity(&relay, &SubscriptionId::new("thread-view-3")));
    }

    #[test]
    fn test_dedup_bypass_prefixes() {
        assert!(bypasses_dedup(&SubscriptionId::new("thread-view-3")));
        assert!(bypasses_dedup(&SubscriptionId::new("user-profile-abc")));
        assert!(bypasses_dedup(&SubscriptionId::new("notifications-main")));
        assert!(!bypasses_dedup(&SubscriptionId::new("follows-feed")));
        assert!(!bypasses_dedup(&SubscriptionId::new("search-1")));
    }

    #[tokio::test]
    async fn test_await_eose_with_timeout_times_out() {
        let manager = SubscriptionManager::new(test_pool());
        let got = manager
            .await_eose_with_timeout(
                &SubscriptionId::new("follows-feed"),
                Duration::from_millis(100),
            )
            .await;
        assert!(!got);
    }

    #[tokio::test]
    async fn test_await_eose_resolves_on_signal() {
        let pool = test_pool();
        let tx = pool.connection_events_sender();
        let manager = SubscriptionManager::new(pool);

        let sub_id = SubscriptionId::new("follows-feed");
        let wait = manager.await_eose_with_timeout(
            &sub_id,
            Duration::from_secs(2),
        );
        let inject = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(ConnectionEvent::Frame {
                url: relay(1),
                frame: RelayFrame::Eose {
                    subscription_id: SubscriptionId::new("follows-feed"),
                },
                raw_len: 0,
            })
            .await
            .expect("send");
        };

        let (got, ()) = tokio::join!(wait, inject);
        assert!(got);
    }

    #[tokio::test]
    async fn test_await_eose_count_partial() {
        let pool = test_pool();
        let tx = pool.connection_events_sender();
        let manager = SubscriptionManager::new(pool);

        let sub_id = SubscriptionId::new("follows-feed");
        let wait = manager.await_eose_count(
            &sub_id,
            3,
            Duration::from_millis(500),
        );
        let inject = async {
            for n in 1..=2 {
                tx.send(ConnectionEvent::Frame {
                    url: relay(n),
                    frame: RelayFrame::Eose {
                        subscription_id: SubscriptionId::new("follows-feed"),
                    },
                    raw_len: 0,
                })
                .await
                .expect("send");
            }
        };

        let (count, ()) = tokio::join!(wait, inject);
        assert_eq!(count, 2);
    }
}
