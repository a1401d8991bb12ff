//! Bounded seen-event cache.
//!
//! Multiple relays deliver the same event; the pool keeps one bounded cache
//! of recently seen event ids and forwards only the first copy. The
//! check-and-insert must be atomic: two relays delivering the same event
//! concurrently must not both see it as new, so the insert goes through the
//! cache's per-key atomic entry API rather than a separate contains/insert
//! pair.

use moka::sync::Cache;
use nostr::EventId;

use crate::constants::SEEN_CACHE_CAPACITY;

/// Bounded cache of recently seen event ids.
pub struct SeenCache {
    cache: Cache<EventId, ()>,
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::with_capacity(SEEN_CACHE_CAPACITY)
    }
}

impl SeenCache {
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Atomically record `id` as seen. Returns true when this call was the
    /// first to see it.
    pub fn check_and_mark(&self, id: EventId) -> bool {
        self.cache.entry(id).or_insert(()).is_fresh()
    }

    /// Whether `id` has been seen (without marking it).
    pub fn contains(&self, id: &EventId) -> bool {
        self.cache.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn test_event_id(n: u8) -> EventId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        EventId::from_slice(&bytes).expect("32-byte id")
    }

    #[test]
    fn test_first_mark_is_fresh() {
        let cache = SeenCache::default();
        let id = test_event_id(1);
        assert!(cache.check_and_mark(id));
        assert!(!cache.check_and_mark(id));
        assert!(cache.contains(&id));
    }

    #[test]
    fn test_concurrent_delivery_admits_exactly_one() {
        let cache = Arc::new(SeenCache::default());
        let id = test_event_id(7);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.check_and_mark(id))
            })
            .collect();

        let fresh = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|fresh| *fresh)
            .count();
        assert_eq!(fresh, 1);
    }

    #[test]
    fn test_distinct_ids_are_independent() {
        let cache = SeenCache::default();
        assert!(cache.check_and_mark(test_event_id(1)));
        assert!(cache.check_and_mark(test_event_id(2)));
    }
}
