//! Outbox-model request routing.
//!
//! Requests for an author's content go only to the relays that author is
//! known to write to; authors without a cached relay list fall back to a
//! broadcast across the persistent set. Filter templates are specialized
//! per relay by substituting the author subset, and several templates
//! travel as a single multi-filter request.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nostr::{Filter, Kind, PublicKey, RelayUrl, SubscriptionId};

use crate::pool::RelayPool;
use crate::relay_lists::RelayListBook;
use crate::wire;

/// The outcome of partitioning authors by known write relay.
#[derive(Debug, Default)]
pub struct RoutingPlan {
    /// relay -> the authors whose requests it should carry.
    pub targeted: HashMap<RelayUrl, Vec<PublicKey>>,
    /// Authors with no cached write-relay list; they need a broadcast.
    pub broadcast: Vec<PublicKey>,
}

/// Partition `authors` by their cached write relays. An author known to
/// write to several relays appears under each of them.
pub fn plan_author_requests(book: &RelayListBook, authors: &[PublicKey]) -> RoutingPlan {
    let mut plan = RoutingPlan::default();
    for author in authors {
        match book.write_relays(author) {
            Some(relays) => {
                for url in relays {
                    plan.targeted.entry(url).or_default().push(*author);
                }
            }
            None => plan.broadcast.push(*author),
        }
    }
    plan
}

/// Substitute the author subset into each filter template.
fn specialize(templates: &[Filter], authors: &[PublicKey]) -> Vec<Filter> {
    templates
        .iter()
        .map(|t| t.clone().authors(authors.iter().copied()))
        .collect()
}

/// Routes subscriptions to the relays their target authors publish on.
pub struct OutboxRouter {
    pool: RelayPool,
    book: Arc<RelayListBook>,
}

impl OutboxRouter {
    pub fn new(pool: RelayPool, book: Arc<RelayListBook>) -> Self {
        Self { pool, book }
    }

    pub fn relay_list_book(&self) -> &RelayListBook {
        &self.book
    }

    /// Issue `templates` for `authors`: one targeted request per covering
    /// relay carrying only that relay's author subset, plus one broadcast
    /// for the authors nobody covers. Returns the relay URLs that received
    /// a targeted request; a broadcast contributes every tracked relay.
    pub fn subscribe_for_authors(
        &self,
        subscription_id: &SubscriptionId,
        authors: &[PublicKey],
        templates: &[Filter],
    ) -> HashSet<RelayUrl> {
        let plan = plan_author_requests(&self.book, authors);
        let mut reached = HashSet::new();

        for (url, subset) in &plan.targeted {
            let frame = wire::req_frame(subscription_id, &specialize(templates, subset));
            if self.pool.send_to_relay_or_ephemeral(url.as_str(), &frame) {
                reached.insert(url.clone());
            }
        }

        if !plan.broadcast.is_empty() {
            let frame = wire::req_frame(subscription_id, &specialize(templates, &plan.broadcast));
            self.pool.send_to_persistent(&frame);
            reached.extend(self.pool.relay_urls());
        }

        reached
    }

    /// Profile-metadata requests (kind 0) by pubkey, routed the same way.
    pub fn request_profiles(
        &self,
        subscription_id: &SubscriptionId,
        pubkeys: &[PublicKey],
    ) -> HashSet<RelayUrl> {
        let template = Filter::new().kind(Kind::Metadata);
        self.subscribe_for_authors(subscription_id, pubkeys, std::slice::from_ref(&template))
    }

    /// Subscribe on one user's write relays, broadcasting when none are
    /// known.
    pub fn subscribe_on_user_write_relays(
        &self,
        subscription_id: &SubscriptionId,
        pubkey: &PublicKey,
        templates: &[Filter],
    ) -> HashSet<RelayUrl> {
        self.subscribe_on(subscription_id, self.book.write_relays(pubkey), templates)
    }

    /// Subscribe on one user's read relays (where replies to them land),
    /// broadcasting when none are known.
    pub fn subscribe_on_user_read_relays(
        &self,
        subscription_id: &SubscriptionId,
        pubkey: &PublicKey,
        templates: &[Filter],
    ) -> HashSet<RelayUrl> {
        self.subscribe_on(subscription_id, self.book.read_relays(pubkey), templates)
    }

    fn subscribe_on(
        &self,
        subscription_id: &SubscriptionId,
        relays: Option<Vec<RelayUrl>>,
        templates: &[Filter],
    ) -> HashSet<RelayUrl> {
        let frame = wire::req_frame(subscription_id, templates);
        let mut reached = HashSet::new();

        match relays {
            Some(relays) => {
                for url in relays {
                    if self.pool.send_to_relay_or_ephemeral(url.as_str(), &frame) {
                        reached.insert(url);
                    }
                }
            }
            None => {
                self.pool.send_to_persistent(&frame);
                reached.extend(self.pool.relay_urls());
            }
        }

        reached
    }

    /// Ask for relay lists, but only for pubkeys not already cached.
    /// Returns the pubkeys actually requested.
    pub fn request_missing_relay_lists(
        &self,
        subscription_id: &SubscriptionId,
        pubkeys: &[PublicKey],
    ) -> Vec<PublicKey> {
        let missing = self.book.missing_from(pubkeys);
        if missing.is_empty() {
            return missing;
        }

        let filter = Filter::new()
            .kind(Kind::RelayList)
            .authors(missing.iter().copied());
        let frame = wire::req_frame(subscription_id, std::slice::from_ref(&filter));
        self.pool.send_to_persistent(&frame);
        missing
    }
}

#[cfg(test)]
mod tests {
    use nostr::{EventBuilder, Keys, Tag, Timestamp};
    use roost_core::{MemoryStore, UrlPolicy};

    use crate::health::RelayHealthTracker;
    use crate::proxy::ProxyService;

    use super::*;

    fn url(n: usize) -> RelayUrl {
        RelayUrl::parse(&format!("wss://relay{n}.example.com")).expect("valid url")
    }

    fn observe_writes(book: &RelayListBook, keys: &Keys, relays: &[usize]) {
        let tags: Vec<Tag> = relays
            .iter()
            .map(|n| Tag::parse(["r", url(*n).as_str(), "write"]).expect("valid tag"))
            .collect();
        let event = EventBuilder::new(Kind::RelayList, "")
            .tags(tags)
            .custom_created_at(Timestamp::from(100))
            .sign_with_keys(keys)
            .expect("signable event");
        assert!(book.observe(&event, &UrlPolicy::default()));
    }

    fn router_with_book(book: Arc<RelayListBook>) -> OutboxRouter {
        let health = Arc::new(RelayHealthTracker::new(
            Arc::new(MemoryStore::new()),
            "test-identity",
        ));
        let pool = RelayPool::new(Arc::new(ProxyService::disabled()), health);
        OutboxRouter::new(pool, book)
    }

    #[test]
    fn test_plan_groups_known_and_collects_unknown() {
        let book = RelayListBook::new();
        let alice = Keys::generate();
        let bob = Keys::generate();
        let carol = Keys::generate();
        observe_writes(&book, &alice, &[1, 2]);
        observe_writes(&book, &bob, &[1]);

        let plan = plan_author_requests(
            &book,
            &[alice.public_key(), bob.public_key(), carol.public_key()],
        );

        assert_eq!(plan.targeted.len(), 2);
        assert_eq!(plan.targeted[&url(1)].len(), 2);
        assert_eq!(plan.targeted[&url(2)], vec![alice.public_key()]);
        assert_eq!(plan.broadcast, vec![carol.public_key()]);
    }

    #[test]
    fn test_plan_all_unknown_is_broadcast_only() {
        let book = RelayListBook::new();
        let plan = plan_author_requests(
            &book,
            &[Keys::generate().public_key(), Keys::generate().public_key()],
        );
        assert!(plan.targeted.is_empty());
        assert_eq!(plan.broadcast.len(), 2);
    }

    #[test]
    fn test_specialize_substitutes_authors() {
        let authors = vec![Keys::generate().public_key()];
        let templates = vec![
            Filter::new().kind(Kind::TextNote).limit(10),
            Filter::new().kind(Kind::Metadata),
        ];
        let specialized = specialize(&templates, &authors);
        assert_eq!(specialized.len(), 2);
        for filter in &specialized {
            let json = serde_json::to_value(filter).expect("filter json");
            let listed = json["authors"].as_array().expect("authors array");
            assert_eq!(listed.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_subscribe_reaches_covering_relays() {
        let book = Arc::new(RelayListBook::new());
        let alice = Keys::generate();
        observe_writes(&book, &alice, &[1, 2]);
        let router = router_with_book(Arc::clone(&book));

        let reached = router.subscribe_for_authors(
            &SubscriptionId::new("follows-feed"),
            &[alice.public_key()],
            &[Filter::new().kind(Kind::TextNote)],
        );

        assert_eq!(reached, [url(1), url(2)].into_iter().collect());
    }

    #[tokio::test]
    async fn test_all_unknown_touches_no_targeted_relay() {
        let book = Arc::new(RelayListBook::new());
        let router = router_with_book(Arc::clone(&book));

        let reached = router.subscribe_for_authors(
            &SubscriptionId::new("follows-feed"),
            &[Keys::generate().public_key()],
            &[Filter::new().kind(Kind::TextNote)],
        );

        // No persistent relays are tracked, so the broadcast contributes
        // nothing and no ephemeral connection was opened.
        assert!(reached.is_empty());
        assert_eq!(router.pool.ephemeral_len(), 0);
    }

    #[tokio::test]
    async fn test_user_relay_subscriptions_fall_back_to_broadcast() {
        let book = Arc::new(RelayListBook::new());
        let known = Keys::generate();
        observe_writes(&book, &known, &[3]);
        let router = router_with_book(Arc::clone(&book));

        let reached = router.subscribe_on_user_write_relays(
            &SubscriptionId::new("user-feed"),
            &known.public_key(),
            &[Filter::new().kind(Kind::TextNote)],
        );
        assert_eq!(reached, [url(3)].into_iter().collect());

        let unknown = Keys::generate();
        let reached = router.subscribe_on_user_write_relays(
            &SubscriptionId::new("user-feed-2"),
            &unknown.public_key(),
            &[Filter::new().kind(Kind::TextNote)],
        );
        assert!(reached.is_empty());
    }

    #[tokio::test]
    async fn test_request_missing_relay_lists_skips_cached() {
        let book = Arc::new(RelayListBook::new());
        let cached = Keys::generate();
        let missing = Keys::generate();
        observe_writes(&book, &cached, &[1]);
        let router = router_with_book(Arc::clone(&book));

        let requested = router.request_missing_relay_lists(
            &SubscriptionId::new("relay-lists"),
            &[cached.public_key(), missing.public_key()],
        );
        assert_eq!(requested, vec![missing.public_key()]);

        let requested =
            router.request_missing_relay_lists(&SubscriptionId::new("relay-lists"), &[cached.public_key()]);
        assert!(requested.is_empty());
    }
}
