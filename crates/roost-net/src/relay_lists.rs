//! Cache of observed author relay lists.
//!
//! Relay-list events (kind 10002) seen anywhere in the event stream are
//! folded into this book, newest-wins per author. The outbox router and the
//! score board both consult it to decide which relays carry an author's
//! content.

use std::collections::HashMap;

use nostr::{Event, PublicKey, RelayUrl, Timestamp};
use parking_lot::RwLock;
use roost_core::{parse_relay_list, UrlPolicy};

/// One author's advertised relays.
#[derive(Debug, Clone, Default)]
pub struct AuthorRelays {
    pub read: Vec<RelayUrl>,
    pub write: Vec<RelayUrl>,
    pub updated_at: Timestamp,
}

/// Known author → relay-list mapping.
#[derive(Default)]
pub struct RelayListBook {
    entries: RwLock<HashMap<PublicKey, AuthorRelays>>,
}

impl RelayListBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a relay-list event into the book. Returns true when the event
    /// replaced or created the author's entry (i.e. it was the newest seen).
    pub fn observe(&self, event: &Event, policy: &UrlPolicy) -> bool {
        let lists = parse_relay_list(event, policy);
        if lists.is_empty() {
            return false;
        }

        let mut entries = self.entries.write();
        match entries.get(&event.pubkey) {
            Some(existing) if existing.updated_at >= event.created_at => false,
            _ => {
                entries.insert(
                    event.pubkey,
                    AuthorRelays {
                        read: lists.read,
                        write: lists.write,
                        updated_at: event.created_at,
                    },
                );
                metrics::counter!("relay_lists_observed_total").increment(1);
                true
            }
        }
    }

    /// Whether a confirmed relay list exists for this author.
    pub fn contains(&self, author: &PublicKey) -> bool {
        self.entries.read().contains_key(author)
    }

    /// The author's advertised write relays, if known.
    pub fn write_relays(&self, author: &PublicKey) -> Option<Vec<RelayUrl>> {
        self.entries
            .read()
            .get(author)
            .map(|e| e.write.clone())
            .filter(|w| !w.is_empty())
    }

    /// The author's advertised read relays, if known.
    pub fn read_relays(&self, author: &PublicKey) -> Option<Vec<RelayUrl>> {
        self.entries
            .read()
            .get(author)
            .map(|e| e.read.clone())
            .filter(|r| !r.is_empty())
    }

    /// Authors from `candidates` that have no confirmed relay list yet.
    pub fn missing_from<'a>(&self, candidates: &'a [PublicKey]) -> Vec<PublicKey> {
        let entries = self.entries.read();
        candidates
            .iter()
            .filter(|pk| !entries.contains_key(pk))
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
