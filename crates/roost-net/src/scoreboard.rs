//! Persistent author → write-relay coverage for the permanent relay set.
//!
//! For every followed author the board keeps a small redundant set of
//! their write relays (up to [`MIN_RELAY_REDUNDANCY`]), so no single relay
//! outage drops that author's content from the background subscriptions.
//! This decides the *permanent* relay set; ad-hoc routing goes through the
//! outbox router directly.
//!
//! Authors without a confirmed relay list may carry provisional "hint"
//! relays (derived from tag provenance); a confirmed list always wins.
//! Every mutation persists the full state through the key-value store,
//! scoped per logged-in identity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nostr::{PublicKey, RelayUrl};
use parking_lot::Mutex;
use roost_core::codec;
use roost_core::{scoped_key, KeyValueStore};

use crate::constants::MIN_RELAY_REDUNDANCY;
use crate::relay_lists::RelayListBook;

const KEY_SCORED_URLS: &str = "scored_urls";
const KEY_AUTHOR_RELAY_MAP: &str = "author_relay_map";
const KEY_CACHED_FOLLOWS: &str = "cached_follows";
const KEY_HINT_MAP: &str = "hint_author_relay_map";

#[derive(Default)]
struct BoardState {
    /// relay -> authors it covers.
    relay_to_authors: HashMap<RelayUrl, HashSet<PublicKey>>,
    /// author -> covering relays (inverse of the above, size-capped).
    author_to_relays: HashMap<PublicKey, HashSet<RelayUrl>>,
    /// Provisional guesses for followed authors without a confirmed list.
    hint_author_relays: HashMap<PublicKey, HashSet<RelayUrl>>,
    /// The follow set the current mapping was built against.
    cached_follows: HashSet<PublicKey>,
}

/// Persistent relay score board.
pub struct RelayScoreBoard {
    state: Mutex<BoardState>,
    store: Arc<dyn KeyValueStore>,
    identity: String,
}

impl RelayScoreBoard {
    /// Load (or start empty) for the given identity.
    pub fn new(store: Arc<dyn KeyValueStore>, identity: &str) -> Self {
        let board = Self {
            state: Mutex::new(BoardState::default()),
            store,
            identity: identity.to_string(),
        };
        board.load();
        board
    }

    /// Relays currently covering at least one followed author.
    pub fn scored_urls(&self) -> Vec<RelayUrl> {
        self.state.lock().relay_to_authors.keys().cloned().collect()
    }

    /// Confirmed covering relays for one author.
    pub fn relays_for_author(&self, author: &PublicKey) -> Vec<RelayUrl> {
        self.state
            .lock()
            .author_to_relays
            .get(author)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the live follow set differs from the one the mapping was
    /// built against.
    pub fn needs_recompute(&self, follows: &[PublicKey]) -> bool {
        let follows: HashSet<PublicKey> = follows.iter().copied().collect();
        self.state.lock().cached_follows != follows
    }

    /// Rebuild the whole mapping from the current follow list. Authors
    /// without a known write-relay list are left uncovered (the router's
    /// broadcast fallback handles them) and prior hints are discarded.
    pub fn recompute(
        &self,
        follows: &[PublicKey],
        book: &RelayListBook,
        exclude: &HashSet<RelayUrl>,
    ) {
        let mut state = self.state.lock();

        let mut fresh = BoardState {
            cached_follows: follows.iter().copied().collect(),
            ..BoardState::default()
        };

        for author in follows {
            let chosen = choose_write_relays(author, book, exclude, &fresh.relay_to_authors);
            if chosen.is_empty() {
                continue;
            }
            for url in &chosen {
                fresh
                    .relay_to_authors
                    .entry(url.clone())
                    .or_default()
                    .insert(*author);
            }
            fresh.author_to_relays.insert(*author, chosen);
        }

        tracing::debug!(
            "score board recomputed: {} authors over {} relays",
            fresh.author_to_relays.len(),
            fresh.relay_to_authors.len()
        );

        *state = fresh;
        self.persist(&state);
    }

    /// Incrementally cover a newly followed author, replacing any
    /// hint-based mapping already present for them.
    pub fn add_author(
        &self,
        author: &PublicKey,
        book: &RelayListBook,
        exclude: &HashSet<RelayUrl>,
    ) {
        let mut state = self.state.lock();
        state.cached_follows.insert(*author);
        state.hint_author_relays.remove(author);

        let chosen = choose_write_relays(author, book, exclude, &state.relay_to_authors);
        if !chosen.is_empty() {
            for url in &chosen {
                state
                    .relay_to_authors
                    .entry(url.clone())
                    .or_default()
                    .insert(*author);
            }
            state.author_to_relays.insert(*author, chosen);
        }

        self.persist(&state);
    }

    /// Reverse of `add_author`: drop the author and prune relays left
    /// covering nobody.
    pub fn remove_author(&self, author: &PublicKey) {
        let mut state = self.state.lock();
        state.cached_follows.remove(author);
        state.hint_author_relays.remove(author);

        if let Some(relays) = state.author_to_relays.remove(author) {
            for url in relays {
                let empty = state
                    .relay_to_authors
                    .get_mut(&url)
                    .map(|authors| {
                        authors.remove(author);
                        authors.is_empty()
                    })
                    .unwrap_or(false);
                if empty {
                    state.relay_to_authors.remove(&url);
                }
            }
        }

        self.persist(&state);
    }

    /// Record provisional relay guesses for a followed author who has no
    /// confirmed write-relay list yet. Capped at the redundancy target;
    /// ignored for unfollowed authors and for authors with confirmed
    /// coverage.
    pub fn add_hint_relays(&self, author: &PublicKey, urls: &[RelayUrl]) {
        let mut state = self.state.lock();
        if !state.cached_follows.contains(author) || state.author_to_relays.contains_key(author) {
            return;
        }

        let hints = state.hint_author_relays.entry(*author).or_default();
        for url in urls {
            if hints.len() >= MIN_RELAY_REDUNDANCY {
                break;
            }
            hints.insert(url.clone());
        }
        if hints.is_empty() {
            state.hint_author_relays.remove(author);
        }

        self.persist(&state);
    }

    /// Group authors by the relay that should carry their requests.
    /// Confirmed mappings win over hints; the `None` bucket collects
    /// authors that need a broadcast.
    pub fn relays_for_authors(
        &self,
        authors: &[PublicKey],
    ) -> HashMap<Option<RelayUrl>, Vec<PublicKey>> {
        let state = self.state.lock();
        let mut grouped: HashMap<Option<RelayUrl>, Vec<PublicKey>> = HashMap::new();

        for author in authors {
            let relays = state
                .author_to_relays
                .get(author)
                .or_else(|| state.hint_author_relays.get(author));
            match relays {
                Some(relays) if !relays.is_empty() => {
                    for url in relays {
                        grouped.entry(Some(url.clone())).or_default().push(*author);
                    }
                }
                _ => grouped.entry(None).or_default().push(*author),
            }
        }

        grouped
    }

    fn persist(&self, state: &BoardState) {
        let mut author_map: HashMap<String, Vec<String>> = HashMap::new();
        for (url, authors) in &state.relay_to_authors {
            author_map.insert(
                url.to_string(),
                authors.iter().map(|a| a.to_hex()).collect(),
            );
        }

        let mut hint_map: HashMap<String, Vec<String>> = HashMap::new();
        for (author, urls) in &state.hint_author_relays {
            hint_map.insert(
                author.to_hex(),
                urls.iter().map(|u| u.to_string()).collect(),
            );
        }

        let follows: Vec<String> = state.cached_follows.iter().map(|a| a.to_hex()).collect();
        let urls: Vec<String> = state.relay_to_authors.keys().map(|u| u.to_string()).collect();

        self.store.put(
            &self.key(KEY_AUTHOR_RELAY_MAP),
            &codec::encode_keyed_lists(&author_map),
        );
        self.store
            .put(&self.key(KEY_HINT_MAP), &codec::encode_keyed_lists(&hint_map));
        self.store.put(
            &self.key(KEY_CACHED_FOLLOWS),
            &codec::encode_comma_list(follows.iter().map(String::as_str)),
        );
        self.store.put(
            &self.key(KEY_SCORED_URLS),
            &codec::encode_comma_list(urls.iter().map(String::as_str)),
        );
    }

    fn load(&self) {
        let mut state = self.state.lock();

        if let Some(text) = self.store.get(&self.key(KEY_AUTHOR_RELAY_MAP)) {
            for (url, authors) in codec::decode_keyed_lists(&text) {
                let Ok(url) = RelayUrl::parse(&url) else {
                    continue;
                };
                let authors: HashSet<PublicKey> = authors
                    .iter()
                    .filter_map(|hex| PublicKey::from_hex(hex).ok())
                    .collect();
                if authors.is_empty() {
                    continue;
                }
                for author in &authors {
                    state
                        .author_to_relays
                        .entry(*author)
                        .or_default()
                        .insert(url.clone());
                }
                state.relay_to_authors.insert(url, authors);
            }
        } else if let Some(text) = self.store.get(&self.key(KEY_SCORED_URLS)) {
            // Legacy fallback: a bare URL list with no author coverage.
            for url in codec::decode_comma_list(&text) {
                if let Ok(url) = RelayUrl::parse(&url) {
                    state.relay_to_authors.entry(url).or_default();
                }
            }
        }

        if let Some(text) = self.store.get(&self.key(KEY_HINT_MAP)) {
            for (author, urls) in codec::decode_keyed_lists(&text) {
                let Ok(author) = PublicKey::from_hex(&author) else {
                    continue;
                };
                let urls: HashSet<RelayUrl> = urls
                    .iter()
                    .filter_map(|u| RelayUrl::parse(u).ok())
                    .collect();
                if !urls.is_empty() {
                    state.hint_author_relays.insert(author, urls);
                }
            }
        }

        if let Some(text) = self.store.get(&self.key(KEY_CACHED_FOLLOWS)) {
            state.cached_follows = codec::decode_comma_list(&text)
                .iter()
                .filter_map(|hex| PublicKey::from_hex(hex).ok())
                .collect();
        }
    }

    fn key(&self, record: &str) -> String {
        scoped_key(&self.identity, record)
    }
}

/// Pick up to the redundancy target from the author's advertised write
/// relays, preferring relays that already cover other authors so the
/// permanent set stays small.
fn choose_write_relays(
    author: &PublicKey,
    book: &RelayListBook,
    exclude: &HashSet<RelayUrl>,
    coverage: &HashMap<RelayUrl, HashSet<PublicKey>>,
) -> HashSet<RelayUrl> {
    let Some(candidates) = book.write_relays(author) else {
        return HashSet::new();
    };

    let mut candidates: Vec<RelayUrl> = candidates
        .into_iter()
        .filter(|url| !exclude.contains(url))
        .collect();
    candidates.sort_by(|a, b| {
        let cover_a = coverage.get(a).map_or(0, HashSet::len);
        let cover_b = coverage.get(b).map_or(0, HashSet::len);
        cover_b.cmp(&cover_a).then_with(|| a.as_str().cmp(b.as_str()))
    });
    candidates.dedup();

    candidates.into_iter().take(MIN_RELAY_REDUNDANCY).collect()
}
