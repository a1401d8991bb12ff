//! Relay-list event (NIP-65, kind 10002) parsing.
//!
//! A relay-list event advertises the relays an author writes to and reads
//! from via `r` tags: `["r", url]` means both, `["r", url, "read"]` and
//! `["r", url, "write"]` narrow the direction. Malformed tags and
//! policy-rejected URLs are skipped.

use nostr::{Event, Kind, RelayUrl};

use crate::address::{normalize_relay_url, UrlPolicy};

/// Read/write relay URLs extracted from one relay-list event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayListTags {
    /// Relays the author reads from.
    pub read: Vec<RelayUrl>,
    /// Relays the author writes to.
    pub write: Vec<RelayUrl>,
}

impl RelayListTags {
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }
}

/// Parse the `r` tags of a relay-list event into read/write URL lists.
///
/// Returns an empty list for events of any other kind.
pub fn parse_relay_list(event: &Event, policy: &UrlPolicy) -> RelayListTags {
    let mut out = RelayListTags::default();

    if event.kind != Kind::RelayList {
        return out;
    }

    for tag in event.tags.iter() {
        let fields = tag.as_slice();
        if fields.first().map(String::as_str) != Some("r") || fields.len() < 2 {
            continue;
        }

        let url = match normalize_relay_url(&fields[1], policy).ok() {
            Some(url) => url,
            None => continue,
        };

        match fields.get(2).map(String::as_str) {
            Some("read") => out.read.push(url),
            Some("write") => out.write.push(url),
            // No marker (or an unknown one): advertised for both directions.
            _ => {
                out.read.push(url.clone());
                out.write.push(url);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use nostr::{EventBuilder, Keys, Tag};

    use super::*;

    fn relay_list_event(tags: &[&[&str]]) -> Event {
        let keys = Keys::generate();
        let tags: Vec<Tag> = tags
            .iter()
            .map(|fields| Tag::parse(fields.iter().copied()).expect("valid tag"))
            .collect();
        EventBuilder::new(Kind::RelayList, "")
            .tags(tags)
            .sign_with_keys(&keys)
            .expect("signable event")
    }

    #[test]
    fn test_parses_markers() {
        let event = relay_list_event(&[
            &["r", "wss://both.example.com"],
            &["r", "wss://reads.example.com", "read"],
            &["r", "wss://writes.example.com", "write"],
        ]);
        let lists = parse_relay_list(&event, &UrlPolicy::default());

        let read: Vec<String> = lists.read.iter().map(|u| u.to_string()).collect();
        let write: Vec<String> = lists.write.iter().map(|u| u.to_string()).collect();
        assert_eq!(read, vec!["wss://both.example.com", "wss://reads.example.com"]);
        assert_eq!(
            write,
            vec!["wss://both.example.com", "wss://writes.example.com"]
        );
    }

    #[test]
    fn test_skips_rejected_and_malformed() {
        let event = relay_list_event(&[
            &["r", "wss://ok.example.com"],
            &["r", "ws://insecure.example.com"],
            &["r", "wss://127.0.0.1"],
            &["r"],
            &["p", "wss://not-a-relay-tag.example.com"],
        ]);
        let lists = parse_relay_list(&event, &UrlPolicy::default());
        assert_eq!(lists.write.len(), 1);
        assert_eq!(lists.write[0].to_string(), "wss://ok.example.com");
    }

    #[test]
    fn test_other_kinds_yield_nothing() {
        let keys = Keys::generate();
        let event = EventBuilder::text_note("hello")
            .sign_with_keys(&keys)
            .expect("signable event");
        assert!(parse_relay_list(&event, &UrlPolicy::default()).is_empty());
    }
}
