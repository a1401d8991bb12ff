//! Rolling console log of protocol-level relay notices.
//!
//! Relay rejections (OK with accepted=false), NOTICE frames, and transport
//! failures land here for diagnostics. The log is bounded: once full, the
//! oldest entries are dropped.

use std::collections::VecDeque;

use nostr::RelayUrl;
use parking_lot::Mutex;

use crate::constants::CONSOLE_LOG_CAPACITY;
use crate::util::now_ms;

/// What kind of notice a console entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleKind {
    /// `["OK", id, false, message]` — the relay rejected a published event.
    Rejection,
    /// `["NOTICE", message]`.
    Notice,
    /// A transport-level failure or abnormal close.
    Transport,
}

/// One console entry.
#[derive(Debug, Clone)]
pub struct ConsoleEntry {
    pub at_ms: u64,
    pub relay: RelayUrl,
    pub kind: ConsoleKind,
    pub message: String,
}

/// Bounded rolling log of relay notices.
#[derive(Default)]
pub struct RelayConsole {
    entries: Mutex<VecDeque<ConsoleEntry>>,
}

impl RelayConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, dropping the oldest once the log is full.
    pub fn push(&self, relay: RelayUrl, kind: ConsoleKind, message: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() >= CONSOLE_LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(ConsoleEntry {
            at_ms: now_ms(),
            relay,
            kind,
            message: message.into(),
        });
    }

    /// Snapshot of the current entries, oldest first.
    pub fn entries(&self) -> Vec<ConsoleEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> RelayUrl {
        RelayUrl::parse("wss://relay.example.com").expect("valid url")
    }

    #[test]
    fn test_push_and_snapshot() {
        let console = RelayConsole::new();
        console.push(relay(), ConsoleKind::Notice, "slow down");
        console.push(relay(), ConsoleKind::Rejection, "blocked: spam");

        let entries = console.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, ConsoleKind::Notice);
        assert_eq!(entries[1].message, "blocked: spam");
    }

    #[test]
    fn test_drops_oldest_at_capacity() {
        let console = RelayConsole::new();
        for i in 0..(CONSOLE_LOG_CAPACITY + 10) {
            console.push(relay(), ConsoleKind::Notice, format!("notice {i}"));
        }
        let entries = console.entries();
        assert_eq!(entries.len(), CONSOLE_LOG_CAPACITY);
        assert_eq!(entries[0].message, "notice 10");
    }
}
