//! Shared leaf types and pure logic for the Roost relay core.
//!
//! This crate provides:
//! - Relay-URL acceptability policy and normalization
//! - Relay-list event (kind 10002) parsing into read/write URL lists
//! - The line-oriented text encodings used for persisted reputation state
//! - The key-value storage collaborator trait and per-identity namespacing
//! - Shared error types
//!
//! Everything that touches the network lives in `roost-net`; this crate is
//! deliberately free of I/O so its policy and codec logic stays trivially
//! testable.

pub mod address;
pub mod codec;
mod error;
pub mod keyvalue;
pub mod relay_list;

pub use address::{normalize_relay_url, RelayAddress, UrlCheck, UrlPolicy};
pub use error::{Error, Result};
pub use keyvalue::{scoped_key, KeyValueStore, MemoryStore};
pub use relay_list::{parse_relay_list, RelayListTags};
