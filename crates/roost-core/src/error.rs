//! Error types for the Roost core crate.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in policy and codec logic.
#[derive(Error, Debug)]
pub enum Error {
    /// A relay URL is syntactically invalid.
    #[error("invalid relay URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL as given.
        url: String,
        /// Description of what's wrong.
        reason: String,
    },

    /// A relay URL is well-formed but rejected by policy.
    #[error("relay URL '{url}' rejected: {reason}")]
    RejectedUrl {
        /// The offending URL as given.
        url: String,
        /// Which policy rule rejected it.
        reason: String,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Nostr codec error.
    #[error("nostr error: {0}")]
    Nostr(#[from] nostr::event::Error),
}
