//! Error types for the relay connectivity crate.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to relays.
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket transport error.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// SOCKS proxy error.
    #[error("proxy error: {0}")]
    Proxy(#[from] tokio_socks::Error),

    /// HTTP error (capability document fetch).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Core policy/codec error.
    #[error(transparent)]
    Core(#[from] roost_core::Error),

    /// Event signing error (probe marker).
    #[error("signer error: {0}")]
    Signer(String),

    /// A bounded wait elapsed.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The discovery pipeline produced nothing at some stage.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout("probe acknowledgement");
        assert!(err.to_string().contains("probe acknowledgement"));
    }

    #[test]
    fn test_discovery_display() {
        let err = Error::Discovery("no candidates survived the tally".to_string());
        assert!(err.to_string().contains("discovery failed"));
    }
}
