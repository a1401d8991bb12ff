//! Relay URL normalization and acceptability policy.
//!
//! Relay URLs arrive from untrusted sources (relay-list events, tag hints,
//! user input) and are normalized here to prevent duplicates from trailing
//! slashes or case differences, then checked against the client's
//! acceptability policy.
//!
//! # Policy Rules
//!
//! - Scheme must be `wss://`. Plain `ws://` is only accepted for `.onion`
//!   hidden-service hosts while anonymization is active.
//! - No literal IP hosts (IPv4 or IPv6).
//! - No explicit port, unless the host is a `.onion` address.
//! - No loopback, localhost, or `.local` hosts.

use nostr::RelayUrl;
use url::{Host, Url};

use crate::{Error, Result};

/// Options controlling which URLs the policy accepts.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlPolicy {
    /// Allow `.onion` (hidden service) hosts.
    ///
    /// Set when the anonymizing proxy is active; otherwise `.onion` hosts
    /// are rejected since they cannot be reached directly.
    pub allow_onion: bool,
}

/// Result of checking a relay URL against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlCheck {
    /// URL is valid and normalized.
    Ok(RelayUrl),
    /// URL is syntactically invalid.
    Invalid(String),
    /// URL is well-formed but rejected by policy.
    Rejected(String),
}

impl UrlCheck {
    /// Returns the normalized URL if valid.
    pub fn ok(self) -> Option<RelayUrl> {
        match self {
            Self::Ok(url) => Some(url),
            _ => None,
        }
    }

    /// Returns true if the URL passed the policy.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Normalize and policy-check a relay URL.
///
/// Strips trailing slashes and lowercases scheme and host (via URL parsing),
/// then applies the acceptability rules above.
pub fn normalize_relay_url(raw: &str, policy: &UrlPolicy) -> UrlCheck {
    let raw = raw.trim();

    if !raw.starts_with("wss://") && !raw.starts_with("ws://") {
        return UrlCheck::Invalid("scheme must be wss:// or ws://".to_string());
    }

    let parsed = match Url::parse(raw) {
        Ok(u) => u,
        Err(e) => return UrlCheck::Invalid(e.to_string()),
    };

    let host = match parsed.host() {
        Some(h) => h,
        None => return UrlCheck::Invalid("missing host".to_string()),
    };

    let onion = match &host {
        Host::Domain(d) => d.ends_with(".onion"),
        _ => false,
    };

    if let Some(reason) = check_policy(&parsed, &host, onion, policy) {
        return UrlCheck::Rejected(reason);
    }

    // Re-parse through the codec's RelayUrl for canonical form, then strip
    // any trailing slashes it keeps for bare-host URLs.
    let mut normalized = match RelayUrl::parse(parsed.as_str()) {
        Ok(u) => u.to_string(),
        Err(e) => return UrlCheck::Invalid(e.to_string()),
    };
    while normalized.ends_with('/') {
        normalized.pop();
    }

    match RelayUrl::parse(&normalized) {
        Ok(u) => UrlCheck::Ok(u),
        Err(e) => UrlCheck::Invalid(e.to_string()),
    }
}

/// Check a parsed URL against the policy. Returns `Some(reason)` if rejected.
fn check_policy(url: &Url, host: &Host<&str>, onion: bool, policy: &UrlPolicy) -> Option<String> {
    match host {
        Host::Ipv4(_) | Host::Ipv6(_) => {
            return Some("literal IP hosts not allowed".to_string());
        }
        Host::Domain(d) => {
            let d = d.to_ascii_lowercase();
            if d == "localhost" || d.ends_with(".localhost") {
                return Some("localhost not allowed".to_string());
            }
            if d.ends_with(".local") {
                return Some(".local hosts not allowed".to_string());
            }
            if onion && !policy.allow_onion {
                return Some(".onion hosts require active anonymization".to_string());
            }
        }
    }

    if url.scheme() == "ws" && !(onion && policy.allow_onion) {
        return Some("insecure scheme only allowed for .onion hosts".to_string());
    }

    if url.port().is_some() && !onion {
        return Some("explicit ports not allowed".to_string());
    }

    None
}

/// A validated relay URL with read/write capability flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayAddress {
    /// Normalized, policy-accepted URL.
    pub url: RelayUrl,
    /// Whether the client reads (subscribes) from this relay.
    pub read: bool,
    /// Whether the client writes (publishes) to this relay.
    pub write: bool,
}

impl RelayAddress {
    /// Parse and validate a relay address from a raw URL.
    pub fn parse(raw: &str, read: bool, write: bool, policy: &UrlPolicy) -> Result<Self> {
        match normalize_relay_url(raw, policy) {
            UrlCheck::Ok(url) => Ok(Self { url, read, write }),
            UrlCheck::Invalid(reason) => Err(Error::InvalidUrl {
                url: raw.to_string(),
                reason,
            }),
            UrlCheck::Rejected(reason) => Err(Error::RejectedUrl {
                url: raw.to_string(),
                reason,
            }),
        }
    }

    /// A read+write address (the shape used for DM relays).
    pub fn read_write(url: RelayUrl) -> Self {
        Self {
            url,
            read: true,
            write: true,
        }
    }

    /// A read-only address (the shape used for ephemeral connections).
    pub fn read_only(url: RelayUrl) -> Self {
        Self {
            url,
            read: true,
            write: false,
        }
    }
}
