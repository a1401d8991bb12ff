//! Relay connectivity core for a Nostr client.
//!
//! This crate maintains dozens of concurrent relay sessions and routes
//! traffic between them and the embedding application:
//!
//! - [`connection`] - one WebSocket session per relay, with jittered
//!   auto-reconnect
//! - [`proxy`] - optional anonymizing SOCKS tunnel shared by all transports
//! - [`pool`] - the connection collections, event dedup, and fan-out
//! - [`subscription`] - per-relay subscription caps and EOSE waits
//! - [`router`] - outbox-model request routing by author write relays
//! - [`scoreboard`] - persistent author→relay coverage for the permanent
//!   relay set
//! - [`health`] - session-based relay reputation with a sticky bad set
//! - [`prober`] - bootstrap relay discovery for fresh installs
//! - [`lifecycle`] - connectivity/foreground reactions and debounced
//!   pool-wide reconnects
//!
//! Event parsing, signing, and wire-message framing come from the `nostr`
//! crate; URL policy and the persisted text encodings live in
//! `roost-core`.

pub mod connection;
pub mod console;
pub mod constants;
mod dedup;
mod error;
pub mod health;
pub mod lifecycle;
pub mod pool;
pub mod prober;
pub mod proxy;
pub mod relay_lists;
pub mod router;
pub mod scoreboard;
pub mod subscription;
mod transport;
mod util;
pub mod wire;

pub use connection::{ConnectionFailure, ConnectionState, RelayConnection, RelayFrame};
pub use console::{ConsoleEntry, ConsoleKind, RelayConsole};
pub use error::{Error, Result};
pub use health::RelayHealthTracker;
pub use lifecycle::{ConnectivityStatus, LifecycleManager};
pub use pool::{EventEnvelope, PoolSignal, RelayPool};
pub use prober::{ProbePhase, ProbeResult, RelayProber, DEFAULT_RELAYS};
pub use proxy::{ProxyService, ProxyStatus};
pub use relay_lists::RelayListBook;
pub use router::OutboxRouter;
pub use scoreboard::RelayScoreBoard;
pub use subscription::{SubscriptionManager, SubscriptionTracker};
