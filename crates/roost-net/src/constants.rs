//! Tuning constants for the relay core.

use std::time::Duration;

/// Keepalive ping interval for open WebSocket sessions.
pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Dial timeout for a single connection attempt.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Floor for the delay before an automatic reconnect attempt.
pub(crate) const RECONNECT_FLOOR: Duration = Duration::from_secs(3);

/// Upper bound of the uniform jitter added to reconnect delays.
pub(crate) const RECONNECT_JITTER_MS: u64 = 1000;

/// Maximum persistent connections the pool will hold.
pub const MAX_PERSISTENT_RELAYS: usize = 50;

/// Maximum concurrently open ephemeral connections.
pub const MAX_EPHEMERAL_RELAYS: usize = 30;

/// Idle time after which an ephemeral connection is evicted.
pub(crate) const EPHEMERAL_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Cooldown applied to a relay after an ephemeral connection to it fails.
pub(crate) const RELAY_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Capacity of the bounded seen-event cache.
pub(crate) const SEEN_CACHE_CAPACITY: u64 = 5000;

/// Maximum entries kept in the rolling relay console log.
pub(crate) const CONSOLE_LOG_CAPACITY: usize = 200;

/// Soft cap on concurrently open subscription ids per relay.
pub const MAX_SUBSCRIPTIONS_PER_RELAY: usize = 20;

/// Buffer sizes for the pool's fan-out channels. Relay bursts reach the
/// low thousands of messages; anything past this is dropped for lagging
/// receivers rather than growing without bound.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 4096;
pub(crate) const SIGNAL_CHANNEL_CAPACITY: usize = 1024;

/// Debounce window for pool-wide reconnect requests.
pub(crate) const RECONNECT_DEBOUNCE: Duration = Duration::from_secs(2);

/// How long a reconnect run waits for connections to come up.
pub(crate) const RECONNECT_WAIT: Duration = Duration::from_secs(5);

/// Minimum live connections a forced / soft reconnect waits for.
pub(crate) const RECONNECT_MIN_LIVE_FORCED: usize = 3;
pub(crate) const RECONNECT_MIN_LIVE_SOFT: usize = 1;

/// App pauses shorter than this leave no mark on relay health history.
pub(crate) const HEALTH_SESSION_FLOOR: Duration = Duration::from_secs(30);

/// Sessions kept per relay in the health tracker's rolling history.
pub(crate) const HEALTH_HISTORY_LIMIT: usize = 10;

/// Recorded sessions required before a relay is evaluated at all.
pub(crate) const HEALTH_MIN_SESSIONS: usize = 3;

/// Redundant write relays kept per followed author.
pub const MIN_RELAY_REDUNDANCY: usize = 3;

/// Relay-list events requested per bootstrap relay during discovery.
pub(crate) const HARVEST_LIMIT: usize = 500;

/// Harvested events from the first bootstrap relay that end the harvest early.
pub(crate) const HARVEST_EARLY_STOP: usize = 250;

/// Per-relay harvest timeout, measured from the subscribe.
pub(crate) const HARVEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Mega-relays dropped from the top of the harvest tally.
pub(crate) const TALLY_DROP_TOP: usize = 5;

/// Minimum mentions for a harvested relay to be probed.
pub(crate) const TALLY_MIN_FREQUENCY: usize = 3;

/// Candidates probed after tallying.
pub(crate) const PROBE_CANDIDATES: usize = 15;

/// Wait for a probe publish acknowledgement.
pub(crate) const PROBE_ACK_TIMEOUT: Duration = Duration::from_secs(8);

/// Vetted relays returned by a successful discovery run.
pub(crate) const PROBE_KEEP: usize = 8;
