//! The connection pool.
//!
//! Owns the persistent, DM, and ephemeral connection collections, merges
//! every connection's inbound stream into deduplicated event fan-out,
//! enforces capacity caps and cooldowns, and keeps the rolling console log
//! of protocol-level notices.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use nostr::{Event, EventId, RelayUrl, SubscriptionId};
use parking_lot::{Mutex, RwLock};
use roost_core::{RelayAddress, UrlCheck};
use tokio::sync::{broadcast, mpsc, watch};

use crate::connection::{
    ConnectionEvent, ConnectionState, RelayConnection, RelayFrame,
};
use crate::console::{ConsoleKind, RelayConsole};
use crate::constants::{
    EPHEMERAL_IDLE_TIMEOUT, EVENT_CHANNEL_CAPACITY, MAX_EPHEMERAL_RELAYS, MAX_PERSISTENT_RELAYS,
    RELAY_COOLDOWN, SIGNAL_CHANNEL_CAPACITY,
};
use crate::dedup::SeenCache;
use crate::health::RelayHealthTracker;
use crate::proxy::ProxyService;
use crate::subscription::bypasses_dedup;
use crate::util::now_ms;
use crate::wire;

/// An event plus where it came from.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event: Box<Event>,
    pub relay: RelayUrl,
    pub subscription_id: SubscriptionId,
}

/// Non-event relay signals fanned out by the pool.
#[derive(Debug, Clone)]
pub enum PoolSignal {
    Eose {
        relay: RelayUrl,
        subscription_id: SubscriptionId,
    },
    Ok {
        relay: RelayUrl,
        event_id: EventId,
        accepted: bool,
        message: String,
    },
    Notice {
        relay: RelayUrl,
        message: String,
    },
    Disconnected {
        relay: RelayUrl,
    },
}

struct EphemeralEntry {
    connection: RelayConnection,
    last_used_ms: u64,
}

struct PoolInner {
    proxy: Arc<ProxyService>,
    health: Arc<RelayHealthTracker>,
    persistent: RwLock<HashMap<RelayUrl, RelayConnection>>,
    dm: RwLock<HashMap<RelayUrl, RelayConnection>>,
    ephemeral: RwLock<HashMap<RelayUrl, EphemeralEntry>>,
    /// url -> epoch ms before which targeted sends are refused.
    cooldowns: Mutex<HashMap<RelayUrl, u64>>,
    blocked: RwLock<HashSet<RelayUrl>>,
    seen: SeenCache,
    console: RelayConsole,
    conn_events: mpsc::Sender<ConnectionEvent>,
    events_tx: broadcast::Sender<Box<Event>>,
    tagged_tx: broadcast::Sender<EventEnvelope>,
    signals_tx: broadcast::Sender<PoolSignal>,
    connected: watch::Sender<usize>,
    active: AtomicBool,
}

/// The relay connection pool.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Build a pool and start its merge task.
    pub fn new(proxy: Arc<ProxyService>, health: Arc<RelayHealthTracker>) -> Self {
        let (conn_events, conn_events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (tagged_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (signals_tx, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        let (connected, _) = watch::channel(0);

        let inner = Arc::new(PoolInner {
            proxy,
            health,
            persistent: RwLock::new(HashMap::new()),
            dm: RwLock::new(HashMap::new()),
            ephemeral: RwLock::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            blocked: RwLock::new(HashSet::new()),
            seen: SeenCache::default(),
            console: RelayConsole::new(),
            conn_events,
            events_tx,
            tagged_tx,
            signals_tx,
            connected,
            active: AtomicBool::new(true),
        });

        tokio::spawn(merge_loop(Arc::downgrade(&inner), conn_events_rx));

        Self { inner }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Collection management
    // ─────────────────────────────────────────────────────────────────────

    /// Diff the persistent collection against `configs`: blocked URLs are
    /// filtered, the set is capped, stale connections are torn down, and
    /// new ones are created and connected.
    pub fn update_relays(&self, configs: Vec<RelayAddress>) {
        let blocked = self.inner.blocked.read().clone();
        let desired: Vec<RelayAddress> = configs
            .into_iter()
            .filter(|c| !blocked.contains(&c.url))
            .take(MAX_PERSISTENT_RELAYS)
            .collect();

        let mut persistent = self.inner.persistent.write();

        let keep: HashSet<&RelayUrl> = desired.iter().map(|c| &c.url).collect();
        let stale: Vec<RelayUrl> = persistent
            .keys()
            .filter(|url| !keep.contains(url))
            .cloned()
            .collect();
        for url in stale {
            if let Some(conn) = persistent.remove(&url) {
                tracing::debug!("removing persistent relay {}", url);
                conn.disconnect();
            }
        }

        for config in desired {
            match persistent.get(&config.url) {
                Some(existing) if existing.address() == &config => {}
                _ => {
                    if let Some(old) = persistent.remove(&config.url) {
                        old.disconnect();
                    }
                    let conn = RelayConnection::new(
                        config.clone(),
                        true,
                        self.inner.conn_events.clone(),
                        Arc::clone(&self.inner.proxy),
                    );
                    conn.connect();
                    persistent.insert(config.url, conn);
                }
            }
        }
    }

    /// Mirror of `update_relays` for the DM-only collection; DM relays are
    /// always read+write.
    pub fn update_dm_relays(&self, urls: Vec<RelayUrl>) {
        let blocked = self.inner.blocked.read().clone();
        let desired: Vec<RelayUrl> = urls
            .into_iter()
            .filter(|u| !blocked.contains(u))
            .collect();

        let mut dm = self.inner.dm.write();

        let keep: HashSet<&RelayUrl> = desired.iter().collect();
        let stale: Vec<RelayUrl> = dm.keys().filter(|u| !keep.contains(u)).cloned().collect();
        for url in stale {
            if let Some(conn) = dm.remove(&url) {
                conn.disconnect();
            }
        }

        for url in desired {
            if !dm.contains_key(&url) {
                let conn = RelayConnection::new(
                    RelayAddress::read_write(url.clone()),
                    true,
                    self.inner.conn_events.clone(),
                    Arc::clone(&self.inner.proxy),
                );
                conn.connect();
                dm.insert(url, conn);
            }
        }
    }

    /// Retroactively disconnect and purge any tracked connection matching a
    /// newly blocked URL.
    pub fn update_blocked_urls(&self, urls: Vec<RelayUrl>) {
        let blocked: HashSet<RelayUrl> = urls.into_iter().collect();

        self.inner.persistent.write().retain(|url, conn| {
            if blocked.contains(url) {
                tracing::info!("purging blocked relay {}", url);
                conn.disconnect();
                false
            } else {
                true
            }
        });
        self.inner.dm.write().retain(|url, conn| {
            if blocked.contains(url) {
                conn.disconnect();
                false
            } else {
                true
            }
        });
        self.inner.ephemeral.write().retain(|url, entry| {
            if blocked.contains(url) {
                entry.connection.disconnect();
                false
            } else {
                true
            }
        });

        *self.inner.blocked.write() = blocked;
    }

    /// Evict ephemeral connections idle past the timeout and clear expired
    /// cooldown entries. Intended to run periodically.
    pub fn cleanup_ephemeral_relays(&self) {
        let now = now_ms();
        let idle_cutoff = now.saturating_sub(EPHEMERAL_IDLE_TIMEOUT.as_millis() as u64);

        self.inner.ephemeral.write().retain(|url, entry| {
            if entry.last_used_ms < idle_cutoff {
                tracing::debug!("evicting idle ephemeral relay {}", url);
                entry.connection.disconnect();
                false
            } else {
                true
            }
        });

        self.inner.cooldowns.lock().retain(|_, until| *until > now);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────

    /// Broadcast a frame to every persistent and DM connection. Returns how
    /// many connections accepted it.
    pub fn send_to_all(&self, frame: &str) -> usize {
        self.send_where(frame, |_| true)
    }

    /// Broadcast to relays flagged for reading.
    pub fn send_to_read_relays(&self, frame: &str) -> usize {
        self.send_where(frame, |addr| addr.read)
    }

    /// Broadcast to relays flagged for writing.
    pub fn send_to_write_relays(&self, frame: &str) -> usize {
        self.send_where(frame, |addr| addr.write)
    }

    /// Broadcast to the persistent collection only (router fallback path;
    /// DM relays never carry feed requests).
    pub fn send_to_persistent(&self, frame: &str) -> usize {
        let connections: Vec<RelayConnection> =
            self.inner.persistent.read().values().cloned().collect();
        let mut sent = 0;
        for conn in connections {
            if conn.send(frame.to_string()) {
                self.note_sent(conn.url(), frame);
                sent += 1;
            }
        }
        sent
    }

    fn send_where(&self, frame: &str, want: impl Fn(&RelayAddress) -> bool) -> usize {
        let mut sent = 0;
        for conn in self.snapshot_persistent_and_dm() {
            if want(conn.address()) && conn.send(frame.to_string()) {
                self.note_sent(conn.url(), frame);
                sent += 1;
            }
        }
        sent
    }

    /// Send to a specific already-tracked connection (persistent, DM, or
    /// ephemeral).
    pub fn send_to_relay(&self, url: &RelayUrl, frame: &str) -> bool {
        if let Some(conn) = self.lookup(url) {
            if conn.send(frame.to_string()) {
                self.note_sent(url, frame);
                self.touch_ephemeral(url);
                return true;
            }
        }
        false
    }

    /// Send to `url`, lazily opening a read-only ephemeral connection when
    /// the relay is not already tracked.
    ///
    /// Refuses blocked URLs, URLs that fail the acceptability policy, and
    /// URLs under active cooldown; returns false when the ephemeral
    /// collection is full.
    pub fn send_to_relay_or_ephemeral(&self, url: &str, frame: &str) -> bool {
        let url = match roost_core::normalize_relay_url(url, &self.inner.proxy.url_policy()) {
            UrlCheck::Ok(url) => url,
            UrlCheck::Invalid(reason) | UrlCheck::Rejected(reason) => {
                tracing::debug!("refusing send to '{}': {}", url, reason);
                return false;
            }
        };

        if self.inner.blocked.read().contains(&url) {
            return false;
        }
        if let Some(until) = self.inner.cooldowns.lock().get(&url) {
            if *until > now_ms() {
                return false;
            }
        }

        // An already-tracked relay is reused, never shadowed by a new
        // ephemeral connection.
        if self.lookup(&url).is_some() {
            return self.send_to_relay(&url, frame);
        }

        // Not tracked yet: open an ephemeral slot if one is free.
        let mut ephemeral = self.inner.ephemeral.write();
        if ephemeral.len() >= MAX_EPHEMERAL_RELAYS {
            tracing::debug!("ephemeral slots exhausted, refusing {}", url);
            return false;
        }

        let conn = RelayConnection::new(
            RelayAddress::read_only(url.clone()),
            false,
            self.inner.conn_events.clone(),
            Arc::clone(&self.inner.proxy),
        );
        conn.connect();
        let accepted = conn.send(frame.to_string());
        if accepted {
            self.note_sent(&url, frame);
        }
        ephemeral.insert(
            url,
            EphemeralEntry {
                connection: conn,
                last_used_ms: now_ms(),
            },
        );
        accepted
    }

    /// Issue a CLOSE for this subscription on every tracked connection.
    pub fn close_subscription(&self, subscription_id: &SubscriptionId) {
        let frame = wire::close_frame(subscription_id);
        for conn in self.snapshot_persistent_and_dm() {
            conn.send(frame.clone());
        }
        let ephemeral = self.inner.ephemeral.read();
        for entry in ephemeral.values() {
            entry.connection.send(frame.clone());
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reconnect & status
    // ─────────────────────────────────────────────────────────────────────

    /// Bulk reconnect. Forced tears down and redials every persistent
    /// connection; soft only dials the ones not currently connected.
    pub fn reconnect_all(&self, forced: bool) {
        for conn in self.snapshot_persistent_and_dm() {
            if forced {
                conn.reconnect();
            } else if !conn.is_connected() {
                conn.connect();
            }
        }
    }

    /// Live connected-connection count.
    pub fn connected_count(&self) -> usize {
        *self.inner.connected.borrow()
    }

    /// Watch the live connected-connection count.
    pub fn watch_connected(&self) -> watch::Receiver<usize> {
        self.inner.connected.subscribe()
    }

    /// Mark the pool active/inactive (driven by the lifecycle manager).
    pub fn set_active(&self, active: bool) {
        self.inner.active.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// URLs of the persistent collection.
    pub fn relay_urls(&self) -> Vec<RelayUrl> {
        self.inner.persistent.read().keys().cloned().collect()
    }

    pub fn persistent_len(&self) -> usize {
        self.inner.persistent.read().len()
    }

    pub fn ephemeral_len(&self) -> usize {
        self.inner.ephemeral.read().len()
    }

    /// The rolling console log.
    pub fn console(&self) -> &RelayConsole {
        &self.inner.console
    }

    // ─────────────────────────────────────────────────────────────────────
    // Streams
    // ─────────────────────────────────────────────────────────────────────

    /// Flat stream of deduplicated events.
    pub fn events(&self) -> broadcast::Receiver<Box<Event>> {
        self.inner.events_tx.subscribe()
    }

    /// Provenance-tagged stream of deduplicated events.
    pub fn tagged_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.tagged_tx.subscribe()
    }

    /// Non-event relay signals (EOSE, OK, NOTICE, disconnects).
    pub fn signals(&self) -> broadcast::Receiver<PoolSignal> {
        self.inner.signals_tx.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    fn snapshot_persistent_and_dm(&self) -> Vec<RelayConnection> {
        let mut out: Vec<RelayConnection> = self.inner.persistent.read().values().cloned().collect();
        out.extend(self.inner.dm.read().values().cloned());
        out
    }

    fn lookup(&self, url: &RelayUrl) -> Option<RelayConnection> {
        if let Some(conn) = self.inner.persistent.read().get(url) {
            return Some(conn.clone());
        }
        if let Some(conn) = self.inner.dm.read().get(url) {
            return Some(conn.clone());
        }
        self.inner
            .ephemeral
            .read()
            .get(url)
            .map(|e| e.connection.clone())
    }

    fn touch_ephemeral(&self, url: &RelayUrl) {
        if let Some(entry) = self.inner.ephemeral.write().get_mut(url) {
            entry.last_used_ms = now_ms();
        }
    }

    fn note_sent(&self, url: &RelayUrl, frame: &str) {
        if frame.starts_with("[\"EVENT\"") {
            self.inner.health.on_event_sent(url, frame.len());
        }
    }

    pub(crate) fn put_cooldown(&self, url: RelayUrl, until_ms: u64) {
        self.inner.cooldowns.lock().insert(url, until_ms);
    }

    #[cfg(test)]
    pub(crate) fn connection_events_sender(&self) -> mpsc::Sender<ConnectionEvent> {
        self.inner.conn_events.clone()
    }

    #[cfg(test)]
    pub(crate) fn age_ephemeral(&self, url: &RelayUrl, by_ms: u64) {
        if let Some(entry) = self.inner.ephemeral.write().get_mut(url) {
            entry.last_used_ms = entry.last_used_ms.saturating_sub(by_ms);
        }
    }
}

/// Merge every connection's events into the pool's fan-out streams.
async fn merge_loop(inner: Weak<PoolInner>, mut rx: mpsc::Receiver<ConnectionEvent>) {
    let mut states: HashMap<RelayUrl, ConnectionState> = HashMap::new();

    while let Some(event) = rx.recv().await {
        let Some(pool) = inner.upgrade() else {
            return;
        };

        match event {
            ConnectionEvent::Frame { url, frame, raw_len } => {
                handle_frame(&pool, url, frame, raw_len);
            }

            ConnectionEvent::State { url, state } => {
                if state == ConnectionState::Connected {
                    pool.health.on_relay_connected(&url);
                }
                if state == ConnectionState::Disconnected {
                    let _ = pool
                        .signals_tx
                        .send(PoolSignal::Disconnected { relay: url.clone() });
                }
                states.insert(url, state);
                let live = states
                    .values()
                    .filter(|s| **s == ConnectionState::Connected)
                    .count();
                let _ = pool.connected.send_replace(live);
            }

            ConnectionEvent::Failure(failure) => {
                metrics::counter!("relay_disconnects_total", "reason" => "failure").increment(1);
                pool.console.push(
                    failure.url.clone(),
                    ConsoleKind::Transport,
                    match failure.http_status {
                        Some(status) => format!("{} (http {})", failure.message, status),
                        None => failure.message.clone(),
                    },
                );
                if pool.active.load(Ordering::SeqCst) {
                    pool.health.close_session(&failure.url);
                }
                // A failed ephemeral is evicted and its relay cooled down.
                let evicted = pool.ephemeral.write().remove(&failure.url);
                if let Some(entry) = evicted {
                    entry.connection.disconnect();
                    pool.cooldowns.lock().insert(
                        failure.url.clone(),
                        now_ms() + RELAY_COOLDOWN.as_millis() as u64,
                    );
                }
            }

            ConnectionEvent::AbnormalClose { url, code, reason } => {
                pool.console.push(
                    url.clone(),
                    ConsoleKind::Transport,
                    format!("closed with status {code}: {reason}"),
                );
                if pool.active.load(Ordering::SeqCst) {
                    pool.health.close_session(&url);
                }
            }
        }
    }
}

fn handle_frame(pool: &Arc<PoolInner>, url: RelayUrl, frame: RelayFrame, raw_len: usize) {
    match frame {
        RelayFrame::Event {
            subscription_id,
            event,
        } => {
            pool.health.on_event_received(&url, raw_len);

            if !bypasses_dedup(&subscription_id) && !pool.seen.check_and_mark(event.id) {
                metrics::counter!("events_deduplicated_total").increment(1);
                return;
            }

            let _ = pool.events_tx.send(event.clone());
            let _ = pool.tagged_tx.send(EventEnvelope {
                event,
                relay: url,
                subscription_id,
            });
        }

        RelayFrame::Eose { subscription_id } => {
            let _ = pool.signals_tx.send(PoolSignal::Eose {
                relay: url,
                subscription_id,
            });
        }

        RelayFrame::Ok {
            event_id,
            accepted,
            message,
        } => {
            if !accepted {
                pool.console
                    .push(url.clone(), ConsoleKind::Rejection, message.clone());
                if is_rate_limit(&message) {
                    pool.health.on_rate_limit_hit(&url);
                }
            }
            let _ = pool.signals_tx.send(PoolSignal::Ok {
                relay: url,
                event_id,
                accepted,
                message,
            });
        }

        RelayFrame::Notice { message } => {
            pool.console
                .push(url.clone(), ConsoleKind::Notice, message.clone());
            if is_rate_limit(&message) {
                pool.health.on_rate_limit_hit(&url);
            }
            let _ = pool.signals_tx.send(PoolSignal::Notice {
                relay: url,
                message,
            });
        }

        RelayFrame::Closed {
            subscription_id,
            message,
        } => {
            pool.console.push(
                url,
                ConsoleKind::Notice,
                format!("subscription {subscription_id} closed: {message}"),
            );
        }
    }
}

/// Machine-readable rate-limit prefix plus the free-form NOTICE variant.
fn is_rate_limit(message: &str) -> bool {
    message.starts_with("rate-limited") || message.to_lowercase().contains("rate limit")
}
