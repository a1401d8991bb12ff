//! Session-based relay reputation.
//!
//! While the app is in the foreground, each connected relay has an active
//! session accumulating events, failures, and rate-limit hits. Sessions
//! close three ways: the whole set closes normally when the app
//! backgrounds, a single session closes as a failure when its relay
//! disconnects, or the set is discarded unrecorded after a trivially short
//! foreground period. Closed sessions feed a bounded rolling history per
//! relay, and the history is what classifies a relay as bad.
//!
//! The bad set is sticky: a relay stays listed until explicitly cleared.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nostr::RelayUrl;
use parking_lot::Mutex;
use roost_core::codec::{self, LifetimeStats, SessionRecord};
use roost_core::{scoped_key, KeyValueStore};

use crate::constants::{HEALTH_HISTORY_LIMIT, HEALTH_MIN_SESSIONS};
use crate::util::now_ms;

const KEY_BAD_RELAYS: &str = "bad_relays";
const KEY_SESSION_HISTORY: &str = "session_history";
const KEY_LIFETIME_STATS: &str = "lifetime_stats";

/// Sessions with zero events and at least this duration count toward the
/// dead-relay rule.
const DEAD_SESSION_MIN_MS: u64 = 30_000;
/// Dead sessions (zero events, long enough) before a relay is bad.
const DEAD_SESSIONS_BAD: usize = 5;
/// Failure-closed sessions before a relay is bad.
const FAILURE_SESSIONS_BAD: usize = 4;
/// Rate-limited sessions before a relay is bad.
const RATE_LIMIT_SESSIONS_BAD: usize = 3;

/// Callback fired when a relay enters (`true`) or leaves (`false`) the bad
/// set.
pub type BadRelayCallback = Box<dyn Fn(&RelayUrl, bool) + Send + Sync>;

#[derive(Debug)]
struct ActiveSession {
    events_received: u64,
    mid_session_failures: u32,
    rate_limit_hits: u32,
    started_at: Instant,
}

impl ActiveSession {
    fn start() -> Self {
        Self {
            events_received: 0,
            mid_session_failures: 0,
            rate_limit_hits: 0,
            started_at: Instant::now(),
        }
    }

    fn record(&self, failed: bool) -> SessionRecord {
        SessionRecord {
            events_received: self.events_received,
            had_failure: failed || self.mid_session_failures > 0,
            had_rate_limit: self.rate_limit_hits > 0,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Default)]
struct HealthState {
    active_sessions: HashMap<RelayUrl, ActiveSession>,
    history: HashMap<RelayUrl, Vec<SessionRecord>>,
    lifetime: HashMap<RelayUrl, LifetimeStats>,
    bad: HashSet<RelayUrl>,
}

/// Session-based relay reputation tracker.
pub struct RelayHealthTracker {
    state: Mutex<HealthState>,
    store: Arc<dyn KeyValueStore>,
    identity: String,
    app_active: AtomicBool,
    on_bad_change: Mutex<Option<BadRelayCallback>>,
}

impl RelayHealthTracker {
    /// Load (or start empty) for the given identity.
    pub fn new(store: Arc<dyn KeyValueStore>, identity: &str) -> Self {
        let tracker = Self {
            state: Mutex::new(HealthState::default()),
            store,
            identity: identity.to_string(),
            app_active: AtomicBool::new(true),
            on_bad_change: Mutex::new(None),
        };
        tracker.load();
        tracker
    }

    /// Register the bad-set transition callback.
    pub fn set_on_bad_change(&self, callback: BadRelayCallback) {
        *self.on_bad_change.lock() = Some(callback);
    }

    /// Externally supplied foreground flag. Session tracking is inert
    /// while the app is backgrounded.
    pub fn set_app_active(&self, active: bool) {
        self.app_active.store(active, Ordering::SeqCst);
    }

    pub fn is_app_active(&self) -> bool {
        self.app_active.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session updates (gated on the app-active flag)
    // ─────────────────────────────────────────────────────────────────────

    pub fn on_relay_connected(&self, url: &RelayUrl) {
        if !self.is_app_active() {
            return;
        }
        let mut state = self.state.lock();
        state
            .active_sessions
            .entry(url.clone())
            .or_insert_with(ActiveSession::start);

        let now = now_ms();
        let stats = state.lifetime.entry(url.clone()).or_default();
        stats.connections += 1;
        stats.last_connected_ms = now;
        if stats.first_seen_ms == 0 {
            stats.first_seen_ms = now;
        }
    }

    pub fn on_event_received(&self, url: &RelayUrl, bytes: usize) {
        if !self.is_app_active() {
            return;
        }
        let mut state = self.state.lock();
        state
            .active_sessions
            .entry(url.clone())
            .or_insert_with(ActiveSession::start)
            .events_received += 1;

        let stats = state.lifetime.entry(url.clone()).or_default();
        stats.events_received += 1;
        stats.bytes_received += bytes as u64;
    }

    pub fn on_event_sent(&self, url: &RelayUrl, bytes: usize) {
        if !self.is_app_active() {
            return;
        }
        let mut state = self.state.lock();
        let stats = state.lifetime.entry(url.clone()).or_default();
        stats.events_sent += 1;
        stats.bytes_sent += bytes as u64;
    }

    pub fn on_rate_limit_hit(&self, url: &RelayUrl) {
        if !self.is_app_active() {
            return;
        }
        let mut state = self.state.lock();
        state
            .active_sessions
            .entry(url.clone())
            .or_insert_with(ActiveSession::start)
            .rate_limit_hits += 1;
        state.lifetime.entry(url.clone()).or_default().rate_limits += 1;
    }

    /// A degradation that does not end the transport (e.g. the relay
    /// killed a subscription mid-session).
    pub fn on_mid_session_failure(&self, url: &RelayUrl) {
        if !self.is_app_active() {
            return;
        }
        let mut state = self.state.lock();
        state
            .active_sessions
            .entry(url.clone())
            .or_insert_with(ActiveSession::start)
            .mid_session_failures += 1;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session closing
    // ─────────────────────────────────────────────────────────────────────

    /// Foreground → background: every active session is recorded as a
    /// normal close, with no failure penalty.
    pub fn close_all_sessions(&self) {
        let mut state = self.state.lock();
        let sessions: Vec<(RelayUrl, ActiveSession)> = state.active_sessions.drain().collect();
        for (url, session) in sessions {
            let record = session.record(false);
            let stats = state.lifetime.entry(url.clone()).or_default();
            stats.connected_ms += record.duration_ms;
            push_record(&mut state, &url, record);
        }
        let newly_bad = evaluate_all(&mut state);
        self.persist(&state);
        drop(state);
        self.notify(newly_bad, true);
    }

    /// A relay disconnected while the app was active: the session is a
    /// failure and the lifetime failure counter grows.
    pub fn close_session(&self, url: &RelayUrl) {
        if !self.is_app_active() {
            return;
        }
        let mut state = self.state.lock();
        let Some(session) = state.active_sessions.remove(url) else {
            return;
        };
        let record = session.record(true);
        let stats = state.lifetime.entry(url.clone()).or_default();
        stats.connected_ms += record.duration_ms;
        stats.failures += 1;
        push_record(&mut state, url, record);

        let became_bad = evaluate(&mut state, url);
        self.persist(&state);
        drop(state);
        if became_bad {
            self.notify(vec![url.clone()], true);
        }
    }

    /// A foreground period too short to say anything: sessions are thrown
    /// away unrecorded.
    pub fn discard_all_sessions(&self) {
        self.state.lock().active_sessions.clear();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Evaluation
    // ─────────────────────────────────────────────────────────────────────

    /// Re-evaluate one relay from its history. Returns whether it is bad.
    pub fn evaluate_relay(&self, url: &RelayUrl) -> bool {
        let mut state = self.state.lock();
        let became_bad = evaluate(&mut state, url);
        if became_bad {
            self.persist(&state);
        }
        let is_bad = state.bad.contains(url);
        drop(state);
        if became_bad {
            self.notify(vec![url.clone()], true);
        }
        is_bad
    }

    /// Re-evaluate every relay with history.
    pub fn evaluate_all_relays(&self) {
        let mut state = self.state.lock();
        let newly_bad = evaluate_all(&mut state);
        if !newly_bad.is_empty() {
            self.persist(&state);
        }
        drop(state);
        self.notify(newly_bad, true);
    }

    pub fn is_bad(&self, url: &RelayUrl) -> bool {
        self.state.lock().bad.contains(url)
    }

    pub fn bad_relays(&self) -> HashSet<RelayUrl> {
        self.state.lock().bad.clone()
    }

    /// Unlist a relay and give it a clean slate.
    pub fn clear_bad_relay(&self, url: &RelayUrl) {
        let mut state = self.state.lock();
        let was_bad = state.bad.remove(url);
        state.history.remove(url);
        self.persist(&state);
        drop(state);
        if was_bad {
            self.notify(vec![url.clone()], false);
        }
    }

    /// Lifetime counters for one relay.
    pub fn lifetime_stats(&self, url: &RelayUrl) -> Option<LifetimeStats> {
        self.state.lock().lifetime.get(url).cloned()
    }

    /// Recorded sessions currently in one relay's rolling history.
    pub fn session_count(&self, url: &RelayUrl) -> usize {
        self.state.lock().history.get(url).map_or(0, Vec::len)
    }

    fn notify(&self, urls: Vec<RelayUrl>, became_bad: bool) {
        if urls.is_empty() {
            return;
        }
        let callback = self.on_bad_change.lock();
        if let Some(callback) = callback.as_ref() {
            for url in &urls {
                callback(url, became_bad);
            }
        }
    }

    fn persist(&self, state: &HealthState) {
        let bad: Vec<String> = state.bad.iter().map(|u| u.to_string()).collect();
        self.store.put(
            &self.key(KEY_BAD_RELAYS),
            &codec::encode_url_set(bad.iter().map(String::as_str)),
        );

        let history: HashMap<String, Vec<SessionRecord>> = state
            .history
            .iter()
            .map(|(url, records)| (url.to_string(), records.clone()))
            .collect();
        self.store.put(
            &self.key(KEY_SESSION_HISTORY),
            &codec::encode_session_history(&history),
        );

        let lifetime: HashMap<String, LifetimeStats> = state
            .lifetime
            .iter()
            .map(|(url, stats)| (url.to_string(), stats.clone()))
            .collect();
        self.store.put(
            &self.key(KEY_LIFETIME_STATS),
            &codec::encode_lifetime_stats(&lifetime),
        );
    }

    fn load(&self) {
        let mut state = self.state.lock();

        if let Some(text) = self.store.get(&self.key(KEY_BAD_RELAYS)) {
            state.bad = codec::decode_url_set(&text)
                .iter()
                .filter_map(|u| RelayUrl::parse(u).ok())
                .collect();
        }
        if let Some(text) = self.store.get(&self.key(KEY_SESSION_HISTORY)) {
            for (url, records) in codec::decode_session_history(&text) {
                if let Ok(url) = RelayUrl::parse(&url) {
                    state.history.insert(url, records);
                }
            }
        }
        if let Some(text) = self.store.get(&self.key(KEY_LIFETIME_STATS)) {
            for (url, stats) in codec::decode_lifetime_stats(&text) {
                if let Ok(url) = RelayUrl::parse(&url) {
                    state.lifetime.insert(url, stats);
                }
            }
        }
    }

    fn key(&self, record: &str) -> String {
        scoped_key(&self.identity, record)
    }
}

fn push_record(state: &mut HealthState, url: &RelayUrl, record: SessionRecord) {
    let history = state.history.entry(url.clone()).or_default();
    history.push(record);
    if history.len() > HEALTH_HISTORY_LIMIT {
        let excess = history.len() - HEALTH_HISTORY_LIMIT;
        history.drain(..excess);
    }
}

/// Apply the classification rules to one relay. Returns true when the
/// relay newly entered the bad set (stickiness means it never leaves
/// here).
fn evaluate(state: &mut HealthState, url: &RelayUrl) -> bool {
    if state.bad.contains(url) {
        return false;
    }
    let Some(history) = state.history.get(url) else {
        return false;
    };
    if history.len() < HEALTH_MIN_SESSIONS {
        return false;
    }

    let dead = history
        .iter()
        .filter(|r| r.events_received == 0 && r.duration_ms >= DEAD_SESSION_MIN_MS)
        .count();
    let failures = history.iter().filter(|r| r.had_failure).count();
    let rate_limited = history.iter().filter(|r| r.had_rate_limit).count();

    let is_bad = dead >= DEAD_SESSIONS_BAD
        || failures >= FAILURE_SESSIONS_BAD
        || rate_limited >= RATE_LIMIT_SESSIONS_BAD;

    if is_bad {
        tracing::warn!(
            "marking relay {} bad ({} dead, {} failed, {} rate-limited of {} sessions)",
            url,
            dead,
            failures,
            rate_limited,
            history.len()
        );
        metrics::counter!("relay_marked_bad_total").increment(1);
        state.bad.insert(url.clone());
    }
    is_bad
}

fn evaluate_all(state: &mut HealthState) -> Vec<RelayUrl> {
    let urls: Vec<RelayUrl> = state.history.keys().cloned().collect();
    urls.into_iter()
        .filter(|url| evaluate(state, url))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use roost_core::MemoryStore;

    use super::*;

    fn url(n: usize) -> RelayUrl {
        RelayUrl::parse(&format!("wss://relay{n}.example.com")).expect("valid url")
    }

    fn tracker() -> RelayHealthTracker {
        RelayHealthTracker::new(Arc::new(MemoryStore::new()), "test-identity")
    }

    fn push_records(tracker: &RelayHealthTracker, url: &RelayUrl, records: &[SessionRecord]) {
        let mut state = tracker.state.lock();
        for record in records {
            push_record(&mut state, url, record.clone());
        }
    }

    fn failure_record() -> SessionRecord {
        SessionRecord {
            events_received: 10,
            had_failure: true,
            had_rate_limit: false,
            duration_ms: 5_000,
        }
    }

    fn dead_record() -> SessionRecord {
        SessionRecord {
            events_received: 0,
            had_failure: false,
            had_rate_limit: false,
            duration_ms: DEAD_SESSION_MIN_MS,
        }
    }

    fn clean_record() -> SessionRecord {
        SessionRecord {
            events_received: 50,
            had_failure: false,
            had_rate_limit: false,
            duration_ms: 60_000,
        }
    }

    #[test]
    fn test_failure_threshold_boundary() {
        // Three failure sessions: not bad.
        let t = tracker();
        push_records(&t, &url(1), &[failure_record(), failure_record(), failure_record()]);
        assert!(!t.evaluate_relay(&url(1)));

        // Four: bad.
        let t = tracker();
        push_records(
            &t,
            &url(1),
            &[
                failure_record(),
                failure_record(),
                failure_record(),
                failure_record(),
            ],
        );
        assert!(t.evaluate_relay(&url(1)));
    }

    #[test]
    fn test_dead_session_threshold_boundary() {
        // Four long zero-event sessions: not bad.
        let t = tracker();
        push_records(&t, &url(1), &vec![dead_record(); 4]);
        assert!(!t.evaluate_relay(&url(1)));

        // Five: bad.
        let t = tracker();
        push_records(&t, &url(1), &vec![dead_record(); 5]);
        assert!(t.evaluate_relay(&url(1)));

        // Five zero-event sessions below the duration floor: not bad.
        let t = tracker();
        let short = SessionRecord {
            duration_ms: DEAD_SESSION_MIN_MS - 1,
            ..dead_record()
        };
        push_records(&t, &url(1), &vec![short; 5]);
        assert!(!t.evaluate_relay(&url(1)));
    }

    #[test]
    fn test_rate_limit_threshold_via_sessions() {
        let t = tracker();
        let relay = url(1);

        for n in 0..RATE_LIMIT_SESSIONS_BAD {
            t.on_relay_connected(&relay);
            t.on_rate_limit_hit(&relay);
            t.close_all_sessions();
            if n < RATE_LIMIT_SESSIONS_BAD - 1 {
                assert!(!t.is_bad(&relay), "not yet bad after {} sessions", n + 1);
            }
        }
        assert!(t.is_bad(&relay));
    }

    #[test]
    fn test_too_little_history_is_never_bad() {
        let t = tracker();
        push_records(&t, &url(1), &[failure_record(), failure_record()]);
        // Two failed sessions would satisfy no rule anyway, but even a
        // saturated rule cannot fire below the session floor.
        let t2 = tracker();
        push_records(
            &t2,
            &url(1),
            &[SessionRecord {
                had_rate_limit: true,
                ..failure_record()
            }, SessionRecord {
                had_rate_limit: true,
                ..failure_record()
            }],
        );
        assert!(!t.evaluate_relay(&url(1)));
        assert!(!t2.evaluate_relay(&url(1)));
    }

    #[test]
    fn test_history_is_bounded() {
        let t = tracker();
        push_records(&t, &url(1), &vec![clean_record(); HEALTH_HISTORY_LIMIT + 5]);
        assert_eq!(
            t.state.lock().history[&url(1)].len(),
            HEALTH_HISTORY_LIMIT
        );
    }

    #[test]
    fn test_close_session_records_failure_and_lifetime() {
        let t = tracker();
        let relay = url(1);

        t.on_relay_connected(&relay);
        t.on_event_received(&relay, 500);
        t.close_session(&relay);

        let stats = t.lifetime_stats(&relay).expect("stats");
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.bytes_received, 500);
        assert_eq!(stats.connections, 1);

        let state = t.state.lock();
        let record = &state.history[&relay][0];
        assert!(record.had_failure);
        assert_eq!(record.events_received, 1);
    }

    #[test]
    fn test_close_all_has_no_failure_penalty() {
        let t = tracker();
        let relay = url(1);

        t.on_relay_connected(&relay);
        t.close_all_sessions();

        let stats = t.lifetime_stats(&relay).expect("stats");
        assert_eq!(stats.failures, 0);
        assert!(!t.state.lock().history[&relay][0].had_failure);
    }

    #[test]
    fn test_discard_leaves_no_trace() {
        let t = tracker();
        let relay = url(1);

        t.on_relay_connected(&relay);
        t.on_event_received(&relay, 100);
        t.discard_all_sessions();

        assert!(t.state.lock().history.is_empty());
        // Lifetime counters still tick; only session records are dropped.
        assert_eq!(t.lifetime_stats(&relay).expect("stats").events_received, 1);
    }

    #[test]
    fn test_inactive_app_suspends_tracking() {
        let t = tracker();
        let relay = url(1);
        t.set_app_active(false);

        t.on_relay_connected(&relay);
        t.on_event_received(&relay, 100);
        t.close_session(&relay);

        assert!(t.lifetime_stats(&relay).is_none());
        assert!(t.state.lock().history.is_empty());
    }

    #[test]
    fn test_sticky_until_cleared() {
        let t = tracker();
        let relay = url(1);
        push_records(&t, &relay, &vec![failure_record(); 4]);
        assert!(t.evaluate_relay(&relay));

        // A run of clean sessions does not unlist it.
        push_records(&t, &relay, &vec![clean_record(); 6]);
        assert!(t.evaluate_relay(&relay));

        t.clear_bad_relay(&relay);
        assert!(!t.is_bad(&relay));
        assert!(t.state.lock().history.get(&relay).is_none());
    }

    #[test]
    fn test_bad_transition_fires_callback() {
        let t = tracker();
        let relay = url(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        t.set_on_bad_change(Box::new(move |_, became_bad| {
            if became_bad {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            }
        }));

        push_records(&t, &relay, &vec![failure_record(); 4]);
        t.evaluate_relay(&relay);
        t.evaluate_relay(&relay); // already bad: no second notification
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_state_survives_reload() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let relay = url(1);

        {
            let t = RelayHealthTracker::new(Arc::clone(&store) as Arc<dyn KeyValueStore>, "id");
            t.on_relay_connected(&relay);
            t.on_event_received(&relay, 256);
            t.close_session(&relay);
            push_records(&t, &relay, &vec![failure_record(); 3]);
            t.evaluate_relay(&relay);
            assert!(t.is_bad(&relay));
        }

        let reloaded = RelayHealthTracker::new(store, "id");
        assert!(reloaded.is_bad(&relay));
        assert_eq!(reloaded.lifetime_stats(&relay).expect("stats").failures, 1);
        assert_eq!(reloaded.state.lock().history[&relay].len(), 4);
    }
}
