//! Connectivity and foreground lifecycle reactions.
//!
//! Watches the platform's connectivity status and the app's
//! foreground/background transitions, funnels every resulting reconnect
//! wish through one debounced entry point, and drives the pool's bulk
//! reconnect. The in-flight reconnect task is cancellable and is replaced
//! when a forced request supersedes a soft one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
// tokio's Instant so paused-clock tests exercise the debounce window.
use tokio::time::Instant;

use crate::constants::{
    HEALTH_SESSION_FLOOR, RECONNECT_DEBOUNCE, RECONNECT_MIN_LIVE_FORCED, RECONNECT_MIN_LIVE_SOFT,
    RECONNECT_WAIT,
};
use crate::health::RelayHealthTracker;
use crate::pool::RelayPool;
use crate::util::now_ms;

/// Platform connectivity, as observed by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityStatus {
    Active { network_id: String, is_mobile: bool },
    Off,
}

/// Invoked when a reconnect run finishes, with its force flag.
pub type ReconnectHook = Box<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct ReconnectState {
    /// Most recent request: when, and whether it was forced.
    last: Option<(Instant, bool)>,
    in_flight: Option<JoinHandle<()>>,
}

struct LifecycleInner {
    pool: RelayPool,
    health: Arc<RelayHealthTracker>,
    started: AtomicBool,
    network_id: Mutex<Option<String>>,
    reconnect: Mutex<ReconnectState>,
    observer: Mutex<Option<JoinHandle<()>>>,
    on_reconnected: Mutex<Option<ReconnectHook>>,
    /// When the pool last became active (epoch ms), for the short-pause
    /// session-discard decision.
    active_since_ms: AtomicU64,
}

/// Drives pool-wide reconnect policy from lifecycle signals.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<LifecycleInner>,
}

#[derive(Debug, PartialEq, Eq)]
enum Debounce {
    Proceed,
    Drop,
    Supersede,
}

/// Requests within the debounce window are dropped, unless the new one is
/// forced and the previous one was not — then the in-flight attempt is
/// cancelled and replaced.
fn debounce(last: Option<(Instant, bool)>, now: Instant, forced: bool) -> Debounce {
    match last {
        Some((at, was_forced)) if now.duration_since(at) < RECONNECT_DEBOUNCE => {
            if forced && !was_forced {
                Debounce::Supersede
            } else {
                Debounce::Drop
            }
        }
        _ => Debounce::Proceed,
    }
}

impl LifecycleManager {
    pub fn new(pool: RelayPool, health: Arc<RelayHealthTracker>) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                pool,
                health,
                started: AtomicBool::new(false),
                network_id: Mutex::new(None),
                reconnect: Mutex::new(ReconnectState::default()),
                observer: Mutex::new(None),
                on_reconnected: Mutex::new(None),
                active_since_ms: AtomicU64::new(now_ms()),
            }),
        }
    }

    /// Register the completion hook invoked after each reconnect run.
    pub fn set_on_reconnected(&self, hook: ReconnectHook) {
        *self.inner.on_reconnected.lock() = Some(hook);
    }

    /// Begin observing the connectivity stream. No-op when already
    /// started.
    pub fn start(&self, mut connectivity: watch::Receiver<ConnectivityStatus>) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let status = connectivity.borrow_and_update().clone();
                handle_connectivity(&inner, status);
                if connectivity.changed().await.is_err() {
                    break;
                }
            }
        });
        *self.inner.observer.lock() = Some(handle);
    }

    /// Stop observing connectivity and cancel any in-flight reconnect.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.observer.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.reconnect.lock().in_flight.take() {
            handle.abort();
        }
        self.inner.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Foreground → background: mark the pool inactive and flush health
    /// sessions. A foreground period shorter than the evaluation floor
    /// says nothing about relay quality, so its sessions are discarded
    /// instead of recorded.
    pub fn on_app_pause(&self) {
        self.inner.pool.set_active(false);

        let active_for = now_ms().saturating_sub(self.inner.active_since_ms.load(Ordering::SeqCst));
        if active_for < HEALTH_SESSION_FLOOR.as_millis() as u64 {
            self.inner.health.discard_all_sessions();
        } else {
            self.inner.health.close_all_sessions();
        }
        self.inner.health.set_app_active(false);
    }

    /// Background → foreground. Long pauses force a full reconnect;
    /// short ones only top up missing connections.
    pub fn on_app_resume(&self, paused: Duration) {
        self.inner.health.set_app_active(true);
        self.request_reconnect(paused >= HEALTH_SESSION_FLOOR);
    }

    /// The single debounced entry point for every reconnect wish.
    pub fn request_reconnect(&self, forced: bool) {
        let mut state = self.inner.reconnect.lock();
        match debounce(state.last, Instant::now(), forced) {
            Debounce::Drop => {
                tracing::debug!("reconnect request (forced={forced}) debounced");
                return;
            }
            Debounce::Supersede => {
                tracing::debug!("forced reconnect supersedes in-flight soft attempt");
                if let Some(handle) = state.in_flight.take() {
                    handle.abort();
                }
            }
            Debounce::Proceed => {}
        }

        state.last = Some((Instant::now(), forced));
        let inner = Arc::clone(&self.inner);
        state.in_flight = Some(tokio::spawn(run_reconnect(inner, forced)));
    }
}

fn handle_connectivity(inner: &Arc<LifecycleInner>, status: ConnectivityStatus) {
    match status {
        ConnectivityStatus::Active { network_id, .. } => {
            let previous = inner.network_id.lock().replace(network_id.clone());
            let manager = LifecycleManager {
                inner: Arc::clone(inner),
            };
            match previous {
                None => manager.request_reconnect(false),
                Some(previous) if previous != network_id => {
                    tracing::info!("network changed ({previous} -> {network_id}), forcing reconnect");
                    manager.request_reconnect(true);
                }
                Some(_) => {}
            }
        }
        ConnectivityStatus::Off => {
            *inner.network_id.lock() = None;
        }
    }
}

/// One reconnect run: bulk reconnect, wait (bounded) for a minimum live
/// count, mark the pool active, invoke the hook.
async fn run_reconnect(inner: Arc<LifecycleInner>, forced: bool) {
    inner.pool.reconnect_all(forced);

    let want = if forced {
        RECONNECT_MIN_LIVE_FORCED
    } else {
        RECONNECT_MIN_LIVE_SOFT
    };

    let mut connected = inner.pool.watch_connected();
    let reached = tokio::time::timeout(RECONNECT_WAIT, async {
        loop {
            if *connected.borrow_and_update() >= want {
                return;
            }
            if connected.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok();

    if !reached {
        tracing::debug!(
            "reconnect (forced={forced}) proceeding with {} live connections",
            inner.pool.connected_count()
        );
    }

    inner.pool.set_active(true);
    inner.active_since_ms.store(now_ms(), Ordering::SeqCst);

    let hook = inner.on_reconnected.lock();
    if let Some(hook) = hook.as_ref() {
        hook(forced);
    }
}

#[cfg(test)]
mod tests {
    use nostr::RelayUrl;
    use roost_core::MemoryStore;

    use crate::proxy::ProxyService;

    use super::*;

    fn manager() -> (LifecycleManager, Arc<Mutex<Vec<bool>>>) {
        let health = Arc::new(RelayHealthTracker::new(
            Arc::new(MemoryStore::new()),
            "test-identity",
        ));
        let pool = RelayPool::new(Arc::new(ProxyService::disabled()), Arc::clone(&health));
        let lifecycle = LifecycleManager::new(pool, health);

        let log = Arc::new(Mutex::new(Vec::new()));
        let log_in_hook = Arc::clone(&log);
        lifecycle.set_on_reconnected(Box::new(move |forced| {
            log_in_hook.lock().push(forced);
        }));
        (lifecycle, log)
    }

    #[test]
    fn test_debounce_decisions() {
        let now = Instant::now();
        // Nothing recent: proceed.
        assert_eq!(debounce(None, now, false), Debounce::Proceed);
        // Outside the window: proceed.
        assert_eq!(
            debounce(Some((now - Duration::from_secs(3), false)), now, false),
            Debounce::Proceed
        );
        // Soft after soft within the window: drop.
        assert_eq!(
            debounce(Some((now, false)), now + Duration::from_millis(500), false),
            Debounce::Drop
        );
        // Forced after soft within the window: supersede.
        assert_eq!(
            debounce(Some((now, false)), now + Duration::from_millis(500), true),
            Debounce::Supersede
        );
        // Forced after forced within the window: drop.
        assert_eq!(
            debounce(Some((now, true)), now + Duration::from_millis(500), true),
            Debounce::Drop
        );
        // Soft after forced within the window: drop.
        assert_eq!(
            debounce(Some((now, true)), now + Duration::from_millis(500), false),
            Debounce::Drop
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_soft_request_is_dropped() {
        let (lifecycle, log) = manager();

        lifecycle.request_reconnect(false);
        lifecycle.request_reconnect(false);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(log.lock().clone(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_supersedes_soft() {
        let (lifecycle, log) = manager();

        lifecycle.request_reconnect(false);
        lifecycle.request_reconnect(true);

        tokio::time::sleep(Duration::from_secs(20)).await;
        // The soft attempt was cancelled; only the forced one completed.
        assert_eq!(log.lock().clone(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_transitions() {
        let (lifecycle, log) = manager();
        let (tx, rx) = watch::channel(ConnectivityStatus::Off);
        lifecycle.start(rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(log.lock().is_empty());

        // First Active after being unset: soft reconnect.
        tx.send(ConnectivityStatus::Active {
            network_id: "wifi-1".to_string(),
            is_mobile: false,
        })
        .expect("send");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(log.lock().clone(), vec![false]);

        // Same network again: nothing.
        tx.send(ConnectivityStatus::Active {
            network_id: "wifi-1".to_string(),
            is_mobile: false,
        })
        .expect("send");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(log.lock().clone(), vec![false]);

        // Network change: forced reconnect.
        tx.send(ConnectivityStatus::Active {
            network_id: "cell-1".to_string(),
            is_mobile: true,
        })
        .expect("send");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(log.lock().clone(), vec![false, true]);

        // Off clears the tracked network; the next Active is "first".
        tx.send(ConnectivityStatus::Off).expect("send");
        tokio::time::sleep(Duration::from_secs(20)).await;
        tx.send(ConnectivityStatus::Active {
            network_id: "cell-1".to_string(),
            is_mobile: true,
        })
        .expect("send");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(log.lock().clone(), vec![false, true, false]);

        lifecycle.stop();
        assert!(!lifecycle.is_started());
    }

    #[tokio::test]
    async fn test_short_pause_discards_sessions() {
        let (lifecycle, _log) = manager();
        let relay = RelayUrl::parse("wss://relay.example.com").expect("valid url");

        // Pool just became active (construction time), so this pause is
        // below the floor.
        lifecycle.inner.health.on_relay_connected(&relay);
        lifecycle.on_app_pause();
        assert!(lifecycle.inner.health.lifetime_stats(&relay).is_some());
        assert_eq!(lifecycle.inner.health.session_count(&relay), 0);
        assert!(!lifecycle.inner.pool.is_active());

        // Resume, then simulate a long foreground period before pausing:
        // sessions are recorded normally.
        lifecycle.on_app_resume(Duration::from_secs(60));
        lifecycle
            .inner
            .active_since_ms
            .store(now_ms() - 60_000, Ordering::SeqCst);
        lifecycle.inner.health.on_relay_connected(&relay);
        lifecycle.on_app_pause();

        let stats = lifecycle.inner.health.lifetime_stats(&relay).expect("stats");
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.connections, 2);
        assert_eq!(lifecycle.inner.health.session_count(&relay), 1);
    }
}
