//! A single relay's transport session.
//!
//! Each `RelayConnection` owns exactly one relay's WebSocket session and
//! feeds parsed frames, state changes, and failures into the owning pool
//! through a shared channel. Reconnect sleeps run on their own detached
//! task so backoff never blocks frame delivery on other connections.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use nostr::{Event, EventId, JsonUtil, RelayMessage, RelayUrl, SubscriptionId};
use parking_lot::Mutex;
use rand::Rng;
use roost_core::RelayAddress;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Bytes, Error as WsError, Message};

use crate::constants::{
    CONNECT_TIMEOUT, EVENT_CHANNEL_CAPACITY, PING_INTERVAL, RECONNECT_FLOOR, RECONNECT_JITTER_MS,
};
use crate::proxy::ProxyService;
use crate::transport::{self, WsSink, WsStream};
use crate::util::now_ms;

/// Transport state of one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A transport failure record.
#[derive(Debug, Clone)]
pub struct ConnectionFailure {
    pub url: RelayUrl,
    pub http_status: Option<u16>,
    pub message: String,
}

/// An inbound relay frame, converted to an owned shape for the pool.
#[derive(Debug, Clone)]
pub enum RelayFrame {
    Event {
        subscription_id: SubscriptionId,
        event: Box<Event>,
    },
    Eose {
        subscription_id: SubscriptionId,
    },
    Ok {
        event_id: EventId,
        accepted: bool,
        message: String,
    },
    Notice {
        message: String,
    },
    Closed {
        subscription_id: SubscriptionId,
        message: String,
    },
}

/// What a connection reports to its owning pool.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Frame {
        url: RelayUrl,
        frame: RelayFrame,
        /// Size of the raw text frame, for byte accounting.
        raw_len: usize,
    },
    State { url: RelayUrl, state: ConnectionState },
    Failure(ConnectionFailure),
    /// Remote close with a non-normal status code. The pool logs it; any
    /// reconnect decision belongs to the pool/lifecycle layer.
    AbnormalClose { url: RelayUrl, code: u16, reason: String },
}

struct Inner {
    address: RelayAddress,
    auto_reconnect: AtomicBool,
    /// Set by `disconnect`; cleared by the next `connect`.
    reconnect_suppressed: AtomicBool,
    /// Set by `reconnect` while a session is still draining.
    restart_pending: AtomicBool,
    /// Epoch ms before which automatic reconnects must not fire.
    cooldown_until_ms: AtomicU64,
    state: Mutex<ConnectionState>,
    running: AtomicBool,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: AsyncMutex<mpsc::Receiver<String>>,
    terminate: Notify,
    events: mpsc::Sender<ConnectionEvent>,
    proxy: Arc<ProxyService>,
}

/// One relay's transport session.
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<Inner>,
}

impl RelayConnection {
    pub(crate) fn new(
        address: RelayAddress,
        auto_reconnect: bool,
        events: mpsc::Sender<ConnectionEvent>,
        proxy: Arc<ProxyService>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                address,
                auto_reconnect: AtomicBool::new(auto_reconnect),
                reconnect_suppressed: AtomicBool::new(false),
                restart_pending: AtomicBool::new(false),
                cooldown_until_ms: AtomicU64::new(0),
                state: Mutex::new(ConnectionState::Disconnected),
                running: AtomicBool::new(false),
                outbound_tx,
                outbound_rx: AsyncMutex::new(outbound_rx),
                terminate: Notify::new(),
                events,
                proxy,
            }),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.inner.address.url
    }

    pub fn address(&self) -> &RelayAddress {
        &self.inner.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn auto_reconnect(&self) -> bool {
        self.inner.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Suppress automatic reconnects before this epoch-ms instant.
    pub fn set_cooldown_until(&self, epoch_ms: u64) {
        self.inner.cooldown_until_ms.store(epoch_ms, Ordering::SeqCst);
    }

    /// Open the session. No-op while a session is already running.
    pub fn connect(&self) {
        self.inner.reconnect_suppressed.store(false, Ordering::SeqCst);
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_session(inner));
    }

    /// Queue a frame for this relay. Returns false when no session is
    /// running to deliver it.
    pub fn send(&self, frame: String) -> bool {
        if !self.inner.running.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.outbound_tx.try_send(frame).is_ok()
    }

    /// Close gracefully and suppress auto-reconnect until the next
    /// `connect`.
    pub fn disconnect(&self) {
        self.inner.reconnect_suppressed.store(true, Ordering::SeqCst);
        self.inner.terminate.notify_one();
    }

    /// Tear down any running session and dial again.
    pub fn reconnect(&self) {
        if self.inner.running.load(Ordering::SeqCst) {
            self.inner.restart_pending.store(true, Ordering::SeqCst);
            self.inner.terminate.notify_one();
        } else {
            self.connect();
        }
    }
}

/// How one session ended.
enum SessionEnd {
    /// Torn down locally (`disconnect`/`reconnect`/drop).
    Terminated,
    /// Remote sent a close frame.
    RemoteClose { code: u16, reason: String },
    /// Transport error mid-session.
    Failed(String),
}

async fn run_session(inner: Arc<Inner>) {
    let url = inner.address.url.clone();
    set_state(&inner, ConnectionState::Connecting).await;

    let dialed = tokio::time::timeout(CONNECT_TIMEOUT, transport::dial(&url, &inner.proxy)).await;
    match dialed {
        Ok(Ok((mut sink, mut stream))) => {
            metrics::counter!("relay_connects_total").increment(1);
            set_state(&inner, ConnectionState::Connected).await;

            match drive(&inner, &mut sink, &mut stream).await {
                SessionEnd::Terminated => {
                    let _ = sink.send(Message::Close(None)).await;
                }
                SessionEnd::RemoteClose { code, reason } => {
                    if code != u16::from(CloseCode::Normal) {
                        let _ = inner
                            .events
                            .send(ConnectionEvent::AbnormalClose {
                                url: url.clone(),
                                code,
                                reason,
                            })
                            .await;
                    }
                }
                SessionEnd::Failed(message) => {
                    report_failure(&inner, &url, None, message).await;
                    schedule_reconnect(&inner);
                }
            }
        }
        Ok(Err(e)) => {
            let http_status = dial_http_status(&e);
            report_failure(&inner, &url, http_status, e.to_string()).await;
            schedule_reconnect(&inner);
        }
        Err(_) => {
            report_failure(&inner, &url, None, "connect timed out".to_string()).await;
            schedule_reconnect(&inner);
        }
    }

    set_state(&inner, ConnectionState::Disconnected).await;
    inner.running.store(false, Ordering::SeqCst);

    if inner.restart_pending.swap(false, Ordering::SeqCst) {
        RelayConnection { inner }.connect();
    }
}

async fn drive(inner: &Arc<Inner>, sink: &mut WsSink, stream: &mut WsStream) -> SessionEnd {
    let url = inner.address.url.clone();
    let mut outbound = inner.outbound_rx.lock().await;
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = inner.terminate.notified() => {
                // A permit stored by a disconnect() that predates this
                // session must not kill it.
                if inner.reconnect_suppressed.load(Ordering::SeqCst)
                    || inner.restart_pending.load(Ordering::SeqCst)
                {
                    return SessionEnd::Terminated;
                }
            }

            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    return SessionEnd::Failed(e.to_string());
                }
            }

            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        return SessionEnd::Failed(e.to_string());
                    }
                    metrics::counter!("relay_frames_sent_total").increment(1);
                }
                None => return SessionEnd::Terminated,
            },

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    // Malformed frames are dropped without surfacing an error.
                    let raw_len = text.len();
                    match RelayMessage::from_json(text.as_str()) {
                        Ok(message) => {
                            if let Some(frame) = to_frame(message) {
                                let _ = inner
                                    .events
                                    .send(ConnectionEvent::Frame {
                                        url: url.clone(),
                                        frame,
                                        raw_len,
                                    })
                                    .await;
                            }
                        }
                        Err(e) => {
                            tracing::trace!("{} dropped malformed frame: {}", url, e);
                        }
                    }
                }
                Some(Ok(Message::Close(close))) => {
                    let (code, reason) = match close {
                        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                        None => (u16::from(CloseCode::Normal), String::new()),
                    };
                    return SessionEnd::RemoteClose { code, reason };
                }
                // Pongs and server pings need no handling; the protocol
                // layer answers pings on the next write.
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                None => return SessionEnd::Failed("stream ended".to_string()),
            }
        }
    }
}

/// Convert a parsed codec message into the pool-facing owned frame.
/// Frames this core does not route (AUTH, COUNT, sync extensions) map to
/// `None`.
pub(crate) fn to_frame(message: RelayMessage<'_>) -> Option<RelayFrame> {
    match message {
        RelayMessage::Event {
            subscription_id,
            event,
        } => Some(RelayFrame::Event {
            subscription_id: subscription_id.into_owned(),
            event: Box::new(event.into_owned()),
        }),
        RelayMessage::EndOfStoredEvents(subscription_id) => Some(RelayFrame::Eose {
            subscription_id: subscription_id.into_owned(),
        }),
        RelayMessage::Ok {
            event_id,
            status,
            message,
        } => Some(RelayFrame::Ok {
            event_id,
            accepted: status,
            message: message.into_owned(),
        }),
        RelayMessage::Notice(message) => Some(RelayFrame::Notice {
            message: message.into_owned(),
        }),
        RelayMessage::Closed {
            subscription_id,
            message,
        } => Some(RelayFrame::Closed {
            subscription_id: subscription_id.into_owned(),
            message: message.into_owned(),
        }),
        _ => None,
    }
}

async fn set_state(inner: &Arc<Inner>, state: ConnectionState) {
    *inner.state.lock() = state;
    let _ = inner
        .events
        .send(ConnectionEvent::State {
            url: inner.address.url.clone(),
            state,
        })
        .await;
}

async fn report_failure(inner: &Arc<Inner>, url: &RelayUrl, http_status: Option<u16>, message: String) {
    tracing::debug!("{} transport failure: {}", url, message);
    metrics::counter!("relay_connect_failures_total").increment(1);
    let _ = inner
        .events
        .send(ConnectionEvent::Failure(ConnectionFailure {
            url: url.clone(),
            http_status,
            message,
        }))
        .await;
}

/// Schedule a reconnect on a detached task after the backoff floor (or the
/// active cooldown, whichever is later) plus jitter.
fn schedule_reconnect(inner: &Arc<Inner>) {
    if !inner.auto_reconnect.load(Ordering::SeqCst)
        || inner.reconnect_suppressed.load(Ordering::SeqCst)
    {
        return;
    }

    let cooldown_ms = inner
        .cooldown_until_ms
        .load(Ordering::SeqCst)
        .saturating_sub(now_ms());
    let jitter_ms = rand::thread_rng().gen_range(0..=RECONNECT_JITTER_MS);
    let delay = RECONNECT_FLOOR.max(std::time::Duration::from_millis(cooldown_ms))
        + std::time::Duration::from_millis(jitter_ms);

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if !inner.reconnect_suppressed.load(Ordering::SeqCst) {
            RelayConnection { inner }.connect();
        }
    });
}

fn dial_http_status(error: &crate::Error) -> Option<u16> {
    match error {
        crate::Error::Transport(WsError::Http(response)) => Some(response.status().as_u16()),
        _ => None,
    }
}
