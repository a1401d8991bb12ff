//! Roost relay daemon.
//!
//! A command-line harness around the relay core: optionally runs bootstrap
//! discovery, connects the pool, subscribes to a firehose of recent notes,
//! and streams what arrives to the log. Useful for poking at relay
//! behavior without the surrounding client app.
//!
//! ```bash
//! # Discover relays, then stream
//! roost-net --discover
//!
//! # Stream from explicit relays
//! roost-net --relays wss://relay.damus.io,wss://nos.lol
//!
//! # Route everything through a local SOCKS tunnel
//! roost-net --socks-port 9050
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nostr::{Filter, Keys, Kind, RelayUrl, SubscriptionId};
use roost_core::{MemoryStore, RelayAddress, UrlPolicy};
use roost_net::prober::RelayProber;
use roost_net::{ProxyService, ProxyStatus, RelayHealthTracker, RelayListBook, RelayPool};
use tracing_subscriber::EnvFilter;

/// Roost relay daemon.
#[derive(Parser, Debug)]
#[command(name = "roost-net")]
#[command(about = "Relay connectivity daemon")]
#[command(version)]
struct Args {
    /// Relay URLs (comma-separated); defaults to the built-in set
    #[arg(long, value_delimiter = ',')]
    relays: Option<Vec<String>>,

    /// Run bootstrap discovery instead of using a fixed relay set
    #[arg(long)]
    discover: bool,

    /// Secret key (hex or bech32) for the discovery probe; generated when absent
    #[arg(long)]
    key: Option<String>,

    /// Local SOCKS tunnel port; when set, all traffic routes through it
    #[arg(long)]
    socks_port: Option<u16>,

    /// How many recent notes to request per relay
    #[arg(long, default_value = "50")]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().context("directive")?)
                .add_directive("roost_net=debug".parse().context("directive")?),
        )
        .init();

    let args = Args::parse();

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        tracing::info!("shutdown signal received");
        running_for_handler.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    // Optional anonymizing tunnel.
    let proxy = match args.socks_port {
        Some(port) => {
            let service = ProxyService::new(SocketAddr::from(([127, 0, 0, 1], port)));
            match service.start().await {
                ProxyStatus::Connected { port } => {
                    tracing::info!("routing through SOCKS tunnel on port {port}")
                }
                status => tracing::warn!("tunnel unavailable ({status:?}), going direct"),
            }
            Arc::new(service)
        }
        None => Arc::new(ProxyService::disabled()),
    };

    let keys = match &args.key {
        Some(key) => Keys::parse(key).context("invalid secret key")?,
        None => Keys::generate(),
    };
    let identity = keys.public_key().to_hex();

    // The daemon has no app storage; an in-memory store stands in for it.
    let store = Arc::new(MemoryStore::new());
    let health = Arc::new(RelayHealthTracker::new(store, &identity));
    let pool = RelayPool::new(Arc::clone(&proxy), Arc::clone(&health));
    let book = Arc::new(RelayListBook::new());

    // Pick the relay set.
    let relay_urls: Vec<RelayUrl> = if args.discover {
        tracing::info!("running bootstrap discovery...");
        let prober = RelayProber::new(Arc::clone(&proxy), keys.clone());
        let mut phase = prober.watch_phase();
        let watcher = tokio::spawn(async move {
            while phase.changed().await.is_ok() {
                tracing::info!("discovery phase: {:?}", *phase.borrow());
            }
        });
        let urls = prober.discover().await;
        watcher.abort();
        urls
    } else {
        let policy = proxy.url_policy();
        args.relays
            .unwrap_or_else(|| {
                roost_net::DEFAULT_RELAYS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            })
            .iter()
            .filter_map(|raw| match roost_core::normalize_relay_url(raw, &policy) {
                roost_core::UrlCheck::Ok(url) => Some(url),
                other => {
                    tracing::warn!("skipping relay '{raw}': {other:?}");
                    None
                }
            })
            .collect()
    };

    tracing::info!("connecting to {} relays", relay_urls.len());
    pool.update_relays(
        relay_urls
            .iter()
            .cloned()
            .map(RelayAddress::read_write)
            .collect(),
    );

    // Give the dials a moment, then subscribe to recent notes.
    tokio::time::sleep(Duration::from_secs(2)).await;
    tracing::info!("{} relays connected", pool.connected_count());

    // Periodic ephemeral eviction / cooldown expiry.
    let cleanup_pool = pool.clone();
    let cleanup = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            cleanup_pool.cleanup_ephemeral_relays();
        }
    });

    let subscription_id = SubscriptionId::new("follows-firehose");
    let filter = Filter::new().kind(Kind::TextNote).limit(args.limit);
    let frame = roost_net::wire::req_frame(&subscription_id, std::slice::from_ref(&filter));
    pool.send_to_read_relays(&frame);

    let mut tagged = pool.tagged_events();
    let mut received = 0usize;
    let policy = UrlPolicy::default();

    while running.load(Ordering::SeqCst) {
        let envelope =
            match tokio::time::timeout(Duration::from_secs(1), tagged.recv()).await {
                Ok(Ok(envelope)) => envelope,
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::warn!("event stream lagged, {skipped} dropped");
                    continue;
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
                Err(_) => continue, // timeout: check the running flag
            };

        // Keep the relay-list book warm as a side effect of streaming.
        if envelope.event.kind == Kind::RelayList {
            book.observe(&envelope.event, &policy);
        }

        received += 1;
        tracing::info!(
            "[{}] kind={} author={} {:?}",
            envelope.relay,
            envelope.event.kind.as_u16(),
            envelope.event.pubkey,
            envelope.event.content.chars().take(60).collect::<String>()
        );
    }

    cleanup.abort();
    pool.close_subscription(&subscription_id);
    health.close_all_sessions();

    tracing::info!("received {received} events from {} relays", relay_urls.len());
    tracing::info!("console log entries: {}", pool.console().len());
    for entry in pool.console().entries().iter().take(10) {
        tracing::info!("  [{:?}] {}: {}", entry.kind, entry.relay, entry.message);
    }

    Ok(())
}
