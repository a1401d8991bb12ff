//! Bootstrap relay discovery.
//!
//! A five-stage pipeline that turns a fixed set of well-known relays into
//! a vetted, latency-ranked relay set for a fresh install:
//!
//! 1. harvest relay-list events from the bootstrap relays
//! 2. tally how often each acceptable URL is advertised
//! 3. keep the middle tier (drop the mega-relays, require a minimum
//!    frequency)
//! 4. probe each candidate: capability document, then a signed ephemeral
//!    marker publish, measuring latency to the acknowledgement
//! 5. keep the fastest accepted candidates
//!
//! Every per-relay and per-candidate failure is contained; if any stage
//! yields nothing the pipeline reports `Failed` and the caller falls back
//! to the static default set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::SinkExt;
use futures_util::StreamExt;
use nostr::{Event, EventBuilder, JsonUtil, Keys, Kind, RelayMessage, RelayUrl, SubscriptionId};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{to_frame, RelayFrame};
use crate::constants::{
    HARVEST_EARLY_STOP, HARVEST_LIMIT, HARVEST_TIMEOUT, PROBE_ACK_TIMEOUT, PROBE_CANDIDATES,
    PROBE_KEEP, TALLY_DROP_TOP, TALLY_MIN_FREQUENCY,
};
use crate::proxy::ProxyService;
use crate::transport;
use crate::wire;
use crate::{Error, Result};

/// Ephemeral kind used for the probe marker event; relays treat the
/// ephemeral range as fire-and-forget.
const PROBE_MARKER_KIND: u16 = 28989;

/// Well-known relays harvested for relay-list events.
pub const BOOTSTRAP_RELAYS: &[&str] = &[
    "wss://purplepag.es",
    "wss://relay.damus.io",
    "wss://relay.nostr.band",
    "wss://nos.lol",
];

/// Static fallback set used when discovery fails.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://relay.nostr.band",
    "wss://nos.lol",
    "wss://relay.snort.social",
    "wss://purplepag.es",
    "wss://relay.primal.net",
    "wss://nostr.wine",
    "wss://relay.nostr.bg",
];

/// Pipeline progress, published for UI consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    Connecting,
    Discovering,
    Selecting,
    Testing,
    Broadcasting,
    Done,
    Failed,
}

/// Outcome of probing one candidate.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub url: RelayUrl,
    pub accepted: bool,
    pub latency: Duration,
    pub reason: String,
}

/// NIP-11 capability document; absence is treated as "open".
#[derive(Debug, Default, Deserialize)]
struct CapabilityDocument {
    #[serde(default)]
    limitation: CapabilityLimits,
}

#[derive(Debug, Default, Deserialize)]
struct CapabilityLimits {
    #[serde(default)]
    auth_required: bool,
    #[serde(default)]
    payment_required: bool,
    #[serde(default)]
    restricted_writes: bool,
    #[serde(default)]
    min_pow_difficulty: u32,
}

impl CapabilityLimits {
    fn is_restrictive(&self) -> bool {
        self.auth_required
            || self.payment_required
            || self.restricted_writes
            || self.min_pow_difficulty > 0
    }
}

/// Bootstrap discovery pipeline.
pub struct RelayProber {
    proxy: Arc<ProxyService>,
    keys: Keys,
    bootstrap: Vec<RelayUrl>,
    phase: watch::Sender<ProbePhase>,
}

impl RelayProber {
    /// `keys` signs the ephemeral probe marker; the caller supplies an
    /// already-derived keypair.
    pub fn new(proxy: Arc<ProxyService>, keys: Keys) -> Self {
        let bootstrap = BOOTSTRAP_RELAYS
            .iter()
            .filter_map(|u| RelayUrl::parse(u).ok())
            .collect();
        Self::with_bootstrap(proxy, keys, bootstrap)
    }

    pub fn with_bootstrap(proxy: Arc<ProxyService>, keys: Keys, bootstrap: Vec<RelayUrl>) -> Self {
        let (phase, _) = watch::channel(ProbePhase::Connecting);
        Self {
            proxy,
            keys,
            bootstrap,
            phase,
        }
    }

    /// Observe pipeline progress.
    pub fn watch_phase(&self) -> watch::Receiver<ProbePhase> {
        self.phase.subscribe()
    }

    /// Run the pipeline, degrading to [`DEFAULT_RELAYS`] on total failure.
    pub async fn discover(&self) -> Vec<RelayUrl> {
        match self.run().await {
            Ok(results) => {
                let _ = self.phase.send_replace(ProbePhase::Done);
                results.into_iter().map(|r| r.url).collect()
            }
            Err(e) => {
                tracing::warn!("relay discovery failed, using defaults: {}", e);
                let _ = self.phase.send_replace(ProbePhase::Failed);
                DEFAULT_RELAYS
                    .iter()
                    .filter_map(|u| RelayUrl::parse(u).ok())
                    .collect()
            }
        }
    }

    async fn run(&self) -> Result<Vec<ProbeResult>> {
        let _ = self.phase.send_replace(ProbePhase::Connecting);
        let _ = self.phase.send_replace(ProbePhase::Discovering);

        let mut harvested: Vec<Event> = Vec::new();
        for (index, url) in self.bootstrap.iter().enumerate() {
            match harvest_relay(url, &self.proxy).await {
                Ok(events) => {
                    tracing::debug!("harvested {} relay lists from {}", events.len(), url);
                    harvested.extend(events);
                }
                Err(e) => {
                    tracing::debug!("harvest from {} failed: {}", url, e);
                }
            }
            // A rich first harvest is enough; skip the remaining relays.
            if index == 0 && harvested.len() >= HARVEST_EARLY_STOP {
                break;
            }
        }
        if harvested.is_empty() {
            return Err(Error::Discovery("no relay lists harvested".to_string()));
        }

        let _ = self.phase.send_replace(ProbePhase::Selecting);
        let tally = tally_relay_urls(&harvested, &self.proxy);
        let candidates = middle_tier(tally);
        if candidates.is_empty() {
            return Err(Error::Discovery(
                "no candidates survived the tally".to_string(),
            ));
        }

        let _ = self.phase.send_replace(ProbePhase::Testing);
        let probes = candidates
            .into_iter()
            .map(|url| probe_candidate(url, &self.proxy, &self.keys));
        let results: Vec<ProbeResult> = futures_util::future::join_all(probes).await;

        let mut accepted: Vec<ProbeResult> =
            results.into_iter().filter(|r| r.accepted).collect();
        if accepted.is_empty() {
            return Err(Error::Discovery("no candidate accepted the probe".to_string()));
        }
        accepted.sort_by_key(|r| r.latency);
        accepted.truncate(PROBE_KEEP);

        let _ = self.phase.send_replace(ProbePhase::Broadcasting);
        Ok(accepted)
    }
}

/// Collect relay-list events from one bootstrap relay, bounded by the
/// harvest timeout.
async fn harvest_relay(url: &RelayUrl, proxy: &ProxyService) -> Result<Vec<Event>> {
    let (mut sink, mut stream) = transport::dial(url, proxy).await?;

    let subscription_id = SubscriptionId::generate();
    let filter = nostr::Filter::new().kind(Kind::RelayList).limit(HARVEST_LIMIT);
    sink.send(Message::Text(
        wire::req_frame(&subscription_id, std::slice::from_ref(&filter)).into(),
    ))
    .await?;

    let deadline = tokio::time::Instant::now() + HARVEST_TIMEOUT;
    let mut events = Vec::new();

    loop {
        let next = tokio::time::timeout_at(deadline, stream.next()).await;
        let frame = match next {
            Ok(Some(Ok(Message::Text(text)))) => {
                RelayMessage::from_json(text.as_str()).ok().and_then(to_frame)
            }
            Ok(Some(Ok(_))) => None,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => break, // harvest window elapsed
        };

        match frame {
            Some(RelayFrame::Event { event, .. }) if event.kind == Kind::RelayList => {
                events.push(*event);
                if events.len() >= HARVEST_LIMIT {
                    break;
                }
            }
            Some(RelayFrame::Eose { .. }) => break,
            _ => {}
        }
    }

    let _ = sink
        .send(Message::Text(wire::close_frame(&subscription_id).into()))
        .await;
    let _ = sink.send(Message::Close(None)).await;

    Ok(events)
}

/// Count how often each acceptable URL is advertised. Each harvested
/// event contributes one count per distinct URL it lists.
fn tally_relay_urls(events: &[Event], proxy: &ProxyService) -> HashMap<RelayUrl, usize> {
    let policy = proxy.url_policy();
    let mut tally: HashMap<RelayUrl, usize> = HashMap::new();

    for event in events {
        let lists = roost_core::parse_relay_list(event, &policy);
        let urls: HashSet<RelayUrl> = lists.read.into_iter().chain(lists.write).collect();
        for url in urls {
            *tally.entry(url).or_insert(0) += 1;
        }
    }
    tally
}

/// Sort by frequency, drop the assumed-overloaded top, require a minimum
/// frequency, and keep the next slice as probe candidates.
fn middle_tier(tally: HashMap<RelayUrl, usize>) -> Vec<RelayUrl> {
    let mut ranked: Vec<(RelayUrl, usize)> = tally.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));

    ranked
        .into_iter()
        .skip(TALLY_DROP_TOP)
        .filter(|(_, freq)| *freq >= TALLY_MIN_FREQUENCY)
        .take(PROBE_CANDIDATES)
        .map(|(url, _)| url)
        .collect()
}

/// Probe one candidate: capability document, then a signed marker publish
/// acknowledged within the probe timeout.
async fn probe_candidate(url: RelayUrl, proxy: &ProxyService, keys: &Keys) -> ProbeResult {
    let started = Instant::now();

    match fetch_capabilities(&url, proxy).await {
        CapabilityVerdict::Restrictive(reason) => {
            return failed_probe(url, started, reason);
        }
        CapabilityVerdict::Open => {}
    }

    let marker = match EventBuilder::new(Kind::Custom(PROBE_MARKER_KIND), "connectivity probe")
        .sign_with_keys(keys)
    {
        Ok(event) => event,
        Err(e) => return failed_probe(url, started, format!("marker signing failed: {e}")),
    };

    let publish = async {
        let (mut sink, mut stream) = transport::dial(&url, proxy).await?;
        sink.send(Message::Text(wire::event_frame(&marker).into()))
            .await?;

        while let Some(incoming) = stream.next().await {
            let Ok(Message::Text(text)) = incoming else {
                continue;
            };
            let Ok(message) = RelayMessage::from_json(text.as_str()) else {
                continue;
            };
            if let Some(RelayFrame::Ok {
                event_id,
                accepted,
                message,
            }) = to_frame(message)
            {
                if event_id == marker.id {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok::<(bool, String), Error>((accepted, message));
                }
            }
        }
        Err(Error::Timeout("probe acknowledgement"))
    };

    match tokio::time::timeout(PROBE_ACK_TIMEOUT, publish).await {
        Ok(Ok((true, _))) => ProbeResult {
            url,
            accepted: true,
            latency: started.elapsed(),
            reason: "accepted".to_string(),
        },
        Ok(Ok((false, message))) => failed_probe(url, started, format!("publish rejected: {message}")),
        Ok(Err(e)) => {
            let reason = e.to_string();
            failed_probe(url, started, reason)
        }
        Err(_) => failed_probe(url, started, "no acknowledgement before timeout".to_string()),
    }
}

fn failed_probe(url: RelayUrl, started: Instant, reason: String) -> ProbeResult {
    ProbeResult {
        url,
        accepted: false,
        latency: started.elapsed(),
        reason,
    }
}

enum CapabilityVerdict {
    Open,
    Restrictive(String),
}

/// Fetch the relay's capability document over its HTTP origin. Absence or
/// malformed content counts as open; explicit restrictions fail the
/// candidate.
async fn fetch_capabilities(url: &RelayUrl, proxy: &ProxyService) -> CapabilityVerdict {
    let http_url = url
        .as_str()
        .replacen("wss://", "https://", 1)
        .replacen("ws://", "http://", 1);

    let mut builder = reqwest::Client::builder().timeout(PROBE_ACK_TIMEOUT);
    if let Some(endpoint) = proxy.socks_endpoint() {
        match reqwest::Proxy::all(format!("socks5h://{endpoint}")) {
            Ok(socks) => builder = builder.proxy(socks),
            Err(e) => {
                tracing::debug!("capability fetch proxy setup failed: {}", e);
            }
        }
    }
    let client = match builder.build() {
        Ok(client) => client,
        Err(_) => return CapabilityVerdict::Open,
    };

    let response = client
        .get(&http_url)
        .header("Accept", "application/nostr+json")
        .send()
        .await;

    let document: CapabilityDocument = match response {
        Ok(response) => match response.json().await {
            Ok(document) => document,
            Err(_) => return CapabilityVerdict::Open,
        },
        Err(_) => return CapabilityVerdict::Open,
    };

    if document.limitation.is_restrictive() {
        CapabilityVerdict::Restrictive("restrictive capability document".to_string())
    } else {
        CapabilityVerdict::Open
    }
}

#[cfg(test)]
mod tests {
    use nostr::{Tag, Timestamp};

    use super::*;

    fn url(n: usize) -> RelayUrl {
        RelayUrl::parse(&format!("wss://relay{n}.example.com")).expect("valid url")
    }

    fn relay_list_event(urls: &[usize]) -> Event {
        let keys = Keys::generate();
        let tags: Vec<Tag> = urls
            .iter()
            .map(|n| Tag::parse(["r", url(*n).as_str()]).expect("valid tag"))
            .collect();
        EventBuilder::new(Kind::RelayList, "")
            .tags(tags)
            .custom_created_at(Timestamp::from(100))
            .sign_with_keys(&keys)
            .expect("signable event")
    }

    #[test]
    fn test_tally_counts_each_event_once_per_url() {
        let proxy = ProxyService::disabled();
        // relay1 appears in both events, relay2 in one.
        let events = vec![relay_list_event(&[1, 2]), relay_list_event(&[1])];
        let tally = tally_relay_urls(&events, &proxy);
        assert_eq!(tally[&url(1)], 2);
        assert_eq!(tally[&url(2)], 1);
    }

    #[test]
    fn test_middle_tier_drops_top_and_rare() {
        let mut tally = HashMap::new();
        // Five mega-relays with huge counts.
        for n in 0..TALLY_DROP_TOP {
            tally.insert(url(n), 1000 + n);
        }
        // A healthy middle tier.
        for n in 10..20 {
            tally.insert(url(n), 10);
        }
        // Below the frequency floor.
        tally.insert(url(99), TALLY_MIN_FREQUENCY - 1);

        let candidates = middle_tier(tally);
        assert_eq!(candidates.len(), 10);
        for n in 0..TALLY_DROP_TOP {
            assert!(!candidates.contains(&url(n)), "mega-relay {n} should be dropped");
        }
        assert!(!candidates.contains(&url(99)));
    }

    #[test]
    fn test_middle_tier_caps_candidates() {
        let mut tally = HashMap::new();
        for n in 0..40 {
            tally.insert(url(n), 100 - n);
        }
        assert_eq!(middle_tier(tally).len(), PROBE_CANDIDATES);
    }

    #[test]
    fn test_restrictive_capability_document() {
        let open: CapabilityDocument = serde_json::from_str(r#"{"name":"relay"}"#).expect("json");
        assert!(!open.limitation.is_restrictive());

        let auth: CapabilityDocument =
            serde_json::from_str(r#"{"limitation":{"auth_required":true}}"#).expect("json");
        assert!(auth.limitation.is_restrictive());

        let paid: CapabilityDocument =
            serde_json::from_str(r#"{"limitation":{"payment_required":true}}"#).expect("json");
        assert!(paid.limitation.is_restrictive());

        let pow: CapabilityDocument =
            serde_json::from_str(r#"{"limitation":{"min_pow_difficulty":20}}"#).expect("json");
        assert!(pow.limitation.is_restrictive());
    }

    #[test]
    fn test_phase_starts_at_connecting() {
        let prober = RelayProber::new(Arc::new(ProxyService::disabled()), Keys::generate());
        assert_eq!(*prober.watch_phase().borrow(), ProbePhase::Connecting);
    }

    #[test]
    fn test_default_sets_parse() {
        for raw in BOOTSTRAP_RELAYS.iter().chain(DEFAULT_RELAYS) {
            assert!(RelayUrl::parse(raw).is_ok(), "bad builtin url {raw}");
        }
    }
}
