//! Line-oriented text encodings for persisted relay state.
//!
//! The health tracker and score board persist their state through the
//! key-value storage collaborator as flat text. The delimiter grammar is
//! fixed for compatibility with existing stored state:
//!
//! - records are newline-separated lines of `key<TAB>payload`
//! - list payloads are comma-separated
//! - session-history payloads are semicolon-separated records of
//!   `count,flag,flag,durationMs`
//!
//! Decoders are tolerant: a malformed record (blank field, bad number) is
//! skipped rather than aborting the whole load. Encoders sort keys so the
//! output is deterministic.

use std::collections::HashMap;

/// One closed health session, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionRecord {
    /// Events received during the session.
    pub events_received: u64,
    /// Whether the session saw a mid-session transport failure or was
    /// closed by one.
    pub had_failure: bool,
    /// Whether the session saw a rate-limit rejection.
    pub had_rate_limit: bool,
    /// Session duration in milliseconds.
    pub duration_ms: u64,
}

/// Cumulative lifetime counters for one relay, as persisted.
///
/// Encoded as exactly ten comma-separated integers, in field order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LifetimeStats {
    pub events_sent: u64,
    pub events_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections: u64,
    pub connected_ms: u64,
    pub failures: u64,
    pub rate_limits: u64,
    pub first_seen_ms: u64,
    pub last_connected_ms: u64,
}

/// Encode a set of URLs as newline-separated lines.
pub fn encode_url_set<'a, I>(urls: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut lines: Vec<&str> = urls.into_iter().filter(|u| !u.is_empty()).collect();
    lines.sort_unstable();
    lines.join("\n")
}

/// Decode a newline-separated URL set. Blank lines are skipped.
pub fn decode_url_set(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Encode a comma-separated list (cached follow set, legacy URL list).
pub fn encode_comma_list<'a, I>(items: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut items: Vec<&str> = items.into_iter().filter(|s| !s.is_empty()).collect();
    items.sort_unstable();
    items.join(",")
}

/// Decode a comma-separated list. Blank fields are skipped.
pub fn decode_comma_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Encode a `key -> values` map as `key<TAB>comma-separated-values` lines.
///
/// Used for both `author_relay_map` (url -> authors) and
/// `hint_author_relay_map` (pubkey -> urls).
pub fn encode_keyed_lists(map: &HashMap<String, Vec<String>>) -> String {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort_unstable();

    let mut out = String::new();
    for key in keys {
        let values = &map[key];
        if key.is_empty() || values.is_empty() {
            continue;
        }
        let mut values: Vec<&str> = values.iter().map(String::as_str).collect();
        values.sort_unstable();
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(key);
        out.push('\t');
        out.push_str(&values.join(","));
    }
    out
}

/// Decode `key<TAB>comma-separated-values` lines. Lines without a tab or
/// with an empty key are skipped.
pub fn decode_keyed_lists(text: &str) -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let Some((key, rest)) = line.split_once('\t') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let values = decode_comma_list(rest);
        if values.is_empty() {
            continue;
        }
        map.insert(key.to_string(), values);
    }
    map
}

/// Encode session history as `url<TAB>record;record;...` lines, where each
/// record is `count,flag,flag,durationMs`.
pub fn encode_session_history(history: &HashMap<String, Vec<SessionRecord>>) -> String {
    let mut keys: Vec<&String> = history.keys().collect();
    keys.sort_unstable();

    let mut out = String::new();
    for key in keys {
        let records = &history[key];
        if key.is_empty() || records.is_empty() {
            continue;
        }
        let encoded: Vec<String> = records
            .iter()
            .map(|r| {
                format!(
                    "{},{},{},{}",
                    r.events_received,
                    flag(r.had_failure),
                    flag(r.had_rate_limit),
                    r.duration_ms
                )
            })
            .collect();
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(key);
        out.push('\t');
        out.push_str(&encoded.join(";"));
    }
    out
}

/// Decode session history. Malformed records (wrong field count, bad
/// numbers) are skipped individually; a relay with no surviving records is
/// dropped entirely.
pub fn decode_session_history(text: &str) -> HashMap<String, Vec<SessionRecord>> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let Some((key, rest)) = line.split_once('\t') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let records: Vec<SessionRecord> = rest
            .split(';')
            .filter_map(decode_session_record)
            .collect();
        if records.is_empty() {
            continue;
        }
        map.insert(key.to_string(), records);
    }
    map
}

fn decode_session_record(field: &str) -> Option<SessionRecord> {
    let mut parts = field.split(',');
    let events_received = parts.next()?.trim().parse().ok()?;
    let had_failure = parse_flag(parts.next()?)?;
    let had_rate_limit = parse_flag(parts.next()?)?;
    let duration_ms = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(SessionRecord {
        events_received,
        had_failure,
        had_rate_limit,
        duration_ms,
    })
}

/// Encode lifetime stats as `url<TAB>ten comma-separated integers` lines.
pub fn encode_lifetime_stats(stats: &HashMap<String, LifetimeStats>) -> String {
    let mut keys: Vec<&String> = stats.keys().collect();
    keys.sort_unstable();

    let mut out = String::new();
    for key in keys {
        if key.is_empty() {
            continue;
        }
        let s = &stats[key];
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(key);
        out.push('\t');
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{}",
            s.events_sent,
            s.events_received,
            s.bytes_sent,
            s.bytes_received,
            s.connections,
            s.connected_ms,
            s.failures,
            s.rate_limits,
            s.first_seen_ms,
            s.last_connected_ms
        ));
    }
    out
}

/// Decode lifetime stats. Lines with the wrong integer count or malformed
/// numbers are skipped.
pub fn decode_lifetime_stats(text: &str) -> HashMap<String, LifetimeStats> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let Some((key, rest)) = line.split_once('\t') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let fields: Vec<u64> = rest
            .split(',')
            .map(|f| f.trim().parse::<u64>())
            .collect::<std::result::Result<Vec<u64>, _>>()
            .unwrap_or_default();
        if fields.len() != 10 {
            continue;
        }
        map.insert(
            key.to_string(),
            LifetimeStats {
                events_sent: fields[0],
                events_received: fields[1],
                bytes_sent: fields[2],
                bytes_received: fields[3],
                connections: fields[4],
                connected_ms: fields[5],
                failures: fields[6],
                rate_limits: fields[7],
                first_seen_ms: fields[8],
                last_connected_ms: fields[9],
            },
        );
    }
    map
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

fn parse_flag(field: &str) -> Option<bool> {
    match field.trim() {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}
