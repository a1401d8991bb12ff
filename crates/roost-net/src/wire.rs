//! Outbound wire frame composition.
//!
//! Inbound frames are parsed with the codec's `RelayMessage`; outbound
//! frames are composed here because the codec's client-message type only
//! carries a single filter per REQ, while the outbox router batches several
//! filter templates into one multi-filter request.

use nostr::{Event, Filter, SubscriptionId};
use serde_json::{json, Value};

/// `["REQ", subId, filter, ...]`
pub fn req_frame(subscription_id: &SubscriptionId, filters: &[Filter]) -> String {
    let mut frame: Vec<Value> = Vec::with_capacity(2 + filters.len());
    frame.push(json!("REQ"));
    frame.push(json!(subscription_id.to_string()));
    for filter in filters {
        frame.push(json!(filter));
    }
    Value::Array(frame).to_string()
}

/// `["EVENT", signedEvent]`
pub fn event_frame(event: &Event) -> String {
    json!(["EVENT", event]).to_string()
}

/// `["CLOSE", subId]`
pub fn close_frame(subscription_id: &SubscriptionId) -> String {
    json!(["CLOSE", subscription_id.to_string()]).to_string()
}

#[cfg(test)]
mod tests {
    use nostr::{EventBuilder, Keys, Kind};

    use super::*;

    #[test]
    fn test_req_frame_multi_filter() {
        let sub = SubscriptionId::new("follows-feed");
        let filters = vec![
            Filter::new().kind(Kind::TextNote).limit(10),
            Filter::new().kind(Kind::Metadata),
        ];
        let frame = req_frame(&sub, &filters);

        let parsed: Vec<Value> = serde_json::from_str(&frame).expect("valid json");
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed[0], "REQ");
        assert_eq!(parsed[1], "follows-feed");
        assert!(parsed[2].is_object());
        assert!(parsed[3].is_object());
    }

    #[test]
    fn test_event_frame() {
        let keys = Keys::generate();
        let event = EventBuilder::text_note("hi")
            .sign_with_keys(&keys)
            .expect("signable event");
        let frame = event_frame(&event);

        let parsed: Vec<Value> = serde_json::from_str(&frame).expect("valid json");
        assert_eq!(parsed[0], "EVENT");
        assert_eq!(parsed[1]["content"], "hi");
    }

    #[test]
    fn test_close_frame() {
        let frame = close_frame(&SubscriptionId::new("dms-inbox"));
        assert_eq!(frame, r#"["CLOSE","dms-inbox"]"#);
    }
}
