use crate::models::RawBarRecord;
use serde_json::Value;
use tracing::warn;

/// A parsed inbound frame from the push feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// A delta for the instrument's current bar.
    Bar(RawBarRecord),
    /// Any other JSON object the feed sends.
    Metadata(Value),
}

impl FeedMessage {
    /// Parse a text frame.
    ///
    /// Returns `None` for keepalive replies and for frames that are not JSON
    /// objects; the latter are logged and dropped.
    pub fn parse(text: &str) -> Option<FeedMessage> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, frame = %crate::utils::truncate_string(text, 120), "Dropping unparseable feed frame");
                return None;
            }
        };

        let object = match value.as_object() {
            Some(o) => o,
            None => {
                warn!(frame = %crate::utils::truncate_string(text, 120), "Dropping non-object feed frame");
                return None;
            }
        };

        if object.get("type").and_then(Value::as_str) == Some("pong") {
            return None;
        }

        // Bars arrive either bare or wrapped in {"data": {...}}.
        let candidate = match object.get("data") {
            Some(inner) if inner.is_object() => inner.clone(),
            _ => value.clone(),
        };
        match serde_json::from_value::<RawBarRecord>(candidate) {
            Ok(record) => Some(FeedMessage::Bar(record)),
            Err(_) => Some(FeedMessage::Metadata(value)),
        }
    }

    pub fn ping_frame() -> String {
        serde_json::json!({ "type": "ping" }).to_string()
    }
}
