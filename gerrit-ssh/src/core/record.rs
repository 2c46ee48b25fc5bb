//! Records delivered by the event feed.

use serde::Serialize;
use serde_json::Value;

/// Record type the server emits after discarding buffered events.
pub const DROPPED_OUTPUT: &str = "dropped-output";

/// One decoded feed record; only the `type` discriminator is inspected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EventRecord(Value);

impl EventRecord {
    /// Decode one newline-delimited JSON line. Non-object values are rejected.
    pub fn parse(line: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(line).map_err(|err| err.to_string())?;
        if !value.is_object() {
            return Err(format!("expected a JSON object, got {value}"));
        }
        Ok(Self(value))
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn is_dropped_output(&self) -> bool {
        self.kind() == Some(DROPPED_OUTPUT)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// One item of the subscription: either a record or a notice that the
/// consumer must resynchronize because continuity was lost.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Resync,
    Record(EventRecord),
}

/// What the feed should hand to the consumer for one stdout line.
pub fn classify_feed_line(line: &str) -> Result<Option<FeedItem>, String> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let record = EventRecord::parse(line)?;
    if record.is_dropped_output() {
        return Ok(Some(FeedItem::Resync));
    }
    Ok(Some(FeedItem::Record(record)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_output_becomes_resync() {
        assert_eq!(
            classify_feed_line(r#"{"type":"dropped-output"}"#),
            Ok(Some(FeedItem::Resync))
        );
    }

    #[test]
    fn other_records_are_delivered() {
        let item = classify_feed_line(r#"{"type":"patchset-created","change":{"number":7}}"#)
            .expect("parse")
            .expect("item");
        let FeedItem::Record(record) = item else {
            panic!("expected record");
        };
        assert_eq!(record.kind(), Some("patchset-created"));
        assert_eq!(record.value()["change"]["number"], 7);
    }

    #[test]
    fn dropped_output_inside_payload_is_not_a_sentinel() {
        let item = classify_feed_line(r#"{"type":"comment-added","comment":"dropped-output"}"#)
            .expect("parse")
            .expect("item");
        assert!(matches!(item, FeedItem::Record(_)));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(classify_feed_line("   "), Ok(None));
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(classify_feed_line("{not json").is_err());
        assert!(classify_feed_line("[1,2]").is_err());
    }
}
