//! Decoded log messages and stream identifiers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One decoded log record: the formatted text and when it was emitted.
///
/// Produced once per recognized native record and handed to the consumer by
/// value. Nothing inside the bridge keeps a copy; accumulating history is the
/// consumer's job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogMessage {
    /// Fully composed message text. Empty when the native bytes were not UTF-8.
    pub text: String,

    /// Wall-clock time the record was emitted, at one-second resolution.
    pub timestamp: DateTime<Utc>,
}

impl LogMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            timestamp,
        }
    }

    /// Builds the timestamp from whole seconds since the Unix epoch.
    ///
    /// Values chrono cannot represent collapse to the epoch itself.
    #[must_use]
    pub fn timestamp_from_secs(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default()
    }
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.to_rfc3339(), self.text)
    }
}

/// Identifies one opened activity stream.
///
/// The raw native handle never leaves its manager; this token is what callers
/// see in logs and errors.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Create a new random stream id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_from_secs() {
        let ts = LogMessage::timestamp_from_secs(1_598_227_200);
        assert_eq!(ts.timestamp(), 1_598_227_200);
        assert_eq!(ts.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_timestamp_out_of_range_is_epoch() {
        let ts = LogMessage::timestamp_from_secs(i64::MAX);
        assert_eq!(ts.timestamp(), 0);
    }

    #[test]
    fn test_display_contains_text() {
        let msg = LogMessage::new("Default log message", LogMessage::timestamp_from_secs(0));
        let rendered = msg.to_string();
        assert!(rendered.contains("Default log message"));
        assert!(rendered.contains("1970-01-01"));
    }

    #[test]
    fn test_serialize_json() {
        let msg = LogMessage::new("hi", LogMessage::timestamp_from_secs(10));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"text\":\"hi\""));
        let back: LogMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_stream_ids_unique() {
        assert_ne!(StreamId::new(), StreamId::new());
    }
}
