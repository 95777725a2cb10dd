//! Log record types and the message truncation policy.
//!
//! The emitter writes newline-delimited JSON records `{"t","m","s"}`.
//! Chunks persist the storage form `{"t","m","n"}`; the step name is
//! implied by the chunk's destination path.

use serde::{Deserialize, Serialize};

/// One record as read from the emitter stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogRecord {
    /// Producer timestamp, opaque to the pipeline.
    #[serde(rename = "t")]
    pub time: i64,
    #[serde(rename = "m")]
    pub message: String,
    /// Name of the build step that produced this line.
    #[serde(rename = "s")]
    pub step: String,
}

/// The persisted form of a record within a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(rename = "t")]
    pub time: i64,
    #[serde(rename = "m")]
    pub message: String,
    /// 0-based position of the record within its step.
    #[serde(rename = "n")]
    pub line: usize,
}

impl StoredRecord {
    /// Convert an emitter record to its storage form, truncating the
    /// message to `max_line_size` characters.
    pub fn from_record(record: &LogRecord, line: usize, max_line_size: usize) -> Self {
        Self {
            time: record.time,
            message: truncate_message(&record.message, max_line_size),
            line,
        }
    }
}

/// Cap a message at `max` characters, annotating truncated messages.
///
/// Counts characters rather than bytes so a multi-byte code point is
/// never split.
fn truncate_message(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        None => message.to_string(),
        Some((cut, _)) => {
            format!(
                "{} [line truncated after {} characters]",
                &message[..cut],
                max
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            time: 1234,
            message: message.to_string(),
            step: "step1".to_string(),
        }
    }

    #[test]
    fn stored_form_serializes_with_short_keys() {
        let stored = StoredRecord::from_record(&record("TestLine2"), 1, 5000);
        let json = serde_json::to_string(&stored).unwrap();
        assert_eq!(json, r#"{"t":1234,"m":"TestLine2","n":1}"#);
    }

    #[test]
    fn message_at_limit_is_kept_verbatim() {
        let message = "x".repeat(10);
        let stored = StoredRecord::from_record(&record(&message), 0, 10);
        assert_eq!(stored.message, message);
    }

    #[test]
    fn message_over_limit_is_truncated_and_annotated() {
        let message = "x".repeat(11);
        let stored = StoredRecord::from_record(&record(&message), 0, 10);
        assert_eq!(
            stored.message,
            format!("{} [line truncated after 10 characters]", "x".repeat(10))
        );
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        // Four 3-byte code points; limit of 3 must cut cleanly.
        let stored = StoredRecord::from_record(&record("日本語字"), 0, 3);
        assert_eq!(stored.message, "日本語 [line truncated after 3 characters]");
    }

    #[test]
    fn emitter_record_parses_short_keys() {
        let parsed: LogRecord =
            serde_json::from_str(r#"{"t":42,"m":"hello","s":"build"}"#).unwrap();
        assert_eq!(parsed.time, 42);
        assert_eq!(parsed.message, "hello");
        assert_eq!(parsed.step, "build");
    }
}
