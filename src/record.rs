use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::limits::{MAX_RECORD_BYTES, RECORD_OVERHEAD_BYTES};

/// Structured event captured by the tracing layer.
///
/// This is formatter input only: the queue never looks inside it. The
/// configured formatter turns it into the text of a [`StreamRecord`].
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub module_path: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub message: Option<String>,
}

/// A single timestamped text record as the log-stream service accepts it.
///
/// Immutable once admitted to the queue. Sizing is byte-based because the
/// service's limits are byte-based; see [`StreamRecord::accounted_bytes`].
#[derive(Debug, Clone, Serialize)]
pub struct StreamRecord {
    #[serde(rename = "timestamp")]
    pub timestamp_millis: i64,
    #[serde(rename = "message")]
    pub text: String,
}

impl StreamRecord {
    pub fn new(timestamp_millis: i64, text: impl Into<String>) -> Self {
        StreamRecord {
            timestamp_millis,
            text: text.into(),
        }
    }

    /// Byte size this record contributes to a batch: encoded text length
    /// plus the fixed per-record envelope the service charges.
    pub fn accounted_bytes(&self) -> usize {
        self.text.len() + RECORD_OVERHEAD_BYTES
    }
}

/// Error returned when a record's text exceeds [`MAX_RECORD_BYTES`] and
/// truncation is disabled (empty suffix).
#[derive(thiserror::Error, Debug)]
#[error("record of {len} bytes exceeds the {max} byte limit")]
pub struct OversizeError {
    pub len: usize,
    pub max: usize,
}

/// Cut `text` to at most `max_bytes` encoded bytes without splitting a
/// multi-byte character.
fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Enforce the per-record byte ceiling on `text`.
///
/// Returns the admitted text and whether it was truncated. Oversized text is
/// cut at a character boundary to `MAX_RECORD_BYTES - suffix.len()` bytes and
/// the suffix is appended, so the result never exceeds the ceiling. An empty
/// suffix disables truncation and oversized text is rejected instead.
pub(crate) fn clamp_text(text: String, suffix: &str) -> Result<(String, bool), OversizeError> {
    if text.len() <= MAX_RECORD_BYTES {
        return Ok((text, false));
    }
    if suffix.is_empty() {
        return Err(OversizeError {
            len: text.len(),
            max: MAX_RECORD_BYTES,
        });
    }
    let keep = MAX_RECORD_BYTES.saturating_sub(suffix.len());
    let mut out = truncate_utf8(&text, keep).to_string();
    out.push_str(suffix);
    Ok((out, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_passes_through() {
        let (text, truncated) = clamp_text("hello".to_string(), " [TRUNCATED]").unwrap();
        assert_eq!(text, "hello");
        assert!(!truncated);
    }

    #[test]
    fn oversized_text_is_cut_to_limit_with_suffix() {
        let suffix = " TRUNCATED";
        let text = "x".repeat(300_000);
        let (out, truncated) = clamp_text(text, suffix).unwrap();
        assert!(truncated);
        assert_eq!(out.len(), MAX_RECORD_BYTES);
        assert!(out.ends_with(suffix));
    }

    #[test]
    fn truncation_never_splits_multibyte_characters() {
        // 4-byte scalars so the raw cut point lands mid-character.
        let text: String = std::iter::repeat('\u{1F600}')
            .take(MAX_RECORD_BYTES / 4 + 10)
            .collect();
        let (out, truncated) = clamp_text(text, "...").unwrap();
        assert!(truncated);
        assert!(out.len() <= MAX_RECORD_BYTES);
        // Would panic on a broken boundary.
        let _ = out.chars().count();
    }

    #[test]
    fn truncation_is_idempotent() {
        let suffix = " [TRUNCATED]";
        let text = "y".repeat(MAX_RECORD_BYTES * 2);
        let (once, _) = clamp_text(text, suffix).unwrap();
        let (twice, truncated_again) = clamp_text(once.clone(), suffix).unwrap();
        assert!(!truncated_again);
        assert_eq!(once, twice);
    }

    #[test]
    fn oversized_text_rejected_when_truncation_disabled() {
        let text = "z".repeat(MAX_RECORD_BYTES + 1);
        let err = clamp_text(text, "").unwrap_err();
        assert_eq!(err.max, MAX_RECORD_BYTES);
        assert_eq!(err.len, MAX_RECORD_BYTES + 1);
    }

    #[test]
    fn accounted_bytes_includes_envelope() {
        let record = StreamRecord::new(0, "abcd");
        assert_eq!(record.accounted_bytes(), 4 + RECORD_OVERHEAD_BYTES);
    }
}
