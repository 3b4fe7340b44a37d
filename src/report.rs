//! Attempt results and per-attempt log entries

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The transport failed or returned a non-success status
    HttpError,
    /// The transport succeeded but the response analyzer rejected the payload
    InvalidContent,
}

/// Normalized outcome of a single attempt.
///
/// `ok` means the transport returned a response; the analyzer may still
/// reject it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResult {
    pub ok: bool,
    pub is_retryable: bool,

    /// RFC 3339 timestamp of the attempt's completion
    pub timestamp: String,

    pub execution_time_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    pub from_cache: bool,
}

/// Entry recorded for each failed (or rejected) attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub timestamp: String,

    /// `"i/N"` where `i` is the one-based attempt and `N` the budget
    pub attempt: String,

    pub error: String,

    #[serde(rename = "type")]
    pub kind: ErrorKind,

    pub is_retryable: bool,
    pub execution_time_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// Entry recorded for each accepted attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessLogEntry {
    pub attempt: u32,
    pub timestamp: String,
    pub data: Value,
    pub execution_time_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Truncate a serialized payload for log entries.
pub(crate) fn truncate_for_log(value: &Value, max_chars: usize) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() <= max_chars {
        rendered
    } else {
        let truncated: String = rendered.chars().take(max_chars).collect();
        format!("{}…", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::HttpError).unwrap(),
            "\"HTTP_ERROR\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::InvalidContent).unwrap(),
            "\"INVALID_CONTENT\""
        );
    }

    #[test]
    fn test_truncation() {
        let value = Value::String("a".repeat(50));
        let rendered = truncate_for_log(&value, 10);
        assert_eq!(rendered.chars().count(), 11); // 10 chars + ellipsis

        let small = Value::from(42);
        assert_eq!(truncate_for_log(&small, 100), "42");
    }
}
