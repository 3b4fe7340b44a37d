//! Retryable-error classification
//!
//! Maps transport failures to a retry decision. Connection-level failures
//! with well-known codes and a small set of HTTP statuses are worth another
//! attempt; everything else, including cancellation, fails the request
//! immediately.

use crate::transport::TransportError;

/// Transport codes that indicate a transient connection problem.
pub const RETRYABLE_TRANSPORT_CODES: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ENOTFOUND",
    "EAI_AGAIN",
];

/// Check if an HTTP status is worth retrying.
///
/// 408 (request timeout), 409 (conflict), 429 (rate limited) and the whole
/// 5xx range qualify.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 429) || (500..=599).contains(&status)
}

/// Classify a transport error as retryable or fatal.
pub fn is_retryable_error(error: &TransportError) -> bool {
    if error.cancelled {
        return false;
    }

    if let Some(code) = &error.code {
        return RETRYABLE_TRANSPORT_CODES.contains(&code.as_str());
    }

    if let Some(status) = error.status {
        return is_retryable_status(status);
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_codes() {
        for code in RETRYABLE_TRANSPORT_CODES {
            let err = TransportError::from_code(code, "boom");
            assert!(is_retryable_error(&err), "{} should be retryable", code);
        }

        let err = TransportError::from_code("ECONNABORTED", "aborted");
        assert!(!is_retryable_error(&err));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(408));
        assert!(is_retryable_status(409));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(599));

        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn test_status_errors() {
        let err = TransportError::from_status(503, "Service Unavailable", None);
        assert!(is_retryable_error(&err));

        let err = TransportError::from_status(404, "Not Found", None);
        assert!(!is_retryable_error(&err));
    }

    #[test]
    fn test_cancellation_is_never_retryable() {
        assert!(!is_retryable_error(&TransportError::cancelled()));
    }
}
