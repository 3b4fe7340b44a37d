//! Transport seam between the request engine and the wire
//!
//! The engine never talks HTTP directly. It builds a [`TransportConfig`] and
//! hands it to a [`Transport`] implementation, which either returns a
//! normalized response or an error carrying whatever status/code information
//! the wire produced. Tests substitute scripted transports through the same
//! seam.

mod http;

pub use http::HttpTransport;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// HTTP method subset accepted by the request descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-ready request built from the request descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub method: HttpMethod,

    /// Request path, always beginning with `/`
    pub url: String,

    /// Composed `scheme://host:port` prefix
    pub base_url: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Query parameters appended to the URL
    #[serde(default)]
    pub params: HashMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    pub timeout_ms: u64,
}

impl TransportConfig {
    /// Full URL with query string, used for cache fingerprinting and dispatch.
    pub fn full_url(&self) -> String {
        let mut url = format!("{}{}", self.base_url, self.url);
        if !self.params.is_empty() {
            let mut pairs: Vec<_> = self.params.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }
}

/// Normalized successful response from the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportResponse {
    pub data: Value,
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Failure returned by a transport.
///
/// Carries whatever the wire produced: an HTTP status (non-success response),
/// a transport code (`ECONNRESET`, `ETIMEDOUT`, ...) for connection-level
/// failures, or the cancellation sentinel when the caller's token fired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportError {
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Response body attached to a non-success status, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// True when the caller-provided cancellation token fired
    #[serde(default)]
    pub cancelled: bool,
}

impl TransportError {
    pub fn from_status(status: u16, status_text: &str, data: Option<Value>) -> Self {
        Self {
            message: format!("HTTP {} {}", status, status_text),
            status: Some(status),
            code: None,
            data,
            cancelled: false,
        }
    }

    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: Some(code.to_string()),
            data: None,
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            message: "Request cancelled by caller".to_string(),
            status: None,
            code: None,
            data: None,
            cancelled: true,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TransportError {}

/// One-shot request execution.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute the request, honoring the timeout in the config and the
    /// optional cancellation token.
    async fn execute(
        &self,
        config: &TransportConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_url_composition() {
        let config = TransportConfig {
            method: HttpMethod::Get,
            url: "/v1/items".to_string(),
            base_url: "https://api.example.com:443".to_string(),
            headers: HashMap::new(),
            params: HashMap::from([
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
            ]),
            data: None,
            timeout_ms: 15_000,
        };

        // Params are sorted for a stable URL.
        assert_eq!(
            config.full_url(),
            "https://api.example.com:443/v1/items?a=1&b=2"
        );
    }

    #[test]
    fn test_transport_error_shapes() {
        let err = TransportError::from_status(503, "Service Unavailable", None);
        assert_eq!(err.status, Some(503));
        assert!(!err.cancelled);

        let err = TransportError::from_code("ECONNRESET", "connection reset by peer");
        assert_eq!(err.code.as_deref(), Some("ECONNRESET"));

        let err = TransportError::cancelled();
        assert!(err.cancelled);
        assert_eq!(err.message, "Request cancelled by caller");
    }

    #[test]
    fn test_method_display() {
        assert_eq!(HttpMethod::Get.to_string(), "GET");
        assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
    }
}
