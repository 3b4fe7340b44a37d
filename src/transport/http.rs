//! Default `reqwest`-backed transport adapter

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{HttpMethod, Transport, TransportConfig, TransportError, TransportResponse};

/// HTTP transport over a shared `reqwest` client.
///
/// Bodies are decoded as JSON when possible, otherwise kept as a string
/// value. Connection-level failures are normalized to the classic transport
/// codes so the retry classifier can act on them.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn map_error(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::from_code("ETIMEDOUT", err.to_string())
        } else if err.is_connect() {
            TransportError::from_code("ECONNREFUSED", err.to_string())
        } else if err.is_request() {
            TransportError::from_code("ECONNRESET", err.to_string())
        } else {
            TransportError {
                message: err.to_string(),
                status: err.status().map(|s| s.as_u16()),
                code: None,
                data: None,
                cancelled: false,
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        config: &TransportConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<TransportResponse, TransportError> {
        let method = match config.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let url = format!("{}{}", config.base_url, config.url);
        let mut request = self
            .client
            .request(method, url)
            .timeout(Duration::from_millis(config.timeout_ms))
            .query(&config.params);

        for (name, value) in &config.headers {
            request = request.header(name, value);
        }

        if let Some(body) = &config.data {
            request = request.json(body);
        }

        let response = match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(TransportError::cancelled()),
                    res = request.send() => res.map_err(Self::map_error)?,
                }
            }
            None => request.send().await.map_err(Self::map_error)?,
        };

        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or("").to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response.text().await.map_err(Self::map_error)?;
        let data = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));

        if status.is_success() {
            Ok(TransportResponse {
                data,
                status: status.as_u16(),
                status_text,
                headers,
            })
        } else {
            Err(TransportError::from_status(
                status.as_u16(),
                &status_text,
                Some(data),
            ))
        }
    }
}
