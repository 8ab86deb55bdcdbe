//! JSON HTTP client shared by every built-in adapter.
//!
//! One entry point, [`HttpClient::request`]: retry with exponential backoff
//! on transient failures, a per-attempt timeout, a hard response-size cap,
//! and cooperative cancellation. Non-retryable 4xx responses are returned
//! verbatim so adapters can fold them into provider results.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::{Client, Method};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::LibrariumError;

/// Total attempts per request.
pub const MAX_RETRIES: u32 = 3;

/// Base delay before the second attempt; doubles each retry.
pub const INITIAL_RETRY_DELAY_MS: u64 = 1000;

/// Hard cap on the terminal response body.
pub const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

/// Response body, parsed as JSON when the payload allows it.
#[derive(Debug, Clone)]
pub enum HttpBody {
    Json(Value),
    Text(String),
}

impl HttpBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            HttpBody::Json(v) => Some(v),
            HttpBody::Text(_) => None,
        }
    }

    /// Short excerpt for error messages. Never longer than 200 chars.
    pub fn excerpt(&self) -> String {
        let text = match self {
            HttpBody::Json(v) => v.to_string(),
            HttpBody::Text(t) => t.clone(),
        };
        let trimmed = text.trim();
        if trimmed.chars().count() <= 200 {
            trimmed.to_string()
        } else {
            let cut: String = trimmed.chars().take(200).collect();
            format!("{cut}...")
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub body: HttpBody,
    pub headers: HashMap<String, String>,
    /// Measured for the returned response only, not summed across retries.
    pub duration_ms: u64,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }

    /// Perform a JSON request.
    ///
    /// Retries up to [`MAX_RETRIES`] attempts on network errors, 5xx, and
    /// 429, sleeping `INITIAL_RETRY_DELAY_MS * 2^(attempt-1)` between
    /// attempts. Other 4xx responses are returned verbatim. The timeout is
    /// enforced per attempt; the caller's cancellation signal aborts both
    /// in-flight requests and backoff sleeps.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        body: Option<&Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, LibrariumError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let start = Instant::now();

            let mut req = self.client.request(method.clone(), url).timeout(timeout);
            for (k, v) in headers {
                req = req.header(k, v);
            }
            if let Some(json) = body {
                // .json() sets Content-Type: application/json.
                req = req.json(json);
            }

            let sent = tokio::select! {
                _ = cancel.cancelled() => return Err(LibrariumError::Cancelled),
                result = req.send() => result,
            };

            let response = match sent {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    return Err(LibrariumError::Timeout(start.elapsed().as_millis() as u64));
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        tracing::debug!(url, attempt, "request failed, retrying: {e}");
                        self.backoff(attempt, cancel).await?;
                        continue;
                    }
                    return Err(LibrariumError::Request(e));
                }
            };

            let status = response.status();
            if (status.is_server_error() || status.as_u16() == 429) && attempt < MAX_RETRIES {
                tracing::debug!(url, status = status.as_u16(), attempt, "retryable status");
                self.backoff(attempt, cancel).await?;
                continue;
            }

            let header_map: HashMap<String, String> = response
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )
                })
                .collect();

            let bytes = tokio::select! {
                _ = cancel.cancelled() => return Err(LibrariumError::Cancelled),
                result = response.bytes() => result.map_err(LibrariumError::Request)?,
            };
            if bytes.len() > MAX_RESPONSE_SIZE {
                return Err(LibrariumError::ResponseTooLarge {
                    size: bytes.len(),
                    max: MAX_RESPONSE_SIZE,
                });
            }

            let parsed = match serde_json::from_slice::<Value>(&bytes) {
                Ok(v) => HttpBody::Json(v),
                Err(_) => HttpBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
            };

            return Ok(HttpResponse {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
                body: parsed,
                headers: header_map,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }
    }

    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), LibrariumError> {
        let delay = retry_delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => Err(LibrariumError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Delay before attempt `attempt + 1`: base doubled per completed attempt.
pub fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(INITIAL_RETRY_DELAY_MS << (attempt.saturating_sub(1)))
}
