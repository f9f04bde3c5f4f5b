//! HTTP client for webhook POSTs.
//!
//! Thin wrapper over `reqwest` that sends the frozen request exactly as
//! recorded and maps transport failures onto the delivery error taxonomy.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::error::{DeliveryError, Result};

/// Maximum response bytes read before the connection is dropped.
///
/// Receivers sometimes answer webhooks with entire HTML pages; only a
/// bounded prefix is useful for diagnostics.
const MAX_RESPONSE_BYTES: usize = 8192;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request timeout covering connect, send, and response read.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10) }
    }
}

/// Captured response of a completed POST.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status_code: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Webhook POST client.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl WebhookClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Sends the frozen request. Completing with a non-2xx status is an
    /// `Ok` here; only transport-level failures are errors.
    pub async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &str,
    ) -> Result<WebhookResponse> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                debug!(header = %name, "skipping invalid header name");
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                debug!(header = %name, "skipping invalid header value");
                continue;
            };
            header_map.insert(name, value);
        }

        let response = self
            .http
            .post(url)
            .headers(header_map)
            .body(body.to_owned())
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status_code = response.status().as_u16();
        let body = match response.text().await {
            Ok(text) => truncate_body(&text, MAX_RESPONSE_BYTES),
            Err(e) => {
                debug!(error = %e, "failed to read response body");
                String::new()
            }
        };

        Ok(WebhookResponse { status_code, body })
    }

    fn classify(&self, error: reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            DeliveryError::timeout(self.config.timeout.as_secs())
        } else {
            DeliveryError::network(error.to_string())
        }
    }
}

/// Truncates on a char boundary at or below `max_bytes`.
fn truncate_body(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_owned()
}
