//! HTTP layer: status mapping and the retry loop.
//!
//! This is the only place that interprets status codes. `client/mod.rs`
//! works in terms of [`FetchOutcome`] and typed errors.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Transient failures are retried this many times.
const MAX_RETRIES: u32 = 2;

/// Fixed backoff between retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of a GET (`NotModified` only for 304).
#[derive(Debug)]
pub(crate) enum FetchOutcome {
    NotModified,
    Body {
        bytes: Vec<u8>,
        etag: Option<String>,
    },
}

/// Byte-progress callback, invoked from the fetching task.
pub type ProgressFn = std::sync::Arc<dyn Fn(u64) + Send + Sync>;

/// HTTP backend holding the reqwest client.
#[derive(Debug, Clone)]
pub(crate) struct HttpBackend {
    pub(crate) client: reqwest::Client,
}

impl HttpBackend {
    /// GET with the retry policy: transient errors (connection failures,
    /// 5xx) retried up to [`MAX_RETRIES`] times with a fixed backoff; 4xx is
    /// final.
    pub(crate) async fn get(
        &self,
        url: &str,
        auth_key: Option<&str>,
        etag: Option<&str>,
        progress: Option<&ProgressFn>,
    ) -> Result<FetchOutcome> {
        let mut retries = 0;
        loop {
            match self.get_once(url, auth_key, etag, progress).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && retries < MAX_RETRIES => {
                    retries += 1;
                    warn!(
                        url,
                        error = %e,
                        retry = retries,
                        max_retries = MAX_RETRIES,
                        "retrying request"
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(
        &self,
        url: &str,
        auth_key: Option<&str>,
        etag: Option<&str>,
        progress: Option<&ProgressFn>,
    ) -> Result<FetchOutcome> {
        let mut request = self.client.get(url);

        // The Authorization header is present exactly when the repo has a key.
        if let Some(key) = auth_key {
            request = request.header(AUTHORIZATION, key);
        }
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let mut response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!(url, "not modified (304)");
            return Ok(FetchOutcome::NotModified);
        }

        if status.is_success() {
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(String::from);

            let mut bytes = Vec::new();
            let mut received: u64 = 0;
            while let Some(chunk) = response.chunk().await? {
                received += chunk.len() as u64;
                bytes.extend_from_slice(&chunk);
                if let Some(progress) = progress {
                    progress(received);
                }
            }
            return Ok(FetchOutcome::Body { bytes, etag });
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| status.to_string());

        if status.is_server_error() {
            Err(Error::HttpTransient {
                message: format!("HTTP {}: {}", status.as_u16(), message),
            })
        } else {
            Err(Error::HttpPermanent {
                status: status.as_u16(),
                message,
            })
        }
    }
}
