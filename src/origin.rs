//! Origin fetch adapter.
//!
//! The coordinator depends only on [`OriginFetcher`]. [`HttpOrigin`] is the
//! production implementation: it POSTs the request body to the configured
//! backend with a per-attempt timeout, retrying with [`post_with_retry`]
//! when more than one attempt is configured.

use async_trait::async_trait;
use axum::http::{StatusCode, header};
use bytes::Bytes;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Default number of origin attempts (no retry).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Default backoff between attempts in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 500;

/// Default per-attempt origin timeout. Origin queries can be expensive.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Why an origin fetch produced no usable body.
///
/// `Clone` so a single failed fetch can be handed to every coalesced waiter.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Network-level failure: connect, reset, body read
    #[error("Origin request failed: {0}")]
    Transport(Arc<reqwest::Error>),

    #[error("Origin request timed out")]
    Timeout,

    /// The origin answered, but not with 200
    #[error("Origin returned {0}")]
    Status(StatusCode),

    #[error("Invalid origin URL: {0}")]
    InvalidUrl(String),

    /// The task driving the fetch panicked or was cancelled
    #[error("Origin fetch did not complete: {0}")]
    Interrupted(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::Status(status)
        } else {
            FetchError::Transport(Arc::new(err))
        }
    }
}

/// Narrow contract the coordinator uses to reach the origin.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// POST `body` to `path_and_query` on the origin and return the response body.
    ///
    /// Any status other than 200 is an error, whatever the body holds.
    async fn fetch(&self, path_and_query: &str, body: Bytes) -> Result<Bytes, FetchError>;
}

/// Configuration for [`post_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (minimum 1; 0 is treated as 1).
    pub max_attempts: u32,
    /// Sleep duration between consecutive attempts.
    pub backoff: Duration,
    /// Optional per-request timeout applied to each individual attempt.
    ///
    /// When `None`, the client's own timeout applies.
    pub timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

/// POST a body to a URL with automatic retry and backoff.
///
/// Returns the body of the first 200 response, or the last [`FetchError`]
/// once all attempts are exhausted.
pub async fn post_with_retry(
    client: &Client,
    url: &Url,
    body: Bytes,
    config: &RetryConfig,
) -> Result<Bytes, FetchError> {
    let max_attempts = config.max_attempts.max(1);

    for attempt in 1..max_attempts {
        match post_once(client, url, body.clone(), config.timeout).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                warn!(
                    "Origin POST failed for {} (attempt {}/{}): {}",
                    url, attempt, max_attempts, e
                );
            }
        }

        warn!("Retrying origin POST in {}ms...", config.backoff.as_millis());
        tokio::time::sleep(config.backoff).await;
    }

    // Final attempt: no further retry
    post_once(client, url, body, config.timeout)
        .await
        .inspect_err(|e| {
            warn!(
                "Origin POST failed for {} (attempt {}/{}): {}",
                url, max_attempts, max_attempts, e
            );
        })
}

async fn post_once(
    client: &Client,
    url: &Url,
    body: Bytes,
    timeout: Option<Duration>,
) -> Result<Bytes, FetchError> {
    let mut request = client
        .post(url.clone())
        .header(header::CONTENT_TYPE, "application/json")
        .body(body);
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }

    let response = request.send().await?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(FetchError::Status(status));
    }

    Ok(response.bytes().await?)
}

/// HTTP implementation of [`OriginFetcher`] backed by a pooled reqwest client.
#[derive(Clone, Debug)]
pub struct HttpOrigin {
    client: Client,
    base_url: Url,
    retry: RetryConfig,
}

impl HttpOrigin {
    pub fn new(client: Client, base_url: Url, retry: RetryConfig) -> Self {
        Self {
            client,
            base_url,
            retry,
        }
    }

    /// Resolve a request's path and query against the origin base URL.
    ///
    /// Any path prefix on the base URL is kept.
    pub fn url_for(&self, path_and_query: &str) -> Result<Url, FetchError> {
        let joined = format!(
            "{}{}",
            self.base_url.as_str().trim_end_matches('/'),
            path_and_query
        );
        Url::parse(&joined).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", joined, e)))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl OriginFetcher for HttpOrigin {
    async fn fetch(&self, path_and_query: &str, body: Bytes) -> Result<Bytes, FetchError> {
        let url = self.url_for(path_and_query)?;
        post_with_retry(&self.client, &url, body, &self.retry).await
    }
}
