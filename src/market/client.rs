// =============================================================================
// Market Data Client — Snapshot fetches with retry, backoff and jitter
// =============================================================================
//
// Thin adapter over the upstream market-data REST API.  One call fetches the
// current snapshot of the top assets (price, market cap, volume, percentage
// changes) as a verbatim body; normalization happens downstream.
//
// Failure classification:
//   Transient — HTTP 429, any 5xx, connect errors, timeouts.  Retried here
//               with exponential backoff plus jitter, up to a bounded number
//               of attempts.
//   Fatal     — any other non-success status, a body that is not valid JSON,
//               or an exhausted retry budget.  Never retried.
//
// SECURITY: The API key is resolved from the environment at construction and
// sent as a header; it is never logged or serialized.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::{ApiConfig, RetryConfig};

/// Longest upstream error-body fragment carried into error messages.
const BODY_SNIPPET_CHARS: usize = 200;

// =============================================================================
// Errors
// =============================================================================

/// Failure of a snapshot fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Retryable upstream condition; the same request may succeed shortly.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Non-retryable condition; repeating the same request cannot help.
    #[error("fatal upstream failure: {0}")]
    Fatal(String),
}

impl FetchError {
    /// Test-side classification check; production code matches on the
    /// variants directly.
    #[cfg(test)]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Verbatim upstream response body plus fetch metadata.
#[derive(Debug, Clone)]
pub struct RawPayload {
    /// Exact response body as received (persisted byte-for-byte downstream).
    pub body: String,

    /// Instant the snapshot was fetched; every derived record observes this
    /// timestamp and lands in the partition it falls into.
    pub fetched_at: DateTime<Utc>,

    /// Upstream request id when the API returned one, otherwise a fresh UUID.
    pub source_request_id: String,
}

/// Source of market snapshots.
///
/// The ingestor is written against this trait so tests can drive it with
/// deterministic fetchers instead of the network.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<RawPayload, FetchError>;
}

// =============================================================================
// MarketClient
// =============================================================================

/// REST client for the snapshot endpoint.
#[derive(Clone)]
pub struct MarketClient {
    api: ApiConfig,
    retry: RetryConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl MarketClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `MarketClient`.
    ///
    /// The API key is read from the env var named in `api.api_key_env`; a
    /// missing or empty key means unauthenticated requests (the public tier).
    pub fn new(api: ApiConfig, retry: RetryConfig) -> Self {
        let api_key = std::env::var(&api.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());

        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(key) = &api_key {
            if let (Ok(name), Ok(val)) = (
                api.api_key_header.parse::<HeaderName>(),
                HeaderValue::from_str(key),
            ) {
                default_headers.insert(name, val);
            } else {
                warn!(header = %api.api_key_header, "could not attach API key header");
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(retry.request_timeout_secs))
            .build()
            .expect("failed to build reqwest client");

        debug!(
            endpoint = %api.endpoint,
            authenticated = api_key.is_some(),
            "MarketClient initialised"
        );

        Self {
            api,
            retry,
            api_key,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Fetching
    // -------------------------------------------------------------------------

    /// Full snapshot URL with query parameters from config.
    fn snapshot_url(&self) -> String {
        format!(
            "{}?vs_currency={}&order={}&per_page={}&page={}&price_change_percentage={}",
            self.api.endpoint,
            self.api.vs_currency,
            self.api.order,
            self.api.per_page,
            self.api.page,
            self.api.price_change_windows
        )
    }

    /// Single fetch attempt with transient/fatal classification.
    async fn fetch_once(&self) -> Result<RawPayload, FetchError> {
        let url = self.snapshot_url();

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = resp.status();
        let request_id = resp
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let fetched_at = Utc::now();

        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        // The body is archived verbatim, so this is the only place malformed
        // payloads can be caught before they reach storage.
        if let Err(e) = serde_json::from_str::<serde_json::Value>(&body) {
            return Err(FetchError::Fatal(format!(
                "response body is not valid JSON: {e}"
            )));
        }

        Ok(RawPayload {
            body,
            fetched_at,
            source_request_id: request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        })
    }
}

#[async_trait]
impl SnapshotFetcher for MarketClient {
    #[instrument(skip(self), name = "market::fetch_snapshot")]
    async fn fetch_snapshot(&self) -> Result<RawPayload, FetchError> {
        fetch_with_retry(&self.retry, || self.fetch_once()).await
    }
}

impl std::fmt::Debug for MarketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketClient")
            .field("endpoint", &self.api.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// =============================================================================
// Retry loop
// =============================================================================

/// Drive `attempt_fn` until it succeeds, fails fatally, or the retry budget
/// is exhausted (which escalates the last transient failure to fatal).
pub async fn fetch_with_retry<T, F, Fut>(
    retry: &RetryConfig,
    mut attempt_fn: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut failures = 0u32;
    loop {
        match attempt_fn().await {
            Ok(value) => {
                if failures > 0 {
                    debug!(retries = failures, "snapshot fetched after retries");
                }
                return Ok(value);
            }
            Err(FetchError::Fatal(msg)) => return Err(FetchError::Fatal(msg)),
            Err(FetchError::Transient(msg)) => {
                failures += 1;
                if failures >= retry.max_attempts {
                    warn!(
                        attempts = failures,
                        reason = %msg,
                        "retry budget exhausted"
                    );
                    return Err(FetchError::Fatal(format!(
                        "transient failures exhausted {} attempts, last: {msg}",
                        retry.max_attempts
                    )));
                }
                let delay = backoff_delay(retry, failures);
                warn!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    reason = %msg,
                    "transient fetch failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Backoff before jitter for the nth consecutive transient failure (1-based):
/// `base * 2^(n-1)` capped at the configured maximum.
fn backoff_base_ms(retry: &RetryConfig, failures: u32) -> u64 {
    let exp = failures.saturating_sub(1).min(16);
    retry
        .base_delay_ms
        .saturating_mul(1u64 << exp)
        .min(retry.max_delay_ms)
}

/// Full backoff delay: capped exponential base plus uniform jitter of up to
/// a quarter of the base, so synchronized schedulers fan out.
fn backoff_delay(retry: &RetryConfig, failures: u32) -> Duration {
    let base = backoff_base_ms(retry, failures);
    let jitter = if base == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=base / 4)
    };
    Duration::from_millis(base.saturating_add(jitter))
}

// =============================================================================
// Classification helpers
// =============================================================================

/// Map an HTTP status outside 2xx to a fetch error.
fn classify_status(status: StatusCode, body: &str) -> FetchError {
    let snippet: String = body.chars().take(BODY_SNIPPET_CHARS).collect();
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        FetchError::Transient(format!("upstream returned {status}: {snippet}"))
    } else {
        FetchError::Fatal(format!("upstream returned {status}: {snippet}"))
    }
}

/// Map a reqwest transport error to a fetch error.  Connect failures and
/// timeouts are transient; a request that could not even be built is fatal.
fn classify_request_error(err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::Fatal(format!("failed to build snapshot request: {err}"))
    } else {
        FetchError::Transient(format!("snapshot request failed: {err}"))
    }
}
