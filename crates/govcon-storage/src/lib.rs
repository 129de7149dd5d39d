//! Upstream HTTP fetch utilities and the canonical opportunity store boundary.

pub mod postgres;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub use postgres::PgOpportunityStore;
pub use store::{InMemoryOpportunityStore, OpportunityStore, StoreError};

pub const CRATE_NAME: &str = "govcon-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 12,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Request budget across all sources: `burst` requests immediately, then one
/// more each `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

impl RateLimit {
    /// `None` for zero, which means unlimited.
    pub fn per_minute(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            burst: requests,
            interval: Duration::from_secs(60) / requests,
        })
    }
}

#[derive(Debug)]
struct RequestPacer {
    burst: u32,
    interval: Duration,
    state: Mutex<PacerState>,
}

#[derive(Debug)]
struct PacerState {
    available: u32,
    next_refill: Instant,
}

impl RequestPacer {
    fn new(limit: RateLimit) -> Self {
        let interval = limit.interval.max(Duration::from_millis(1));
        Self {
            burst: limit.burst.max(1),
            interval,
            state: Mutex::new(PacerState {
                available: limit.burst.max(1),
                next_refill: Instant::now() + interval,
            }),
        }
    }

    /// Waits until a request slot is free and takes it.
    async fn acquire(&self) {
        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if now >= state.next_refill {
                    let missed = (now - state.next_refill).as_nanos() / self.interval.as_nanos();
                    let refills = u32::try_from(missed + 1).unwrap_or(u32::MAX);
                    state.available = state.available.saturating_add(refills).min(self.burst);
                    state.next_refill = if refills >= self.burst {
                        now + self.interval
                    } else {
                        state.next_refill + self.interval * refills
                    };
                }
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                state.next_refill
            };
            tokio::time::sleep_until(wake_at).await;
        }
    }
}

/// Shared upstream client. Every source adapter goes through one instance so
/// the global and per-source limits hold across concurrent partitions.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client limiter closed")]
    LimiterClosed,
}

impl HttpError {
    /// True for 401/403 responses, which retrying will not fix.
    pub fn is_auth(&self) -> bool {
        matches!(self, HttpError::HttpStatus { status: 401 | 403, .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, HttpError::HttpStatus { status: 429, .. })
    }
}

/// Drops the query string so API keys never reach logs or error messages.
pub fn redact_url(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            pacer: config.rate_limit.map(RequestPacer::new),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GETs `url` with `query` appended as encoded parameters.
    pub async fn get_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<u8>, HttpError> {
        self.execute(run_id, source_id, url, || self.client.get(url).query(query))
            .await
    }

    pub async fn post_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<Vec<u8>, HttpError> {
        self.execute(run_id, source_id, url, || self.client.post(url).json(body))
            .await
    }

    async fn execute<F>(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        build: F,
    ) -> Result<Vec<u8>, HttpError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| HttpError::LimiterClosed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| HttpError::LimiterClosed)?;

        if let Some(pacer) = &self.pacer {
            pacer.acquire().await;
        }

        let span = info_span!("http_fetch", %run_id, source_id, url = redact_url(url));
        self.send_with_retries(build).instrument(span).await
    }

    async fn send_with_retries<F>(&self, build: F) -> Result<Vec<u8>, HttpError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|err| HttpError::Request(err.without_url()))?;
                        return Ok(body.to_vec());
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(status = status.as_u16(), attempt, "retrying upstream request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: redact_url(resp.url().as_str()).to_string(),
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(HttpError::Request(err.without_url()));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(HttpError::Request(err.without_url())),
            None => Err(HttpError::LimiterClosed),
        }
    }
}
