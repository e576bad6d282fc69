//! Paced, retrying HTTP client for the Cinepoint BFF API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::NaiveDate;
use cinepoint_core::{truncate_on_char_boundary, Period, ERROR_BODY_LIMIT};
use reqwest::header::ACCEPT;
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "cinepoint-upstream";
pub const DEFAULT_BASE_URL: &str = "https://cinepoint.com/bff/v1";
pub const DEFAULT_USER_AGENT: &str = "CineRadar-Spider/1.0";
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only throttling is retried; every other non-2xx is a caller or upstream fault.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts per fetch, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay slept before retry number `attempt_index` (1 for the first retry).
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Enforces a minimum gap between consecutive request starts.
///
/// One pacer per client gives per-instance pacing; sharing an `Arc<RequestPacer>`
/// between clients paces all of them as one.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Sleeps out the remainder of the floor, then claims the current instant.
    /// Returns how long the caller waited.
    pub async fn wait_turn(&self) -> Duration {
        let mut last = self.last_request.lock().await;
        let mut waited = Duration::ZERO;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                waited = self.min_interval - elapsed;
                tokio::time::sleep(waited).await;
            }
        }
        *last = Some(Instant::now());
        waited
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Quota limiter that can be injected into several clients at once.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis().max(1)) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill += self.refill_every.saturating_mul(refills);
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(state.last_refill.elapsed());
            drop(state);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub access_token: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub min_interval: Duration,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl UpstreamConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            access_token: access_token.into(),
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            min_interval: DEFAULT_MIN_INTERVAL,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited by upstream after {attempts} attempts: {url}")]
    RateLimited { url: String, attempts: usize },
    #[error("upstream returned http {status} for {url}: {body}")]
    Upstream {
        status: u16,
        url: String,
        body: String,
    },
    #[error("network failure after {attempts} attempts for {url}: {source}")]
    Network {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("upstream body for {url} is not json: {source}")]
    InvalidBody {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::Upstream { .. } | FetchError::InvalidBody { .. } => "upstream",
            FetchError::Network { .. } => "network",
        }
    }

    /// True for errors the client already retried before giving up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. } | FetchError::Network { .. })
    }
}

#[derive(Debug)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    pacer: Arc<RequestPacer>,
    quota: Option<Arc<TokenBucket>>,
    backoff: BackoffPolicy,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> anyhow::Result<Self> {
        if config.access_token.trim().is_empty() {
            bail!("CINEPOINT_ACCESS_TOKEN is required");
        }

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token,
            pacer: Arc::new(RequestPacer::new(config.min_interval)),
            quota: config.token_bucket.map(|c| Arc::new(TokenBucket::new(c))),
            backoff: config.backoff,
        })
    }

    /// Replaces the per-instance pacer with one shared across clients.
    pub fn with_shared_pacer(mut self, pacer: Arc<RequestPacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_quota(mut self, bucket: Arc<TokenBucket>) -> Self {
        self.quota = Some(bucket);
        self
    }

    pub fn pacer(&self) -> Arc<RequestPacer> {
        Arc::clone(&self.pacer)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// GETs `endpoint` (relative to the base url) and returns the JSON body.
    pub async fn fetch(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let span = info_span!("upstream_fetch", endpoint);
        self.fetch_with_retries(url, params).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: String,
        params: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0usize;

        loop {
            if attempt > 0 {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(
                    retry = attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }

            if let Some(bucket) = &self.quota {
                bucket.take().await;
            }
            self.pacer.wait_turn().await;
            attempt += 1;

            debug!(attempt, %url, ?params, "GET");
            let sent = self
                .client
                .get(&url)
                .query(params)
                .bearer_auth(&self.access_token)
                .header(ACCEPT, "application/json")
                .send()
                .await;

            let resp = match sent {
                Ok(resp) => resp,
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < max_attempts
                    {
                        warn!(attempt, error = %err, "request failed, will retry");
                        continue;
                    }
                    return Err(FetchError::Network {
                        url,
                        attempts: attempt,
                        source: err,
                    });
                }
            };

            let status = resp.status();
            if status.is_success() {
                match resp.bytes().await {
                    Ok(body) => {
                        return serde_json::from_slice(&body)
                            .map_err(|source| FetchError::InvalidBody { url, source });
                    }
                    Err(err) => {
                        if attempt < max_attempts {
                            warn!(attempt, error = %err, "reading body failed, will retry");
                            continue;
                        }
                        return Err(FetchError::Network {
                            url,
                            attempts: attempt,
                            source: err,
                        });
                    }
                }
            }

            if classify_status(status) == RetryDisposition::Retryable {
                if attempt < max_attempts {
                    warn!(attempt, "rate limited (429), will retry");
                    continue;
                }
                return Err(FetchError::RateLimited {
                    url,
                    attempts: attempt,
                });
            }

            let mut body = resp.text().await.unwrap_or_default();
            truncate_on_char_boundary(&mut body, ERROR_BODY_LIMIT);
            return Err(FetchError::Upstream {
                status: status.as_u16(),
                url,
                body,
            });
        }
    }

    pub async fn movie_directory(
        &self,
        page: u32,
        limit: u32,
        status: Option<&str>,
    ) -> Result<JsonValue, FetchError> {
        let mut params = vec![("page", page.to_string()), ("limit", limit.to_string())];
        if let Some(status) = status {
            params.push(("status", status.to_string()));
        }
        self.fetch("/movies/directory", &params).await
    }

    pub async fn movie_detail(&self, movie_id: i64) -> Result<JsonValue, FetchError> {
        self.fetch(&format!("/movies/directory/detail/{movie_id}"), &[])
            .await
    }

    pub async fn daily_showtime(
        &self,
        date_end: NaiveDate,
        page: u32,
        limit: u32,
    ) -> Result<JsonValue, FetchError> {
        self.fetch(
            "/movies/daily-showtime",
            &[
                ("date_end", date_end.to_string()),
                ("page", page.to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    pub async fn showtime_graph(
        &self,
        movie_ids: &[i64],
        date_end: NaiveDate,
    ) -> Result<JsonValue, FetchError> {
        let ids = movie_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.fetch(
            "/movies/daily-showtime/graph",
            &[("movie_ids", ids), ("date_end", date_end.to_string())],
        )
        .await
    }

    /// Box-office ranking page for one reporting date and period.
    pub async fn box_office(
        &self,
        date_end: NaiveDate,
        period: Period,
        page: u32,
        limit: u32,
    ) -> Result<JsonValue, FetchError> {
        self.fetch(
            "/home/box-office/daily",
            &[
                ("page", page.to_string()),
                ("limit", limit.to_string()),
                ("type", "all".to_string()),
                ("date_end", date_end.to_string()),
                ("period", period.to_string()),
            ],
        )
        .await
    }

    pub async fn box_office_detail(
        &self,
        movie_id: i64,
        period: Period,
    ) -> Result<JsonValue, FetchError> {
        self.fetch(
            &format!("/movies/top-box-office/{period}/detail"),
            &[("movie_id", movie_id.to_string())],
        )
        .await
    }

    pub async fn insights(&self, page: u32, limit: u32) -> Result<JsonValue, FetchError> {
        self.fetch(
            "/insights",
            &[("page", page.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    pub async fn insight_detail(&self, slug: &str) -> Result<JsonValue, FetchError> {
        self.fetch(&format!("/insights/{}", encode_path_segment(slug)), &[])
            .await
    }
}

fn encode_path_segment(segment: &str) -> String {
    let Ok(mut url) = Url::parse("http://segment.invalid/") else {
        return segment.to_string();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.push(segment);
    }
    url.path().trim_start_matches('/').to_string()
}
