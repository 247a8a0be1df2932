//! Persistence contracts, the in-memory repository, and the HTTP fetch
//! client used by the scrape pipeline.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psh_core::{ProblemStatement, ScrapingSession, SessionStatus};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span};

pub const CRATE_NAME: &str = "psh-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record rejected: {0}")]
    InvalidRecord(String),
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Outcome of an atomic session claim for a year.
///
/// The freshness check and the transition to `in_progress` happen in one
/// guarded step so two concurrent campaigns cannot both scrape the same year.
#[derive(Debug, Clone)]
pub enum SessionClaim {
    Claimed(ScrapingSession),
    AlreadyScraped { count: u32 },
    Busy,
}

/// Upsert-by-natural-key storage consumed by the pipeline. The natural key
/// for problem records is `(title, year)`.
#[async_trait]
pub trait ProblemRepository: Send + Sync {
    async fn find_by_title_year(
        &self,
        title: &str,
        year: i32,
    ) -> Result<Option<ProblemStatement>, StorageError>;

    async fn upsert(&self, draft: ProblemStatement) -> Result<UpsertOutcome, StorageError>;

    async fn count_by_year(&self, year: i32) -> Result<usize, StorageError>;

    async fn find_session(&self, year: i32) -> Result<Option<ScrapingSession>, StorageError>;

    async fn save_session(&self, session: ScrapingSession) -> Result<(), StorageError>;

    /// Claim the year for scraping: returns the stored count when the session
    /// is completed and fresh, `Busy` when another scrape is in flight, and
    /// otherwise transitions the session to `in_progress` and returns it.
    /// An `in_progress` claim whose `started_at` is older than the freshness
    /// window counts as abandoned and is reclaimed.
    async fn claim_session(
        &self,
        year: i32,
        now: DateTime<Utc>,
        freshness: chrono::Duration,
        metadata: serde_json::Value,
    ) -> Result<SessionClaim, StorageError>;

    async fn sessions(&self) -> Result<Vec<ScrapingSession>, StorageError>;
}

/// In-memory persistence strategy: the single mutex makes `claim_session`
/// atomic, and it doubles as the test double for the pipeline and web crates.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    problems: HashMap<(String, i32), ProblemStatement>,
    sessions: HashMap<i32, ScrapingSession>,
}

#[async_trait]
impl ProblemRepository for MemoryRepository {
    async fn find_by_title_year(
        &self,
        title: &str,
        year: i32,
    ) -> Result<Option<ProblemStatement>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.problems.get(&(title.to_string(), year)).cloned())
    }

    async fn upsert(&self, draft: ProblemStatement) -> Result<UpsertOutcome, StorageError> {
        if !draft.is_persistable() {
            return Err(StorageError::InvalidRecord(
                "empty title or description".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        let key = (draft.title.clone(), draft.year);
        match inner.problems.get_mut(&key) {
            Some(existing) => {
                // Repeat scrapes update in place, keeping the first-seen
                // identity and scrape timestamp.
                let problem_id = existing.problem_id.clone();
                let scraped_at = existing.scraped_at;
                *existing = draft;
                existing.problem_id = problem_id;
                existing.scraped_at = scraped_at;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                inner.problems.insert(key, draft);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn count_by_year(&self, year: i32) -> Result<usize, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.problems.keys().filter(|(_, y)| *y == year).count())
    }

    async fn find_session(&self, year: i32) -> Result<Option<ScrapingSession>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.sessions.get(&year).cloned())
    }

    async fn save_session(&self, session: ScrapingSession) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(session.year, session);
        Ok(())
    }

    async fn claim_session(
        &self,
        year: i32,
        now: DateTime<Utc>,
        freshness: chrono::Duration,
        metadata: serde_json::Value,
    ) -> Result<SessionClaim, StorageError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.sessions.get(&year) {
            // In-flight claims block until they age past the freshness
            // window, after which they count as abandoned.
            if existing.status == SessionStatus::InProgress
                && now - existing.started_at <= freshness
            {
                return Ok(SessionClaim::Busy);
            }
            if !existing.needs_scraping(now, freshness) {
                return Ok(SessionClaim::AlreadyScraped {
                    count: existing.total_problems,
                });
            }
        }
        let mut session = inner
            .sessions
            .remove(&year)
            .unwrap_or_else(|| ScrapingSession::new(year, now));
        session.status = SessionStatus::InProgress;
        session.started_at = now;
        session.completed_at = None;
        session.metadata = metadata;
        inner.sessions.insert(year, session.clone());
        debug!(year, "claimed scraping session");
        Ok(SessionClaim::Claimed(session))
    }

    async fn sessions(&self) -> Result<Vec<ScrapingSession>, StorageError> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<_> = inner.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.year));
        Ok(sessions)
    }
}

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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Listing-page fetch seam; the pipeline only needs the response body.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_listing(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        // Browser-typical headers; the listing site drops requests that look
        // like headless traffic.
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        headers.insert(
            "Upgrade-Insecure-Requests",
            HeaderValue::from_static("1"),
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_listing(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("fetch_listing", url);
        let _guard = span.enter();

        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
