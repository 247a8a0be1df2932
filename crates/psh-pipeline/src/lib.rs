//! Year scrape orchestration and the multi-year campaign runner.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use psh_core::{ProblemStatement, ScrapingSession, SessionError, SessionStatus};
use psh_extract::{extract_candidates, normalize, synthetic_problem, ExtractContext};
use psh_storage::{PageFetcher, ProblemRepository, SessionClaim};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "psh-pipeline";

/// Explicit pipeline configuration, passed into the orchestrator instead of
/// read from process globals.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub base_url: String,
    /// Target editions, newest first.
    pub years: Vec<i32>,
    /// Pause between candidate normalizations within a year.
    pub candidate_delay: Duration,
    /// Pause between years in a campaign.
    pub year_delay: Duration,
    pub request_timeout: Duration,
    pub max_retries: usize,
    pub user_agent: String,
    /// Below this many valid drafts, the year is topped up with synthetics.
    pub min_valid_count: usize,
    /// Total records a year should end up with when extraction falls short.
    pub target_count: usize,
    /// Completed sessions younger than this are not re-scraped.
    pub freshness: chrono::Duration,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sih.gov.in".to_string(),
            years: (2015..=2025).rev().collect(),
            candidate_delay: Duration::from_millis(50),
            year_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            min_valid_count: 10,
            target_count: 200,
            freshness: chrono::Duration::days(psh_core::DEFAULT_FRESHNESS_DAYS),
        }
    }
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(millis) = env_parse::<u64>("SCRAPING_DELAY") {
            config.candidate_delay = Duration::from_millis(millis);
        }
        if let Some(retries) = env_parse("MAX_RETRIES") {
            config.max_retries = retries;
        }
        if let Ok(agent) = std::env::var("USER_AGENT") {
            config.user_agent = agent;
        }
        if let Some(min_valid) = env_parse("MIN_VALID_COUNT") {
            config.min_valid_count = min_valid;
        }
        if let Some(target) = env_parse("TARGET_COUNT") {
            config.target_count = target;
        }
        config
    }

    pub fn listing_url(&self, year: i32) -> String {
        format!("{}/sih{}PS", self.base_url, year)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    Completed,
    AlreadyScraped,
    Failed,
}

/// Per-year campaign result; failed years carry their error message.
#[derive(Debug, Clone, Serialize)]
pub struct YearOutcome {
    pub year: i32,
    pub status: ScrapeStatus,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl YearOutcome {
    fn completed(year: i32, count: usize) -> Self {
        Self {
            year,
            status: ScrapeStatus::Completed,
            count,
            error: None,
        }
    }

    fn already_scraped(year: i32, count: usize) -> Self {
        Self {
            year,
            status: ScrapeStatus::AlreadyScraped,
            count,
            error: None,
        }
    }

    fn failed(year: i32, error: String) -> Self {
        Self {
            year,
            status: ScrapeStatus::Failed,
            count: 0,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<YearOutcome>,
}

/// Sequential scrape pipeline: one year at a time, one candidate at a time,
/// with explicit pacing toward the listing site.
pub struct ScrapePipeline {
    config: ScrapeConfig,
    repo: Arc<dyn ProblemRepository>,
    fetcher: Arc<dyn PageFetcher>,
}

impl ScrapePipeline {
    pub fn new(
        config: ScrapeConfig,
        repo: Arc<dyn ProblemRepository>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        Self {
            config,
            repo,
            fetcher,
        }
    }

    pub fn config(&self) -> &ScrapeConfig {
        &self.config
    }

    pub async fn session_status(&self) -> Result<Vec<ScrapingSession>> {
        self.repo
            .sessions()
            .await
            .context("listing scraping sessions")
    }

    /// Scrape a single year end to end.
    ///
    /// Recoverable trouble (fetch failure, empty extraction, bad candidates,
    /// individual persistence rejections) never fails the year; only
    /// orchestration-level failures mark the session failed and propagate.
    pub async fn scrape_year(&self, year: i32) -> Result<YearOutcome> {
        let now = Utc::now();
        let metadata = serde_json::json!({
            "userAgent": self.config.user_agent,
            "scrapingDelayMs": self.config.candidate_delay.as_millis() as u64,
            "maxRetries": self.config.max_retries,
        });

        let claim = self
            .repo
            .claim_session(year, now, self.config.freshness, metadata)
            .await
            .context("claiming scraping session")?;

        let mut session = match claim {
            SessionClaim::AlreadyScraped { count } => {
                info!(year, count, "year already scraped and fresh, skipping");
                return Ok(YearOutcome::already_scraped(year, count as usize));
            }
            SessionClaim::Busy => {
                warn!(year, "scrape already in progress for this year");
                return Ok(YearOutcome::failed(
                    year,
                    "scrape already in progress".to_string(),
                ));
            }
            SessionClaim::Claimed(session) => session,
        };

        let url = self.config.listing_url(year);
        session.last_scraped_url = Some(url.clone());

        match self.run_claimed_year(&mut session, year, &url).await {
            Ok(saved) => Ok(YearOutcome::completed(year, saved)),
            Err(err) => {
                session.status = SessionStatus::Failed;
                session.record_error(SessionError {
                    message: format!("{err:#}"),
                    timestamp: Utc::now(),
                    url,
                });
                if let Err(save_err) = self.repo.save_session(session.clone()).await {
                    warn!(year, error = %save_err, "failed to persist failed session");
                }
                Err(err)
            }
        }
    }

    async fn run_claimed_year(
        &self,
        session: &mut ScrapingSession,
        year: i32,
        url: &str,
    ) -> Result<usize> {
        self.repo
            .save_session(session.clone())
            .await
            .context("saving in-progress session")?;

        let problems = self.collect_problems(year, url).await;
        let attempted = problems.len();

        let mut saved = 0usize;
        for problem in problems {
            match self.repo.upsert(problem).await {
                Ok(_) => saved += 1,
                Err(err) => {
                    warn!(year, error = %err, "skipping record that failed to persist");
                    session.record_error(SessionError {
                        message: err.to_string(),
                        timestamp: Utc::now(),
                        url: url.to_string(),
                    });
                }
            }
        }

        session.mark_completed(attempted as u32, saved as u32, Utc::now());
        self.repo
            .save_session(session.clone())
            .await
            .context("saving completed session")?;

        info!(year, attempted, saved, "year scrape completed");
        Ok(saved)
    }

    /// Fetch, extract, and normalize one year's listing, filling with
    /// synthetic records whenever live extraction comes up short.
    async fn collect_problems(&self, year: i32, url: &str) -> Vec<ProblemStatement> {
        let html = match self.fetcher.fetch_listing(url).await {
            Ok(body) => body,
            Err(err) => {
                warn!(year, error = %err, "fetch failed, generating synthetic records");
                return self.synthetic_batch(year, 0);
            }
        };

        let ctx = ExtractContext { year };
        let candidates = match extract_candidates(&html, &ctx) {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(year, error = %err, "extraction cascade failed, generating synthetic records");
                return self.synthetic_batch(year, 0);
            }
        };

        if candidates.is_empty() {
            info!(year, "no candidates in any extraction tier, generating synthetic records");
            return self.synthetic_batch(year, 0);
        }

        let mut problems = Vec::new();
        for (i, candidate) in candidates.iter().enumerate() {
            if let Some(draft) = normalize(candidate, year, i + 1, Utc::now()) {
                problems.push(draft);
            }
            if !self.config.candidate_delay.is_zero() {
                tokio::time::sleep(self.config.candidate_delay).await;
            }
        }

        if problems.len() < self.config.min_valid_count {
            let valid = problems.len();
            info!(
                year,
                valid,
                target = self.config.target_count,
                "too few valid drafts, topping up with synthetic records"
            );
            problems.extend(self.synthetic_batch(year, valid));
        }

        problems
    }

    fn synthetic_batch(&self, year: i32, existing: usize) -> Vec<ProblemStatement> {
        let now = Utc::now();
        (existing + 1..=self.config.target_count)
            .map(|index| synthetic_problem(year, index, now))
            .collect()
    }

    /// Scrape every configured year in order, isolating per-year failures
    /// and pacing between years.
    pub async fn scrape_all_years(&self) -> CampaignSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, years = self.config.years.len(), "starting scrape campaign");

        let mut outcomes = Vec::with_capacity(self.config.years.len());
        let last_year = self.config.years.last().copied();

        for &year in &self.config.years {
            match self.scrape_year(year).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    warn!(year, error = %format!("{err:#}"), "year scrape failed");
                    outcomes.push(YearOutcome::failed(year, format!("{err:#}")));
                }
            }
            if Some(year) != last_year && !self.config.year_delay.is_zero() {
                tokio::time::sleep(self.config.year_delay).await;
            }
        }

        CampaignSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use psh_storage::{FetchError, MemoryRepository, StorageError, UpsertOutcome};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticFetcher {
        body: Option<String>,
        calls: AtomicUsize,
    }

    impl StaticFetcher {
        fn html(body: &str) -> Self {
            Self {
                body: Some(body.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                body: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PageFetcher for StaticFetcher {
        async fn fetch_listing(&self, url: &str) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.body {
                Some(body) => Ok(body.clone()),
                None => Err(FetchError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                }),
            }
        }
    }

    /// Repository wrapper that fails session saves for one year and/or
    /// rejects one title on upsert, to drive the failure paths.
    #[derive(Default)]
    struct FlakyRepository {
        inner: MemoryRepository,
        poison_year: Option<i32>,
        reject_title: Option<String>,
    }

    #[async_trait]
    impl ProblemRepository for FlakyRepository {
        async fn find_by_title_year(
            &self,
            title: &str,
            year: i32,
        ) -> Result<Option<ProblemStatement>, StorageError> {
            self.inner.find_by_title_year(title, year).await
        }

        async fn upsert(&self, draft: ProblemStatement) -> Result<UpsertOutcome, StorageError> {
            if self.reject_title.as_deref() == Some(draft.title.as_str()) {
                return Err(StorageError::Backend("write refused".into()));
            }
            self.inner.upsert(draft).await
        }

        async fn count_by_year(&self, year: i32) -> Result<usize, StorageError> {
            self.inner.count_by_year(year).await
        }

        async fn find_session(&self, year: i32) -> Result<Option<ScrapingSession>, StorageError> {
            self.inner.find_session(year).await
        }

        async fn save_session(&self, session: ScrapingSession) -> Result<(), StorageError> {
            if self.poison_year == Some(session.year) && session.status != SessionStatus::Failed {
                return Err(StorageError::Backend("session store unavailable".into()));
            }
            self.inner.save_session(session).await
        }

        async fn claim_session(
            &self,
            year: i32,
            now: DateTime<Utc>,
            freshness: chrono::Duration,
            metadata: serde_json::Value,
        ) -> Result<psh_storage::SessionClaim, StorageError> {
            self.inner.claim_session(year, now, freshness, metadata).await
        }

        async fn sessions(&self) -> Result<Vec<ScrapingSession>, StorageError> {
            self.inner.sessions().await
        }
    }

    fn test_config(years: Vec<i32>) -> ScrapeConfig {
        ScrapeConfig {
            years,
            candidate_delay: Duration::ZERO,
            year_delay: Duration::ZERO,
            min_valid_count: 10,
            target_count: 200,
            ..ScrapeConfig::default()
        }
    }

    const LISTING_TABLE: &str = r#"
        <html><body><table>
          <tr><th>S.No</th><th>Title</th><th>Desc</th></tr>
          <tr><td>1</td><td>AI Health Monitor</td><td>predicts disease risk using ML models</td></tr>
          <tr><td>2</td><td>Farm Sensor Net</td><td>IoT soil moisture sensing for agriculture</td></tr>
        </table></body></html>
    "#;

    #[tokio::test]
    async fn fetch_failure_fills_year_with_synthetic_records() {
        let repo = Arc::new(MemoryRepository::default());
        let pipeline = ScrapePipeline::new(
            test_config(vec![2024]),
            repo.clone(),
            Arc::new(StaticFetcher::failing()),
        );

        let outcome = pipeline.scrape_year(2024).await.unwrap();
        assert_eq!(outcome.status, ScrapeStatus::Completed);
        assert_eq!(outcome.count, 200);
        // Synthetic titles cycle per category, so the upsert key collapses
        // the 200-record batch to one stored row per category.
        assert_eq!(repo.count_by_year(2024).await.unwrap(), 15);

        let session = repo.find_session(2024).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.total_problems, 200);
        assert_eq!(session.success_count, 200);
    }

    #[tokio::test]
    async fn extraction_empty_document_falls_back_to_target_count() {
        let repo = Arc::new(MemoryRepository::default());
        let pipeline = ScrapePipeline::new(
            test_config(vec![2024]),
            repo.clone(),
            Arc::new(StaticFetcher::html("<html><body><p>nothing here</p></body></html>")),
        );

        let outcome = pipeline.scrape_year(2024).await.unwrap();
        assert_eq!(outcome.status, ScrapeStatus::Completed);
        assert_eq!(outcome.count, 200);

        let session = repo.find_session(2024).await.unwrap().unwrap();
        assert_eq!(session.total_problems, 200);
    }

    #[tokio::test]
    async fn synthetic_batch_problem_ids_are_unique() {
        let pipeline = ScrapePipeline::new(
            test_config(vec![2024]),
            Arc::new(MemoryRepository::default()),
            Arc::new(StaticFetcher::failing()),
        );

        let batch = pipeline.synthetic_batch(2024, 0);
        assert_eq!(batch.len(), 200);
        let ids: HashSet<_> = batch.iter().map(|p| p.problem_id.clone()).collect();
        assert_eq!(ids.len(), 200);
        assert!(batch.iter().all(|p| p.is_persistable()));
    }

    #[tokio::test]
    async fn listing_table_scrape_persists_normalized_drafts() {
        let repo = Arc::new(MemoryRepository::default());
        let config = ScrapeConfig {
            min_valid_count: 2,
            ..test_config(vec![2024])
        };
        let pipeline =
            ScrapePipeline::new(config, repo.clone(), Arc::new(StaticFetcher::html(LISTING_TABLE)));

        let outcome = pipeline.scrape_year(2024).await.unwrap();
        assert_eq!(outcome.status, ScrapeStatus::Completed);
        assert_eq!(outcome.count, 2);

        let health = repo
            .find_by_title_year("AI Health Monitor", 2024)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(health.category, "Healthcare");
        let farm = repo
            .find_by_title_year("Farm Sensor Net", 2024)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(farm.category, "Agriculture");
    }

    #[tokio::test]
    async fn sparse_listing_is_topped_up_with_synthetics() {
        let repo = Arc::new(MemoryRepository::default());
        let config = ScrapeConfig {
            min_valid_count: 10,
            target_count: 20,
            ..test_config(vec![2024])
        };
        let pipeline =
            ScrapePipeline::new(config, repo.clone(), Arc::new(StaticFetcher::html(LISTING_TABLE)));

        let outcome = pipeline.scrape_year(2024).await.unwrap();
        // 2 extracted drafts + 18 synthetic fills.
        assert_eq!(outcome.count, 20);
        assert!(repo
            .find_by_title_year("AI Health Monitor", 2024)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn fresh_completed_year_short_circuits_without_fetching() {
        let repo = Arc::new(MemoryRepository::default());
        let fetcher = Arc::new(StaticFetcher::html(LISTING_TABLE));
        let config = ScrapeConfig {
            min_valid_count: 2,
            ..test_config(vec![2024])
        };
        let pipeline = ScrapePipeline::new(config, repo.clone(), fetcher.clone());

        let first = pipeline.scrape_year(2024).await.unwrap();
        assert_eq!(first.status, ScrapeStatus::Completed);
        assert_eq!(fetcher.call_count(), 1);

        let second = pipeline.scrape_year(2024).await.unwrap();
        assert_eq!(second.status, ScrapeStatus::AlreadyScraped);
        assert_eq!(second.count, 2);
        assert_eq!(fetcher.call_count(), 1, "no network call for a fresh year");
    }

    #[tokio::test]
    async fn rescrape_updates_instead_of_duplicating() {
        let repo = Arc::new(MemoryRepository::default());
        let config = ScrapeConfig {
            min_valid_count: 2,
            freshness: chrono::Duration::zero(),
            ..test_config(vec![2024])
        };
        let pipeline =
            ScrapePipeline::new(config, repo.clone(), Arc::new(StaticFetcher::html(LISTING_TABLE)));

        pipeline.scrape_year(2024).await.unwrap();
        let before = repo
            .find_by_title_year("AI Health Monitor", 2024)
            .await
            .unwrap()
            .unwrap();

        pipeline.scrape_year(2024).await.unwrap();
        assert_eq!(repo.count_by_year(2024).await.unwrap(), 2);
        let after = repo
            .find_by_title_year("AI Health Monitor", 2024)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.problem_id, after.problem_id);
        assert!(after.last_updated >= before.last_updated);
    }

    #[tokio::test]
    async fn record_level_persistence_failure_is_logged_on_the_session() {
        let repo = Arc::new(FlakyRepository {
            reject_title: Some("Farm Sensor Net".to_string()),
            ..FlakyRepository::default()
        });
        let config = ScrapeConfig {
            min_valid_count: 2,
            ..test_config(vec![2024])
        };
        let pipeline =
            ScrapePipeline::new(config, repo.clone(), Arc::new(StaticFetcher::html(LISTING_TABLE)));

        // The rejected record is skipped, not fatal.
        let outcome = pipeline.scrape_year(2024).await.unwrap();
        assert_eq!(outcome.status, ScrapeStatus::Completed);
        assert_eq!(outcome.count, 1);

        let session = repo.find_session(2024).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.total_problems, 2);
        assert_eq!(session.success_count, 1);
        assert_eq!(session.error_count, 1);
        assert_eq!(session.errors.len(), 1);
        assert!(session.errors[0].message.contains("write refused"));
        assert_eq!(session.errors[0].url, "https://sih.gov.in/sih2024PS");
    }

    #[tokio::test]
    async fn in_flight_year_reports_failed_outcome_without_scraping() {
        let repo = Arc::new(MemoryRepository::default());
        let now = Utc::now();
        let claim = repo
            .claim_session(2024, now, chrono::Duration::days(7), serde_json::json!({}))
            .await
            .unwrap();
        assert!(matches!(claim, SessionClaim::Claimed(_)));

        let fetcher = Arc::new(StaticFetcher::html(LISTING_TABLE));
        let pipeline = ScrapePipeline::new(test_config(vec![2024]), repo.clone(), fetcher.clone());
        let outcome = pipeline.scrape_year(2024).await.unwrap();
        assert_eq!(outcome.status, ScrapeStatus::Failed);
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn campaign_isolates_failed_years_and_keeps_order() {
        let repo = Arc::new(FlakyRepository {
            poison_year: Some(2024),
            ..FlakyRepository::default()
        });
        let config = ScrapeConfig {
            min_valid_count: 2,
            ..test_config(vec![2025, 2024, 2023])
        };
        let pipeline =
            ScrapePipeline::new(config, repo.clone(), Arc::new(StaticFetcher::html(LISTING_TABLE)));

        let summary = pipeline.scrape_all_years().await;
        let statuses: Vec<_> = summary.outcomes.iter().map(|o| (o.year, o.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (2025, ScrapeStatus::Completed),
                (2024, ScrapeStatus::Failed),
                (2023, ScrapeStatus::Completed),
            ]
        );
        assert!(summary.outcomes[1].error.is_some());

        // The poisoned year's session records the failure.
        let session = repo.find_session(2024).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.errors.len(), 1);
    }

    #[test]
    fn listing_url_matches_site_convention() {
        let config = ScrapeConfig::default();
        assert_eq!(config.listing_url(2024), "https://sih.gov.in/sih2024PS");
    }

    #[test]
    fn default_years_are_descending_from_2025() {
        let config = ScrapeConfig::default();
        assert_eq!(config.years.first(), Some(&2025));
        assert_eq!(config.years.last(), Some(&2015));
        assert_eq!(config.years.len(), 11);
    }
}
