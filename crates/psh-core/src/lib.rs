//! Core domain model for the problem-statement harvester.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "psh-core";

/// Label prefix for hackathon editions, e.g. `SIH2024`.
pub const EDITION_PREFIX: &str = "SIH";

pub const GENERAL_CATEGORY: &str = "General";
pub const DEFAULT_ORGANIZATION_NAME: &str = "Government of India";
pub const DEFAULT_ORGANIZATION_TYPE: &str = "Government";
pub const DEFAULT_ORGANIZATION_SECTOR: &str = "Public";

/// Completed sessions older than this are eligible for a re-scrape.
pub const DEFAULT_FRESHNESS_DAYS: i64 = 7;

pub fn edition_label(year: i32) -> String {
    format!("{EDITION_PREFIX}{year}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

/// Canonical normalized problem-statement record.
///
/// Serialized camelCase to stay wire-compatible with the export/query API
/// consumers of the original dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemStatement {
    pub problem_id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub year: i32,
    pub edition: String,
    pub organization_name: String,
    pub organization_type: String,
    pub organization_sector: String,
    pub technology: Vec<String>,
    pub domain: Vec<String>,
    pub difficulty: Difficulty,
    pub expected_outcome: String,
    pub constraints: Vec<String>,
    pub resources: Vec<String>,
    pub tags: Vec<String>,
    pub complexity: u8,
    pub estimated_effort: String,
    pub scraped_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ProblemStatement {
    /// Title and description are mandatory; everything else has defaults.
    pub fn is_persistable(&self) -> bool {
        !self.title.trim().is_empty() && !self.description.trim().is_empty()
    }

    /// Flattened text form consumed by the analysis layer.
    pub fn full_text(&self) -> String {
        format!(
            "{}\n{}\nCategory: {}\nOrganization: {}\nYear: {}",
            self.title, self.description, self.category, self.organization_name, self.year
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionError {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub url: String,
}

/// Per-year scrape state machine: pending -> in_progress -> completed | failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapingSession {
    pub year: i32,
    pub edition: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_problems: u32,
    pub success_count: u32,
    pub error_count: u32,
    pub errors: Vec<SessionError>,
    pub last_scraped_url: Option<String>,
    pub metadata: JsonValue,
}

impl ScrapingSession {
    pub fn new(year: i32, now: DateTime<Utc>) -> Self {
        Self {
            year,
            edition: edition_label(year),
            status: SessionStatus::Pending,
            started_at: now,
            completed_at: None,
            total_problems: 0,
            success_count: 0,
            error_count: 0,
            errors: Vec::new(),
            last_scraped_url: None,
            metadata: JsonValue::Null,
        }
    }

    /// A session is stale when it never completed, lacks a completion
    /// timestamp, or completed longer than `freshness` ago.
    pub fn needs_scraping(&self, now: DateTime<Utc>, freshness: Duration) -> bool {
        if self.status != SessionStatus::Completed {
            return true;
        }
        match self.completed_at {
            None => true,
            Some(done) => now - done > freshness,
        }
    }

    pub fn mark_completed(&mut self, total: u32, success: u32, now: DateTime<Utc>) {
        self.status = SessionStatus::Completed;
        self.completed_at = Some(now);
        self.total_problems = total;
        self.success_count = success;
    }

    pub fn record_error(&mut self, error: SessionError) {
        self.error_count += 1;
        self.errors.push(error);
    }
}
