//! Shared type definitions for the database layer.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PipelineError;
use crate::types::{EntryStatus, JobStatus, JobType};

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl DbError {
    /// True when SQLite rejected the write because of a UNIQUE/CHECK constraint.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

// -----------------------------------------------------------------------------
// Text mapping for status enums
// -----------------------------------------------------------------------------

impl ToSql for EntryStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EntryStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

// -----------------------------------------------------------------------------
// Rows
// -----------------------------------------------------------------------------

/// A row from the `profile_entries` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbProfileEntry {
    pub id: String,
    /// External identifier (URN or username) sent to the profile API.
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender_hint: Option<String>,
    pub status: EntryStatus,
    /// Cleaned JSON of the last successful fetch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_data: Option<String>,
    pub raw_blob_key: Option<String>,
    pub cleaned_blob_key: Option<String>,
    pub fetch_count: i64,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-status entry counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryStatusCounts {
    pub pending: i64,
    pub fetching: i64,
    pub completed: i64,
    pub failed: i64,
}

impl EntryStatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.fetching + self.completed + self.failed
    }
}

/// A row from the `profiles` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbProfile {
    pub id: String,
    pub urn: String,
    pub entry_id: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub headline: Option<String>,
    pub title: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    /// JSON arrays as stored.
    pub educations: Option<String>,
    pub positions: Option<String>,
    pub skills: Option<String>,
    pub geo_data: Option<String>,
    pub raw_blob_key: Option<String>,
    pub cleaned_blob_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values written by a profile upsert. Row id and timestamps are managed
/// by the database layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpsert {
    pub urn: String,
    pub entry_id: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub headline: Option<String>,
    pub title: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub educations: Option<String>,
    pub positions: Option<String>,
    pub skills: Option<String>,
    pub geo_data: Option<String>,
    pub raw_blob_key: Option<String>,
    pub cleaned_blob_key: Option<String>,
}

/// A row from the `api_quota_tracker` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbQuotaTracker {
    pub id: i64,
    pub month: u32,
    pub year: i32,
    pub call_count: i64,
    pub quota_limit: i64,
    pub quota_exceeded: bool,
    pub override_enabled: bool,
    pub notification_sent: bool,
    pub last_call_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DbQuotaTracker {
    /// Calls left this month, never negative.
    pub fn remaining(&self) -> i64 {
        (self.quota_limit - self.call_count).max(0)
    }

    /// True when no further calls may be made.
    pub fn is_blocked(&self) -> bool {
        self.quota_exceeded && !self.override_enabled
    }
}

/// Result of an atomic call-count increment.
#[derive(Debug, Clone)]
pub struct QuotaIncrement {
    pub tracker: DbQuotaTracker,
    pub was_exceeded: bool,
}

impl QuotaIncrement {
    /// True on the increment that pushed the tracker over its limit.
    pub fn crossed_limit(&self) -> bool {
        !self.was_exceeded && self.tracker.quota_exceeded
    }
}

/// One persisted orchestrator run (`job_execution_history` row plus its
/// linked entry ids).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub id: String,
    pub job_name: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub total_processed: i64,
    pub successful_count: i64,
    pub failed_count: i64,
    pub api_calls_made: i64,
    pub quota_remaining: i64,
    /// Per-item failure messages joined with `"; "`.
    pub error_summary: Option<String>,
    pub duration_seconds: f64,
    /// Entries completed by this run.
    #[serde(default)]
    pub entry_ids: Vec<String>,
}

/// Aggregates over a job's recent runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub job_name: String,
    pub runs: i64,
    pub successful_runs: i64,
    pub partial_runs: i64,
    pub failed_runs: i64,
    pub quota_exceeded_runs: i64,
    pub total_processed: i64,
    pub total_successful: i64,
    pub total_failed: i64,
    pub total_api_calls: i64,
    pub average_duration_seconds: f64,
}

/// A row from the `cron_job_configs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCronJobConfig {
    pub id: String,
    pub job_name: String,
    /// Stored as text; see [`DbCronJobConfig::kind`].
    pub job_type: String,
    /// Five-field cron expression.
    pub schedule: String,
    pub enabled: bool,
    pub batch_size: i64,
    pub respect_quota: bool,
    pub admin_email: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DbCronJobConfig {
    /// Parsed job type. Rows written by other tools may carry types this
    /// build does not know.
    pub fn kind(&self) -> Result<JobType, PipelineError> {
        self.job_type.parse().map_err(|_| {
            PipelineError::Configuration(format!(
                "Unknown job type '{}' for job '{}'",
                self.job_type, self.job_name
            ))
        })
    }
}

/// Administrative edit of a cron job. `None` leaves the column unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobUpdate {
    pub schedule: Option<String>,
    pub enabled: Option<bool>,
    pub batch_size: Option<i64>,
    pub respect_quota: Option<bool>,
    pub admin_email: Option<String>,
}
