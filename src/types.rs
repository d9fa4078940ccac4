use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Job name of the recurring profile fetch.
pub const PROFILE_FETCHER_JOB: &str = "profile_fetcher";

/// Job name of the monthly quota reset.
pub const QUOTA_RESET_JOB: &str = "quota_reset";

/// Default monthly call budget for the profile API.
pub const DEFAULT_MONTHLY_QUOTA: i64 = 50_000;

// =============================================================================
// Configuration
// =============================================================================

/// Process configuration, read once at startup from `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// SQLite database path. Defaults to `~/.profile-harvester/harvester.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    #[serde(default)]
    pub profile_api: ProfileApiConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Profile API connection and retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts allowed for non-rate-limit failures before an entry fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Fixed pause between retries of non-rate-limit failures.
    #[serde(default = "default_error_retry_delay_ms")]
    pub error_retry_delay_ms: u64,
    /// Courtesy pause between consecutive entries of a batch.
    #[serde(default = "default_inter_item_delay_ms")]
    pub inter_item_delay_ms: u64,
}

impl Default for ProfileApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            api_host: default_api_host(),
            api_key: String::new(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            error_retry_delay_ms: default_error_retry_delay_ms(),
            inter_item_delay_ms: default_inter_item_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            monthly_limit: default_monthly_limit(),
        }
    }
}

/// Defaults used when the scheduler seeds missing job configurations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronConfig {
    #[serde(default = "default_fetch_schedule")]
    pub profile_fetcher_schedule: String,
    #[serde(default = "default_reset_schedule")]
    pub quota_reset_schedule: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_true")]
    pub respect_quota: bool,
    /// IANA timezone the cron expressions are evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            profile_fetcher_schedule: default_fetch_schedule(),
            quota_reset_schedule: default_reset_schedule(),
            batch_size: default_batch_size(),
            respect_quota: true,
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobConfig {
    /// Root directory for raw/cleaned payloads. Defaults to `~/.profile-harvester/blobs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    #[serde(default)]
    pub admin_email: String,
    #[serde(default = "default_from_address")]
    pub from_address: String,
    /// HTTP endpoint of the email relay. Notifications are only logged when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
    /// Upper bound on one relay request.
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            admin_email: String::new(),
            from_address: default_from_address(),
            relay_url: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://real-time-people-company-data.p.rapidapi.com/".to_string()
}

fn default_api_host() -> String {
    "real-time-people-company-data.p.rapidapi.com".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_error_retry_delay_ms() -> u64 {
    1_000
}

fn default_inter_item_delay_ms() -> u64 {
    5_000
}

fn default_monthly_limit() -> i64 {
    DEFAULT_MONTHLY_QUOTA
}

fn default_fetch_schedule() -> String {
    "0 2 * * *".to_string()
}

fn default_reset_schedule() -> String {
    "0 0 1 * *".to_string()
}

fn default_batch_size() -> i64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_from_address() -> String {
    "profile-harvester@localhost".to_string()
}

fn default_notify_timeout_secs() -> u64 {
    10
}

// =============================================================================
// Domain enums
// =============================================================================

/// Fetch state of a profile entry.
///
/// `Pending → Fetching → {Completed | Failed}`; failed entries go back to
/// `Pending` only through an operator re-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Fetching,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Fetching => "fetching",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        }
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "fetching" => Ok(EntryStatus::Fetching),
            "completed" => Ok(EntryStatus::Completed),
            "failed" => Ok(EntryStatus::Failed),
            other => Err(format!("unknown entry status: {}", other)),
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of one orchestrator run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Partial,
    Failed,
    QuotaExceeded,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
            JobStatus::QuotaExceeded => "quota_exceeded",
        }
    }

    /// Derive the run status from its terminal counts.
    ///
    /// Stopping early because of quota counts as a failure; a run that never
    /// processed anything because of quota is `QuotaExceeded`.
    pub fn derive(successful: i64, failed: i64, quota_limited: bool) -> Self {
        if successful == 0 && failed > 0 {
            JobStatus::Failed
        } else if successful > 0 && (failed > 0 || quota_limited) {
            JobStatus::Partial
        } else if successful == 0 && quota_limited {
            JobStatus::QuotaExceeded
        } else {
            JobStatus::Success
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(JobStatus::Success),
            "partial" => Ok(JobStatus::Partial),
            "failed" => Ok(JobStatus::Failed),
            "quota_exceeded" => Ok(JobStatus::QuotaExceeded),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation a cron job configuration binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ProfileFetcher,
    QuotaReset,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ProfileFetcher => "profile_fetcher",
            JobType::QuotaReset => "quota_reset",
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profile_fetcher" => Ok(JobType::ProfileFetcher),
            "quota_reset" => Ok(JobType::QuotaReset),
            other => Err(format!("unknown job type: {}", other)),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
