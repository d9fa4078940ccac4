//! Error types for the acquisition pipeline
//!
//! Errors are classified by where they stop work:
//! - Item-level: NotFound, Api, Storage (the run records them and continues)
//! - Run-level: QuotaExceeded, Configuration, Cancelled, RunAborted
//! - Caller-level: AlreadyRunning (another invocation holds the job)

use thiserror::Error;

use crate::blob::BlobError;
use crate::db::{DbError, JobExecution};

/// Error types for quota, fetch, storage and scheduling operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("API quota exceeded ({used}/{limit}). Resumes next month unless the override is enabled")]
    QuotaExceeded { used: i64, limit: i64 },

    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Profile API error: {0}")]
    Api(String),

    #[error("Blob storage error: {0}")]
    Storage(#[from] BlobError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Job '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Run cancelled")]
    Cancelled,

    /// A run stopped before completing normally. The history record written
    /// for it (if any) travels with the error so callers can still inspect it.
    #[error("Job '{job}' aborted: {source}")]
    RunAborted {
        job: String,
        history: Box<JobExecution>,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Returns true if running the same operation later can succeed without
    /// operator intervention
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Api(_)
            | PipelineError::Storage(_)
            | PipelineError::AlreadyRunning(_)
            | PipelineError::Cancelled => true,
            PipelineError::RunAborted { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// History record attached to a run-level abort
    pub fn history(&self) -> Option<&JobExecution> {
        match self {
            PipelineError::RunAborted { history, .. } => Some(history),
            _ => None,
        }
    }

    /// Get an operator-facing recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            PipelineError::QuotaExceeded { .. } => {
                "Wait for the monthly reset, raise the limit, or enable the quota override."
            }
            PipelineError::NotFound(_) => "Check the identifier and re-queue the entry if it was mistyped.",
            PipelineError::Api(_) => "Check the profile API status and credentials, then retry.",
            PipelineError::Storage(_) => "Check blob storage permissions and free space.",
            PipelineError::Database(_) => "Check the database file and its permissions.",
            PipelineError::Configuration(_) => "Fix the job configuration or config.json and reload.",
            PipelineError::AlreadyRunning(_) => "Wait for the current run to finish.",
            PipelineError::Cancelled => "Run the job again; unfinished entries stay pending.",
            PipelineError::RunAborted { source, .. } => source.recovery_suggestion(),
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Database(DbError::Sqlite(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_exceeded_message_includes_counts() {
        let err = PipelineError::QuotaExceeded {
            used: 50_000,
            limit: 50_000,
        };
        assert!(err.to_string().contains("50000/50000"));
        assert!(!err.is_retryable());
    }
}
