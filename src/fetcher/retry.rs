//! Per-entry retry/backoff.
//!
//! Rate-limited responses are retried until they succeed, sleeping an
//! exponentially growing interval (or the server's `Retry-After`, whichever
//! is larger, capped at `backoff_max`). Every other failure is retried up to
//! `max_retries` attempts with a short fixed pause.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::profile_api::{FetchOutcome, FetchedProfile, ProfileSource};
use crate::types::ProfileApiConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed for non-rate-limit failures.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub error_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ProfileApiConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ProfileApiConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms.max(1)),
            backoff_max: Duration::from_millis(config.backoff_max_ms.max(1)),
            error_delay: Duration::from_millis(config.error_retry_delay_ms),
        }
    }

    /// Sleep before the next rate-limited attempt.
    fn rate_limit_delay(&self, backoff: Duration, retry_after: Option<Duration>) -> Duration {
        let wanted = match retry_after {
            Some(ra) if ra > backoff => ra,
            _ => backoff,
        };
        wanted.min(self.backoff_max)
    }

    fn next_backoff(&self, backoff: Duration) -> Duration {
        backoff.saturating_mul(2).min(self.backoff_max)
    }
}

/// Outcome of [`fetch_with_retry`]. `attempts` counts every API call made,
/// including the one interrupted by cancellation.
#[derive(Debug)]
pub struct RetryResult {
    pub attempts: i64,
    pub result: Result<FetchedProfile, PipelineError>,
}

/// Sleep for `duration` unless `cancel` fires first. Returns false when cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

pub async fn fetch_with_retry(
    source: &dyn ProfileSource,
    identifier: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> RetryResult {
    let mut attempts: i64 = 0;
    let mut failures: u32 = 0;
    let mut backoff = policy.backoff_base.min(policy.backoff_max);

    let cancelled = |attempts| RetryResult {
        attempts,
        result: Err(PipelineError::Cancelled),
    };

    loop {
        if cancel.is_cancelled() {
            return cancelled(attempts);
        }
        attempts += 1;
        log::info!("Fetching {} (attempt {})", identifier, attempts);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(attempts),
            outcome = source.fetch_profile(identifier) => outcome,
        };

        let error = match outcome {
            FetchOutcome::Found(profile) => {
                log::info!("Fetched {} after {} attempt(s)", identifier, attempts);
                return RetryResult {
                    attempts,
                    result: Ok(profile),
                };
            }
            FetchOutcome::RateLimited {
                retry_after,
                message,
            } => {
                let delay = policy.rate_limit_delay(backoff, retry_after);
                log::warn!(
                    "Rate limited fetching {} (attempt {}), sleeping {:?}: {}",
                    identifier,
                    attempts,
                    delay,
                    message
                );
                if !sleep_or_cancel(delay, cancel).await {
                    return cancelled(attempts);
                }
                backoff = policy.next_backoff(backoff);
                continue;
            }
            FetchOutcome::NotFound(message) => PipelineError::NotFound(message),
            FetchOutcome::Failed(message) => PipelineError::Api(message),
        };

        failures += 1;
        log::warn!(
            "Fetching {} failed (error {}/{}): {}",
            identifier,
            failures,
            policy.max_retries,
            error
        );
        if failures >= policy.max_retries {
            return RetryResult {
                attempts,
                result: Err(error),
            };
        }
        if !sleep_or_cancel(policy.error_delay, cancel).await {
            return cancelled(attempts);
        }
    }
}
