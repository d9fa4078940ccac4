//! Batch fetch orchestrator.
//!
//! One run of [`ProfileFetcher::execute`] reserves quota, pulls a batch of
//! pending entries (oldest first), drives each through
//! fetch → blob upload → profile upsert → completion, and repeats until the
//! queue is empty or quota runs out. The run ends with one
//! `job_execution_history` record.

pub mod extract;
pub mod retry;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;

use crate::blob::{BlobKeys, BlobStore};
use crate::db::{DbCronJobConfig, DbProfileEntry, JobExecution, SharedDb};
use crate::error::PipelineError;
use crate::notification::{notify_quietly, Notification, Notifier};
use crate::profile_api::ProfileSource;
use crate::quota::QuotaManager;
use crate::types::{Config, JobStatus};

use retry::{fetch_with_retry, sleep_or_cancel, RetryPolicy};

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub retry: RetryPolicy,
    /// Courtesy pause between consecutive entries of a batch.
    pub inter_item_delay: Duration,
    /// Timezone used to report the next scheduled run.
    pub timezone: Tz,
    /// A `Fetching` claim not refreshed for this long is treated as
    /// abandoned and handed back to the queue at the next run start.
    pub claim_ttl: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            inter_item_delay: Duration::from_millis(5_000),
            timezone: chrono_tz::UTC,
            claim_ttl: Duration::from_secs(240),
        }
    }
}

impl FetchSettings {
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        Ok(Self {
            retry: RetryPolicy::from_config(&config.profile_api),
            inter_item_delay: Duration::from_millis(config.profile_api.inter_item_delay_ms),
            timezone: crate::scheduler::parse_timezone(&config.cron.timezone)?,
            claim_ttl: claim_ttl(&config.profile_api),
        })
    }

    /// How often a worker refreshes its claim while an entry is in flight.
    fn heartbeat(&self) -> Duration {
        (self.claim_ttl / 4).max(Duration::from_secs(1))
    }
}

/// Twice the longest single wait (request timeout plus backoff ceiling),
/// never below a minute.
fn claim_ttl(api: &crate::types::ProfileApiConfig) -> Duration {
    let longest_wait =
        Duration::from_secs(api.timeout_secs) + Duration::from_millis(api.backoff_max_ms);
    (longest_wait * 2).max(Duration::from_secs(60))
}

/// How an entry is claimed before fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// Batch runs only take `Pending` entries.
    Pending,
    /// Administrative re-fetch takes anything not currently `Fetching`.
    Refetch,
}

enum ItemOutcome {
    Completed,
    Failed(PipelineError),
    /// Another worker holds the entry.
    Skipped,
    Cancelled,
}

struct ItemReport {
    outcome: ItemOutcome,
    attempts: i64,
}

/// Counters accumulated over one run.
struct RunState {
    job_name: String,
    started_at: DateTime<Utc>,
    successful: i64,
    failed: i64,
    api_calls: i64,
    quota_limited: bool,
    cancelled: bool,
    errors: Vec<String>,
    entry_ids: Vec<String>,
}

impl RunState {
    fn new(job_name: &str) -> Self {
        Self {
            job_name: job_name.to_string(),
            started_at: Utc::now(),
            successful: 0,
            failed: 0,
            api_calls: 0,
            quota_limited: false,
            cancelled: false,
            errors: Vec::new(),
            entry_ids: Vec::new(),
        }
    }

    fn processed(&self) -> i64 {
        self.successful + self.failed
    }

    fn into_execution(self, status: JobStatus, quota_remaining: i64) -> JobExecution {
        let completed_at = Utc::now();
        let duration = (completed_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        JobExecution {
            id: uuid::Uuid::new_v4().to_string(),
            status,
            started_at: self.started_at,
            completed_at,
            total_processed: self.successful + self.failed,
            successful_count: self.successful,
            failed_count: self.failed,
            api_calls_made: self.api_calls,
            quota_remaining,
            error_summary: if self.errors.is_empty() {
                None
            } else {
                Some(self.errors.join("; "))
            },
            duration_seconds: duration.max(0.0),
            entry_ids: self.entry_ids,
            job_name: self.job_name,
        }
    }
}

/// Removes the job name from the running set when the run ends.
struct RunGuard<'a> {
    running: &'a parking_lot::Mutex<HashSet<String>>,
    job_name: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.job_name);
    }
}

pub struct ProfileFetcher {
    db: SharedDb,
    source: Arc<dyn ProfileSource>,
    blobs: Arc<dyn BlobStore>,
    quota: Arc<QuotaManager>,
    notifier: Arc<dyn Notifier>,
    settings: FetchSettings,
    running: parking_lot::Mutex<HashSet<String>>,
}

impl ProfileFetcher {
    pub fn new(
        db: SharedDb,
        source: Arc<dyn ProfileSource>,
        blobs: Arc<dyn BlobStore>,
        quota: Arc<QuotaManager>,
        notifier: Arc<dyn Notifier>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            db,
            source,
            blobs,
            quota,
            notifier,
            settings,
            running: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// True while a run of `job_name` is in progress.
    pub fn is_running(&self, job_name: &str) -> bool {
        self.running.lock().contains(job_name)
    }

    fn acquire(&self, job_name: &str) -> Result<RunGuard<'_>, PipelineError> {
        let mut running = self.running.lock();
        if !running.insert(job_name.to_string()) {
            return Err(PipelineError::AlreadyRunning(job_name.to_string()));
        }
        Ok(RunGuard {
            running: &self.running,
            job_name: job_name.to_string(),
        })
    }

    fn load_job_config(&self, job_name: &str) -> Result<DbCronJobConfig, PipelineError> {
        self.db.lock().get_cron_job(job_name)?.ok_or_else(|| {
            PipelineError::Configuration(format!("No cron job configuration for '{}'", job_name))
        })
    }

    /// Run the fetch job named `job_name` to completion.
    ///
    /// Returns the execution record; partial success is not an error. A run
    /// that stops before finishing normally (quota exhausted up front,
    /// cancellation) returns [`PipelineError::RunAborted`] carrying the record.
    pub async fn execute(
        &self,
        job_name: &str,
        cancel: &CancellationToken,
    ) -> Result<JobExecution, PipelineError> {
        self.execute_with(job_name, cancel, |_| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_start` with the job row
    /// once the run holds the single-flight guard. A firing rejected with
    /// `AlreadyRunning` never reaches `on_start`.
    pub async fn execute_with<F>(
        &self,
        job_name: &str,
        cancel: &CancellationToken,
        on_start: F,
    ) -> Result<JobExecution, PipelineError>
    where
        F: FnOnce(&DbCronJobConfig) + Send,
    {
        let _guard = self.acquire(job_name)?;
        let config = self.load_job_config(job_name)?;
        on_start(&config);
        log::info!(
            "Job '{}' started (batch size {}, respect quota {})",
            job_name,
            config.batch_size,
            config.respect_quota
        );

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.settings.claim_ttl)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let released = self.db.lock().release_stale_claims(cutoff)?;
        if released > 0 {
            log::warn!("Released {} abandoned claims left in fetching state", released);
        }

        let mut run = RunState::new(job_name);
        let mut batch_number = 0;

        'outer: loop {
            if cancel.is_cancelled() {
                run.cancelled = true;
                break;
            }

            let allowed = match self.quota.reserve(config.batch_size).await {
                Ok(n) => n,
                Err(e @ PipelineError::QuotaExceeded { .. }) => {
                    if run.processed() == 0 && config.respect_quota {
                        log::warn!("Job '{}' skipped: {}", job_name, e);
                        return Err(self.quota_short_circuit(run, e));
                    }
                    if config.respect_quota {
                        log::warn!("Job '{}' stopping mid-run: {}", job_name, e);
                        run.quota_limited = true;
                        run.errors.push(format!("Stopped due to quota: {}", e));
                        break;
                    }
                    log::warn!("{}; respect_quota is off, continuing", e);
                    config.batch_size
                }
                Err(e) => return Err(e),
            };

            batch_number += 1;
            let batch = self.db.lock().get_pending_entries(allowed)?;
            log::info!(
                "Batch #{}: {} pending entries (allowed {})",
                batch_number,
                batch.len(),
                allowed
            );
            if batch.is_empty() {
                break;
            }

            let last = batch.len() - 1;
            for (i, entry) in batch.iter().enumerate() {
                let report = self.process_entry(entry, Claim::Pending, cancel).await;
                run.api_calls += report.attempts;
                match report.outcome {
                    ItemOutcome::Completed => {
                        run.successful += 1;
                        run.entry_ids.push(entry.id.clone());
                    }
                    ItemOutcome::Failed(e) => {
                        run.failed += 1;
                        run.errors.push(format!("{}: {}", entry.identifier, e));
                    }
                    ItemOutcome::Skipped => {}
                    ItemOutcome::Cancelled => {
                        run.cancelled = true;
                        break 'outer;
                    }
                }
                log::info!(
                    "Batch #{} progress: {}/{} (success {}, failed {})",
                    batch_number,
                    i + 1,
                    batch.len(),
                    run.successful,
                    run.failed
                );

                if i < last && !sleep_or_cancel(self.settings.inter_item_delay, cancel).await {
                    run.cancelled = true;
                    break 'outer;
                }
            }
        }

        self.finish(run, &config).await
    }

    /// Persist the zero-progress quota record and wrap the quota error.
    fn quota_short_circuit(&self, run: RunState, error: PipelineError) -> PipelineError {
        let job = run.job_name.clone();
        let mut history = run.into_execution(JobStatus::QuotaExceeded, self.quota_remaining());
        history.error_summary = Some(error.to_string());
        if let Err(e) = self.db.lock().insert_job_execution(&history) {
            log::warn!("Failed to record quota-exceeded run of '{}': {}", job, e);
        }
        PipelineError::RunAborted {
            job,
            history: Box::new(history),
            source: Box::new(error),
        }
    }

    fn quota_remaining(&self) -> i64 {
        match self.quota.remaining() {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Failed to read remaining quota: {}", e);
                0
            }
        }
    }

    async fn finish(
        &self,
        run: RunState,
        config: &DbCronJobConfig,
    ) -> Result<JobExecution, PipelineError> {
        let status = JobStatus::derive(run.successful, run.failed, run.quota_limited);
        let cancelled = run.cancelled;
        let persist = run.processed() > 0 || run.quota_limited;
        let execution = run.into_execution(status, self.quota_remaining());

        log::info!(
            "Job '{}' finished: {} ({} ok, {} failed, {} API calls{})",
            execution.job_name,
            execution.status,
            execution.successful_count,
            execution.failed_count,
            execution.api_calls_made,
            if cancelled { ", cancelled" } else { "" }
        );

        if persist {
            let stored = self.db.lock().insert_job_execution(&execution);
            match stored {
                Ok(()) => {
                    let next_run_at =
                        crate::scheduler::next_run_time(&config.schedule, self.settings.timezone)
                            .ok()
                            .flatten();
                    notify_quietly(
                        self.notifier.as_ref(),
                        Notification::JobSummary {
                            execution: Box::new(execution.clone()),
                            next_run_at,
                        },
                    )
                    .await;
                }
                Err(e) => log::warn!("Failed to record run of '{}': {}", execution.job_name, e),
            }
        } else {
            log::info!("Nothing to fetch; run not recorded");
        }

        if cancelled {
            return Err(PipelineError::RunAborted {
                job: execution.job_name.clone(),
                history: Box::new(execution),
                source: Box::new(PipelineError::Cancelled),
            });
        }
        Ok(execution)
    }

    /// Re-fetch one entry outside of a batch run. Any status except
    /// `Fetching` is accepted.
    pub async fn fetch_single_entry(
        &self,
        entry_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DbProfileEntry, PipelineError> {
        let entry = self.db.lock().get_profile_entry(entry_id)?.ok_or_else(|| {
            PipelineError::Database(crate::db::DbError::NotFound(format!(
                "profile entry {}",
                entry_id
            )))
        })?;

        let report = self.process_entry(&entry, Claim::Refetch, cancel).await;
        match report.outcome {
            ItemOutcome::Completed => {
                let refreshed = self.db.lock().get_profile_entry(entry_id)?;
                refreshed.ok_or_else(|| {
                    PipelineError::Database(crate::db::DbError::NotFound(format!(
                        "profile entry {}",
                        entry_id
                    )))
                })
            }
            ItemOutcome::Failed(e) => Err(e),
            ItemOutcome::Skipped => Err(PipelineError::AlreadyRunning(format!(
                "fetch of entry {}",
                entry_id
            ))),
            ItemOutcome::Cancelled => Err(PipelineError::Cancelled),
        }
    }

    /// Drive one entry from claim to completion. Every failure after the
    /// claim leaves the entry `Failed` with its message.
    async fn process_entry(
        &self,
        entry: &DbProfileEntry,
        claim: Claim,
        cancel: &CancellationToken,
    ) -> ItemReport {
        let claimed = {
            let db = self.db.lock();
            match claim {
                Claim::Pending => db.claim_profile_entry(&entry.id),
                Claim::Refetch => db.claim_entry_for_refetch(&entry.id),
            }
        };
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                log::info!("Entry {} already claimed, skipping", entry.identifier);
                return ItemReport {
                    outcome: ItemOutcome::Skipped,
                    attempts: 0,
                };
            }
            Err(e) => {
                return ItemReport {
                    outcome: ItemOutcome::Failed(e.into()),
                    attempts: 0,
                }
            }
        }

        let fetched = self.fetch_holding_claim(entry, cancel).await;
        let attempts = fetched.attempts;

        let outcome = match fetched.result {
            Ok(profile) => self.store_profile(entry, profile).await,
            Err(PipelineError::Cancelled) => {
                if let Err(e) = self.db.lock().release_entry_claim(&entry.id) {
                    log::warn!("Failed to release entry {}: {}", entry.identifier, e);
                }
                ItemOutcome::Cancelled
            }
            Err(e) => self.fail_entry(entry, e),
        };
        ItemReport { outcome, attempts }
    }

    /// Run the retrying fetch while periodically refreshing the entry's
    /// claim, so rate-limit waits of any length keep it out of stale recovery.
    async fn fetch_holding_claim(
        &self,
        entry: &DbProfileEntry,
        cancel: &CancellationToken,
    ) -> retry::RetryResult {
        let fetch = fetch_with_retry(
            self.source.as_ref(),
            &entry.identifier,
            &self.settings.retry,
            cancel,
        );
        tokio::pin!(fetch);

        let period = self.settings.heartbeat();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                fetched = &mut fetch => return fetched,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.db.lock().touch_entry_claim(&entry.id) {
                        log::warn!("Failed to refresh claim on {}: {}", entry.identifier, e);
                    }
                }
            }
        }
    }

    async fn store_profile(
        &self,
        entry: &DbProfileEntry,
        fetched: crate::profile_api::FetchedProfile,
    ) -> ItemOutcome {
        if let Err(e) = self.quota.record_calls(1).await {
            log::warn!("Failed to record quota call for {}: {}", entry.identifier, e);
        }

        let keys = BlobKeys::for_fetch(&entry.identifier, Utc::now());
        let cleaned_json = match serde_json::to_string(&extract::cleaned(&fetched.profile)) {
            Ok(json) => json,
            Err(e) => {
                return self.fail_entry(
                    entry,
                    PipelineError::Api(format!("failed to serialize cleaned profile: {}", e)),
                )
            }
        };

        if let Err(e) = self.blobs.put(&keys.raw, fetched.raw).await {
            return self.fail_entry(entry, e.into());
        }
        if let Err(e) = self
            .blobs
            .put(&keys.cleaned, cleaned_json.clone().into_bytes())
            .await
        {
            return self.fail_entry(entry, e.into());
        }

        let row = extract::normalize(
            &entry.identifier,
            &entry.id,
            &fetched.profile,
            &keys.raw,
            &keys.cleaned,
        );
        let db = self.db.lock();
        if let Err(e) = db.upsert_profile(&row) {
            drop(db);
            return self.fail_entry(entry, e.into());
        }
        if let Err(e) = db.mark_entry_completed(&entry.id, &cleaned_json, &keys.raw, &keys.cleaned) {
            log::warn!("Failed to mark {} completed: {}", entry.identifier, e);
        }
        log::info!("Stored profile for {}", entry.identifier);
        ItemOutcome::Completed
    }

    fn fail_entry(&self, entry: &DbProfileEntry, error: PipelineError) -> ItemOutcome {
        log::warn!("Entry {} failed: {}", entry.identifier, error);
        if let Err(e) = self.db.lock().mark_entry_failed(&entry.id, &error.to_string()) {
            log::warn!("Failed to mark {} failed: {}", entry.identifier, e);
        }
        ItemOutcome::Failed(error)
    }
}
