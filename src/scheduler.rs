//! Cron scheduler for the harvester jobs
//!
//! Each enabled `cron_job_configs` row gets one timer task. The task sleeps
//! until the next fire time of the row's schedule (evaluated in the
//! configured timezone), records last/next run on the row, and invokes the
//! job inline, so firings of one job never overlap.
//!
//! Supports:
//! - Default job rows created on first start
//! - Live reload of a single job after an administrative edit
//! - Manual triggers through the orchestrator's single-flight guard
//! - Graceful stop that cancels in-flight runs and waits for them

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::{CronJobUpdate, DbCronJobConfig, JobExecution, SharedDb};
use crate::error::PipelineError;
use crate::fetcher::ProfileFetcher;
use crate::quota::QuotaManager;
use crate::types::{CronConfig, JobType, PROFILE_FETCHER_JOB, QUOTA_RESET_JOB};

/// Parse a five-field cron expression (`min hour dom month dow`).
pub fn parse_cron(expr: &str) -> Result<Schedule, PipelineError> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(PipelineError::Configuration(format!(
            "Invalid cron expression '{}': expected 5 fields, found {}",
            expr, fields
        )));
    }

    // The cron crate wants a leading seconds field
    let full_expr = format!("0 {}", expr);

    full_expr.parse::<Schedule>().map_err(|e| {
        PipelineError::Configuration(format!("Invalid cron expression '{}': {}", expr, e))
    })
}

pub fn parse_timezone(name: &str) -> Result<Tz, PipelineError> {
    name.parse::<Tz>()
        .map_err(|_| PipelineError::Configuration(format!("Invalid timezone: {}", name)))
}

/// Next fire time of `expr` in `tz`, or `None` if the schedule never fires again.
pub fn next_run_time(expr: &str, tz: Tz) -> Result<Option<DateTime<Utc>>, PipelineError> {
    let schedule = parse_cron(expr)?;
    Ok(schedule.upcoming(tz).next().map(|t| t.with_timezone(&Utc)))
}

/// Snapshot of an active trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredJob {
    pub job_name: String,
    pub job_type: JobType,
    pub schedule: String,
    pub next_run_at: Option<DateTime<Utc>>,
}

struct JobHandle {
    job_type: JobType,
    schedule: String,
    timer: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything a timer task needs to run a job.
struct JobRunner {
    db: SharedDb,
    fetcher: Arc<ProfileFetcher>,
    quota: Arc<QuotaManager>,
    timezone: Tz,
}

impl JobRunner {
    /// Invoke the bound operation, recording last/next run on the config row
    /// once the run actually starts. Quota resets produce no execution record.
    async fn run(
        &self,
        job_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<JobExecution>, PipelineError> {
        let config = self.db.lock().get_cron_job(job_name)?.ok_or_else(|| {
            PipelineError::Configuration(format!("No cron job configuration for '{}'", job_name))
        })?;

        match config.kind()? {
            JobType::ProfileFetcher => self
                .fetcher
                .execute_with(job_name, cancel, |started| {
                    self.record_run(job_name, &started.schedule)
                })
                .await
                .map(Some),
            JobType::QuotaReset => {
                self.record_run(job_name, &config.schedule);
                self.quota.reset_monthly().await.map(|_| None)
            }
        }
    }

    fn record_run(&self, job_name: &str, schedule: &str) {
        let next = next_run_time(schedule, self.timezone).unwrap_or_else(|e| {
            log::warn!("Cannot compute next run of '{}': {}", job_name, e);
            None
        });
        if let Err(e) = self
            .db
            .lock()
            .update_cron_run_times(job_name, Utc::now(), next)
        {
            log::warn!("Failed to record run time of '{}': {}", job_name, e);
        }
    }

    async fn run_scheduled(&self, job_name: &str, cancel: &CancellationToken) {
        log::info!("Scheduled run of '{}' starting", job_name);
        match self.run(job_name, cancel).await {
            Ok(Some(execution)) => log::info!(
                "Scheduled run of '{}' finished: {} ({} processed)",
                job_name,
                execution.status,
                execution.total_processed
            ),
            Ok(None) => log::info!("Scheduled run of '{}' finished", job_name),
            Err(PipelineError::AlreadyRunning(_)) => {
                log::info!("'{}' is already running, skipping this firing", job_name)
            }
            Err(e) => log::warn!("Scheduled run of '{}' failed: {}", job_name, e),
        }
    }
}

/// Sleep until each fire time, then run the job. Exits when `timer` is
/// cancelled; an in-flight run only stops on `shutdown`.
async fn trigger_loop(
    runner: Arc<JobRunner>,
    job_name: String,
    schedule: Schedule,
    timer: CancellationToken,
    shutdown: CancellationToken,
) {
    let mut last_fire: Option<DateTime<Utc>> = None;
    loop {
        let now = Utc::now();
        let from = match last_fire {
            Some(fired) if fired > now => fired,
            _ => now,
        };
        let Some(next) = schedule
            .after(&from.with_timezone(&runner.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
        else {
            log::warn!("Schedule of '{}' has no upcoming time, trigger idle", job_name);
            timer.cancelled().await;
            return;
        };

        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        log::debug!("'{}' next fires at {} (in {:?})", job_name, next, wait);
        tokio::select! {
            biased;
            _ = timer.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        last_fire = Some(next);
        runner.run_scheduled(&job_name, &shutdown.child_token()).await;
        if timer.is_cancelled() {
            return;
        }
    }
}

pub struct Scheduler {
    runner: Arc<JobRunner>,
    defaults: CronConfig,
    admin_email: Option<String>,
    shutdown: CancellationToken,
    jobs: Mutex<HashMap<String, JobHandle>>,
    /// Tasks of replaced or removed triggers; a run may still be in flight.
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        db: SharedDb,
        fetcher: Arc<ProfileFetcher>,
        quota: Arc<QuotaManager>,
        defaults: CronConfig,
        admin_email: Option<String>,
    ) -> Result<Self, PipelineError> {
        let timezone = parse_timezone(&defaults.timezone)?;
        Ok(Self {
            runner: Arc::new(JobRunner {
                db,
                fetcher,
                quota,
                timezone,
            }),
            defaults,
            admin_email,
            shutdown: CancellationToken::new(),
            jobs: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        })
    }

    /// Create the default job rows, then register every enabled job.
    /// Returns how many triggers are active.
    pub fn start(&self) -> Result<usize, PipelineError> {
        self.ensure_default_jobs()?;

        let configs = self.runner.db.lock().list_enabled_cron_jobs()?;
        for config in &configs {
            if let Err(e) = self.register_job(config) {
                log::warn!("Skipping job '{}': {}", config.job_name, e);
            }
        }

        let active = self.jobs.lock().len();
        log::info!(
            "Scheduler started with {} trigger(s) (timezone {})",
            active,
            self.runner.timezone
        );
        Ok(active)
    }

    /// Insert the `profile_fetcher` and `quota_reset` rows if they are missing.
    pub fn ensure_default_jobs(&self) -> Result<(), PipelineError> {
        let db = self.runner.db.lock();
        let admin_email = self.admin_email.as_deref();
        db.insert_cron_job_if_absent(
            PROFILE_FETCHER_JOB,
            JobType::ProfileFetcher.as_str(),
            &self.defaults.profile_fetcher_schedule,
            self.defaults.batch_size,
            self.defaults.respect_quota,
            admin_email,
        )?;
        db.insert_cron_job_if_absent(
            QUOTA_RESET_JOB,
            JobType::QuotaReset.as_str(),
            &self.defaults.quota_reset_schedule,
            self.defaults.batch_size,
            self.defaults.respect_quota,
            admin_email,
        )?;
        Ok(())
    }

    /// Register (or replace) the trigger for `config`.
    pub fn register_job(&self, config: &DbCronJobConfig) -> Result<(), PipelineError> {
        let job_type = config.kind()?;
        let schedule = parse_cron(&config.schedule)?;

        let timer = self.shutdown.child_token();
        let task = tokio::spawn(trigger_loop(
            self.runner.clone(),
            config.job_name.clone(),
            schedule.clone(),
            timer.clone(),
            self.shutdown.clone(),
        ));

        let previous = self.jobs.lock().insert(
            config.job_name.clone(),
            JobHandle {
                job_type,
                schedule: config.schedule.clone(),
                timer,
                task,
            },
        );
        if let Some(previous) = previous {
            self.retire(previous);
        }

        let next = schedule
            .upcoming(self.runner.timezone)
            .next()
            .map(|t| t.with_timezone(&Utc));
        if let Err(e) = self
            .runner
            .db
            .lock()
            .update_cron_next_run(&config.job_name, next)
        {
            log::warn!("Failed to record next run of '{}': {}", config.job_name, e);
        }

        log::info!(
            "Registered '{}' ({}) on '{}'",
            config.job_name,
            job_type,
            config.schedule
        );
        Ok(())
    }

    fn unregister(&self, job_name: &str) -> bool {
        let removed = self.jobs.lock().remove(job_name);
        match removed {
            Some(handle) => {
                self.retire(handle);
                true
            }
            None => false,
        }
    }

    /// Stop a trigger from firing again but keep its task for [`stop`](Self::stop)
    /// to wait on.
    fn retire(&self, handle: JobHandle) {
        handle.timer.cancel();
        let mut retired = self.retired.lock();
        retired.retain(|task| !task.is_finished());
        retired.push(handle.task);
    }

    /// Drop the current trigger of `job_name` and register it again from its
    /// stored row if the job is enabled.
    pub fn reload_schedule(&self, job_name: &str) -> Result<(), PipelineError> {
        let removed = self.unregister(job_name);

        let config = self.runner.db.lock().get_cron_job(job_name)?.ok_or_else(|| {
            PipelineError::Configuration(format!("No cron job configuration for '{}'", job_name))
        })?;

        if !config.enabled {
            log::info!(
                "'{}' is disabled{}",
                job_name,
                if removed { ", trigger removed" } else { "" }
            );
            return Ok(());
        }
        self.register_job(&config)
    }

    /// Persist an edit to a job row and reload its trigger.
    pub fn update_job(
        &self,
        job_name: &str,
        update: &CronJobUpdate,
    ) -> Result<DbCronJobConfig, PipelineError> {
        if let Some(schedule) = &update.schedule {
            parse_cron(schedule)?;
        }
        if let Some(batch_size) = update.batch_size {
            if batch_size <= 0 {
                return Err(PipelineError::Configuration(format!(
                    "Batch size must be positive, got {}",
                    batch_size
                )));
            }
        }

        let updated = self.runner.db.lock().update_cron_job(job_name, update)?;
        self.reload_schedule(job_name)?;
        Ok(updated)
    }

    pub fn toggle_job(&self, job_name: &str, enabled: bool) -> Result<DbCronJobConfig, PipelineError> {
        self.update_job(
            job_name,
            &CronJobUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
    }

    /// Run `job_name` now, outside its schedule.
    pub async fn trigger_now(&self, job_name: &str) -> Result<Option<JobExecution>, PipelineError> {
        log::info!("Manual run of '{}' requested", job_name);
        self.runner.run(job_name, &self.shutdown.child_token()).await
    }

    pub fn registered_jobs(&self) -> Vec<RegisteredJob> {
        let jobs = self.jobs.lock();
        let mut registered: Vec<RegisteredJob> = jobs
            .iter()
            .map(|(name, handle)| RegisteredJob {
                job_name: name.clone(),
                job_type: handle.job_type,
                schedule: handle.schedule.clone(),
                next_run_at: next_run_time(&handle.schedule, self.runner.timezone)
                    .ok()
                    .flatten(),
            })
            .collect();
        registered.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        registered
    }

    /// Stop every trigger, cancel in-flight runs and wait for them to finish,
    /// including runs of triggers retired by an earlier reload.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<(String, JobHandle)> = self.jobs.lock().drain().collect();
        for (name, handle) in handles {
            if let Err(e) = handle.task.await {
                log::warn!("Trigger task for '{}' ended abnormally: {}", name, e);
            }
        }
        let retired: Vec<JoinHandle<()>> = self.retired.lock().drain(..).collect();
        for task in retired {
            if let Err(e) = task.await {
                log::warn!("Retired trigger task ended abnormally: {}", e);
            }
        }
        log::info!("Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use crate::types::JobStatus;

    fn scheduler(h: &Harness) -> Scheduler {
        Scheduler::new(
            h.db.clone(),
            h.fetcher.clone(),
            h.quota.clone(),
            CronConfig::default(),
            Some("ops@example.com".into()),
        )
        .unwrap()
    }

    fn names(s: &Scheduler) -> Vec<String> {
        s.registered_jobs().into_iter().map(|j| j.job_name).collect()
    }

    #[test]
    fn test_parse_cron_five_fields() {
        assert!(parse_cron("0 2 * * *").is_ok());
        assert!(parse_cron("0 0 1 * *").is_ok());
        assert!(parse_cron("*/15 8-18 * * 1-5").is_ok());
    }

    #[test]
    fn test_parse_cron_invalid() {
        assert!(matches!(
            parse_cron("not a cron"),
            Err(PipelineError::Configuration(_))
        ));
        assert!(parse_cron("0 0 2 * * *").is_err());
    }

    #[test]
    fn test_next_run_time_in_timezone() {
        let tz = parse_timezone("America/New_York").unwrap();
        let next = next_run_time("0 8 * * 1-5", tz).unwrap().unwrap();
        assert!(next > Utc::now());
        let local = next.with_timezone(&tz);
        assert_eq!(local.format("%H:%M").to_string(), "08:00");
        assert!(parse_timezone("Mars/Olympus").is_err());
    }

    #[tokio::test]
    async fn test_start_creates_and_registers_defaults() {
        let h = Harness::new(50_000);
        let s = scheduler(&h);
        assert_eq!(s.start().unwrap(), 2);
        assert_eq!(names(&s), vec![PROFILE_FETCHER_JOB, QUOTA_RESET_JOB]);

        let row = h.db.lock().get_cron_job(PROFILE_FETCHER_JOB).unwrap().unwrap();
        assert_eq!(row.schedule, "0 2 * * *");
        assert_eq!(row.admin_email.as_deref(), Some("ops@example.com"));
        assert!(row.next_run_at.is_some());
        s.stop().await;
        assert!(s.registered_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_start_skips_unregistrable_jobs() {
        let h = Harness::new(50_000);
        h.db.lock()
            .insert_cron_job_if_absent("mystery", "mystery_job", "0 3 * * *", 10, true, None)
            .unwrap();
        h.db.lock()
            .insert_cron_job_if_absent("broken", "profile_fetcher", "whenever", 10, true, None)
            .unwrap();
        let s = scheduler(&h);
        assert_eq!(s.start().unwrap(), 2);
        assert!(!names(&s).contains(&"mystery".to_string()));
        s.stop().await;
    }

    #[tokio::test]
    async fn test_register_job_rejects_bad_rows() {
        let h = Harness::new(50_000);
        let s = scheduler(&h);
        let unknown = h
            .db
            .lock()
            .insert_cron_job_if_absent("mystery", "mystery_job", "0 3 * * *", 10, true, None)
            .unwrap();
        let err = s.register_job(&unknown).unwrap_err();
        assert!(err.to_string().contains("Unknown job type"));

        let bad_cron = h
            .db
            .lock()
            .insert_cron_job_if_absent("bad", "quota_reset", "every day", 10, true, None)
            .unwrap();
        assert!(matches!(
            s.register_job(&bad_cron),
            Err(PipelineError::Configuration(_))
        ));
        assert!(s.registered_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_reload_after_disable_removes_trigger() {
        let h = Harness::new(50_000);
        let s = scheduler(&h);
        s.start().unwrap();

        h.db.lock()
            .set_cron_job_enabled(PROFILE_FETCHER_JOB, false)
            .unwrap();
        s.reload_schedule(PROFILE_FETCHER_JOB).unwrap();
        assert_eq!(names(&s), vec![QUOTA_RESET_JOB]);

        // Reloading a disabled job with no trigger is a no-op
        s.reload_schedule(PROFILE_FETCHER_JOB).unwrap();
        assert_eq!(names(&s), vec![QUOTA_RESET_JOB]);

        assert!(matches!(
            s.reload_schedule("nope"),
            Err(PipelineError::Configuration(_))
        ));
        s.stop().await;
    }

    #[tokio::test]
    async fn test_update_and_toggle_job() {
        let h = Harness::new(50_000);
        let s = scheduler(&h);
        s.start().unwrap();

        let updated = s
            .update_job(
                PROFILE_FETCHER_JOB,
                &CronJobUpdate {
                    schedule: Some("30 4 * * *".into()),
                    batch_size: Some(25),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.batch_size, 25);
        let job = s
            .registered_jobs()
            .into_iter()
            .find(|j| j.job_name == PROFILE_FETCHER_JOB)
            .unwrap();
        assert_eq!(job.schedule, "30 4 * * *");
        assert_eq!(job.job_type, JobType::ProfileFetcher);

        let invalid = s.update_job(
            PROFILE_FETCHER_JOB,
            &CronJobUpdate {
                schedule: Some("bogus".into()),
                ..Default::default()
            },
        );
        assert!(invalid.is_err());
        let row = h.db.lock().get_cron_job(PROFILE_FETCHER_JOB).unwrap().unwrap();
        assert_eq!(row.schedule, "30 4 * * *");

        let toggled = s.toggle_job(QUOTA_RESET_JOB, false).unwrap();
        assert!(!toggled.enabled);
        assert_eq!(names(&s), vec![PROFILE_FETCHER_JOB]);
        s.toggle_job(QUOTA_RESET_JOB, true).unwrap();
        assert_eq!(names(&s), vec![PROFILE_FETCHER_JOB, QUOTA_RESET_JOB]);
        s.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_now_runs_fetch_and_records_run_time() {
        let h = Harness::new(50_000).with_fetch_job(10, true);
        let ids = h.queue(&["urn:now"]);
        let s = scheduler(&h);

        let execution = s.trigger_now(PROFILE_FETCHER_JOB).await.unwrap().unwrap();
        assert_eq!(execution.status, JobStatus::Success);
        assert_eq!(execution.entry_ids, ids);

        let row = h.db.lock().get_cron_job(PROFILE_FETCHER_JOB).unwrap().unwrap();
        assert!(row.last_run_at.is_some());
        assert!(row.next_run_at.unwrap() > row.last_run_at.unwrap());
    }

    #[tokio::test]
    async fn test_trigger_now_quota_reset_opens_period() {
        let h = Harness::new(1_234).with_reset_job();
        let s = scheduler(&h);
        assert!(s.trigger_now(QUOTA_RESET_JOB).await.unwrap().is_none());
        assert_eq!(h.db.lock().count_rows("api_quota_tracker").unwrap(), 1);
        assert_eq!(h.quota.current_status().unwrap().quota_limit, 1_234);
        assert!(h.notifier.subjects()[0].starts_with("Profile API quota reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_job() {
        let h = Harness::new(500);
        h.db.lock()
            .insert_cron_job_if_absent(QUOTA_RESET_JOB, "quota_reset", "* * * * *", 10, true, None)
            .unwrap();
        let s = scheduler(&h);
        s.start().unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;

        let row = h.db.lock().get_cron_job(QUOTA_RESET_JOB).unwrap().unwrap();
        assert!(row.last_run_at.is_some());
        assert_eq!(h.db.lock().count_rows("api_quota_tracker").unwrap(), 1);
        s.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_job_stops_firing() {
        let h = Harness::new(500);
        {
            let db = h.db.lock();
            db.insert_cron_job_if_absent(QUOTA_RESET_JOB, "quota_reset", "* * * * *", 10, true, None)
                .unwrap();
            db.insert_cron_job_if_absent(PROFILE_FETCHER_JOB, "profile_fetcher", "0 2 * * *", 10, true, None)
                .unwrap();
            db.set_cron_job_enabled(PROFILE_FETCHER_JOB, false).unwrap();
        }
        let s = scheduler(&h);
        assert_eq!(s.start().unwrap(), 1);

        s.toggle_job(QUOTA_RESET_JOB, false).unwrap();
        tokio::time::sleep(Duration::from_secs(125)).await;

        let row = h.db.lock().get_cron_job(QUOTA_RESET_JOB).unwrap().unwrap();
        assert!(row.last_run_at.is_none());
        assert_eq!(h.db.lock().count_rows("api_quota_tracker").unwrap(), 0);
        assert!(h.notifier.sent().is_empty());
        s.stop().await;
    }

    #[tokio::test]
    async fn test_skipped_firing_is_not_recorded() {
        let h = Harness::new(50_000).with_fetch_job(10, true);
        h.queue(&["urn:busy"]);
        h.source.hang("urn:busy");

        let cancel = CancellationToken::new();
        let running = {
            let fetcher = h.fetcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { fetcher.execute(PROFILE_FETCHER_JOB, &cancel).await })
        };
        while h.source.calls("urn:busy") == 0 {
            tokio::task::yield_now().await;
        }

        let s = scheduler(&h);
        let skipped = s.trigger_now(PROFILE_FETCHER_JOB).await;
        assert!(matches!(skipped, Err(PipelineError::AlreadyRunning(_))));
        let row = h.db.lock().get_cron_job(PROFILE_FETCHER_JOB).unwrap().unwrap();
        assert!(row.last_run_at.is_none());

        cancel.cancel();
        assert!(running.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_run_of_replaced_trigger() {
        let h = Harness::new(50_000);
        h.db.lock()
            .insert_cron_job_if_absent(PROFILE_FETCHER_JOB, "profile_fetcher", "* * * * *", 10, true, None)
            .unwrap();
        let ids = h.queue(&["urn:slow"]);
        h.source.hang("urn:slow");
        let s = scheduler(&h);
        s.start().unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        while h.source.calls("urn:slow") == 0 {
            tokio::task::yield_now().await;
        }
        assert!(h.fetcher.is_running(PROFILE_FETCHER_JOB));

        s.update_job(
            PROFILE_FETCHER_JOB,
            &CronJobUpdate {
                batch_size: Some(5),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(s.retired.lock().len(), 1);
        assert!(h.fetcher.is_running(PROFILE_FETCHER_JOB));

        s.stop().await;
        assert!(s.retired.lock().is_empty());
        assert!(!h.fetcher.is_running(PROFILE_FETCHER_JOB));
        let entry = h.db.lock().get_profile_entry(&ids[0]).unwrap().unwrap();
        assert_eq!(entry.status, crate::types::EntryStatus::Pending);
        assert_eq!(h.source.calls("urn:slow"), 1);
    }
}
