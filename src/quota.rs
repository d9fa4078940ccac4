//! Monthly API quota enforcement.
//!
//! [`QuotaManager`] is the only writer of the `api_quota_tracker` table. All
//! operations address the tracker of the current UTC calendar month, which is
//! created lazily with the configured default limit.

use std::sync::Arc;

use chrono::{Datelike, Utc};

use crate::db::{DbQuotaTracker, SharedDb};
use crate::error::PipelineError;
use crate::notification::{notify_quietly, Notification, Notifier};

pub struct QuotaManager {
    db: SharedDb,
    notifier: Arc<dyn Notifier>,
    default_limit: i64,
}

/// `(month, year)` of the current UTC calendar month.
fn current_period() -> (u32, i32) {
    let now = Utc::now();
    (now.month(), now.year())
}

impl QuotaManager {
    pub fn new(db: SharedDb, notifier: Arc<dyn Notifier>, default_limit: i64) -> Self {
        Self {
            db,
            notifier,
            default_limit,
        }
    }

    fn current_tracker(&self) -> Result<DbQuotaTracker, PipelineError> {
        let (month, year) = current_period();
        let tracker = self
            .db
            .lock()
            .get_or_create_quota_tracker(month, year, self.default_limit)?;
        Ok(tracker)
    }

    /// How many calls the caller may make now, at most `requested`.
    ///
    /// Fails with `QuotaExceeded` when the month is blocked or no headroom is
    /// left. The override lifts the block but never the headroom clamp.
    pub async fn reserve(&self, requested: i64) -> Result<i64, PipelineError> {
        let tracker = self.current_tracker()?;

        if tracker.is_blocked() {
            self.notify_exceeded_once(&tracker).await;
            return Err(PipelineError::QuotaExceeded {
                used: tracker.call_count,
                limit: tracker.quota_limit,
            });
        }

        let remaining = tracker.remaining();
        if remaining < requested {
            if remaining == 0 {
                return Err(PipelineError::QuotaExceeded {
                    used: tracker.call_count,
                    limit: tracker.quota_limit,
                });
            }
            log::info!(
                "Quota headroom {} below requested batch {}; clamping",
                remaining,
                requested
            );
            return Ok(remaining);
        }
        Ok(requested)
    }

    /// Record `calls` successful API calls. The increment that crosses the
    /// limit sends the exceeded notification.
    pub async fn record_calls(&self, calls: i64) -> Result<DbQuotaTracker, PipelineError> {
        let (month, year) = current_period();
        let increment = self
            .db
            .lock()
            .increment_quota_calls(month, year, calls, self.default_limit)?;

        if increment.crossed_limit() {
            log::warn!(
                "Profile API quota reached: {}/{}",
                increment.tracker.call_count,
                increment.tracker.quota_limit
            );
            self.notify_exceeded_once(&increment.tracker).await;
        }
        Ok(increment.tracker)
    }

    /// Send the exceeded notification unless this month already had one.
    ///
    /// The `notification_sent` flag is claimed before sending so concurrent
    /// callers cannot both deliver it; a failed delivery gives the claim back.
    async fn notify_exceeded_once(&self, tracker: &DbQuotaTracker) {
        let claimed = match self.db.lock().claim_quota_notification(tracker.id) {
            Ok(claimed) => claimed,
            Err(e) => {
                log::warn!("Failed to claim quota notification: {}", e);
                return;
            }
        };
        if !claimed {
            return;
        }

        let notification = Notification::QuotaExceeded {
            used: tracker.call_count,
            limit: tracker.quota_limit,
            month: tracker.month,
            year: tracker.year,
        };
        if let Err(e) = self.notifier.send(&notification).await {
            log::warn!("Failed to send quota exceeded notification: {}", e);
            if let Err(e) = self.db.lock().release_quota_notification(tracker.id) {
                log::warn!("Failed to release quota notification claim: {}", e);
            }
        }
    }

    pub async fn set_override(&self, enabled: bool) -> Result<DbQuotaTracker, PipelineError> {
        let (month, year) = current_period();
        let tracker = self
            .db
            .lock()
            .set_quota_override(month, year, enabled, self.default_limit)?;
        log::info!("Quota override {}", if enabled { "enabled" } else { "disabled" });

        notify_quietly(
            self.notifier.as_ref(),
            Notification::QuotaOverrideChanged {
                enabled,
                used: tracker.call_count,
                limit: tracker.quota_limit,
            },
        )
        .await;
        Ok(tracker)
    }

    pub fn update_limit(&self, new_limit: i64) -> Result<DbQuotaTracker, PipelineError> {
        if new_limit <= 0 {
            return Err(PipelineError::Configuration(format!(
                "Quota limit must be positive, got {}",
                new_limit
            )));
        }
        let (month, year) = current_period();
        let tracker = self
            .db
            .lock()
            .update_quota_limit(month, year, new_limit, self.default_limit)?;
        log::info!("Quota limit for {}/{} set to {}", month, year, new_limit);
        Ok(tracker)
    }

    pub fn current_status(&self) -> Result<DbQuotaTracker, PipelineError> {
        self.current_tracker()
    }

    /// Calls left this month, never negative.
    pub fn remaining(&self) -> Result<i64, PipelineError> {
        Ok(self.current_tracker()?.remaining())
    }

    pub fn history(&self, limit: i64) -> Result<Vec<DbQuotaTracker>, PipelineError> {
        Ok(self.db.lock().list_quota_history(limit)?)
    }

    /// Open the current month's tracker with the default limit. Runs from
    /// the monthly cron job; a tracker that already exists is left alone.
    pub async fn reset_monthly(&self) -> Result<(), PipelineError> {
        let (month, year) = current_period();
        let created = self
            .db
            .lock()
            .create_quota_tracker(month, year, self.default_limit);
        match created {
            Ok(_) => log::info!("Opened quota period {}/{}", month, year),
            Err(e) if e.is_constraint_violation() => {
                log::info!("Quota period {}/{} already open", month, year)
            }
            Err(e) => return Err(e.into()),
        }

        notify_quietly(
            self.notifier.as_ref(),
            Notification::QuotaReset {
                month,
                year,
                limit: self.default_limit,
            },
        )
        .await;
        Ok(())
    }
}
