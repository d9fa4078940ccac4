use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::*;

const TRACKER_COLUMNS: &str = "id, month, year, call_count, quota_limit, quota_exceeded,
     override_enabled, notification_sent, last_call_at, created_at, updated_at";

impl HarvestDb {
    // =========================================================================
    // Monthly quota tracker
    // =========================================================================

    fn map_tracker_row(row: &rusqlite::Row) -> rusqlite::Result<DbQuotaTracker> {
        Ok(DbQuotaTracker {
            id: row.get(0)?,
            month: row.get(1)?,
            year: row.get(2)?,
            call_count: row.get(3)?,
            quota_limit: row.get(4)?,
            quota_exceeded: row.get(5)?,
            override_enabled: row.get(6)?,
            notification_sent: row.get(7)?,
            last_call_at: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    pub fn get_quota_tracker(&self, month: u32, year: i32) -> Result<Option<DbQuotaTracker>, DbError> {
        let sql = format!(
            "SELECT {} FROM api_quota_tracker WHERE month = ?1 AND year = ?2",
            TRACKER_COLUMNS
        );
        let tracker = self
            .conn
            .query_row(&sql, params![month, year], Self::map_tracker_row)
            .optional()?;
        Ok(tracker)
    }

    /// Strict insert. A second tracker for the same month fails with a
    /// constraint violation; callers that race on creation should use
    /// [`HarvestDb::get_or_create_quota_tracker`] or check
    /// [`DbError::is_constraint_violation`].
    pub fn create_quota_tracker(
        &self,
        month: u32,
        year: i32,
        quota_limit: i64,
    ) -> Result<DbQuotaTracker, DbError> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO api_quota_tracker (month, year, quota_limit, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![month, year, quota_limit, now],
        )?;
        self.require_tracker(month, year)
    }

    /// Load the month's tracker, creating it with `default_limit` on first access.
    pub fn get_or_create_quota_tracker(
        &self,
        month: u32,
        year: i32,
        default_limit: i64,
    ) -> Result<DbQuotaTracker, DbError> {
        self.ensure_tracker(month, year, default_limit)?;
        self.require_tracker(month, year)
    }

    fn ensure_tracker(&self, month: u32, year: i32, default_limit: i64) -> Result<(), DbError> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT OR IGNORE INTO api_quota_tracker (month, year, quota_limit, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![month, year, default_limit, now],
        )?;
        Ok(())
    }

    fn require_tracker(&self, month: u32, year: i32) -> Result<DbQuotaTracker, DbError> {
        self.get_quota_tracker(month, year)?
            .ok_or_else(|| DbError::NotFound(format!("quota tracker {}/{}", month, year)))
    }

    /// Add `calls` to the month's counter and recompute the exceeded flag in
    /// one transaction.
    pub fn increment_quota_calls(
        &self,
        month: u32,
        year: i32,
        calls: i64,
        default_limit: i64,
    ) -> Result<QuotaIncrement, DbError> {
        self.with_transaction(|tx| {
            tx.ensure_tracker(month, year, default_limit)?;
            let before = tx.require_tracker(month, year)?;
            let now = Utc::now();
            tx.conn.execute(
                "UPDATE api_quota_tracker
                 SET call_count = call_count + ?3,
                     quota_exceeded = (call_count + ?3) >= quota_limit,
                     last_call_at = ?4,
                     updated_at = ?4
                 WHERE month = ?1 AND year = ?2",
                params![month, year, calls.max(0), now],
            )?;
            let tracker = tx.require_tracker(month, year)?;
            Ok(QuotaIncrement {
                tracker,
                was_exceeded: before.quota_exceeded,
            })
        })
    }

    /// Flip `notification_sent` from 0 to 1. Returns true for the single
    /// caller that won the flip.
    pub fn claim_quota_notification(&self, tracker_id: i64) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE api_quota_tracker SET notification_sent = 1, updated_at = ?2
             WHERE id = ?1 AND notification_sent = 0",
            params![tracker_id, Utc::now()],
        )?;
        Ok(changed == 1)
    }

    /// Undo a claim whose notification could not be delivered.
    pub fn release_quota_notification(&self, tracker_id: i64) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE api_quota_tracker SET notification_sent = 0, updated_at = ?2 WHERE id = ?1",
            params![tracker_id, Utc::now()],
        )?;
        Ok(())
    }

    pub fn set_quota_override(
        &self,
        month: u32,
        year: i32,
        enabled: bool,
        default_limit: i64,
    ) -> Result<DbQuotaTracker, DbError> {
        self.with_transaction(|tx| {
            tx.ensure_tracker(month, year, default_limit)?;
            tx.conn.execute(
                "UPDATE api_quota_tracker SET override_enabled = ?3, updated_at = ?4
                 WHERE month = ?1 AND year = ?2",
                params![month, year, enabled, Utc::now()],
            )?;
            tx.require_tracker(month, year)
        })
    }

    /// Change the month's limit. The exceeded flag is recomputed against the
    /// new limit; dropping back under it re-arms the exceeded notification.
    pub fn update_quota_limit(
        &self,
        month: u32,
        year: i32,
        quota_limit: i64,
        default_limit: i64,
    ) -> Result<DbQuotaTracker, DbError> {
        self.with_transaction(|tx| {
            tx.ensure_tracker(month, year, default_limit)?;
            tx.conn.execute(
                "UPDATE api_quota_tracker
                 SET quota_limit = ?3,
                     quota_exceeded = call_count >= ?3,
                     notification_sent = CASE WHEN call_count >= ?3 THEN notification_sent ELSE 0 END,
                     updated_at = ?4
                 WHERE month = ?1 AND year = ?2",
                params![month, year, quota_limit, Utc::now()],
            )?;
            tx.require_tracker(month, year)
        })
    }

    /// Most recent months first.
    pub fn list_quota_history(&self, limit: i64) -> Result<Vec<DbQuotaTracker>, DbError> {
        let sql = format!(
            "SELECT {} FROM api_quota_tracker ORDER BY year DESC, month DESC LIMIT ?1",
            TRACKER_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit.max(0)], Self::map_tracker_row)?;

        let mut trackers = Vec::new();
        for row in rows {
            trackers.push(row?);
        }
        Ok(trackers)
    }
}
