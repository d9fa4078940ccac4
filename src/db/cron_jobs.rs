use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::*;

const CRON_COLUMNS: &str = "id, job_name, job_type, schedule, enabled, batch_size, respect_quota,
     admin_email, last_run_at, next_run_at, created_at, updated_at";

impl HarvestDb {
    // =========================================================================
    // Cron job configuration
    // =========================================================================

    fn map_cron_row(row: &rusqlite::Row) -> rusqlite::Result<DbCronJobConfig> {
        Ok(DbCronJobConfig {
            id: row.get(0)?,
            job_name: row.get(1)?,
            job_type: row.get(2)?,
            schedule: row.get(3)?,
            enabled: row.get(4)?,
            batch_size: row.get(5)?,
            respect_quota: row.get(6)?,
            admin_email: row.get(7)?,
            last_run_at: row.get(8)?,
            next_run_at: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    pub fn get_cron_job(&self, job_name: &str) -> Result<Option<DbCronJobConfig>, DbError> {
        let sql = format!("SELECT {} FROM cron_job_configs WHERE job_name = ?1", CRON_COLUMNS);
        let job = self
            .conn
            .query_row(&sql, params![job_name], Self::map_cron_row)
            .optional()?;
        Ok(job)
    }

    pub fn list_cron_jobs(&self) -> Result<Vec<DbCronJobConfig>, DbError> {
        self.query_cron_jobs(false)
    }

    pub fn list_enabled_cron_jobs(&self) -> Result<Vec<DbCronJobConfig>, DbError> {
        self.query_cron_jobs(true)
    }

    fn query_cron_jobs(&self, enabled_only: bool) -> Result<Vec<DbCronJobConfig>, DbError> {
        let sql = format!(
            "SELECT {} FROM cron_job_configs WHERE (?1 = 0 OR enabled = 1) ORDER BY job_name",
            CRON_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![enabled_only], Self::map_cron_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Insert a job configuration unless one with the same name exists.
    /// Returns the stored row either way.
    pub fn insert_cron_job_if_absent(
        &self,
        job_name: &str,
        job_type: &str,
        schedule: &str,
        batch_size: i64,
        respect_quota: bool,
        admin_email: Option<&str>,
    ) -> Result<DbCronJobConfig, DbError> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT OR IGNORE INTO cron_job_configs (
                id, job_name, job_type, schedule, enabled, batch_size, respect_quota,
                admin_email, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8, ?8)",
            params![
                uuid::Uuid::new_v4().to_string(),
                job_name,
                job_type,
                schedule,
                batch_size,
                respect_quota,
                admin_email,
                now,
            ],
        )?;
        self.get_cron_job(job_name)?
            .ok_or_else(|| DbError::NotFound(format!("cron job {}", job_name)))
    }

    /// Apply an administrative edit. Unset fields keep their stored value.
    pub fn update_cron_job(
        &self,
        job_name: &str,
        update: &CronJobUpdate,
    ) -> Result<DbCronJobConfig, DbError> {
        let changed = self.conn.execute(
            "UPDATE cron_job_configs
             SET schedule = COALESCE(?2, schedule),
                 enabled = COALESCE(?3, enabled),
                 batch_size = COALESCE(?4, batch_size),
                 respect_quota = COALESCE(?5, respect_quota),
                 admin_email = COALESCE(?6, admin_email),
                 updated_at = ?7
             WHERE job_name = ?1",
            params![
                job_name,
                update.schedule,
                update.enabled,
                update.batch_size,
                update.respect_quota,
                update.admin_email,
                Utc::now(),
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("cron job {}", job_name)));
        }
        self.get_cron_job(job_name)?
            .ok_or_else(|| DbError::NotFound(format!("cron job {}", job_name)))
    }

    pub fn set_cron_job_enabled(&self, job_name: &str, enabled: bool) -> Result<DbCronJobConfig, DbError> {
        self.update_cron_job(
            job_name,
            &CronJobUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
    }

    pub fn update_cron_run_times(
        &self,
        job_name: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE cron_job_configs SET last_run_at = ?2, next_run_at = ?3, updated_at = ?4
             WHERE job_name = ?1",
            params![job_name, last_run_at, next_run_at, Utc::now()],
        )?;
        Ok(())
    }

    pub fn update_cron_next_run(
        &self,
        job_name: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE cron_job_configs SET next_run_at = ?2, updated_at = ?3 WHERE job_name = ?1",
            params![job_name, next_run_at, Utc::now()],
        )?;
        Ok(())
    }
}
