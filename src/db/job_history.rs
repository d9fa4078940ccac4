use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};

use super::*;

const EXECUTION_COLUMNS: &str = "id, job_name, status, started_at, completed_at, total_processed,
     successful_count, failed_count, api_calls_made, quota_remaining, error_summary,
     duration_seconds";

impl HarvestDb {
    // =========================================================================
    // Job execution history
    // =========================================================================

    fn map_execution_row(row: &rusqlite::Row) -> rusqlite::Result<JobExecution> {
        Ok(JobExecution {
            id: row.get(0)?,
            job_name: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            total_processed: row.get(5)?,
            successful_count: row.get(6)?,
            failed_count: row.get(7)?,
            api_calls_made: row.get(8)?,
            quota_remaining: row.get(9)?,
            error_summary: row.get(10)?,
            duration_seconds: row.get(11)?,
            entry_ids: Vec::new(),
        })
    }

    /// Persist a finished run together with the entries it completed.
    pub fn insert_job_execution(&self, execution: &JobExecution) -> Result<(), DbError> {
        self.with_transaction(|tx| {
            tx.conn.execute(
                "INSERT INTO job_execution_history (
                    id, job_name, status, started_at, completed_at, total_processed,
                    successful_count, failed_count, api_calls_made, quota_remaining,
                    error_summary, duration_seconds
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    execution.id,
                    execution.job_name,
                    execution.status,
                    execution.started_at,
                    execution.completed_at,
                    execution.total_processed,
                    execution.successful_count,
                    execution.failed_count,
                    execution.api_calls_made,
                    execution.quota_remaining,
                    execution.error_summary,
                    execution.duration_seconds,
                ],
            )?;
            for entry_id in &execution.entry_ids {
                tx.conn.execute(
                    "INSERT OR IGNORE INTO job_execution_entries (execution_id, entry_id)
                     VALUES (?1, ?2)",
                    params![execution.id, entry_id],
                )?;
            }
            Ok(())
        })
    }

    fn load_execution_entries(&self, execution: &mut JobExecution) -> Result<(), DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id FROM job_execution_entries WHERE execution_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![execution.id], |row| row.get::<_, String>(0))?;
        for row in rows {
            execution.entry_ids.push(row?);
        }
        Ok(())
    }

    pub fn get_job_execution(&self, id: &str) -> Result<Option<JobExecution>, DbError> {
        let sql = format!(
            "SELECT {} FROM job_execution_history WHERE id = ?1",
            EXECUTION_COLUMNS
        );
        let execution = self
            .conn
            .query_row(&sql, params![id], Self::map_execution_row)
            .optional()?;
        match execution {
            Some(mut e) => {
                self.load_execution_entries(&mut e)?;
                Ok(Some(e))
            }
            None => Ok(None),
        }
    }

    pub fn latest_job_execution(&self, job_name: &str) -> Result<Option<JobExecution>, DbError> {
        let mut runs = self.list_job_executions(Some(job_name), 1)?;
        Ok(runs.pop())
    }

    /// Most recent runs first, optionally filtered by job name.
    pub fn list_job_executions(
        &self,
        job_name: Option<&str>,
        limit: i64,
    ) -> Result<Vec<JobExecution>, DbError> {
        let sql = format!(
            "SELECT {} FROM job_execution_history
             WHERE (?1 IS NULL OR job_name = ?1)
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?2",
            EXECUTION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![job_name, limit.max(0)], Self::map_execution_row)?;

        let mut runs = Vec::new();
        for row in rows {
            let mut run = row?;
            self.load_execution_entries(&mut run)?;
            runs.push(run);
        }
        Ok(runs)
    }

    /// Aggregate the job's runs started within the last `days` days.
    pub fn job_execution_stats(&self, job_name: &str, days: i64) -> Result<JobStats, DbError> {
        let since = Utc::now() - Duration::days(days.max(0));
        let stats = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'success'), 0),
                    COALESCE(SUM(status = 'partial'), 0),
                    COALESCE(SUM(status = 'failed'), 0),
                    COALESCE(SUM(status = 'quota_exceeded'), 0),
                    COALESCE(SUM(total_processed), 0),
                    COALESCE(SUM(successful_count), 0),
                    COALESCE(SUM(failed_count), 0),
                    COALESCE(SUM(api_calls_made), 0),
                    COALESCE(AVG(duration_seconds), 0.0)
             FROM job_execution_history
             WHERE job_name = ?1 AND started_at >= ?2",
            params![job_name, since],
            |row| {
                Ok(JobStats {
                    job_name: job_name.to_string(),
                    runs: row.get(0)?,
                    successful_runs: row.get(1)?,
                    partial_runs: row.get(2)?,
                    failed_runs: row.get(3)?,
                    quota_exceeded_runs: row.get(4)?,
                    total_processed: row.get(5)?,
                    total_successful: row.get(6)?,
                    total_failed: row.get(7)?,
                    total_api_calls: row.get(8)?,
                    average_duration_seconds: row.get(9)?,
                })
            },
        )?;
        Ok(stats)
    }
}
