//! SQLite store for profile entries, normalized profiles, the monthly quota
//! tracker, job execution history and cron job configuration.
//!
//! The database lives at `~/.profile-harvester/harvester.db` unless the config
//! names another path. One connection is opened per process and shared behind
//! a mutex (see [`SharedDb`]); callers never hold the lock across an `.await`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection};

pub mod types;
pub use types::*;

pub mod cron_jobs;
pub mod job_history;
pub mod profile_entries;
pub mod profiles;
pub mod quota;

/// Process-wide handle to the database.
pub type SharedDb = Arc<parking_lot::Mutex<HarvestDb>>;

pub struct HarvestDb {
    conn: Connection,
}

impl HarvestDb {
    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the default location and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        log::debug!("Opened database at {}", path.display());
        Ok(Self { conn })
    }

    /// Open the database named by the config, falling back to the default path.
    pub fn open_configured(database_path: Option<&str>) -> Result<Self, DbError> {
        match database_path {
            Some(p) => Self::open_at(expand_home(p)?),
            None => Self::open(),
        }
    }

    /// Wrap into the shared handle used by the quota manager, orchestrator and scheduler.
    pub fn into_shared(self) -> SharedDb {
        Arc::new(parking_lot::Mutex::new(self))
    }

    /// `~/.profile-harvester/harvester.db`
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".profile-harvester").join("harvester.db"))
    }

    /// Row count of a table, for diagnostics.
    pub fn count_rows(&self, table: &str) -> Result<i64, DbError> {
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), params![], |row| {
                row.get(0)
            })?;
        Ok(count)
    }
}

/// Expand a leading `~/` against the home directory.
pub(crate) fn expand_home(path: &str) -> Result<PathBuf, DbError> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        return Ok(home.join(rest));
    }
    Ok(Path::new(path).to_path_buf())
}

// =============================================================================
// Shared test utilities
// =============================================================================
