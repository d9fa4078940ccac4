use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::*;
use crate::types::EntryStatus;

const ENTRY_COLUMNS: &str = "id, identifier, gender_hint, status, profile_data, raw_blob_key,
     cleaned_blob_key, fetch_count, last_fetched_at, error_message, created_at, updated_at";

impl HarvestDb {
    // =========================================================================
    // Profile entries
    // =========================================================================

    fn map_entry_row(row: &rusqlite::Row) -> rusqlite::Result<DbProfileEntry> {
        Ok(DbProfileEntry {
            id: row.get(0)?,
            identifier: row.get(1)?,
            gender_hint: row.get(2)?,
            status: row.get(3)?,
            profile_data: row.get(4)?,
            raw_blob_key: row.get(5)?,
            cleaned_blob_key: row.get(6)?,
            fetch_count: row.get(7)?,
            last_fetched_at: row.get(8)?,
            error_message: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    /// Queue a new identifier as `Pending`.
    pub fn insert_profile_entry(
        &self,
        identifier: &str,
        gender_hint: Option<&str>,
    ) -> Result<DbProfileEntry, DbError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO profile_entries (id, identifier, gender_hint, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
            params![id, identifier, gender_hint, now],
        )?;
        self.get_profile_entry(&id)?
            .ok_or_else(|| DbError::NotFound(format!("profile entry {}", id)))
    }

    pub fn get_profile_entry(&self, id: &str) -> Result<Option<DbProfileEntry>, DbError> {
        let sql = format!("SELECT {} FROM profile_entries WHERE id = ?1", ENTRY_COLUMNS);
        let entry = self
            .conn
            .query_row(&sql, params![id], Self::map_entry_row)
            .optional()?;
        Ok(entry)
    }

    /// Oldest-created `Pending` entries, at most `limit`.
    pub fn get_pending_entries(&self, limit: i64) -> Result<Vec<DbProfileEntry>, DbError> {
        let sql = format!(
            "SELECT {} FROM profile_entries
             WHERE status = 'pending'
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?1",
            ENTRY_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit.max(0)], Self::map_entry_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Conditional `Pending → Fetching`. Returns false when another worker
    /// already moved the entry on.
    pub fn claim_profile_entry(&self, id: &str) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE profile_entries SET status = 'fetching', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, Utc::now()],
        )?;
        Ok(changed == 1)
    }

    /// Claim an entry in any state except `Fetching`, for an administrative re-fetch.
    pub fn claim_entry_for_refetch(&self, id: &str) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE profile_entries SET status = 'fetching', updated_at = ?2
             WHERE id = ?1 AND status != 'fetching'",
            params![id, Utc::now()],
        )?;
        Ok(changed == 1)
    }

    /// Give a claimed entry back to the queue without recording a failure.
    pub fn release_entry_claim(&self, id: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE profile_entries SET status = 'pending', updated_at = ?2
             WHERE id = ?1 AND status = 'fetching'",
            params![id, Utc::now()],
        )?;
        Ok(())
    }

    /// Refresh a live claim so it is not mistaken for an abandoned one.
    pub fn touch_entry_claim(&self, id: &str) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE profile_entries SET updated_at = ?2
             WHERE id = ?1 AND status = 'fetching'",
            params![id, Utc::now()],
        )?;
        Ok(changed == 1)
    }

    /// Return `Fetching` entries whose claim was last refreshed before
    /// `older_than` to `Pending`. Younger claims belong to a live worker.
    pub fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<usize, DbError> {
        let changed = self.conn.execute(
            "UPDATE profile_entries SET status = 'pending', updated_at = ?1
             WHERE status = 'fetching' AND updated_at < ?2",
            params![Utc::now(), older_than],
        )?;
        Ok(changed)
    }

    pub fn mark_entry_failed(&self, id: &str, message: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE profile_entries SET status = 'failed', error_message = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, message, Utc::now()],
        )?;
        Ok(())
    }

    /// Terminal success: store the extracted data and blob keys, bump the fetch counter.
    pub fn mark_entry_completed(
        &self,
        id: &str,
        profile_data: &str,
        raw_blob_key: &str,
        cleaned_blob_key: &str,
    ) -> Result<(), DbError> {
        let now = Utc::now();
        let changed = self.conn.execute(
            "UPDATE profile_entries
             SET status = 'completed',
                 profile_data = ?2,
                 raw_blob_key = ?3,
                 cleaned_blob_key = ?4,
                 fetch_count = fetch_count + 1,
                 last_fetched_at = ?5,
                 error_message = NULL,
                 updated_at = ?5
             WHERE id = ?1",
            params![id, profile_data, raw_blob_key, cleaned_blob_key, now],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("profile entry {}", id)));
        }
        Ok(())
    }

    /// Operator re-queue of a single `Failed` entry.
    pub fn requeue_entry(&self, id: &str) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE profile_entries SET status = 'pending', error_message = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'failed'",
            params![id, Utc::now()],
        )?;
        Ok(changed == 1)
    }

    /// Operator re-queue of every `Failed` entry.
    pub fn requeue_failed_entries(&self) -> Result<usize, DbError> {
        let changed = self.conn.execute(
            "UPDATE profile_entries SET status = 'pending', error_message = NULL, updated_at = ?1
             WHERE status = 'failed'",
            params![Utc::now()],
        )?;
        Ok(changed)
    }

    pub fn count_entries_by_status(&self) -> Result<EntryStatusCounts, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM profile_entries GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, EntryStatus>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = EntryStatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            match status {
                EntryStatus::Pending => counts.pending = n,
                EntryStatus::Fetching => counts.fetching = n,
                EntryStatus::Completed => counts.completed = n,
                EntryStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::super::test_utils::test_db;
    use crate::types::EntryStatus;

    #[test]
    fn test_insert_and_get_entry() {
        let db = test_db();
        let entry = db.insert_profile_entry("urn:li:abc", Some("f")).unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.fetch_count, 0);
        assert_eq!(entry.gender_hint.as_deref(), Some("f"));

        let loaded = db.get_profile_entry(&entry.id).unwrap().unwrap();
        assert_eq!(loaded.identifier, "urn:li:abc");
        assert!(db.get_profile_entry("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_identifier_rejected() {
        let db = test_db();
        db.insert_profile_entry("urn:li:dup", None).unwrap();
        let err = db.insert_profile_entry("urn:li:dup", None).unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn test_pending_batch_is_oldest_first_and_bounded() {
        let db = test_db();
        let a = db.insert_profile_entry("a", None).unwrap();
        let b = db.insert_profile_entry("b", None).unwrap();
        db.insert_profile_entry("c", None).unwrap();

        let batch = db.get_pending_entries(2).unwrap();
        let ids: Vec<_> = batch.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let db = test_db();
        let entry = db.insert_profile_entry("urn:li:claim", None).unwrap();
        assert!(db.claim_profile_entry(&entry.id).unwrap());
        assert!(!db.claim_profile_entry(&entry.id).unwrap());
        assert!(!db.claim_entry_for_refetch(&entry.id).unwrap());
        assert!(db.get_pending_entries(10).unwrap().is_empty());

        db.release_entry_claim(&entry.id).unwrap();
        assert_eq!(db.get_pending_entries(10).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_completed_stamps_and_counts() {
        let db = test_db();
        let entry = db.insert_profile_entry("urn:li:done", None).unwrap();
        db.claim_profile_entry(&entry.id).unwrap();
        db.mark_entry_failed(&entry.id, "transient").unwrap();
        db.claim_entry_for_refetch(&entry.id).unwrap();
        db.mark_entry_completed(&entry.id, "{}", "raw-key", "clean-key")
            .unwrap();

        let loaded = db.get_profile_entry(&entry.id).unwrap().unwrap();
        assert_eq!(loaded.status, EntryStatus::Completed);
        assert_eq!(loaded.fetch_count, 1);
        assert!(loaded.last_fetched_at.is_some());
        assert!(loaded.error_message.is_none());
        assert_eq!(loaded.raw_blob_key.as_deref(), Some("raw-key"));
        assert_eq!(loaded.cleaned_blob_key.as_deref(), Some("clean-key"));
    }

    #[test]
    fn test_stale_claims_and_requeue() {
        let db = test_db();
        let a = db.insert_profile_entry("a", None).unwrap();
        let b = db.insert_profile_entry("b", None).unwrap();
        db.claim_profile_entry(&a.id).unwrap();
        db.claim_profile_entry(&b.id).unwrap();
        db.mark_entry_failed(&b.id, "gone").unwrap();

        assert_eq!(db.release_stale_claims(Utc::now() + Duration::seconds(1)).unwrap(), 1);
        let counts = db.count_entries_by_status().unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 2);

        assert_eq!(db.requeue_failed_entries().unwrap(), 1);
        assert!(!db.requeue_entry(&b.id).unwrap());
        assert_eq!(db.count_entries_by_status().unwrap().pending, 2);
    }

    #[test]
    fn test_fresh_claims_survive_release() {
        let db = test_db();
        let live = db.insert_profile_entry("live", None).unwrap();
        db.claim_profile_entry(&live.id).unwrap();

        assert_eq!(db.release_stale_claims(Utc::now() - Duration::minutes(5)).unwrap(), 0);
        assert_eq!(db.count_entries_by_status().unwrap().fetching, 1);

        assert!(db.touch_entry_claim(&live.id).unwrap());
        let touched = db.get_profile_entry(&live.id).unwrap().unwrap();
        assert_eq!(db.release_stale_claims(touched.updated_at).unwrap(), 0);
        assert_eq!(touched.status, EntryStatus::Fetching);

        db.release_entry_claim(&live.id).unwrap();
        assert!(!db.touch_entry_claim(&live.id).unwrap());
    }
}
