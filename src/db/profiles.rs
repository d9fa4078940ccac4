use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::*;

impl HarvestDb {
    // =========================================================================
    // Normalized profiles
    // =========================================================================

    /// Insert or update the profile for `profile.urn`. Re-fetching an
    /// identifier overwrites the previous values and keeps the row id.
    pub fn upsert_profile(&self, profile: &ProfileUpsert) -> Result<DbProfile, DbError> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO profiles (
                id, urn, entry_id, username, first_name, last_name, headline, title,
                country, city, educations, positions, skills, geo_data,
                raw_blob_key, cleaned_blob_key, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)
             ON CONFLICT(urn) DO UPDATE SET
                entry_id = COALESCE(excluded.entry_id, profiles.entry_id),
                username = excluded.username,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                headline = excluded.headline,
                title = excluded.title,
                country = excluded.country,
                city = excluded.city,
                educations = excluded.educations,
                positions = excluded.positions,
                skills = excluded.skills,
                geo_data = excluded.geo_data,
                raw_blob_key = excluded.raw_blob_key,
                cleaned_blob_key = excluded.cleaned_blob_key,
                updated_at = excluded.updated_at",
            params![
                uuid::Uuid::new_v4().to_string(),
                profile.urn,
                profile.entry_id,
                profile.username,
                profile.first_name,
                profile.last_name,
                profile.headline,
                profile.title,
                profile.country,
                profile.city,
                profile.educations,
                profile.positions,
                profile.skills,
                profile.geo_data,
                profile.raw_blob_key,
                profile.cleaned_blob_key,
                now,
            ],
        )?;
        self.get_profile_by_urn(&profile.urn)?
            .ok_or_else(|| DbError::NotFound(format!("profile {}", profile.urn)))
    }

    pub fn get_profile_by_urn(&self, urn: &str) -> Result<Option<DbProfile>, DbError> {
        let profile = self
            .conn
            .query_row(
                "SELECT id, urn, entry_id, username, first_name, last_name, headline, title,
                        country, city, educations, positions, skills, geo_data,
                        raw_blob_key, cleaned_blob_key, created_at, updated_at
                 FROM profiles WHERE urn = ?1",
                params![urn],
                |row| {
                    Ok(DbProfile {
                        id: row.get(0)?,
                        urn: row.get(1)?,
                        entry_id: row.get(2)?,
                        username: row.get(3)?,
                        first_name: row.get(4)?,
                        last_name: row.get(5)?,
                        headline: row.get(6)?,
                        title: row.get(7)?,
                        country: row.get(8)?,
                        city: row.get(9)?,
                        educations: row.get(10)?,
                        positions: row.get(11)?,
                        skills: row.get(12)?,
                        geo_data: row.get(13)?,
                        raw_blob_key: row.get(14)?,
                        cleaned_blob_key: row.get(15)?,
                        created_at: row.get(16)?,
                        updated_at: row.get(17)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::super::ProfileUpsert;

    #[test]
    fn test_upsert_inserts_then_updates_same_row() {
        let db = test_db();
        let entry = db.insert_profile_entry("urn:li:person", None).unwrap();

        let first = db
            .upsert_profile(&ProfileUpsert {
                urn: "urn:li:person".into(),
                entry_id: Some(entry.id.clone()),
                first_name: Some("Ada".into()),
                headline: Some("Engineer".into()),
                ..Default::default()
            })
            .unwrap();

        let second = db
            .upsert_profile(&ProfileUpsert {
                urn: "urn:li:person".into(),
                first_name: Some("Ada".into()),
                headline: Some("Principal Engineer".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.headline.as_deref(), Some("Principal Engineer"));
        assert_eq!(second.entry_id.as_deref(), Some(entry.id.as_str()));
        assert_eq!(db.count_rows("profiles").unwrap(), 1);
    }

    #[test]
    fn test_missing_profile_is_none() {
        let db = test_db();
        assert!(db.get_profile_by_urn("urn:li:nobody").unwrap().is_none());
    }
}
