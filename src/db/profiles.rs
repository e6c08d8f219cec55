use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{parse_ts, ts, TriageDb};
use crate::error::TriageError;
use crate::types::DbProfile;

impl TriageDb {
    // =========================================================================
    // Profiles
    // =========================================================================

    pub fn get_profile(&self, user_id: &str) -> Result<Option<DbProfile>, TriageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = ?1"
        ))?;
        let profile = stmt.query_row(params![user_id], map_profile).optional()?;
        Ok(profile)
    }

    /// Resolve the caller of the reply-send boundary from a bearer token.
    pub fn find_profile_by_api_token(
        &self,
        api_token: &str,
    ) -> Result<Option<DbProfile>, TriageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE api_token = ?1"
        ))?;
        let profile = stmt.query_row(params![api_token], map_profile).optional()?;
        Ok(profile)
    }

    /// Store a freshly connected Instagram identity. The token arrives
    /// already encrypted; the flag records that.
    pub fn upsert_instagram_identity(
        &self,
        user_id: &str,
        instagram_id: &str,
        instagram_username: &str,
        encrypted_token: &str,
    ) -> Result<(), TriageError> {
        self.conn.execute(
            "INSERT INTO profiles
                 (user_id, instagram_id, instagram_username, instagram_access_token,
                  token_encrypted, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                 instagram_id = excluded.instagram_id,
                 instagram_username = excluded.instagram_username,
                 instagram_access_token = excluded.instagram_access_token,
                 token_encrypted = 1",
            params![
                user_id,
                instagram_id,
                instagram_username,
                encrypted_token,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Profiles holding a token not yet flagged encrypted — the token
    /// migration's candidate set.
    pub fn unencrypted_token_profiles(&self) -> Result<Vec<DbProfile>, TriageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles
             WHERE instagram_access_token IS NOT NULL AND token_encrypted = 0"
        ))?;
        let rows = stmt.query_map([], map_profile)?;
        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row?);
        }
        Ok(profiles)
    }

    /// Replace a plaintext token with its encrypted form and set the flag.
    pub fn set_encrypted_token(
        &self,
        user_id: &str,
        encrypted_token: &str,
    ) -> Result<(), TriageError> {
        self.conn.execute(
            "UPDATE profiles
             SET instagram_access_token = ?1, token_encrypted = 1
             WHERE user_id = ?2",
            params![encrypted_token, user_id],
        )?;
        Ok(())
    }

    pub fn delete_profile(&self, user_id: &str) -> Result<(), TriageError> {
        self.conn
            .execute("DELETE FROM profiles WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }

    /// Minimal profile insert for tests.
    #[cfg(test)]
    pub fn insert_profile_with_token(
        &self,
        user_id: &str,
        token: Option<&str>,
        encrypted: bool,
    ) -> Result<(), TriageError> {
        self.conn.execute(
            "INSERT INTO profiles
                 (user_id, instagram_access_token, token_encrypted, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, token, encrypted, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Test helper: attach an API bearer token and Instagram id to a profile.
    #[cfg(test)]
    pub fn set_test_identity(
        &self,
        user_id: &str,
        instagram_id: &str,
        api_token: &str,
    ) -> Result<(), TriageError> {
        self.conn.execute(
            "UPDATE profiles SET instagram_id = ?1, api_token = ?2 WHERE user_id = ?3",
            params![instagram_id, api_token, user_id],
        )?;
        Ok(())
    }
}

const PROFILE_COLUMNS: &str = "user_id, instagram_id, instagram_username,
     instagram_access_token, token_encrypted, api_token, created_at";

fn map_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbProfile> {
    Ok(DbProfile {
        user_id: row.get(0)?,
        instagram_id: row.get(1)?,
        instagram_username: row.get(2)?,
        instagram_access_token: row.get(3)?,
        token_encrypted: row.get(4)?,
        api_token: row.get(5)?,
        created_at: parse_ts(&row.get::<_, String>(6)?)?,
    })
}
