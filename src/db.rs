//! SQLite store for messages, classifications, workspaces, profiles, and
//! subscriptions.
//!
//! This is the only shared mutable state in the system. Every write is a
//! single-row or id-set-scoped update/delete — there are no multi-row
//! transactions, so a crash mid-phase can leave a message `processing` or a
//! subscription mid-transition; the next externally-triggered run recovers.
//!
//! `TriageDb` is intentionally not `Clone` or `Sync`; it is held behind a
//! `parking_lot::Mutex` in `AppState` and never locked across an await.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::info;

use crate::error::TriageError;

mod classifications;
pub(crate) mod messages;
mod profiles;
mod subscriptions;
mod workspaces;

/// SQLite connection wrapper.
pub struct TriageDb {
    conn: Connection,
}

impl TriageDb {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, TriageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TriageError::Config(format!("creating db directory: {e}")))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(include_str!("schema.sql"))?;
        info!(path = %path.display(), "database ready");
        Ok(Self { conn })
    }

    /// In-memory database with the full schema. Used by tests.
    pub fn open_in_memory() -> Result<Self, TriageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self { conn })
    }

    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }
}

// ---------------------------------------------------------------------------
// Timestamp encoding
// ---------------------------------------------------------------------------

/// Stable millisecond-precision RFC3339 format. Fixed width keeps string
/// comparison in SQL equivalent to chronological comparison.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.format(TS_FORMAT).to_string()
}

pub(crate) fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(&s)).transpose()
}

/// `?1, ?2, ... ?n` placeholder list for id-set-scoped statements.
pub(crate) fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_open_creates_parent_dirs_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("triage.db");

        let db = TriageDb::open(&path).unwrap();
        let tables: i64 = db
            .conn_ref()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('workspaces', 'messages', 'classifications', 'profiles', 'subscriptions')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);

        // Reopening an existing database is fine; the schema is idempotent
        drop(db);
        TriageDb::open(&path).unwrap();
    }

    #[test]
    fn test_ts_round_trip_and_ordering() {
        let earlier = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();

        assert_eq!(parse_ts(&ts(earlier)).unwrap(), earlier);
        // Lexicographic == chronological for the fixed-width format
        assert!(ts(earlier) < ts(later));
    }
}
