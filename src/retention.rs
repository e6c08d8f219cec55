//! Retention sweep for read messages.
//!
//! Removes messages the creator has already read once they are older than
//! the retention window, together with their classifications. Unread
//! messages are never touched, whatever their age. A sweep that finds
//! nothing is a success, not a no-op error.

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::db::TriageDb;
use crate::error::TriageError;

#[derive(Debug, Serialize)]
pub struct RetentionSummary {
    pub deleted: usize,
    pub message: String,
}

/// Delete read messages received before `now - retention_days`.
/// Classifications go first so no orphaned rows survive a crash between the
/// two deletes.
pub fn run_retention_sweep(
    db: &Mutex<TriageDb>,
    retention_days: i64,
) -> Result<RetentionSummary, TriageError> {
    let cutoff = Utc::now() - Duration::days(retention_days);

    let guard = db.lock();
    let ids = guard.read_message_ids_older_than(cutoff)?;
    guard.delete_classifications_for_messages(&ids)?;
    let deleted = guard.delete_messages(&ids)?;

    info!(deleted, cutoff = %cutoff, "retention sweep complete");
    Ok(RetentionSummary {
        message: format!("Deleted {deleted} read messages older than {retention_days} days"),
        deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::messages::test_message;
    use crate::types::{ClassificationResult, Intent, Priority};

    fn insert_aged(db: &TriageDb, content: &str, age_days: i64, read: bool) -> String {
        let mut new = test_message("ws-1", "sender-1", content);
        new.received_at = Utc::now() - Duration::days(age_days);
        let message = db.insert_message(&new).unwrap();
        if read {
            db.mark_read(&message.id).unwrap();
        }
        message.id
    }

    #[test]
    fn test_deletes_only_read_messages_past_cutoff() {
        let db = Mutex::new(TriageDb::open_in_memory().unwrap());
        let (old_read, old_unread, fresh_read) = {
            let guard = db.lock();
            (
                insert_aged(&guard, "lida e velha", 45, true),
                insert_aged(&guard, "velha mas não lida", 45, false),
                insert_aged(&guard, "lida mas recente", 5, true),
            )
        };

        let summary = run_retention_sweep(&db, 30).unwrap();
        assert_eq!(summary.deleted, 1);

        let guard = db.lock();
        assert!(guard.get_message(&old_read).unwrap().is_none());
        assert!(guard.get_message(&old_unread).unwrap().is_some());
        assert!(guard.get_message(&fresh_read).unwrap().is_some());
    }

    #[test]
    fn test_classifications_removed_with_their_messages() {
        let db = Mutex::new(TriageDb::open_in_memory().unwrap());
        let id = {
            let guard = db.lock();
            let id = insert_aged(&guard, "proposta antiga de publi", 40, true);
            guard
                .upsert_classification(
                    &id,
                    &ClassificationResult {
                        intent: Intent::Partnership,
                        priority: Priority::RespondNow,
                        suggested_reply: Some("Oi! Vamos conversar.".to_string()),
                        confidence: 0.85,
                    },
                    Utc::now(),
                )
                .unwrap();
            id
        };

        run_retention_sweep(&db, 30).unwrap();

        let guard = db.lock();
        assert!(guard.get_message(&id).unwrap().is_none());
        assert!(guard.get_classification(&id).unwrap().is_none());
    }

    #[test]
    fn test_empty_sweep_succeeds() {
        let db = Mutex::new(TriageDb::open_in_memory().unwrap());
        let summary = run_retention_sweep(&db, 30).unwrap();
        assert_eq!(summary.deleted, 0);
    }
}
