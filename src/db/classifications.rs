use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};

use super::{parse_ts, placeholders, ts, TriageDb};
use crate::error::TriageError;
use crate::types::{ClassificationResult, DbClassification};

impl TriageDb {
    // =========================================================================
    // Classifications
    // =========================================================================

    /// Upsert the classification for a message. Idempotent on `message_id` —
    /// a double-claimed message classified twice costs an extra LLM call but
    /// converges to a single row.
    pub fn upsert_classification(
        &self,
        message_id: &str,
        result: &ClassificationResult,
        now: DateTime<Utc>,
    ) -> Result<(), TriageError> {
        self.conn.execute(
            "INSERT INTO classifications
                 (message_id, intent, priority, suggested_reply, confidence, classified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(message_id) DO UPDATE SET
                 intent = excluded.intent,
                 priority = excluded.priority,
                 suggested_reply = excluded.suggested_reply,
                 confidence = excluded.confidence,
                 classified_at = excluded.classified_at",
            params![
                message_id,
                result.intent,
                result.priority,
                result.suggested_reply,
                result.confidence,
                ts(now),
            ],
        )?;
        Ok(())
    }

    pub fn get_classification(
        &self,
        message_id: &str,
    ) -> Result<Option<DbClassification>, TriageError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, intent, priority, suggested_reply, confidence, classified_at
             FROM classifications
             WHERE message_id = ?1",
        )?;

        let classification = stmt
            .query_row(params![message_id], |row| {
                Ok(DbClassification {
                    message_id: row.get(0)?,
                    intent: row.get(1)?,
                    priority: row.get(2)?,
                    suggested_reply: row.get(3)?,
                    confidence: row.get(4)?,
                    classified_at: parse_ts(&row.get::<_, String>(5)?)?,
                })
            })
            .optional()?;
        Ok(classification)
    }

    /// Delete classifications for an id set. Always runs before the matching
    /// message delete — the conceptual foreign key is enforced here, not by
    /// the database.
    pub fn delete_classifications_for_messages(
        &self,
        message_ids: &[String],
    ) -> Result<usize, TriageError> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM classifications WHERE message_id IN ({})",
            placeholders(message_ids.len())
        );
        let deleted = self.conn.execute(&sql, params_from_iter(message_ids.iter()))?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::messages::test_message;
    use crate::types::{Intent, Priority};

    fn fan_ignore() -> ClassificationResult {
        ClassificationResult {
            intent: Intent::Fan,
            priority: Priority::Ignore,
            suggested_reply: None,
            confidence: 1.0,
        }
    }

    #[test]
    fn test_upsert_is_idempotent_on_message_id() {
        let db = TriageDb::open_in_memory().unwrap();
        let msg = db
            .insert_message(&test_message("ws-1", "sender-1", "adoro seu conteúdo"))
            .unwrap();

        db.upsert_classification(&msg.id, &fan_ignore(), Utc::now())
            .unwrap();
        let second = ClassificationResult {
            intent: Intent::Question,
            priority: Priority::RespondNow,
            suggested_reply: Some("Oi! Respondo já.".to_string()),
            confidence: 0.85,
        };
        db.upsert_classification(&msg.id, &second, Utc::now())
            .unwrap();

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM classifications", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let stored = db.get_classification(&msg.id).unwrap().unwrap();
        assert_eq!(stored.intent, Intent::Question);
        assert_eq!(stored.priority, Priority::RespondNow);
        assert_eq!(stored.confidence, 0.85);
    }
}
