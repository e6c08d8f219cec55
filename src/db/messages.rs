use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};
use uuid::Uuid;

use super::{parse_ts, placeholders, ts, TriageDb};
use crate::error::TriageError;
use crate::types::{ClassificationStatus, DbMessage, NewMessage};

impl TriageDb {
    // =========================================================================
    // Messages
    // =========================================================================

    /// Insert an inbound message with `classification_status = pending`.
    pub fn insert_message(&self, new: &NewMessage) -> Result<DbMessage, TriageError> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO messages (
                 id, workspace_id, instagram_message_id, sender_instagram_id,
                 sender_username, sender_name, sender_avatar_url,
                 sender_followers_count, conversation_id, content, received_at,
                 is_read, classification_status
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)",
            params![
                id,
                new.workspace_id,
                new.instagram_message_id,
                new.sender_instagram_id,
                new.sender_username,
                new.sender_name,
                new.sender_avatar_url,
                new.sender_followers_count,
                new.conversation_id,
                new.content,
                ts(new.received_at),
                ClassificationStatus::Pending,
            ],
        )?;

        self.get_message(&id)?.ok_or(TriageError::NotFound("message"))
    }

    pub fn get_message(&self, id: &str) -> Result<Option<DbMessage>, TriageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
        ))?;
        let message = stmt.query_row(params![id], map_message).optional()?;
        Ok(message)
    }

    /// Move a message to a terminal (or back to pending) classification state,
    /// clearing any soft claim.
    pub fn set_classification_status(
        &self,
        id: &str,
        status: ClassificationStatus,
    ) -> Result<(), TriageError> {
        self.conn.execute(
            "UPDATE messages SET classification_status = ?1, claimed_at = NULL WHERE id = ?2",
            params![status, id],
        )?;
        Ok(())
    }

    /// Soft-claim a group of messages for a batch run. The claim timestamp
    /// lets a later run reclaim rows orphaned by a crash mid-batch.
    pub fn mark_processing(
        &self,
        ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), TriageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE messages SET classification_status = 'processing', claimed_at = ?1
             WHERE id IN ({})",
            (2..ids.len() + 2)
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let args = std::iter::once(ts(now)).chain(ids.iter().cloned());
        self.conn.execute(&sql, params_from_iter(args))?;
        Ok(())
    }

    /// Batch selection: `pending` messages older than the batch window, plus
    /// `processing` rows whose claim is older than the lease cutoff (crash
    /// orphans reclaimed). Oldest first, capped at `limit`.
    pub fn batch_candidates(
        &self,
        window_cutoff: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DbMessage>, TriageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE (classification_status = 'pending' AND received_at <= ?1)
                OR (classification_status = 'processing'
                    AND claimed_at IS NOT NULL AND claimed_at <= ?2)
             ORDER BY received_at ASC
             LIMIT ?3",
        ))?;

        let rows = stmt.query_map(
            params![ts(window_cutoff), ts(lease_cutoff), limit as i64],
            map_message,
        )?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn mark_read(&self, id: &str) -> Result<(), TriageError> {
        self.conn
            .execute("UPDATE messages SET is_read = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Ids of read messages received before `cutoff` — the retention sweep's
    /// candidate set.
    pub fn read_message_ids_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, TriageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM messages WHERE is_read = 1 AND received_at < ?1",
        )?;
        let rows = stmt.query_map(params![ts(cutoff)], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn message_ids_for_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<String>, TriageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM messages WHERE workspace_id = ?1")?;
        let rows = stmt.query_map(params![workspace_id], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn delete_messages(&self, ids: &[String]) -> Result<usize, TriageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM messages WHERE id IN ({})", placeholders(ids.len()));
        let deleted = self.conn.execute(&sql, params_from_iter(ids.iter()))?;
        Ok(deleted)
    }
}

const MESSAGE_COLUMNS: &str = "id, workspace_id, instagram_message_id, sender_instagram_id,
     sender_username, sender_name, sender_avatar_url, sender_followers_count,
     conversation_id, content, received_at, is_read, classification_status";

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbMessage> {
    Ok(DbMessage {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        instagram_message_id: row.get(2)?,
        sender_instagram_id: row.get(3)?,
        sender_username: row.get(4)?,
        sender_name: row.get(5)?,
        sender_avatar_url: row.get(6)?,
        sender_followers_count: row.get(7)?,
        conversation_id: row.get(8)?,
        content: row.get(9)?,
        received_at: parse_ts(&row.get::<_, String>(10)?)?,
        is_read: row.get(11)?,
        classification_status: row.get(12)?,
    })
}

#[cfg(test)]
pub(crate) fn test_message(workspace_id: &str, sender: &str, content: &str) -> NewMessage {
    NewMessage {
        workspace_id: workspace_id.to_string(),
        instagram_message_id: None,
        sender_instagram_id: sender.to_string(),
        sender_username: None,
        sender_name: None,
        sender_avatar_url: None,
        sender_followers_count: None,
        conversation_id: None,
        content: content.to_string(),
        received_at: Utc::now(),
    }
}
