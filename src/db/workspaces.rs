use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::{parse_ts, ts, TriageDb};
use crate::error::TriageError;
use crate::types::DbWorkspace;

impl TriageDb {
    // =========================================================================
    // Workspaces
    // =========================================================================

    /// Resolve the workspace owning an Instagram page id. Misses are expected
    /// noise from shared webhook subscriptions and return `None`.
    pub fn find_workspace_by_page_id(
        &self,
        page_id: &str,
    ) -> Result<Option<DbWorkspace>, TriageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner_id, name, instagram_page_id, created_at
             FROM workspaces
             WHERE instagram_page_id = ?1",
        )?;

        let workspace = stmt
            .query_row(params![page_id], Self::map_workspace)
            .optional()?;
        Ok(workspace)
    }

    pub fn workspaces_for_owner(&self, owner_id: &str) -> Result<Vec<DbWorkspace>, TriageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner_id, name, instagram_page_id, created_at
             FROM workspaces
             WHERE owner_id = ?1",
        )?;

        let rows = stmt.query_map(params![owner_id], Self::map_workspace)?;
        let mut workspaces = Vec::new();
        for row in rows {
            workspaces.push(row?);
        }
        Ok(workspaces)
    }

    /// Create the owner's single workspace, or repoint the existing one at a
    /// (re)connected Instagram identity.
    pub fn upsert_workspace(
        &self,
        owner_id: &str,
        name: &str,
        instagram_page_id: &str,
    ) -> Result<DbWorkspace, TriageError> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM workspaces WHERE owner_id = ?1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                self.conn.execute(
                    "UPDATE workspaces SET name = ?1, instagram_page_id = ?2 WHERE id = ?3",
                    params![name, instagram_page_id, id],
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                self.conn.execute(
                    "INSERT INTO workspaces (id, owner_id, name, instagram_page_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, owner_id, name, instagram_page_id, ts(Utc::now())],
                )?;
                id
            }
        };

        self.find_workspace_by_page_id(instagram_page_id)?
            .filter(|ws| ws.id == id)
            .ok_or(TriageError::NotFound("workspace"))
    }

    pub fn delete_workspace(&self, workspace_id: &str) -> Result<(), TriageError> {
        self.conn
            .execute("DELETE FROM workspaces WHERE id = ?1", params![workspace_id])?;
        Ok(())
    }

    fn map_workspace(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbWorkspace> {
        Ok(DbWorkspace {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            instagram_page_id: row.get(3)?,
            created_at: parse_ts(&row.get::<_, String>(4)?)?,
        })
    }
}
