//! Cached conversation lists.

use chrono::Utc;
use rusqlite::params;

use parley_shared::models::Conversation;
use parley_shared::types::UserId;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Replace the cached conversation list of `viewer`, keeping its order.
    pub fn replace_conversations(
        &mut self,
        viewer: &UserId,
        conversations: &[Conversation],
    ) -> Result<()> {
        let cached_at = Utc::now().to_rfc3339();
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM conversations WHERE viewer_id = ?1",
            params![viewer.as_str()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO conversations (viewer_id, id, position, json, updated_at, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (position, conversation) in conversations.iter().enumerate() {
                stmt.execute(params![
                    viewer.as_str(),
                    conversation.id.as_str(),
                    position as i64,
                    serde_json::to_string(conversation)?,
                    conversation.updated_at.to_rfc3339(),
                    cached_at,
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(viewer = %viewer, count = conversations.len(), "cached conversation list");
        Ok(())
    }

    /// The cached conversation list of `viewer`, in the order it was stored.
    pub fn load_conversations(&self, viewer: &UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT json FROM conversations
             WHERE viewer_id = ?1
             ORDER BY position ASC",
        )?;

        let rows = stmt.query_map(params![viewer.as_str()], |row| row.get::<_, String>(0))?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(serde_json::from_str(&row?)?);
        }
        Ok(conversations)
    }

    /// Zero the cached unread counter of one conversation.
    pub fn clear_cached_unread(&self, viewer: &UserId, conversation: &Conversation) -> Result<bool> {
        let mut cleared = conversation.clone();
        cleared.unread_count = 0;
        let affected = self.conn().execute(
            "UPDATE conversations SET json = ?3 WHERE viewer_id = ?1 AND id = ?2",
            params![
                viewer.as_str(),
                conversation.id.as_str(),
                serde_json::to_string(&cleared)?
            ],
        )?;
        Ok(affected > 0)
    }
}
