//! Cached message pages.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_shared::models::Message;
use parley_shared::types::{ConversationId, UserId};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Replace the cached page of one conversation, keeping its order.
    pub fn replace_messages(
        &mut self,
        viewer: &UserId,
        conversation: &ConversationId,
        messages: &[Message],
    ) -> Result<()> {
        let cached_at = Utc::now().to_rfc3339();
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE viewer_id = ?1 AND conversation_id = ?2",
            params![viewer.as_str(), conversation.as_str()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages
                    (viewer_id, conversation_id, id, position, json, timestamp, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (position, message) in messages.iter().enumerate() {
                stmt.execute(params![
                    viewer.as_str(),
                    conversation.as_str(),
                    message.id.as_str(),
                    position as i64,
                    serde_json::to_string(message)?,
                    message.timestamp.to_rfc3339(),
                    cached_at,
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(
            viewer = %viewer,
            conversation = %conversation,
            count = messages.len(),
            "cached message page"
        );
        Ok(())
    }

    /// Insert a live arrival at the end of the page, or replace it in place.
    pub fn upsert_message(&self, viewer: &UserId, message: &Message) -> Result<()> {
        let next_position: i64 = self
            .conn()
            .query_row(
                "SELECT MAX(position) FROM messages
                 WHERE viewer_id = ?1 AND conversation_id = ?2",
                params![viewer.as_str(), message.conversation_id.as_str()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten()
            .map(|p| p + 1)
            .unwrap_or(0);

        self.conn().execute(
            "INSERT INTO messages
                (viewer_id, conversation_id, id, position, json, timestamp, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (viewer_id, conversation_id, id)
             DO UPDATE SET json = excluded.json, cached_at = excluded.cached_at",
            params![
                viewer.as_str(),
                message.conversation_id.as_str(),
                message.id.as_str(),
                next_position,
                serde_json::to_string(message)?,
                message.timestamp.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The cached page of one conversation, in the order it was stored.
    pub fn load_messages(
        &self,
        viewer: &UserId,
        conversation: &ConversationId,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT json FROM messages
             WHERE viewer_id = ?1 AND conversation_id = ?2
             ORDER BY position ASC",
        )?;

        let rows = stmt.query_map(params![viewer.as_str(), conversation.as_str()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(serde_json::from_str(&row?)?);
        }
        Ok(messages)
    }

    /// Drop everything cached for `viewer` (e.g. on sign-out).
    pub fn clear_viewer(&mut self, viewer: &UserId) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE viewer_id = ?1",
            params![viewer.as_str()],
        )?;
        tx.execute(
            "DELETE FROM conversations WHERE viewer_id = ?1",
            params![viewer.as_str()],
        )?;
        tx.commit()?;
        tracing::info!(viewer = %viewer, "cleared cache for viewer");
        Ok(())
    }
}
