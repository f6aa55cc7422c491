//! CRUD operations for [`Conversation`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::friends::parse_ts;
use crate::models::Conversation;

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a conversation if it does not exist yet.  Existing rows are
    /// left untouched so repeated ensures are cheap no-ops.
    pub fn ensure_conversation(&self, id: Uuid, label: &str, is_group: bool) -> Result<()> {
        self.conn().execute(
            "INSERT INTO conversations (id, label, is_group)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO NOTHING",
            params![id.to_string(), label, is_group as i64],
        )?;
        Ok(())
    }

    /// Add a participant to a group conversation.
    pub fn add_participant(
        &self,
        conversation_id: Uuid,
        peer_id: Uuid,
        joined_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO conversation_participants (conversation_id, peer_id, joined_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(conversation_id, peer_id) DO NOTHING",
            params![
                conversation_id.to_string(),
                peer_id.to_string(),
                joined_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation by id, with participants.
    pub fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        let mut conversation = self
            .conn()
            .query_row(
                "SELECT id, label, avatar, last_message, last_timestamp,
                        unread_count, secret_ref, is_group
                 FROM conversations
                 WHERE id = ?1",
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        if conversation.is_group {
            conversation.participants = self.list_participants(id)?;
        }
        Ok(conversation)
    }

    /// List all conversations, most recently active first.
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, label, avatar, last_message, last_timestamp,
                    unread_count, secret_ref, is_group
             FROM conversations
             ORDER BY last_timestamp DESC",
        )?;

        let rows = stmt.query_map([], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            let mut conversation = row?;
            if conversation.is_group {
                conversation.participants = self.list_participants(conversation.id)?;
            }
            conversations.push(conversation);
        }
        Ok(conversations)
    }

    fn list_participants(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let mut stmt = self.conn().prepare(
            "SELECT peer_id FROM conversation_participants
             WHERE conversation_id = ?1
             ORDER BY joined_at ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut participants = Vec::new();
        for row in rows {
            let s = row?;
            participants.push(Uuid::parse_str(&s)?);
        }
        Ok(participants)
    }

    // ------------------------------------------------------------------
    // Message-driven updates
    // ------------------------------------------------------------------

    /// Record a newly stored message on its conversation.
    ///
    /// The preview and `last_timestamp` only move forward: an out-of-order
    /// older message leaves them alone, keeping `last_timestamp` equal to
    /// the maximum message timestamp in the thread.
    pub fn bump_conversation(
        &self,
        id: Uuid,
        preview: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations
             SET last_message = ?2, last_timestamp = ?3
             WHERE id = ?1
               AND (last_timestamp IS NULL OR last_timestamp <= ?3)",
            params![id.to_string(), preview, timestamp.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Increment the unread counter by one.
    pub fn increment_unread(&self, id: Uuid) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE conversations SET unread_count = unread_count + 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Reset the unread counter to zero.
    pub fn reset_unread(&self, id: Uuid) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE conversations SET unread_count = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Store an opaque reference to the shared secret in use.
    pub fn set_conversation_secret_ref(&self, id: Uuid, secret_ref: Option<&str>) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET secret_ref = ?2 WHERE id = ?1",
            params![id.to_string(), secret_ref],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Conversation`] (without participants).
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let label: String = row.get(1)?;
    let avatar: Option<String> = row.get(2)?;
    let last_message: Option<String> = row.get(3)?;
    let last_ts_str: Option<String> = row.get(4)?;
    let unread_count: i64 = row.get(5)?;
    let secret_ref: Option<String> = row.get(6)?;
    let is_group: i64 = row.get(7)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let last_timestamp = last_ts_str.map(|s| parse_ts(&s, 4)).transpose()?;

    Ok(Conversation {
        id,
        label,
        avatar,
        last_message,
        last_timestamp,
        unread_count: unread_count.max(0) as u32,
        secret_ref,
        is_group: is_group != 0,
        participants: Vec::new(),
    })
}
