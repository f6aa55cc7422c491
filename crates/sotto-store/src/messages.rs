//! CRUD operations for [`Message`] records, including the status
//! transition gate.

use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::friends::parse_ts;
use crate::models::{DeliveryStatus, Message, ReplyRef};

const MESSAGE_COLUMNS: &str = "local_id, msg_id, conversation_id, from_id, to_id, body,
                               raw_payload, timestamp, status, is_echo,
                               reply_to_id, reply_preview, reply_sender";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a message.  Fails with [`StoreError::DuplicateMessage`] if a
    /// record with the same (msg_id, is_echo) pair is already stored, which
    /// makes redelivery by the transport harmless.
    pub fn insert_message(&self, message: &Message) -> Result<i64> {
        let result = self.conn().execute(
            "INSERT INTO messages (msg_id, conversation_id, from_id, to_id, body,
                                   raw_payload, timestamp, status, is_echo,
                                   reply_to_id, reply_preview, reply_sender)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                message.msg_id.to_string(),
                message.conversation_id.to_string(),
                message.from_id.to_string(),
                message.to_id.to_string(),
                message.body,
                message.raw_payload,
                message.timestamp.to_rfc3339(),
                message.status.as_str(),
                message.is_echo as i64,
                message.reply.as_ref().map(|r| r.target_msg_id.to_string()),
                message.reply.as_ref().map(|r| r.preview.clone()),
                message.reply.as_ref().map(|r| r.sender.to_string()),
            ],
        );

        match result {
            Ok(_) => Ok(self.conn().last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateMessage(message.msg_id))
            }
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch the authoritative (non-echo) record for a msg_id.
    pub fn get_message(&self, msg_id: Uuid) -> Result<Message> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE msg_id = ?1 AND is_echo = 0"
                ),
                params![msg_id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Whether any record (authoritative or echo) exists for the pair.
    pub fn message_exists(&self, msg_id: Uuid, is_echo: bool) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE msg_id = ?1 AND is_echo = ?2",
            params![msg_id.to_string(), is_echo as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Page through a conversation's messages, newest first.  Echo records
    /// are excluded; the authoritative copy drives ordering and display.
    pub fn get_messages_for_conversation(
        &self,
        conversation_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND is_echo = 0
             ORDER BY timestamp DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(
            params![conversation_id.to_string(), limit, offset],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------

    /// Apply a delivery-status transition to the authoritative record.
    ///
    /// The monotonic table in [`DeliveryStatus::can_transition_to`] is
    /// enforced, and the UPDATE is gated on the prior status so concurrent
    /// writers linearize: the last valid transition wins and illegal ones
    /// are rejected, never silently dropped.
    pub fn update_message_status(
        &self,
        msg_id: Uuid,
        new_status: DeliveryStatus,
    ) -> Result<DeliveryStatus> {
        let current = self.get_message(msg_id)?.status;

        if !current.can_transition_to(new_status) {
            return Err(StoreError::InvalidStatusTransition {
                from: current,
                to: new_status,
            });
        }

        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2
             WHERE msg_id = ?1 AND is_echo = 0 AND status = ?3",
            params![
                msg_id.to_string(),
                new_status.as_str(),
                current.as_str(),
            ],
        )?;

        if affected == 0 {
            // The row moved under us between read and write; the prior
            // status gate kept this update from clobbering it.
            return Err(StoreError::InvalidStatusTransition {
                from: current,
                to: new_status,
            });
        }
        Ok(new_status)
    }

    /// Transition every `delivered` message in a conversation to `read`.
    /// Returns the msg_ids that changed, for read-acknowledgement.
    pub fn mark_delivered_as_read(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let mut stmt = self.conn().prepare(
            "SELECT msg_id FROM messages
             WHERE conversation_id = ?1 AND is_echo = 0 AND status = 'delivered'",
        )?;
        let rows = stmt.query_map(params![conversation_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(Uuid::parse_str(&row?)?);
        }

        self.conn().execute(
            "UPDATE messages SET status = 'read'
             WHERE conversation_id = ?1 AND is_echo = 0 AND status = 'delivered'",
            params![conversation_id.to_string()],
        )?;

        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Re-decryption support
    // ------------------------------------------------------------------

    /// Overwrite the stored plaintext of every record for a msg_id.  Used
    /// after a successful re-decryption of the retained raw payload.
    pub fn update_message_body(&self, msg_id: Uuid, body: &str) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET body = ?2 WHERE msg_id = ?1",
            params![msg_id.to_string(), body],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Highest message timestamp in a conversation, if any.  Used to check
    /// the `last_timestamp` invariant.
    pub fn max_message_timestamp(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let result: Option<String> = self.conn().query_row(
            "SELECT MAX(timestamp) FROM messages
             WHERE conversation_id = ?1 AND is_echo = 0",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )?;
        result.map(|s| parse_ts(&s, 0).map_err(StoreError::Sqlite)).transpose()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let local_id: i64 = row.get(0)?;
    let msg_id_str: String = row.get(1)?;
    let conversation_str: String = row.get(2)?;
    let from_str: String = row.get(3)?;
    let to_str: String = row.get(4)?;
    let body: String = row.get(5)?;
    let raw_payload: Vec<u8> = row.get(6)?;
    let ts_str: String = row.get(7)?;
    let status_str: String = row.get(8)?;
    let is_echo: i64 = row.get(9)?;
    let reply_to: Option<String> = row.get(10)?;
    let reply_preview: Option<String> = row.get(11)?;
    let reply_sender: Option<String> = row.get(12)?;

    let parse_uuid = |s: &str, column: usize| {
        Uuid::parse_str(s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
    };

    let msg_id = parse_uuid(&msg_id_str, 1)?;
    let conversation_id = parse_uuid(&conversation_str, 2)?;
    let from_id = parse_uuid(&from_str, 3)?;
    let to_id = parse_uuid(&to_str, 4)?;

    let timestamp = parse_ts(&ts_str, 7)?;

    let status = DeliveryStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("unknown delivery status {status_str:?}").into(),
        )
    })?;

    let reply = match (reply_to, reply_preview, reply_sender) {
        (Some(target), Some(preview), Some(sender)) => Some(ReplyRef {
            target_msg_id: parse_uuid(&target, 10)?,
            preview,
            sender: parse_uuid(&sender, 12)?,
        }),
        _ => None,
    };

    Ok(Message {
        local_id,
        msg_id,
        conversation_id,
        from_id,
        to_id,
        body,
        raw_payload,
        timestamp,
        status,
        is_echo: is_echo != 0,
        reply,
    })
}
