//! CRUD operations for [`Friend`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::accounts::hex_to_array;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Friend, FriendState};

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert or replace a friend record, keyed by peer UUID.
    pub fn upsert_friend(&self, friend: &Friend) -> Result<()> {
        self.conn().execute(
            "INSERT INTO friends (peer_id, username, avatar, status_message, state,
                                  blocked, public_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(peer_id) DO UPDATE SET
                 username = excluded.username,
                 avatar = excluded.avatar,
                 status_message = excluded.status_message,
                 state = excluded.state,
                 blocked = excluded.blocked,
                 public_key = excluded.public_key,
                 updated_at = excluded.updated_at",
            params![
                friend.peer_id.to_string(),
                friend.username,
                friend.avatar,
                friend.status_message,
                friend.state.as_str(),
                friend.blocked as i64,
                friend.public_key.map(hex::encode),
                friend.created_at.to_rfc3339(),
                friend.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Update only the relationship state and public key of a record.
    pub fn update_friend_state(
        &self,
        peer_id: Uuid,
        state: FriendState,
        public_key: Option<&[u8; 32]>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE friends
             SET state = ?2,
                 public_key = COALESCE(?3, public_key),
                 updated_at = ?4
             WHERE peer_id = ?1",
            params![
                peer_id.to_string(),
                state.as_str(),
                public_key.map(hex::encode),
                updated_at.to_rfc3339(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Set or clear the block flag.  Relationship state is untouched.
    pub fn set_friend_blocked(
        &self,
        peer_id: Uuid,
        blocked: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE friends SET blocked = ?2, updated_at = ?3 WHERE peer_id = ?1",
            params![
                peer_id.to_string(),
                blocked as i64,
                updated_at.to_rfc3339(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single friend by peer UUID.
    pub fn get_friend(&self, peer_id: Uuid) -> Result<Friend> {
        self.conn()
            .query_row(
                "SELECT peer_id, username, avatar, status_message, state,
                        blocked, public_key, created_at, updated_at
                 FROM friends
                 WHERE peer_id = ?1",
                params![peer_id.to_string()],
                row_to_friend,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Whether a peer exists and is blocked.  Unknown peers are not blocked.
    pub fn is_peer_blocked(&self, peer_id: Uuid) -> Result<bool> {
        let result = self.conn().query_row(
            "SELECT blocked FROM friends WHERE peer_id = ?1",
            params![peer_id.to_string()],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(v) => Ok(v != 0),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    /// List all friend records, ordered by username.
    pub fn list_friends(&self) -> Result<Vec<Friend>> {
        let mut stmt = self.conn().prepare(
            "SELECT peer_id, username, avatar, status_message, state,
                    blocked, public_key, created_at, updated_at
             FROM friends
             ORDER BY username ASC",
        )?;

        let rows = stmt.query_map([], row_to_friend)?;

        let mut friends = Vec::new();
        for row in rows {
            friends.push(row?);
        }
        Ok(friends)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a friend record.  Returns `true` if a row was deleted.
    pub fn delete_friend(&self, peer_id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM friends WHERE peer_id = ?1",
            params![peer_id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Friend`].
fn row_to_friend(row: &rusqlite::Row<'_>) -> rusqlite::Result<Friend> {
    let peer_id_str: String = row.get(0)?;
    let username: String = row.get(1)?;
    let avatar: Option<String> = row.get(2)?;
    let status_message: Option<String> = row.get(3)?;
    let state_str: String = row.get(4)?;
    let blocked: i64 = row.get(5)?;
    let public_hex: Option<String> = row.get(6)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;

    let peer_id = Uuid::parse_str(&peer_id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let state = FriendState::parse(&state_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown friend state {state_str:?}").into(),
        )
    })?;

    let public_key = public_hex
        .map(|h| hex_to_array::<32>(&h, 6))
        .transpose()?;

    let created_at = parse_ts(&created_str, 7)?;
    let updated_at = parse_ts(&updated_str, 8)?;

    Ok(Friend {
        peer_id,
        username,
        avatar,
        status_message,
        state,
        blocked: blocked != 0,
        public_key,
        created_at,
        updated_at,
    })
}

pub(crate) fn parse_ts(s: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}
