//! v003 -- Group conversations.
//!
//! Adds the group flag to `conversations` and the participant list table.
//! Existing 1:1 rows keep reading as before with `is_group = 0`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
ALTER TABLE conversations ADD COLUMN is_group INTEGER NOT NULL DEFAULT 0;

CREATE TABLE IF NOT EXISTS conversation_participants (
    conversation_id TEXT NOT NULL,            -- FK -> conversations(id)
    peer_id         TEXT NOT NULL,            -- UUID v4
    joined_at       TEXT NOT NULL,            -- ISO-8601

    PRIMARY KEY (conversation_id, peer_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_peer
    ON conversation_participants(peer_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
