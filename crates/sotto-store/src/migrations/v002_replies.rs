//! v002 -- Reply context and status index.
//!
//! Adds the optional reply-reference columns to `messages` plus the
//! secondary indexes on status and reply target.

use rusqlite::Connection;

const UP_SQL: &str = r#"
ALTER TABLE messages ADD COLUMN reply_to_id TEXT;     -- msg_id of quoted message
ALTER TABLE messages ADD COLUMN reply_preview TEXT;   -- quoted preview text
ALTER TABLE messages ADD COLUMN reply_sender TEXT;    -- UUID of quoted sender

CREATE INDEX IF NOT EXISTS idx_messages_reply_to ON messages(reply_to_id);
CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
