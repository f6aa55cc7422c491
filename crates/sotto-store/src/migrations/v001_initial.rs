//! v001 -- Initial schema creation.
//!
//! Creates the four core collections: `accounts` (single row), `friends`,
//! `conversations`, and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Accounts (exactly one row)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS accounts (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    username     TEXT NOT NULL,
    kdf_salt     TEXT NOT NULL,               -- hex-encoded 16-byte salt
    kdf_params   TEXT NOT NULL,               -- tagged JSON (algorithm + costs)
    key_verifier TEXT NOT NULL,               -- BLAKE3 tag over derived key, hex
    public_key   TEXT NOT NULL,               -- hex-encoded 32-byte X25519 key
    secret_key   TEXT NOT NULL,               -- hex-encoded 32-byte X25519 key
    created_at   TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Friends
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friends (
    peer_id        TEXT PRIMARY KEY NOT NULL, -- UUID v4
    username       TEXT NOT NULL,
    avatar         TEXT,
    status_message TEXT,
    state          TEXT NOT NULL,             -- pending_outgoing | pending_incoming | friend
    blocked        INTEGER NOT NULL DEFAULT 0,
    public_key     TEXT,                      -- hex; NULL until exchanged
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_friends_state ON friends(state);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id             TEXT PRIMARY KEY NOT NULL, -- peer UUID for 1:1
    label          TEXT NOT NULL,
    avatar         TEXT,
    last_message   TEXT,                      -- preview of most recent message
    last_timestamp TEXT,
    unread_count   INTEGER NOT NULL DEFAULT 0,
    secret_ref     TEXT
);

CREATE INDEX IF NOT EXISTS idx_conversations_last_ts
    ON conversations(last_timestamp DESC);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    local_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    msg_id          TEXT NOT NULL,            -- UUID, assigned by the sender
    conversation_id TEXT NOT NULL,            -- FK -> conversations(id)
    from_id         TEXT NOT NULL,
    to_id           TEXT NOT NULL,
    body            TEXT NOT NULL,            -- decrypted plaintext
    raw_payload     BLOB NOT NULL,            -- ciphertext, kept for re-decryption
    timestamp       TEXT NOT NULL,            -- ISO-8601
    status          TEXT NOT NULL DEFAULT 'sending',
    is_echo         INTEGER NOT NULL DEFAULT 0,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

-- msg_id is globally unique, but an authoritative record and its echo may
-- coexist, so uniqueness is on the pair.
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_msg_id
    ON messages(msg_id, is_echo);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
