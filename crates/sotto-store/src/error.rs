use thiserror::Error;

use crate::models::DeliveryStatus;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// An account record already exists; the store holds at most one.
    #[error("An account already exists in this store")]
    AccountExists,

    /// A message with this (msg_id, is_echo) pair is already stored.
    #[error("Message {0} already stored")]
    DuplicateMessage(uuid::Uuid),

    /// A delivery-status update that would move backwards or skip a step.
    #[error("Illegal status transition {from:?} -> {to:?}")]
    InvalidStatusTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// UUID parsing error.
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// Hex decoding error.
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    /// Malformed persisted JSON (e.g. KDF parameters).
    #[error("Stored JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
