//! # sotto-store
//!
//! Local durable storage for the Sotto client, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for the four
//! durable collections: the account record, friends, conversations, and
//! messages.  Schema changes ship as ordered additive migrations that run
//! exactly once at open time.

pub mod accounts;
pub mod conversations;
pub mod database;
pub mod friends;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
