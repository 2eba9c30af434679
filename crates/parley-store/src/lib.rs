//! # parley-store
//!
//! Durable storage for the chat backend, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every domain
//! model, split per entity. Uniqueness constraints on the conversation
//! pair, group membership, and message-media join are enforced by the
//! schema and relied on by the server.

pub mod conversations;
pub mod database;
pub mod groups;
pub mod media;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod notifications;
pub mod sessions;
pub mod tokens;
pub mod users;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use messages::MessageSearch;
pub use models::*;
