//! # parley-cache
//!
//! Offline read cache for the chat client, backed by SQLite.
//!
//! Keeps the last conversation list and the last message page per
//! conversation for each viewing user, so the client can render something
//! before the network answers. The crate exposes a synchronous `Database`
//! handle wrapping a `rusqlite::Connection`; callers serialise access.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;

mod error;

pub use database::Database;
pub use error::{CacheError, Result};
