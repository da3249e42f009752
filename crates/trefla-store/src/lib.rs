//! # trefla-store
//!
//! Relational storage for the Trefla server, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for users, chats,
//! messages, notifications, back-office work items and per-card version
//! counters.  Ordered sequences (ownership chains, per-slot chat state,
//! admin payloads) are JSON text columns; they are decoded into typed values
//! here and never leave the crate as strings.

pub mod admin;
pub mod card_claims;
pub mod chats;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod notifications;
pub mod users;

mod error;
mod row;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
