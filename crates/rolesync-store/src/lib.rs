//! # rolesync-store
//!
//! Persistent state for the access synchronization engine, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for persons, roles,
//! chats, role/chat edges, per-pair membership records, access requests, the
//! append-only audit log and standing alerts.

pub mod audit;
pub mod chats;
pub mod database;
pub mod memberships;
pub mod migrations;
pub mod models;
pub mod persons;
pub mod requests;
pub mod roles;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
