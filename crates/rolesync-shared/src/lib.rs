//! # rolesync-shared
//!
//! Identifiers, state enums and the failure taxonomy shared by the store,
//! the synchronization engine and the server binary.

pub mod constants;
pub mod error;
pub mod types;

pub use error::{FailureClass, ParseError, SyncError};
pub use types::*;
