use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ExternalChatId;

/// Coarse failure categories used to pick a handling policy.
///
/// The external API never labels its own errors; the engine sorts each
/// failure into one of these before deciding whether to retry, alert or
/// treat the call as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network, rate limit or timeout. Retried with backoff.
    Transient,
    /// The agent lacks administrative rights. Never retried automatically.
    Permission,
    /// The target is already gone. Equivalent to success for removals.
    NotFound,
    /// The local cache disagrees with a definitive API read.
    Inconsistent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Permission => "permission",
            FailureClass::NotFound => "not_found",
            FailureClass::Inconsistent => "inconsistent",
        }
    }
}

/// Outcome of a failed (person, chat) operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("transient failure after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },

    #[error("agent lacks administrative rights in chat {0}")]
    InsufficientPrivilege(ExternalChatId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    /// Admission was requested while the exclusion of an earlier eviction
    /// is still in place.
    #[error("eviction still pending release; admission deferred")]
    EvictionPending,
}

impl SyncError {
    pub fn class(&self) -> FailureClass {
        match self {
            SyncError::Transient { .. } => FailureClass::Transient,
            SyncError::InsufficientPrivilege(_) => FailureClass::Permission,
            SyncError::NotFound(_) => FailureClass::NotFound,
            SyncError::Inconsistent(_) | SyncError::EvictionPending => FailureClass::Inconsistent,
        }
    }
}

/// Failure to decode a stored or transmitted enum value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown {kind} value: {value:?}")]
    UnknownValue { kind: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_classes() {
        let transient = SyncError::Transient {
            attempts: 3,
            message: "timeout".into(),
        };
        assert_eq!(transient.class(), FailureClass::Transient);
        assert_eq!(
            SyncError::InsufficientPrivilege(ExternalChatId(-100)).class(),
            FailureClass::Permission
        );
        assert_eq!(SyncError::EvictionPending.class(), FailureClass::Inconsistent);
    }

    #[test]
    fn transient_message_mentions_attempts() {
        let err = SyncError::Transient {
            attempts: 5,
            message: "rate limited".into(),
        };
        assert_eq!(
            err.to_string(),
            "transient failure after 5 attempt(s): rate limited"
        );
    }
}
