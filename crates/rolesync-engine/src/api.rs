//! The external chat membership API, as the engine sees it.
//!
//! Implementations report raw failures as [`ApiError`]; sorting them into
//! the engine's failure classes is done here by [`classify`], never by the
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use rolesync_shared::{AgentRights, ExternalChatId, ExternalUserId, FailureClass};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result of a successful admission call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmitOutcome {
    /// The person was added directly.
    Joined,
    /// An invitation was delivered; membership follows asynchronously. The
    /// handle identifies the invitation to [`ChatApi::revoke_invitation`].
    Invited { invitation: String },
}

/// What the platform currently says about a person in a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Member,
    /// Not in the chat and free to join.
    Absent,
    /// Not in the chat and barred from rejoining.
    Excluded,
}

/// Raw failure of an external call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("call timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The platform refused the call for a reason that retrying will not fix.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Sort a raw API failure into a handling class.
pub fn classify(err: &ApiError) -> FailureClass {
    match err {
        ApiError::Network(_) | ApiError::Timeout | ApiError::RateLimited { .. } => {
            FailureClass::Transient
        }
        ApiError::Forbidden(_) => FailureClass::Permission,
        ApiError::NotFound(_) => FailureClass::NotFound,
        // A refusal means the platform's view differs from ours; the caller
        // re-reads the pair before deciding anything else.
        ApiError::Rejected(_) => FailureClass::Inconsistent,
    }
}

/// Membership operations on an external chat platform.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// What the synchronizing agent itself may do in `chat`.
    async fn check_agent_rights(&self, chat: ExternalChatId) -> Result<AgentRights, ApiError>;

    async fn admit(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<AdmitOutcome, ApiError>;

    /// Withdraw an invitation issued by [`ChatApi::admit`] so it can no
    /// longer be used to join. Withdrawing a spent or expired invitation
    /// succeeds.
    async fn revoke_invitation(
        &self,
        chat: ExternalChatId,
        invitation: &str,
    ) -> Result<(), ApiError>;

    /// Remove `user` from `chat` and bar them from rejoining.
    async fn exclude_member(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<(), ApiError>;

    /// Lift an exclusion so `user` is merely absent.
    async fn release_exclusion(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<(), ApiError>;

    async fn observe_member(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<Presence, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(classify(&ApiError::Timeout), FailureClass::Transient);
        assert_eq!(
            classify(&ApiError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }),
            FailureClass::Transient
        );
        assert_eq!(
            classify(&ApiError::Forbidden("not enough rights".into())),
            FailureClass::Permission
        );
        assert_eq!(
            classify(&ApiError::NotFound("chat not found".into())),
            FailureClass::NotFound
        );
        assert_eq!(
            classify(&ApiError::Rejected("user is an administrator".into())),
            FailureClass::Inconsistent
        );
    }
}
