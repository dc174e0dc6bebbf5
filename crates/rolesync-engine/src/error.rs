use rolesync_shared::{ChatId, LifecycleState, PersonId, RequestId, RoleId, SyncError};
use rolesync_store::StoreError;
use thiserror::Error;

/// Rejected lifecycle triggers.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Person {person} cannot move from {from} to {to}")]
    InvalidTransition {
        person: PersonId,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Person not found: {0}")]
    PersonNotFound(PersonId),

    #[error("Access request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Role not found: {0}")]
    RoleNotFound(RoleId),

    #[error("Access request {0} was already decided")]
    RequestDecided(RequestId),

    #[error("Approval requires a role")]
    RoleRequired,

    #[error("Person {person} is {state} and cannot register again")]
    AlreadyRegistered {
        person: PersonId,
        state: LifecycleState,
    },

    #[error("Person {0} is being terminated")]
    TerminationRequested(PersonId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by [`SyncEngine`](crate::SyncEngine) entry points.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Chat not found: {0}")]
    ChatNotFound(ChatId),

    /// A role name or external chat id is already registered.
    #[error("Already exists: {0}")]
    Duplicate(String),

    /// The pass task died or a merged pass reported a failure.
    #[error("Reconciliation pass failed: {0}")]
    PassFailed(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
