use chrono::{DateTime, Utc};
use rolesync_shared::{AgentRights, ChatId, ExternalChatId, FailureClass, LifecycleState, MemberState, PersonId, RoleId};
use rolesync_store::Person;
use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineError;
use crate::reconciler::Operation;
use crate::status::PersonStatus;

/// Result of one operation inside a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpReport {
    pub operation: Operation,
    /// Pair state after the operation, when it completed.
    pub state: Option<MemberState>,
    pub error: Option<String>,
    pub class: Option<FailureClass>,
    /// Not attempted because an earlier step for the same pair failed.
    pub skipped: bool,
}

impl OpReport {
    pub fn from_result(operation: Operation, result: Result<MemberState, EngineError>) -> Self {
        match result {
            Ok(state) => Self {
                operation,
                state: Some(state),
                error: None,
                class: None,
                skipped: false,
            },
            Err(e) => {
                let class = match &e {
                    EngineError::Sync(sync) => Some(sync.class()),
                    _ => None,
                };
                Self {
                    operation,
                    state: None,
                    error: Some(e.to_string()),
                    class,
                    skipped: false,
                }
            }
        }
    }

    pub fn skipped(operation: Operation, reason: impl Into<String>) -> Self {
        Self {
            operation,
            state: None,
            error: Some(reason.into()),
            class: Some(FailureClass::Inconsistent),
            skipped: true,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one reconciliation pass for one person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub person: PersonId,
    /// Role version the pass worked against.
    pub role_version: i64,
    pub verified: bool,
    /// Pairs whose cached state was checked against the platform.
    pub observed: usize,
    pub rounds: u32,
    pub operations: Vec<OpReport>,
    /// Lifecycle state after the pass settled.
    pub lifecycle: LifecycleState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PassReport {
    pub fn failures(&self) -> impl Iterator<Item = &OpReport> {
        self.operations.iter().filter(|op| !op.is_ok())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Response to a lifecycle trigger: the person as persisted, the pass it
/// started (if any), and the resulting status.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerReport {
    pub person: Person,
    pub pass: Option<PassReport>,
    /// Set when the pass itself could not run. The trigger still stands.
    pub pass_error: Option<String>,
    pub status: PersonStatus,
}

/// Passes run for a batch of persons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassTally {
    pub persons: usize,
    pub clean: usize,
    pub with_failures: usize,
    pub errors: usize,
}

/// A role's chat set after a change, and the passes run for its holders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleUpdate {
    pub role: RoleId,
    pub chats: Vec<ChatId>,
    pub passes: PassTally,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub persons: usize,
    pub clean: usize,
    pub with_failures: usize,
    pub errors: usize,
    /// Audit records deleted for being past retention.
    pub pruned: usize,
}

/// Agent rights in one chat after a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRights {
    pub chat: ChatId,
    pub external_id: ExternalChatId,
    pub rights: Option<AgentRights>,
    pub error: Option<String>,
}
