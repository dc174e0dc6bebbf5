//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the HTTP layer.

use chrono::{DateTime, Utc};
use rolesync_shared::{
    AlertKind, AuditOperation, AuditOutcome, ChatId, ExternalChatId, ExternalUserId,
    LifecycleState, MemberState, PairKey, PersonId, RequestId, RequestState, RoleId,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Person
// ---------------------------------------------------------------------------

/// A person whose chat access is managed. Never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Person {
    pub id: PersonId,
    /// Identity on the chat platform.
    pub external_id: ExternalUserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub lifecycle: LifecycleState,
    /// Currently assigned role, if any.
    pub role_id: Option<RoleId>,
    /// Bumped on every role assignment. A reconciliation pass reads the role
    /// together with this version exactly once.
    pub role_version: i64,
    /// Set by termination; the target lifecycle state is `Terminated` until
    /// every chat reports removal.
    pub termination_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Person {
    /// The lifecycle state the engine is driving this person towards.
    pub fn target_lifecycle(&self) -> LifecycleState {
        if self.termination_requested {
            LifecycleState::Terminated
        } else {
            self.lifecycle
        }
    }
}

/// Profile collected by the registration front-end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewPerson {
    pub external_id: ExternalUserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
}

// ---------------------------------------------------------------------------
// Role / Chat
// ---------------------------------------------------------------------------

/// A named entitlement bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An external group chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    pub external_id: ExternalChatId,
    pub title: String,
    pub invite_link: Option<String>,
    /// Cached result of the last agent rights check.
    pub agent_is_admin: bool,
    pub rights_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewChat {
    pub external_id: ExternalChatId,
    pub title: String,
    pub invite_link: Option<String>,
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Last known state of one (person, chat) pair.
///
/// A pair without a stored row reads as `Absent` at version 0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipRecord {
    pub person_id: PersonId,
    pub chat_id: ChatId,
    pub state: MemberState,
    pub version: i64,
    pub last_error: Option<String>,
    /// Handle of an invitation delivered to the person and not withdrawn.
    #[serde(skip_serializing)]
    pub invitation: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MembershipRecord {
    pub fn absent(pair: PairKey) -> Self {
        Self {
            person_id: pair.person,
            chat_id: pair.chat,
            state: MemberState::Absent,
            version: 0,
            last_error: None,
            invitation: None,
            updated_at: None,
        }
    }

    pub fn pair(&self) -> PairKey {
        PairKey::new(self.person_id, self.chat_id)
    }
}

// ---------------------------------------------------------------------------
// Access request
// ---------------------------------------------------------------------------

/// One registration-to-decision cycle. Decided requests are immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessRequest {
    pub id: RequestId,
    pub person_id: PersonId,
    pub state: RequestState,
    /// Role granted at decision time (approved requests only).
    pub role_id: Option<RoleId>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Audit / alerts
// ---------------------------------------------------------------------------

/// A row of the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub id: i64,
    pub person_id: Option<PersonId>,
    pub chat_id: Option<ChatId>,
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    /// 1-based attempt number; 0 for records that made no external call.
    pub attempt: u32,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewAuditRecord {
    pub person_id: Option<PersonId>,
    pub chat_id: Option<ChatId>,
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    pub attempt: u32,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Filters for audit log listings. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditQuery {
    pub person_id: Option<PersonId>,
    pub chat_id: Option<ChatId>,
    pub operation: Option<AuditOperation>,
    pub outcome: Option<AuditOutcome>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditStats {
    pub total: u64,
    pub last_24h: u64,
    pub last_7d: u64,
}

/// A standing alert that needs operator attention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alert {
    pub id: i64,
    pub person_id: PersonId,
    pub chat_id: ChatId,
    pub kind: AlertKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Statistics {
    pub total_persons: u64,
    pub pending: u64,
    pub approved: u64,
    pub rejected: u64,
    pub active: u64,
    pub terminated: u64,
    pub total_roles: u64,
    pub total_chats: u64,
    pub open_alerts: u64,
}
