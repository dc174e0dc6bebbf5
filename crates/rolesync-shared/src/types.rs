use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

// Internal row identifiers are SQLite integer keys; external identifiers are
// whatever the chat platform hands out (Telegram uses signed 64-bit ids).
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Internal person id.
    PersonId
);
id_type!(
    /// Internal role id.
    RoleId
);
id_type!(
    /// Internal chat id.
    ChatId
);
id_type!(
    /// Internal access request id.
    RequestId
);
id_type!(
    /// Person identity on the chat platform.
    ExternalUserId
);
id_type!(
    /// Group identity on the chat platform.
    ExternalChatId
);

/// A (person, chat) pair. Leases, membership records and operations are all
/// keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub person: PersonId,
    pub chat: ChatId,
}

impl PairKey {
    pub fn new(person: PersonId, chat: ChatId) -> Self {
        Self { person, chat }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.person, self.chat)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Person-level workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Approved,
    Rejected,
    Active,
    Terminated,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 5] = [
        LifecycleState::Pending,
        LifecycleState::Approved,
        LifecycleState::Rejected,
        LifecycleState::Active,
        LifecycleState::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Approved => "approved",
            LifecycleState::Rejected => "rejected",
            LifecycleState::Active => "active",
            LifecycleState::Terminated => "terminated",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Rejected | LifecycleState::Terminated)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// `Approved -> Terminated` covers terminating a person whose first
    /// admission pass never fully converged.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Active)
                | (Approved, Terminated)
                | (Active, Active)
                | (Active, Terminated)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LifecycleState::Pending),
            "approved" => Ok(LifecycleState::Approved),
            "rejected" => Ok(LifecycleState::Rejected),
            "active" => Ok(LifecycleState::Active),
            "terminated" => Ok(LifecycleState::Terminated),
            other => Err(ParseError::UnknownValue {
                kind: "lifecycle state",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-pair membership
// ---------------------------------------------------------------------------

/// Last known state of one (person, chat) pair.
///
/// `Removed` is re-enterable: a later admission moves the pair back to
/// `Invited` or `Member`. `PartiallyRemoved` means the exclusion step ran
/// but the release step has not, so the person is currently barred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    #[default]
    Absent,
    Invited,
    Member,
    PartiallyRemoved,
    Removed,
}

impl MemberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberState::Absent => "absent",
            MemberState::Invited => "invited",
            MemberState::Member => "member",
            MemberState::PartiallyRemoved => "partially_removed",
            MemberState::Removed => "removed",
        }
    }

    /// The person is, may soon be, or is barred from being in the chat.
    /// Such a pair needs an eviction when it is not entitled.
    pub fn is_held(&self) -> bool {
        matches!(
            self,
            MemberState::Invited | MemberState::Member | MemberState::PartiallyRemoved
        )
    }

    /// Nothing is outstanding against the chat for this person.
    pub fn is_clear(&self) -> bool {
        matches!(self, MemberState::Absent | MemberState::Removed)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absent" => Ok(MemberState::Absent),
            "invited" => Ok(MemberState::Invited),
            "member" => Ok(MemberState::Member),
            "partially_removed" => Ok(MemberState::PartiallyRemoved),
            "removed" => Ok(MemberState::Removed),
            other => Err(ParseError::UnknownValue {
                kind: "member state",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Access requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Approved,
    Rejected,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Approved => "approved",
            RequestState::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestState::Pending)
    }
}

impl FromStr for RequestState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestState::Pending),
            "approved" => Ok(RequestState::Approved),
            "rejected" => Ok(RequestState::Rejected),
            other => Err(ParseError::UnknownValue {
                kind: "request state",
                value: other.to_string(),
            }),
        }
    }
}

/// Administrator decision on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

// ---------------------------------------------------------------------------
// Agent rights
// ---------------------------------------------------------------------------

/// What the synchronizing agent is allowed to do in a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRights {
    Administrator,
    Member,
    None,
}

impl AgentRights {
    pub fn is_admin(&self) -> bool {
        matches!(self, AgentRights::Administrator)
    }
}

// ---------------------------------------------------------------------------
// Audit vocabulary
// ---------------------------------------------------------------------------

/// Kind of action an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Register,
    Decide,
    Reassign,
    Terminate,
    Preflight,
    Admit,
    Revoke,
    Exclude,
    Release,
    Observe,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::Register => "register",
            AuditOperation::Decide => "decide",
            AuditOperation::Reassign => "reassign",
            AuditOperation::Terminate => "terminate",
            AuditOperation::Preflight => "preflight",
            AuditOperation::Admit => "admit",
            AuditOperation::Revoke => "revoke",
            AuditOperation::Exclude => "exclude",
            AuditOperation::Release => "release",
            AuditOperation::Observe => "observe",
        }
    }
}

impl FromStr for AuditOperation {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "register" => AuditOperation::Register,
            "decide" => AuditOperation::Decide,
            "reassign" => AuditOperation::Reassign,
            "terminate" => AuditOperation::Terminate,
            "preflight" => AuditOperation::Preflight,
            "admit" => AuditOperation::Admit,
            "revoke" => AuditOperation::Revoke,
            "exclude" => AuditOperation::Exclude,
            "release" => AuditOperation::Release,
            "observe" => AuditOperation::Observe,
            other => {
                return Err(ParseError::UnknownValue {
                    kind: "audit operation",
                    value: other.to_string(),
                })
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Noop,
    Invited,
    Transient,
    Permission,
    NotFound,
    Inconsistent,
    Failed,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Noop => "noop",
            AuditOutcome::Invited => "invited",
            AuditOutcome::Transient => "transient",
            AuditOutcome::Permission => "permission",
            AuditOutcome::NotFound => "not_found",
            AuditOutcome::Inconsistent => "inconsistent",
            AuditOutcome::Failed => "failed",
        }
    }
}

impl FromStr for AuditOutcome {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "success" => AuditOutcome::Success,
            "noop" => AuditOutcome::Noop,
            "invited" => AuditOutcome::Invited,
            "transient" => AuditOutcome::Transient,
            "permission" => AuditOutcome::Permission,
            "not_found" => AuditOutcome::NotFound,
            "inconsistent" => AuditOutcome::Inconsistent,
            "failed" => AuditOutcome::Failed,
            other => {
                return Err(ParseError::UnknownValue {
                    kind: "audit outcome",
                    value: other.to_string(),
                })
            }
        })
    }
}

/// Standing alert categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Exclusion done, release still failing after its retry budget.
    PartialRemoval,
    /// The agent cannot act in a chat until an operator restores its rights.
    InsufficientPrivilege,
    /// Admission or removal kept failing transiently until its retry budget
    /// ran out.
    RetriesExhausted,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::PartialRemoval => "partial_removal",
            AlertKind::InsufficientPrivilege => "insufficient_privilege",
            AlertKind::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl FromStr for AlertKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partial_removal" => Ok(AlertKind::PartialRemoval),
            "insufficient_privilege" => Ok(AlertKind::InsufficientPrivilege),
            "retries_exhausted" => Ok(AlertKind::RetriesExhausted),
            other => Err(ParseError::UnknownValue {
                kind: "alert kind",
                value: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_terminal_states_have_no_exits() {
        for from in [LifecycleState::Rejected, LifecycleState::Terminated] {
            for to in LifecycleState::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn lifecycle_edges() {
        assert!(LifecycleState::Pending.can_transition_to(LifecycleState::Approved));
        assert!(LifecycleState::Active.can_transition_to(LifecycleState::Active));
        assert!(!LifecycleState::Pending.can_transition_to(LifecycleState::Active));
        assert!(!LifecycleState::Approved.can_transition_to(LifecycleState::Rejected));
    }

    #[test]
    fn member_state_round_trips_through_text() {
        for state in [
            MemberState::Absent,
            MemberState::Invited,
            MemberState::Member,
            MemberState::PartiallyRemoved,
            MemberState::Removed,
        ] {
            assert_eq!(state.as_str().parse::<MemberState>().unwrap(), state);
        }
        assert!("banned".parse::<MemberState>().is_err());
    }

    #[test]
    fn member_state_json_matches_storage_text() {
        let json = serde_json::to_string(&MemberState::PartiallyRemoved).unwrap();
        assert_eq!(json, "\"partially_removed\"");
    }

    #[test]
    fn held_and_clear_partition() {
        assert!(MemberState::PartiallyRemoved.is_held());
        assert!(!MemberState::PartiallyRemoved.is_clear());
        assert!(MemberState::Removed.is_clear());
        assert!(!MemberState::Removed.is_held());
    }
}
