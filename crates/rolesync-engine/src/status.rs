use std::collections::BTreeMap;

use rolesync_shared::{AlertKind, ChatId, LifecycleState, MemberState, PersonId};
use rolesync_store::{Database, StoreError};
use serde::Serialize;

use crate::entitlement::entitled_chats;
use crate::reconciler::{diff, observed_states, Operation};

/// Per-person reconciliation status, as shown to administrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Converged,
    InProgress,
    NeedsAttention,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairStatus {
    pub chat: ChatId,
    pub state: MemberState,
    pub last_error: Option<String>,
    pub alerts: Vec<AlertKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonStatus {
    pub person: PersonId,
    pub lifecycle: LifecycleState,
    pub termination_requested: bool,
    pub status: SyncStatus,
    /// Operations the next pass would issue.
    pub pending: Vec<Operation>,
    /// Pairs that failed, are stuck mid-eviction, or carry an open alert.
    pub failing: Vec<PairStatus>,
}

/// Compute a person's status from the cache. `running` is whether a pass
/// for them is executing right now.
pub fn person_status(
    db: &Database,
    person: PersonId,
    running: bool,
) -> Result<PersonStatus, StoreError> {
    let current = db.get_person(person)?;
    let entitled = entitled_chats(db, &current)?;
    let observed = observed_states(db, person)?;
    let pending = diff(&entitled, &observed).operations(person);

    let mut alerts: BTreeMap<ChatId, Vec<AlertKind>> = BTreeMap::new();
    for alert in db.open_alerts_for_person(person)? {
        alerts.entry(alert.chat_id).or_default().push(alert.kind);
    }

    let failing: Vec<PairStatus> = db
        .memberships_for_person(person)?
        .into_iter()
        .filter(|record| {
            let out_of_sync = pending.iter().any(|op| op.pair().chat == record.chat_id);
            record.state == MemberState::PartiallyRemoved
                || (out_of_sync && record.last_error.is_some())
                || alerts.contains_key(&record.chat_id)
        })
        .map(|record| PairStatus {
            chat: record.chat_id,
            state: record.state,
            alerts: alerts.get(&record.chat_id).cloned().unwrap_or_default(),
            last_error: record.last_error,
        })
        .collect();

    let awaiting = current.lifecycle == LifecycleState::Approved
        || (current.termination_requested && current.lifecycle != LifecycleState::Terminated)
        || entitled
            .iter()
            .any(|chat| observed.get(chat) == Some(&MemberState::Invited));

    let status = if running {
        SyncStatus::InProgress
    } else if !failing.is_empty() {
        SyncStatus::NeedsAttention
    } else if !pending.is_empty() || awaiting {
        SyncStatus::InProgress
    } else {
        SyncStatus::Converged
    };

    Ok(PersonStatus {
        person,
        lifecycle: current.lifecycle,
        termination_requested: current.termination_requested,
        status,
        pending,
        failing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolesync_shared::{ExternalChatId, ExternalUserId, PairKey};
    use rolesync_store::{NewChat, NewPerson};

    fn setup() -> (Database, PersonId, ChatId) {
        let db = Database::open_in_memory().unwrap();
        let role = db.create_role("staff", None).unwrap();
        let chat = db
            .create_chat(&NewChat {
                external_id: ExternalChatId(-1),
                title: "c".into(),
                invite_link: None,
            })
            .unwrap()
            .id;
        db.set_role_chats(role.id, &[chat]).unwrap();
        let person = db
            .create_person(&NewPerson {
                external_id: ExternalUserId(1),
                username: None,
                first_name: None,
                last_name: None,
                phone: None,
            })
            .unwrap()
            .id;
        db.update_person_lifecycle(person, LifecycleState::Pending, LifecycleState::Approved)
            .unwrap();
        db.update_person_lifecycle(person, LifecycleState::Approved, LifecycleState::Active)
            .unwrap();
        db.assign_person_role(person, role.id).unwrap();
        (db, person, chat)
    }

    #[test]
    fn member_of_every_entitled_chat_is_converged() {
        let (db, person, chat) = setup();
        db.write_membership(PairKey::new(person, chat), 0, MemberState::Member, None)
            .unwrap();
        let status = person_status(&db, person, false).unwrap();
        assert_eq!(status.status, SyncStatus::Converged);
        assert!(status.pending.is_empty());

        let status = person_status(&db, person, true).unwrap();
        assert_eq!(status.status, SyncStatus::InProgress);
    }

    #[test]
    fn stuck_eviction_needs_attention() {
        let (db, person, chat) = setup();
        let pair = PairKey::new(person, chat);
        db.write_membership(pair, 0, MemberState::PartiallyRemoved, Some("network error"))
            .unwrap();
        db.raise_alert(pair, AlertKind::PartialRemoval, "release failed")
            .unwrap();

        let status = person_status(&db, person, false).unwrap();
        assert_eq!(status.status, SyncStatus::NeedsAttention);
        assert_eq!(status.failing.len(), 1);
        assert_eq!(status.failing[0].alerts, vec![AlertKind::PartialRemoval]);
        assert_eq!(status.failing[0].last_error.as_deref(), Some("network error"));
    }

    #[test]
    fn outstanding_admission_is_in_progress() {
        let (db, person, _) = setup();
        let status = person_status(&db, person, false).unwrap();
        assert_eq!(status.status, SyncStatus::InProgress);
        assert_eq!(status.pending.len(), 1);
    }
}
