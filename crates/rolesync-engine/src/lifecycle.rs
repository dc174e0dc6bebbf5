//! Person-level workflow: registration, decision, role reassignment and
//! termination.
//!
//! These functions only validate and persist the trigger. Running the
//! reconciliation pass that follows is the engine's job, and so is
//! [`settle`], which applies the transitions that depend on a pass having
//! converged (`Approved -> Active`, and the final `-> Terminated`).

use rolesync_shared::{
    Decision, LifecycleState, MemberState, PersonId, RequestId, RequestState, RoleId,
};
use rolesync_store::{AccessRequest, Database, NewPerson, Person, StoreError};
use serde::Serialize;

use crate::entitlement::entitled_chats;
use crate::error::LifecycleError;

type Result<T> = std::result::Result<T, LifecycleError>;

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub person: Person,
    pub request: AccessRequest,
    /// `false` when an open request already existed and was returned as is.
    pub created: bool,
}

/// Record a registration: a `Pending` person with a `Pending` request.
pub fn register(db: &Database, new: &NewPerson) -> Result<Registration> {
    if let Some(person) = db.find_person_by_external(new.external_id)? {
        if person.lifecycle != LifecycleState::Pending {
            return Err(LifecycleError::AlreadyRegistered {
                person: person.id,
                state: person.lifecycle,
            });
        }
        let request = match db.open_request_for_person(person.id)? {
            Some(request) => request,
            None => db.create_request(person.id)?,
        };
        return Ok(Registration {
            person,
            request,
            created: false,
        });
    }

    let tx = db.conn().unchecked_transaction().map_err(StoreError::from)?;
    let person = db.create_person(new)?;
    let request = db.create_request(person.id)?;
    tx.commit().map_err(StoreError::from)?;

    Ok(Registration {
        person,
        request,
        created: true,
    })
}

/// Close a pending request. Approval attaches `role` to the person.
pub fn decide(
    db: &Database,
    request_id: RequestId,
    decision: Decision,
    role: Option<RoleId>,
) -> Result<Person> {
    let request = db.get_request(request_id).map_err(|e| match e {
        StoreError::NotFound => LifecycleError::RequestNotFound(request_id),
        other => other.into(),
    })?;
    if request.state.is_terminal() {
        return Err(LifecycleError::RequestDecided(request_id));
    }

    let person = get_person(db, request.person_id)?;
    let (request_state, to) = match decision {
        Decision::Approved => (RequestState::Approved, LifecycleState::Approved),
        Decision::Rejected => (RequestState::Rejected, LifecycleState::Rejected),
    };
    ensure_transition(&person, to)?;

    let role = match decision {
        Decision::Approved => {
            let role = role.ok_or(LifecycleError::RoleRequired)?;
            ensure_role(db, role)?;
            Some(role)
        }
        Decision::Rejected => None,
    };

    let tx = db.conn().unchecked_transaction().map_err(StoreError::from)?;
    if !db.decide_request(request_id, request_state, role)? {
        return Err(LifecycleError::RequestDecided(request_id));
    }
    if !db.update_person_lifecycle(person.id, person.lifecycle, to)? {
        return Err(LifecycleError::InvalidTransition {
            person: person.id,
            from: person.lifecycle,
            to,
        });
    }
    if let Some(role) = role {
        db.assign_person_role(person.id, role)?;
    }
    tx.commit().map_err(StoreError::from)?;

    Ok(db.get_person(person.id)?)
}

/// Give an approved or active person a new role.
pub fn reassign(db: &Database, person: PersonId, role: RoleId) -> Result<Person> {
    let current = get_person(db, person)?;
    if current.termination_requested {
        return Err(LifecycleError::TerminationRequested(person));
    }
    if !matches!(
        current.lifecycle,
        LifecycleState::Approved | LifecycleState::Active
    ) {
        return Err(LifecycleError::InvalidTransition {
            person,
            from: current.lifecycle,
            to: LifecycleState::Active,
        });
    }
    ensure_role(db, role)?;

    db.assign_person_role(person, role)?;
    Ok(db.get_person(person)?)
}

/// Mark a person for termination. Repeating it is harmless.
pub fn request_termination(db: &Database, person: PersonId) -> Result<Person> {
    let current = get_person(db, person)?;
    ensure_transition(&current, LifecycleState::Terminated)?;
    if !current.termination_requested {
        db.request_person_termination(person)?;
    }
    Ok(db.get_person(person)?)
}

/// Apply the lifecycle transition a finished pass has earned, if any.
///
/// A terminating person becomes `Terminated` once no pair is held. An
/// approved person becomes `Active` once every entitled chat reports
/// `Member`.
pub fn settle(db: &Database, person: PersonId) -> std::result::Result<Option<LifecycleState>, StoreError> {
    let current = db.get_person(person)?;
    let records = db.memberships_for_person(person)?;

    let target = match (current.lifecycle, current.termination_requested) {
        (LifecycleState::Approved | LifecycleState::Active, true) => {
            if records.iter().any(|r| r.state.is_held()) {
                return Ok(None);
            }
            LifecycleState::Terminated
        }
        (LifecycleState::Approved, false) => {
            let entitled = entitled_chats(db, &current)?;
            let converged = entitled.iter().all(|chat| {
                records
                    .iter()
                    .any(|r| r.chat_id == *chat && r.state == MemberState::Member)
            });
            if !converged {
                return Ok(None);
            }
            LifecycleState::Active
        }
        _ => return Ok(None),
    };

    if db.update_person_lifecycle(person, current.lifecycle, target)? {
        tracing::info!(person = %person, from = %current.lifecycle, to = %target, "lifecycle advanced");
        Ok(Some(target))
    } else {
        Ok(None)
    }
}

fn get_person(db: &Database, person: PersonId) -> Result<Person> {
    db.get_person(person).map_err(|e| match e {
        StoreError::NotFound => LifecycleError::PersonNotFound(person),
        other => other.into(),
    })
}

fn ensure_role(db: &Database, role: RoleId) -> Result<()> {
    if db.role_exists(role)? {
        Ok(())
    } else {
        Err(LifecycleError::RoleNotFound(role))
    }
}

fn ensure_transition(person: &Person, to: LifecycleState) -> Result<()> {
    if person.lifecycle.can_transition_to(to) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidTransition {
            person: person.id,
            from: person.lifecycle,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolesync_shared::{ChatId, ExternalChatId, ExternalUserId, PairKey};
    use rolesync_store::NewChat;

    fn profile(external: i64) -> NewPerson {
        NewPerson {
            external_id: ExternalUserId(external),
            username: Some("ada".into()),
            first_name: Some("Ada".into()),
            last_name: None,
            phone: Some("+1000".into()),
        }
    }

    fn chat(db: &Database, external: i64) -> ChatId {
        db.create_chat(&NewChat {
            external_id: ExternalChatId(external),
            title: "c".into(),
            invite_link: None,
        })
        .unwrap()
        .id
    }

    #[test]
    fn registering_twice_returns_the_open_request() {
        let db = Database::open_in_memory().unwrap();
        let first = register(&db, &profile(5)).unwrap();
        assert!(first.created);
        assert_eq!(first.person.lifecycle, LifecycleState::Pending);

        let second = register(&db, &profile(5)).unwrap();
        assert!(!second.created);
        assert_eq!(second.request.id, first.request.id);
    }

    #[test]
    fn rejected_person_cannot_register_again() {
        let db = Database::open_in_memory().unwrap();
        let reg = register(&db, &profile(5)).unwrap();
        decide(&db, reg.request.id, Decision::Rejected, None).unwrap();

        assert!(matches!(
            register(&db, &profile(5)),
            Err(LifecycleError::AlreadyRegistered {
                state: LifecycleState::Rejected,
                ..
            })
        ));
    }

    #[test]
    fn approval_needs_an_existing_role() {
        let db = Database::open_in_memory().unwrap();
        let reg = register(&db, &profile(5)).unwrap();

        assert!(matches!(
            decide(&db, reg.request.id, Decision::Approved, None),
            Err(LifecycleError::RoleRequired)
        ));
        assert!(matches!(
            decide(&db, reg.request.id, Decision::Approved, Some(RoleId(42))),
            Err(LifecycleError::RoleNotFound(RoleId(42)))
        ));

        let role = db.create_role("staff", None).unwrap();
        let person = decide(&db, reg.request.id, Decision::Approved, Some(role.id)).unwrap();
        assert_eq!(person.lifecycle, LifecycleState::Approved);
        assert_eq!(person.role_id, Some(role.id));
        assert_eq!(person.role_version, 1);

        assert!(matches!(
            decide(&db, reg.request.id, Decision::Rejected, None),
            Err(LifecycleError::RequestDecided(_))
        ));
    }

    #[test]
    fn reassignment_is_refused_once_terminating() {
        let db = Database::open_in_memory().unwrap();
        let role = db.create_role("staff", None).unwrap();
        let other = db.create_role("ops", None).unwrap();
        let reg = register(&db, &profile(5)).unwrap();
        let person = reg.person.id;

        assert!(matches!(
            reassign(&db, person, role.id),
            Err(LifecycleError::InvalidTransition { .. })
        ));

        decide(&db, reg.request.id, Decision::Approved, Some(role.id)).unwrap();
        assert_eq!(reassign(&db, person, other.id).unwrap().role_version, 2);

        request_termination(&db, person).unwrap();
        assert!(matches!(
            reassign(&db, person, role.id),
            Err(LifecycleError::TerminationRequested(_))
        ));
    }

    #[test]
    fn pending_person_cannot_be_terminated() {
        let db = Database::open_in_memory().unwrap();
        let reg = register(&db, &profile(5)).unwrap();
        assert!(matches!(
            request_termination(&db, reg.person.id),
            Err(LifecycleError::InvalidTransition { .. })
        ));
        assert!(matches!(
            request_termination(&db, PersonId(99)),
            Err(LifecycleError::PersonNotFound(_))
        ));
    }

    #[test]
    fn settle_activates_only_when_every_chat_is_member() {
        let db = Database::open_in_memory().unwrap();
        let role = db.create_role("staff", None).unwrap();
        let (a, b) = (chat(&db, -1), chat(&db, -2));
        db.set_role_chats(role.id, &[a, b]).unwrap();
        let reg = register(&db, &profile(5)).unwrap();
        let person = reg.person.id;
        decide(&db, reg.request.id, Decision::Approved, Some(role.id)).unwrap();

        db.write_membership(PairKey::new(person, a), 0, MemberState::Member, None)
            .unwrap();
        db.write_membership(PairKey::new(person, b), 0, MemberState::Invited, None)
            .unwrap();
        assert_eq!(settle(&db, person).unwrap(), None);

        let record = db.get_membership(PairKey::new(person, b)).unwrap();
        db.write_membership(record.pair(), record.version, MemberState::Member, None)
            .unwrap();
        assert_eq!(settle(&db, person).unwrap(), Some(LifecycleState::Active));
        assert_eq!(settle(&db, person).unwrap(), None);
    }

    #[test]
    fn settle_terminates_once_nothing_is_held() {
        let db = Database::open_in_memory().unwrap();
        let role = db.create_role("staff", None).unwrap();
        let a = chat(&db, -1);
        db.set_role_chats(role.id, &[a]).unwrap();
        let reg = register(&db, &profile(5)).unwrap();
        let person = reg.person.id;
        decide(&db, reg.request.id, Decision::Approved, Some(role.id)).unwrap();
        let pair = PairKey::new(person, a);
        let record = db.write_membership(pair, 0, MemberState::Member, None).unwrap();

        request_termination(&db, person).unwrap();
        assert_eq!(settle(&db, person).unwrap(), None);

        let record = db
            .write_membership(pair, record.version, MemberState::PartiallyRemoved, None)
            .unwrap();
        assert_eq!(settle(&db, person).unwrap(), None);

        db.write_membership(pair, record.version, MemberState::Removed, None)
            .unwrap();
        assert_eq!(settle(&db, person).unwrap(), Some(LifecycleState::Terminated));
    }
}
