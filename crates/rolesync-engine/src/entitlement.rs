use std::collections::BTreeSet;

use rolesync_shared::{ChatId, LifecycleState, RoleId};
use rolesync_store::{Database, Person, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Role {0} no longer exists")]
    NotFound(RoleId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Chats a role entitles its holders to.
pub fn resolve(db: &Database, role: RoleId) -> Result<BTreeSet<ChatId>, ResolveError> {
    if !db.role_exists(role)? {
        return Err(ResolveError::NotFound(role));
    }
    Ok(db
        .chats_for_role(role)?
        .into_iter()
        .map(|chat| chat.id)
        .collect())
}

/// Chats `person` should be a member of right now.
///
/// Empty unless the person is approved or active and not being terminated.
/// A dangling role resolves to the empty set.
pub fn entitled_chats(db: &Database, person: &Person) -> Result<BTreeSet<ChatId>, StoreError> {
    let eligible = matches!(
        person.target_lifecycle(),
        LifecycleState::Approved | LifecycleState::Active
    );
    let Some(role) = person.role_id.filter(|_| eligible) else {
        return Ok(BTreeSet::new());
    };

    match resolve(db, role) {
        Ok(chats) => Ok(chats),
        Err(ResolveError::NotFound(role)) => {
            tracing::warn!(
                person = %person.id,
                role = %role,
                "assigned role no longer exists, entitlement is empty"
            );
            Ok(BTreeSet::new())
        }
        Err(ResolveError::Store(e)) => Err(e),
    }
}
