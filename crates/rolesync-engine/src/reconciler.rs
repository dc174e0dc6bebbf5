//! Entitlement vs. observed membership diff.
//!
//! Everything here is synchronous. The only inputs are the entitled chat set
//! and the cached per-pair states, so the same inputs always yield the same
//! operations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rolesync_shared::{ChatId, MemberState, PairKey, PersonId};
use rolesync_store::{Database, StoreError};
use serde::Serialize;

use crate::entitlement::entitled_chats;

/// One unit of work for the membership operator.
///
/// Variant order matters: sorting puts an eviction before an admission of
/// the same pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Evict(PairKey),
    Admit(PairKey),
}

impl Operation {
    pub fn pair(&self) -> PairKey {
        match self {
            Operation::Evict(pair) | Operation::Admit(pair) => *pair,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Evict(pair) => write!(f, "evict {pair}"),
            Operation::Admit(pair) => write!(f, "admit {pair}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diff {
    pub to_add: BTreeSet<ChatId>,
    pub to_remove: BTreeSet<ChatId>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Operations for `person`, grouped by chat with evictions first.
    pub fn operations(&self, person: PersonId) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .to_remove
            .iter()
            .map(|&chat| Operation::Evict(PairKey::new(person, chat)))
            .chain(
                self.to_add
                    .iter()
                    .map(|&chat| Operation::Admit(PairKey::new(person, chat))),
            )
            .collect();
        ops.sort_by_key(|op| (op.pair().chat, *op));
        ops
    }
}

/// Compare what a person should hold with what the cache says they hold.
///
/// A pair left `PartiallyRemoved` is always evicted again (release only),
/// and re-admitted afterwards if it is still entitled. `Invited` counts as
/// in progress and is left to the observation step.
pub fn diff(entitled: &BTreeSet<ChatId>, observed: &BTreeMap<ChatId, MemberState>) -> Diff {
    let to_remove = observed
        .iter()
        .filter(|&(chat, &state)| {
            state == MemberState::PartiallyRemoved || (state.is_held() && !entitled.contains(chat))
        })
        .map(|(&chat, _)| chat)
        .collect();

    let to_add = entitled
        .iter()
        .filter(|&chat| {
            matches!(
                observed.get(chat).copied().unwrap_or_default(),
                MemberState::Absent | MemberState::Removed | MemberState::PartiallyRemoved
            )
        })
        .copied()
        .collect();

    Diff { to_add, to_remove }
}

/// Cached per-chat states of a person.
pub fn observed_states(
    db: &Database,
    person: PersonId,
) -> Result<BTreeMap<ChatId, MemberState>, StoreError> {
    Ok(db
        .memberships_for_person(person)?
        .into_iter()
        .map(|record| (record.chat_id, record.state))
        .collect())
}

/// Operations that would bring `person` in line with their entitlement.
pub fn reconcile(db: &Database, person: PersonId) -> Result<Vec<Operation>, StoreError> {
    let record = db.get_person(person)?;
    let entitled = entitled_chats(db, &record)?;
    let observed = observed_states(db, person)?;
    Ok(diff(&entitled, &observed).operations(person))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chats(ids: &[i64]) -> BTreeSet<ChatId> {
        ids.iter().copied().map(ChatId).collect()
    }

    fn states(entries: &[(i64, MemberState)]) -> BTreeMap<ChatId, MemberState> {
        entries.iter().map(|(c, s)| (ChatId(*c), *s)).collect()
    }

    #[test]
    fn role_change_adds_and_removes() {
        use MemberState::*;
        // Member of {A, B}; new role entitles {B, C}.
        let d = diff(&chats(&[2, 3]), &states(&[(1, Member), (2, Member)]));
        assert_eq!(d.to_add, chats(&[3]));
        assert_eq!(d.to_remove, chats(&[1]));
    }

    #[test]
    fn converged_state_yields_nothing() {
        use MemberState::*;
        let d = diff(
            &chats(&[1, 2]),
            &states(&[(1, Member), (2, Invited), (3, Removed), (4, Absent)]),
        );
        assert!(d.is_empty());
    }

    #[test]
    fn partially_removed_is_always_released() {
        use MemberState::*;
        let observed = states(&[(1, PartiallyRemoved), (2, PartiallyRemoved)]);
        let d = diff(&chats(&[1]), &observed);
        assert_eq!(d.to_remove, chats(&[1, 2]));
        assert_eq!(d.to_add, chats(&[1]));

        let ops = d.operations(PersonId(9));
        let pair = |c| PairKey::new(PersonId(9), ChatId(c));
        assert_eq!(
            ops,
            vec![
                Operation::Evict(pair(1)),
                Operation::Admit(pair(1)),
                Operation::Evict(pair(2)),
            ]
        );
    }

    #[test]
    fn invitations_are_evicted_when_no_longer_entitled() {
        use MemberState::*;
        let d = diff(&chats(&[]), &states(&[(1, Invited), (2, Removed)]));
        assert_eq!(d.to_remove, chats(&[1]));
        assert!(d.to_add.is_empty());
    }
}
