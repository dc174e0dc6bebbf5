//! Per-person pass coordination.
//!
//! At most one pass runs per person. A trigger that arrives while a pass is
//! running does not start a second one: it marks the running slot for a
//! rerun and waits for the first pass that starts after it. Any number of
//! triggers during one pass collapse into a single rerun.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rolesync_shared::PersonId;
use tokio::sync::watch;

use crate::report::PassReport;

/// What a finished pass produced, shared by everyone waiting on it.
pub type PassOutcome = Result<PassReport, String>;

type Published = Option<(u64, Arc<PassOutcome>)>;

struct Slot {
    /// Generation of the pass currently running.
    generation: u64,
    rerun: bool,
    verify: bool,
    tx: watch::Sender<Published>,
}

/// A caller's place in a person's pass sequence.
pub struct Ticket {
    rx: watch::Receiver<Published>,
    target: u64,
    /// Set when the caller must start the pass itself.
    pub lead: Option<u64>,
}

impl Ticket {
    /// Wait for the pass this ticket is entitled to.
    pub async fn wait(mut self) -> PassOutcome {
        let target = self.target;
        let published = match self
            .rx
            .wait_for(|v| v.as_ref().is_some_and(|(g, _)| *g >= target))
            .await
        {
            Ok(value) => value.as_ref().map(|(_, outcome)| outcome.clone()),
            Err(_) => None,
        };
        match published {
            Some(outcome) => outcome.as_ref().clone(),
            None => Err("pass was abandoned before it finished".into()),
        }
    }
}

#[derive(Clone, Default)]
pub struct PassCoordinator {
    slots: Arc<Mutex<HashMap<PersonId, Slot>>>,
}

impl PassCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the person's pass sequence. The first caller leads; later
    /// callers follow the next generation.
    pub fn join(&self, person: PersonId, verify: bool) -> Ticket {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(&person) {
            slot.rerun = true;
            slot.verify |= verify;
            return Ticket {
                rx: slot.tx.subscribe(),
                target: slot.generation + 1,
                lead: None,
            };
        }

        let (tx, rx) = watch::channel(None);
        slots.insert(
            person,
            Slot {
                generation: 1,
                rerun: false,
                verify: false,
                tx,
            },
        );
        Ticket {
            rx,
            target: 1,
            lead: Some(1),
        }
    }

    /// Publish a finished pass. Returns the next generation to run and
    /// whether it should verify, or `None` once the person is idle.
    pub fn finish(
        &self,
        person: PersonId,
        generation: u64,
        outcome: PassOutcome,
    ) -> Option<(u64, bool)> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.get_mut(&person)?;
        slot.tx.send_replace(Some((generation, Arc::new(outcome))));

        if slot.rerun {
            slot.rerun = false;
            slot.generation = generation + 1;
            Some((slot.generation, std::mem::take(&mut slot.verify)))
        } else {
            slots.remove(&person);
            None
        }
    }

    pub fn is_running(&self, person: PersonId) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.contains_key(&person)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(tag: &str) -> PassOutcome {
        Err(tag.to_string())
    }

    #[tokio::test]
    async fn triggers_during_a_pass_collapse_into_one_rerun() {
        let passes = PassCoordinator::new();
        let person = PersonId(1);

        let leader = passes.join(person, false);
        assert_eq!(leader.lead, Some(1));
        assert!(passes.is_running(person));

        let a = passes.join(person, false);
        let b = passes.join(person, true);
        assert_eq!(a.lead, None);
        assert_eq!(b.lead, None);

        assert_eq!(passes.finish(person, 1, outcome("first")), Some((2, true)));
        assert_eq!(leader.wait().await, outcome("first"));

        assert_eq!(passes.finish(person, 2, outcome("second")), None);
        assert_eq!(a.wait().await, outcome("second"));
        assert_eq!(b.wait().await, outcome("second"));
        assert!(!passes.is_running(person));
    }

    #[tokio::test]
    async fn dropped_coordinator_releases_waiters() {
        let passes = PassCoordinator::new();
        let person = PersonId(1);
        let _leader = passes.join(person, false);
        let follower = passes.join(person, false);

        drop(passes);
        assert!(follower.wait().await.is_err());
    }

    #[tokio::test]
    async fn persons_are_independent() {
        let passes = PassCoordinator::new();
        assert!(passes.join(PersonId(1), false).lead.is_some());
        assert!(passes.join(PersonId(2), false).lead.is_some());
    }
}
