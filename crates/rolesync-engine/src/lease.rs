//! Pair-scoped exclusive leases.
//!
//! At most one operation touches a (person, chat) pair at a time. The table
//! only holds entries for pairs that are leased or waited on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rolesync_shared::PairKey;
use tokio::sync::OwnedMutexGuard;

type Slots = Arc<Mutex<HashMap<PairKey, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Clone, Default)]
pub struct LeaseTable {
    slots: Slots,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `pair`.
    pub async fn acquire(&self, pair: PairKey) -> PairLease {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(pair).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        PairLease {
            pair,
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn is_leased(&self, pair: PairKey) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(&pair).is_some_and(|slot| slot.try_lock().is_err())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Exclusive right to operate on one pair. Released on drop.
pub struct PairLease {
    pair: PairKey,
    slots: Slots,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PairLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // Waiters clone the slot under the table lock, so a count of one
        // means nobody else wants this pair.
        if slots
            .get(&self.pair)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.pair);
        }
    }
}
