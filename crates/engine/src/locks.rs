//! In-process keyed locks.
//!
//! Writers touching the same account (or identity, or streak) serialize on a
//! per-key async mutex; unrelated keys never contend. A caller that needs
//! several keys takes them in one [`KeyedLocks::acquire`] call, which locks in
//! sorted order so two callers can never wait on each other in a cycle.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::Currency;

#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    slots: DashMap<String, Arc<Mutex<()>>>,
}

/// Guards held until dropped.
#[derive(Debug)]
pub(crate) struct LockSet {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub(crate) async fn acquire<I>(&self, keys: I) -> LockSet
    where
        I: IntoIterator<Item = String>,
    {
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            // Clone the slot out so the shard guard is released before awaiting.
            let slot = self.slots.entry(key).or_default().clone();
            guards.push(slot.lock_owned().await);
        }
        LockSet { _guards: guards }
    }

    /// Drops slots nobody holds or waits on.
    pub(crate) fn prune(&self) {
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}

pub(crate) fn account_key(user_id: Uuid, currency: Currency) -> String {
    format!("account:{user_id}:{}", currency.code())
}

pub(crate) fn streak_key(user_id: Uuid) -> String {
    format!("streak:{user_id}")
}

pub(crate) fn handle_key(handle_key: &str) -> String {
    format!("identity:handle:{handle_key}")
}

pub(crate) fn external_id_key(external_id: &str) -> String {
    format!("identity:external:{external_id}")
}

pub(crate) fn sync_key(handle: &str, operation_type: &str, reference_id: &str) -> String {
    format!("sync:{handle}:{operation_type}:{reference_id}")
}
