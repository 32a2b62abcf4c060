use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use ubot_id::ContractId;

type LockKey = (ContractId, String);

/// Cooperative named locks, one per `(contract, name)`.
///
/// Waiters are released in strict FIFO order. A guard may be held across
/// `.await` points.
#[derive(Debug, Default)]
pub struct NamedMutex {
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

/// Holds a named lock until dropped.
#[derive(Debug)]
pub struct NamedGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl NamedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock on `(contract, name)`.
    pub async fn lock(&self, contract: ContractId, name: &str) -> NamedGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Entries only the map still references have no holder or waiter.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry((contract, name.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        NamedGuard {
            name: name.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of names with a holder or waiter.
    pub async fn active(&self) -> usize {
        self.locks
            .lock()
            .await
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}
