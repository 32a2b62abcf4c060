//! Consensus-backed storage.
//!
//! Two storage kinds, both keyed by `(pool, contract, name)`:
//!
//! - **Single storage** holds one value. Writes are agreed by a quorum of
//!   matching hash votes and then upserted.
//! - **Multi storage** holds one slot per contributing node. Each node
//!   stores its own slot and downloads the slots its peers announce.
//!
//! The [`Ledger`] is the local persistence behind both; [`CloudApi`] is
//! what a running method sees.

mod api;
mod memory;
mod multi;
mod mutex;
mod pg;

pub use api::{CloudApi, StorageKind, StorageWrite};
pub use memory::MemoryLedger;
pub use multi::MultiStorageView;
pub use mutex::{NamedGuard, NamedMutex};
pub use pg::{DbConfig, PgLedger};

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use ubot_id::{ContractId, NodeNumber, PoolId, ResultHash};

/// Identifies one logical storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey {
    pub pool_id: PoolId,
    pub contract_id: ContractId,
    pub name: String,
}

impl StorageKey {
    pub fn new(pool_id: PoolId, contract_id: ContractId, name: impl Into<String>) -> Self {
        Self {
            pool_id,
            contract_id,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.pool_id.short(), self.contract_id.short(), self.name)
    }
}

/// Ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("failed to connect to ledger: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("ledger migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("ledger row is corrupt: {0}")]
    Corrupt(String),
}

/// Errors surfaced to a method's storage calls.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No quorum agreed on the write before its deadline.
    #[error("storage {name:?}: write #{seq} timed out")]
    Timeout { name: String, seq: u32 },

    /// The name cannot be carried in a storage vote.
    #[error("storage {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// Too few slots arrived for a multi read.
    #[error("storage {name:?}: {have} of {need} slots available")]
    Unavailable {
        name: String,
        have: usize,
        need: usize,
    },

    /// The processor moved on before the write completed.
    #[error("storage {name:?}: processor is no longer executing")]
    Cancelled { name: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Local persistence for both storage kinds.
///
/// Each call is atomic.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Replace the single-storage value. Returns the hash of `data`.
    async fn upsert_single(&self, key: &StorageKey, data: &[u8]) -> Result<ResultHash, LedgerError>;

    async fn get_single(&self, key: &StorageKey) -> Result<Option<Bytes>, LedgerError>;

    /// Replace `node`'s slot, leaving other slots untouched. Returns the hash of `data`.
    async fn put_multi_slot(
        &self,
        key: &StorageKey,
        node: NodeNumber,
        data: &[u8],
    ) -> Result<ResultHash, LedgerError>;

    /// Every slot of a multi storage.
    async fn get_multi(&self, key: &StorageKey) -> Result<BTreeMap<NodeNumber, Bytes>, LedgerError>;

    /// Check the ledger is reachable.
    async fn health_check(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}
