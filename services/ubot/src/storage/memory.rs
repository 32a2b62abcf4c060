use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use ubot_id::{NodeNumber, ResultHash};

use super::{Ledger, LedgerError, StorageKey};

/// In-process ledger, used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    single: RwLock<HashMap<StorageKey, Bytes>>,
    multi: RwLock<HashMap<StorageKey, BTreeMap<NodeNumber, Bytes>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn upsert_single(&self, key: &StorageKey, data: &[u8]) -> Result<ResultHash, LedgerError> {
        self.single
            .write()
            .await
            .insert(key.clone(), Bytes::copy_from_slice(data));
        Ok(ResultHash::of(data))
    }

    async fn get_single(&self, key: &StorageKey) -> Result<Option<Bytes>, LedgerError> {
        Ok(self.single.read().await.get(key).cloned())
    }

    async fn put_multi_slot(
        &self,
        key: &StorageKey,
        node: NodeNumber,
        data: &[u8],
    ) -> Result<ResultHash, LedgerError> {
        self.multi
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .insert(node, Bytes::copy_from_slice(data));
        Ok(ResultHash::of(data))
    }

    async fn get_multi(&self, key: &StorageKey) -> Result<BTreeMap<NodeNumber, Bytes>, LedgerError> {
        Ok(self.multi.read().await.get(key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubot_id::{ContractId, PoolId};

    fn key(name: &str) -> StorageKey {
        StorageKey::new(PoolId::of(b"pool"), ContractId::of(b"contract"), name)
    }

    #[tokio::test]
    async fn test_single_storage_upsert_replaces() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.get_single(&key("a")).await.unwrap(), None);

        let first = ledger.upsert_single(&key("a"), b"1").await.unwrap();
        let second = ledger.upsert_single(&key("a"), b"2").await.unwrap();

        assert_eq!(first, ResultHash::of(b"1"));
        assert_eq!(second, ResultHash::of(b"2"));
        assert_eq!(
            ledger.get_single(&key("a")).await.unwrap(),
            Some(Bytes::from_static(b"2"))
        );
    }

    #[tokio::test]
    async fn test_multi_storage_slots_are_per_node() {
        let ledger = MemoryLedger::new();
        let one = NodeNumber::new(1);
        let two = NodeNumber::new(2);

        ledger.put_multi_slot(&key("m"), one, b"x").await.unwrap();
        ledger.put_multi_slot(&key("m"), two, b"y").await.unwrap();
        ledger.put_multi_slot(&key("m"), one, b"z").await.unwrap();

        let slots = ledger.get_multi(&key("m")).await.unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[&one], Bytes::from_static(b"z"));
        assert_eq!(slots[&two], Bytes::from_static(b"y"));
        assert!(ledger.get_multi(&key("other")).await.unwrap().is_empty());
    }
}
