//! Storage calls available to a running cloud method.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;
use ubot_id::{ContractId, NodeNumber, PoolId, ResultHash};
use ubot_notification::validate_storage_name;
use ubot_schedule::BackoffPolicy;

use super::{Ledger, MultiStorageView, NamedGuard, NamedMutex, StorageError, StorageKey};
use crate::actor::ActorHandle;
use crate::config::StorageConfig;
use crate::process::ProcessEvent;
use crate::processor::ProcessorMessage;

/// Which storage a write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Single,
    Multi,
}

/// A write waiting for the pool to agree on it.
///
/// Sent to the processor, which replies once the write is committed or has
/// failed. Dropping the reply sender reports [`StorageError::Cancelled`].
#[derive(Debug)]
pub struct StorageWrite {
    pub kind: StorageKind,
    pub name: String,
    pub data: Bytes,
    pub reply: oneshot::Sender<Result<ResultHash, StorageError>>,
}

/// Handle a cloud method uses to reach its pool's storage.
///
/// Writes go through the processor so every member votes on them in the
/// same order; reads go straight to the local ledger.
#[derive(Clone)]
pub struct CloudApi {
    pub(crate) pool_id: PoolId,
    pub(crate) contract_id: ContractId,
    pub(crate) me: NodeNumber,
    pub(crate) pool_size: usize,
    pub(crate) trust_level: f64,
    pub(crate) config: StorageConfig,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) locks: Arc<NamedMutex>,
    pub(crate) processor: ActorHandle<ProcessorMessage>,
    pub(crate) epoch: u64,
}

impl std::fmt::Debug for CloudApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudApi")
            .field("pool_id", &self.pool_id)
            .field("me", &self.me)
            .field("pool_size", &self.pool_size)
            .finish_non_exhaustive()
    }
}

impl CloudApi {
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn me(&self) -> NodeNumber {
        self.me
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Slots a multi read waits for: `ceil(trust * pool_size)`, at least one.
    pub fn required_slots(&self) -> usize {
        let need = (self.trust_level * self.pool_size as f64).ceil() as usize;
        need.clamp(1, self.pool_size.max(1))
    }

    /// Agree on a new single-storage value with the pool and commit it.
    pub async fn write_single(
        &self,
        name: &str,
        data: impl Into<Bytes>,
    ) -> Result<ResultHash, StorageError> {
        self.write(StorageKind::Single, name, data.into()).await
    }

    /// The committed single-storage value, if any.
    pub async fn read_single(&self, name: &str) -> Result<Option<Bytes>, StorageError> {
        let key = self.key(name)?;
        Ok(self.ledger.get_single(&key).await?)
    }

    /// Store this node's slot and wait until a quorum of slots is held.
    pub async fn write_multi(
        &self,
        name: &str,
        data: impl Into<Bytes>,
    ) -> Result<ResultHash, StorageError> {
        self.write(StorageKind::Multi, name, data.into()).await
    }

    /// Every held slot once enough of them are present.
    ///
    /// Polls the ledger with exponential backoff and gives up with
    /// [`StorageError::Unavailable`] after the configured number of attempts.
    pub async fn read_multi(&self, name: &str) -> Result<MultiStorageView, StorageError> {
        let key = self.key(name)?;
        let need = self.required_slots();
        let attempts = self.config.max_download_attempts.max(1);
        let backoff =
            BackoffPolicy::exponential(self.config.storage_vote_period, self.config.backoff_max);

        let mut have = 0;
        for attempt in 0..attempts {
            let slots = self.ledger.get_multi(&key).await?;
            have = slots.len();
            if have >= need {
                return Ok(MultiStorageView::new(slots));
            }
            if attempt + 1 < attempts {
                let delay = backoff.delay(attempt);
                debug!(storage = %key, have, need, ?delay, "Waiting for more slots");
                tokio::time::sleep(delay).await;
            }
        }

        Err(StorageError::Unavailable {
            name: name.to_string(),
            have,
            need,
        })
    }

    /// Serialize read-modify-write sequences on `name` within this node.
    pub async fn lock(&self, name: &str) -> NamedGuard {
        self.locks.lock(self.contract_id, name).await
    }

    fn key(&self, name: &str) -> Result<StorageKey, StorageError> {
        validate_storage_name(name).map_err(|e| StorageError::InvalidName {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(StorageKey::new(self.pool_id, self.contract_id, name))
    }

    async fn write(
        &self,
        kind: StorageKind,
        name: &str,
        data: Bytes,
    ) -> Result<ResultHash, StorageError> {
        self.key(name)?;
        let cancelled = || StorageError::Cancelled {
            name: name.to_string(),
        };
        let (reply, rx) = oneshot::channel();
        let write = StorageWrite {
            kind,
            name: name.to_string(),
            data,
            reply,
        };

        self.processor
            .send(ProcessorMessage::Process {
                epoch: self.epoch,
                event: ProcessEvent::StorageWrite(write),
            })
            .await
            .map_err(|_| cancelled())?;

        rx.await.map_err(|_| cancelled())?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor;
    use crate::storage::MemoryLedger;

    fn api(ledger: Arc<MemoryLedger>, trust_level: f64) -> (CloudApi, actor::Mailbox<ProcessorMessage>) {
        let (processor, mailbox) = actor::mailbox("processor", 8);
        let api = CloudApi {
            pool_id: PoolId::of(b"pool"),
            contract_id: ContractId::of(b"contract"),
            me: NodeNumber::new(1),
            pool_size: 4,
            trust_level,
            config: StorageConfig::default(),
            ledger,
            locks: Arc::new(NamedMutex::new()),
            processor,
            epoch: 3,
        };
        (api, mailbox)
    }

    #[test]
    fn test_required_slots() {
        let ledger = Arc::new(MemoryLedger::new());
        assert_eq!(api(ledger.clone(), 0.5).0.required_slots(), 2);
        assert_eq!(api(ledger.clone(), 0.6).0.required_slots(), 3);
        assert_eq!(api(ledger.clone(), 0.0).0.required_slots(), 1);
        assert_eq!(api(ledger, 2.0).0.required_slots(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_multi_waits_for_slots() {
        let ledger = Arc::new(MemoryLedger::new());
        let (api, _mailbox) = api(ledger.clone(), 0.5);
        let key = api.key("votes").unwrap();
        ledger.put_multi_slot(&key, NodeNumber::new(1), b"a").await.unwrap();

        let writer = {
            let ledger = ledger.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(700)).await;
                ledger.put_multi_slot(&key, NodeNumber::new(2), b"a").await.unwrap();
            })
        };

        let view = api.read_multi("votes").await.unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.agreed_value(2), Some(&Bytes::from_static(b"a")));
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_multi_gives_up() {
        let ledger = Arc::new(MemoryLedger::new());
        let (api, _mailbox) = api(ledger.clone(), 1.0);
        ledger
            .put_multi_slot(&api.key("votes").unwrap(), NodeNumber::new(1), b"a")
            .await
            .unwrap();

        let err = api.read_multi("votes").await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Unavailable { have: 1, need: 4, .. }
        ));
    }

    #[tokio::test]
    async fn test_write_routes_through_processor() {
        let (api, mailbox) = api(Arc::new(MemoryLedger::new()), 0.5);
        let mut rx = mailbox.into_receiver();

        let write = tokio::spawn(async move { api.write_single("counter", "1").await });

        let Some(ProcessorMessage::Process {
            epoch,
            event: ProcessEvent::StorageWrite(write_request),
        }) = rx.recv().await
        else {
            panic!("expected a storage write");
        };
        assert_eq!(epoch, 3);
        assert_eq!(write_request.kind, StorageKind::Single);
        assert_eq!(write_request.data, Bytes::from_static(b"1"));
        let hash = ResultHash::of(b"1");
        write_request.reply.send(Ok(hash)).unwrap();

        assert_eq!(write.await.unwrap().unwrap(), hash);
    }

    #[tokio::test]
    async fn test_dropped_reply_cancels_write() {
        let (api, mailbox) = api(Arc::new(MemoryLedger::new()), 0.5);
        let mut rx = mailbox.into_receiver();

        let write = tokio::spawn(async move { api.write_multi("slots", "x").await });
        drop(rx.recv().await);

        assert!(matches!(
            write.await.unwrap(),
            Err(StorageError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_names_fail_without_a_vote() {
        let (api, mailbox) = api(Arc::new(MemoryLedger::new()), 0.5);
        let mut rx = mailbox.into_receiver();
        let long = "n".repeat(300);

        for name in ["", long.as_str()] {
            assert!(matches!(
                api.write_single(name, "1").await,
                Err(StorageError::InvalidName { .. })
            ));
            assert!(matches!(
                api.write_multi(name, "1").await,
                Err(StorageError::InvalidName { .. })
            ));
            assert!(matches!(
                api.read_single(name).await,
                Err(StorageError::InvalidName { .. })
            ));
            assert!(matches!(
                api.read_multi(name).await,
                Err(StorageError::InvalidName { .. })
            ));
        }
        assert!(rx.try_recv().is_err());
    }
}
