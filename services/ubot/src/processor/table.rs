use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};
use ubot_cache::{CacheConfig, ExpiringCache};
use ubot_id::PoolId;
use ubot_notification::Notification;

use super::{
    Bootstrap, CloudProcessor, FinishedProcessor, ProcessorError, ProcessorMessage,
    ProcessorSnapshot,
};
use crate::actor::{self, ActorError, ActorHandle};
use crate::contract::{pool_id_of, StartingContract};
use crate::node::NodeContext;

struct LiveProcessor {
    handle: ActorHandle<ProcessorMessage>,
    snapshot: watch::Receiver<ProcessorSnapshot>,
}

/// Every processor on this node, keyed by pool id.
///
/// Routing and creation happen under one lock, so concurrent notifications
/// for an unknown pool create exactly one processor.
pub struct ProcessorTable {
    node: Arc<NodeContext>,
    live: Mutex<HashMap<PoolId, LiveProcessor>>,
    finished: ExpiringCache<PoolId, Arc<FinishedProcessor>>,
    shutdown: watch::Receiver<bool>,
}

impl ProcessorTable {
    pub fn new(
        node: Arc<NodeContext>,
        finished: CacheConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            live: Mutex::new(HashMap::new()),
            finished: ExpiringCache::new("processors", finished),
            shutdown,
        })
    }

    /// Hand `notification` to its pool's processor, creating a responder
    /// processor if the pool is unknown.
    pub async fn route(self: &Arc<Self>, notification: Notification) {
        let mut live = self.live.lock().await;

        match self.finished.get(&notification.pool_id).await {
            Ok(Some(finished)) => {
                drop(live);
                self.replay(&finished, &notification).await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!(pool_id = %notification.pool_id, error = %e, "Finished processor lookup failed");
                return;
            }
        }

        if let Some(processor) = live.get(&notification.pool_id) {
            deliver(processor, notification);
            return;
        }

        if notification.is_answer {
            debug!(
                pool_id = %notification.pool_id,
                from = %notification.from.number,
                kind = notification.kind_name(),
                "Dropping answer for unknown pool"
            );
            return;
        }

        let pool_id = notification.pool_id;
        let processor = self.spawn_processor(pool_id, Bootstrap::Responder);
        deliver(&processor, notification);
        live.insert(pool_id, processor);
    }

    /// Start running the method of a packed starting contract.
    ///
    /// Idempotent: a contract whose pool already exists is not started again.
    pub async fn execute(self: &Arc<Self>, contract_bin: Bytes) -> Result<PoolId, ProcessorError> {
        if *self.shutdown.borrow() {
            return Err(ProcessorError::ShuttingDown);
        }

        let contract = StartingContract::unpack(&contract_bin)?;
        contract.method_policy()?;
        let contract_id = contract.executable_contract.id()?;
        let pool_id = pool_id_of(&contract_bin);

        let mut live = self.live.lock().await;
        if live.contains_key(&pool_id) || self.finished.contains(&pool_id).await {
            info!(pool_id = %pool_id, "Pool already known, not starting it again");
            return Ok(pool_id);
        }

        info!(pool_id = %pool_id, method = %contract.method, "Starting cloud method");
        let processor = self.spawn_processor(
            pool_id,
            Bootstrap::Initiator {
                contract_bin,
                contract,
                contract_id,
            },
        );
        live.insert(pool_id, processor);
        Ok(pool_id)
    }

    /// Current state of a pool's processor, live or finished.
    pub async fn snapshot(&self, pool_id: PoolId) -> Option<ProcessorSnapshot> {
        let live_snapshot = self
            .live
            .lock()
            .await
            .get(&pool_id)
            .map(|p| p.snapshot.borrow().clone());
        if live_snapshot.is_some() {
            return live_snapshot;
        }

        match self.finished.get(&pool_id).await {
            Ok(finished) => finished.map(|f| f.snapshot.clone()),
            Err(e) => {
                error!(pool_id = %pool_id, error = %e, "Finished processor lookup failed");
                None
            }
        }
    }

    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    pub async fn finished_count(&self) -> usize {
        self.finished.len().await
    }

    /// Stop the finished-processor sweeper.
    pub fn shutdown(&self) {
        self.finished.shutdown();
    }

    /// Move a processor from the live table to the finished cache.
    pub(crate) async fn retire(&self, finished: FinishedProcessor) {
        let pool_id = finished.snapshot.pool_id;
        self.finished.put(pool_id, Arc::new(finished)).await;
        self.live.lock().await.remove(&pool_id);
    }

    async fn replay(&self, finished: &FinishedProcessor, notification: &Notification) {
        if notification.is_answer {
            return;
        }
        if let Some(answer) = finished.answers.get(&notification.request_key()) {
            debug!(
                pool_id = %notification.pool_id,
                to = %notification.from.number,
                kind = notification.kind_name(),
                "Replaying answer from finished processor"
            );
            self.node
                .transport
                .deliver(&notification.from, answer.clone())
                .await;
        }
    }

    fn spawn_processor(self: &Arc<Self>, pool_id: PoolId, bootstrap: Bootstrap) -> LiveProcessor {
        let (handle, mailbox) = actor::mailbox("processor", self.node.processor.mailbox_size);
        let (snapshot_tx, snapshot) = watch::channel(ProcessorSnapshot::new(pool_id));
        let processor = CloudProcessor::new(
            pool_id,
            bootstrap,
            self.node.clone(),
            handle.clone(),
            snapshot_tx,
            Arc::downgrade(self),
        );
        actor::spawn(processor, mailbox, self.shutdown.clone());
        LiveProcessor { handle, snapshot }
    }
}

fn deliver(processor: &LiveProcessor, notification: Notification) {
    match processor.handle.try_send(ProcessorMessage::Notify(notification)) {
        Ok(()) => {}
        Err(ActorError::MailboxFull) => {
            debug!(actor_id = processor.handle.actor_id(), "Processor mailbox full, dropping notification");
        }
        Err(e) => {
            debug!(actor_id = processor.handle.actor_id(), error = %e, "Processor gone, dropping notification");
        }
    }
}
