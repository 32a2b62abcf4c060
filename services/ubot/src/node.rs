//! Node wiring.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use ubot_id::PoolId;
use ubot_notification::{NetConfig, NodeDescriptor, Notification};

use crate::caches::NodeCaches;
use crate::client::PeerFetcher;
use crate::config::{CacheSettings, ProcessorConfig, StorageConfig};
use crate::executor::CloudExecutor;
use crate::processor::{ProcessorError, ProcessorSnapshot, ProcessorTable};
use crate::storage::{Ledger, NamedMutex};
use crate::transport::Transport;

/// Everything a processor needs from its node.
pub struct NodeContext {
    pub me: NodeDescriptor,
    pub net: Arc<NetConfig>,
    pub transport: Arc<dyn Transport>,
    pub fetcher: Arc<dyn PeerFetcher>,
    pub executor: Arc<dyn CloudExecutor>,
    pub ledger: Arc<dyn Ledger>,
    pub locks: Arc<NamedMutex>,
    pub caches: Arc<NodeCaches>,
    pub processor: ProcessorConfig,
    pub storage: StorageConfig,
}

/// A running node: processor table plus the loop feeding it notifications.
pub struct UBot {
    node: Arc<NodeContext>,
    table: Arc<ProcessorTable>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
}

impl UBot {
    /// Start dispatching `inbound` notifications to processors.
    pub fn start(
        node: NodeContext,
        caches: &CacheSettings,
        inbound: mpsc::Receiver<Notification>,
    ) -> Self {
        let node = Arc::new(node);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let table = ProcessorTable::new(node.clone(), caches.processors(), shutdown_rx.clone());
        let dispatcher = tokio::spawn(run_dispatcher(table.clone(), inbound, shutdown_rx));

        info!(node = %node.me.number, nodes = node.net.len(), "UBot started");
        Self {
            node,
            table,
            shutdown_tx,
            dispatcher,
        }
    }

    pub fn node(&self) -> &Arc<NodeContext> {
        &self.node
    }

    pub fn table(&self) -> &Arc<ProcessorTable> {
        &self.table
    }

    /// Run the cloud method of a packed starting contract.
    pub async fn execute(&self, contract_bin: Bytes) -> Result<PoolId, ProcessorError> {
        self.table.execute(contract_bin).await
    }

    pub async fn state(&self, pool_id: PoolId) -> Option<ProcessorSnapshot> {
        self.table.snapshot(pool_id).await
    }

    /// A receiver that turns true once shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop every processor, the dispatcher and the cache sweepers.
    pub async fn shutdown(self) {
        info!(node = %self.node.me.number, "UBot shutting down");
        self.shutdown_tx.send_replace(true);
        let _ = self.dispatcher.await;
        self.table.shutdown();
        self.node.caches.shutdown();
    }
}

async fn run_dispatcher(
    table: Arc<ProcessorTable>,
    mut inbound: mpsc::Receiver<Notification>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Dispatcher shutting down");
                    break;
                }
            }

            notification = inbound.recv() => {
                let Some(notification) = notification else {
                    debug!("Inbound channel closed, dispatcher stopping");
                    break;
                };
                table.route(notification).await;
            }
        }
    }
}
