//! In-process clusters for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use ubot_id::{NodeNumber, PoolId};
use ubot_node::caches::NodeCaches;
use ubot_node::client::LocalPeers;
use ubot_node::config::{CacheSettings, ProcessorConfig, StorageConfig};
use ubot_node::contract::StartingContract;
use ubot_node::executor::RegisteredMethods;
use ubot_node::node::{NodeContext, UBot};
use ubot_node::processor::{PoolState, ProcessorSnapshot};
use ubot_node::storage::{MemoryLedger, NamedMutex};
use ubot_node::transport::{MemoryNetwork, NetworkFaults};
use ubot_notification::{NetConfig, NodeDescriptor};

pub struct ClusterConfig {
    pub nodes: u32,
    pub faults: NetworkFaults,
    pub processor: ProcessorConfig,
    pub storage: StorageConfig,
    pub caches: CacheSettings,
}

impl ClusterConfig {
    pub fn new(nodes: u32) -> Self {
        Self {
            nodes,
            faults: NetworkFaults::default(),
            processor: ProcessorConfig::default(),
            storage: StorageConfig::default(),
            caches: CacheSettings::default(),
        }
    }
}

pub struct TestNode {
    pub ubot: UBot,
    pub ledger: Arc<MemoryLedger>,
    pub caches: Arc<NodeCaches>,
}

pub struct Cluster {
    pub net: Arc<NetConfig>,
    pub network: Arc<MemoryNetwork>,
    pub nodes: Vec<TestNode>,
}

pub fn net_config(nodes: u32) -> NetConfig {
    NetConfig::new(
        (1..=nodes)
            .map(|i| NodeDescriptor {
                number: NodeNumber::new(i),
                public_key: format!("key-{i}"),
                udp_addr: format!("127.0.0.1:{}", 17000 + i).parse().unwrap(),
                http_url: format!("http://127.0.0.1:{}", 18000 + i),
            })
            .collect(),
    )
    .unwrap()
}

impl Cluster {
    pub async fn start(config: ClusterConfig) -> Self {
        let net = Arc::new(net_config(config.nodes));
        let network = MemoryNetwork::new(net.clone(), config.faults);
        let peers = Arc::new(LocalPeers::new());

        let mut nodes = Vec::new();
        for number in 1..=config.nodes {
            let number = NodeNumber::new(number);
            let (transport, inbound) = network.attach(number, 1024).await;
            let ledger = Arc::new(MemoryLedger::new());
            let caches = Arc::new(NodeCaches::new(&config.caches));
            peers.register(number, caches.clone()).await;

            let node = NodeContext {
                me: net.get(number).unwrap().clone(),
                net: net.clone(),
                transport: Arc::new(transport),
                fetcher: peers.clone(),
                executor: Arc::new(RegisteredMethods::builtin()),
                ledger: ledger.clone(),
                locks: Arc::new(NamedMutex::new()),
                caches: caches.clone(),
                processor: config.processor.clone(),
                storage: config.storage.clone(),
            };
            nodes.push(TestNode {
                ubot: UBot::start(node, &config.caches, inbound),
                ledger,
                caches,
            });
        }

        Self {
            net,
            network,
            nodes,
        }
    }

    pub fn node(&self, number: u32) -> &TestNode {
        &self.nodes[number as usize - 1]
    }

    pub async fn set_down(&self, numbers: &[u32]) {
        for number in numbers {
            self.network.set_down(NodeNumber::new(*number), true).await;
        }
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            node.ubot.shutdown().await;
        }
    }
}

/// A starting contract calling `method` with explicit pool and quorum sizes.
pub fn contract(method: &str, pool: usize, quorum: usize, args: Value) -> StartingContract {
    serde_json::from_value(json!({
        "executableContract": {
            "name": "test-contract",
            "cloudMethods": {
                method: {
                    "pool": {"size": pool},
                    "quorum": {"size": quorum}
                }
            }
        },
        "method": method,
        "args": args
    }))
    .unwrap()
}

pub fn packed(contract: &StartingContract) -> Bytes {
    contract.pack().unwrap()
}

/// Poll `ubot` until the pool reaches a terminal state.
pub async fn wait_terminal(ubot: &UBot, pool_id: PoolId) -> ProcessorSnapshot {
    wait_until(ubot, pool_id, |s| s.state.is_terminal()).await
}

pub async fn wait_until(
    ubot: &UBot,
    pool_id: PoolId,
    done: impl Fn(&ProcessorSnapshot) -> bool,
) -> ProcessorSnapshot {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            if let Some(snapshot) = ubot.state(pool_id).await {
                if done(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("pool did not reach the expected state")
}

pub fn assert_finished(snapshot: &ProcessorSnapshot) {
    assert_eq!(
        snapshot.state,
        PoolState::Finished,
        "errors: {:?}",
        snapshot.errors
    );
}
