//! Whole pools running on an in-memory network.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{assert_finished, contract, packed, wait_terminal, Cluster, ClusterConfig};
use serde_json::json;
use ubot_node::contract::ErrorCode;
use ubot_node::processor::PoolState;
use ubot_node::storage::{Ledger, StorageKey};
use ubot_node::transport::NetworkFaults;

#[tokio::test(start_paused = true)]
async fn test_every_member_agrees_on_the_result() {
    let cluster = Cluster::start(ClusterConfig::new(5)).await;
    let contract = contract("echo", 5, 3, json!({"greeting": "hello"}));

    let pool_id = cluster.node(1).ubot.execute(packed(&contract)).await.unwrap();

    for number in 1..=5 {
        let snapshot = wait_terminal(&cluster.node(number).ubot, pool_id).await;
        assert_finished(&snapshot);
        assert_eq!(snapshot.result, Some(json!({"greeting": "hello"})));
        assert!(snapshot.errors.is_empty());
    }
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pool_smaller_than_network() {
    let cluster = Cluster::start(ClusterConfig::new(6)).await;
    let contract = contract("echo", 3, 2, json!(42));

    let pool_id = cluster.node(2).ubot.execute(packed(&contract)).await.unwrap();
    let snapshot = wait_terminal(&cluster.node(2).ubot, pool_id).await;
    assert_finished(&snapshot);
    assert_eq!(snapshot.result, Some(json!(42)));

    // Only the selected members ever hear of the pool.
    let mut members = 0;
    for number in 1..=6 {
        if cluster.node(number).ubot.state(pool_id).await.is_some() {
            members += 1;
        }
    }
    assert!(members <= 3, "{members} nodes joined a pool of 3");
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_single_storage_is_committed_on_every_member() {
    let cluster = Cluster::start(ClusterConfig::new(4)).await;
    let contract = contract("increment", 4, 3, json!({"storage": "counter"}));
    let contract_id = contract.executable_contract.id().unwrap();

    let pool_id = cluster.node(1).ubot.execute(packed(&contract)).await.unwrap();

    for number in 1..=4 {
        let snapshot = wait_terminal(&cluster.node(number).ubot, pool_id).await;
        assert_finished(&snapshot);
        assert_eq!(snapshot.result, Some(json!(1)));

        let value = cluster
            .node(number)
            .ledger
            .get_single(&StorageKey::new(pool_id, contract_id, "counter"))
            .await
            .unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"1")));
    }
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_multi_storage_collects_peer_slots() {
    let cluster = Cluster::start(ClusterConfig::new(4)).await;
    let contract = contract("collect", 4, 3, json!({"storage": "votes", "value": 7}));
    let contract_id = contract.executable_contract.id().unwrap();

    let pool_id = cluster.node(3).ubot.execute(packed(&contract)).await.unwrap();

    for number in 1..=4 {
        let snapshot = wait_terminal(&cluster.node(number).ubot, pool_id).await;
        assert_finished(&snapshot);
        assert_eq!(snapshot.result, Some(json!(7)));

        let slots = cluster
            .node(number)
            .ledger
            .get_multi(&StorageKey::new(pool_id, contract_id, "votes"))
            .await
            .unwrap();
        assert!(slots.len() >= 3, "node {number} holds {} slots", slots.len());
        assert!(slots.values().all(|v| v.as_ref() == b"7"));
    }
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_members_do_not_block_a_quorum() {
    let cluster = Cluster::start(ClusterConfig::new(5)).await;
    cluster.set_down(&[4, 5]).await;
    let contract = contract("echo", 5, 3, json!("quorum"));

    let started = tokio::time::Instant::now();
    let pool_id = cluster.node(1).ubot.execute(packed(&contract)).await.unwrap();
    let snapshot = wait_terminal(&cluster.node(1).ubot, pool_id).await;

    assert_finished(&snapshot);
    assert_eq!(snapshot.result, Some(json!("quorum")));
    // The invite phase could only end at its deadline.
    assert!(started.elapsed() >= Duration::from_secs(40));
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pool_fails_without_a_quorum() {
    let cluster = Cluster::start(ClusterConfig::new(5)).await;
    cluster.set_down(&[3, 4, 5]).await;
    let contract = contract("echo", 5, 3, json!(null));

    let pool_id = cluster.node(1).ubot.execute(packed(&contract)).await.unwrap();
    let snapshot = wait_terminal(&cluster.node(1).ubot, pool_id).await;

    assert_eq!(snapshot.state, PoolState::Failed);
    assert_eq!(snapshot.result, None);
    assert_eq!(snapshot.errors.len(), 1);
    assert_eq!(snapshot.errors[0].code, ErrorCode::Timeout);
    assert_eq!(snapshot.errors[0].object, "SEND_STARTING_CONTRACT");
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_oversized_pool_fails_before_any_send() {
    let mut config = ClusterConfig::new(3);
    config.processor.max_pool_size = 2;
    let cluster = Cluster::start(config).await;
    let contract = contract("echo", 3, 2, json!(null));

    let pool_id = cluster.node(1).ubot.execute(packed(&contract)).await.unwrap();
    let snapshot = wait_terminal(&cluster.node(1).ubot, pool_id).await;

    assert_eq!(snapshot.state, PoolState::Failed);
    assert_eq!(snapshot.errors[0].code, ErrorCode::Failure);
    assert_eq!(snapshot.errors[0].object, "pool");
    assert_eq!(cluster.network.delivered(), 0);
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lossy_reordering_network_still_converges() {
    let mut config = ClusterConfig::new(4);
    config.faults = NetworkFaults {
        loss: 0.2,
        duplication: 0.2,
        reorder: 0.3,
    };
    let cluster = Cluster::start(config).await;
    let contract = contract("increment", 4, 3, json!({"storage": "counter"}));

    let pool_id = cluster.node(1).ubot.execute(packed(&contract)).await.unwrap();
    let snapshot = wait_terminal(&cluster.node(1).ubot, pool_id).await;

    assert_finished(&snapshot);
    assert_eq!(snapshot.result, Some(json!(1)));
    assert!(cluster.network.dropped() > 0 || cluster.network.delivered() > 0);
    cluster.shutdown().await;
}
