//! Routing and lifecycle of processors on a single node.

mod common;

use std::time::Duration;

use common::{assert_finished, contract, packed, wait_terminal, Cluster, ClusterConfig};
use serde_json::json;
use ubot_id::{NodeNumber, PoolId, ResultHash};
use ubot_node::contract::{ContractError, ErrorCode};
use ubot_node::processor::{PoolState, ProcessorError};
use ubot_notification::{CloudKind, Notification, NotificationBody};

fn exec_vote(cluster: &Cluster, from: u32, pool_id: PoolId) -> Notification {
    let from = cluster.net.get(NodeNumber::new(from)).unwrap().clone();
    Notification::request(
        from,
        pool_id,
        NotificationBody::Cloud(CloudKind::ExecResult {
            hash: ResultHash::of(b"result"),
        }),
    )
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_routes_create_one_processor() {
    let cluster = Cluster::start(ClusterConfig::new(3)).await;
    let table = cluster.node(2).ubot.table().clone();
    let pool_id = PoolId::of(b"unknown pool");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let table = table.clone();
        let notification = exec_vote(&cluster, 1, pool_id);
        tasks.push(tokio::spawn(async move { table.route(notification).await }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(table.live_count().await, 1);
    let snapshot = table.snapshot(pool_id).await.unwrap();
    assert_eq!(snapshot.state, PoolState::Init);
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_answer_for_unknown_pool_is_dropped() {
    let cluster = Cluster::start(ClusterConfig::new(3)).await;
    let table = cluster.node(2).ubot.table().clone();
    let pool_id = PoolId::of(b"never started");
    let from = cluster.net.get(NodeNumber::new(1)).unwrap().clone();

    table
        .route(Notification::answer(from, pool_id, NotificationBody::StartingContract))
        .await;

    assert_eq!(table.live_count().await, 0);
    assert!(table.snapshot(pool_id).await.is_none());
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_responder_without_invite_times_out() {
    let cluster = Cluster::start(ClusterConfig::new(3)).await;
    let ubot = &cluster.node(3).ubot;
    let pool_id = PoolId::of(b"orphan");

    ubot.table().route(exec_vote(&cluster, 1, pool_id)).await;
    let snapshot = wait_terminal(ubot, pool_id).await;

    assert_eq!(snapshot.state, PoolState::Failed);
    assert_eq!(snapshot.errors.len(), 1);
    assert_eq!(snapshot.errors[0].code, ErrorCode::Timeout);
    assert_eq!(snapshot.errors[0].object, "INIT");

    // A retired pool keeps answering with the same state.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ubot.state(pool_id).await, Some(snapshot));
    assert_eq!(ubot.table().live_count().await, 0);
    assert_eq!(ubot.table().finished_count().await, 1);
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_execute_is_idempotent() {
    let cluster = Cluster::start(ClusterConfig::new(1)).await;
    let ubot = &cluster.node(1).ubot;
    let packed = packed(&contract("echo", 1, 1, json!("once")));

    let first = ubot.execute(packed.clone()).await.unwrap();
    let snapshot = wait_terminal(ubot, first).await;
    assert_finished(&snapshot);

    let second = ubot.execute(packed).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(ubot.table().live_count().await, 0);
    assert_eq!(ubot.state(first).await, Some(snapshot));
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_execute_rejects_undeclared_method() {
    let cluster = Cluster::start(ClusterConfig::new(1)).await;
    let mut contract = contract("echo", 1, 1, json!(null));
    contract.method = "missing".to_string();

    let err = cluster
        .node(1)
        .ubot
        .execute(packed(&contract))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProcessorError::Contract(ContractError::UnknownMethod(name)) if name == "missing"
    ));
    assert_eq!(cluster.node(1).ubot.table().live_count().await, 0);
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_execute_rejects_garbage() {
    let cluster = Cluster::start(ClusterConfig::new(1)).await;

    let err = cluster
        .node(1)
        .ubot
        .execute(bytes::Bytes::from_static(b"not a contract"))
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessorError::Contract(ContractError::Malformed(_))));
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_finished_processors_expire() {
    let cluster = Cluster::start(ClusterConfig::new(1)).await;
    let ubot = &cluster.node(1).ubot;
    let pool_id = ubot
        .execute(packed(&contract("echo", 1, 1, json!(1))))
        .await
        .unwrap();
    assert_finished(&wait_terminal(ubot, pool_id).await);

    tokio::time::sleep(Duration::from_secs(320)).await;

    assert!(ubot.state(pool_id).await.is_none());
    assert_eq!(ubot.table().finished_count().await, 0);
    cluster.shutdown().await;
}
