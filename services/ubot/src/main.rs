//! UBot node.
//!
//! Runs cloud methods in pools of nodes: one node receives the request,
//! picks a pool, and the pool executes the method, agreeing on its result
//! and on every storage write by quorum.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ubot_node::{
    api,
    caches::NodeCaches,
    client::HttpPeerClient,
    config::Config,
    executor::RegisteredMethods,
    node::{NodeContext, UBot},
    state::AppState,
    storage::{Ledger, MemoryLedger, NamedMutex, PgLedger},
    transport::UdpTransport,
};
use ubot_notification::NetConfig;

/// Decoded notifications waiting for the dispatcher.
const INBOUND_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to UBOT_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(node = %config.node_number, "Starting UBot");

    let net = Arc::new(
        NetConfig::load(&config.netconfig_path)
            .with_context(|| format!("failed to load {}", config.netconfig_path.display()))?,
    );
    let me = net
        .get(config.node_number)
        .cloned()
        .with_context(|| format!("node {} is not in the network config", config.node_number))?;
    info!(
        node = %me.number,
        nodes = net.len(),
        http_addr = %config.http_addr,
        "Configuration loaded"
    );

    let ledger: Arc<dyn Ledger> = match &config.database {
        Some(db) => {
            let ledger = match PgLedger::connect(db).await {
                Ok(ledger) => {
                    info!("Ledger database connection established");
                    ledger
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to ledger database");
                    return Err(e.into());
                }
            };
            ledger.run_migrations().await?;
            Arc::new(ledger)
        }
        None => {
            warn!("DATABASE_URL not set, storage is kept in memory");
            Arc::new(MemoryLedger::new())
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let udp_addr = config.udp_addr.unwrap_or(me.udp_addr);
    let (transport, inbound, receiver_handle) = UdpTransport::bind(
        udp_addr,
        me.number,
        net.clone(),
        INBOUND_CAPACITY,
        shutdown_rx.clone(),
    )
    .await?;

    let node = NodeContext {
        me,
        net,
        transport: Arc::new(transport),
        fetcher: Arc::new(HttpPeerClient::new(config.processor.http_client_timeout)?),
        executor: Arc::new(RegisteredMethods::builtin()),
        ledger,
        locks: Arc::new(NamedMutex::new()),
        caches: Arc::new(NodeCaches::new(&config.caches)),
        processor: config.processor.clone(),
        storage: config.storage.clone(),
    };
    let ubot = UBot::start(node, &config.caches, inbound);

    let app = api::create_router(AppState::from_ubot(&ubot));
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(addr = %config.http_addr, "Listening for connections");

    let server_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    loop {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                    info!("HTTP server shutting down");
                })
                .await
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    ubot.shutdown().await;

    if tokio::time::timeout(Duration::from_secs(5), receiver_handle)
        .await
        .is_err()
    {
        warn!("UDP receiver did not shut down in time");
    }

    info!("UBot shutdown complete");
    Ok(())
}
