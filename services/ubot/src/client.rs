//! Peer HTTP client.
//!
//! Responders download the starting contract from the initiator, and
//! members download each other's multi-storage slots, over the peers'
//! HTTP surfaces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use ubot_id::{NodeNumber, PoolId, ResultHash};
use ubot_notification::NodeDescriptor;

use crate::caches::{NodeCaches, StartingContractBlob, StartingContractSession};
use crate::storage::StorageKind;

/// Peer fetch errors. All of them are retried by the caller.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The peer has nothing under that key yet.
    #[error("peer has no such record yet")]
    NotReady,

    #[error("peer answered with status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Request(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Request(e.to_string())
    }
}

/// Downloads records published by other nodes.
#[async_trait]
pub trait PeerFetcher: Send + Sync {
    /// The starting contract and pool a peer initiated.
    async fn starting_contract(
        &self,
        peer: &NodeDescriptor,
        pool_id: PoolId,
    ) -> Result<StartingContractSession, FetchError>;

    /// A storage value a peer holds under its content hash.
    async fn storage_result(
        &self,
        peer: &NodeDescriptor,
        kind: StorageKind,
        hash: ResultHash,
    ) -> Result<Bytes, FetchError>;
}

// =============================================================================
// HTTP
// =============================================================================

/// Fetches from peers' HTTP endpoints.
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        debug!(url = %url, "Fetching from peer");
        let response = self.client.get(url).send().await?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Err(FetchError::NotReady),
            status if status.is_success() => Ok(response),
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(url = %url, status = %status, body = %body, "Peer fetch failed");
                Err(FetchError::Status(status.as_u16()))
            }
        }
    }
}

#[async_trait]
impl PeerFetcher for HttpPeerClient {
    async fn starting_contract(
        &self,
        peer: &NodeDescriptor,
        pool_id: PoolId,
    ) -> Result<StartingContractSession, FetchError> {
        let url = format!(
            "{}/getStartingContract/{}",
            peer.http_url.trim_end_matches('/'),
            pool_id
        );
        let blob: StartingContractBlob = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?;

        StartingContractSession::try_from(blob).map_err(|e| FetchError::Malformed(e.to_string()))
    }

    async fn storage_result(
        &self,
        peer: &NodeDescriptor,
        kind: StorageKind,
        hash: ResultHash,
    ) -> Result<Bytes, FetchError> {
        let endpoint = match kind {
            StorageKind::Single => "getSingleStorageResult",
            StorageKind::Multi => "getMultiStorageResult",
        };
        let url = format!(
            "{}/{}/{}",
            peer.http_url.trim_end_matches('/'),
            endpoint,
            hash
        );
        Ok(self.get(&url).await?.bytes().await?)
    }
}

// =============================================================================
// In-process
// =============================================================================

/// Fetches straight from other nodes' caches in the same process.
///
/// Used when several nodes share one runtime, as in the integration tests.
#[derive(Default)]
pub struct LocalPeers {
    peers: RwLock<HashMap<NodeNumber, Arc<NodeCaches>>>,
}

impl LocalPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, number: NodeNumber, caches: Arc<NodeCaches>) {
        self.peers.write().await.insert(number, caches);
    }

    async fn caches(&self, peer: &NodeDescriptor) -> Result<Arc<NodeCaches>, FetchError> {
        self.peers
            .read()
            .await
            .get(&peer.number)
            .cloned()
            .ok_or_else(|| FetchError::Request(format!("node {} is unreachable", peer.number)))
    }
}

#[async_trait]
impl PeerFetcher for LocalPeers {
    async fn starting_contract(
        &self,
        peer: &NodeDescriptor,
        pool_id: PoolId,
    ) -> Result<StartingContractSession, FetchError> {
        self.caches(peer)
            .await?
            .starting_contract(pool_id)
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?
            .ok_or(FetchError::NotReady)
    }

    async fn storage_result(
        &self,
        peer: &NodeDescriptor,
        _kind: StorageKind,
        hash: ResultHash,
    ) -> Result<Bytes, FetchError> {
        self.caches(peer)
            .await?
            .result(hash)
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?
            .ok_or(FetchError::NotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;

    fn peer(number: u32) -> NodeDescriptor {
        NodeDescriptor {
            number: NodeNumber::new(number),
            public_key: format!("key-{number}"),
            udp_addr: format!("127.0.0.1:{}", 7000 + number).parse().unwrap(),
            http_url: format!("http://127.0.0.1:{}", 8000 + number),
        }
    }

    #[tokio::test]
    async fn test_local_peers_serve_published_records() {
        let peers = LocalPeers::new();
        let caches = Arc::new(NodeCaches::new(&CacheSettings::default()));
        peers.register(NodeNumber::new(1), caches.clone()).await;

        let pool_id = PoolId::of(b"contract");
        assert!(matches!(
            peers.starting_contract(&peer(1), pool_id).await,
            Err(FetchError::NotReady)
        ));

        let session = StartingContractSession {
            contract_bin: Bytes::from_static(b"contract"),
            selected_pool: vec![NodeNumber::new(1)],
        };
        caches.publish_session(pool_id, session.clone()).await;
        assert_eq!(
            peers.starting_contract(&peer(1), pool_id).await.unwrap(),
            session
        );

        let hash = caches.put_result(Bytes::from_static(b"slot")).await;
        assert_eq!(
            peers
                .storage_result(&peer(1), StorageKind::Multi, hash)
                .await
                .unwrap(),
            Bytes::from_static(b"slot")
        );
        caches.shutdown();
    }

    #[tokio::test]
    async fn test_local_peers_unknown_node() {
        let peers = LocalPeers::new();
        assert!(matches!(
            peers.starting_contract(&peer(9), PoolId::of(b"x")).await,
            Err(FetchError::Request(_))
        ));
    }

    #[tokio::test]
    async fn test_http_client_unreachable_peer() {
        let client = HttpPeerClient::new(Duration::from_millis(200)).unwrap();
        let mut unreachable = peer(1);
        unreachable.http_url = "http://127.0.0.1:1".to_string();

        assert!(matches!(
            client.starting_contract(&unreachable, PoolId::of(b"x")).await,
            Err(FetchError::Request(_))
        ));
    }
}
