//! Result and session caches served to peers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use ubot_cache::{CacheError, ExpiringCache};
use ubot_id::{NodeNumber, PoolId, ResultHash, SessionHash};

use crate::config::CacheSettings;

/// What a responder downloads to join a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartingContractSession {
    /// The packed starting contract; hashes to the pool id.
    pub contract_bin: Bytes,
    /// Pool members in the initiator's order.
    pub selected_pool: Vec<NodeNumber>,
}

/// JSON form of a [`StartingContractSession`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartingContractBlob {
    pub contract_bin: String,
    pub selected_pool: Vec<NodeNumber>,
}

impl From<&StartingContractSession> for StartingContractBlob {
    fn from(session: &StartingContractSession) -> Self {
        Self {
            contract_bin: STANDARD.encode(&session.contract_bin),
            selected_pool: session.selected_pool.clone(),
        }
    }
}

impl TryFrom<StartingContractBlob> for StartingContractSession {
    type Error = base64::DecodeError;

    fn try_from(blob: StartingContractBlob) -> Result<Self, Self::Error> {
        Ok(Self {
            contract_bin: Bytes::from(STANDARD.decode(blob.contract_bin)?),
            selected_pool: blob.selected_pool,
        })
    }
}

pub type ResultCache = ExpiringCache<ResultHash, Bytes>;
pub type SessionCache = ExpiringCache<SessionHash, StartingContractSession>;

/// The caches a node serves over HTTP.
pub struct NodeCaches {
    /// Method results and storage values, by content hash.
    pub results: ResultCache,
    /// Starting-contract sessions published by initiators.
    pub sessions: SessionCache,
}

impl NodeCaches {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            results: ExpiringCache::new("results", settings.results()),
            sessions: ExpiringCache::new("sessions", settings.sessions()),
        }
    }

    pub async fn publish_session(&self, pool_id: PoolId, session: StartingContractSession) {
        self.sessions.put(SessionHash::from(pool_id), session).await;
    }

    pub async fn starting_contract(
        &self,
        pool_id: PoolId,
    ) -> Result<Option<StartingContractSession>, CacheError> {
        self.sessions.get(&SessionHash::from(pool_id)).await
    }

    /// Cache `data` under its content hash and return the hash.
    pub async fn put_result(&self, data: Bytes) -> ResultHash {
        let hash = ResultHash::of(&data);
        self.results.put(hash, data).await;
        hash
    }

    pub async fn result(&self, hash: ResultHash) -> Result<Option<Bytes>, CacheError> {
        self.results.get(&hash).await
    }

    /// Stop both sweepers.
    pub fn shutdown(&self) {
        self.results.shutdown();
        self.sessions.shutdown();
    }
}
