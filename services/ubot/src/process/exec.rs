//! Execution phase: run the method, agree on its result, and carry the
//! storage writes it makes.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ubot_id::{NodeNumber, ResultHash};
use ubot_notification::{CloudKind, Notification, NotificationBody, RequestKey};
use ubot_schedule::ScheduledTask;

use super::{NotifyOutcome, Process, ProcessContext, ProcessEvent, ProcessStep, Vote, VoteBook};
use crate::contract::ErrorRecord;
use crate::executor::MethodCall;
use crate::processor::PoolState;
use crate::storage::{CloudApi, StorageError, StorageKey, StorageKind, StorageWrite};

const PHASE: &str = "START_EXEC";

/// A storage write this node started and has not yet committed.
struct PendingWrite {
    kind: StorageKind,
    name: String,
    seq: u32,
    hash: ResultHash,
    data: Bytes,
    reply: oneshot::Sender<Result<ResultHash, StorageError>>,
    expires_at: Instant,
}

impl PendingWrite {
    fn body(&self) -> NotificationBody {
        let (name, seq, hash) = (self.name.clone(), self.seq, self.hash);
        NotificationBody::Cloud(match self.kind {
            StorageKind::Single => CloudKind::SingleStorage { name, seq, hash },
            StorageKind::Multi => CloudKind::MultiStorage { name, seq, hash },
        })
    }
}

fn write_key(kind: StorageKind, name: &str, seq: u32) -> RequestKey {
    let name = name.to_string();
    match kind {
        StorageKind::Single => RequestKey::SingleStorage { name, seq },
        StorageKind::Multi => RequestKey::MultiStorage { name, seq },
    }
}

pub struct StartExec {
    /// Hash and value of this node's method result.
    result: Option<(ResultHash, Value)>,
    votes: VoteBook,
    writes: HashMap<RequestKey, PendingWrite>,
    /// Next sequence number per storage.
    seqs: HashMap<(StorageKind, String), u32>,
    /// Multi slots held in the ledger, per round this node wrote to.
    ///
    /// Peers' slots keep being downloaded after the write commits so
    /// reads can wait for more than a quorum.
    held: HashMap<RequestKey, HashSet<NodeNumber>>,
    /// Multi slots being downloaded.
    fetching: HashSet<(RequestKey, NodeNumber)>,
    pulse: Option<ScheduledTask>,
    storage_pulse: Option<ScheduledTask>,
    deadline: Option<ScheduledTask>,
}

impl StartExec {
    pub fn new() -> Self {
        Self {
            result: None,
            votes: VoteBook::new(),
            writes: HashMap::new(),
            seqs: HashMap::new(),
            held: HashMap::new(),
            fetching: HashSet::new(),
            pulse: None,
            storage_pulse: None,
            deadline: None,
        }
    }

    fn storage_key(cx: &ProcessContext<'_>, name: &str) -> Option<StorageKey> {
        cx.core
            .contract_id
            .map(|contract_id| StorageKey::new(cx.pool_id(), contract_id, name))
    }

    fn is_member(cx: &ProcessContext<'_>, node: NodeNumber) -> bool {
        cx.core.pool.as_ref().is_some_and(|p| p.contains(node))
    }

    // -------------------------------------------------------------------------
    // Method result
    // -------------------------------------------------------------------------

    async fn on_method_finished(&mut self, output: Value, cx: &mut ProcessContext<'_>) -> ProcessStep {
        let bytes = match serde_json::to_vec(&output) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => return ProcessStep::Failed(ErrorRecord::bad_value("result", e.to_string())),
        };
        let hash = cx.node.caches.put_result(bytes).await;
        info!(pool_id = %cx.pool_id(), result = %hash.short(), "Method finished");

        self.result = Some((hash, output));
        self.votes.record(RequestKey::ExecResult, cx.me().number, hash);
        let peers = cx.peers();
        cx.vote(NotificationBody::Cloud(CloudKind::ExecResult { hash }), &peers)
            .await;
        self.check_result(cx)
    }

    /// Ready once a quorum, this node included, reported this node's result hash.
    fn check_result(&mut self, cx: &mut ProcessContext<'_>) -> ProcessStep {
        let Some((hash, output)) = &self.result else {
            return ProcessStep::Pending;
        };
        let matching = self.votes.matching(&RequestKey::ExecResult, hash);
        if matching < cx.core.quorum_size {
            return ProcessStep::Pending;
        }

        info!(pool_id = %cx.pool_id(), matching, quorum = cx.core.quorum_size, "Pool agreed on the result");
        cx.core.output = Some(output.clone());
        self.pulse = None;
        self.storage_pulse = None;
        self.deadline = None;
        ProcessStep::Ready
    }

    async fn resend_result(&self, cx: &ProcessContext<'_>) {
        let Some((hash, _)) = &self.result else {
            return;
        };
        let body = NotificationBody::Cloud(CloudKind::ExecResult { hash: *hash });
        for peer in cx.peers() {
            if !self.votes.has_voted(&RequestKey::ExecResult, peer.number) {
                cx.request(&peer, body.clone()).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Storage writes
    // -------------------------------------------------------------------------

    async fn on_storage_write(&mut self, write: StorageWrite, cx: &mut ProcessContext<'_>) {
        let Some(key) = Self::storage_key(cx, &write.name) else {
            let _ = write.reply.send(Err(StorageError::Cancelled { name: write.name }));
            return;
        };

        let seq = {
            let next = self.seqs.entry((write.kind, write.name.clone())).or_insert(0);
            let seq = *next;
            *next += 1;
            seq
        };
        let round = write_key(write.kind, &write.name, seq);
        let me = cx.me().number;

        let hash = match write.kind {
            StorageKind::Single => ResultHash::of(&write.data),
            StorageKind::Multi => {
                match cx.node.ledger.put_multi_slot(&key, me, &write.data).await {
                    Ok(hash) => {
                        cx.node.caches.put_result(write.data.clone()).await;
                        self.held.entry(round.clone()).or_default().insert(me);
                        hash
                    }
                    Err(e) => {
                        let _ = write.reply.send(Err(e.into()));
                        return;
                    }
                }
            }
        };
        debug!(
            pool_id = %cx.pool_id(),
            storage = %key,
            seq,
            kind = ?write.kind,
            hash = %hash.short(),
            "Storage write started"
        );

        self.votes.record(round.clone(), me, hash);
        let pending = PendingWrite {
            kind: write.kind,
            name: write.name,
            seq,
            hash,
            data: write.data,
            reply: write.reply,
            expires_at: Instant::now() + cx.node.storage.storage_write_timeout,
        };
        let peers = cx.peers();
        cx.vote(pending.body(), &peers).await;
        self.writes.insert(round.clone(), pending);

        if write_kind_is_multi(&round) {
            let announced: Vec<(NodeNumber, ResultHash)> = self.votes.round(&round).collect();
            for (from, hash) in announced {
                self.fetch_slot(&round, from, hash, cx);
            }
        }
        self.check_write(&round, cx).await;
    }

    /// Commit `round` if the pool agreed on it.
    async fn check_write(&mut self, round: &RequestKey, cx: &mut ProcessContext<'_>) {
        let Some(pending) = self.writes.get(round) else {
            return;
        };
        let quorum = cx.core.quorum_size;
        let agreed = match pending.kind {
            StorageKind::Single => self.votes.matching(round, &pending.hash) >= quorum,
            StorageKind::Multi => self.held.get(round).map_or(0, HashSet::len) >= quorum,
        };
        if !agreed {
            return;
        }
        let Some(pending) = self.writes.remove(round) else {
            return;
        };

        let result = match pending.kind {
            StorageKind::Single => match Self::storage_key(cx, &pending.name) {
                Some(key) => match cx.node.ledger.upsert_single(&key, &pending.data).await {
                    Ok(hash) => {
                        cx.node.caches.put_result(pending.data.clone()).await;
                        Ok(hash)
                    }
                    Err(e) => Err(StorageError::from(e)),
                },
                None => Err(StorageError::Cancelled {
                    name: pending.name.clone(),
                }),
            },
            StorageKind::Multi => Ok(pending.hash),
        };

        info!(
            pool_id = %cx.pool_id(),
            storage = %pending.name,
            seq = pending.seq,
            ok = result.is_ok(),
            "Storage write committed"
        );
        let _ = pending.reply.send(result);
    }

    /// Re-send votes for open writes and expire the ones past their deadline.
    async fn storage_tick(&mut self, cx: &mut ProcessContext<'_>) {
        let now = Instant::now();
        let expired: Vec<RequestKey> = self
            .writes
            .iter()
            .filter(|(_, w)| w.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for round in expired {
            if let Some(pending) = self.writes.remove(&round) {
                warn!(pool_id = %cx.pool_id(), storage = %pending.name, seq = pending.seq, "Storage write timed out");
                let _ = pending.reply.send(Err(StorageError::Timeout {
                    name: pending.name,
                    seq: pending.seq,
                }));
            }
        }

        let peers = cx.peers();
        for (round, pending) in &self.writes {
            let body = pending.body();
            for peer in &peers {
                if !self.votes.has_voted(round, peer.number) {
                    cx.request(peer, body.clone()).await;
                }
            }
        }

        let unfetched: Vec<(RequestKey, NodeNumber, ResultHash)> = self
            .held
            .keys()
            .flat_map(|round| {
                self.votes
                    .round(round)
                    .map(move |(from, hash)| (round.clone(), from, hash))
            })
            .collect();
        for (round, from, hash) in unfetched {
            self.fetch_slot(&round, from, hash, cx);
        }
    }

    /// Download a peer's announced multi slot unless it is held or in flight.
    fn fetch_slot(&mut self, round: &RequestKey, from: NodeNumber, hash: ResultHash, cx: &ProcessContext<'_>) {
        let RequestKey::MultiStorage { name, seq } = round else {
            return;
        };
        if self.held.get(round).is_some_and(|held| held.contains(&from)) {
            return;
        }
        let Some(peer) = cx.core.pool.as_ref().and_then(|p| p.get(from)).cloned() else {
            return;
        };
        if !self.fetching.insert((round.clone(), from)) {
            return;
        }

        let fetcher = cx.node.fetcher.clone();
        let (name, seq) = (name.clone(), *seq);
        cx.spawn(async move {
            let result = fetcher.storage_result(&peer, StorageKind::Multi, hash).await;
            ProcessEvent::SlotFetched {
                name,
                seq,
                from,
                hash,
                result,
            }
        });
    }

    async fn on_slot_fetched(
        &mut self,
        round: RequestKey,
        from: NodeNumber,
        hash: ResultHash,
        result: Result<Bytes, crate::client::FetchError>,
        cx: &mut ProcessContext<'_>,
    ) {
        self.fetching.remove(&(round.clone(), from));
        let data = match result {
            Ok(data) if hash.matches(&data) => data,
            Ok(_) => {
                warn!(pool_id = %cx.pool_id(), from = %from, "Downloaded slot does not match its hash");
                return;
            }
            Err(e) => {
                debug!(pool_id = %cx.pool_id(), from = %from, error = %e, "Slot not downloaded, will retry");
                return;
            }
        };

        let RequestKey::MultiStorage { name, .. } = &round else {
            return;
        };
        let Some(key) = Self::storage_key(cx, name) else {
            return;
        };
        match cx.node.ledger.put_multi_slot(&key, from, &data).await {
            Ok(_) => {
                cx.node.caches.put_result(data).await;
                self.held.entry(round.clone()).or_default().insert(from);
                self.check_write(&round, cx).await;
            }
            Err(e) => warn!(pool_id = %cx.pool_id(), storage = %key, error = %e, "Could not store downloaded slot"),
        }
    }

    // -------------------------------------------------------------------------
    // Votes from peers
    // -------------------------------------------------------------------------

    async fn on_vote(&mut self, from: NodeNumber, kind: &CloudKind, cx: &mut ProcessContext<'_>) -> ProcessStep {
        let (round, hash) = match kind {
            CloudKind::ExecResult { hash } => (RequestKey::ExecResult, *hash),
            CloudKind::SingleStorage { name, seq, hash } => (write_key(StorageKind::Single, name, *seq), *hash),
            CloudKind::MultiStorage { name, seq, hash } => (write_key(StorageKind::Multi, name, *seq), *hash),
        };

        if self.votes.record(round.clone(), from, hash) == Vote::Conflicting {
            warn!(pool_id = %cx.pool_id(), from = %from, round = %round, "Ignoring changed vote");
            return ProcessStep::Pending;
        }

        match kind {
            CloudKind::ExecResult { .. } => self.check_result(cx),
            CloudKind::SingleStorage { .. } => {
                self.check_write(&round, cx).await;
                ProcessStep::Pending
            }
            CloudKind::MultiStorage { .. } => {
                if self.held.contains_key(&round) {
                    self.fetch_slot(&round, from, hash, cx);
                }
                ProcessStep::Pending
            }
        }
    }
}

fn write_kind_is_multi(round: &RequestKey) -> bool {
    matches!(round, RequestKey::MultiStorage { .. })
}

impl Default for StartExec {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Process for StartExec {
    fn state(&self) -> PoolState {
        PoolState::StartExec
    }

    async fn start(&mut self, cx: &mut ProcessContext<'_>) -> ProcessStep {
        let (Some(contract), Some(contract_id), Some(pool)) =
            (cx.core.contract.clone(), cx.core.contract_id, cx.core.pool.as_ref())
        else {
            return ProcessStep::Failed(ErrorRecord::failure(PHASE, "pool is not set up"));
        };

        let trust_level = contract
            .method_policy()
            .ok()
            .and_then(|p| p.storage_read_trust_level)
            .unwrap_or(cx.node.storage.storage_read_trust_level);
        let api = CloudApi {
            pool_id: cx.pool_id(),
            contract_id,
            me: cx.me().number,
            pool_size: pool.len(),
            trust_level,
            config: cx.node.storage.clone(),
            ledger: cx.node.ledger.clone(),
            locks: cx.node.locks.clone(),
            processor: cx.core.handle.clone(),
            epoch: cx.core.epoch,
        };
        let call = MethodCall {
            pool_id: cx.pool_id(),
            method: contract.method.clone(),
            args: contract.args.clone(),
            contract,
        };

        let executor = cx.node.executor.clone();
        cx.spawn(async move { ProcessEvent::MethodFinished(executor.execute(call, api).await) });

        let config = &cx.node.processor;
        self.pulse = Some(cx.every("exec-votes", config.exec_period, || ProcessEvent::Pulse));
        self.storage_pulse = Some(cx.every(
            "storage-votes",
            cx.node.storage.storage_vote_period,
            || ProcessEvent::StoragePulse,
        ));
        self.deadline = Some(cx.deadline("exec-deadline", config.exec_timeout));
        ProcessStep::Pending
    }

    async fn on_event(&mut self, event: ProcessEvent, cx: &mut ProcessContext<'_>) -> ProcessStep {
        match event {
            ProcessEvent::MethodFinished(Ok(output)) => self.on_method_finished(output, cx).await,
            ProcessEvent::MethodFinished(Err(e)) => {
                ProcessStep::Failed(ErrorRecord::failure(PHASE, e.to_string()))
            }
            ProcessEvent::Pulse => {
                self.resend_result(cx).await;
                ProcessStep::Pending
            }
            ProcessEvent::StoragePulse => {
                self.storage_tick(cx).await;
                ProcessStep::Pending
            }
            ProcessEvent::StorageWrite(write) => {
                self.on_storage_write(write, cx).await;
                ProcessStep::Pending
            }
            ProcessEvent::SlotFetched {
                name,
                seq,
                from,
                hash,
                result,
            } => {
                let round = write_key(StorageKind::Multi, &name, seq);
                self.on_slot_fetched(round, from, hash, result, cx).await;
                ProcessStep::Pending
            }
            ProcessEvent::Deadline => {
                let matching = self
                    .result
                    .as_ref()
                    .map_or(0, |(hash, _)| self.votes.matching(&RequestKey::ExecResult, hash));
                let message = match &self.result {
                    Some(_) => format!(
                        "{matching} of {} matching result votes",
                        cx.core.quorum_size
                    ),
                    None => "method did not finish".to_string(),
                };
                ProcessStep::Failed(ErrorRecord::timeout(PHASE, message))
            }
            ProcessEvent::StartingContractFetched(_) => ProcessStep::Pending,
        }
    }

    async fn on_notify(&mut self, notification: &Notification, cx: &mut ProcessContext<'_>) -> NotifyOutcome {
        let from = notification.from.number;
        match &notification.body {
            NotificationBody::StartingContract => NotifyOutcome::Consumed(ProcessStep::Pending),
            NotificationBody::Cloud(_) if !Self::is_member(cx, from) => {
                debug!(pool_id = %cx.pool_id(), from = %from, "Ignoring vote from a non-member");
                NotifyOutcome::Consumed(ProcessStep::Pending)
            }
            NotificationBody::Cloud(kind) => NotifyOutcome::Consumed(self.on_vote(from, kind, cx).await),
        }
    }
}
