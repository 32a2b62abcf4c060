//! Responder phase: fetch the starting contract from the initiator and
//! confirm it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use ubot_notification::{Notification, NotificationBody};
use ubot_schedule::ScheduledTask;

use super::{NotifyOutcome, Process, ProcessContext, ProcessEvent, ProcessStep};
use crate::caches::StartingContractSession;
use crate::contract::{ErrorRecord, StartingContract};
use crate::pool::{compute_quorum_size, Pool};
use crate::processor::PoolState;

const PHASE: &str = "DOWNLOAD_STARTING_CONTRACT";

/// Why a downloaded session was not adopted.
enum Rejection {
    /// Try downloading again.
    Retry(String),
    /// The session can never be valid.
    Fatal(ErrorRecord),
}

pub struct DownloadStartingContract {
    in_flight: bool,
    attempts: u32,
    pulse: Option<ScheduledTask>,
    deadline: Option<ScheduledTask>,
}

impl DownloadStartingContract {
    pub fn new() -> Self {
        Self {
            in_flight: false,
            attempts: 0,
            pulse: None,
            deadline: None,
        }
    }

    fn fetch(&mut self, cx: &ProcessContext<'_>) {
        if self.in_flight {
            return;
        }
        let Some(initiator) = cx.core.initiator.clone() else {
            return;
        };
        self.in_flight = true;
        self.attempts += 1;

        let fetcher = cx.node.fetcher.clone();
        let pool_id = cx.pool_id();
        cx.spawn(async move {
            ProcessEvent::StartingContractFetched(fetcher.starting_contract(&initiator, pool_id).await)
        });
    }

    /// Check a downloaded session and install it into the processor.
    fn adopt(session: StartingContractSession, cx: &mut ProcessContext<'_>) -> Result<(), Rejection> {
        if !cx.pool_id().matches(&session.contract_bin) {
            return Err(Rejection::Retry("starting contract does not hash to the pool id".to_string()));
        }

        let contract = StartingContract::unpack(&session.contract_bin)
            .map_err(|e| Rejection::Fatal(ErrorRecord::bad_value("startingContract", e.to_string())))?;
        let contract_id = contract
            .executable_contract
            .id()
            .map_err(|e| Rejection::Fatal(ErrorRecord::bad_value("executableContract", e.to_string())))?;
        let policy = contract
            .method_policy()
            .map_err(|e| Rejection::Fatal(ErrorRecord::bad_value("method", e.to_string())))?;

        let pool = Pool::from_numbers(&session.selected_pool, &cx.node.net)
            .map_err(|e| Rejection::Fatal(ErrorRecord::bad_value("selectedPool", e.to_string())))?;
        let me = cx.me().number;
        if !pool.contains(me) {
            return Err(Rejection::Fatal(ErrorRecord::bad_value(
                "selectedPool",
                format!("node {me} is not a member"),
            )));
        }
        if let Some(initiator) = &cx.core.initiator {
            if !pool.contains(initiator.number) {
                return Err(Rejection::Fatal(ErrorRecord::bad_value(
                    "selectedPool",
                    format!("initiator {} is not a member", initiator.number),
                )));
            }
        }

        let quorum_policy = policy.quorum.unwrap_or(cx.node.processor.default_quorum);
        let quorum_size = compute_quorum_size(&quorum_policy, pool.len())
            .map_err(|e| Rejection::Fatal(ErrorRecord::bad_value("quorum", e.to_string())))?;

        info!(
            pool_id = %cx.pool_id(),
            pool = ?pool.numbers(),
            quorum = quorum_size,
            "Starting contract downloaded"
        );

        cx.core.contract = Some(Arc::new(contract));
        cx.core.contract_id = Some(contract_id);
        cx.core.contract_bin = Some(session.contract_bin);
        cx.core.pool = Some(pool);
        cx.core.quorum_size = quorum_size;
        Ok(())
    }
}

impl Default for DownloadStartingContract {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Process for DownloadStartingContract {
    fn state(&self) -> PoolState {
        PoolState::DownloadStartingContract
    }

    async fn start(&mut self, cx: &mut ProcessContext<'_>) -> ProcessStep {
        if cx.core.initiator.is_none() {
            return ProcessStep::Failed(ErrorRecord::failure(PHASE, "no initiator to download from"));
        }
        let config = &cx.node.processor;
        self.fetch(cx);
        self.pulse = Some(cx.every("download-retry", config.download_period, || ProcessEvent::Pulse));
        self.deadline = Some(cx.deadline("download-deadline", config.download_timeout));
        ProcessStep::Pending
    }

    async fn on_event(&mut self, event: ProcessEvent, cx: &mut ProcessContext<'_>) -> ProcessStep {
        match event {
            ProcessEvent::Pulse => {
                self.fetch(cx);
                ProcessStep::Pending
            }
            ProcessEvent::Deadline => ProcessStep::Failed(ErrorRecord::timeout(
                PHASE,
                format!("starting contract not downloaded after {} attempts", self.attempts),
            )),
            ProcessEvent::StartingContractFetched(result) => {
                self.in_flight = false;
                let session = match result {
                    Ok(session) => session,
                    Err(e) => {
                        debug!(pool_id = %cx.pool_id(), attempt = self.attempts, error = %e, "Starting contract not available yet");
                        return ProcessStep::Pending;
                    }
                };

                match Self::adopt(session, cx) {
                    Ok(()) => {
                        self.pulse = None;
                        self.deadline = None;
                        if let Some(initiator) = cx.core.initiator.clone() {
                            cx.answer(&initiator, NotificationBody::StartingContract).await;
                        }
                        ProcessStep::Ready
                    }
                    Err(Rejection::Retry(reason)) => {
                        warn!(pool_id = %cx.pool_id(), reason = %reason, "Discarding downloaded starting contract");
                        ProcessStep::Pending
                    }
                    Err(Rejection::Fatal(record)) => ProcessStep::Failed(record),
                }
            }
            _ => ProcessStep::Pending,
        }
    }

    async fn on_notify(&mut self, notification: &Notification, _cx: &mut ProcessContext<'_>) -> NotifyOutcome {
        match notification.body {
            NotificationBody::StartingContract => NotifyOutcome::Consumed(ProcessStep::Pending),
            NotificationBody::Cloud(_) => NotifyOutcome::Deferred,
        }
    }
}
