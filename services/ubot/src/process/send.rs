//! Initiator phase: pick a pool and get its members to download the
//! starting contract.

use async_trait::async_trait;
use tracing::{debug, info};
use ubot_notification::{Notification, NotificationBody};
use ubot_schedule::ScheduledTask;

use super::{NotifyOutcome, PhaseTracker, Process, ProcessContext, ProcessEvent, ProcessStep};
use crate::caches::StartingContractSession;
use crate::contract::{ErrorRecord, StartingContract};
use crate::node::NodeContext;
use crate::pool::{resolve_sizes, select_pool};
use crate::processor::PoolState;

const PHASE: &str = "SEND_STARTING_CONTRACT";

/// Pool and quorum sizes for the invoked method on this node's network.
pub fn plan_pool_sizes(
    contract: &StartingContract,
    node: &NodeContext,
) -> Result<(usize, usize), ErrorRecord> {
    let config = &node.processor;
    let policy = contract
        .method_policy()
        .map_err(|e| ErrorRecord::bad_value("method", e.to_string()))?;
    resolve_sizes(
        policy.pool.as_ref().unwrap_or(&config.default_pool),
        policy.quorum.as_ref().unwrap_or(&config.default_quorum),
        config.limits(),
        node.net.len(),
    )
    .map_err(|e| ErrorRecord::failure("pool", e.to_string()))
}

pub struct SendStartingContract {
    tracker: PhaseTracker,
    pulse: Option<ScheduledTask>,
    deadline: Option<ScheduledTask>,
}

impl SendStartingContract {
    pub fn new() -> Self {
        Self {
            tracker: PhaseTracker::new(0, 0),
            pulse: None,
            deadline: None,
        }
    }

    async fn invite_missing(&self, cx: &ProcessContext<'_>) {
        let Some(pool) = &cx.core.pool else {
            return;
        };
        for member in self.tracker.missing(pool) {
            cx.request(member, NotificationBody::StartingContract).await;
        }
    }

    fn stop_timers(&mut self) {
        self.pulse = None;
        self.deadline = None;
    }
}

impl Default for SendStartingContract {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Process for SendStartingContract {
    fn state(&self) -> PoolState {
        PoolState::SendStartingContract
    }

    async fn start(&mut self, cx: &mut ProcessContext<'_>) -> ProcessStep {
        let (Some(contract), Some(contract_bin)) = (cx.core.contract.clone(), cx.core.contract_bin.clone()) else {
            return ProcessStep::Failed(ErrorRecord::failure(PHASE, "no starting contract"));
        };
        let (pool_size, quorum_size) = match plan_pool_sizes(&contract, cx.node) {
            Ok(sizes) => sizes,
            Err(record) => return ProcessStep::Failed(record),
        };

        let selected = select_pool(&cx.node.net, cx.me().number, pool_size, &mut rand::rng());
        let pool = match selected {
            Ok(pool) => pool,
            Err(e) => return ProcessStep::Failed(ErrorRecord::failure("pool", e.to_string())),
        };

        info!(
            pool_id = %cx.pool_id(),
            pool = ?pool.numbers(),
            quorum = quorum_size,
            "Pool selected"
        );

        cx.node
            .caches
            .publish_session(
                cx.pool_id(),
                StartingContractSession {
                    contract_bin,
                    selected_pool: pool.numbers(),
                },
            )
            .await;

        self.tracker = PhaseTracker::new(pool.len(), quorum_size);
        self.tracker.record(cx.me().number);
        cx.core.pool = Some(pool);
        cx.core.quorum_size = quorum_size;

        if self.tracker.is_ready() {
            return ProcessStep::Ready;
        }

        self.invite_missing(cx).await;
        let config = &cx.node.processor;
        self.pulse = Some(cx.every("send-invites", config.send_period, || ProcessEvent::Pulse));
        self.deadline = Some(cx.deadline("send-deadline", config.send_timeout));
        ProcessStep::Pending
    }

    async fn on_event(&mut self, event: ProcessEvent, cx: &mut ProcessContext<'_>) -> ProcessStep {
        match event {
            ProcessEvent::Pulse => {
                self.invite_missing(cx).await;
                ProcessStep::Pending
            }
            ProcessEvent::Deadline => {
                self.stop_timers();
                if self.tracker.is_acceptable() {
                    info!(
                        pool_id = %cx.pool_id(),
                        answered = self.tracker.answered(),
                        "Invite deadline reached with a quorum"
                    );
                    ProcessStep::Ready
                } else {
                    ProcessStep::Failed(ErrorRecord::timeout(
                        PHASE,
                        format!(
                            "{} of {} members downloaded the starting contract, {} needed",
                            self.tracker.answered(),
                            cx.core.pool.as_ref().map_or(0, |p| p.len()),
                            cx.core.quorum_size
                        ),
                    ))
                }
            }
            _ => ProcessStep::Pending,
        }
    }

    async fn on_notify(&mut self, notification: &Notification, cx: &mut ProcessContext<'_>) -> NotifyOutcome {
        match &notification.body {
            NotificationBody::StartingContract => {
                let from = notification.from.number;
                let is_member = cx.core.pool.as_ref().is_some_and(|p| p.contains(from));
                if notification.is_answer && is_member && self.tracker.record(from) {
                    debug!(pool_id = %cx.pool_id(), from = %from, "Member downloaded the starting contract");
                    if self.tracker.is_ready() {
                        self.stop_timers();
                        return NotifyOutcome::Consumed(ProcessStep::Ready);
                    }
                }
                NotifyOutcome::Consumed(ProcessStep::Pending)
            }
            NotificationBody::Cloud(_) => NotifyOutcome::Deferred,
        }
    }
}
