//! Cloud processors.
//!
//! One processor per pool id drives that pool through its states:
//!
//! ```text
//! INIT ──► SEND_STARTING_CONTRACT ─────┐
//!   │                                  ├──► START_EXEC ──► FINISHED
//!   └────► DOWNLOAD_STARTING_CONTRACT ─┘
//!
//! every non-terminal state may also move to FAILED
//! ```
//!
//! Processors run as actors. Notifications and scheduled events are
//! handled one at a time, so a processor's state never needs a lock.

mod state;
mod table;

pub use state::{PoolState, PoolStateMachine};
pub use table::ProcessorTable;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use ubot_id::{ContractId, PoolId};
use ubot_notification::{NodeDescriptor, Notification, NotificationBody, RequestKey};
use ubot_schedule::ScheduledTask;

use crate::actor::{Actor, ActorContext, ActorError, ActorHandle};
use crate::contract::{ContractError, ErrorRecord, StartingContract};
use crate::node::NodeContext;
use crate::pool::Pool;
use crate::process::{
    plan_pool_sizes, DownloadStartingContract, NotifyOutcome, Process, ProcessContext,
    ProcessEvent, ProcessStep, SendStartingContract, StartExec,
};

// =============================================================================
// Messages and errors
// =============================================================================

/// Processor errors.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("illegal state transition {from} -> {to}")]
    IllegalTransition { from: PoolState, to: PoolState },

    #[error("state {0} has no successor to advance to")]
    NoSuccessor(PoolState),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("node is shutting down")]
    ShuttingDown,
}

/// Messages a processor handles.
#[derive(Debug)]
pub enum ProcessorMessage {
    /// A notification for this pool.
    Notify(Notification),

    /// An event scheduled by the process of epoch `epoch`.
    Process { epoch: u64, event: ProcessEvent },

    /// A responder never received its invite.
    InitTimeout,
}

/// Externally visible processor state.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorSnapshot {
    pub pool_id: PoolId,
    pub state: PoolState,
    pub result: Option<Value>,
    pub errors: Vec<ErrorRecord>,
}

impl ProcessorSnapshot {
    pub fn new(pool_id: PoolId) -> Self {
        Self {
            pool_id,
            state: PoolState::Init,
            result: None,
            errors: Vec::new(),
        }
    }
}

/// What remains of a processor after it reached a terminal state.
///
/// Kept for a grace period so `getState` keeps working and retried
/// requests from slower peers still get this node's answers.
#[derive(Debug)]
pub struct FinishedProcessor {
    pub snapshot: ProcessorSnapshot,
    pub answers: HashMap<RequestKey, Notification>,
}

/// Deliver `message` to `handle` once after `delay`.
///
/// Waits for mailbox room instead of dropping the message when the mailbox
/// is full at the time it fires.
pub(crate) fn deliver_after(
    name: &'static str,
    delay: Duration,
    handle: ActorHandle<ProcessorMessage>,
    message: ProcessorMessage,
) -> ScheduledTask {
    ScheduledTask::after(name, delay, move || {
        tokio::spawn(async move {
            let _ = handle.send(message).await;
        });
    })
}

// =============================================================================
// Core
// =============================================================================

/// Processor state shared with the running process.
#[derive(Debug)]
pub struct ProcessorCore {
    pub(crate) pool_id: PoolId,
    pub(crate) machine: PoolStateMachine,
    /// Bumped on every state change.
    pub(crate) epoch: u64,
    pub(crate) contract_bin: Option<Bytes>,
    pub(crate) contract: Option<Arc<StartingContract>>,
    pub(crate) contract_id: Option<ContractId>,
    /// Node that invited this one; unset on the initiator.
    pub(crate) initiator: Option<NodeDescriptor>,
    pub(crate) pool: Option<Pool>,
    pub(crate) quorum_size: usize,
    pub(crate) errors: Vec<ErrorRecord>,
    pub(crate) output: Option<Value>,
    /// This node's answer for each request it has answered or voted on.
    pub(crate) answers: HashMap<RequestKey, Notification>,
    pub(crate) handle: ActorHandle<ProcessorMessage>,
}

impl ProcessorCore {
    pub(crate) fn new(pool_id: PoolId, handle: ActorHandle<ProcessorMessage>) -> Self {
        Self {
            pool_id,
            machine: PoolStateMachine::default(),
            epoch: 0,
            contract_bin: None,
            contract: None,
            contract_id: None,
            initiator: None,
            pool: None,
            quorum_size: 0,
            errors: Vec::new(),
            output: None,
            answers: HashMap::new(),
            handle,
        }
    }

    pub fn state(&self) -> PoolState {
        self.machine.current()
    }

    fn snapshot(&self) -> ProcessorSnapshot {
        ProcessorSnapshot {
            pool_id: self.pool_id,
            state: self.state(),
            result: self.output.clone(),
            errors: self.errors.clone(),
        }
    }
}

// =============================================================================
// Processor actor
// =============================================================================

/// How a processor came to exist.
#[derive(Debug)]
pub enum Bootstrap {
    /// This node was asked to run the method.
    Initiator {
        contract_bin: Bytes,
        contract: StartingContract,
        contract_id: ContractId,
    },
    /// A notification arrived for an unknown pool.
    Responder,
}

pub struct CloudProcessor {
    core: ProcessorCore,
    node: Arc<NodeContext>,
    bootstrap: Option<Bootstrap>,
    active: Option<Box<dyn Process>>,
    deferred: VecDeque<Notification>,
    init_timer: Option<ScheduledTask>,
    snapshot_tx: watch::Sender<ProcessorSnapshot>,
    table: Weak<ProcessorTable>,
}

impl CloudProcessor {
    pub(crate) fn new(
        pool_id: PoolId,
        bootstrap: Bootstrap,
        node: Arc<NodeContext>,
        handle: ActorHandle<ProcessorMessage>,
        snapshot_tx: watch::Sender<ProcessorSnapshot>,
        table: Weak<ProcessorTable>,
    ) -> Self {
        Self {
            core: ProcessorCore::new(pool_id, handle),
            node,
            bootstrap: Some(bootstrap),
            active: None,
            deferred: VecDeque::new(),
            init_timer: None,
            snapshot_tx,
            table,
        }
    }

    fn state(&self) -> PoolState {
        self.core.state()
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.core.snapshot());
    }

    fn build_process(&self, state: PoolState) -> Option<Box<dyn Process>> {
        match state {
            PoolState::SendStartingContract => Some(Box::new(SendStartingContract::new())),
            PoolState::DownloadStartingContract => {
                Some(Box::new(DownloadStartingContract::new()))
            }
            PoolState::StartExec => Some(Box::new(StartExec::new())),
            PoolState::Init | PoolState::Finished | PoolState::Failed => None,
        }
    }

    /// Enter `next`, dropping the previous process and starting the new one.
    async fn enter(&mut self, next: PoolState) -> Result<ProcessStep, ProcessorError> {
        let previous = self.core.machine.transition(next)?;
        self.core.epoch += 1;
        self.active = None;
        self.init_timer = None;

        info!(
            pool_id = %self.core.pool_id,
            from = %previous,
            to = %next,
            epoch = self.core.epoch,
            "Pool state changed"
        );
        self.publish();

        let Some(mut process) = self.build_process(next) else {
            self.deferred.clear();
            return Ok(ProcessStep::Pending);
        };

        let mut cx = ProcessContext::new(&mut self.core, &self.node);
        let step = process.start(&mut cx).await;
        self.active = Some(process);

        if step != ProcessStep::Pending {
            return Ok(step);
        }
        Ok(self.replay_deferred().await.unwrap_or(ProcessStep::Pending))
    }

    /// Offer every held notification to the new process once.
    ///
    /// Stops at the first one that ends the phase; the rest stay held.
    async fn replay_deferred(&mut self) -> Option<ProcessStep> {
        let process = self.active.as_mut()?;
        let held = std::mem::take(&mut self.deferred);
        let mut held = held.into_iter();

        while let Some(notification) = held.next() {
            let mut cx = ProcessContext::new(&mut self.core, &self.node);
            match process.on_notify(&notification, &mut cx).await {
                NotifyOutcome::Deferred => self.deferred.push_back(notification),
                NotifyOutcome::Consumed(ProcessStep::Pending) => {}
                NotifyOutcome::Consumed(step) => {
                    self.deferred.extend(held);
                    return Some(step);
                }
            }
        }
        None
    }

    /// Apply `step` and every step the following states produce right away.
    async fn advance(&mut self, mut step: ProcessStep) -> Result<(), ProcessorError> {
        loop {
            let next = match step {
                ProcessStep::Pending => return Ok(()),
                ProcessStep::Ready => self.ready_target()?,
                ProcessStep::Failed(record) => {
                    warn!(pool_id = %self.core.pool_id, state = %self.state(), error = %record, "Pool failed");
                    self.core.errors.push(record);
                    PoolState::Failed
                }
            };
            step = self.enter(next).await?;
        }
    }

    fn ready_target(&self) -> Result<PoolState, ProcessorError> {
        match self.state() {
            PoolState::SendStartingContract | PoolState::DownloadStartingContract => {
                Ok(PoolState::StartExec)
            }
            PoolState::StartExec => Ok(PoolState::Finished),
            state => Err(ProcessorError::NoSuccessor(state)),
        }
    }

    /// Record a processor-level failure and stop the pool.
    async fn fail(&mut self, error: ProcessorError) {
        error!(pool_id = %self.core.pool_id, state = %self.state(), error = %error, "Processor error");
        if self.state().is_terminal() {
            return;
        }
        let record = ErrorRecord::failure(self.state().name(), error.to_string());
        if let Err(e) = self.advance(ProcessStep::Failed(record)).await {
            error!(pool_id = %self.core.pool_id, error = %e, "Could not fail the pool");
        }
    }

    fn defer(&mut self, notification: Notification) {
        if self.deferred.len() >= self.node.processor.deferred_limit {
            warn!(
                pool_id = %self.core.pool_id,
                kind = notification.kind_name(),
                "Deferred buffer full, dropping notification"
            );
            return;
        }
        self.deferred.push_back(notification);
    }

    async fn on_notification(&mut self, notification: Notification) -> Result<(), ProcessorError> {
        debug!(
            pool_id = %self.core.pool_id,
            from = %notification.from.number,
            kind = notification.kind_name(),
            is_answer = notification.is_answer,
            "Notification received"
        );

        if !notification.is_answer {
            if let Some(answer) = self.core.answers.get(&notification.request_key()) {
                self.node
                    .transport
                    .deliver(&notification.from, answer.clone())
                    .await;
            }
        }

        let outcome = match self.active.as_mut() {
            Some(process) => {
                let mut cx = ProcessContext::new(&mut self.core, &self.node);
                Some(process.on_notify(&notification, &mut cx).await)
            }
            None => None,
        };

        match outcome {
            Some(NotifyOutcome::Consumed(step)) => self.advance(step).await,
            Some(NotifyOutcome::Deferred) => {
                self.defer(notification);
                Ok(())
            }
            None if self.state() == PoolState::Init => {
                let is_invite = !notification.is_answer
                    && notification.body == NotificationBody::StartingContract;
                if is_invite {
                    self.core.initiator = Some(notification.from);
                    let step = self.enter(PoolState::DownloadStartingContract).await?;
                    self.advance(step).await
                } else {
                    self.defer(notification);
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    async fn on_event(&mut self, epoch: u64, event: ProcessEvent) -> Result<(), ProcessorError> {
        if epoch != self.core.epoch {
            debug!(
                pool_id = %self.core.pool_id,
                epoch,
                current = self.core.epoch,
                "Dropping event from an earlier state"
            );
            return Ok(());
        }
        let Some(process) = self.active.as_mut() else {
            return Ok(());
        };
        let mut cx = ProcessContext::new(&mut self.core, &self.node);
        let step = process.on_event(event, &mut cx).await;
        self.advance(step).await
    }

    async fn retire(&mut self) {
        self.active = None;
        self.init_timer = None;
        self.publish();

        let finished = FinishedProcessor {
            snapshot: self.core.snapshot(),
            answers: std::mem::take(&mut self.core.answers),
        };
        info!(
            pool_id = %self.core.pool_id,
            state = %finished.snapshot.state,
            errors = finished.snapshot.errors.len(),
            "Processor finished"
        );

        if let Some(table) = self.table.upgrade() {
            table.retire(finished).await;
        }
    }
}

#[async_trait]
impl Actor for CloudProcessor {
    type Message = ProcessorMessage;

    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        let result = match self.bootstrap.take() {
            Some(Bootstrap::Initiator {
                contract_bin,
                contract,
                contract_id,
            }) => {
                // A method whose sizes cannot be met fails before any send.
                match plan_pool_sizes(&contract, &self.node) {
                    Ok(_) => {
                        self.core.contract_bin = Some(contract_bin);
                        self.core.contract = Some(Arc::new(contract));
                        self.core.contract_id = Some(contract_id);
                        match self.enter(PoolState::SendStartingContract).await {
                            Ok(step) => self.advance(step).await,
                            Err(e) => Err(e),
                        }
                    }
                    Err(record) => self.advance(ProcessStep::Failed(record)).await,
                }
            }
            Some(Bootstrap::Responder) | None => {
                self.init_timer = Some(deliver_after(
                    "init-timeout",
                    self.node.processor.init_timeout,
                    self.core.handle.clone(),
                    ProcessorMessage::InitTimeout,
                ));
                Ok(())
            }
        };

        if let Err(e) = result {
            self.fail(e).await;
        }
        if self.state().is_terminal() {
            self.retire().await;
            return Ok(false);
        }
        Ok(true)
    }

    async fn handle(
        &mut self,
        msg: ProcessorMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        let result = match msg {
            ProcessorMessage::Notify(notification) => self.on_notification(notification).await,
            ProcessorMessage::Process { epoch, event } => self.on_event(epoch, event).await,
            ProcessorMessage::InitTimeout => {
                if self.state() == PoolState::Init {
                    let record = ErrorRecord::timeout(
                        PoolState::Init.name(),
                        "no download invite received",
                    );
                    self.advance(ProcessStep::Failed(record)).await
                } else {
                    Ok(())
                }
            }
        };

        if let Err(e) = result {
            self.fail(e).await;
        }
        if self.state().is_terminal() {
            self.retire().await;
            return Ok(false);
        }
        Ok(true)
    }
}
