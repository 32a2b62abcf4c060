//! Phase processes.
//!
//! A processor runs one process per non-terminal state. The process owns
//! its timers and in-flight work; dropping it on a state change cancels
//! both, and every event it schedules is tagged with the processor epoch so
//! late deliveries are discarded.

mod download;
mod exec;
mod send;
mod tracker;
mod votes;

pub use download::DownloadStartingContract;
pub use exec::StartExec;
pub use send::{plan_pool_sizes, SendStartingContract};
pub use tracker::PhaseTracker;
pub use votes::{Vote, VoteBook};

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use ubot_id::{NodeNumber, PoolId, ResultHash};
use ubot_notification::{NodeDescriptor, Notification, NotificationBody};
use ubot_schedule::ScheduledTask;

use crate::actor::ActorError;
use crate::caches::StartingContractSession;
use crate::client::FetchError;
use crate::contract::ErrorRecord;
use crate::executor::ExecError;
use crate::node::NodeContext;
use crate::processor::{deliver_after, PoolState, ProcessorCore, ProcessorMessage};
use crate::storage::StorageWrite;

/// What a process reports after handling an input.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStep {
    /// Keep running.
    Pending,
    /// Move to the next state.
    Ready,
    /// Fail the pool.
    Failed(ErrorRecord),
}

/// Outcome of offering a notification to a process.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyOutcome {
    Consumed(ProcessStep),
    /// Belongs to a later phase; hold it until the next state change.
    Deferred,
}

/// Events a process schedules for itself.
#[derive(Debug)]
pub enum ProcessEvent {
    /// Periodic re-send tick.
    Pulse,
    /// Periodic storage vote tick.
    StoragePulse,
    /// The phase deadline passed.
    Deadline,
    StartingContractFetched(Result<StartingContractSession, FetchError>),
    MethodFinished(Result<Value, ExecError>),
    StorageWrite(StorageWrite),
    SlotFetched {
        name: String,
        seq: u32,
        from: NodeNumber,
        hash: ResultHash,
        result: Result<Bytes, FetchError>,
    },
}

/// Behavior of one processor state.
#[async_trait]
pub trait Process: Send {
    fn state(&self) -> PoolState;

    /// Called once on entering the state.
    async fn start(&mut self, cx: &mut ProcessContext<'_>) -> ProcessStep;

    async fn on_event(&mut self, event: ProcessEvent, cx: &mut ProcessContext<'_>) -> ProcessStep;

    async fn on_notify(&mut self, notification: &Notification, cx: &mut ProcessContext<'_>) -> NotifyOutcome;
}

/// What a process may touch while handling an input.
pub struct ProcessContext<'a> {
    pub core: &'a mut ProcessorCore,
    pub node: &'a NodeContext,
}

impl<'a> ProcessContext<'a> {
    pub fn new(core: &'a mut ProcessorCore, node: &'a NodeContext) -> Self {
        Self { core, node }
    }

    pub fn me(&self) -> &NodeDescriptor {
        &self.node.me
    }

    pub fn pool_id(&self) -> PoolId {
        self.core.pool_id
    }

    /// Deliver `make()` to this processor every `period`.
    ///
    /// Ticks that find the mailbox full are skipped.
    pub fn every(&self, name: &'static str, period: Duration, make: fn() -> ProcessEvent) -> ScheduledTask {
        let handle = self.core.handle.clone();
        let epoch = self.core.epoch;
        ScheduledTask::every(name, period, move || {
            match handle.try_send(ProcessorMessage::Process { epoch, event: make() }) {
                Ok(()) | Err(ActorError::MailboxFull) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        })
    }

    /// Deliver [`ProcessEvent::Deadline`] once after `delay`.
    pub fn deadline(&self, name: &'static str, delay: Duration) -> ScheduledTask {
        deliver_after(
            name,
            delay,
            self.core.handle.clone(),
            ProcessorMessage::Process {
                epoch: self.core.epoch,
                event: ProcessEvent::Deadline,
            },
        )
    }

    /// Run `work` in the background and deliver its event when it finishes.
    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = ProcessEvent> + Send + 'static,
    {
        let handle = self.core.handle.clone();
        let epoch = self.core.epoch;
        tokio::spawn(async move {
            let event = work.await;
            let _ = handle.send(ProcessorMessage::Process { epoch, event }).await;
        });
    }

    /// Send a request to `to`.
    pub async fn request(&self, to: &NodeDescriptor, body: NotificationBody) {
        let notification = Notification::request(self.me().clone(), self.pool_id(), body);
        self.node.transport.deliver(to, notification).await;
    }

    /// Send an answer to `to` and keep it for re-delivery on retried requests.
    pub async fn answer(&mut self, to: &NodeDescriptor, body: NotificationBody) {
        let notification = self.remember_answer(body);
        self.node.transport.deliver(to, notification).await;
    }

    /// Record this node's vote as its standing answer and send it as a
    /// request to each of `targets`.
    pub async fn vote(&mut self, body: NotificationBody, targets: &[NodeDescriptor]) {
        self.remember_answer(body.clone());
        for to in targets {
            self.request(to, body.clone()).await;
        }
    }

    fn remember_answer(&mut self, body: NotificationBody) -> Notification {
        let notification = Notification::answer(self.me().clone(), self.pool_id(), body);
        self.core
            .answers
            .insert(notification.request_key(), notification.clone());
        notification
    }

    /// Pool members other than this node.
    pub fn peers(&self) -> Vec<NodeDescriptor> {
        match &self.core.pool {
            Some(pool) => pool.others(self.node.me.number).cloned().collect(),
            None => Vec::new(),
        }
    }
}
