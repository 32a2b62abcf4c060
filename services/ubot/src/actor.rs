//! Minimal actor runtime.
//!
//! Each pool's processor runs as one actor: a task that owns its state and
//! handles mailbox messages one at a time. Handles are created before the
//! actor itself so the actor can schedule messages to its own mailbox.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop. An `Err` stops
    /// the actor.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Called once before the first message.
    ///
    /// Returns `Ok(false)` if the actor finished during startup.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        Ok(true)
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Context provided to actors during message handling.
#[derive(Debug)]
pub struct ActorContext {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Messages handled so far.
    pub messages_processed: u64,
}

impl ActorContext {
    pub(crate) fn new(actor_id: String) -> Self {
        Self {
            actor_id,
            messages_processed: 0,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Actor mailbox is full.
    #[error("mailbox full")]
    MailboxFull,

    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("actor_id", &self.actor_id)
            .finish()
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message, waiting for mailbox capacity.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Try to send a message without waiting.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    /// True once the actor has stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Receiving half of an actor's mailbox, consumed by [`spawn`].
pub struct Mailbox<M: Message> {
    rx: mpsc::Receiver<M>,
    actor_id: String,
}

impl<M: Message> Mailbox<M> {
    /// Take the raw receiver, for driving an actor's peer by hand in tests.
    #[cfg(test)]
    pub(crate) fn into_receiver(self) -> mpsc::Receiver<M> {
        self.rx
    }
}

/// Create a mailbox and its handle.
pub fn mailbox<M: Message>(name: &str, capacity: usize) -> (ActorHandle<M>, Mailbox<M>) {
    let actor_id = format!("{}_{}", name, generate_actor_id());
    let (tx, rx) = mpsc::channel(capacity);
    (
        ActorHandle {
            tx,
            actor_id: actor_id.clone(),
        },
        Mailbox { rx, actor_id },
    )
}

/// Run `actor` on its mailbox until it stops or `shutdown` fires.
pub fn spawn<A: Actor>(
    actor: A,
    mailbox: Mailbox<A::Message>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    debug!(actor_id = %mailbox.actor_id, "Spawning actor");
    tokio::spawn(run_actor_loop(actor, mailbox, shutdown))
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mailbox: Mailbox<A::Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Mailbox { mut rx, actor_id } = mailbox;
    let mut ctx = ActorContext::new(actor_id.clone());

    match actor.on_start(&mut ctx).await {
        Ok(true) => {}
        Ok(false) => {
            actor.on_stop(&mut ctx).await;
            debug!(actor_id = %actor_id, "Actor finished during start");
            return;
        }
        Err(e) => {
            error!(actor_id = %actor_id, error = %e, "Actor failed to start");
            return;
        }
    }

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };

                ctx.messages_processed += 1;

                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Err(e) => {
                        error!(actor_id = %actor_id, error = %e, "Actor failed");
                        break;
                    }
                }
            }
        }
    }

    rx.close();
    actor.on_stop(&mut ctx).await;

    debug!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[derive(Debug)]
    enum CounterMsg {
        Add(u32),
        Get(oneshot::Sender<u32>),
        Fail,
        Stop,
    }

    struct Counter {
        total: u32,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMsg;

        async fn handle(
            &mut self,
            msg: CounterMsg,
            _ctx: &mut ActorContext,
        ) -> Result<bool, ActorError> {
            match msg {
                CounterMsg::Add(n) => self.total += n,
                CounterMsg::Get(reply) => {
                    let _ = reply.send(self.total);
                }
                CounterMsg::Fail => return Err(ActorError::ActorStopped),
                CounterMsg::Stop => return Ok(false),
            }
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_actor_handles_messages_in_order() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, mailbox) = mailbox("counter", 16);
        let task = spawn(Counter { total: 0 }, mailbox, shutdown_rx);

        handle.send(CounterMsg::Add(2)).await.unwrap();
        handle.try_send(CounterMsg::Add(3)).unwrap();

        let (tx, rx) = oneshot::channel();
        handle.send(CounterMsg::Get(tx)).await.unwrap();
        assert_eq!(rx.await.unwrap(), 5);

        handle.send(CounterMsg::Stop).await.unwrap();
        task.await.unwrap();
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(CounterMsg::Add(1)).await,
            Err(ActorError::ActorStopped)
        ));
    }

    #[tokio::test]
    async fn test_actor_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, mailbox) = mailbox::<CounterMsg>("counter", 16);
        let task = spawn(Counter { total: 0 }, mailbox, shutdown_rx);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_handler_error_stops_the_actor() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, mailbox) = mailbox("counter", 16);
        let task = spawn(Counter { total: 0 }, mailbox, shutdown_rx);

        handle.send(CounterMsg::Add(1)).await.unwrap();
        handle.send(CounterMsg::Fail).await.unwrap();
        task.await.unwrap();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_try_send_reports_full_mailbox() {
        let (handle, _mailbox) = mailbox::<CounterMsg>("counter", 1);

        handle.try_send(CounterMsg::Add(1)).unwrap();
        assert!(matches!(
            handle.try_send(CounterMsg::Add(1)),
            Err(ActorError::MailboxFull)
        ));
    }

    #[test]
    fn test_actor_ids_are_unique() {
        let (a, _) = mailbox::<CounterMsg>("p", 1);
        let (b, _) = mailbox::<CounterMsg>("p", 1);
        assert_ne!(a.actor_id(), b.actor_id());
    }
}
