use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use ubot_id::NodeNumber;
use ubot_notification::{Codec, NetConfig, NodeDescriptor, Notification};

use super::Transport;

/// Fault injection for [`MemoryNetwork`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkFaults {
    /// Probability a packet is lost.
    pub loss: f64,
    /// Probability a delivered packet arrives twice.
    pub duplication: f64,
    /// Probability a packet is held back long enough for later packets to
    /// overtake it.
    pub reorder: f64,
}

/// Longest a reordered packet is held back.
const MAX_HOLD_BACK: Duration = Duration::from_millis(50);

/// In-process network connecting several nodes.
///
/// Packets go through the wire codec, so senders must be present in the
/// network config just as with UDP.
pub struct MemoryNetwork {
    net: Arc<NetConfig>,
    codec: Codec,
    faults: NetworkFaults,
    inboxes: RwLock<HashMap<NodeNumber, mpsc::Sender<Notification>>>,
    down: RwLock<HashSet<NodeNumber>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryNetwork {
    pub fn new(net: Arc<NetConfig>, faults: NetworkFaults) -> Arc<Self> {
        Arc::new(Self {
            net,
            codec: Codec::new(),
            faults,
            inboxes: RwLock::new(HashMap::new()),
            down: RwLock::new(HashSet::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Connect node `number`, returning its transport and inbound channel.
    pub async fn attach(
        self: &Arc<Self>,
        number: NodeNumber,
        inbound_capacity: usize,
    ) -> (MemoryTransport, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(inbound_capacity);
        self.inboxes.write().await.insert(number, tx);
        (
            MemoryTransport {
                me: number,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Take a node off the network, or bring it back. A down node neither
    /// sends nor receives.
    pub async fn set_down(&self, number: NodeNumber, down: bool) {
        let mut set = self.down.write().await;
        if down {
            set.insert(number);
        } else {
            set.remove(&number);
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn route(self: &Arc<Self>, from: NodeNumber, to: NodeNumber, notification: &Notification) {
        {
            let down = self.down.read().await;
            if down.contains(&from) || down.contains(&to) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let (lost, duplicated, held_back) = {
            let mut rng = rand::rng();
            let lost = rng.random_bool(self.faults.loss.clamp(0.0, 1.0));
            let duplicated = rng.random_bool(self.faults.duplication.clamp(0.0, 1.0));
            let held_back = rng
                .random_bool(self.faults.reorder.clamp(0.0, 1.0))
                .then(|| rng.random_range(Duration::from_millis(1)..=MAX_HOLD_BACK));
            (lost, duplicated, held_back)
        };
        if lost {
            trace!(from = %from, to = %to, "Packet lost");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let decoded = self
            .codec
            .encode_packet(from, std::slice::from_ref(notification))
            .and_then(|packet| self.codec.decode_packet(&packet, &self.net));
        let notifications = match decoded {
            Ok(notifications) => notifications,
            Err(e) => {
                debug!(from = %from, to = %to, error = %e, "Dropping packet that failed the codec");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let Some(inbox) = self.inboxes.read().await.get(&to).cloned() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let copies = if duplicated { 2 } else { 1 };
        let batch: Vec<Notification> = (0..copies)
            .flat_map(|_| notifications.iter().cloned())
            .collect();

        match held_back {
            Some(delay) => {
                trace!(from = %from, to = %to, delay_ms = delay.as_millis() as u64, "Packet held back");
                let network = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    network.push(&inbox, batch);
                });
            }
            None => self.push(&inbox, batch),
        }
    }

    fn push(&self, inbox: &mpsc::Sender<Notification>, batch: Vec<Notification>) {
        for n in batch {
            if inbox.try_send(n).is_ok() {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    me: NodeNumber,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn net(&self) -> &NetConfig {
        &self.network.net
    }

    async fn deliver(&self, to: &NodeDescriptor, notification: Notification) {
        self.network.route(self.me, to.number, &notification).await;
    }
}
