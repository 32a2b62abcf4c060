//! Best-effort notification delivery.
//!
//! Delivery may drop, duplicate or reorder notifications. Every phase
//! re-sends what it needs until it is answered, so callers never learn
//! whether a particular send arrived.

mod memory;
mod udp;

pub use memory::{MemoryNetwork, MemoryTransport, NetworkFaults};
pub use udp::UdpTransport;

use async_trait::async_trait;
use ubot_id::NodeNumber;
use ubot_notification::{NetConfig, NodeDescriptor, Notification};

/// Sends notifications to other nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The network this transport reaches.
    fn net(&self) -> &NetConfig;

    /// Send `notification` to `to`. Failures are logged, never returned.
    async fn deliver(&self, to: &NodeDescriptor, notification: Notification);

    /// Send `notification` to every known node except `except`.
    async fn broadcast(&self, except: NodeNumber, notification: Notification) {
        for node in self.net().others(except) {
            self.deliver(node, notification.clone()).await;
        }
    }
}
