use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ubot_id::NodeNumber;
use ubot_notification::{Codec, NetConfig, NodeDescriptor, Notification};

use super::Transport;

/// Largest datagram the receiver accepts.
const MAX_DATAGRAM: usize = 65_507;

/// Notification transport over UDP, one notification per packet.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    me: NodeNumber,
    net: Arc<NetConfig>,
    codec: Arc<Codec>,
}

impl UdpTransport {
    /// Bind `addr` and start the receiver.
    ///
    /// Decoded notifications are pushed to the returned channel; packets
    /// that fail to decode are logged and dropped.
    pub async fn bind(
        addr: SocketAddr,
        me: NodeNumber,
        net: Arc<NetConfig>,
        inbound_capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, mpsc::Receiver<Notification>, JoinHandle<()>)> {
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .with_context(|| format!("failed to bind UDP socket on {addr}"))?,
        );
        info!(addr = %socket.local_addr()?, node = %me, "UDP transport listening");

        let codec = Arc::new(Codec::new());
        let (tx, rx) = mpsc::channel(inbound_capacity);
        let receiver = tokio::spawn(run_receiver(
            socket.clone(),
            codec.clone(),
            net.clone(),
            tx,
            shutdown,
        ));

        Ok((
            Self {
                socket,
                me,
                net,
                codec,
            },
            rx,
            receiver,
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn net(&self) -> &NetConfig {
        &self.net
    }

    async fn deliver(&self, to: &NodeDescriptor, notification: Notification) {
        let packet = match self.codec.encode_packet(self.me, std::slice::from_ref(&notification)) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(to = %to.number, kind = notification.kind_name(), error = %e, "Failed to encode notification");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&packet, to.udp_addr).await {
            debug!(to = %to.number, addr = %to.udp_addr, error = %e, "UDP send failed");
        }
    }
}

async fn run_receiver(
    socket: Arc<UdpSocket>,
    codec: Arc<Codec>,
    net: Arc<NetConfig>,
    tx: mpsc::Sender<Notification>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("UDP receiver shutting down");
                    break;
                }
            }

            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed");
                        continue;
                    }
                };

                let notifications = match codec.decode_packet(&buf[..len], &net) {
                    Ok(notifications) => notifications,
                    Err(e) => {
                        warn!(peer = %peer, len, error = %e, "Dropping malformed packet");
                        continue;
                    }
                };

                for notification in notifications {
                    if tx.send(notification).await.is_err() {
                        debug!("Inbound channel closed, stopping UDP receiver");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubot_id::PoolId;
    use ubot_notification::NotificationBody;

    fn descriptor(number: u32, udp_addr: SocketAddr) -> NodeDescriptor {
        NodeDescriptor {
            number: NodeNumber::new(number),
            public_key: format!("key-{number}"),
            udp_addr,
            http_url: format!("http://127.0.0.1:{}", 8000 + number),
        }
    }

    #[tokio::test]
    async fn test_udp_delivery_between_two_nodes() {
        let placeholder: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (_shutdown_tx, shutdown) = watch::channel(false);

        // Bind the receiver first so its port goes into the network config.
        let receiver_net = Arc::new(
            NetConfig::new(vec![descriptor(1, placeholder), descriptor(2, placeholder)]).unwrap(),
        );
        let (receiver, mut inbound, _task) = UdpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            NodeNumber::new(2),
            receiver_net,
            16,
            shutdown.clone(),
        )
        .await
        .unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let net = Arc::new(
            NetConfig::new(vec![descriptor(1, placeholder), descriptor(2, receiver_addr)]).unwrap(),
        );
        let (sender, _sender_inbound, _sender_task) = UdpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            NodeNumber::new(1),
            net.clone(),
            16,
            shutdown,
        )
        .await
        .unwrap();

        let from = net.get(NodeNumber::new(1)).unwrap().clone();
        let notification =
            Notification::request(from, PoolId::of(b"pool"), NotificationBody::StartingContract);
        sender
            .deliver(net.get(NodeNumber::new(2)).unwrap(), notification.clone())
            .await;

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.pool_id, notification.pool_id);
        assert_eq!(received.from.number, NodeNumber::new(1));
        assert_eq!(received.body, NotificationBody::StartingContract);
    }

    #[tokio::test]
    async fn test_malformed_packets_are_dropped() {
        let placeholder: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let net = Arc::new(NetConfig::new(vec![descriptor(1, placeholder)]).unwrap());
        let (receiver, mut inbound, _task) = UdpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            NodeNumber::new(1),
            net,
            16,
            shutdown,
        )
        .await
        .unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&[0xff, 0, 0], receiver.local_addr().unwrap())
            .await
            .unwrap();

        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(200), inbound.recv()).await;
        assert!(nothing.is_err());
    }
}
