//! Live device tunnels and the process-local registry that tracks them.
//!
//! The QUIC/TUN bridge that actually carries IP packets into the device
//! lives in a separate library; this module holds its interface types
//! ([`PacketSource`], [`TunnelConnection`]), the registry of active tunnels
//! and the small HTTP API sibling processes use to discover them.

pub mod api;
pub mod registry;
pub mod strongbox;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

/// Transport protocol of a decoded tunnel packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketProtocol {
    Tcp,
    Udp,
}

/// One IP packet decoded from the tunnel.
#[derive(Debug, Clone)]
pub struct TunnelPacket {
    pub protocol: PacketProtocol,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
    pub payload: Vec<u8>,
}

/// Identifier returned by [`PacketSource::add_consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

/// Multi-producer feed of packets decoded from the tunnel.
///
/// Each consumer gets its own channel; adding and removing consumers is
/// thread-safe and idempotent. Cloning shares the consumer table.
#[derive(Debug, Clone, Default)]
pub struct PacketSource {
    consumers: Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<TunnelPacket>>>>,
    next_id: Arc<AtomicU64>,
}

impl PacketSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a consumer and returns its id and packet channel.
    pub fn add_consumer(&self) -> (ConsumerId, mpsc::UnboundedReceiver<TunnelPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.consumers
            .lock()
            .expect("packet consumer table poisoned")
            .insert(id, tx);
        (ConsumerId(id), rx)
    }

    /// Removes a consumer. Removing one twice is a no-op.
    pub fn remove_consumer(&self, id: ConsumerId) {
        self.consumers
            .lock()
            .expect("packet consumer table poisoned")
            .remove(&id.0);
    }

    /// Fans a packet out to every live consumer.
    pub fn deliver(&self, packet: TunnelPacket) {
        let mut dead = Vec::new();
        {
            let consumers = self
                .consumers
                .lock()
                .expect("packet consumer table poisoned");
            for (id, tx) in consumers.iter() {
                if tx.send(packet.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut consumers = self
                .consumers
                .lock()
                .expect("packet consumer table poisoned");
            for id in dead {
                trace!("dropping dead packet consumer {id}");
                consumers.remove(&id);
            }
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers
            .lock()
            .expect("packet consumer table poisoned")
            .len()
    }
}

/// A live carrier into one device.
///
/// The address is unique per live tunnel. Closing is idempotent; a closed
/// tunnel must be treated as unusable.
pub struct TunnelConnection {
    pub address: Ipv6Addr,
    pub rsd_port: u16,
    packet_source: PacketSource,
    closed: AtomicBool,
    closer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("address", &self.address)
            .field("rsd_port", &self.rsd_port)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl TunnelConnection {
    pub fn new(
        address: Ipv6Addr,
        rsd_port: u16,
        packet_source: PacketSource,
        closer: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            address,
            rsd_port,
            packet_source,
            closed: AtomicBool::new(false),
            closer: Mutex::new(closer),
        }
    }

    /// The packet feed for this tunnel.
    pub fn packet_source(&self) -> &PacketSource {
        &self.packet_source
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tears the tunnel down. Subsequent calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(closer) = self
            .closer
            .lock()
            .expect("tunnel closer poisoned")
            .take()
        {
            closer();
        }
    }
}

impl Drop for TunnelConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    fn packet(port: u16) -> TunnelPacket {
        TunnelPacket {
            protocol: PacketProtocol::Tcp,
            src: IpAddr::V4(Ipv4Addr::LOCALHOST),
            dst: IpAddr::V4(Ipv4Addr::LOCALHOST),
            source_port: port,
            dest_port: 62078,
            payload: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn consumers_receive_delivered_packets() {
        let source = PacketSource::new();
        let (id_a, mut rx_a) = source.add_consumer();
        let (_id_b, mut rx_b) = source.add_consumer();

        source.deliver(packet(1000));
        assert_eq!(rx_a.recv().await.unwrap().source_port, 1000);
        assert_eq!(rx_b.recv().await.unwrap().source_port, 1000);

        source.remove_consumer(id_a);
        source.remove_consumer(id_a); // idempotent
        assert_eq!(source.consumer_count(), 1);

        source.deliver(packet(2000));
        assert_eq!(rx_b.recv().await.unwrap().source_port, 2000);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn dropped_receivers_are_pruned_on_delivery() {
        let source = PacketSource::new();
        let (_id, rx) = source.add_consumer();
        drop(rx);
        source.deliver(packet(1));
        assert_eq!(source.consumer_count(), 0);
    }

    #[test]
    fn tunnel_close_is_idempotent() {
        static CLOSES: AtomicUsize = AtomicUsize::new(0);
        let tunnel = TunnelConnection::new(
            "fd00::1".parse().unwrap(),
            58783,
            PacketSource::new(),
            Some(Box::new(|| {
                CLOSES.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert!(!tunnel.is_closed());
        tunnel.close();
        tunnel.close();
        drop(tunnel);
        assert_eq!(CLOSES.load(Ordering::SeqCst), 1);
    }
}
