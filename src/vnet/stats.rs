//! Per-node traffic counters

use crate::codec::ipx::Packet;
use crate::vnet::{NetError, Network, Node, NodeStats, Property};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

pub struct StatsNetwork {
    inner: Arc<dyn Network>,
}

impl StatsNetwork {
    pub fn new(inner: Arc<dyn Network>) -> Self {
        StatsNetwork { inner }
    }
}

impl Network for StatsNetwork {
    fn new_node(&self) -> Box<dyn Node> {
        Box::new(StatsNode {
            inner: self.inner.new_node(),
            counters: Counters::default(),
        })
    }
}

#[derive(Default)]
struct Counters {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> NodeStats {
        NodeStats {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
        }
    }
}

pub struct StatsNode {
    inner: Box<dyn Node>,
    counters: Counters,
}

#[async_trait]
impl Node for StatsNode {
    async fn read_packet(&self, cancel: &CancellationToken) -> Result<Arc<Packet>, NetError> {
        let packet = self.inner.read_packet(cancel).await?;
        self.counters.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.counters
            .rx_bytes
            .fetch_add(packet.len() as u64, Ordering::Relaxed);
        Ok(packet)
    }

    async fn write_packet(&self, packet: Arc<Packet>) -> Result<(), NetError> {
        let len = packet.len() as u64;
        let result = self.inner.write_packet(packet).await;
        // Partial delivery still put the packet on the wire.
        if result.is_ok() || matches!(result, Err(NetError::PartialDelivery { .. })) {
            self.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
            self.counters.tx_bytes.fetch_add(len, Ordering::Relaxed);
        }
        result
    }

    fn close(&self) {
        self.inner.close();
    }

    fn properties(&self) -> Vec<Property> {
        let mut properties = vec![Property::Statistics(self.counters.snapshot())];
        properties.extend(self.inner.properties());
        properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ipx::{Address, Header, HeaderAddr, Packet};
    use crate::vnet::node_stats;
    use crate::vnet::switch::Switch;

    fn broadcast(payload: usize) -> Arc<Packet> {
        Arc::new(Packet::new(
            Header {
                dest: HeaderAddr {
                    addr: Address::BROADCAST,
                    ..Default::default()
                },
                src: HeaderAddr {
                    addr: Address([0x02, 1, 1, 1, 1, 1]),
                    ..Default::default()
                },
                ..Default::default()
            },
            vec![0; payload],
        ))
    }

    #[tokio::test]
    async fn test_counts_both_directions() {
        let network = StatsNetwork::new(Switch::new());
        let a = network.new_node();
        let b = network.new_node();
        let cancel = CancellationToken::new();

        a.write_packet(broadcast(10)).await.unwrap();
        a.write_packet(broadcast(20)).await.unwrap();
        let _ = b.read_packet(&cancel).await.unwrap();
        let _ = b.read_packet(&cancel).await.unwrap();

        let stats_a = node_stats(a.as_ref()).unwrap();
        assert_eq!(stats_a.tx_packets, 2);
        assert_eq!(stats_a.tx_bytes, 30 + 60);
        assert_eq!(stats_a.rx_packets, 0);

        let stats_b = node_stats(b.as_ref()).unwrap();
        assert_eq!(stats_b.rx_packets, 2);
        assert_eq!(stats_b.rx_bytes, 30 + 60);
        assert_eq!(stats_b.tx_packets, 0);
    }
}
