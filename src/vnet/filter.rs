//! NetBIOS traffic filter decorator
//!
//! Windows machines will happily carry SMB traffic over IPX. A relay
//! reachable from the open internet must not bridge that between
//! strangers, so packets on the NetBIOS/SMB well-known sockets are
//! denied in both directions.

use crate::codec::ipx::{Header, Packet};
use crate::vnet::{NetError, Network, Node, Property};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// NetBIOS/SMB well-known IPX sockets
pub const NETBIOS_SOCKETS: [u16; 9] = [
    0x0451, 0x0452, 0x0453, 0x0455, 0x0551, 0x0552, 0x0553, 0x900F, 0x9010,
];

/// True when the packet touches a denied socket on either end
pub fn is_denied(header: &Header) -> bool {
    NETBIOS_SOCKETS.contains(&header.src.socket) || NETBIOS_SOCKETS.contains(&header.dest.socket)
}

fn denied_socket(header: &Header) -> u16 {
    if NETBIOS_SOCKETS.contains(&header.dest.socket) {
        header.dest.socket
    } else {
        header.src.socket
    }
}

pub struct FilterNetwork {
    inner: Arc<dyn Network>,
}

impl FilterNetwork {
    pub fn new(inner: Arc<dyn Network>) -> Self {
        FilterNetwork { inner }
    }
}

impl Network for FilterNetwork {
    fn new_node(&self) -> Box<dyn Node> {
        Box::new(FilterNode {
            inner: self.inner.new_node(),
        })
    }
}

pub struct FilterNode {
    inner: Box<dyn Node>,
}

#[async_trait]
impl Node for FilterNode {
    /// Denied packets are silently skipped on the read path
    async fn read_packet(&self, cancel: &CancellationToken) -> Result<Arc<Packet>, NetError> {
        loop {
            let packet = self.inner.read_packet(cancel).await?;
            if !is_denied(&packet.header) {
                return Ok(packet);
            }
        }
    }

    /// Denied packets fail with `Filtered`; the inner layer never sees them
    async fn write_packet(&self, packet: Arc<Packet>) -> Result<(), NetError> {
        if is_denied(&packet.header) {
            return Err(NetError::Filtered(denied_socket(&packet.header)));
        }
        self.inner.write_packet(packet).await
    }

    fn close(&self) {
        self.inner.close();
    }

    fn properties(&self) -> Vec<Property> {
        self.inner.properties()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ipx::{Address, Header, HeaderAddr};
    use crate::vnet::switch::Switch;

    fn packet(src_socket: u16, dest_socket: u16) -> Arc<Packet> {
        Arc::new(Packet::new(
            Header {
                dest: HeaderAddr {
                    addr: Address::BROADCAST,
                    socket: dest_socket,
                    ..Default::default()
                },
                src: HeaderAddr {
                    addr: Address([0x02, 1, 2, 3, 4, 5]),
                    socket: src_socket,
                    ..Default::default()
                },
                ..Default::default()
            },
            Vec::new(),
        ))
    }

    #[tokio::test]
    async fn test_write_denied_every_netbios_socket() {
        let network = FilterNetwork::new(Switch::new());
        let a = network.new_node();
        let b = network.new_node();

        for socket in NETBIOS_SOCKETS {
            assert_eq!(
                a.write_packet(packet(0x4002, socket)).await,
                Err(NetError::Filtered(socket))
            );
            assert_eq!(
                a.write_packet(packet(socket, 0x4002)).await,
                Err(NetError::Filtered(socket))
            );
        }

        // The inner switch observed zero packets.
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert_eq!(b.read_packet(&cancelled).await, Err(NetError::Cancelled));
    }

    #[tokio::test]
    async fn test_clean_traffic_passes() {
        let network = FilterNetwork::new(Switch::new());
        let a = network.new_node();
        let b = network.new_node();
        let cancel = CancellationToken::new();

        a.write_packet(packet(0x4002, 0x4002)).await.unwrap();
        assert!(b.read_packet(&cancel).await.is_ok());
    }
}
