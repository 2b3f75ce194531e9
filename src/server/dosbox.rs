//! DOSBox protocol adapter
//!
//! Runs per client between the UDP socket and a virtual-network node.
//! The first packet must be a registration request; the reply assigns
//! the node address. After that the adapter copies packets in both
//! directions, re-answers lost-reply registrations, consumes keepalive
//! echoes and pings silent clients so NAT mappings stay open.

use crate::codec::ipx::{
    Address, HEADER_LENGTH, Header, HeaderAddr, Packet, REGISTRATION_SOCKET,
};
use crate::vnet::pipe::Pipe;
use crate::vnet::{Network, Node, node_address};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Synthetic source address of server pings; clients echo back to it
pub const PING_REPLY_ADDRESS: Address = Address([0x02, 0xFF, 0xFF, 0xFF, 0x00, 0x00]);

/// Reply to a registration request, assigning `addr` to the client
///
/// The wire convention is fixed: checksum 0xFFFF, source network
/// 0.0.0.1, source address broadcast, both sockets 2.
pub fn registration_reply(addr: Address) -> Packet {
    Packet::new(
        Header {
            checksum: 0xFFFF,
            length: HEADER_LENGTH as u16,
            transport_control: 0,
            packet_type: 0,
            dest: HeaderAddr {
                network: [0, 0, 0, 0],
                addr,
                socket: REGISTRATION_SOCKET,
            },
            src: HeaderAddr {
                network: [0, 0, 0, 1],
                addr: Address::BROADCAST,
                socket: REGISTRATION_SOCKET,
            },
        },
        Vec::new(),
    )
}

/// Keepalive ping broadcast to a silent client
pub fn ping_packet() -> Packet {
    Packet::new(
        Header {
            checksum: 0xFFFF,
            length: HEADER_LENGTH as u16,
            transport_control: 0,
            packet_type: 0,
            dest: HeaderAddr {
                network: [0, 0, 0, 0],
                addr: Address::BROADCAST,
                socket: REGISTRATION_SOCKET,
            },
            src: HeaderAddr {
                network: [0, 0, 0, 0],
                addr: PING_REPLY_ADDRESS,
                socket: 0,
            },
        },
        Vec::new(),
    )
}

/// Pings the client whenever nothing has arrived for a full period
pub(crate) async fn keepalive_loop(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    last_recv: Arc<Mutex<Instant>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let ping = ping_packet().encode();
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let idle = last_recv
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .elapsed();
                if idle >= period {
                    tracing::trace!("pinging silent client {}", remote);
                    if let Err(e) = socket.send_to(&ping, remote).await {
                        tracing::debug!("ping to {} failed: {}", remote, e);
                        return;
                    }
                }
            }

            _ = cancel.cancelled() => {
                return;
            }
        }
    }
}

pub struct DosboxHandler {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    rx: Arc<Pipe>,
    last_recv: Arc<Mutex<Instant>>,
    network: Arc<dyn Network>,
    keepalive_interval: Duration,
    cancel: CancellationToken,
}

impl DosboxHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        rx: Arc<Pipe>,
        last_recv: Arc<Mutex<Instant>>,
        network: Arc<dyn Network>,
        keepalive_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        DosboxHandler {
            socket,
            remote,
            rx,
            last_recv,
            network,
            keepalive_interval,
            cancel,
        }
    }

    pub async fn run(self) -> crate::Result<()> {
        let first = self.rx.read(&self.cancel).await?;
        if !first.header.is_registration() {
            tracing::debug!("client {} sent no registration, closing", self.remote);
            return Ok(());
        }

        let node = self.network.new_node();
        let address = match node_address(node.as_ref()) {
            Some(address) => address,
            None => {
                node.close();
                return Err("network assigned no address".into());
            }
        };
        self.send(&registration_reply(address)).await?;
        tracing::info!("client {} registered as {}", self.remote, address);

        tokio::spawn(keepalive_loop(
            self.socket.clone(),
            self.remote,
            self.last_recv.clone(),
            self.keepalive_interval,
            self.cancel.clone(),
        ));

        let result = self.pump(node.as_ref(), address).await;
        self.cancel.cancel();
        node.close();
        result
    }

    async fn pump(&self, node: &dyn Node, address: Address) -> crate::Result<()> {
        loop {
            tokio::select! {
                packet = self.rx.read(&self.cancel) => {
                    let packet = packet?;
                    if packet.header.is_registration() {
                        // The handshake reply may have been lost.
                        self.send(&registration_reply(address)).await?;
                        continue;
                    }
                    if packet.header.dest.addr == PING_REPLY_ADDRESS {
                        // Keepalive echo, not a data packet.
                        continue;
                    }
                    if let Err(e) = node.write_packet(packet).await {
                        tracing::trace!("client {} write skipped: {}", self.remote, e);
                    }
                }

                packet = node.read_packet(&self.cancel) => {
                    self.send(&*packet?).await?;
                }
            }
        }
    }

    async fn send(&self, packet: &Packet) -> crate::Result<()> {
        self.socket.send_to(&packet.encode(), self.remote).await?;
        Ok(())
    }
}
