//! Quake UDP proxy
//!
//! Makes a remote Quake UDP server appear as a local IPX peer. Quake's
//! IPX transport uses socket 26000 for connection setup and 26001 for
//! the connected phase; each payload starts with 4 reserved zero bytes
//! before the Quake datagram. Per IPX peer, the proxy opens an
//! ephemeral UDP socket towards the real server, rewrites the port
//! carried in CCREP_ACCEPT into the IPX connected socket, punches a
//! hole for the per-connection port and re-fragments the reliable
//! stream down to the vanilla client MTU.

pub mod sharder;

use crate::codec::ipx::{Address, HEADER_LENGTH, Header, HeaderAddr, Packet};
use crate::qproxy::sharder::{
    NETFLAG_ACK, NETFLAG_CTL, NETFLAG_DATA, NETFLAG_EOM, ReliableSharder, SharderOutput,
    decode_packet, encode_packet,
};
use crate::vnet::{NetError, Node, node_address};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// IPX socket for Quake connection setup
pub const CONTROL_SOCKET: u16 = 26000;

/// IPX socket for the connected phase
pub const CONNECTED_SOCKET: u16 = 26001;

/// Reserved bytes preceding each Quake datagram on IPX
const PAD_LENGTH: usize = 4;

/// Idle-connection sweep cadence
const GC_INTERVAL: Duration = Duration::from_secs(10);

const CCREP_ACCEPT: u8 = 0x81;

const BUFFER_SIZE: usize = 4096;

pub struct QuakeProxy {
    node: Arc<dyn Node>,
    address: Address,
    server_name: String,
    idle_timeout: Duration,
    conns: Arc<Mutex<HashMap<HeaderAddr, Arc<QConn>>>>,
    resolved: Mutex<Option<SocketAddr>>,
}

struct QConn {
    peer: HeaderAddr,
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    last_rx: Mutex<Instant>,
    connected_port: Mutex<Option<u16>>,
    sharder: Mutex<ReliableSharder>,
    cancel: CancellationToken,
}

impl QConn {
    /// IPX source socket for packets of the reliable/connected flow
    fn connected_ipx_socket(&self) -> u16 {
        match *self
            .connected_port
            .lock()
            .unwrap_or_else(|e| e.into_inner())
        {
            // Same port for both phases: both IPX sockets collapse.
            Some(port) if port == self.server.port() => CONTROL_SOCKET,
            _ => CONNECTED_SOCKET,
        }
    }

    /// UDP target of the connected flow; the main port until the server
    /// has named a per-connection port
    fn connected_target(&self) -> SocketAddr {
        let port = self
            .connected_port
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(self.server.port());
        SocketAddr::new(self.server.ip(), port)
    }
}

impl QuakeProxy {
    pub fn new(
        node: Box<dyn Node>,
        server_name: String,
        idle_timeout: Duration,
    ) -> crate::Result<Self> {
        let node: Arc<dyn Node> = Arc::from(node);
        let address = node_address(node.as_ref()).ok_or("network assigned no address")?;
        Ok(QuakeProxy {
            node,
            address,
            server_name,
            idle_timeout,
            conns: Arc::new(Mutex::new(HashMap::new())),
            resolved: Mutex::new(None),
        })
    }

    pub async fn run(&self, cancel: CancellationToken) -> crate::Result<()> {
        tracing::info!(
            "quake proxy for {} on ipx address {}",
            self.server_name,
            self.address
        );
        let mut gc = tokio::time::interval(GC_INTERVAL);

        loop {
            tokio::select! {
                packet = self.node.read_packet(&cancel) => {
                    match packet {
                        Ok(packet) => self.handle_ipx(packet, &cancel).await,
                        Err(NetError::Cancelled) | Err(NetError::Closed) => break,
                        Err(e) => {
                            tracing::debug!("quake proxy read: {}", e);
                        }
                    }
                }

                _ = gc.tick() => {
                    self.collect_idle();
                }
            }
        }

        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        for (_, conn) in conns.drain() {
            conn.cancel.cancel();
        }
        Ok(())
    }

    async fn handle_ipx(&self, packet: Arc<Packet>, cancel: &CancellationToken) {
        let dest_socket = packet.header.dest.socket;
        if dest_socket != CONTROL_SOCKET && dest_socket != CONNECTED_SOCKET {
            return;
        }
        if packet.payload.len() < PAD_LENGTH {
            return;
        }
        let data = &packet.payload[PAD_LENGTH..];
        let peer = packet.header.src;

        let existing = self
            .conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer)
            .cloned();
        let conn = match existing {
            Some(conn) => conn,
            None => {
                // Only the control socket starts a connection.
                if dest_socket != CONTROL_SOCKET {
                    return;
                }
                match self.open_conn(peer, cancel).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::debug!("quake connection for {} failed: {}", peer, e);
                        return;
                    }
                }
            }
        };

        // Client acks belong to our re-fragmented stream, not the server.
        if let Some((flags, Some((sequence, _)))) = decode_packet(data)
            && flags & NETFLAG_ACK != 0
        {
            let outputs = {
                let mut sharder = conn.sharder.lock().unwrap_or_else(|e| e.into_inner());
                sharder.downstream_ack(sequence)
            };
            dispatch_outputs(&self.node, self.address, &conn, outputs).await;
            return;
        }

        let target = match dest_socket {
            CONNECTED_SOCKET => conn.connected_target(),
            _ => conn.server,
        };
        if let Err(e) = conn.socket.send_to(data, target).await {
            tracing::debug!("quake send for {} failed: {}", peer, e);
        }
    }

    async fn open_conn(
        &self,
        peer: HeaderAddr,
        cancel: &CancellationToken,
    ) -> crate::Result<Arc<QConn>> {
        let server = self.resolve().await?;
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        tracing::info!(
            "new quake connection from {} via {}",
            peer,
            socket.local_addr()?
        );

        let conn = Arc::new(QConn {
            peer,
            socket,
            server,
            last_rx: Mutex::new(Instant::now()),
            connected_port: Mutex::new(None),
            sharder: Mutex::new(ReliableSharder::new()),
            cancel: cancel.child_token(),
        });
        self.conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer, conn.clone());

        tokio::spawn(udp_rx_loop(self.node.clone(), self.address, conn.clone()));
        Ok(conn)
    }

    /// Resolves the configured server name
    ///
    /// While connections are active the cached address is reused, so an
    /// in-progress game is never stalled by DNS.
    async fn resolve(&self) -> crate::Result<SocketAddr> {
        let cached = *self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        let active = !self
            .conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty();
        if let Some(addr) = cached
            && active
        {
            return Ok(addr);
        }

        let addr = tokio::net::lookup_host(&self.server_name)
            .await?
            .next()
            .ok_or("quake server name resolved to nothing")?;
        *self.resolved.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
        Ok(addr)
    }

    fn collect_idle(&self) {
        let timeout = self.idle_timeout;
        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        conns.retain(|peer, conn| {
            let idle = conn
                .last_rx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .elapsed();
            if idle > timeout {
                tracing::info!("quake connection {} idle for {:?}, dropping", peer, idle);
                conn.cancel.cancel();
                false
            } else {
                true
            }
        });
    }
}

/// Forwards traffic arriving from the UDP side to the IPX client
async fn udp_rx_loop(node: Arc<dyn Node>, address: Address, conn: Arc<QConn>) {
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let (len, from) = tokio::select! {
            result = conn.socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!("quake udp recv for {} failed: {}", conn.peer, e);
                    return;
                }
            },
            _ = conn.cancel.cancelled() => return,
        };

        *conn.last_rx.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        if from.ip() != conn.server.ip() {
            continue;
        }
        handle_udp(&node, address, &conn, from, &buf[..len]).await;
    }
}

async fn handle_udp(
    node: &Arc<dyn Node>,
    address: Address,
    conn: &Arc<QConn>,
    from: SocketAddr,
    data: &[u8],
) {
    let from_main = from.port() == conn.server.port();
    let Some((flags, rest)) = decode_packet(data) else {
        return;
    };

    if flags & NETFLAG_CTL != 0 {
        let mut datagram = data.to_vec();
        if from_main && let Some(port) = rewrite_accept(conn, &mut datagram) {
            // Zero-length hole punch so the per-connection port can
            // traverse outgoing NAT.
            let target = SocketAddr::new(conn.server.ip(), port);
            if let Err(e) = conn.socket.send_to(&[], target).await {
                tracing::debug!("quake hole punch to {} failed: {}", target, e);
            }
        }
        let src_socket = if from_main {
            CONTROL_SOCKET
        } else {
            conn.connected_ipx_socket()
        };
        write_to_client(node, address, conn, src_socket, &datagram).await;
        return;
    }

    if flags & NETFLAG_DATA != 0 {
        let Some((sequence, payload)) = rest else {
            return;
        };
        let eom = flags & NETFLAG_EOM != 0;
        let outputs = {
            let mut sharder = conn.sharder.lock().unwrap_or_else(|e| e.into_inner());
            sharder.upstream_data(sequence, eom, payload)
        };
        dispatch_outputs(node, address, conn, outputs).await;
        return;
    }

    // Acks of the client's own stream, naks and unreliable data pass
    // through untouched.
    let src_socket = if from_main {
        CONTROL_SOCKET
    } else {
        conn.connected_ipx_socket()
    };
    write_to_client(node, address, conn, src_socket, data).await;
}

/// Extracts and rewrites the port inside CCREP_ACCEPT
///
/// The server names its per-connection UDP port; the client must
/// instead talk to our IPX connected socket. When the server reuses its
/// main port both IPX sockets collapse onto 26000.
fn rewrite_accept(conn: &QConn, datagram: &mut [u8]) -> Option<u16> {
    if datagram.len() < 9 || datagram[4] != CCREP_ACCEPT {
        return None;
    }
    let port = u32::from_le_bytes([datagram[5], datagram[6], datagram[7], datagram[8]]) as u16;
    *conn
        .connected_port
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(port);

    let ipx_socket = if port == conn.server.port() {
        CONTROL_SOCKET
    } else {
        CONNECTED_SOCKET
    };
    datagram[5..9].copy_from_slice(&(ipx_socket as u32).to_le_bytes());
    tracing::debug!(
        "quake server accepted {} on port {}, rewritten to ipx socket {}",
        conn.peer,
        port,
        ipx_socket
    );
    Some(port)
}

async fn dispatch_outputs(
    node: &Arc<dyn Node>,
    address: Address,
    conn: &Arc<QConn>,
    outputs: Vec<SharderOutput>,
) {
    for output in outputs {
        match output {
            SharderOutput::Downstream(datagram) => {
                let src_socket = conn.connected_ipx_socket();
                write_to_client(node, address, conn, src_socket, &datagram).await;
            }
            SharderOutput::AckUpstream(sequence) => {
                let ack = encode_packet(NETFLAG_ACK, sequence, &[]);
                let target = conn.connected_target();
                if let Err(e) = conn.socket.send_to(&ack, target).await {
                    tracing::debug!("quake upstream ack to {} failed: {}", target, e);
                }
            }
        }
    }
}

async fn write_to_client(
    node: &Arc<dyn Node>,
    address: Address,
    conn: &QConn,
    src_socket: u16,
    datagram: &[u8],
) {
    let mut payload = vec![0u8; PAD_LENGTH];
    payload.extend_from_slice(datagram);
    let packet = Packet::new(
        Header {
            checksum: 0xFFFF,
            length: (HEADER_LENGTH + payload.len()) as u16,
            transport_control: 0,
            packet_type: 0,
            dest: conn.peer,
            src: HeaderAddr {
                network: [0, 0, 0, 0],
                addr: address,
                socket: src_socket,
            },
        },
        payload,
    );
    if let Err(e) = node.write_packet(Arc::new(packet)).await {
        tracing::trace!("quake delivery to {} skipped: {}", conn.peer, e);
    }
}
