//! PPP over enhanced GRE (version 1)
//!
//! One raw IP-protocol-47 socket carries every PPTP data session. The
//! transport demultiplexes incoming packets by (source IP, low 16 bits
//! of the key field), which PPTP redefines as the Call-ID. Out-of-order
//! and duplicate sequence numbers are discarded rather than reordered:
//! PPP does not tolerate reordering, and the payloads above it carry
//! their own reliability where they need it.
//!
//! # GRE header as used here
//! ```text
//! +-------+-------+----------+---------------+---------+
//! | flags | ver 1 |  0x880B  |  len | CallID | seq ack |
//! | K S   |   A   |  2 bytes |  2b  |   2b   | 4b  4b  |
//! +-------+-------+----------+---------------+---------+
//! ```
//! Seq is present when the payload is non-empty, Ack when a received
//! sequence number has not been acknowledged yet.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// PPP carried in GRE
pub const GRE_PROTOCOL_PPP: u16 = 0x880B;

/// Per-session receive queue depth; overflow drops
const RX_QUEUE: usize = 4;

/// Receive buffer for the raw socket (full IP packets)
const BUFFER_SIZE: usize = 2048;

/// One GRE packet, decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrePacket {
    pub call_id: u16,
    pub seq: Option<u32>,
    pub ack: Option<u32>,
    pub payload: Vec<u8>,
}

/// Encodes an enhanced-GRE packet
pub fn encode_gre(call_id: u16, seq: Option<u32>, ack: Option<u32>, payload: &[u8]) -> Vec<u8> {
    let mut flags0 = 0x20u8; // key present
    if seq.is_some() {
        flags0 |= 0x10;
    }
    let mut flags1 = 0x01u8; // version 1
    if ack.is_some() {
        flags1 |= 0x80;
    }

    let mut buf = Vec::with_capacity(16 + payload.len());
    buf.push(flags0);
    buf.push(flags1);
    buf.extend_from_slice(&GRE_PROTOCOL_PPP.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(&call_id.to_be_bytes());
    if let Some(seq) = seq {
        buf.extend_from_slice(&seq.to_be_bytes());
    }
    if let Some(ack) = ack {
        buf.extend_from_slice(&ack.to_be_bytes());
    }
    buf.extend_from_slice(payload);
    buf
}

/// Decodes an enhanced-GRE packet; None for anything that is not
/// well-formed GRE-v1 PPP
pub fn decode_gre(buf: &[u8]) -> Option<GrePacket> {
    if buf.len() < 8 {
        return None;
    }
    let flags0 = buf[0];
    let flags1 = buf[1];
    let protocol = u16::from_be_bytes([buf[2], buf[3]]);

    // Key present, no checksum/routing, version 1, PPP.
    if flags0 & 0x20 == 0 || flags0 & 0xC0 != 0 || flags1 & 0x07 != 1 {
        return None;
    }
    if protocol != GRE_PROTOCOL_PPP {
        return None;
    }

    let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let call_id = u16::from_be_bytes([buf[6], buf[7]]);
    let mut offset = 8;

    let seq = if flags0 & 0x10 != 0 {
        let bytes = buf.get(offset..offset + 4)?;
        offset += 4;
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    } else {
        None
    };
    let ack = if flags1 & 0x80 != 0 {
        let bytes = buf.get(offset..offset + 4)?;
        offset += 4;
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    } else {
        None
    };

    let payload = buf.get(offset..offset + payload_len)?;
    Some(GrePacket {
        call_id,
        seq,
        ack,
        payload: payload.to_vec(),
    })
}

struct GreShared {
    rx_tx: mpsc::Sender<Vec<u8>>,
    state: Mutex<GreState>,
}

#[derive(Default)]
struct GreState {
    tx_seq: u32,
    rx_seq: Option<u32>,
    acked_rx: Option<u32>,
}

impl GreShared {
    /// Sequence-number admission: accepts unsequenced packets and
    /// forward progress, discards duplicates and reordered arrivals
    fn accept_seq(&self, seq: Option<u32>) -> bool {
        let Some(seq) = seq else {
            return true;
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.rx_seq {
            Some(rx) if seq <= rx => false,
            _ => {
                state.rx_seq = Some(seq);
                true
            }
        }
    }
}

type SessionMap = Mutex<HashMap<(IpAddr, u16), Arc<GreShared>>>;

/// The shared raw-socket transport and its session table
pub struct GreTransport {
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionMap>,
}

impl GreTransport {
    /// Opens the raw IP-protocol-47 socket; requires CAP_NET_RAW
    pub fn open() -> crate::Result<Arc<GreTransport>> {
        let raw = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::RAW,
            Some(socket2::Protocol::from(47)),
        )?;
        raw.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std::net::UdpSocket::from(raw))?;
        Ok(Arc::new(GreTransport {
            socket: Arc::new(socket),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    /// Spawns the demultiplexer loop
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let transport = self.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.demux_loop(cancel).await {
                tracing::error!("gre demux stopped: {}", e);
            }
        });
    }

    async fn demux_loop(&self, cancel: CancellationToken) -> crate::Result<()> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let (len, from) = tokio::select! {
                result = self.socket.recv_from(&mut buf) => result?,
                _ = cancel.cancelled() => return Ok(()),
            };
            self.dispatch(&buf[..len], from.ip());
        }
    }

    fn dispatch(&self, packet: &[u8], from: IpAddr) {
        // A raw IPv4 socket delivers the full IP packet.
        if packet.is_empty() || packet[0] >> 4 != 4 {
            return;
        }
        let ihl = ((packet[0] & 0x0F) as usize) * 4;
        if ihl < 20 || packet.len() < ihl {
            return;
        }
        let Some(gre) = decode_gre(&packet[ihl..]) else {
            return;
        };

        let shared = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.get(&(from, gre.call_id)).cloned()
        };
        let Some(shared) = shared else {
            tracing::trace!("gre packet from {} for unknown call {}", from, gre.call_id);
            return;
        };

        if !shared.accept_seq(gre.seq) {
            tracing::trace!("discarding out-of-order gre seq {:?} from {}", gre.seq, from);
            return;
        }
        if !gre.payload.is_empty() && shared.rx_tx.try_send(gre.payload).is_err() {
            tracing::trace!("gre rx queue full for call {}", gre.call_id);
        }
    }

    /// Registers a session keyed by (peer, our receive Call-ID)
    pub fn session(&self, peer: Ipv4Addr, send_call_id: u16, recv_call_id: u16) -> GreSession {
        let (rx_tx, rx) = mpsc::channel(RX_QUEUE);
        let shared = Arc::new(GreShared {
            rx_tx,
            state: Mutex::new(GreState::default()),
        });
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((IpAddr::V4(peer), recv_call_id), shared.clone());

        GreSession {
            socket: self.socket.clone(),
            sessions: Arc::downgrade(&self.sessions),
            peer,
            send_call_id,
            recv_call_id,
            shared,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

/// One PPP-over-GRE flow with PPTP-modified Call-IDs in the key field
pub struct GreSession {
    socket: Arc<UdpSocket>,
    sessions: Weak<SessionMap>,
    peer: Ipv4Addr,
    send_call_id: u16,
    recv_call_id: u16,
    shared: Arc<GreShared>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl GreSession {
    pub fn peer(&self) -> Ipv4Addr {
        self.peer
    }

    /// Sends one PPP frame; sequence and ack numbers are attached per
    /// the enhanced-GRE rules
    pub async fn send(&self, payload: &[u8]) -> crate::Result<()> {
        let (seq, ack) = {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let seq = if payload.is_empty() {
                None
            } else {
                let seq = state.tx_seq;
                state.tx_seq = state.tx_seq.wrapping_add(1);
                Some(seq)
            };
            let ack = if state.rx_seq != state.acked_rx {
                state.acked_rx = state.rx_seq;
                state.rx_seq
            } else {
                None
            };
            (seq, ack)
        };

        let packet = encode_gre(self.send_call_id, seq, ack, payload);
        // The port is meaningless on a raw socket.
        self.socket
            .send_to(&packet, SocketAddr::new(IpAddr::V4(self.peer), 0))
            .await?;
        Ok(())
    }

    /// Receives the next PPP frame for this session
    pub async fn recv(&self, cancel: &CancellationToken) -> crate::Result<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => frame.ok_or_else(|| "gre session closed".into()),
            _ = cancel.cancelled() => Err("cancelled".into()),
        }
    }

    /// Deregisters from the demultiplexer; idempotent
    pub fn close(&self) {
        if let Some(sessions) = self.sessions.upgrade() {
            sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&(IpAddr::V4(self.peer), self.recv_call_id));
        }
    }
}

impl Drop for GreSession {
    fn drop(&mut self) {
        self.close();
    }
}
