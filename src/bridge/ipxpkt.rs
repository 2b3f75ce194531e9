//! IPXPKT router
//!
//! The ipxpkt.com packet driver tunnels Ethernet frames inside IPX
//! packets on socket 0x6181. Frames larger than one fragment are split;
//! the receive side reassembles them keyed by (source endpoint, packet
//! id). The router exposes a frame source/sink that an Ethernet
//! transport can be coupled to.
//!
//! # Payload layout
//! ```text
//! +-----------------+----------+-------+--------------+----------+
//! | 32 trail bytes  | fragment | count | packet id LE | fragment |
//! |   (reserved)    |  1 byte  | 1 byte|   2 bytes    |  bytes   |
//! +-----------------+----------+-------+--------------+----------+
//! ```

use crate::codec::ipx::{Address, HEADER_LENGTH, Header, HeaderAddr, Packet};
use crate::vnet::{NetError, Node, node_address};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// IPX socket the packet driver protocol runs on
pub const IPXPKT_SOCKET: u16 = 0x6181;

/// Reserved bytes preceding the fragmentation header
const TRAIL_LENGTH: usize = 32;

/// Fragment index, fragment count, 16-bit packet id
const FRAG_HEADER_LENGTH: usize = 4;

/// Smallest payload that can carry the trail and a fragment header
const MIN_PAYLOAD: usize = TRAIL_LENGTH + FRAG_HEADER_LENGTH;

/// Maximum fragment payload per IPX packet
pub const MAX_FRAGMENT: usize = 400;

/// Reassembly table limits
const MAX_IN_FLIGHT: usize = 16;
const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Maps an Ethernet destination MAC to the IPX node to send to
///
/// The routing decision is replaceable so an ARP-like learned table can
/// slot in behind the same interface.
pub trait NodeResolver: Send + Sync {
    fn resolve(&self, mac: [u8; 6]) -> Address;
}

/// Treats the hardware address and the IPX node address as equal.
///
/// TODO: learn MAC-to-node mappings from received frames instead of
/// assuming the two address spaces coincide.
pub struct MirrorResolver;

impl NodeResolver for MirrorResolver {
    fn resolve(&self, mac: [u8; 6]) -> Address {
        Address(mac)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FragmentHeader {
    fragment: u8,
    count: u8,
    packet_id: u16,
}

impl FragmentHeader {
    fn decode(buf: &[u8]) -> Self {
        FragmentHeader {
            fragment: buf[0],
            count: buf[1],
            packet_id: u16::from_le_bytes([buf[2], buf[3]]),
        }
    }

    fn encode(&self) -> [u8; FRAG_HEADER_LENGTH] {
        let id = self.packet_id.to_le_bytes();
        [self.fragment, self.count, id[0], id[1]]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReassemblyKey {
    src: HeaderAddr,
    packet_id: u16,
}

struct ReassemblyEntry {
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
    last_rx: Instant,
}

pub struct IpxpktRouter {
    node: Box<dyn Node>,
    resolver: Box<dyn NodeResolver>,
    next_packet_id: AtomicU16,
    reassembly: Mutex<HashMap<ReassemblyKey, ReassemblyEntry>>,
}

impl IpxpktRouter {
    pub fn new(node: Box<dyn Node>, resolver: Box<dyn NodeResolver>) -> Self {
        IpxpktRouter {
            node,
            resolver,
            next_packet_id: AtomicU16::new(0),
            reassembly: Mutex::new(HashMap::new()),
        }
    }

    /// Fragments one Ethernet frame onto the IPX network
    ///
    /// The destination node is chosen from the frame's destination MAC
    /// through the resolver. A fragment the network refuses aborts the
    /// remaining fragments silently; the peer's reassembly entry times
    /// out.
    pub async fn send_frame(&self, frame: &[u8]) -> crate::Result<()> {
        if frame.len() < 12 {
            return Err("ethernet frame too short".into());
        }
        let mut dest_mac = [0u8; 6];
        dest_mac.copy_from_slice(&frame[0..6]);
        let dest = self.resolver.resolve(dest_mac);
        let src = node_address(self.node.as_ref()).ok_or("network assigned no address")?;

        let packet_id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        let count = frame.len().div_ceil(MAX_FRAGMENT) as u8;

        for (index, chunk) in frame.chunks(MAX_FRAGMENT).enumerate() {
            let header = FragmentHeader {
                fragment: index as u8 + 1,
                count,
                packet_id,
            };
            let mut payload = vec![0u8; TRAIL_LENGTH];
            payload.extend_from_slice(&header.encode());
            payload.extend_from_slice(chunk);

            let packet = Packet::new(
                Header {
                    checksum: 0xFFFF,
                    length: (HEADER_LENGTH + payload.len()) as u16,
                    transport_control: 0,
                    packet_type: 0,
                    dest: HeaderAddr {
                        network: [0, 0, 0, 0],
                        addr: dest,
                        socket: IPXPKT_SOCKET,
                    },
                    src: HeaderAddr {
                        network: [0, 0, 0, 0],
                        addr: src,
                        socket: IPXPKT_SOCKET,
                    },
                },
                payload,
            );
            if let Err(e) = self.node.write_packet(Arc::new(packet)).await {
                tracing::trace!("aborting frame {}: {}", packet_id, e);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Returns the next fully reassembled Ethernet frame
    pub async fn recv_frame(&self, cancel: &CancellationToken) -> Result<Vec<u8>, NetError> {
        loop {
            let packet = self.node.read_packet(cancel).await?;
            if let Some(frame) = self.accept(&packet) {
                return Ok(frame);
            }
        }
    }

    /// Feeds one IPX packet to the reassembler
    fn accept(&self, packet: &Packet) -> Option<Vec<u8>> {
        if packet.header.dest.socket != IPXPKT_SOCKET {
            return None;
        }
        if packet.payload.len() < MIN_PAYLOAD {
            return None;
        }
        let header =
            FragmentHeader::decode(&packet.payload[TRAIL_LENGTH..TRAIL_LENGTH + FRAG_HEADER_LENGTH]);
        if header.count == 0 || header.fragment == 0 || header.fragment > header.count {
            return None;
        }
        let data = packet.payload[MIN_PAYLOAD..].to_vec();
        let key = ReassemblyKey {
            src: packet.header.src,
            packet_id: header.packet_id,
        };

        let now = Instant::now();
        let mut table = self.reassembly.lock().unwrap_or_else(|e| e.into_inner());

        if !table.contains_key(&key) {
            Self::make_room(&mut table, now);
        }
        let entry = table.entry(key.clone()).or_insert_with(|| ReassemblyEntry {
            fragments: vec![None; header.count as usize],
            received: 0,
            last_rx: now,
        });
        if entry.fragments.len() != header.count as usize {
            // The sender changed its mind about the count; start over.
            *entry = ReassemblyEntry {
                fragments: vec![None; header.count as usize],
                received: 0,
                last_rx: now,
            };
        }

        let index = header.fragment as usize - 1;
        if entry.fragments[index].is_none() {
            entry.received += 1;
        }
        entry.fragments[index] = Some(data);
        entry.last_rx = now;

        if entry.received == header.count as usize {
            let entry = table.remove(&key)?;
            let mut frame = Vec::new();
            for fragment in entry.fragments {
                frame.extend_from_slice(&fragment?);
            }
            return Some(frame);
        }
        None
    }

    /// Purges stale entries; if the table is still full, evicts the
    /// least-recently-touched frame
    fn make_room(table: &mut HashMap<ReassemblyKey, ReassemblyEntry>, now: Instant) {
        table.retain(|_, entry| now.duration_since(entry.last_rx) <= REASSEMBLY_TIMEOUT);
        if table.len() >= MAX_IN_FLIGHT {
            if let Some(oldest) = table
                .iter()
                .min_by_key(|(_, entry)| entry.last_rx)
                .map(|(key, _)| key.clone())
            {
                table.remove(&oldest);
            }
        }
    }
}
