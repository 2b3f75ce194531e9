//! IPX packet codec
//!
//! This module defines the fixed 30-byte IPX header and the packet type
//! carried through the whole relay. All integers are big-endian on the
//! wire.
//!
//! # Header format (30 bytes)
//! ```text
//! +----------+----------+---------+------+--------------------+--------------------+
//! | Checksum |  Length  | TransCtl| Type |   Dest (12 bytes)  |   Src (12 bytes)   |
//! |  2 bytes |  2 bytes |  1 byte |1 byte| net 4 addr 6 sock 2| net 4 addr 6 sock 2|
//! +----------+----------+---------+------+--------------------+--------------------+
//! ```
//!
//! Encoding a valid in-memory value never fails; decoding fails when the
//! input is shorter than 30 bytes or an address field is truncated.
//! Encode followed by decode is the identity.

use crate::codec::errors::PacketError;
use std::fmt;
use std::fmt::Display;

/// Fixed IPX header length in bytes
pub const HEADER_LENGTH: usize = 30;

/// Minimum length of an encoded address field (network + node + socket)
pub const MIN_ADDRESS_FIELD: usize = 12;

/// Well-known socket used by the DOSBox registration handshake
pub const REGISTRATION_SOCKET: u16 = 2;

/// 6-byte IPX node address, MAC-shaped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// The all-zeroes address, used by clients that have no address yet
    pub const NULL: Address = Address([0x00; 6]);

    /// The all-ones broadcast address
    pub const BROADCAST: Address = Address([0xFF; 6]);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

/// Full IPX endpoint: network number, node address and socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeaderAddr {
    pub network: [u8; 4],
    pub addr: Address,
    pub socket: u16,
}

impl HeaderAddr {
    /// Decodes an endpoint from the first 12 bytes of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < MIN_ADDRESS_FIELD {
            return Err(PacketError::ShortAddress);
        }

        let mut network = [0u8; 4];
        network.copy_from_slice(&buf[0..4]);
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&buf[4..10]);
        let socket = u16::from_be_bytes([buf[10], buf[11]]);

        Ok(HeaderAddr {
            network,
            addr: Address(addr),
            socket,
        })
    }

    /// Encodes the endpoint into exactly 12 bytes
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.network);
        buf[4..10].copy_from_slice(&self.addr.0);
        buf[10..12].copy_from_slice(&self.socket.to_be_bytes());
    }
}

impl Display for HeaderAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = &self.network;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}/{}:{}",
            n[0], n[1], n[2], n[3], self.addr, self.socket
        )
    }
}

/// The fixed-layout 30-byte IPX header
///
/// The length field is carried as received; decoding does not re-derive
/// it from the datagram size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub checksum: u16,
    pub length: u16,
    pub transport_control: u8,
    pub packet_type: u8,
    pub dest: HeaderAddr,
    pub src: HeaderAddr,
}

impl Header {
    /// Decodes a header from the first 30 bytes of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LENGTH {
            return Err(PacketError::TooShort);
        }

        Ok(Header {
            checksum: u16::from_be_bytes([buf[0], buf[1]]),
            length: u16::from_be_bytes([buf[2], buf[3]]),
            transport_control: buf[4],
            packet_type: buf[5],
            dest: HeaderAddr::decode(&buf[6..18])?,
            src: HeaderAddr::decode(&buf[18..30])?,
        })
    }

    /// Encodes the header into exactly 30 bytes
    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[0..2].copy_from_slice(&self.checksum.to_be_bytes());
        buf[2..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4] = self.transport_control;
        buf[5] = self.packet_type;
        self.dest.encode(&mut buf[6..18]);
        self.src.encode(&mut buf[18..30]);
        buf
    }

    /// A registration packet requests a server-assigned node address:
    /// destination socket 2, destination address NULL
    pub fn is_registration(&self) -> bool {
        self.dest.socket == REGISTRATION_SOCKET && self.dest.addr.is_null()
    }

    /// A broadcast packet is destined to the all-ones address
    pub fn is_broadcast(&self) -> bool {
        self.dest.addr.is_broadcast()
    }
}

/// Decoded IPX header plus owned payload bytes
///
/// Packets are created on decode or by a producer and then passed by
/// shared reference through pipes; they are never mutated after publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Packet { header, payload }
    }

    /// Decodes one datagram: 30-byte header, everything after is payload
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let header = Header::decode(buf)?;
        Ok(Packet {
            header,
            payload: buf[HEADER_LENGTH..].to_vec(),
        })
    }

    /// Encodes the packet into one datagram
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LENGTH + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Total encoded length in bytes
    ///
    /// Never zero; the header alone is 30 bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        HEADER_LENGTH + self.payload.len()
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({} bytes)",
            self.header.src,
            self.header.dest,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_header() -> Header {
        Header {
            checksum: 0xFFFF,
            length: 0x0026,
            transport_control: 0,
            packet_type: 4,
            dest: HeaderAddr {
                network: [0, 0, 0, 1],
                addr: Address([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]),
                socket: 0x4002,
            },
            src: HeaderAddr {
                network: [0, 0, 0, 1],
                addr: Address([0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]),
                socket: 0x4002,
            },
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let buf = header.encode();
        assert_eq!(buf.len(), HEADER_LENGTH);
        assert_eq!(Header::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_known_layout() {
        let header = sample_header();
        let buf = header.encode();
        assert_eq!(&buf[0..2], &[0xFF, 0xFF]);
        assert_eq!(&buf[2..4], &[0x00, 0x26]);
        assert_eq!(&buf[6..10], &[0, 0, 0, 1]);
        assert_eq!(&buf[10..16], &[0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(&buf[16..18], &[0x40, 0x02]);
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(Packet::decode(&[0u8; 29]), Err(PacketError::TooShort));
        assert_eq!(
            HeaderAddr::decode(&[0u8; 11]),
            Err(PacketError::ShortAddress)
        );
    }

    #[test]
    fn test_payload_is_remainder() {
        let mut buf = sample_header().encode().to_vec();
        buf.extend_from_slice(b"hello ipx");
        let packet = Packet::decode(&buf).unwrap();
        assert_eq!(packet.payload, b"hello ipx");
        assert_eq!(packet.len(), buf.len());
    }

    #[test]
    fn test_registration_predicate() {
        let mut header = sample_header();
        assert!(!header.is_registration());
        header.dest.addr = Address::NULL;
        header.dest.socket = REGISTRATION_SOCKET;
        assert!(header.is_registration());
    }

    #[test]
    fn test_broadcast_predicate() {
        let mut header = sample_header();
        assert!(!header.is_broadcast());
        header.dest.addr = Address::BROADCAST;
        assert!(header.is_broadcast());
    }

    proptest! {
        #[test]
        fn prop_packet_roundtrip(
            checksum in any::<u16>(),
            length in any::<u16>(),
            transport_control in any::<u8>(),
            packet_type in any::<u8>(),
            dest_net in any::<[u8; 4]>(),
            dest_addr in any::<[u8; 6]>(),
            dest_socket in any::<u16>(),
            src_net in any::<[u8; 4]>(),
            src_addr in any::<[u8; 6]>(),
            src_socket in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=1470),
        ) {
            let packet = Packet {
                header: Header {
                    checksum,
                    length,
                    transport_control,
                    packet_type,
                    dest: HeaderAddr {
                        network: dest_net,
                        addr: Address(dest_addr),
                        socket: dest_socket,
                    },
                    src: HeaderAddr {
                        network: src_net,
                        addr: Address(src_addr),
                        socket: src_socket,
                    },
                },
                payload,
            };
            let decoded = Packet::decode(&packet.encode()).unwrap();
            prop_assert_eq!(decoded, packet);
        }
    }
}
