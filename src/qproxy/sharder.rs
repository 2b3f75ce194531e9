//! Quake reliable-stream re-fragmentation
//!
//! Modern Quake servers send reliable messages larger than the 1024
//! byte datagram a vanilla client accepts. The sharder sits between the
//! two and re-fragments the server-to-client reliable stream: upstream
//! packets are buffered, cut into chunks that fit the vanilla MTU and
//! delivered stop-and-wait downstream. An upstream sequence number is
//! acknowledged only after downstream has acknowledged everything up to
//! and including our rewritten end-of-message, preserving Quake's
//! end-to-end reliability while decoupling fragmentation.
//!
//! # Quake net header (8 bytes, big-endian)
//! ```text
//! +-------------------------+----------+
//! | flags | length (16 bits)| sequence |
//! |      4 bytes            | 4 bytes  |
//! +-------------------------+----------+
//! ```

pub const NETFLAG_LENGTH_MASK: u32 = 0x0000FFFF;
pub const NETFLAG_DATA: u32 = 0x0001_0000;
pub const NETFLAG_ACK: u32 = 0x0002_0000;
pub const NETFLAG_NAK: u32 = 0x0004_0000;
pub const NETFLAG_EOM: u32 = 0x0008_0000;
pub const NETFLAG_UNRELIABLE: u32 = 0x0010_0000;
pub const NETFLAG_CTL: u32 = 0x8000_0000;

/// Header bytes preceding sequenced message data
pub const HEADER_SIZE: usize = 8;

/// Largest datagram a vanilla client accepts, header included
pub const MAX_DATAGRAM: usize = 1024;

/// Message bytes per downstream chunk
const CHUNK_SIZE: usize = MAX_DATAGRAM - HEADER_SIZE;

/// Encodes a sequenced Quake packet
pub fn encode_packet(flags: u32, sequence: u32, data: &[u8]) -> Vec<u8> {
    let word = flags | (HEADER_SIZE + data.len()) as u32;
    let mut buf = Vec::with_capacity(HEADER_SIZE + data.len());
    buf.extend_from_slice(&word.to_be_bytes());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Splits a datagram into flags, and for sequenced packets the sequence
/// number and message data
pub fn decode_packet(buf: &[u8]) -> Option<(u32, Option<(u32, &[u8])>)> {
    if buf.len() < 4 {
        return None;
    }
    let word = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let flags = word & !NETFLAG_LENGTH_MASK;
    if flags & NETFLAG_CTL != 0 {
        return Some((flags, None));
    }
    if buf.len() < HEADER_SIZE {
        return None;
    }
    let sequence = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Some((flags, Some((sequence, &buf[HEADER_SIZE..]))))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharderState {
    /// Accumulating reliable data from upstream
    Receiving,

    /// Upstream finished its message; chunks are still draining
    ReceivedEom,

    /// The final chunk went downstream with the EOM flag
    SentEom,

    /// Downstream confirmed the EOM; upstream gets its ack
    EomAcked,
}

/// What the caller must put on the wire after feeding the sharder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharderOutput {
    /// A re-fragmented datagram for the downstream client
    Downstream(Vec<u8>),

    /// An acknowledgement for the upstream server
    AckUpstream(u32),
}

pub struct ReliableSharder {
    state: SharderState,
    buffer: Vec<u8>,
    pending_ack: Option<u32>,
    expected_up: u32,
    down_seq: u32,
    inflight: Option<Vec<u8>>,
}

impl Default for ReliableSharder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableSharder {
    pub fn new() -> Self {
        ReliableSharder {
            state: SharderState::Receiving,
            buffer: Vec::new(),
            pending_ack: None,
            expected_up: 0,
            down_seq: 0,
            inflight: None,
        }
    }

    pub fn state(&self) -> SharderState {
        self.state
    }

    /// Feeds one reliable DATA packet from the upstream server
    pub fn upstream_data(&mut self, sequence: u32, eom: bool, data: &[u8]) -> Vec<SharderOutput> {
        let mut out = Vec::new();
        if sequence != self.expected_up {
            if sequence < self.expected_up {
                // Retransmission: our ack or chunk got lost on the way.
                match &self.inflight {
                    Some(chunk) => out.push(SharderOutput::Downstream(chunk.clone())),
                    None => out.push(SharderOutput::AckUpstream(sequence)),
                }
            }
            return out;
        }
        self.expected_up = self.expected_up.wrapping_add(1);
        self.pending_ack = Some(sequence);
        self.buffer.extend_from_slice(data);
        if eom {
            self.state = SharderState::ReceivedEom;
        }
        self.pump(&mut out);
        out
    }

    /// Feeds one ACK from the downstream client
    pub fn downstream_ack(&mut self, sequence: u32) -> Vec<SharderOutput> {
        let mut out = Vec::new();
        if self.inflight.is_none() || sequence != self.down_seq {
            return out;
        }
        self.inflight = None;
        self.down_seq = self.down_seq.wrapping_add(1);
        if self.state == SharderState::SentEom && self.buffer.is_empty() {
            self.state = SharderState::EomAcked;
        }
        self.pump(&mut out);
        out
    }

    /// Sends the next chunk when the line is clear and acknowledges
    /// upstream once everything it sent has been relayed
    fn pump(&mut self, out: &mut Vec<SharderOutput>) {
        if self.inflight.is_none() && !self.buffer.is_empty() {
            let take = self.buffer.len().min(CHUNK_SIZE);
            let chunk: Vec<u8> = self.buffer.drain(..take).collect();
            let mut flags = NETFLAG_DATA;
            if self.buffer.is_empty() && self.state == SharderState::ReceivedEom {
                flags |= NETFLAG_EOM;
                self.state = SharderState::SentEom;
            }
            let packet = encode_packet(flags, self.down_seq, &chunk);
            self.inflight = Some(packet.clone());
            out.push(SharderOutput::Downstream(packet));
        }

        if self.inflight.is_none() && self.buffer.is_empty() {
            if let Some(sequence) = self.pending_ack.take() {
                out.push(SharderOutput::AckUpstream(sequence));
                if self.state == SharderState::EomAcked {
                    self.state = SharderState::Receiving;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downstream_packets(outputs: &[SharderOutput]) -> Vec<&Vec<u8>> {
        outputs
            .iter()
            .filter_map(|o| match o {
                SharderOutput::Downstream(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn upstream_acks(outputs: &[SharderOutput]) -> Vec<u32> {
        outputs
            .iter()
            .filter_map(|o| match o {
                SharderOutput::AckUpstream(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_packet_codec() {
        let packet = encode_packet(NETFLAG_DATA | NETFLAG_EOM, 7, b"abc");
        let (flags, rest) = decode_packet(&packet).unwrap();
        assert_eq!(flags, NETFLAG_DATA | NETFLAG_EOM);
        let (sequence, data) = rest.unwrap();
        assert_eq!(sequence, 7);
        assert_eq!(data, b"abc");
        // Length field covers the whole datagram.
        assert_eq!(
            u32::from_be_bytes(packet[0..4].try_into().unwrap()) & NETFLAG_LENGTH_MASK,
            11
        );
    }

    #[test]
    fn test_control_packet_has_no_sequence() {
        let word = (NETFLAG_CTL | 9u32).to_be_bytes();
        let mut buf = word.to_vec();
        buf.extend_from_slice(&[0x81, 1, 2, 3, 4]);
        let (flags, rest) = decode_packet(&buf).unwrap();
        assert_eq!(flags & NETFLAG_CTL, NETFLAG_CTL);
        assert!(rest.is_none());
    }

    #[test]
    fn test_small_message_passes_in_one_chunk() {
        let mut sharder = ReliableSharder::new();
        let outputs = sharder.upstream_data(0, true, b"hello");
        let down = downstream_packets(&outputs);
        assert_eq!(down.len(), 1);
        let (flags, rest) = decode_packet(down[0]).unwrap();
        assert_eq!(flags, NETFLAG_DATA | NETFLAG_EOM);
        assert_eq!(rest.unwrap().1, b"hello");
        assert!(upstream_acks(&outputs).is_empty());
        assert_eq!(sharder.state(), SharderState::SentEom);

        // The upstream ack appears only after the downstream ack.
        let outputs = sharder.downstream_ack(0);
        assert_eq!(upstream_acks(&outputs), vec![0]);
        assert_eq!(sharder.state(), SharderState::Receiving);
    }

    #[test]
    fn test_large_message_is_refragmented() {
        let mut sharder = ReliableSharder::new();
        let message = vec![0xAB; 2000];
        let outputs = sharder.upstream_data(0, true, &message);

        // First chunk goes out immediately, stop-and-wait.
        let down = downstream_packets(&outputs);
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].len(), MAX_DATAGRAM);
        let (flags, _) = decode_packet(down[0]).unwrap();
        assert_eq!(flags & NETFLAG_EOM, 0);
        assert!(upstream_acks(&outputs).is_empty());

        // Ack releases the second, final chunk with EOM.
        let outputs = sharder.downstream_ack(0);
        let down = downstream_packets(&outputs);
        assert_eq!(down.len(), 1);
        let (flags, rest) = decode_packet(down[0]).unwrap();
        assert_eq!(flags & NETFLAG_EOM, NETFLAG_EOM);
        let (sequence, data) = rest.unwrap();
        assert_eq!(sequence, 1);
        assert_eq!(data.len(), 2000 - (MAX_DATAGRAM - HEADER_SIZE));
        assert!(upstream_acks(&outputs).is_empty());
        assert_eq!(sharder.state(), SharderState::SentEom);

        // Final downstream ack unlocks the upstream ack.
        let outputs = sharder.downstream_ack(1);
        assert!(downstream_packets(&outputs).is_empty());
        assert_eq!(upstream_acks(&outputs), vec![0]);
        assert_eq!(sharder.state(), SharderState::Receiving);
    }

    #[test]
    fn test_multi_packet_upstream_message() {
        let mut sharder = ReliableSharder::new();

        // Upstream spreads one message over two packets.
        let outputs = sharder.upstream_data(0, false, b"first ");
        assert_eq!(downstream_packets(&outputs).len(), 1);
        let outputs = sharder.downstream_ack(0);
        // Relayed in full, so packet 0 is acked while the message is open.
        assert_eq!(upstream_acks(&outputs), vec![0]);
        assert_eq!(sharder.state(), SharderState::Receiving);

        let outputs = sharder.upstream_data(1, true, b"second");
        let down = downstream_packets(&outputs);
        let (flags, _) = decode_packet(down[0]).unwrap();
        assert_eq!(flags & NETFLAG_EOM, NETFLAG_EOM);
        let outputs = sharder.downstream_ack(1);
        assert_eq!(upstream_acks(&outputs), vec![1]);
    }

    #[test]
    fn test_duplicate_upstream_retransmits_inflight() {
        let mut sharder = ReliableSharder::new();
        let first = sharder.upstream_data(0, true, b"payload");
        let chunk = downstream_packets(&first)[0].clone();

        // Upstream retransmits because our ack is still pending.
        let outputs = sharder.upstream_data(0, true, b"payload");
        assert_eq!(downstream_packets(&outputs), vec![&chunk]);
        assert!(upstream_acks(&outputs).is_empty());
    }

    #[test]
    fn test_duplicate_after_completion_is_reacked() {
        let mut sharder = ReliableSharder::new();
        sharder.upstream_data(0, true, b"payload");
        sharder.downstream_ack(0);

        // The upstream ack was lost; a retransmission just gets re-acked.
        let outputs = sharder.upstream_data(0, true, b"payload");
        assert!(downstream_packets(&outputs).is_empty());
        assert_eq!(upstream_acks(&outputs), vec![0]);
    }

    #[test]
    fn test_stray_downstream_ack_is_ignored() {
        let mut sharder = ReliableSharder::new();
        assert!(sharder.downstream_ack(5).is_empty());
        sharder.upstream_data(0, true, b"x");
        assert!(sharder.downstream_ack(9).is_empty());
    }
}
