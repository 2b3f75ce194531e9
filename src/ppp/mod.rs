//! PPP over PPTP/GRE
//!
//! Admits Windows-9x VPN clients onto the virtual IPX network. The
//! subsystem is deliberately not a general PPP stack: only LCP, IPXCP,
//! GRE-v1 tunneling and the PPTP control messages needed to bring a
//! peer up are implemented.

pub mod gre;
pub mod ipxcp;
pub mod lcp;
pub mod negotiator;
pub mod pptp;
pub mod session;

use std::fmt;
use std::fmt::Display;

/// PPP protocol number for LCP
pub const PROTOCOL_LCP: u16 = 0xC021;
/// PPP protocol number for IPXCP
pub const PROTOCOL_IPXCP: u16 = 0x802B;
/// PPP protocol number for IPX payload frames
pub const PROTOCOL_IPX: u16 = 0x002B;

/// HDLC-style address/control prefix carried by uncompressed frames
const HDLC_PREFIX: [u8; 2] = [0xFF, 0x03];

/// Encodes a PPP frame
///
/// Neither side negotiates address/control field compression, so frames
/// go out with the uncompressed FF 03 prefix.
pub fn encode_frame(protocol: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&HDLC_PREFIX);
    buf.extend_from_slice(&protocol.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decodes a PPP frame into protocol number and payload
///
/// The FF 03 prefix is stripped when present, and a compressed one-byte
/// protocol field (odd leading byte) is tolerated on receive.
pub fn decode_frame(buf: &[u8]) -> Result<(u16, &[u8]), PppError> {
    let buf = match buf {
        [0xFF, 0x03, rest @ ..] => rest,
        _ => buf,
    };
    match buf {
        [first, rest @ ..] if first & 1 == 1 => Ok((*first as u16, rest)),
        [hi, lo, rest @ ..] => Ok((u16::from_be_bytes([*hi, *lo]), rest)),
        _ => Err(PppError::Malformed),
    }
}

/// PPP negotiation and session errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PppError {
    /// A frame or option list could not be parsed
    Malformed,

    /// The peer suggested or rejected an option we do not implement
    UnknownOption { protocol: &'static str, option: u8 },

    /// The peer refused a value we cannot change
    NonNegotiable { protocol: &'static str, option: u8 },

    /// Too many Configure-Requests went unanswered
    NegotiationTimeout { protocol: &'static str },

    /// The peer rejected too many of our protocols to be useful
    TooManyProtocolRejects,

    /// The peer asked for link termination
    Terminated,
}

impl std::error::Error for PppError {}

impl Display for PppError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PppError::Malformed => "malformed ppp frame".fmt(fmt),
            PppError::UnknownOption { protocol, option } => {
                write!(fmt, "{}: peer sent unknown option {}", protocol, option)
            }
            PppError::NonNegotiable { protocol, option } => {
                write!(fmt, "{}: peer refused non-negotiable option {}", protocol, option)
            }
            PppError::NegotiationTimeout { protocol } => {
                write!(fmt, "{}: no reply to configure-request", protocol)
            }
            PppError::TooManyProtocolRejects => "too many protocol rejects".fmt(fmt),
            PppError::Terminated => "link terminated by peer".fmt(fmt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = encode_frame(PROTOCOL_IPX, b"payload");
        assert_eq!(&frame[..2], &HDLC_PREFIX);
        let (protocol, payload) = decode_frame(&frame).unwrap();
        assert_eq!(protocol, PROTOCOL_IPX);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_decode_without_prefix() {
        let (protocol, payload) = decode_frame(&[0xC0, 0x21, 1, 2]).unwrap();
        assert_eq!(protocol, PROTOCOL_LCP);
        assert_eq!(payload, &[1, 2]);
    }

    #[test]
    fn test_decode_compressed_protocol() {
        // Protocol field compression: odd leading byte is a 1-byte protocol.
        let (protocol, payload) = decode_frame(&[0x21, 9]).unwrap();
        assert_eq!(protocol, 0x21);
        assert_eq!(payload, &[9]);
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode_frame(&[]), Err(PppError::Malformed));
        assert_eq!(decode_frame(&[0xFF, 0x03]), Err(PppError::Malformed));
    }
}
