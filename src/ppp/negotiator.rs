//! PPP option negotiation
//!
//! One negotiator instance drives one control protocol (LCP or IPXCP).
//! It is a sans-io state machine: the session feeds it received frames
//! via [`Negotiator::handle`] and drives retransmission via
//! [`Negotiator::poll`] on a short periodic tick. The observable timing
//! envelope is one second between Configure-Request retransmits and
//! five unanswered requests before giving up.
//!
//! Each side of the link is modelled as a set of options with a current
//! value and a validator. `NonNegotiable` accepts only the exact stored
//! value; `Required` accepts any value the peer supplies but not its
//! absence.

use crate::ppp::PppError;
use std::time::{Duration, Instant};

pub const CODE_CONFIGURE_REQUEST: u8 = 1;
pub const CODE_CONFIGURE_ACK: u8 = 2;
pub const CODE_CONFIGURE_NAK: u8 = 3;
pub const CODE_CONFIGURE_REJECT: u8 = 4;
pub const CODE_TERMINATE_REQUEST: u8 = 5;
pub const CODE_TERMINATE_ACK: u8 = 6;
pub const CODE_CODE_REJECT: u8 = 7;
pub const CODE_PROTOCOL_REJECT: u8 = 8;
pub const CODE_ECHO_REQUEST: u8 = 9;
pub const CODE_ECHO_REPLY: u8 = 10;

/// Spacing between Configure-Request retransmissions
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Unanswered requests tolerated before negotiation fails
const MAX_SENDS: u32 = 5;

/// One LCP/IPXCP control packet: code, identifier, data
///
/// The length field covers the whole packet including the 4-byte
/// header; trailing bytes beyond it are ignored on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpFrame {
    pub code: u8,
    pub identifier: u8,
    pub data: Vec<u8>,
}

impl CpFrame {
    pub fn new(code: u8, identifier: u8, data: Vec<u8>) -> Self {
        CpFrame {
            code,
            identifier,
            data,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PppError> {
        if buf.len() < 4 {
            return Err(PppError::Malformed);
        }
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if length < 4 || length > buf.len() {
            return Err(PppError::Malformed);
        }
        Ok(CpFrame {
            code: buf[0],
            identifier: buf[1],
            data: buf[4..length].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = (4 + self.data.len()) as u16;
        let mut buf = Vec::with_capacity(length as usize);
        buf.push(self.code);
        buf.push(self.identifier);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }
}

/// One option inside a Configure-* packet: type, value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpOption {
    pub code: u8,
    pub value: Vec<u8>,
}

/// Parses a (type, length, value)* option list
pub fn parse_options(mut data: &[u8]) -> Result<Vec<CpOption>, PppError> {
    let mut options = Vec::new();
    while !data.is_empty() {
        if data.len() < 2 {
            return Err(PppError::Malformed);
        }
        let length = data[1] as usize;
        if length < 2 || length > data.len() {
            return Err(PppError::Malformed);
        }
        options.push(CpOption {
            code: data[0],
            value: data[2..length].to_vec(),
        });
        data = &data[length..];
    }
    Ok(options)
}

pub fn encode_options(options: &[CpOption]) -> Vec<u8> {
    let mut buf = Vec::new();
    for option in options {
        buf.push(option.code);
        buf.push((2 + option.value.len()) as u8);
        buf.extend_from_slice(&option.value);
    }
    buf
}

/// Validation policy for one negotiated option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validate {
    /// Any value, or none at all, is acceptable
    Any,

    /// Only the exact stored value is acceptable
    NonNegotiable,

    /// The peer must supply some value
    Required,
}

/// An option with its current value and validator
#[derive(Debug, Clone)]
pub struct NegOption {
    pub code: u8,
    pub value: Option<Vec<u8>>,
    pub validate: Validate,
}

impl NegOption {
    pub fn new(code: u8, value: Option<Vec<u8>>, validate: Validate) -> Self {
        NegOption {
            code,
            value,
            validate,
        }
    }

    fn accepts(&self, candidate: Option<&[u8]>) -> bool {
        match self.validate {
            Validate::Any => true,
            Validate::Required => candidate.is_some(),
            Validate::NonNegotiable => candidate == self.value.as_deref(),
        }
    }
}

pub struct Negotiator {
    protocol: &'static str,

    /// Options we request from the peer in Configure-Request
    local: Vec<NegOption>,

    /// Options the peer may request; committed values end up here
    remote: Vec<NegOption>,

    identifier: u8,
    sends: u32,
    next_send: Option<Instant>,
    local_done: bool,
    remote_done: bool,
    failure: Option<PppError>,
}

impl Negotiator {
    pub fn new(protocol: &'static str, local: Vec<NegOption>, remote: Vec<NegOption>) -> Self {
        Negotiator {
            protocol,
            local,
            remote,
            identifier: 1,
            sends: 0,
            next_send: None,
            local_done: false,
            remote_done: false,
            failure: None,
        }
    }

    pub fn done(&self) -> bool {
        self.local_done && self.remote_done
    }

    pub fn failure(&self) -> Option<&PppError> {
        self.failure.as_ref()
    }

    /// The value the peer committed for one of its options
    pub fn remote_value(&self, code: u8) -> Option<&[u8]> {
        self.remote
            .iter()
            .find(|option| option.code == code)
            .and_then(|option| option.value.as_deref())
    }

    /// Drives retransmission; returns frames due to be sent now
    pub fn poll(&mut self, now: Instant) -> Vec<CpFrame> {
        if self.failure.is_some() || self.local_done {
            return Vec::new();
        }
        if let Some(at) = self.next_send
            && now < at
        {
            return Vec::new();
        }
        if self.sends >= MAX_SENDS {
            tracing::error!("{}: negotiation failed, {} requests unanswered", self.protocol, self.sends);
            self.failure = Some(PppError::NegotiationTimeout {
                protocol: self.protocol,
            });
            return Vec::new();
        }
        self.sends += 1;
        self.next_send = Some(now + RETRY_INTERVAL);
        vec![self.configure_request()]
    }

    /// Processes one received control packet; returns frames to send
    ///
    /// Codes the negotiator does not own (echo, terminate) are ignored
    /// here; the session routes them itself.
    pub fn handle(&mut self, frame: &CpFrame, now: Instant) -> Result<Vec<CpFrame>, PppError> {
        let result = match frame.code {
            CODE_CONFIGURE_REQUEST => self.on_configure_request(frame),
            CODE_CONFIGURE_ACK => {
                if frame.identifier == self.identifier {
                    self.local_done = true;
                    self.next_send = None;
                    tracing::debug!("{}: local options acknowledged", self.protocol);
                }
                Ok(Vec::new())
            }
            CODE_CONFIGURE_NAK => self.on_configure_nak(frame, now),
            CODE_CONFIGURE_REJECT => self.on_configure_reject(frame, now),
            _ => Ok(Vec::new()),
        };
        if let Err(e) = &result {
            self.failure = Some(e.clone());
        }
        result
    }

    fn configure_request(&self) -> CpFrame {
        let options: Vec<CpOption> = self
            .local
            .iter()
            .filter_map(|option| {
                option.value.as_ref().map(|value| CpOption {
                    code: option.code,
                    value: value.clone(),
                })
            })
            .collect();
        CpFrame::new(
            CODE_CONFIGURE_REQUEST,
            self.identifier,
            encode_options(&options),
        )
    }

    fn on_configure_request(&mut self, frame: &CpFrame) -> Result<Vec<CpFrame>, PppError> {
        let offered = parse_options(&frame.data)?;

        let unknown: Vec<CpOption> = offered
            .iter()
            .filter(|option| !self.remote.iter().any(|known| known.code == option.code))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            tracing::debug!(
                "{}: rejecting unknown options {:?}",
                self.protocol,
                unknown.iter().map(|o| o.code).collect::<Vec<_>>()
            );
            return Ok(vec![CpFrame::new(
                CODE_CONFIGURE_REJECT,
                frame.identifier,
                encode_options(&unknown),
            )]);
        }

        // Candidate map: the peer's value per option, nil when missing.
        let mut naks = Vec::new();
        for known in &self.remote {
            let candidate = offered
                .iter()
                .find(|option| option.code == known.code)
                .map(|option| option.value.as_slice());
            if !known.accepts(candidate) {
                naks.push(CpOption {
                    code: known.code,
                    value: known.value.clone().unwrap_or_default(),
                });
            }
        }
        if !naks.is_empty() {
            tracing::debug!(
                "{}: naking options {:?}",
                self.protocol,
                naks.iter().map(|o| o.code).collect::<Vec<_>>()
            );
            return Ok(vec![CpFrame::new(
                CODE_CONFIGURE_NAK,
                frame.identifier,
                encode_options(&naks),
            )]);
        }

        for known in self.remote.iter_mut() {
            known.value = offered
                .iter()
                .find(|option| option.code == known.code)
                .map(|option| option.value.clone());
        }
        self.remote_done = true;
        tracing::debug!("{}: remote options committed", self.protocol);
        Ok(vec![CpFrame::new(
            CODE_CONFIGURE_ACK,
            frame.identifier,
            frame.data.clone(),
        )])
    }

    fn on_configure_nak(&mut self, frame: &CpFrame, now: Instant) -> Result<Vec<CpFrame>, PppError> {
        let suggestions = parse_options(&frame.data)?;
        for suggestion in &suggestions {
            let Some(option) = self
                .local
                .iter_mut()
                .find(|option| option.code == suggestion.code)
            else {
                return Err(PppError::UnknownOption {
                    protocol: self.protocol,
                    option: suggestion.code,
                });
            };
            match option.validate {
                Validate::NonNegotiable => {
                    if option.value.as_deref() != Some(suggestion.value.as_slice()) {
                        tracing::error!(
                            "{}: peer naked non-negotiable option {}",
                            self.protocol,
                            option.code
                        );
                        return Err(PppError::NonNegotiable {
                            protocol: self.protocol,
                            option: option.code,
                        });
                    }
                }
                _ => {
                    option.value = Some(suggestion.value.clone());
                }
            }
        }
        Ok(vec![self.renewed_request(now)])
    }

    fn on_configure_reject(
        &mut self,
        frame: &CpFrame,
        now: Instant,
    ) -> Result<Vec<CpFrame>, PppError> {
        let rejected = parse_options(&frame.data)?;
        for rejection in &rejected {
            let Some(option) = self
                .local
                .iter_mut()
                .find(|option| option.code == rejection.code)
            else {
                return Err(PppError::UnknownOption {
                    protocol: self.protocol,
                    option: rejection.code,
                });
            };
            if option.validate == Validate::NonNegotiable {
                tracing::error!(
                    "{}: peer rejected non-negotiable option {}",
                    self.protocol,
                    option.code
                );
                return Err(PppError::NonNegotiable {
                    protocol: self.protocol,
                    option: option.code,
                });
            }
            option.value = None;
        }
        Ok(vec![self.renewed_request(now)])
    }

    /// Builds the next Configure-Request after a Nak/Reject changed the
    /// option set; the updated request gets a fresh retry count
    fn renewed_request(&mut self, now: Instant) -> CpFrame {
        self.identifier = self.identifier.wrapping_add(1);
        self.sends = 1;
        self.next_send = Some(now + RETRY_INTERVAL);
        self.configure_request()
    }
}
