//! Uplink protocol adapter
//!
//! The authenticated variant of the DOSBox protocol. An uplink client
//! represents a whole remote IPX network, so after authentication its
//! node sits on the network stack without the addressable layer and may
//! forward any source address.
//!
//! Control packets are IPX packets whose destination address is the
//! ASCII literal `UpLiNk`, carrying JSON:
//!
//! ```text
//! {"message-type": <string>, "challenge"?: <base64>, "solution"?: <base64>}
//! ```
//!
//! Authentication is a 4-step mutual challenge/response:
//! 1. C->S get-challenge-request
//! 2. S->C get-challenge-response {challenge}
//! 3. C->S submit-solution {solution, challenge}
//! 4. S->C submit-solution-accepted {solution} or submit-solution-rejected
//!
//! where `solution = SHA256(role || peer_challenge || password || peer_challenge)`
//! and the roles are the literals `client` and `server`.

use crate::codec::ipx::{Address, HEADER_LENGTH, Header, HeaderAddr, Packet};
use crate::server::dosbox::keepalive_loop;
use crate::vnet::pipe::Pipe;
use crate::vnet::{Network, Node};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Destination address selecting the uplink control protocol
pub const UPLINK_ADDRESS: Address = Address(*b"UpLiNk");

/// Server challenges are at least this many random bytes
pub const CHALLENGE_LENGTH: usize = 64;

pub const MSG_GET_CHALLENGE_REQUEST: &str = "get-challenge-request";
pub const MSG_GET_CHALLENGE_RESPONSE: &str = "get-challenge-response";
pub const MSG_SUBMIT_SOLUTION: &str = "submit-solution";
pub const MSG_SUBMIT_SOLUTION_ACCEPTED: &str = "submit-solution-accepted";
pub const MSG_SUBMIT_SOLUTION_REJECTED: &str = "submit-solution-rejected";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkMessage {
    #[serde(rename = "message-type")]
    pub message_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub challenge: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub solution: Option<Vec<u8>>,
}

impl UplinkMessage {
    fn new(message_type: &str) -> Self {
        UplinkMessage {
            message_type: message_type.to_string(),
            challenge: None,
            solution: None,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Computes `SHA256(role || challenge || password || challenge)`
pub fn solve_challenge(role: &str, password: &str, challenge: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(role.as_bytes());
    hasher.update(challenge);
    hasher.update(password.as_bytes());
    hasher.update(challenge);
    hasher.finalize().to_vec()
}

pub struct UplinkHandler {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    rx: Arc<Pipe>,
    last_recv: Arc<Mutex<Instant>>,
    network: Arc<dyn Network>,
    password: String,
    keepalive_interval: Duration,
    cancel: CancellationToken,
}

impl UplinkHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        rx: Arc<Pipe>,
        last_recv: Arc<Mutex<Instant>>,
        network: Arc<dyn Network>,
        password: String,
        keepalive_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        UplinkHandler {
            socket,
            remote,
            rx,
            last_recv,
            network,
            password,
            keepalive_interval,
            cancel,
        }
    }

    pub async fn run(self) -> crate::Result<()> {
        let mut challenge = vec![0u8; CHALLENGE_LENGTH];
        rand::rng().fill_bytes(&mut challenge);

        if !self.authenticate(&challenge).await? {
            return Ok(());
        }

        let node = self.network.new_node();
        tracing::info!("uplink {} authenticated", self.remote);

        tokio::spawn(keepalive_loop(
            self.socket.clone(),
            self.remote,
            self.last_recv.clone(),
            self.keepalive_interval,
            self.cancel.clone(),
        ));

        let result = self.pump(node.as_ref(), &challenge).await;
        self.cancel.cancel();
        node.close();
        result
    }

    /// Runs the challenge/response exchange; non-control packets are
    /// silently discarded until it completes
    async fn authenticate(&self, challenge: &[u8]) -> crate::Result<bool> {
        loop {
            let packet = self.rx.read(&self.cancel).await?;
            let Some(message) = control_message(&packet) else {
                continue;
            };

            match message.message_type.as_str() {
                MSG_GET_CHALLENGE_REQUEST => {
                    let mut reply = UplinkMessage::new(MSG_GET_CHALLENGE_RESPONSE);
                    reply.challenge = Some(challenge.to_vec());
                    self.send_control(&reply).await?;
                }

                MSG_SUBMIT_SOLUTION => {
                    let (Some(solution), Some(client_challenge)) =
                        (&message.solution, &message.challenge)
                    else {
                        continue;
                    };
                    let expected = solve_challenge("client", &self.password, challenge);
                    if *solution == expected {
                        let mut reply = UplinkMessage::new(MSG_SUBMIT_SOLUTION_ACCEPTED);
                        reply.solution =
                            Some(solve_challenge("server", &self.password, client_challenge));
                        self.send_control(&reply).await?;
                        return Ok(true);
                    }
                    tracing::info!("uplink {} submitted a wrong solution", self.remote);
                    self.send_control(&UplinkMessage::new(MSG_SUBMIT_SOLUTION_REJECTED))
                        .await?;
                    return Ok(false);
                }

                other => {
                    tracing::debug!("uplink {}: unexpected message {}", self.remote, other);
                }
            }
        }
    }

    async fn pump(&self, node: &dyn Node, challenge: &[u8]) -> crate::Result<()> {
        loop {
            tokio::select! {
                packet = self.rx.read(&self.cancel) => {
                    let packet = packet?;
                    if let Some(message) = control_message(&packet) {
                        // Re-authentication is allowed at any time.
                        if message.message_type == MSG_GET_CHALLENGE_REQUEST {
                            let mut reply = UplinkMessage::new(MSG_GET_CHALLENGE_RESPONSE);
                            reply.challenge = Some(challenge.to_vec());
                            self.send_control(&reply).await?;
                        }
                        continue;
                    }
                    // Any source address is permitted: the uplink
                    // aggregates a whole network behind this port.
                    if let Err(e) = node.write_packet(packet).await {
                        tracing::trace!("uplink {} write skipped: {}", self.remote, e);
                    }
                }

                packet = node.read_packet(&self.cancel) => {
                    let packet = packet?;
                    self.socket.send_to(&packet.encode(), self.remote).await?;
                }
            }
        }
    }

    async fn send_control(&self, message: &UplinkMessage) -> crate::Result<()> {
        let payload = serde_json::to_vec(message)?;
        let packet = Packet::new(
            Header {
                checksum: 0xFFFF,
                length: (HEADER_LENGTH + payload.len()) as u16,
                transport_control: 0,
                packet_type: 0,
                dest: HeaderAddr {
                    network: [0, 0, 0, 0],
                    addr: UPLINK_ADDRESS,
                    socket: 0,
                },
                src: HeaderAddr {
                    network: [0, 0, 0, 0],
                    addr: UPLINK_ADDRESS,
                    socket: 0,
                },
            },
            payload,
        );
        self.socket.send_to(&packet.encode(), self.remote).await?;
        Ok(())
    }
}

/// Decodes an uplink control message, or None for a data packet
fn control_message(packet: &Packet) -> Option<UplinkMessage> {
    if packet.header.dest.addr != UPLINK_ADDRESS {
        return None;
    }
    serde_json::from_slice(&packet.payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solution_is_deterministic() {
        let challenge = [7u8; CHALLENGE_LENGTH];
        let a = solve_challenge("client", "secret", &challenge);
        let b = solve_challenge("client", "secret", &challenge);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        assert_ne!(a, solve_challenge("server", "secret", &challenge));
        assert_ne!(a, solve_challenge("client", "other", &challenge));
    }

    #[test]
    fn test_message_json_shape() {
        let mut message = UplinkMessage::new(MSG_GET_CHALLENGE_RESPONSE);
        message.challenge = Some(vec![1, 2, 3]);
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"message-type\":\"get-challenge-response\""));
        assert!(json.contains("\"challenge\":\"AQID\""));
        assert!(!json.contains("solution"));

        let parsed: UplinkMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.challenge.unwrap(), vec![1, 2, 3]);
        assert!(parsed.solution.is_none());
    }
}
