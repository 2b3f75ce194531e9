//! PPP session
//!
//! Drives one negotiated PPP channel between a GRE session and a
//! virtual-network node. The link walks Dead -> Establish (LCP, then
//! IPXCP; the authenticate phase is skipped) -> Network -> Terminate.
//! Only in the Network state are IPX payloads forwarded to and from the
//! attached node.

use crate::codec::ipx::Packet;
use crate::ppp::gre::GreSession;
use crate::ppp::negotiator::{
    CODE_ECHO_REPLY, CODE_ECHO_REQUEST, CODE_PROTOCOL_REJECT, CODE_TERMINATE_ACK,
    CODE_TERMINATE_REQUEST, CpFrame,
};
use crate::ppp::{
    PROTOCOL_IPX, PROTOCOL_IPXCP, PROTOCOL_LCP, PppError, decode_frame, encode_frame,
};
use crate::ppp::{ipxcp, lcp};
use crate::vnet::{Node, node_address};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Negotiator drive cadence
const DRIVE_INTERVAL: Duration = Duration::from_millis(100);

/// Unknown-protocol frames tolerated before the link is torn down
const MAX_PROTOCOL_REJECTS: u32 = 5;

/// Bytes of a rejected frame echoed back in Protocol-Reject
const REJECT_SNIPPET: usize = 128;

/// PPP link states; the authenticate phase is never entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Dead,
    Establish,
    Network,
    Terminate,
}

pub struct PppSession {
    gre: Arc<GreSession>,
    node: Box<dyn Node>,
    cancel: CancellationToken,
}

impl PppSession {
    pub fn new(gre: Arc<GreSession>, node: Box<dyn Node>, cancel: CancellationToken) -> Self {
        PppSession { gre, node, cancel }
    }

    pub async fn run(self) -> crate::Result<()> {
        let PppSession { gre, node, cancel } = self;
        let mut state = LinkState::Dead;

        let node_addr = match node_address(node.as_ref()) {
            Some(addr) => addr,
            None => {
                node.close();
                return Err("network assigned no address".into());
            }
        };
        let (mut lcp, magic) = lcp::negotiator();
        let mut ipxcp = ipxcp::negotiator(node_addr);
        let mut protocol_rejects = 0u32;
        let mut reject_id = 0u8;
        let mut ticker = tokio::time::interval(DRIVE_INTERVAL);

        tracing::info!(
            "ppp session for {} starting in state {:?}, node {}",
            gre.peer(),
            state,
            node_addr
        );
        state = LinkState::Establish;

        let result: crate::Result<()> = 'session: loop {
            tokio::select! {
                frame = gre.recv(&cancel) => {
                    let data = match frame {
                        Ok(data) => data,
                        Err(e) => break 'session Err(e),
                    };
                    let (protocol, payload) = match decode_frame(&data) {
                        Ok(decoded) => decoded,
                        Err(_) => continue,
                    };

                    match protocol {
                        PROTOCOL_LCP => {
                            let Ok(cp) = CpFrame::decode(payload) else {
                                continue;
                            };
                            match cp.code {
                                CODE_ECHO_REQUEST => {
                                    let mut reply = magic.to_be_bytes().to_vec();
                                    if cp.data.len() > 4 {
                                        reply.extend_from_slice(&cp.data[4..]);
                                    }
                                    let reply = CpFrame::new(CODE_ECHO_REPLY, cp.identifier, reply);
                                    if let Err(e) = send_cp(&gre, PROTOCOL_LCP, &reply).await {
                                        break 'session Err(e);
                                    }
                                }
                                CODE_ECHO_REPLY => {}
                                CODE_TERMINATE_REQUEST => {
                                    tracing::info!("ppp {}: peer terminated the link", gre.peer());
                                    let ack = CpFrame::new(CODE_TERMINATE_ACK, cp.identifier, Vec::new());
                                    let _ = send_cp(&gre, PROTOCOL_LCP, &ack).await;
                                    state = LinkState::Terminate;
                                    break 'session Ok(());
                                }
                                CODE_TERMINATE_ACK => {
                                    state = LinkState::Terminate;
                                    break 'session Ok(());
                                }
                                _ => match lcp.handle(&cp, Instant::now()) {
                                    Ok(replies) => {
                                        if let Err(e) = send_all(&gre, PROTOCOL_LCP, &replies).await {
                                            break 'session Err(e);
                                        }
                                    }
                                    Err(e) => break 'session Err(e.into()),
                                },
                            }
                        }

                        PROTOCOL_IPXCP => {
                            // NCP traffic is meaningless until the link is up.
                            if !lcp.done() {
                                continue;
                            }
                            let Ok(cp) = CpFrame::decode(payload) else {
                                continue;
                            };
                            match ipxcp.handle(&cp, Instant::now()) {
                                Ok(replies) => {
                                    if let Err(e) = send_all(&gre, PROTOCOL_IPXCP, &replies).await {
                                        break 'session Err(e);
                                    }
                                }
                                Err(e) => break 'session Err(e.into()),
                            }
                        }

                        PROTOCOL_IPX => {
                            if state != LinkState::Network {
                                continue;
                            }
                            match Packet::decode(payload) {
                                Ok(packet) => {
                                    if let Err(e) = node.write_packet(Arc::new(packet)).await {
                                        tracing::trace!("ppp {}: write skipped: {}", gre.peer(), e);
                                    }
                                }
                                Err(e) => {
                                    tracing::trace!("ppp {}: bad ipx frame: {}", gre.peer(), e);
                                }
                            }
                        }

                        unknown => {
                            protocol_rejects += 1;
                            if protocol_rejects > MAX_PROTOCOL_REJECTS {
                                break 'session Err(PppError::TooManyProtocolRejects.into());
                            }
                            tracing::debug!("ppp {}: rejecting protocol {:#06x}", gre.peer(), unknown);
                            reject_id = reject_id.wrapping_add(1);
                            let mut data = unknown.to_be_bytes().to_vec();
                            data.extend_from_slice(&payload[..payload.len().min(REJECT_SNIPPET)]);
                            let reject = CpFrame::new(CODE_PROTOCOL_REJECT, reject_id, data);
                            if let Err(e) = send_cp(&gre, PROTOCOL_LCP, &reject).await {
                                break 'session Err(e);
                            }
                        }
                    }
                }

                packet = node.read_packet(&cancel), if state == LinkState::Network => {
                    match packet {
                        Ok(packet) => {
                            let frame = encode_frame(PROTOCOL_IPX, &packet.encode());
                            if let Err(e) = gre.send(&frame).await {
                                break 'session Err(e);
                            }
                        }
                        Err(e) => break 'session Err(e.into()),
                    }
                }

                _ = ticker.tick() => {
                    let now = Instant::now();
                    let due = lcp.poll(now);
                    if let Err(e) = send_all(&gre, PROTOCOL_LCP, &due).await {
                        break 'session Err(e);
                    }
                    if let Some(e) = lcp.failure() {
                        break 'session Err(e.clone().into());
                    }
                    if lcp.done() {
                        let due = ipxcp.poll(now);
                        if let Err(e) = send_all(&gre, PROTOCOL_IPXCP, &due).await {
                            break 'session Err(e);
                        }
                        if let Some(e) = ipxcp.failure() {
                            break 'session Err(e.clone().into());
                        }
                        if ipxcp.done() && state == LinkState::Establish {
                            state = LinkState::Network;
                            tracing::info!("ppp {}: link open, node {}", gre.peer(), node_addr);
                        }
                    }
                }

                _ = cancel.cancelled() => {
                    break 'session Ok(());
                }
            }
        };

        if let Err(e) = &result {
            tracing::info!("ppp {}: terminating with error: {}", gre.peer(), e);
        }
        if state != LinkState::Terminate {
            // Best effort; the peer may already be gone.
            let request = CpFrame::new(CODE_TERMINATE_REQUEST, 1, Vec::new());
            let _ = send_cp(&gre, PROTOCOL_LCP, &request).await;
        }

        node.close();
        gre.close();
        result
    }
}

async fn send_cp(gre: &GreSession, protocol: u16, frame: &CpFrame) -> crate::Result<()> {
    gre.send(&encode_frame(protocol, &frame.encode())).await
}

async fn send_all(gre: &GreSession, protocol: u16, frames: &[CpFrame]) -> crate::Result<()> {
    for frame in frames {
        send_cp(gre, protocol, frame).await?;
    }
    Ok(())
}
