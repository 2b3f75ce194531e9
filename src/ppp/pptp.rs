//! PPTP control channel
//!
//! TCP port 1723. Only the messages needed to admit a Windows-9x VPN
//! peer are implemented: the start-control handshake, echo, outgoing
//! calls and call clearing. Each Outgoing-Call-Request binds a GRE
//! session to a fresh switch node and spawns a PPP session over it.
//!
//! Every control message starts with a 16-bit total length, the message
//! type (always 1 for control), the magic cookie 0x1A2B3C4D, the
//! control-message type and a reserved word, followed by a per-type
//! body.

use crate::ppp::gre::GreTransport;
use crate::ppp::session::PppSession;
use crate::vnet::Network;
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const MAGIC_COOKIE: u32 = 0x1A2B3C4D;

/// Fixed part of every control message: length, type, cookie,
/// control-message type, reserved
const FIXED_HEADER_LEN: usize = 12;

const CTRL_START_CONNECTION_REQUEST: u16 = 1;
const CTRL_START_CONNECTION_REPLY: u16 = 2;
const CTRL_ECHO_REQUEST: u16 = 5;
const CTRL_ECHO_REPLY: u16 = 6;
const CTRL_OUTGOING_CALL_REQUEST: u16 = 7;
const CTRL_OUTGOING_CALL_REPLY: u16 = 8;
const CTRL_CALL_CLEAR_REQUEST: u16 = 12;

/// Receive window advertised in Outgoing-Call-Reply
const RECEIVE_WINDOW: u16 = 1024;

pub struct PptpServer {
    listen_addr: String,
    network: Arc<dyn Network>,
    gre: Arc<GreTransport>,
}

impl PptpServer {
    pub fn new(listen_addr: String, network: Arc<dyn Network>, gre: Arc<GreTransport>) -> Self {
        PptpServer {
            listen_addr,
            network,
            gre,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> crate::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("PPTP control listening on {}", self.listen_addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::info!("pptp connection from {}", peer);
                    let mut conn = ControlConnection::new(
                        stream,
                        peer,
                        self.network.clone(),
                        self.gre.clone(),
                        cancel.child_token(),
                    );
                    tokio::spawn(async move {
                        let result = conn.run().await;
                        tracing::debug!("pptp {} control stop with {:?}", peer, result);
                    });
                }

                _ = cancel.cancelled() => {
                    return Ok(());
                }
            }
        }
    }
}

struct ControlMessage {
    control_type: u16,
    body: Vec<u8>,
}

struct ControlConnection {
    stream: TcpStream,
    peer: SocketAddr,
    network: Arc<dyn Network>,
    gre: Arc<GreTransport>,
    cancel: CancellationToken,
    input_stream: BytesMut,
    next_call_id: u16,
    calls: HashMap<u16, CancellationToken>,
}

impl ControlConnection {
    fn new(
        stream: TcpStream,
        peer: SocketAddr,
        network: Arc<dyn Network>,
        gre: Arc<GreTransport>,
        cancel: CancellationToken,
    ) -> Self {
        ControlConnection {
            stream,
            peer,
            network,
            gre,
            cancel,
            input_stream: BytesMut::with_capacity(4096),
            next_call_id: rand::random::<u16>() | 1,
            calls: HashMap::new(),
        }
    }

    async fn run(&mut self) -> crate::Result<()> {
        let result = self.serve().await;
        // Control channel gone: every call on it goes with it.
        for (_, call) in self.calls.drain() {
            call.cancel();
        }
        result
    }

    async fn serve(&mut self) -> crate::Result<()> {
        loop {
            while let Some(message) = self.parse_message()? {
                self.handle_message(message).await?;
            }

            tokio::select! {
                read = self.stream.read_buf(&mut self.input_stream) => {
                    if read? == 0 {
                        return Ok(());
                    }
                }
                _ = self.cancel.cancelled() => {
                    return Ok(());
                }
            }
        }
    }

    fn parse_message(&mut self) -> crate::Result<Option<ControlMessage>> {
        if self.input_stream.len() < 2 {
            return Ok(None);
        }
        let total_len = u16::from_be_bytes([self.input_stream[0], self.input_stream[1]]) as usize;
        if total_len < FIXED_HEADER_LEN || total_len > 4096 {
            return Err("invalid pptp message length".into());
        }
        if self.input_stream.len() < total_len {
            return Ok(None);
        }

        let message_type = u16::from_be_bytes([self.input_stream[2], self.input_stream[3]]);
        let cookie = u32::from_be_bytes([
            self.input_stream[4],
            self.input_stream[5],
            self.input_stream[6],
            self.input_stream[7],
        ]);
        if message_type != 1 || cookie != MAGIC_COOKIE {
            return Err("bad pptp message header".into());
        }
        let control_type = u16::from_be_bytes([self.input_stream[8], self.input_stream[9]]);
        let body = self.input_stream[FIXED_HEADER_LEN..total_len].to_vec();
        self.input_stream.advance(total_len);

        Ok(Some(ControlMessage { control_type, body }))
    }

    async fn handle_message(&mut self, message: ControlMessage) -> crate::Result<()> {
        match message.control_type {
            CTRL_START_CONNECTION_REQUEST => {
                tracing::debug!("pptp {}: start-control-connection", self.peer);
                self.send_message(CTRL_START_CONNECTION_REPLY, &start_reply_body())
                    .await
            }

            CTRL_ECHO_REQUEST => {
                let identifier = read_u32(&message.body, 0)?;
                let mut body = Vec::with_capacity(8);
                body.extend_from_slice(&identifier.to_be_bytes());
                body.push(1); // result: OK
                body.push(0); // error
                body.extend_from_slice(&0u16.to_be_bytes());
                self.send_message(CTRL_ECHO_REPLY, &body).await
            }

            CTRL_OUTGOING_CALL_REQUEST => {
                let peer_call_id = read_u16(&message.body, 0)?;
                self.handle_outgoing_call(peer_call_id).await
            }

            CTRL_CALL_CLEAR_REQUEST => {
                let call_id = read_u16(&message.body, 0)?;
                tracing::info!("pptp {}: clearing call {}", self.peer, call_id);
                if let Some(call) = self.calls.remove(&call_id) {
                    call.cancel();
                }
                Ok(())
            }

            other => {
                tracing::debug!("pptp {}: ignoring control message {}", self.peer, other);
                Ok(())
            }
        }
    }

    async fn handle_outgoing_call(&mut self, peer_call_id: u16) -> crate::Result<()> {
        let IpAddr::V4(peer_ip) = self.peer.ip() else {
            return Err("pptp over ipv6 is not supported".into());
        };

        let call_id = self.allocate_call_id();
        tracing::info!(
            "pptp {}: outgoing call, peer call id {}, local call id {}",
            self.peer,
            peer_call_id,
            call_id
        );

        let gre_session = self.gre.session(peer_ip, peer_call_id, call_id);
        let node = self.network.new_node();
        let call_cancel = self.cancel.child_token();
        self.calls.insert(call_id, call_cancel.clone());

        let session = PppSession::new(Arc::new(gre_session), node, call_cancel);
        tokio::spawn(async move {
            let result = session.run().await;
            tracing::debug!("ppp session stop with {:?}", result);
        });

        self.send_message(CTRL_OUTGOING_CALL_REPLY, &outgoing_call_reply_body(call_id, peer_call_id))
            .await
    }

    fn allocate_call_id(&mut self) -> u16 {
        loop {
            let candidate = self.next_call_id;
            self.next_call_id = self.next_call_id.wrapping_add(1);
            if candidate != 0 && !self.calls.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    async fn send_message(&mut self, control_type: u16, body: &[u8]) -> crate::Result<()> {
        let total_len = (FIXED_HEADER_LEN + body.len()) as u16;
        let mut buf = Vec::with_capacity(total_len as usize);
        buf.extend_from_slice(&total_len.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&control_type.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(body);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Start-Control-Connection-Reply: protocol 1.0, success, fixed
/// capabilities, a single channel, firmware revision 1
fn start_reply_body() -> Vec<u8> {
    let mut body = Vec::with_capacity(148);
    body.extend_from_slice(&0x0100u16.to_be_bytes()); // protocol version
    body.push(1); // result: success
    body.push(0); // error
    body.extend_from_slice(&1u32.to_be_bytes()); // framing: asynchronous
    body.extend_from_slice(&1u32.to_be_bytes()); // bearer: analog
    body.extend_from_slice(&1u16.to_be_bytes()); // maximum channels
    body.extend_from_slice(&1u16.to_be_bytes()); // firmware revision
    body.extend_from_slice(&fixed_string(b"rustipx"));
    body.extend_from_slice(&fixed_string(b""));
    body
}

fn outgoing_call_reply_body(call_id: u16, peer_call_id: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(20);
    body.extend_from_slice(&call_id.to_be_bytes());
    body.extend_from_slice(&peer_call_id.to_be_bytes());
    body.push(1); // result: connected
    body.push(0); // error
    body.extend_from_slice(&0u16.to_be_bytes()); // cause code
    body.extend_from_slice(&10_000_000u32.to_be_bytes()); // connect speed
    body.extend_from_slice(&RECEIVE_WINDOW.to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes()); // processing delay
    body.extend_from_slice(&0u32.to_be_bytes()); // physical channel id
    body
}

/// PPTP carries host and vendor names as fixed 64-byte fields
fn fixed_string(value: &[u8]) -> [u8; 64] {
    let mut buf = [0u8; 64];
    let len = value.len().min(64);
    buf[..len].copy_from_slice(&value[..len]);
    buf
}

fn read_u16(buf: &[u8], offset: usize) -> crate::Result<u16> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| "truncated pptp message body".into())
}

fn read_u32(buf: &[u8], offset: usize) -> crate::Result<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| "truncated pptp message body".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_reply_layout() {
        let body = start_reply_body();
        assert_eq!(body.len(), 2 + 2 + 4 + 4 + 2 + 2 + 64 + 64);
        assert_eq!(&body[0..2], &[0x01, 0x00]);
        assert_eq!(body[2], 1);
        // single channel, firmware 1
        assert_eq!(&body[12..14], &[0, 1]);
        assert_eq!(&body[14..16], &[0, 1]);
        assert_eq!(&body[16..23], b"rustipx");
    }

    #[test]
    fn test_outgoing_call_reply_layout() {
        let body = outgoing_call_reply_body(0x00AB, 0x00CD);
        assert_eq!(&body[0..2], &[0x00, 0xAB]);
        assert_eq!(&body[2..4], &[0x00, 0xCD]);
        assert_eq!(body[4], 1);
        assert_eq!(&body[12..14], &RECEIVE_WINDOW.to_be_bytes());
    }
}
