//! Integration tests for the DOSBox UDP protocol
//!
//! Covered scenarios:
//! 1. Two clients register and exchange a broadcast packet
//! 2. A silent client is pinged; its echo is not propagated as data
//! 3. NetBIOS traffic is dropped with filtering on, forwarded with it off
//! 4. Uplink authentication: wrong solution rejected, correct one admits
//!    traffic with arbitrary source addresses
//!
//! All tests run a real server on a loopback UDP socket.

use rustipx::codec::ipx::{
    Address, HEADER_LENGTH, Header, HeaderAddr, Packet, REGISTRATION_SOCKET,
};
use rustipx::server::config::ServerConfig;
use rustipx::server::dosbox::PING_REPLY_ADDRESS;
use rustipx::server::server::Server;
use rustipx::server::uplink::{
    MSG_GET_CHALLENGE_REQUEST, MSG_GET_CHALLENGE_RESPONSE, MSG_SUBMIT_SOLUTION,
    MSG_SUBMIT_SOLUTION_ACCEPTED, MSG_SUBMIT_SOLUTION_REJECTED, UPLINK_ADDRESS, UplinkMessage,
    solve_challenge,
};
use rustipx::vnet::Network;
use rustipx::vnet::addressable::AddressableNetwork;
use rustipx::vnet::filter::FilterNetwork;
use rustipx::vnet::stats::StatsNetwork;
use rustipx::vnet::switch::Switch;
use rustipx::vnet::tap::TappableNetwork;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Helper: start a server on a loopback socket with the full decorator
/// stack, returning its address and the shutdown token
async fn start_server(
    netbios_filter: bool,
    keepalive_secs: u64,
    uplink_password: Option<&str>,
) -> (SocketAddr, CancellationToken) {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        client_timeout_secs: 600,
        keepalive_interval_secs: keepalive_secs,
        enable_netbios_filter: netbios_filter,
        uplink_password: uplink_password.map(str::to_string),
    };

    let switch = Switch::new();
    let base: Arc<dyn Network> = if netbios_filter {
        Arc::new(FilterNetwork::new(switch.clone()))
    } else {
        switch.clone()
    };
    let network: Arc<dyn Network> = Arc::new(TappableNetwork::new(Arc::new(StatsNetwork::new(
        Arc::new(AddressableNetwork::new(base.clone())),
    ))));
    let uplink_network: Arc<dyn Network> =
        Arc::new(TappableNetwork::new(Arc::new(StatsNetwork::new(base))));

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = Server::new(config, network, uplink_network);
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = server.serve(socket, server_cancel).await;
    });
    (addr, cancel)
}

fn registration_request() -> Vec<u8> {
    Packet::new(
        Header {
            checksum: 0xFFFF,
            length: HEADER_LENGTH as u16,
            dest: HeaderAddr {
                network: [0; 4],
                addr: Address::NULL,
                socket: REGISTRATION_SOCKET,
            },
            src: HeaderAddr {
                network: [0; 4],
                addr: Address::NULL,
                socket: REGISTRATION_SOCKET,
            },
            ..Default::default()
        },
        Vec::new(),
    )
    .encode()
}

fn data_packet(src: Address, dest: Address, socket: u16, payload: &[u8]) -> Vec<u8> {
    Packet::new(
        Header {
            checksum: 0xFFFF,
            length: (HEADER_LENGTH + payload.len()) as u16,
            dest: HeaderAddr {
                network: [0; 4],
                addr: dest,
                socket,
            },
            src: HeaderAddr {
                network: [0; 4],
                addr: src,
                socket,
            },
            ..Default::default()
        },
        payload.to_vec(),
    )
    .encode()
}

/// Helper: receive and decode one IPX packet
async fn recv_packet(socket: &UdpSocket) -> Packet {
    let mut buf = vec![0u8; 2048];
    let (len, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a packet")
        .expect("recv failed");
    Packet::decode(&buf[..len]).expect("malformed packet from server")
}

async fn expect_silence(socket: &UdpSocket, wait: Duration) {
    let mut buf = vec![0u8; 2048];
    if let Ok(received) = timeout(wait, socket.recv_from(&mut buf)).await {
        let (len, _) = received.expect("recv failed");
        let packet = Packet::decode(&buf[..len]).unwrap();
        panic!("expected silence, got {}", packet);
    }
}

/// Helper: run the registration handshake, returning the assigned address
async fn register(socket: &UdpSocket, server: SocketAddr) -> Address {
    socket
        .send_to(&registration_request(), server)
        .await
        .unwrap();
    let reply = recv_packet(socket).await;
    assert_eq!(reply.header.checksum, 0xFFFF);
    assert_eq!(reply.header.dest.socket, REGISTRATION_SOCKET);
    assert_eq!(reply.header.src.network, [0, 0, 0, 1]);
    assert_eq!(reply.header.src.addr, Address::BROADCAST);
    assert_eq!(reply.header.src.socket, REGISTRATION_SOCKET);

    let assigned = reply.header.dest.addr;
    assert_eq!(assigned.0[0], 0x02, "assigned address {} not locally administered", assigned);
    assigned
}

#[tokio::test]
async fn test_two_clients_exchange_broadcast() {
    let (server, cancel) = start_server(true, 60, None).await;
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let addr_a = register(&a, server).await;
    let addr_b = register(&b, server).await;
    assert_ne!(addr_a, addr_b);

    let sent = data_packet(addr_a, Address::BROADCAST, 0x4002, b"hello from a");
    a.send_to(&sent, server).await.unwrap();

    let received = recv_packet(&b).await;
    assert_eq!(received.encode(), sent, "packet must arrive byte-for-byte");

    // Exactly once, and never echoed back to the sender.
    expect_silence(&b, Duration::from_millis(300)).await;
    expect_silence(&a, Duration::from_millis(300)).await;

    cancel.cancel();
}

#[tokio::test]
async fn test_silent_client_is_pinged() {
    let (server, cancel) = start_server(true, 1, None).await;
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr_a = register(&a, server).await;

    // Stay silent for two keepalive periods; a ping must arrive.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let ping = loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no ping within two keepalive periods"
        );
        let packet = recv_packet(&a).await;
        if packet.header.src.addr == PING_REPLY_ADDRESS {
            break packet;
        }
    };
    assert_eq!(ping.header.dest.addr, Address::BROADCAST);
    assert_eq!(ping.header.dest.socket, 2);

    // The echo reply is consumed by the server, not forwarded as data.
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let _addr_b = register(&b, server).await;
    let echo = data_packet(addr_a, PING_REPLY_ADDRESS, 2, &[]);
    a.send_to(&echo, server).await.unwrap();

    // b sees server pings at most, never a's echo.
    let mut buf = vec![0u8; 2048];
    for _ in 0..3 {
        if let Ok(received) = timeout(Duration::from_millis(500), b.recv_from(&mut buf)).await {
            let (len, _) = received.unwrap();
            let packet = Packet::decode(&buf[..len]).unwrap();
            assert_ne!(
                packet.header.src.addr, addr_a,
                "keepalive echo was propagated as data"
            );
        }
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_netbios_filtering() {
    // Filtering on: the packet disappears, the sender sees no error.
    let (server, cancel) = start_server(true, 60, None).await;
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr_a = register(&a, server).await;
    let _addr_b = register(&b, server).await;

    let netbios = data_packet(addr_a, Address::BROADCAST, 0x0455, b"smb");
    a.send_to(&netbios, server).await.unwrap();
    expect_silence(&b, Duration::from_millis(400)).await;
    cancel.cancel();

    // Filtering off: the same packet is forwarded.
    let (server, cancel) = start_server(false, 60, None).await;
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr_a = register(&a, server).await;
    let _addr_b = register(&b, server).await;

    let netbios = data_packet(addr_a, Address::BROADCAST, 0x0455, b"smb");
    a.send_to(&netbios, server).await.unwrap();
    let received = recv_packet(&b).await;
    assert_eq!(received.header.dest.socket, 0x0455);
    cancel.cancel();
}

fn uplink_control(message: &UplinkMessage) -> Vec<u8> {
    let payload = serde_json::to_vec(message).unwrap();
    Packet::new(
        Header {
            checksum: 0xFFFF,
            length: (HEADER_LENGTH + payload.len()) as u16,
            dest: HeaderAddr {
                network: [0; 4],
                addr: UPLINK_ADDRESS,
                socket: 0,
            },
            src: HeaderAddr {
                network: [0; 4],
                addr: Address::NULL,
                socket: 0,
            },
            ..Default::default()
        },
        payload,
    )
    .encode()
}

async fn recv_uplink_message(socket: &UdpSocket) -> UplinkMessage {
    let packet = recv_packet(socket).await;
    assert_eq!(packet.header.dest.addr, UPLINK_ADDRESS);
    serde_json::from_slice(&packet.payload).expect("malformed uplink control payload")
}

async fn fetch_challenge(socket: &UdpSocket, server: SocketAddr) -> Vec<u8> {
    let request = UplinkMessage {
        message_type: MSG_GET_CHALLENGE_REQUEST.to_string(),
        challenge: None,
        solution: None,
    };
    socket.send_to(&uplink_control(&request), server).await.unwrap();
    let response = recv_uplink_message(socket).await;
    assert_eq!(response.message_type, MSG_GET_CHALLENGE_RESPONSE);
    let challenge = response.challenge.expect("challenge missing");
    assert!(challenge.len() >= 64);
    challenge
}

#[tokio::test]
async fn test_uplink_rejects_wrong_solution_then_admits() {
    let password = "swordfish";
    let (server, cancel) = start_server(true, 60, Some(password)).await;

    // A wrong solution is rejected.
    let bad = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_challenge = fetch_challenge(&bad, server).await;
    let submit = UplinkMessage {
        message_type: MSG_SUBMIT_SOLUTION.to_string(),
        challenge: Some(vec![0x55; 64]),
        solution: Some(solve_challenge("client", "wrong password", &server_challenge)),
    };
    bad.send_to(&uplink_control(&submit), server).await.unwrap();
    let response = recv_uplink_message(&bad).await;
    assert_eq!(response.message_type, MSG_SUBMIT_SOLUTION_REJECTED);

    // Reconnect with the correct password.
    let uplink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_challenge = fetch_challenge(&uplink, server).await;
    let client_challenge = vec![0xA7; 64];
    let submit = UplinkMessage {
        message_type: MSG_SUBMIT_SOLUTION.to_string(),
        challenge: Some(client_challenge.clone()),
        solution: Some(solve_challenge("client", password, &server_challenge)),
    };
    uplink
        .send_to(&uplink_control(&submit), server)
        .await
        .unwrap();
    let response = recv_uplink_message(&uplink).await;
    assert_eq!(response.message_type, MSG_SUBMIT_SOLUTION_ACCEPTED);
    // Mutual authentication: the server proves it knows the password too.
    assert_eq!(
        response.solution.expect("server solution missing"),
        solve_challenge("server", password, &client_challenge)
    );

    // Traffic now flows, with a source address that was never assigned:
    // the uplink speaks for a whole remote network.
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let _addr = register(&client, server).await;

    let remote_src = Address([0x02, 0x99, 0x99, 0x99, 0x99, 0x99]);
    let sent = data_packet(remote_src, Address::BROADCAST, 0x4002, b"via uplink");
    uplink.send_to(&sent, server).await.unwrap();

    let received = recv_packet(&client).await;
    assert_eq!(received.encode(), sent);

    cancel.cancel();
}
