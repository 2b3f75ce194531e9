//! DOSBox UDP server
//!
//! One UDP socket carries all clients; each datagram is exactly one IPX
//! packet. The first packet from an unknown remote address creates a
//! client: an RX pipe, a last-receive timestamp and a worker task
//! running the protocol adapter end-to-end between the UDP side and the
//! virtual-network side. Uplink clients share the same socket; the
//! destination address of the first packet selects the adapter.

use crate::codec::ipx::Packet;
use crate::server::config::ServerConfig;
use crate::server::dosbox::DosboxHandler;
use crate::server::uplink::{UPLINK_ADDRESS, UplinkHandler};
use crate::vnet::Network;
use crate::vnet::pipe::Pipe;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// UDP receive buffer; an IPX packet is a 30-byte header plus at most an
/// Ethernet-sized payload
const BUFFER_SIZE: usize = 2048;

/// Cadence of the idle-client sweep
const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

pub struct Server {
    config: ServerConfig,
    network: Arc<dyn Network>,
    uplink_network: Arc<dyn Network>,
    clients: Arc<Mutex<HashMap<SocketAddr, ClientHandle>>>,
}

struct ClientHandle {
    pipe: Arc<Pipe>,
    last_recv: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

impl Server {
    /// `network` is the full decorator stack used for DOSBox clients;
    /// `uplink_network` is the same stack without the addressable layer,
    /// since an authenticated uplink forwards for a whole network.
    pub fn new(
        config: ServerConfig,
        network: Arc<dyn Network>,
        uplink_network: Arc<dyn Network>,
    ) -> Self {
        Server {
            config,
            network,
            uplink_network,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> crate::Result<()> {
        let socket = UdpSocket::bind(&self.config.listen_addr).await?;
        tracing::info!("IPX relay listening on {}", socket.local_addr()?);
        self.serve(socket, cancel).await
    }

    /// Serves an already-bound socket until cancelled
    pub async fn serve(&self, socket: UdpSocket, cancel: CancellationToken) -> crate::Result<()> {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut check = tokio::time::interval(TIMEOUT_CHECK_INTERVAL);

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, remote) = result?;
                    self.handle_datagram(&socket, &buf[..len], remote, &cancel);
                }

                _ = check.tick() => {
                    self.expire_idle();
                }

                _ = cancel.cancelled() => {
                    break;
                }
            }
        }

        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        for (_, client) in clients.drain() {
            client.cancel.cancel();
            client.pipe.close();
        }
        Ok(())
    }

    fn handle_datagram(
        &self,
        socket: &Arc<UdpSocket>,
        buf: &[u8],
        remote: SocketAddr,
        cancel: &CancellationToken,
    ) {
        let packet = match Packet::decode(buf) {
            Ok(packet) => Arc::new(packet),
            Err(e) => {
                tracing::trace!("dropping malformed datagram from {}: {}", remote, e);
                return;
            }
        };

        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let client = clients
            .entry(remote)
            .or_insert_with(|| self.start_client(socket, remote, &packet, cancel));

        *client.last_recv.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        if let Err(e) = client.pipe.write(packet) {
            tracing::trace!("dropping datagram from {}: {}", remote, e);
        }
    }

    /// Creates the client state and spawns its worker task
    ///
    /// The destination address of the first packet selects the protocol
    /// adapter: `UpLiNk` control traffic gets the authenticated uplink
    /// adapter, everything else the plain DOSBox adapter.
    fn start_client(
        &self,
        socket: &Arc<UdpSocket>,
        remote: SocketAddr,
        first: &Packet,
        root: &CancellationToken,
    ) -> ClientHandle {
        let pipe = Pipe::new();
        let last_recv = Arc::new(Mutex::new(Instant::now()));
        let cancel = root.child_token();
        tracing::info!("new client {}", remote);

        let wants_uplink = first.header.dest.addr == UPLINK_ADDRESS;
        let uplink_password = self.config.uplink_password.clone();
        let keepalive_interval = self.config.keepalive_interval();
        let socket = socket.clone();
        let clients = self.clients.clone();
        let worker_cancel = cancel.clone();
        let worker_pipe = pipe.clone();
        let worker_last_recv = last_recv.clone();
        let network = self.network.clone();
        let uplink_network = self.uplink_network.clone();

        tokio::spawn(async move {
            let result = match (wants_uplink, uplink_password) {
                (true, Some(password)) => {
                    UplinkHandler::new(
                        socket,
                        remote,
                        worker_pipe,
                        worker_last_recv,
                        uplink_network,
                        password,
                        keepalive_interval,
                        worker_cancel.clone(),
                    )
                    .run()
                    .await
                }
                (true, None) => {
                    tracing::info!("rejecting uplink from {}: no password configured", remote);
                    Ok(())
                }
                _ => {
                    DosboxHandler::new(
                        socket,
                        remote,
                        worker_pipe,
                        worker_last_recv,
                        network,
                        keepalive_interval,
                        worker_cancel.clone(),
                    )
                    .run()
                    .await
                }
            };
            tracing::debug!("client {} handler stop with {:?}", remote, result);
            worker_cancel.cancel();
            clients
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&remote);
        });

        ClientHandle {
            pipe,
            last_recv,
            cancel,
        }
    }

    fn expire_idle(&self) {
        let timeout = self.config.client_timeout();
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.retain(|remote, client| {
            let idle = client
                .last_recv
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .elapsed();
            if idle > timeout {
                tracing::info!("client {} timed out after {:?}", remote, idle);
                client.cancel.cancel();
                client.pipe.close();
                false
            } else {
                true
            }
        });
    }
}
