//! Virtual IPX switch
//!
//! The switch behaves like an Ethernet learning switch: every write
//! records the source address in a learning table, broadcasts flood to
//! all other nodes, known unicast destinations get a single delivery,
//! and unknown destinations fall back to flooding. Within one
//! destination pipe FIFO order is preserved; across nodes no global
//! ordering is guaranteed.

use crate::codec::ipx::{Address, Packet};
use crate::vnet::pipe::Pipe;
use crate::vnet::{NetError, Network, Node, Property};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct Switch {
    me: Weak<Switch>,
    state: RwLock<SwitchState>,
}

struct SwitchState {
    /// node id -> inbound pipe
    ports: HashMap<u64, Arc<Pipe>>,

    /// learned source address -> owning node
    ///
    /// An address is owned by at most one node at a time; re-learning
    /// migrates ownership atomically under the write lock.
    learned: HashMap<Address, Learned>,

    next_id: u64,
}

struct Learned {
    node: u64,
    #[allow(dead_code)]
    since: Instant,
}

impl Switch {
    pub fn new() -> Arc<Switch> {
        Arc::new_cyclic(|me| Switch {
            me: me.clone(),
            state: RwLock::new(SwitchState {
                ports: HashMap::new(),
                learned: HashMap::new(),
                next_id: 0,
            }),
        })
    }

    /// Number of attached nodes
    pub fn node_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .ports
            .len()
    }

    fn forward(&self, src: u64, packet: Arc<Packet>) -> Result<(), NetError> {
        self.learn(src, packet.header.src.addr);

        let dests: Vec<Arc<Pipe>> = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if packet.header.is_broadcast() {
                state.flood_from(src)
            } else {
                match state.learned.get(&packet.header.dest.addr) {
                    Some(learned) => match state.ports.get(&learned.node) {
                        Some(pipe) => vec![pipe.clone()],
                        None => state.flood_from(src),
                    },
                    None => state.flood_from(src),
                }
            }
        };

        let total = dests.len();
        let mut failed = 0;
        for pipe in dests {
            if pipe.write(packet.clone()).is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            Err(NetError::PartialDelivery { failed, total })
        } else {
            Ok(())
        }
    }

    fn learn(&self, node: u64, addr: Address) {
        if addr.is_null() || addr.is_broadcast() {
            return;
        }

        let already = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state.learned.get(&addr).map(|l| l.node) == Some(node)
        };
        if already {
            return;
        }

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        tracing::debug!("learned address {} on node {}", addr, node);
        state.learned.insert(
            addr,
            Learned {
                node,
                since: Instant::now(),
            },
        );
    }

    fn close_node(&self, id: u64) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(pipe) = state.ports.remove(&id) {
            state.learned.retain(|_, learned| learned.node != id);
            pipe.close();
            tracing::debug!("closed node {}", id);
        }
    }
}

impl SwitchState {
    fn flood_from(&self, src: u64) -> Vec<Arc<Pipe>> {
        self.ports
            .iter()
            .filter(|(id, _)| **id != src)
            .map(|(_, pipe)| pipe.clone())
            .collect()
    }
}

impl Network for Switch {
    fn new_node(&self) -> Box<dyn Node> {
        let pipe = Pipe::new();
        let id = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let id = state.next_id;
            state.next_id += 1;
            state.ports.insert(id, pipe.clone());
            id
        };
        tracing::debug!("new node {}", id);
        Box::new(SwitchNode {
            id,
            switch: self.me.clone(),
            pipe,
        })
    }
}

/// One attachment point on the switch
///
/// The switch reference is a relation for lookup only, never ownership,
/// so the node holds it weakly.
pub struct SwitchNode {
    id: u64,
    switch: Weak<Switch>,
    pipe: Arc<Pipe>,
}

#[async_trait]
impl Node for SwitchNode {
    async fn read_packet(&self, cancel: &CancellationToken) -> Result<Arc<Packet>, NetError> {
        self.pipe.read(cancel).await
    }

    async fn write_packet(&self, packet: Arc<Packet>) -> Result<(), NetError> {
        match self.switch.upgrade() {
            Some(switch) => switch.forward(self.id, packet),
            None => Err(NetError::Closed),
        }
    }

    fn close(&self) {
        match self.switch.upgrade() {
            Some(switch) => switch.close_node(self.id),
            None => self.pipe.close(),
        }
    }

    fn properties(&self) -> Vec<Property> {
        Vec::new()
    }
}

impl Drop for SwitchNode {
    fn drop(&mut self) {
        self.close();
    }
}
