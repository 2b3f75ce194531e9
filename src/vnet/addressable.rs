//! Address-assigning network decorator
//!
//! Wraps a network so every new node gets a random locally-administered
//! unicast address (first octet 0x02). Reads drop packets destined to
//! other nodes; writes must carry the node's own address as source.

use crate::codec::ipx::{Address, Packet};
use crate::vnet::{NetError, Network, Node, Property};
use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub struct AddressableNetwork {
    inner: Arc<dyn Network>,
    assigned: Arc<Mutex<HashSet<Address>>>,
}

impl AddressableNetwork {
    pub fn new(inner: Arc<dyn Network>) -> Self {
        AddressableNetwork {
            inner,
            assigned: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

fn random_address() -> Address {
    let mut bytes = [0u8; 6];
    rand::rng().fill_bytes(&mut bytes);
    // Locally administered unicast.
    bytes[0] = 0x02;
    Address(bytes)
}

impl Network for AddressableNetwork {
    fn new_node(&self) -> Box<dyn Node> {
        let address = {
            let mut assigned = self.assigned.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                let candidate = random_address();
                if assigned.insert(candidate) {
                    break candidate;
                }
            }
        };
        tracing::debug!("assigned address {}", address);

        Box::new(AddressableNode {
            inner: self.inner.new_node(),
            address,
            assigned: self.assigned.clone(),
        })
    }
}

pub struct AddressableNode {
    inner: Box<dyn Node>,
    address: Address,
    assigned: Arc<Mutex<HashSet<Address>>>,
}

#[async_trait]
impl Node for AddressableNode {
    async fn read_packet(&self, cancel: &CancellationToken) -> Result<Arc<Packet>, NetError> {
        loop {
            let packet = self.inner.read_packet(cancel).await?;
            let dest = packet.header.dest.addr;
            if dest == self.address || dest.is_broadcast() {
                return Ok(packet);
            }
            tracing::trace!("node {} skipping packet for {}", self.address, dest);
        }
    }

    async fn write_packet(&self, packet: Arc<Packet>) -> Result<(), NetError> {
        let src = packet.header.src.addr;
        if src != self.address {
            return Err(NetError::WrongSource {
                expected: self.address,
                found: src,
            });
        }
        self.inner.write_packet(packet).await
    }

    fn close(&self) {
        self.assigned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.address);
        self.inner.close();
    }

    fn properties(&self) -> Vec<Property> {
        let mut properties = vec![Property::Address(self.address)];
        properties.extend(self.inner.properties());
        properties
    }
}

impl Drop for AddressableNode {
    fn drop(&mut self) {
        self.assigned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.address);
    }
}
