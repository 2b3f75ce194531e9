//! The virtual IPX network
//!
//! A [`Network`] hands out [`Node`] attachment points. The base
//! implementation is the [`switch::Switch`]; the other modules are
//! decorators that wrap a network and expose the same contract, so the
//! composition is fixed at startup as layers:
//!
//! ```text
//! Tappable -> Stats -> Addressable -> Filter -> Switch
//! ```
//!
//! Packets flow as `Arc<Packet>` references across pipes and decorators;
//! payload bytes are never mutated after publish.

pub mod addressable;
pub mod errors;
pub mod filter;
pub mod pipe;
pub mod stats;
pub mod switch;
pub mod tap;

use crate::codec::ipx::{Address, Packet};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use errors::NetError;

/// An attachment point on a virtual network
///
/// Reads block until a packet is delivered, the node is closed, or the
/// caller's cancellation token fires. Writes never block; overflow and
/// policy failures are surfaced as [`NetError`] values.
#[async_trait]
pub trait Node: Send + Sync {
    /// Reads the next packet delivered to this node
    async fn read_packet(&self, cancel: &CancellationToken) -> Result<Arc<Packet>, NetError>;

    /// Submits a packet from this node to the network
    async fn write_packet(&self, packet: Arc<Packet>) -> Result<(), NetError>;

    /// Detaches the node; idempotent, wakes pending readers with `Closed`
    fn close(&self);

    /// Typed property query (address, statistics)
    fn properties(&self) -> Vec<Property>;
}

/// A network that can mint new attachment points
pub trait Network: Send + Sync {
    fn new_node(&self) -> Box<dyn Node>;
}

/// Typed-variant result of a node property query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    Address(Address),
    Statistics(NodeStats),
}

/// Packet and byte counters for one node, in both directions
///
/// `rx` counts packets delivered to the node, `tx` counts packets the
/// node wrote onto the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// The address assigned to a node, if any layer assigned one
pub fn node_address(node: &dyn Node) -> Option<Address> {
    node.properties().into_iter().find_map(|p| match p {
        Property::Address(addr) => Some(addr),
        _ => None,
    })
}

/// The traffic counters of a node, if any layer keeps them
pub fn node_stats(node: &dyn Node) -> Option<NodeStats> {
    node.properties().into_iter().find_map(|p| match p {
        Property::Statistics(stats) => Some(stats),
        _ => None,
    })
}
