//! Write-cloning tap decorator
//!
//! Every packet written by any node of the wrapped network is cloned to
//! a set of read-only taps, so an observer can watch all traffic without
//! attaching a forwarding node. Taps never see reads, drop on overflow
//! and close independently.

use crate::codec::ipx::Packet;
use crate::vnet::pipe::Pipe;
use crate::vnet::{NetError, Network, Node, Property};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio_util::sync::CancellationToken;

pub struct TappableNetwork {
    inner: Arc<dyn Network>,
    taps: Arc<RwLock<Vec<TapEntry>>>,
    next_tap_id: AtomicU64,
}

struct TapEntry {
    id: u64,
    pipe: Arc<Pipe>,
}

impl TappableNetwork {
    pub fn new(inner: Arc<dyn Network>) -> Self {
        TappableNetwork {
            inner,
            taps: Arc::new(RwLock::new(Vec::new())),
            next_tap_id: AtomicU64::new(0),
        }
    }

    /// Registers a read-only observer of all writes on this network
    pub fn add_tap(&self) -> Tap {
        let id = self.next_tap_id.fetch_add(1, Ordering::Relaxed);
        let pipe = Pipe::new();
        self.taps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(TapEntry {
                id,
                pipe: pipe.clone(),
            });
        Tap {
            id,
            pipe,
            taps: Arc::downgrade(&self.taps),
        }
    }
}

impl Network for TappableNetwork {
    fn new_node(&self) -> Box<dyn Node> {
        Box::new(TappableNode {
            inner: self.inner.new_node(),
            taps: self.taps.clone(),
        })
    }
}

/// A read-only observer handle
pub struct Tap {
    id: u64,
    pipe: Arc<Pipe>,
    taps: Weak<RwLock<Vec<TapEntry>>>,
}

impl Tap {
    pub async fn read_packet(&self, cancel: &CancellationToken) -> Result<Arc<Packet>, NetError> {
        self.pipe.read(cancel).await
    }

    pub fn close(&self) {
        if let Some(taps) = self.taps.upgrade() {
            taps.write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|entry| entry.id != self.id);
        }
        self.pipe.close();
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct TappableNode {
    inner: Box<dyn Node>,
    taps: Arc<RwLock<Vec<TapEntry>>>,
}

#[async_trait]
impl Node for TappableNode {
    async fn read_packet(&self, cancel: &CancellationToken) -> Result<Arc<Packet>, NetError> {
        self.inner.read_packet(cancel).await
    }

    async fn write_packet(&self, packet: Arc<Packet>) -> Result<(), NetError> {
        {
            let taps = self.taps.read().unwrap_or_else(|e| e.into_inner());
            for entry in taps.iter() {
                // A slow observer loses packets, never slows the network.
                let _ = entry.pipe.write(packet.clone());
            }
        }
        self.inner.write_packet(packet).await
    }

    fn close(&self) {
        self.inner.close();
    }

    fn properties(&self) -> Vec<Property> {
        self.inner.properties()
    }
}
