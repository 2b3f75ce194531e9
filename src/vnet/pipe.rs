//! Bounded non-blocking packet pipe
//!
//! Each node owns one pipe for inbound delivery. The buffer protects
//! against brief bursts (a peer-to-peer game sending one packet to each
//! other peer), not against long producer/consumer skew; buffer bloat is
//! explicitly undesirable, so writes drop on overflow instead of
//! blocking.

use crate::codec::ipx::Packet;
use crate::vnet::NetError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Default pipe capacity in packets
pub const DEFAULT_PIPE_CAPACITY: usize = 16;

/// Single-producer/single-consumer FIFO of packet references
pub struct Pipe {
    capacity: usize,
    state: Mutex<PipeState>,
    notify: Notify,
}

struct PipeState {
    queue: VecDeque<Arc<Packet>>,
    closed: bool,
}

impl Pipe {
    pub fn new() -> Arc<Pipe> {
        Self::with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Pipe> {
        Arc::new(Pipe {
            capacity,
            state: Mutex::new(PipeState {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Appends a packet; never blocks
    ///
    /// Returns `Full` when the pipe already holds `capacity` packets and
    /// `Closed` after [`Pipe::close`]. The reference, not a copy, is
    /// enqueued; producers must not mutate the packet after publishing.
    pub fn write(&self, packet: Arc<Packet>) -> Result<(), NetError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return Err(NetError::Closed);
            }
            if state.queue.len() >= self.capacity {
                return Err(NetError::Full);
            }
            state.queue.push_back(packet);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Removes and returns the oldest packet
    ///
    /// Suspends until a packet is available, the pipe is closed
    /// (`Closed`, after draining), or `cancel` fires (`Cancelled`).
    pub async fn read(&self, cancel: &CancellationToken) -> Result<Arc<Packet>, NetError> {
        loop {
            // Register interest before checking state so a write or close
            // racing with the check cannot be missed.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(packet) = state.queue.pop_front() {
                    return Ok(packet);
                }
                if state.closed {
                    return Err(NetError::Closed);
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(NetError::Cancelled),
            }
        }
    }

    /// Closes the pipe; idempotent
    ///
    /// Subsequent writes return `Closed`; readers observe `Closed` once
    /// the queue is drained.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return;
            }
            state.closed = true;
        }
        // A reader that has not registered yet picks up the stored permit.
        self.notify.notify_one();
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    /// Number of packets currently buffered
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
