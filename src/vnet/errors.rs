//! Virtual-network errors

use crate::codec::ipx::Address;
use std::fmt;
use std::fmt::Display;

/// Errors surfaced by pipes, nodes and the switch
///
/// Capacity exhaustion (`Full`, `PartialDelivery`) is the intended
/// backpressure of the whole system: pipes drop rather than block, and a
/// forwarding path treats these as a local skip, not a session kill.
#[derive(Debug, PartialEq, Eq)]
pub enum NetError {
    /// The destination pipe already holds its capacity in packets
    Full,

    /// The pipe or node has been closed
    Closed,

    /// The caller's cancellation token fired while waiting
    Cancelled,

    /// A write carried a source address that does not belong to the node
    WrongSource { expected: Address, found: Address },

    /// The packet uses a denied (NetBIOS) socket
    Filtered(u16),

    /// Some destinations of a flood did not accept the packet; the
    /// remaining destinations still received it
    PartialDelivery { failed: usize, total: usize },
}

impl std::error::Error for NetError {}

impl Display for NetError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetError::Full => "pipe full".fmt(fmt),
            NetError::Closed => "closed".fmt(fmt),
            NetError::Cancelled => "cancelled".fmt(fmt),
            NetError::WrongSource { expected, found } => {
                write!(fmt, "wrong source address {} (node owns {})", found, expected)
            }
            NetError::Filtered(socket) => {
                write!(fmt, "socket {:#06x} is filtered", socket)
            }
            NetError::PartialDelivery { failed, total } => {
                write!(fmt, "dropped by {} of {} destinations", failed, total)
            }
        }
    }
}
