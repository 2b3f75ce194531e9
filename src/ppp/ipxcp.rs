//! IPXCP option set
//!
//! The network layer hands the peer its IPX identity. The node address
//! assigned by the virtual network is the peer's `ipx-node` value and
//! is not negotiable: whatever the peer asks for, it gets naked back to
//! the assigned address until it agrees. Our own network/node options
//! are offered as zero and withdrawn when the peer rejects them.

use crate::codec::ipx::Address;
use crate::ppp::negotiator::{NegOption, Negotiator, Validate};

pub const OPT_IPX_NETWORK: u8 = 1;
pub const OPT_IPX_NODE: u8 = 2;

/// Builds the IPXCP negotiator for a peer assigned `node_addr`
pub fn negotiator(node_addr: Address) -> Negotiator {
    Negotiator::new(
        "ipxcp",
        vec![
            NegOption::new(OPT_IPX_NETWORK, Some(vec![0; 4]), Validate::Any),
            NegOption::new(OPT_IPX_NODE, Some(vec![0; 6]), Validate::Any),
        ],
        vec![
            NegOption::new(OPT_IPX_NETWORK, None, Validate::Any),
            NegOption::new(
                OPT_IPX_NODE,
                Some(node_addr.0.to_vec()),
                Validate::NonNegotiable,
            ),
        ],
    )
}
