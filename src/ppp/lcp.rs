//! LCP option set
//!
//! The link layer negotiates a single option in each direction: the
//! magic number. We require one from the peer (loopback detection) and
//! send our own random value, which is not up for discussion.

use crate::ppp::negotiator::{NegOption, Negotiator, Validate};
use rand::Rng;

pub const OPT_MAGIC_NUMBER: u8 = 5;

/// Builds the LCP negotiator; returns it along with our magic number
pub fn negotiator() -> (Negotiator, u32) {
    let magic: u32 = rand::rng().random();
    let negotiator = Negotiator::new(
        "lcp",
        vec![NegOption::new(
            OPT_MAGIC_NUMBER,
            Some(magic.to_be_bytes().to_vec()),
            Validate::NonNegotiable,
        )],
        vec![NegOption::new(OPT_MAGIC_NUMBER, None, Validate::Required)],
    );
    (negotiator, magic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ppp::negotiator::{
        CODE_CONFIGURE_ACK, CODE_CONFIGURE_REQUEST, CpFrame, CpOption, encode_options,
        parse_options,
    };
    use std::time::Instant;

    #[test]
    fn test_converges_against_cooperating_peer() {
        let (mut ours, magic) = negotiator();
        let now = Instant::now();

        let request = ours.poll(now).remove(0);
        let options = parse_options(&request.data).unwrap();
        assert_eq!(options[0].code, OPT_MAGIC_NUMBER);
        assert_eq!(options[0].value, magic.to_be_bytes().to_vec());

        // Peer acks ours and requests its own magic.
        ours.handle(
            &CpFrame::new(CODE_CONFIGURE_ACK, request.identifier, request.data),
            now,
        )
        .unwrap();
        let peer_request = CpFrame::new(
            CODE_CONFIGURE_REQUEST,
            1,
            encode_options(&[CpOption {
                code: OPT_MAGIC_NUMBER,
                value: vec![1, 2, 3, 4],
            }]),
        );
        let replies = ours.handle(&peer_request, now).unwrap();
        assert_eq!(replies[0].code, CODE_CONFIGURE_ACK);
        assert!(ours.done());
        assert_eq!(
            ours.remote_value(OPT_MAGIC_NUMBER),
            Some([1, 2, 3, 4].as_slice())
        );
    }
}
