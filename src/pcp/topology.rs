//! Topology predicates for the three PCP handlers (§4.6). Per §9, these
//! collapse to a handful of predicates dispatched in the controller rather
//! than a virtual class hierarchy per strategy.

use crate::options::Strategy;

/// Whether the advertiser side of `strategy` may accept one more
/// established connection, given how many it already has.
#[must_use]
pub fn advertiser_accepts_more(strategy: Strategy, established_count: usize) -> bool {
    match strategy.advertiser_connection_limit() {
        Some(limit) => established_count < limit,
        None => true,
    }
}

/// Whether the discoverer side of `strategy` may request one more outbound
/// connection, given how many it already has pending or established.
#[must_use]
pub fn discoverer_accepts_outbound(strategy: Strategy, outbound_count: usize) -> bool {
    match strategy.discoverer_connection_limit() {
        Some(limit) => outbound_count < limit,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_has_no_limit() {
        assert!(advertiser_accepts_more(Strategy::P2pCluster, 1_000));
        assert!(discoverer_accepts_outbound(Strategy::P2pCluster, 1_000));
    }

    #[test]
    fn star_limits_only_the_discoverer() {
        assert!(advertiser_accepts_more(Strategy::P2pStar, 1_000));
        assert!(discoverer_accepts_outbound(Strategy::P2pStar, 0));
        assert!(!discoverer_accepts_outbound(Strategy::P2pStar, 1));
    }

    #[test]
    fn point_to_point_limits_both_sides() {
        assert!(advertiser_accepts_more(Strategy::P2pPointToPoint, 0));
        assert!(!advertiser_accepts_more(Strategy::P2pPointToPoint, 1));
        assert!(discoverer_accepts_outbound(Strategy::P2pPointToPoint, 0));
        assert!(!discoverer_accepts_outbound(Strategy::P2pPointToPoint, 1));
    }
}
