//! Chorus Overlay Topology
//!
//! Random, degree-bounded, connected overlay graphs over a set of peers.
//!
//! # Construction
//!
//! [`TopologyBuilder`] lays a ring through the vertices in id order, then adds
//! random edges until every vertex reaches the minimum degree without any
//! vertex passing the maximum. Attempts that fall short are discarded and
//! retried up to [`BuilderConfig::max_attempts`].
//!
//! # Connection initiation
//!
//! Every edge is dialed by exactly one side: the vertex with the lower id.
//! [`NetworkMap::connection_initiation_list`] returns that side's share.
//!
//! # Files
//!
//! Overlays export to and import from a CSV edge list, and can be retargeted
//! onto a fresh set of peers while keeping their shape.

mod address;
mod builder;
mod error;
mod export;
mod graph;

pub use address::PeerAddress;
pub use builder::{validate_request, BuilderConfig, TopologyBuilder, DEFAULT_MAX_ATTEMPTS};
pub use error::{Result, TopologyError};
pub use graph::{Edge, EdgeEnd, NetworkMap, Vertex, VertexId};

/// Inclusive bounds of the uniform edge cost.
pub const EDGE_COST_RANGE: (u32, u32) = (1, 10);

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn default_costs_match_published_range() {
        let cfg = BuilderConfig::default();
        assert_eq!(
            (*cfg.cost_range.start(), *cfg.cost_range.end()),
            EDGE_COST_RANGE
        );
    }

    #[test]
    fn single_four_cycle() {
        let peers: Vec<PeerAddress> = ["a:1", "b:1", "c:1", "d:1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let mut rng = StdRng::seed_from_u64(0);
        let map = TopologyBuilder::default()
            .build_with_rng(&peers, 2, 2, &mut rng)
            .unwrap();

        // a-b-c-d-a
        assert!(map.is_connected(0, 1));
        assert!(map.is_connected(1, 2));
        assert!(map.is_connected(2, 3));
        assert!(map.is_connected(3, 0));
        assert!(!map.is_connected(0, 2));
        assert!(!map.is_connected(1, 3));
    }
}
