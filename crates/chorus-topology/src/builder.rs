//! Randomized overlay construction.
//!
//! A build runs in attempts. Each attempt lays a ring through the vertices in
//! id order (which makes the graph connected), then raises every vertex to
//! the minimum degree with random edges that never push a target past the
//! maximum. An attempt that leaves any vertex short is thrown away and the
//! next attempt starts from scratch with the same vertices.

use std::ops::RangeInclusive;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Result, TopologyError};
use crate::graph::NetworkMap;
use crate::PeerAddress;

/// Default cap on whole-graph construction attempts.
pub const DEFAULT_MAX_ATTEMPTS: usize = 1000;

/// Knobs for overlay construction.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Whole-graph attempts before giving up.
    pub max_attempts: usize,
    /// Uniform range for edge costs.
    pub cost_range: RangeInclusive<u32>,
    /// Uniform range for per-vertex device counts.
    pub device_range: RangeInclusive<u32>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cost_range: crate::EDGE_COST_RANGE.0..=crate::EDGE_COST_RANGE.1,
            device_range: 3..=30,
        }
    }
}

/// Check a degree band against a vertex count.
///
/// The band must be non-empty and non-zero at the bottom, every vertex must be
/// able to reach the maximum without a self-loop, more than two vertices need
/// a maximum of at least two to stay connected, and `min × n` must be even.
pub fn validate_request(vertex_count: usize, min_degree: usize, max_degree: usize) -> Result<()> {
    let reject = |reason: String| Err(TopologyError::InvalidTopologyRequest(reason));

    if min_degree < 1 {
        return reject("minimum degree must be at least 1".into());
    }
    if min_degree > max_degree {
        return reject(format!(
            "minimum degree {} exceeds maximum degree {}",
            min_degree, max_degree
        ));
    }
    if max_degree >= vertex_count {
        return reject(format!(
            "maximum degree {} needs more than {} vertices",
            max_degree, vertex_count
        ));
    }
    if vertex_count > 2 && max_degree < 2 {
        return reject(format!(
            "{} vertices cannot be connected with maximum degree {}",
            vertex_count, max_degree
        ));
    }
    if (min_degree * vertex_count) % 2 != 0 {
        return reject(format!(
            "minimum degree {} times {} vertices is odd",
            min_degree, vertex_count
        ));
    }
    Ok(())
}

/// Builds random degree-bounded overlays.
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    config: BuilderConfig,
}

impl TopologyBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Build an overlay over the given peers using the thread RNG.
    pub fn build(
        &self,
        peers: &[PeerAddress],
        min_degree: usize,
        max_degree: usize,
    ) -> Result<NetworkMap> {
        self.build_with_rng(peers, min_degree, max_degree, &mut rand::thread_rng())
    }

    /// Build an overlay over `count` synthetic identities `vertex:1025`,
    /// `vertex:1026`, and so on.
    pub fn build_synthetic<R: Rng + ?Sized>(
        &self,
        count: usize,
        min_degree: usize,
        max_degree: usize,
        rng: &mut R,
    ) -> Result<NetworkMap> {
        let peers: Vec<PeerAddress> = (0..count)
            .map(|i| PeerAddress::new("vertex", 1025u16.wrapping_add(i as u16)))
            .collect();
        self.build_with_rng(&peers, min_degree, max_degree, rng)
    }

    /// Build an overlay over the given peers. Peer order fixes vertex ids.
    pub fn build_with_rng<R: Rng + ?Sized>(
        &self,
        peers: &[PeerAddress],
        min_degree: usize,
        max_degree: usize,
        rng: &mut R,
    ) -> Result<NetworkMap> {
        let peers: Vec<(PeerAddress, u32)> = peers
            .iter()
            .map(|p| (p.clone(), rng.gen_range(self.config.device_range.clone())))
            .collect();
        self.build_with_devices(&peers, min_degree, max_degree, rng)
    }

    /// Build an overlay over peers whose device counts are already known.
    pub fn build_with_devices<R: Rng + ?Sized>(
        &self,
        peers: &[(PeerAddress, u32)],
        min_degree: usize,
        max_degree: usize,
        rng: &mut R,
    ) -> Result<NetworkMap> {
        validate_request(peers.len(), min_degree, max_degree)?;

        for attempt in 1..=self.config.max_attempts {
            let mut map = NetworkMap::new(min_degree, max_degree);
            for (id, (peer, count)) in peers.iter().enumerate() {
                map.add_vertex(id, peer.clone(), *count)?;
            }

            self.seed_ring(&mut map, rng)?;
            self.fill(&mut map, rng)?;

            match map.verify() {
                Ok(()) => {
                    debug!(
                        vertices = map.len(),
                        edges = map.edge_count(),
                        attempt,
                        "Overlay constructed"
                    );
                    return Ok(map);
                }
                Err(e) => debug!(attempt, error = %e, "Discarding overlay attempt"),
            }
        }

        warn!(
            attempts = self.config.max_attempts,
            min_degree, max_degree, "Overlay construction gave up"
        );
        Err(TopologyError::ConstructionFailed {
            attempts: self.config.max_attempts,
        })
    }

    /// Ring through the vertices in id order. With two vertices the closing
    /// edge would duplicate the only edge, so it is skipped.
    fn seed_ring<R: Rng + ?Sized>(&self, map: &mut NetworkMap, rng: &mut R) -> Result<()> {
        let n = map.len();
        for i in 1..n {
            map.connect(i - 1, i, rng.gen_range(self.config.cost_range.clone()))?;
        }
        if n > 2 {
            map.connect(n - 1, 0, rng.gen_range(self.config.cost_range.clone()))?;
        }
        Ok(())
    }

    /// Raise each vertex toward the minimum degree with random edges.
    fn fill<R: Rng + ?Sized>(&self, map: &mut NetworkMap, rng: &mut R) -> Result<()> {
        let n = map.len();
        let min = map.min_degree();
        let max = map.max_degree();
        let budget = min * n * 10;

        for source in 0..n {
            let mut tries = 0;
            while degree(map, source) < min && tries < budget {
                tries += 1;
                let target = rng.gen_range(0..n);
                if target == source
                    || map.is_connected(source, target)
                    || degree(map, target) >= max
                {
                    continue;
                }
                map.connect(source, target, rng.gen_range(self.config.cost_range.clone()))?;
            }
        }
        Ok(())
    }
}

fn degree(map: &NetworkMap, idx: usize) -> usize {
    map.vertex(idx).map_or(0, |v| v.degree())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn peers(n: usize) -> Vec<PeerAddress> {
        (0..n).map(|i| PeerAddress::new("10.0.0.1", 4000 + i as u16)).collect()
    }

    #[test]
    fn validation_rules() {
        assert!(validate_request(10, 0, 3).is_err());
        assert!(validate_request(10, 4, 3).is_err());
        assert!(validate_request(3, 2, 3).is_err());
        assert!(validate_request(5, 3, 4).is_err());
        assert!(validate_request(5, 2, 4).is_ok());
        assert!(validate_request(2, 1, 1).is_ok());
        assert!(validate_request(4, 1, 1).is_err());
    }

    #[test]
    fn degree_band_must_fit_vertex_count() {
        let builder = TopologyBuilder::default();
        let err = builder.build(&peers(3), 4, 4).unwrap_err();
        assert!(matches!(err, TopologyError::InvalidTopologyRequest(_)));
    }

    #[test]
    fn four_peers_two_regular() {
        let mut rng = StdRng::seed_from_u64(7);
        let map = TopologyBuilder::default()
            .build_with_rng(&peers(4), 2, 2, &mut rng)
            .unwrap();
        assert_eq!(map.edge_count(), 4);
        assert!(map.vertices().iter().all(|v| v.degree() == 2));
        assert!(map.is_fully_reachable());
    }

    #[test]
    fn two_peers_single_edge() {
        let mut rng = StdRng::seed_from_u64(1);
        let map = TopologyBuilder::default()
            .build_with_rng(&peers(2), 1, 1, &mut rng)
            .unwrap();
        assert_eq!(map.edge_count(), 1);
    }

    #[test]
    fn known_device_counts_are_kept() {
        let mut rng = StdRng::seed_from_u64(9);
        let known: Vec<(PeerAddress, u32)> = peers(6)
            .into_iter()
            .zip([4, 8, 15, 16, 23, 42])
            .collect();
        let map = TopologyBuilder::default()
            .build_with_devices(&known, 2, 3, &mut rng)
            .unwrap();
        let counts: Vec<u32> = map.vertices().iter().map(|v| v.device_count).collect();
        assert_eq!(counts, vec![4, 8, 15, 16, 23, 42]);
    }

    #[test]
    fn costs_and_devices_in_range() {
        let mut rng = StdRng::seed_from_u64(42);
        let map = TopologyBuilder::default()
            .build_synthetic(20, 3, 5, &mut rng)
            .unwrap();
        for v in map.vertices() {
            assert!((3..=30).contains(&v.device_count));
            for (_, cost) in v.edges() {
                assert!((1..=10).contains(cost));
            }
        }
        assert_eq!(map.vertices()[0].identity, PeerAddress::new("vertex", 1025));
    }

    #[test]
    fn every_edge_initiated_exactly_once() {
        let mut rng = StdRng::seed_from_u64(3);
        let map = TopologyBuilder::default()
            .build_synthetic(12, 2, 4, &mut rng)
            .unwrap();
        let initiated: usize = map
            .vertices()
            .iter()
            .map(|v| map.connection_initiation_list(&v.identity).unwrap().len())
            .sum();
        assert_eq!(initiated, map.edge_count());
    }

    #[test]
    fn attempt_cap_reports_failure() {
        let builder = TopologyBuilder::new(BuilderConfig {
            max_attempts: 0,
            ..BuilderConfig::default()
        });
        let err = builder.build(&peers(4), 2, 2).unwrap_err();
        assert!(matches!(err, TopologyError::ConstructionFailed { attempts: 0 }));
    }

    proptest! {
        #[test]
        fn built_overlays_satisfy_band(
            n in 4usize..40,
            min in 1usize..4,
            extra in 0usize..3,
            seed in any::<u64>(),
        ) {
            let max = (min + extra).min(n - 1);
            prop_assume!(min <= max && max >= 2);
            prop_assume!((min * n) % 2 == 0);

            let mut rng = StdRng::seed_from_u64(seed);
            let map = TopologyBuilder::default()
                .build_synthetic(n, min, max, &mut rng)
                .unwrap();

            prop_assert_eq!(map.len(), n);
            prop_assert!(map.is_fully_reachable());
            for v in map.vertices() {
                prop_assert!(v.degree() >= min && v.degree() <= max);
            }
        }
    }
}
