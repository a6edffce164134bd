//! Overlay graph arena.
//!
//! Vertices live in a single `Vec` ordered by id and refer to each other by
//! arena index, so the graph holds no reference cycles and serializes as a
//! flat edge list. Edges are undirected: every edge is stored on both
//! endpoints with the same cost.

use std::collections::{HashMap, VecDeque};

use crate::error::{Result, TopologyError};
use crate::PeerAddress;

/// Position of a vertex in topological order.
pub type VertexId = usize;

/// A peer in the overlay graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vertex {
    /// Topological order; the lower id of an edge always dials.
    pub id: VertexId,
    /// The peer this vertex stands for.
    pub identity: PeerAddress,
    /// Number of simulated devices attached to the peer.
    pub device_count: u32,
    /// Adjacency list of `(arena index, cost)`.
    edges: Vec<(usize, u32)>,
}

impl Vertex {
    /// Create a vertex with no edges.
    pub fn new(id: VertexId, identity: PeerAddress, device_count: u32) -> Self {
        Self {
            id,
            identity,
            device_count,
            edges: Vec::new(),
        }
    }

    /// Number of incident edges.
    pub fn degree(&self) -> usize {
        self.edges.len()
    }

    /// Adjacent vertices with edge costs.
    pub fn edges(&self) -> &[(usize, u32)] {
        &self.edges
    }

    /// Cost of the edge to `other`, if one exists.
    pub fn cost_to(&self, other: usize) -> Option<u32> {
        self.edges
            .iter()
            .find(|(n, _)| *n == other)
            .map(|(_, cost)| *cost)
    }

    /// Sum of all incident edge costs.
    pub fn cost_sum(&self) -> u64 {
        self.edges.iter().map(|(_, cost)| u64::from(*cost)).sum()
    }
}

/// One endpoint of a serialized edge.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EdgeEnd {
    pub id: VertexId,
    pub identity: PeerAddress,
    pub device_count: u32,
}

impl From<&Vertex> for EdgeEnd {
    fn from(v: &Vertex) -> Self {
        Self {
            id: v.id,
            identity: v.identity.clone(),
            device_count: v.device_count,
        }
    }
}

/// A detached edge: the unit of export and import.
///
/// The lower id is listed first. `second` is absent only for a terminal path
/// segment, which contributes its vertex but no connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Edge {
    pub first: EdgeEnd,
    pub second: Option<EdgeEnd>,
    pub cost: u32,
}

/// The overlay: vertices plus the degree band every vertex must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMap {
    vertices: Vec<Vertex>,
    index: HashMap<PeerAddress, usize>,
    min_degree: usize,
    max_degree: usize,
}

impl NetworkMap {
    /// An empty map with the given degree band.
    pub fn new(min_degree: usize, max_degree: usize) -> Self {
        Self {
            vertices: Vec::new(),
            index: HashMap::new(),
            min_degree,
            max_degree,
        }
    }

    /// Rebuild a map from an edge list and verify its degree band.
    pub fn from_edges(min_degree: usize, max_degree: usize, edges: &[Edge]) -> Result<Self> {
        let mut ends: Vec<&EdgeEnd> = edges
            .iter()
            .flat_map(|e| std::iter::once(&e.first).chain(e.second.as_ref()))
            .collect();
        ends.sort_by_key(|end| end.id);
        for pair in ends.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.id == b.id && (a.identity != b.identity || a.device_count != b.device_count) {
                return Err(TopologyError::InvalidTopologyRequest(format!(
                    "vertex {} described as {} with {} devices and as {} with {} devices",
                    a.id, a.identity, a.device_count, b.identity, b.device_count
                )));
            }
        }
        ends.dedup_by_key(|end| end.id);

        let mut map = Self::new(min_degree, max_degree);
        for end in ends {
            map.add_vertex(end.id, end.identity.clone(), end.device_count)?;
        }

        let position: HashMap<VertexId, usize> = map
            .vertices
            .iter()
            .enumerate()
            .map(|(idx, v)| (v.id, idx))
            .collect();

        for edge in edges {
            let Some(second) = &edge.second else { continue };
            let a = position[&edge.first.id];
            let b = position[&second.id];
            map.connect(a, b, edge.cost)?;
        }

        map.verify()?;
        Ok(map)
    }

    /// Append a vertex. Ids must be added in increasing order.
    pub(crate) fn add_vertex(
        &mut self,
        id: VertexId,
        identity: PeerAddress,
        device_count: u32,
    ) -> Result<usize> {
        if self.index.contains_key(&identity) {
            return Err(TopologyError::InvalidTopologyRequest(format!(
                "peer {} appears more than once",
                identity
            )));
        }
        let idx = self.vertices.len();
        self.index.insert(identity.clone(), idx);
        self.vertices.push(Vertex::new(id, identity, device_count));
        Ok(idx)
    }

    /// Join two vertices with an undirected edge.
    pub fn connect(&mut self, a: usize, b: usize, cost: u32) -> Result<()> {
        if a == b {
            return Err(TopologyError::SelfLoop(self.vertices[a].id));
        }
        if self.is_connected(a, b) {
            return Err(TopologyError::AlreadyConnected(
                self.vertices[a].id,
                self.vertices[b].id,
            ));
        }
        self.vertices[a].edges.push((b, cost));
        self.vertices[b].edges.push((a, cost));
        Ok(())
    }

    /// Whether `a` and `b` share an edge. Checks both sides.
    pub fn is_connected(&self, a: usize, b: usize) -> bool {
        self.vertices[a].cost_to(b).is_some() || self.vertices[b].cost_to(a).is_some()
    }

    /// All vertices in id order.
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    /// Vertex at an arena index.
    pub fn vertex(&self, idx: usize) -> Option<&Vertex> {
        self.vertices.get(idx)
    }

    /// Number of vertices.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn min_degree(&self) -> usize {
        self.min_degree
    }

    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    /// Arena index of a peer.
    pub fn find(&self, identity: &PeerAddress) -> Option<usize> {
        self.index.get(identity).copied()
    }

    fn require(&self, identity: &PeerAddress) -> Result<&Vertex> {
        self.find(identity)
            .map(|idx| &self.vertices[idx])
            .ok_or_else(|| TopologyError::UnknownPeer(identity.to_string()))
    }

    /// Peers this identity must dial: neighbours with a strictly higher id.
    ///
    /// Exactly one side of every edge sees the other in this list, so each
    /// edge becomes exactly one physical connection.
    pub fn connection_initiation_list(&self, identity: &PeerAddress) -> Result<Vec<PeerAddress>> {
        let vertex = self.require(identity)?;
        Ok(vertex
            .edges
            .iter()
            .map(|(n, _)| &self.vertices[*n])
            .filter(|n| n.id > vertex.id)
            .map(|n| n.identity.clone())
            .collect())
    }

    /// Every neighbour of an identity, with edge costs.
    pub fn neighbors(&self, identity: &PeerAddress) -> Result<Vec<(PeerAddress, u32)>> {
        let vertex = self.require(identity)?;
        Ok(vertex
            .edges
            .iter()
            .map(|(n, cost)| (self.vertices[*n].identity.clone(), *cost))
            .collect())
    }

    /// The full edge list, each edge once with the lower id first.
    pub fn edges(&self) -> Vec<Edge> {
        let mut out = Vec::with_capacity(self.edge_count());
        for vertex in &self.vertices {
            for (n, cost) in &vertex.edges {
                let other = &self.vertices[*n];
                if other.id > vertex.id {
                    out.push(Edge {
                        first: vertex.into(),
                        second: Some(other.into()),
                        cost: *cost,
                    });
                }
            }
        }
        out
    }

    /// Number of undirected edges.
    pub fn edge_count(&self) -> usize {
        self.vertices.iter().map(Vertex::degree).sum::<usize>() / 2
    }

    /// Check that every vertex degree lies inside the band.
    pub fn verify(&self) -> Result<()> {
        match self
            .vertices
            .iter()
            .find(|v| v.degree() < self.min_degree || v.degree() > self.max_degree)
        {
            Some(v) => Err(TopologyError::DegreeViolation {
                vertex: v.id,
                degree: v.degree(),
                min: self.min_degree,
                max: self.max_degree,
            }),
            None => Ok(()),
        }
    }

    /// Breadth-first check that every vertex is reachable from the first.
    pub fn is_fully_reachable(&self) -> bool {
        if self.vertices.is_empty() {
            return true;
        }
        let mut seen = vec![false; self.vertices.len()];
        let mut queue = VecDeque::from([0usize]);
        seen[0] = true;
        while let Some(idx) = queue.pop_front() {
            for (n, _) in &self.vertices[idx].edges {
                if !seen[*n] {
                    seen[*n] = true;
                    queue.push_back(*n);
                }
            }
        }
        seen.into_iter().all(|s| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> PeerAddress {
        PeerAddress::new("vertex", port)
    }

    fn line(n: usize) -> NetworkMap {
        let mut map = NetworkMap::new(1, 2);
        for i in 0..n {
            map.add_vertex(i, peer(1025 + i as u16), 5).unwrap();
        }
        for i in 1..n {
            map.connect(i - 1, i, i as u32).unwrap();
        }
        map
    }

    #[test]
    fn connect_is_symmetric() {
        let map = line(3);
        assert!(map.is_connected(0, 1));
        assert!(map.is_connected(1, 0));
        assert_eq!(map.vertex(0).unwrap().cost_to(1), Some(1));
        assert_eq!(map.vertex(1).unwrap().cost_to(0), Some(1));
        assert!(!map.is_connected(0, 2));
    }

    #[test]
    fn rejects_self_loop_and_duplicate_edge() {
        let mut map = line(3);
        assert!(matches!(map.connect(1, 1, 3), Err(TopologyError::SelfLoop(1))));
        assert!(matches!(
            map.connect(1, 0, 3),
            Err(TopologyError::AlreadyConnected(1, 0))
        ));
    }

    #[test]
    fn rejects_duplicate_identity() {
        let mut map = NetworkMap::new(1, 1);
        map.add_vertex(0, peer(1), 0).unwrap();
        assert!(map.add_vertex(1, peer(1), 0).is_err());
    }

    #[test]
    fn initiation_list_only_higher_ids() {
        let map = line(3);
        assert_eq!(map.connection_initiation_list(&peer(1025)).unwrap(), vec![peer(1026)]);
        assert_eq!(map.connection_initiation_list(&peer(1026)).unwrap(), vec![peer(1027)]);
        assert!(map.connection_initiation_list(&peer(1027)).unwrap().is_empty());
    }

    #[test]
    fn unknown_peer_lookup_fails() {
        let map = line(2);
        assert!(matches!(
            map.neighbors(&peer(9)),
            Err(TopologyError::UnknownPeer(_))
        ));
    }

    #[test]
    fn edge_list_lists_lower_id_first() {
        let map = line(4);
        let edges = map.edges();
        assert_eq!(edges.len(), 3);
        assert_eq!(map.edge_count(), 3);
        for edge in edges {
            assert!(edge.first.id < edge.second.unwrap().id);
        }
    }

    #[test]
    fn verify_flags_degree_violation() {
        let mut map = line(3);
        map.min_degree = 2;
        assert!(matches!(
            map.verify(),
            Err(TopologyError::DegreeViolation { degree: 1, .. })
        ));
    }

    #[test]
    fn rebuild_from_edges() {
        let map = line(4);
        let rebuilt = NetworkMap::from_edges(1, 2, &map.edges()).unwrap();
        assert_eq!(rebuilt, map);
    }

    #[test]
    fn terminal_segment_adds_vertex_only() {
        let edges = vec![
            Edge {
                first: EdgeEnd { id: 0, identity: peer(1), device_count: 3 },
                second: Some(EdgeEnd { id: 1, identity: peer(2), device_count: 4 }),
                cost: 7,
            },
            Edge {
                first: EdgeEnd { id: 1, identity: peer(2), device_count: 4 },
                second: None,
                cost: 0,
            },
        ];
        let map = NetworkMap::from_edges(1, 1, &edges).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.edge_count(), 1);
    }

    #[test]
    fn reachability() {
        assert!(line(5).is_fully_reachable());

        let mut split = NetworkMap::new(0, 1);
        for i in 0..4 {
            split.add_vertex(i, peer(1 + i as u16), 0).unwrap();
        }
        split.connect(0, 1, 1).unwrap();
        split.connect(2, 3, 1).unwrap();
        assert!(!split.is_fully_reachable());
    }
}
