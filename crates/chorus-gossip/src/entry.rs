//! Gossip table entry types.

use std::collections::BTreeSet;

use chorus_topology::PeerAddress;

/// A named set of peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedSet {
    pub name: String,
    pub members: BTreeSet<PeerAddress>,
}

impl NamedSet {
    /// A set holding one member.
    pub fn with_member(name: &str, member: PeerAddress) -> Self {
        Self {
            name: name.to_string(),
            members: BTreeSet::from([member]),
        }
    }

    /// Add a member. Returns true if it was not already present.
    pub fn insert(&mut self, member: PeerAddress) -> bool {
        self.members.insert(member)
    }
}

/// How far away a device kind is, and which neighbours lead to it.
///
/// Holders accumulate across merges; the distance only ever shrinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistanceEntry {
    /// Metric or device name.
    pub name: String,
    /// Smallest hop count seen.
    pub distance: u32,
    /// Neighbours that advertised the name.
    pub holders: BTreeSet<PeerAddress>,
}

impl DistanceEntry {
    pub fn new(name: &str, distance: u32, holder: PeerAddress) -> Self {
        Self {
            name: name.to_string(),
            distance,
            holders: BTreeSet::from([holder]),
        }
    }

    /// Fold in one advertisement.
    /// Returns true if the distance dropped or the holder is new.
    pub fn merge(&mut self, distance: u32, holder: PeerAddress) -> bool {
        let mut changed = self.holders.insert(holder);
        if distance < self.distance {
            self.distance = distance;
            changed = true;
        }
        changed
    }
}

/// A peer known to hold a name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    pub holder: PeerAddress,
    pub name: String,
}

impl Location {
    pub fn new(holder: PeerAddress, name: impl Into<String>) -> Self {
        Self {
            holder,
            name: name.into(),
        }
    }
}
