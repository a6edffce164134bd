//! Chorus Gossip State
//!
//! The per-peer tables that keep query propagation from looping and let
//! gossip queries route toward peers that hold a metric.
//!
//! # Tables
//!
//! - [`QueryLog`]: query ids already processed (duplicate suppression)
//! - [`DistanceTable`]: name → smallest hop distance and the neighbours
//!   that lead there (gossip type 0)
//! - [`LocationTable`]: which peer holds which name (gossip type 1)
//!
//! All three sit on [`DedupCache`], a strict fixed-capacity LRU keyed by
//! 128-bit ids. Names are mapped to ids with Blake3.
//!
//! # Merge Semantics
//!
//! Distance entries keep the minimum distance and accumulate holders.
//! Location entries are overwritten in place; a new location that would
//! evict is occasionally dropped instead, so a full table keeps churning
//! slowly rather than thrashing.

mod entry;
mod lru;
mod state;

pub use entry::{DistanceEntry, Location, NamedSet};
pub use lru::{DedupCache, Iter};
pub use state::{
    DistanceTable, LocationTable, QueryLog, DEFAULT_QUERY_CACHE_SIZE, DEFAULT_SKIP_PROBABILITY,
};

use chorus_topology::PeerAddress;
use uuid::Uuid;

/// Map a name to a cache key using Blake3.
pub fn name_key(name: &str) -> Uuid {
    uuid_from_hash(blake3::hash(name.as_bytes()))
}

/// Cache key for a `(holder, name)` location.
pub fn location_key(holder: &PeerAddress, name: &str) -> Uuid {
    let mut hasher = blake3::Hasher::new();
    hasher.update(holder.identity_key().as_bytes());
    hasher.update(b"/");
    hasher.update(name.as_bytes());
    uuid_from_hash(hasher.finalize())
}

fn uuid_from_hash(hash: blake3::Hash) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[..16]);
    Uuid::from_bytes(bytes)
}
