//! Per-peer shared tables.
//!
//! Each table wraps a [`DedupCache`] in a mutex so that a read, the decision
//! based on it, and the resulting write happen as one step even when several
//! connection tasks deliver messages at once.

use chorus_topology::PeerAddress;
use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;
use uuid::Uuid;

use crate::entry::{DistanceEntry, Location, NamedSet};
use crate::lru::DedupCache;
use crate::{location_key, name_key};

/// Default capacity of the query-id log.
pub const DEFAULT_QUERY_CACHE_SIZE: usize = 40;

/// Default probability of skipping an evicting location insert.
pub const DEFAULT_SKIP_PROBABILITY: f64 = 0.01;

/// Query ids this peer has already processed, with the peers that sent them.
#[derive(Debug)]
pub struct QueryLog {
    cache: Mutex<DedupCache<NamedSet>>,
}

impl QueryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(DedupCache::new(capacity)),
        }
    }

    /// Record that `sender` delivered query `id` for `metric`.
    ///
    /// Returns true exactly once per id while the id stays in the log.
    pub fn check_and_mark(&self, id: Uuid, metric: &str, sender: &PeerAddress) -> bool {
        let mut cache = self.cache.lock();
        let first_seen = !cache.contains(&id);
        cache.put_set(id, metric, sender.clone());
        first_seen
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.cache.lock().contains(id)
    }

    /// Peers that have delivered query `id`.
    pub fn senders(&self, id: &Uuid) -> Vec<PeerAddress> {
        self.cache
            .lock()
            .peek(id)
            .map(|set| set.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

/// Gossip type-0 table: name → (distance, holders).
#[derive(Debug)]
pub struct DistanceTable {
    cache: Mutex<DedupCache<DistanceEntry>>,
}

impl DistanceTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(DedupCache::new(capacity)),
        }
    }

    /// Merge one `(name, distance, holder)` triple.
    pub fn merge(&self, name: &str, distance: u32, holder: &PeerAddress) -> bool {
        self.cache
            .lock()
            .put_min_distance(name_key(name), name, distance, holder.clone())
    }

    /// Merge a neighbour's advertisement. Every advertised distance grows by
    /// one hop and the neighbour becomes a holder.
    pub fn merge_advertised<'a>(
        &self,
        advertised: impl IntoIterator<Item = (&'a str, u32)>,
        sender: &PeerAddress,
    ) -> bool {
        let mut cache = self.cache.lock();
        let mut changed = false;
        for (name, distance) in advertised {
            let distance = distance.saturating_add(1);
            let updated = cache.put_min_distance(name_key(name), name, distance, sender.clone());
            if updated {
                trace!(name, distance, %sender, "Distance entry updated");
            }
            changed |= updated;
        }
        changed
    }

    /// Holders of `name` whose entry distance is below `max_distance`.
    /// Marks the entry as recently used.
    pub fn holders_within(&self, name: &str, max_distance: u32) -> Vec<PeerAddress> {
        let mut cache = self.cache.lock();
        match cache.touch(&name_key(name)) {
            Some(entry) if entry.distance < max_distance => entry.holders.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Drop every entry `holder` appears in. Returns how many went.
    pub fn forget_holder(&self, holder: &PeerAddress) -> usize {
        self.cache.lock().retain(|e| !e.holders.contains(holder))
    }

    /// `(name, distance)` pairs to advertise to neighbours.
    pub fn advertisement(&self) -> Vec<(String, u32)> {
        self.cache
            .lock()
            .iter()
            .map(|(_, e)| (e.name.clone(), e.distance))
            .collect()
    }

    /// Copies of every entry, most recently used first.
    pub fn snapshot(&self) -> Vec<DistanceEntry> {
        self.cache.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

/// Gossip type-1 table: which peer holds which name.
#[derive(Debug)]
pub struct LocationTable {
    cache: Mutex<DedupCache<Location>>,
    skip_probability: f64,
}

impl LocationTable {
    pub fn new(capacity: usize, skip_probability: f64) -> Self {
        Self {
            cache: Mutex::new(DedupCache::new(capacity)),
            skip_probability,
        }
    }

    /// Record that `holder` has `name`.
    pub fn merge<R: Rng + ?Sized>(&self, holder: &PeerAddress, name: &str, rng: &mut R) -> bool {
        self.cache.lock().put_with_skip_probability(
            location_key(holder, name),
            Location::new(holder.clone(), name),
            self.skip_probability,
            rng,
        )
    }

    /// Merge a batch of `(holder, name)` pairs. True if any was new.
    pub fn merge_all<'a, R: Rng + ?Sized>(
        &self,
        entries: impl IntoIterator<Item = (&'a PeerAddress, &'a str)>,
        rng: &mut R,
    ) -> bool {
        let mut cache = self.cache.lock();
        let mut changed = false;
        for (holder, name) in entries {
            changed |= cache.put_with_skip_probability(
                location_key(holder, name),
                Location::new(holder.clone(), name),
                self.skip_probability,
                rng,
            );
        }
        changed
    }

    /// Every peer known to hold `name`.
    pub fn holders_of(&self, name: &str) -> Vec<PeerAddress> {
        self.cache
            .lock()
            .iter()
            .filter(|(_, loc)| loc.name == name)
            .map(|(_, loc)| loc.holder.clone())
            .collect()
    }

    /// Drop every location held by `holder`. Returns how many went.
    pub fn forget_holder(&self, holder: &PeerAddress) -> usize {
        self.cache.lock().retain(|l| l.holder != *holder)
    }

    /// Copies of every entry, most recently used first.
    pub fn snapshot(&self) -> Vec<Location> {
        self.cache.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn skip_probability(&self) -> f64 {
        self.skip_probability
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;
    use std::thread;

    fn peer(name: &str) -> PeerAddress {
        PeerAddress::new(name, 7000)
    }

    #[test]
    fn query_seen_once() {
        let log = QueryLog::new(DEFAULT_QUERY_CACHE_SIZE);
        let id = Uuid::new_v4();

        assert!(log.check_and_mark(id, "TEMPERATURE", &peer("a")));
        assert!(!log.check_and_mark(id, "TEMPERATURE", &peer("b")));
        assert_eq!(log.senders(&id), vec![peer("a"), peer("b")]);
    }

    #[test]
    fn query_seen_once_across_threads() {
        let log = Arc::new(QueryLog::new(8));
        let id = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = Arc::clone(&log);
                thread::spawn(move || log.check_and_mark(id, "m", &PeerAddress::new("p", 1 + i)))
            })
            .collect();

        let firsts = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|first| *first)
            .count();
        assert_eq!(firsts, 1);
    }

    #[test]
    fn advertised_distances_grow_by_one() {
        let table = DistanceTable::new(16);
        let me = peer("me");
        table.merge("TEMPERATURE", 0, &me);

        let x = peer("x");
        assert!(table.merge_advertised([("LOCK_STATE", 0), ("TEMPERATURE", 2)], &x));

        let lock = table
            .snapshot()
            .into_iter()
            .find(|e| e.name == "LOCK_STATE")
            .unwrap();
        assert_eq!(lock.distance, 1);

        // Own entry keeps distance 0 and gains x as a holder
        assert_eq!(table.holders_within("TEMPERATURE", 1), vec![me, x.clone()]);

        // Replaying the same advertisement changes nothing
        assert!(!table.merge_advertised([("LOCK_STATE", 0), ("TEMPERATURE", 2)], &x));
    }

    #[test]
    fn holders_within_respects_bound() {
        let table = DistanceTable::new(4);
        table.merge("ICE_LEVEL", 3, &peer("x"));
        assert!(table.holders_within("ICE_LEVEL", 3).is_empty());
        assert_eq!(table.holders_within("ICE_LEVEL", 4), vec![peer("x")]);
        assert!(table.holders_within("NETFLIX", 10).is_empty());
    }

    #[test]
    fn locations_by_name() {
        let mut rng = StdRng::seed_from_u64(1);
        let table = LocationTable::new(8, DEFAULT_SKIP_PROBABILITY);
        let a = peer("a");
        let b = peer("b");

        assert!(table.merge_all([(&a, "NETFLIX"), (&b, "NETFLIX"), (&b, "HEART_RATE")], &mut rng));
        assert!(!table.merge(&a, "NETFLIX", &mut rng));

        let mut holders = table.holders_of("NETFLIX");
        holders.sort();
        assert_eq!(holders, vec![a, b]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn forgetting_a_holder() {
        let mut rng = StdRng::seed_from_u64(2);
        let (me, x) = (peer("me"), peer("x"));

        let distances = DistanceTable::new(8);
        distances.merge("AIR_QUALITY", 0, &me);
        distances.merge_advertised([("AIR_QUALITY", 0), ("LOCK_STATE", 1)], &x);
        assert_eq!(distances.forget_holder(&me), 1);
        assert_eq!(distances.advertisement(), vec![("LOCK_STATE".to_string(), 2)]);

        let locations = LocationTable::new(8, DEFAULT_SKIP_PROBABILITY);
        locations.merge_all([(&me, "AIR_QUALITY"), (&x, "AIR_QUALITY"), (&me, "NETFLIX")], &mut rng);
        assert_eq!(locations.forget_holder(&me), 2);
        assert_eq!(locations.holders_of("AIR_QUALITY"), vec![x]);
        assert!(locations.holders_of("NETFLIX").is_empty());
    }
}
