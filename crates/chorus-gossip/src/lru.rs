//! Fixed-capacity LRU map keyed by 128-bit identifiers.
//!
//! Entries live in an arena of slots linked into a doubly linked list from
//! most to least recently used. A `HashMap` indexes slots by key. Once the
//! arena is full, inserting a new key reuses the tail slot, so the cache never
//! holds more than its capacity.

use std::collections::HashMap;

use rand::Rng;
use uuid::Uuid;

use crate::entry::{DistanceEntry, NamedSet};
use chorus_topology::PeerAddress;

#[derive(Debug, Clone)]
struct Slot<V> {
    key: Uuid,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Strict LRU cache.
#[derive(Debug, Clone)]
pub struct DedupCache<V> {
    slots: Vec<Slot<V>>,
    index: HashMap<Uuid, usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
    capacity: usize,
}

impl<V> DedupCache<V> {
    /// Create a cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Membership test without promotion.
    pub fn contains(&self, key: &Uuid) -> bool {
        self.index.contains_key(key)
    }

    /// Read a value and mark it most recently used.
    pub fn touch(&mut self, key: &Uuid) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.promote(idx);
        Some(&self.slots[idx].value)
    }

    /// Read a value without changing its position.
    pub fn peek(&self, key: &Uuid) -> Option<&V> {
        self.index.get(key).map(|idx| &self.slots[*idx].value)
    }

    /// Insert or overwrite. Returns true if the key was not present.
    pub fn put_simple(&mut self, key: Uuid, value: V) -> bool {
        match self.index.get(&key) {
            Some(&idx) => {
                self.slots[idx].value = value;
                self.promote(idx);
                false
            }
            None => {
                self.insert_new(key, value);
                true
            }
        }
    }

    /// Like [`put_simple`](Self::put_simple), but when inserting a new key
    /// would evict, the insert is skipped with probability `p`.
    pub fn put_with_skip_probability<R: Rng + ?Sized>(
        &mut self,
        key: Uuid,
        value: V,
        p: f64,
        rng: &mut R,
    ) -> bool {
        if !self.contains(&key) && self.is_full() && rng.gen_bool(p.clamp(0.0, 1.0)) {
            return false;
        }
        self.put_simple(key, value)
    }

    /// Create-or-update in one step.
    ///
    /// A missing key is filled from `create`; an existing value goes through
    /// `update`. Either way the key becomes most recently used. Returns true
    /// if the key was new or `update` reported a change.
    pub fn upsert(
        &mut self,
        key: Uuid,
        create: impl FnOnce() -> V,
        update: impl FnOnce(&mut V) -> bool,
    ) -> bool {
        match self.index.get(&key) {
            Some(&idx) => {
                let changed = update(&mut self.slots[idx].value);
                self.promote(idx);
                changed
            }
            None => {
                self.insert_new(key, create());
                true
            }
        }
    }

    /// Remove a key, returning its value.
    pub fn remove(&mut self, key: &Uuid) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        let last = self.slots.len() - 1;
        let removed = self.slots.swap_remove(idx);
        if idx != last {
            // The former last slot now lives at idx
            let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
            match prev {
                Some(p) => self.slots[p].next = Some(idx),
                None => self.head = Some(idx),
            }
            match next {
                Some(n) => self.slots[n].prev = Some(idx),
                None => self.tail = Some(idx),
            }
            self.index.insert(self.slots[idx].key, idx);
        }
        Some(removed.value)
    }

    /// Drop every entry whose value fails `keep`. Returns how many went.
    pub fn retain(&mut self, mut keep: impl FnMut(&V) -> bool) -> usize {
        let doomed: Vec<Uuid> = self
            .iter()
            .filter(|(_, v)| !keep(v))
            .map(|(k, _)| *k)
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    /// Entries from most to least recently used.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            cache: self,
            cursor: self.head,
        }
    }

    fn is_full(&self) -> bool {
        self.index.len() >= self.capacity
    }

    fn insert_new(&mut self, key: Uuid, value: V) {
        let evict = self.tail.filter(|_| self.is_full());
        let idx = match evict {
            // Reuse the least recently used slot
            Some(idx) => {
                self.unlink(idx);
                let old = std::mem::replace(&mut self.slots[idx].key, key);
                self.index.remove(&old);
                self.slots[idx].value = value;
                idx
            }
            None => {
                self.slots.push(Slot {
                    key,
                    value,
                    prev: None,
                    next: None,
                });
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
    }

    fn promote(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = None;
        self.slots[idx].next = self.head;
        if let Some(h) = self.head {
            self.slots[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

impl DedupCache<NamedSet> {
    /// Add `member` to the set under `key`. Returns true if the set grew or
    /// was created.
    pub fn put_set(&mut self, key: Uuid, name: &str, member: PeerAddress) -> bool {
        let created = member.clone();
        self.upsert(
            key,
            || NamedSet::with_member(name, created),
            |set| set.insert(member),
        )
    }
}

impl DedupCache<DistanceEntry> {
    /// Keep the smaller distance and add `holder` to the holder set.
    pub fn put_min_distance(
        &mut self,
        key: Uuid,
        name: &str,
        distance: u32,
        holder: PeerAddress,
    ) -> bool {
        let created = holder.clone();
        self.upsert(
            key,
            || DistanceEntry::new(name, distance, created),
            |entry| entry.merge(distance, holder),
        )
    }
}

/// Iterator over a cache in recency order.
pub struct Iter<'a, V> {
    cache: &'a DedupCache<V>,
    cursor: Option<usize>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a Uuid, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = &self.cache.slots[self.cursor?];
        self.cursor = slot.next;
        Some((&slot.key, &slot.value))
    }
}
