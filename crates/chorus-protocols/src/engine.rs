//! Per-peer query propagation.
//!
//! A [`PropagationEngine`] decides what a peer does with each flood, random
//! walk, gossip query, and gossip advertisement it receives. It owns the
//! peer's duplicate log and gossip tables, asks a [`MetricSource`] for local
//! counts, and emits derived messages through an [`Outbound`] handle supplied
//! by the caller.
//!
//! Totals travel with the query. A peer adds its own device counts only the
//! first time it sees a query id; later arrivals are passed straight back to
//! the originator unchanged.

use bytes::Bytes;
use chorus_gossip::{
    DistanceEntry, DistanceTable, Location, LocationTable, QueryLog, DEFAULT_QUERY_CACHE_SIZE,
    DEFAULT_SKIP_PROBABILITY,
};
use chorus_topology::PeerAddress;
use tracing::{debug, trace};

use crate::error::{ProtocolError, Result};
use crate::wire::{GossipType, Message, QueryMessage, UNLIMITED_HOPS};

/// Where derived messages go.
///
/// Implementations must not block; sends are fire-and-forget and a failed
/// delivery is the implementation's to log.
pub trait Outbound {
    /// Send to one peer, connecting first if needed.
    fn send(&self, peer: &PeerAddress, payload: Bytes);

    /// Send to every neighbour not in `exclude`.
    fn send_all(&self, payload: Bytes, exclude: &[PeerAddress]);

    /// Send to one uniformly random neighbour not in `exclude`.
    /// Returns the chosen neighbour, or `None` if there was no candidate.
    fn send_to_random(&self, payload: Bytes, exclude: &[PeerAddress]) -> Option<PeerAddress>;

    /// Current overlay neighbours.
    fn neighbors(&self) -> Vec<PeerAddress>;
}

/// Local device counts.
pub trait MetricSource {
    /// Number of attached devices.
    fn device_count(&self) -> usize;

    /// Number of attached devices reporting `metric`.
    fn metric_count(&self, metric: &str) -> usize;

    /// Distinct metric names reported by attached devices.
    fn metric_names(&self) -> Vec<String>;
}

/// Table sizes and merge knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub query_cache_size: usize,
    pub table_capacity: usize,
    pub skip_probability: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_cache_size: DEFAULT_QUERY_CACHE_SIZE,
            table_capacity: 100,
            skip_probability: DEFAULT_SKIP_PROBABILITY,
        }
    }
}

/// One peer's propagation logic and state.
#[derive(Debug)]
pub struct PropagationEngine<M> {
    identity: PeerAddress,
    queries: QueryLog,
    distances: DistanceTable,
    locations: LocationTable,
    metrics: M,
}

impl<M: MetricSource> PropagationEngine<M> {
    pub fn new(identity: PeerAddress, metrics: M, config: EngineConfig) -> Self {
        Self {
            identity,
            queries: QueryLog::new(config.query_cache_size),
            distances: DistanceTable::new(config.table_capacity),
            locations: LocationTable::new(config.table_capacity, config.skip_probability),
            metrics,
        }
    }

    pub fn identity(&self) -> &PeerAddress {
        &self.identity
    }

    pub fn metrics(&self) -> &M {
        &self.metrics
    }

    pub fn queries(&self) -> &QueryLog {
        &self.queries
    }

    pub fn distance_snapshot(&self) -> Vec<DistanceEntry> {
        self.distances.snapshot()
    }

    pub fn location_snapshot(&self) -> Vec<Location> {
        self.locations.snapshot()
    }

    /// Record this peer's own metrics at distance 0 in both tables,
    /// replacing whatever an earlier seeding left behind.
    pub fn seed_tables(&self) {
        let stale = self.distances.forget_holder(&self.identity)
            + self.locations.forget_holder(&self.identity);
        if stale > 0 {
            trace!(stale, "Dropped own gossip entries");
        }
        let names = self.metrics.metric_names();
        let mut rng = rand::thread_rng();
        for name in &names {
            self.distances.merge(name, 0, &self.identity);
            self.locations.merge(&self.identity, name, &mut rng);
        }
        debug!(metrics = names.len(), "Seeded gossip tables");
    }

    /// Distance-table advertisement for neighbours.
    pub fn gossip_data(&self) -> Message {
        Message::GossipData {
            sender: self.identity.clone(),
            entries: self.distances.advertisement(),
        }
    }

    /// Location-table advertisement for neighbours.
    pub fn gossip_entries(&self) -> Message {
        Message::GossipEntries {
            sender: self.identity.clone(),
            entries: self
                .locations
                .snapshot()
                .into_iter()
                .map(|loc| (loc.holder, loc.name))
                .collect(),
        }
    }

    /// Send both advertisements to every neighbour.
    pub fn broadcast_state<O: Outbound + ?Sized>(&self, out: &O) {
        out.send_all(self.gossip_data().encode(), &[]);
        out.send_all(self.gossip_entries().encode(), &[]);
    }

    /// Dispatch a propagation message. Control messages are rejected.
    pub fn handle<O: Outbound + ?Sized>(&self, message: Message, out: &O) -> Result<()> {
        match message {
            Message::Flood(query) => self.on_flood(&query, out),
            Message::RandomWalk(query) => self.on_random_walk(&query, out),
            Message::GossipQuery { query, gossip_type } => {
                self.on_gossip_query(&query, gossip_type, out)
            }
            Message::GossipData { sender, entries } => self.on_gossip_data(&sender, &entries, out),
            Message::GossipEntries { sender, entries } => {
                self.on_gossip_entries(&sender, &entries, out)
            }
            other => return Err(ProtocolError::NotPropagation(other.tag())),
        }
        Ok(())
    }

    /// Totals after adding this peer's contribution.
    fn accumulate(&self, query: &QueryMessage) -> (i32, i32) {
        let checked = to_i32(self.metrics.device_count());
        let with_metric = to_i32(self.metrics.metric_count(&query.target_metric));
        (
            query.total_devices_checked.saturating_add(checked),
            query.total_devices_with_metric.saturating_add(with_metric),
        )
    }

    fn reply<O: Outbound + ?Sized>(&self, out: &O, message: Message) {
        if let Some(query) = message.query() {
            trace!(id = %query.id, originator = %query.originator, "Replying to originator");
            out.send(&query.originator, message.encode());
        }
    }

    /// Bounded flood.
    ///
    /// One random neighbour receives the accumulated totals; every other
    /// neighbour except the sender receives the totals as they arrived.
    pub fn on_flood<O: Outbound + ?Sized>(&self, query: &QueryMessage, out: &O) {
        let passthrough = query.next_hop(
            &self.identity,
            query.total_devices_checked,
            query.total_devices_with_metric,
        );

        if !self
            .queries
            .check_and_mark(query.id, &query.target_metric, &query.sender)
        {
            debug!(id = %query.id, sender = %query.sender, "Duplicate flood");
            self.reply(out, Message::Flood(passthrough));
            return;
        }

        let (checked, with_metric) = self.accumulate(query);
        let accumulated = query.next_hop(&self.identity, checked, with_metric);
        debug!(id = %query.id, hop = query.current_hop, "Flood");

        if query.hop_limit != UNLIMITED_HOPS && !query.may_forward() {
            self.reply(out, Message::Flood(accumulated));
            return;
        }

        let sender = query.sender.clone();
        let carrier = out.send_to_random(
            Message::Flood(accumulated.clone()).encode(),
            std::slice::from_ref(&sender),
        );

        match carrier {
            Some(carrier) => {
                out.send_all(Message::Flood(passthrough).encode(), &[sender, carrier]);
            }
            None => self.reply(out, Message::Flood(accumulated)),
        }
    }

    /// Random walk: one copy, one neighbour per hop.
    pub fn on_random_walk<O: Outbound + ?Sized>(&self, query: &QueryMessage, out: &O) {
        let first_seen = self
            .queries
            .check_and_mark(query.id, &query.target_metric, &query.sender);

        let next = if first_seen {
            let (checked, with_metric) = self.accumulate(query);
            query.next_hop(&self.identity, checked, with_metric)
        } else {
            query.next_hop(
                &self.identity,
                query.total_devices_checked,
                query.total_devices_with_metric,
            )
        };
        debug!(id = %query.id, hop = query.current_hop, first_seen, "Random walk");

        if !query.may_forward() {
            self.reply(out, Message::RandomWalk(next));
            return;
        }

        let payload = Message::RandomWalk(next.clone()).encode();
        if out
            .send_to_random(payload.clone(), std::slice::from_ref(&query.sender))
            .is_some()
        {
            return;
        }

        // Dead end: step back the way we came if that is the only way out
        let neighbors = out.neighbors();
        if neighbors.iter().any(|n| *n == query.sender) {
            out.send(&query.sender, payload);
        } else {
            self.reply(out, Message::RandomWalk(next));
        }
    }

    /// Gossip-routed query.
    ///
    /// The first matching holder receives the accumulated totals and the rest
    /// receive zero totals, so the peer's contribution is delivered once.
    pub fn on_gossip_query<O: Outbound + ?Sized>(
        &self,
        query: &QueryMessage,
        gossip_type: GossipType,
        out: &O,
    ) {
        let wrap = |q: QueryMessage| Message::GossipQuery {
            query: q,
            gossip_type,
        };

        if !self
            .queries
            .check_and_mark(query.id, &query.target_metric, &query.sender)
        {
            debug!(id = %query.id, sender = %query.sender, "Duplicate gossip query");
            let passthrough = query.next_hop(
                &self.identity,
                query.total_devices_checked,
                query.total_devices_with_metric,
            );
            self.reply(out, wrap(passthrough));
            return;
        }

        let (checked, with_metric) = self.accumulate(query);
        let accumulated = query.next_hop(&self.identity, checked, with_metric);

        if !query.may_forward() {
            self.reply(out, wrap(accumulated));
            return;
        }

        let candidates = match gossip_type {
            GossipType::Distance => {
                let budget =
                    u32::try_from(query.hop_limit.saturating_sub(query.current_hop)).unwrap_or(0);
                self.distances.holders_within(&query.target_metric, budget)
            }
            GossipType::Location => self.locations.holders_of(&query.target_metric),
        };
        let mut targets: Vec<PeerAddress> = Vec::new();
        for peer in candidates {
            if peer != self.identity && peer != query.sender && !targets.contains(&peer) {
                targets.push(peer);
            }
        }
        debug!(
            id = %query.id,
            hop = query.current_hop,
            ?gossip_type,
            matches = targets.len(),
            "Gossip query"
        );

        let Some((first, rest)) = targets.split_first() else {
            self.reply(out, wrap(accumulated));
            return;
        };

        out.send(first, wrap(accumulated).encode());
        if !rest.is_empty() {
            let zero = wrap(query.next_hop(&self.identity, 0, 0)).encode();
            for peer in rest {
                out.send(peer, zero.clone());
            }
        }
    }

    /// Merge a neighbour's distance advertisement; rebroadcast on change.
    pub fn on_gossip_data<O: Outbound + ?Sized>(
        &self,
        sender: &PeerAddress,
        entries: &[(String, u32)],
        out: &O,
    ) {
        let changed = self
            .distances
            .merge_advertised(entries.iter().map(|(n, d)| (n.as_str(), *d)), sender);
        debug!(%sender, entries = entries.len(), changed, "Gossip data");
        if changed {
            out.send_all(self.gossip_data().encode(), std::slice::from_ref(sender));
        }
    }

    /// Merge a neighbour's location advertisement; rebroadcast on change.
    pub fn on_gossip_entries<O: Outbound + ?Sized>(
        &self,
        sender: &PeerAddress,
        entries: &[(PeerAddress, String)],
        out: &O,
    ) {
        let changed = self.locations.merge_all(
            entries.iter().map(|(h, n)| (h, n.as_str())),
            &mut rand::thread_rng(),
        );
        debug!(%sender, entries = entries.len(), changed, "Gossip entries");
        if changed {
            out.send_all(self.gossip_entries().encode(), std::slice::from_ref(sender));
        }
    }
}

fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct Devices {
        total: usize,
        by_metric: HashMap<&'static str, usize>,
    }

    impl MetricSource for Devices {
        fn device_count(&self) -> usize {
            self.total
        }
        fn metric_count(&self, metric: &str) -> usize {
            self.by_metric.get(metric).copied().unwrap_or(0)
        }
        fn metric_names(&self) -> Vec<String> {
            self.by_metric.keys().map(|k| k.to_string()).collect()
        }
    }

    /// Records every send; random picks take the first eligible neighbour.
    #[derive(Default)]
    struct Recorder {
        neighbors: Vec<PeerAddress>,
        sent: Mutex<Vec<(PeerAddress, Message)>>,
    }

    impl Recorder {
        fn with(neighbors: &[&PeerAddress]) -> Self {
            Self {
                neighbors: neighbors.iter().map(|p| (*p).clone()).collect(),
                sent: Mutex::default(),
            }
        }

        fn take(&self) -> Vec<(PeerAddress, Message)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl Outbound for Recorder {
        fn send(&self, peer: &PeerAddress, payload: Bytes) {
            let msg = Message::decode(&payload).unwrap();
            self.sent.lock().push((peer.clone(), msg));
        }

        fn send_all(&self, payload: Bytes, exclude: &[PeerAddress]) {
            for n in &self.neighbors {
                if !exclude.contains(n) {
                    self.send(n, payload.clone());
                }
            }
        }

        fn send_to_random(&self, payload: Bytes, exclude: &[PeerAddress]) -> Option<PeerAddress> {
            let pick = self.neighbors.iter().find(|n| !exclude.contains(n))?.clone();
            self.send(&pick, payload);
            Some(pick)
        }

        fn neighbors(&self) -> Vec<PeerAddress> {
            self.neighbors.clone()
        }
    }

    fn addr(name: &str) -> PeerAddress {
        PeerAddress::new(name, 5000)
    }

    fn engine(name: &str, total: usize, temp: usize) -> PropagationEngine<Devices> {
        PropagationEngine::new(
            addr(name),
            Devices {
                total,
                by_metric: HashMap::from([("TEMPERATURE", temp)]),
            },
            EngineConfig::default(),
        )
    }

    fn totals(msg: &Message) -> (i32, i32) {
        let q = msg.query().unwrap();
        (q.total_devices_checked, q.total_devices_with_metric)
    }

    #[test]
    fn flood_splits_accumulated_and_passthrough() {
        let (reg, b, c, d) = (addr("reg"), addr("b"), addr("c"), addr("d"));
        let a = engine("a", 10, 2);
        let out = Recorder::with(&[&b, &c, &d]);

        let mut query = QueryMessage::new(reg.clone(), "TEMPERATURE", 3);
        query.total_devices_checked = 5;
        a.on_flood(&query, &out);

        let sent = out.take();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].0, b);
        assert_eq!(totals(&sent[0].1), (15, 2));
        assert_eq!(totals(&sent[1].1), (5, 0));
        assert_eq!(totals(&sent[2].1), (5, 0));
        assert!(sent.iter().all(|(_, m)| m.query().unwrap().current_hop == 1));
        assert!(sent.iter().all(|(_, m)| m.query().unwrap().sender == addr("a")));
    }

    #[test]
    fn flood_duplicate_goes_to_originator_unchanged() {
        let (reg, b) = (addr("reg"), addr("b"));
        let a = engine("a", 10, 2);
        let out = Recorder::with(&[&b]);
        let query = QueryMessage::new(reg.clone(), "TEMPERATURE", 4);

        a.on_flood(&query, &out);
        out.take();

        let mut again = query.next_hop(&b, 30, 3);
        again.current_hop = 2;
        a.on_flood(&again, &out);

        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, reg);
        assert_eq!(totals(&sent[0].1), (30, 3));
    }

    #[test]
    fn flood_at_limit_replies_with_own_contribution() {
        let (reg, b) = (addr("reg"), addr("b"));
        let a = engine("a", 10, 2);
        let out = Recorder::with(&[&b]);

        let mut query = QueryMessage::new(reg.clone(), "TEMPERATURE", 2);
        query.current_hop = 1;
        a.on_flood(&query, &out);

        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, reg);
        assert_eq!(totals(&sent[0].1), (10, 2));
        assert_eq!(sent[0].1.query().unwrap().current_hop, 2);
    }

    #[test]
    fn unlimited_flood_keeps_going() {
        let (reg, b) = (addr("reg"), addr("b"));
        let a = engine("a", 1, 0);
        let out = Recorder::with(&[&b]);

        let mut query = QueryMessage::new(reg, "TEMPERATURE", UNLIMITED_HOPS);
        query.current_hop = 50;
        a.on_flood(&query, &out);

        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b);
    }

    #[test]
    fn flood_without_other_neighbours_returns_to_originator() {
        let (reg, b) = (addr("reg"), addr("b"));
        let a = engine("a", 4, 1);
        let out = Recorder::with(&[&b]);

        let query = QueryMessage::new(reg.clone(), "TEMPERATURE", 5).next_hop(&b, 0, 0);
        a.on_flood(&query, &out);

        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, reg);
        assert_eq!(totals(&sent[0].1), (4, 1));
    }

    #[test]
    fn random_walk_counts_once_and_backtracks() {
        let (reg, b) = (addr("reg"), addr("b"));
        let a = engine("a", 6, 1);
        let out = Recorder::with(&[&b]);

        let query = QueryMessage::new(reg, "TEMPERATURE", 10).next_hop(&b, 0, 0);
        a.on_random_walk(&query, &out);
        let sent = out.take();
        assert_eq!(sent[0].0, b);
        assert_eq!(totals(&sent[0].1), (6, 1));

        // Second visit: forwarded again, but nothing added
        let back = sent[0].1.query().unwrap().next_hop(&b, 6, 1);
        a.on_random_walk(&back, &out);
        let sent = out.take();
        assert_eq!(sent[0].0, b);
        assert_eq!(totals(&sent[0].1), (6, 1));
    }

    #[test]
    fn random_walk_ends_at_originator() {
        let (reg, b) = (addr("reg"), addr("b"));
        let a = engine("a", 6, 1);
        let out = Recorder::with(&[&b]);

        let query = QueryMessage::new(reg.clone(), "TEMPERATURE", 1);
        a.on_random_walk(&query, &out);
        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, reg);
    }

    #[test]
    fn gossip_data_merges_and_rebroadcasts_once() {
        let (b, c) = (addr("b"), addr("c"));
        let a = engine("a", 3, 1);
        a.seed_tables();
        let out = Recorder::with(&[&b, &c]);

        let entries = vec![("LOCK_STATE".to_string(), 0)];
        a.on_gossip_data(&b, &entries, &out);
        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, c);
        match &sent[0].1 {
            Message::GossipData { entries, .. } => {
                assert!(entries.contains(&("LOCK_STATE".to_string(), 1)));
                assert!(entries.contains(&("TEMPERATURE".to_string(), 0)));
            }
            other => panic!("unexpected {other:?}"),
        }

        a.on_gossip_data(&b, &entries, &out);
        assert!(out.take().is_empty());
    }

    #[test]
    fn gossip_type0_routes_to_near_holder() {
        let (reg, b, c) = (addr("reg"), addr("b"), addr("c"));
        let a = engine("a", 3, 0);
        let out = Recorder::with(&[&b, &c]);

        a.on_gossip_data(&c, &[("ICE_LEVEL".to_string(), 0)], &out);
        out.take();

        let query = QueryMessage::new(reg, "ICE_LEVEL", 3).next_hop(&b, 0, 0);
        a.on_gossip_query(&query, GossipType::Distance, &out);

        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, c);
        assert_eq!(totals(&sent[0].1), (3, 0));
    }

    #[test]
    fn gossip_type1_first_match_full_rest_zero() {
        let (reg, b, x, y) = (addr("reg"), addr("b"), addr("x"), addr("y"));
        let a = engine("a", 7, 0);
        let out = Recorder::with(&[&b]);

        a.on_gossip_entries(
            &b,
            &[(x.clone(), "NETFLIX".to_string()), (y.clone(), "NETFLIX".to_string())],
            &out,
        );
        out.take();

        let query = QueryMessage::new(reg, "NETFLIX", 5).next_hop(&b, 2, 1);
        a.on_gossip_query(&query, GossipType::Location, &out);

        let sent = out.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(totals(&sent[0].1), (9, 1));
        assert_eq!(totals(&sent[1].1), (0, 0));
        let mut targets: Vec<_> = sent.iter().map(|(p, _)| p.clone()).collect();
        targets.sort();
        assert_eq!(targets, vec![x, y]);
    }

    #[test]
    fn gossip_without_match_reports_to_originator() {
        let (reg, b) = (addr("reg"), addr("b"));
        let a = engine("a", 7, 2);
        let out = Recorder::with(&[&b]);

        let query = QueryMessage::new(reg.clone(), "TEMPERATURE", 5).next_hop(&b, 0, 0);
        a.on_gossip_query(&query, GossipType::Location, &out);

        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, reg);
        assert_eq!(totals(&sent[0].1), (7, 2));
    }

    #[test]
    fn control_messages_are_not_handled() {
        let a = engine("a", 1, 0);
        let out = Recorder::default();
        assert!(matches!(
            a.handle(Message::Shutdown, &out),
            Err(ProtocolError::NotPropagation(_))
        ));
    }
}
