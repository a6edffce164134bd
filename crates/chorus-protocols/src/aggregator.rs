//! Coordinator-side result collection.
//!
//! Every query message that reaches the originator is a partial result. The
//! aggregator adds partial results for the same query id together and keeps
//! the deepest hop seen.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::wire::{GossipType, Message};

/// Column header of exported results.
pub const RESULTS_HEADER: [&str; 9] = [
    "ID",
    "Total Hops",
    "Total Devices",
    "Devices with Metric",
    "Max Hops",
    "Hop Limit",
    "Time Start",
    "Time End",
    "Type",
];

/// Propagation protocol of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QueryType {
    Flood,
    RandomWalk,
    GossipDistance,
    GossipLocation,
}

impl From<GossipType> for QueryType {
    fn from(t: GossipType) -> Self {
        match t {
            GossipType::Distance => QueryType::GossipDistance,
            GossipType::Location => QueryType::GossipLocation,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryType::Flood => "flood",
            QueryType::RandomWalk => "randomwalk",
            QueryType::GossipDistance => "gossiptype0",
            QueryType::GossipLocation => "gossiptype1",
        };
        f.write_str(name)
    }
}

/// Accumulated results of one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultMetrics {
    pub query_type: QueryType,
    pub hop_limit: i32,
    /// Sum of hop counts over every partial result.
    pub total_hops: i64,
    pub total_devices_checked: i64,
    pub total_devices_with_metric: i64,
    pub max_hop: i32,
    /// Unix milliseconds.
    pub started_at: u64,
    /// Unix milliseconds of the latest partial result, if any arrived.
    pub last_updated_at: Option<u64>,
}

impl ResultMetrics {
    fn new(query_type: QueryType, hop_limit: i32) -> Self {
        Self {
            query_type,
            hop_limit,
            total_hops: 0,
            total_devices_checked: 0,
            total_devices_with_metric: 0,
            max_hop: 0,
            started_at: now_millis(),
            last_updated_at: None,
        }
    }
}

/// One partial result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub hop_count: i32,
    pub devices_checked: i32,
    pub devices_with_metric: i32,
    pub hop_limit: i32,
    pub query_type: QueryType,
}

impl Observation {
    /// The partial result carried by a query message.
    pub fn from_message(message: &Message) -> Option<(Uuid, Self)> {
        let (query, query_type) = match message {
            Message::Flood(q) => (q, QueryType::Flood),
            Message::RandomWalk(q) => (q, QueryType::RandomWalk),
            Message::GossipQuery { query, gossip_type } => (query, QueryType::from(*gossip_type)),
            _ => return None,
        };
        Some((
            query.id,
            Self {
                hop_count: query.current_hop,
                devices_checked: query.total_devices_checked,
                devices_with_metric: query.total_devices_with_metric,
                hop_limit: query.hop_limit,
                query_type,
            },
        ))
    }
}

/// Per-query result table, safe to update from many connection tasks.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    results: DashMap<Uuid, ResultMetrics>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a query at injection time.
    pub fn track(&self, id: Uuid, query_type: QueryType, hop_limit: i32) {
        self.results
            .entry(id)
            .or_insert_with(|| ResultMetrics::new(query_type, hop_limit));
    }

    /// Fold one partial result in, creating the entry if needed.
    pub fn observe(&self, id: Uuid, obs: Observation) {
        let mut entry = self
            .results
            .entry(id)
            .or_insert_with(|| ResultMetrics::new(obs.query_type, obs.hop_limit));
        entry.total_hops += i64::from(obs.hop_count);
        entry.total_devices_checked += i64::from(obs.devices_checked);
        entry.total_devices_with_metric += i64::from(obs.devices_with_metric);
        entry.max_hop = entry.max_hop.max(obs.hop_count);
        entry.last_updated_at = Some(now_millis());
    }

    /// Fold in a query message. Returns false for non-query messages.
    pub fn observe_message(&self, message: &Message) -> bool {
        match Observation::from_message(message) {
            Some((id, obs)) => {
                self.observe(id, obs);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<ResultMetrics> {
        self.results.get(id).map(|r| r.clone())
    }

    /// Copies of every result, oldest first.
    pub fn snapshot(&self) -> Vec<(Uuid, ResultMetrics)> {
        let mut all: Vec<_> = self
            .results
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect();
        all.sort_by_key(|(id, r)| (r.started_at, *id));
        all
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn clear(&self) {
        self.results.clear();
    }

    /// Write every result as CSV.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut out = csv::Writer::from_writer(writer);
        out.write_record(RESULTS_HEADER)?;
        for (id, r) in self.snapshot() {
            out.write_record([
                id.to_string(),
                r.total_hops.to_string(),
                r.total_devices_checked.to_string(),
                r.total_devices_with_metric.to_string(),
                r.max_hop.to_string(),
                r.hop_limit.to_string(),
                r.started_at.to_string(),
                r.last_updated_at.map(|t| t.to_string()).unwrap_or_default(),
                r.query_type.to_string(),
            ])?;
        }
        out.flush()?;
        Ok(())
    }

    /// Write every result to a CSV file.
    pub fn export_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.write_csv(File::create(path)?)?;
        info!(path = %path.display(), queries = self.len(), "Results exported");
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::QueryMessage;
    use chorus_topology::PeerAddress;
    use std::sync::Arc;
    use std::thread;

    fn obs(hop: i32, checked: i32, with_metric: i32) -> Observation {
        Observation {
            hop_count: hop,
            devices_checked: checked,
            devices_with_metric: with_metric,
            hop_limit: 3,
            query_type: QueryType::Flood,
        }
    }

    #[test]
    fn observations_add_up() {
        let agg = ResultAggregator::new();
        let id = Uuid::new_v4();
        agg.track(id, QueryType::Flood, 3);
        agg.observe(id, obs(2, 10, 1));
        agg.observe(id, obs(3, 5, 2));

        let r = agg.get(&id).unwrap();
        assert_eq!(r.total_hops, 5);
        assert_eq!(r.total_devices_checked, 15);
        assert_eq!(r.total_devices_with_metric, 3);
        assert_eq!(r.max_hop, 3);
        assert!(r.last_updated_at.is_some());
    }

    #[test]
    fn observe_without_track_creates() {
        let agg = ResultAggregator::new();
        let id = Uuid::new_v4();
        agg.observe(id, obs(1, 4, 0));
        assert_eq!(agg.get(&id).unwrap().hop_limit, 3);
    }

    #[test]
    fn observe_message_reads_query() {
        let agg = ResultAggregator::new();
        let reg = PeerAddress::new("reg", 1);
        let q = QueryMessage::new(reg.clone(), "TEMPERATURE", 4).next_hop(&reg, 8, 2);
        let msg = Message::GossipQuery {
            query: q.clone(),
            gossip_type: GossipType::Location,
        };

        assert!(agg.observe_message(&msg));
        assert!(!agg.observe_message(&Message::Shutdown));

        let r = agg.get(&q.id).unwrap();
        assert_eq!(r.query_type, QueryType::GossipLocation);
        assert_eq!(r.total_devices_checked, 8);
        assert_eq!(r.max_hop, 1);
    }

    #[test]
    fn concurrent_observations() {
        let agg = Arc::new(ResultAggregator::new());
        let id = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let agg = Arc::clone(&agg);
                thread::spawn(move || {
                    for _ in 0..100 {
                        agg.observe(id, obs(1, 1, 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(agg.get(&id).unwrap().total_devices_checked, 800);
    }

    #[test]
    fn csv_export() {
        let agg = ResultAggregator::new();
        let id = Uuid::from_u128(1);
        agg.observe(id, obs(2, 10, 1));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        agg.export_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("ID,Total Hops,Total Devices,Devices with Metric,Max Hops,Hop Limit,Time Start,Time End,Type")
        );
        let row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(row[0], id.to_string());
        assert_eq!(&row[1..6], &["2", "10", "1", "2", "3"]);
        assert_eq!(row[8], "flood");
    }

    #[test]
    fn clear_drops_everything() {
        let agg = ResultAggregator::new();
        agg.track(Uuid::new_v4(), QueryType::RandomWalk, 5);
        agg.clear();
        assert!(agg.is_empty());
    }
}
