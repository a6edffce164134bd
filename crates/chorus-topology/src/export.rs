//! Overlay files.
//!
//! The first record is `minDegree,maxDegree`. Every further record is one edge:
//!
//! ```text
//! firstId,firstIdentityKey,firstDeviceCount,secondId,secondIdentityKey,secondDeviceCount,cost
//! ```
//!
//! Fields are split by the `csv` crate, so identity keys containing commas or
//! quotes survive a round trip.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tracing::info;

use crate::error::{Result, TopologyError};
use crate::graph::{Edge, EdgeEnd, NetworkMap};
use crate::PeerAddress;

const EDGE_FIELDS: usize = 7;

impl NetworkMap {
    /// Write this overlay as CSV.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut out = WriterBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_writer(writer);

        out.write_record([self.min_degree().to_string(), self.max_degree().to_string()])?;
        for edge in self.edges() {
            let Some(second) = &edge.second else { continue };
            out.write_record([
                edge.first.id.to_string(),
                edge.first.identity.identity_key(),
                edge.first.device_count.to_string(),
                second.id.to_string(),
                second.identity.identity_key(),
                second.device_count.to_string(),
                edge.cost.to_string(),
            ])?;
        }
        out.flush()?;
        Ok(())
    }

    /// The CSV text of this overlay.
    pub fn export_csv(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        String::from_utf8(buf).map_err(|e| TopologyError::Malformed {
            line: 0,
            reason: e.to_string(),
        })
    }

    /// Read an overlay from CSV and re-verify its degree band.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new()
            .flexible(true)
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut records = rdr.records();
        let header = records.next().ok_or(TopologyError::Malformed {
            line: 1,
            reason: "missing degree header".into(),
        })??;
        if header.len() != 2 {
            return Err(malformed(&header, "expected minDegree,maxDegree"));
        }
        let min_degree = parse_field(&header, 0)?;
        let max_degree = parse_field(&header, 1)?;

        let mut edges = Vec::new();
        for record in records {
            let record = record?;
            if record.len() != EDGE_FIELDS {
                return Err(malformed(&record, "expected 7 fields"));
            }
            edges.push(Edge {
                first: EdgeEnd {
                    id: parse_field(&record, 0)?,
                    identity: parse_field(&record, 1)?,
                    device_count: parse_field(&record, 2)?,
                },
                second: Some(EdgeEnd {
                    id: parse_field(&record, 3)?,
                    identity: parse_field(&record, 4)?,
                    device_count: parse_field(&record, 5)?,
                }),
                cost: parse_field(&record, 6)?,
            });
        }

        NetworkMap::from_edges(min_degree, max_degree, &edges)
    }

    /// Parse CSV text into an overlay.
    pub fn import_csv(data: &str) -> Result<Self> {
        Self::read_csv(data.as_bytes())
    }

    /// Save to a file, replacing it.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.write_csv(File::create(path)?)?;
        info!(path = %path.display(), edges = self.edge_count(), "Overlay exported");
        Ok(())
    }

    /// Load from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let map = Self::read_csv(File::open(path)?)?;
        info!(path = %path.display(), vertices = map.len(), "Overlay imported");
        Ok(map)
    }

    /// Move this overlay onto a new set of peers.
    ///
    /// The vertex with the lowest id takes `peers[0]`, the next takes
    /// `peers[1]`, and so on. Ids, edges, costs, and device counts are kept.
    pub fn retarget(&self, peers: &[PeerAddress]) -> Result<Self> {
        if peers.len() != self.len() {
            return Err(TopologyError::SizeMismatch {
                expected: self.len(),
                actual: peers.len(),
            });
        }

        let mut map = NetworkMap::new(self.min_degree(), self.max_degree());
        for (vertex, peer) in self.vertices().iter().zip(peers) {
            map.add_vertex(vertex.id, peer.clone(), vertex.device_count)?;
        }
        for (idx, vertex) in self.vertices().iter().enumerate() {
            for (n, cost) in vertex.edges() {
                if *n > idx {
                    map.connect(idx, *n, *cost)?;
                }
            }
        }
        map.verify()?;
        Ok(map)
    }
}

fn line_of(record: &StringRecord) -> u64 {
    record.position().map_or(0, |p| p.line())
}

fn malformed(record: &StringRecord, reason: &str) -> TopologyError {
    TopologyError::Malformed {
        line: line_of(record),
        reason: reason.to_string(),
    }
}

fn parse_field<T: std::str::FromStr>(record: &StringRecord, idx: usize) -> Result<T> {
    record
        .get(idx)
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| malformed(record, &format!("bad value in column {}", idx + 1)))
}
