//! Binary message codec.
//!
//! Every message starts with a one-byte tag. Fields follow in a fixed order:
//! strings (identifiers, addresses, names) as a 4-byte big-endian length and
//! UTF-8 bytes, numbers as 4-byte big-endian integers, lists as a 4-byte count
//! followed by their items.
//!
//! Transport framing (the outer length prefix) is not handled here.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chorus_topology::PeerAddress;
use thiserror::Error;
use uuid::Uuid;

/// Hop limit meaning "no limit". Only floods honour it.
pub const UNLIMITED_HOPS: i32 = -1;

/// Decoding failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty message")]
    Empty,

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("truncated message: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("field is not UTF-8")]
    InvalidUtf8,

    #[error("invalid query id: {0}")]
    InvalidUuid(String),

    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("invalid gossip type {0}")]
    InvalidGossipType(i32),
}

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Flood = 0,
    RandomWalk = 1,
    GossipData = 2,
    GossipEntries = 3,
    GossipQuery = 4,
    Introduction = 5,
    Register = 6,
    InitiateConnections = 7,
    Shutdown = 8,
    ListPeersRequest = 9,
    ListPeersResponse = 10,
}

impl TryFrom<u8> for Tag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Tag::Flood,
            1 => Tag::RandomWalk,
            2 => Tag::GossipData,
            3 => Tag::GossipEntries,
            4 => Tag::GossipQuery,
            5 => Tag::Introduction,
            6 => Tag::Register,
            7 => Tag::InitiateConnections,
            8 => Tag::Shutdown,
            9 => Tag::ListPeersRequest,
            10 => Tag::ListPeersResponse,
            other => return Err(WireError::UnknownTag(other)),
        })
    }
}

/// Which gossip table a gossip query routes by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GossipType {
    /// Route toward neighbours on a short path to the metric.
    Distance,
    /// Route directly to peers known to hold the metric.
    Location,
}

impl GossipType {
    pub fn code(self) -> i32 {
        match self {
            GossipType::Distance => 0,
            GossipType::Location => 1,
        }
    }
}

impl TryFrom<i32> for GossipType {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(GossipType::Distance),
            1 => Ok(GossipType::Location),
            other => Err(WireError::InvalidGossipType(other)),
        }
    }
}

/// A hop of a flood, random walk, or gossip query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMessage {
    pub id: Uuid,
    /// Peer that sent this hop.
    pub sender: PeerAddress,
    /// Where results go.
    pub originator: PeerAddress,
    pub target_metric: String,
    pub current_hop: i32,
    /// [`UNLIMITED_HOPS`] for an unbounded flood.
    pub hop_limit: i32,
    pub total_devices_checked: i32,
    pub total_devices_with_metric: i32,
}

impl QueryMessage {
    /// A fresh hop-0 query with a random id, sent by its originator.
    pub fn new(originator: PeerAddress, target_metric: impl Into<String>, hop_limit: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: originator.clone(),
            originator,
            target_metric: target_metric.into(),
            current_hop: 0,
            hop_limit,
            total_devices_checked: 0,
            total_devices_with_metric: 0,
        }
    }

    /// The next hop, sent by `sender`, carrying the given totals.
    pub fn next_hop(&self, sender: &PeerAddress, checked: i32, with_metric: i32) -> Self {
        Self {
            id: self.id,
            sender: sender.clone(),
            originator: self.originator.clone(),
            target_metric: self.target_metric.clone(),
            current_hop: self.current_hop.saturating_add(1),
            hop_limit: self.hop_limit,
            total_devices_checked: checked,
            total_devices_with_metric: with_metric,
        }
    }

    /// Whether the hop after this one may travel further.
    pub fn may_forward(&self) -> bool {
        self.current_hop.saturating_add(1) < self.hop_limit
    }
}

/// Everything that travels between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Flood(QueryMessage),
    RandomWalk(QueryMessage),
    /// `(name, distance)` advertisement for the distance table.
    GossipData {
        sender: PeerAddress,
        entries: Vec<(String, u32)>,
    },
    /// `(holder, name)` advertisement for the location table.
    GossipEntries {
        sender: PeerAddress,
        entries: Vec<(PeerAddress, String)>,
    },
    GossipQuery {
        query: QueryMessage,
        gossip_type: GossipType,
    },
    /// First message on every dialed connection.
    Introduction { identity: PeerAddress },
    Register {
        identity: PeerAddress,
        device_string: String,
    },
    InitiateConnections {
        neighbors: Vec<PeerAddress>,
        device_string: String,
    },
    Shutdown,
    ListPeersRequest,
    ListPeersResponse {
        peer: PeerAddress,
        neighbors: Vec<PeerAddress>,
    },
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Flood(_) => Tag::Flood,
            Message::RandomWalk(_) => Tag::RandomWalk,
            Message::GossipData { .. } => Tag::GossipData,
            Message::GossipEntries { .. } => Tag::GossipEntries,
            Message::GossipQuery { .. } => Tag::GossipQuery,
            Message::Introduction { .. } => Tag::Introduction,
            Message::Register { .. } => Tag::Register,
            Message::InitiateConnections { .. } => Tag::InitiateConnections,
            Message::Shutdown => Tag::Shutdown,
            Message::ListPeersRequest => Tag::ListPeersRequest,
            Message::ListPeersResponse { .. } => Tag::ListPeersResponse,
        }
    }

    /// The query carried by a flood, walk, or gossip query.
    pub fn query(&self) -> Option<&QueryMessage> {
        match self {
            Message::Flood(q) | Message::RandomWalk(q) => Some(q),
            Message::GossipQuery { query, .. } => Some(query),
            _ => None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.tag() as u8);

        match self {
            Message::Flood(q) | Message::RandomWalk(q) => put_query(&mut buf, q),
            Message::GossipQuery { query, gossip_type } => {
                put_query(&mut buf, query);
                buf.put_i32(gossip_type.code());
            }
            Message::GossipData { sender, entries } => {
                put_addr(&mut buf, sender);
                buf.put_u32(entries.len() as u32);
                for (name, distance) in entries {
                    put_str(&mut buf, name);
                    buf.put_u32(*distance);
                }
            }
            Message::GossipEntries { sender, entries } => {
                put_addr(&mut buf, sender);
                buf.put_u32(entries.len() as u32);
                for (holder, name) in entries {
                    put_addr(&mut buf, holder);
                    put_str(&mut buf, name);
                }
            }
            Message::Introduction { identity } => put_addr(&mut buf, identity),
            Message::Register {
                identity,
                device_string,
            } => {
                put_addr(&mut buf, identity);
                put_str(&mut buf, device_string);
            }
            Message::InitiateConnections {
                neighbors,
                device_string,
            } => {
                put_addrs(&mut buf, neighbors);
                put_str(&mut buf, device_string);
            }
            Message::Shutdown | Message::ListPeersRequest => {}
            Message::ListPeersResponse { peer, neighbors } => {
                put_addr(&mut buf, peer);
                put_addrs(&mut buf, neighbors);
            }
        }

        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader(bytes);
        let tag = Tag::try_from(r.u8().map_err(|_| WireError::Empty)?)?;

        let message = match tag {
            Tag::Flood => Message::Flood(r.query()?),
            Tag::RandomWalk => Message::RandomWalk(r.query()?),
            Tag::GossipQuery => {
                let query = r.query()?;
                let gossip_type = GossipType::try_from(r.i32()?)?;
                Message::GossipQuery { query, gossip_type }
            }
            Tag::GossipData => {
                let sender = r.addr()?;
                let count = r.u32()?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    entries.push((r.string()?, r.u32()?));
                }
                Message::GossipData { sender, entries }
            }
            Tag::GossipEntries => {
                let sender = r.addr()?;
                let count = r.u32()?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    entries.push((r.addr()?, r.string()?));
                }
                Message::GossipEntries { sender, entries }
            }
            Tag::Introduction => Message::Introduction {
                identity: r.addr()?,
            },
            Tag::Register => Message::Register {
                identity: r.addr()?,
                device_string: r.string()?,
            },
            Tag::InitiateConnections => Message::InitiateConnections {
                neighbors: r.addrs()?,
                device_string: r.string()?,
            },
            Tag::Shutdown => Message::Shutdown,
            Tag::ListPeersRequest => Message::ListPeersRequest,
            Tag::ListPeersResponse => Message::ListPeersResponse {
                peer: r.addr()?,
                neighbors: r.addrs()?,
            },
        };

        match r.0.remaining() {
            0 => Ok(message),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_addr(buf: &mut BytesMut, addr: &PeerAddress) {
    put_str(buf, &addr.identity_key());
}

fn put_addrs(buf: &mut BytesMut, addrs: &[PeerAddress]) {
    buf.put_u32(addrs.len() as u32);
    for addr in addrs {
        put_addr(buf, addr);
    }
}

fn put_query(buf: &mut BytesMut, q: &QueryMessage) {
    put_str(buf, &q.id.to_string());
    put_addr(buf, &q.sender);
    put_addr(buf, &q.originator);
    put_str(buf, &q.target_metric);
    buf.put_i32(q.current_hop);
    buf.put_i32(q.hop_limit);
    buf.put_i32(q.total_devices_checked);
    buf.put_i32(q.total_devices_with_metric);
}

/// Bounds-checked cursor over an encoded message.
struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn need(&self, needed: usize) -> Result<(), WireError> {
        let remaining = self.0.remaining();
        if remaining < needed {
            return Err(WireError::Truncated { needed, remaining });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.0.get_u32())
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        self.need(4)?;
        Ok(self.0.get_i32())
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let (field, rest) = self.0.split_at(len);
        self.0 = rest;
        String::from_utf8(field.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    fn addr(&mut self) -> Result<PeerAddress, WireError> {
        let key = self.string()?;
        key.parse().map_err(|_| WireError::InvalidAddress(key))
    }

    fn addrs(&mut self) -> Result<Vec<PeerAddress>, WireError> {
        let count = self.u32()?;
        let mut out = Vec::new();
        for _ in 0..count {
            out.push(self.addr()?);
        }
        Ok(out)
    }

    fn query(&mut self) -> Result<QueryMessage, WireError> {
        let id = self.string()?;
        let id = Uuid::parse_str(&id).map_err(|_| WireError::InvalidUuid(id))?;
        Ok(QueryMessage {
            id,
            sender: self.addr()?,
            originator: self.addr()?,
            target_metric: self.string()?,
            current_hop: self.i32()?,
            hop_limit: self.i32()?,
            total_devices_checked: self.i32()?,
            total_devices_with_metric: self.i32()?,
        })
    }
}
