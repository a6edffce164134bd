//! Chorus Protocols - Query Propagation over the Overlay
//!
//! This crate holds everything a node needs to take part in a query, minus
//! the sockets.
//!
//! # Overview
//!
//! ## Wire Format
//!
//! [`Message`] is the closed set of messages nodes exchange. Each encodes to a
//! tag byte followed by length-prefixed strings and big-endian integers.
//!
//! ## Propagation
//!
//! [`PropagationEngine`] runs one peer's side of the three protocols:
//!
//! - **Flood**: the accumulated totals ride one random branch; other branches
//!   carry the totals as received, until the hop limit
//! - **Random walk**: one copy moves to one random neighbour per hop
//! - **Gossip**: the query follows the distance or location table toward
//!   peers that hold the metric
//!
//! The engine never touches the network directly. It writes through an
//! [`Outbound`] handle and reads device counts from a [`MetricSource`].
//!
//! ## Aggregation
//!
//! [`ResultAggregator`] sums the partial results that reach the originator.
//!
//! # Example
//!
//! ```rust,ignore
//! use chorus_protocols::{EngineConfig, Message, PropagationEngine};
//!
//! let engine = PropagationEngine::new(me, inventory, EngineConfig::default());
//! engine.seed_tables();
//!
//! // For every decoded frame
//! let message = Message::decode(&frame)?;
//! engine.handle(message, &connections)?;
//! ```

pub mod aggregator;
pub mod engine;
pub mod error;
pub mod wire;

pub use aggregator::{Observation, QueryType, ResultAggregator, ResultMetrics, RESULTS_HEADER};
pub use engine::{EngineConfig, MetricSource, Outbound, PropagationEngine};
pub use error::{ProtocolError, Result};
pub use wire::{GossipType, Message, QueryMessage, Tag, WireError, UNLIMITED_HOPS};
