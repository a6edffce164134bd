//! Chorus node processes.
//!
//! The peer and registry processes that run the overlay over TCP.
//!
//! # Architecture
//!
//! - **Config**: `CHORUS_*` environment variables with positional overrides
//! - **Devices**: the simulated device inventory a peer answers queries from
//! - **Transport**: length-framed TCP with a lazily dialed connection cache;
//!   readers hand each frame straight to the owning process
//! - **Peer**: registers, dials its overlay neighbours, runs the propagation engine
//! - **Registry**: builds the overlay, injects queries, and aggregates results
//! - **Commands**: the operator command surface of both processes
//!
//! # Example
//!
//! ```no_run
//! use chorus_node::{PeerConfig, PeerNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PeerConfig::from_env()?;
//!     let peer = PeerNode::start(config).await?;
//!     peer.stopped().await;
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod config;
pub mod devices;
pub mod error;
pub mod peer;
pub mod registry;
pub mod transport;

pub use commands::{PeerCommand, RegistryCommand, PEER_HELP, REGISTRY_HELP};
pub use config::{ListenAddr, PeerConfig, RegistryConfig};
pub use devices::{DeviceKind, DeviceSet, Inventory};
pub use error::{NodeError, Result};
pub use peer::PeerNode;
pub use registry::{OverlayCheck, Registration, RegistryNode};
pub use transport::{Envelope, Handler, OverlayLinks, Transport};
