//! Peer process.
//!
//! A peer registers with the registry, waits for its overlay neighbour list,
//! dials the neighbours it is responsible for, and from then on answers and
//! forwards queries through its [`PropagationEngine`]. Each connection's
//! reader task runs [`PeerNode::on_message`] directly.

use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use chorus_protocols::{Message, Outbound, PropagationEngine, ProtocolError};
use chorus_topology::PeerAddress;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commands::{PeerCommand, PEER_HELP};
use crate::config::PeerConfig;
use crate::devices::{DeviceSet, Inventory};
use crate::error::Result;
use crate::transport::{self, Envelope, Handler, OverlayLinks, Transport};

/// A running peer.
pub struct PeerNode {
    identity: PeerAddress,
    config: PeerConfig,
    transport: Arc<Transport>,
    links: OverlayLinks,
    engine: PropagationEngine<DeviceSet>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerNode {
    /// Bind, register with the registry, and start serving.
    pub async fn start(config: PeerConfig) -> Result<Arc<Self>> {
        let listener = transport::bind(&config.listen).await?;
        let identity = PeerAddress::new(config.listen.host.clone(), listener.local_addr()?.port());

        let mut rng = rand::thread_rng();
        let inventory = match config.device_count {
            0 => Inventory::random(&mut rng),
            n => Inventory::with_total(n, &mut rng),
        };

        // Gossip tables are seeded once the registry assigns devices
        let node = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let handler: Handler = Arc::new(move |envelope: Envelope| {
                if let Some(node) = weak.upgrade() {
                    node.on_envelope(envelope);
                }
            });
            let transport = Transport::new(identity.clone(), handler);
            let (shutdown, _) = watch::channel(false);
            Self {
                links: OverlayLinks::new(Arc::clone(&transport)),
                engine: PropagationEngine::new(
                    identity.clone(),
                    DeviceSet::new(inventory),
                    config.engine_config(),
                ),
                identity,
                config,
                transport,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }
        });

        let tasks = vec![
            node.transport.spawn_listener(listener),
            tokio::spawn(Arc::clone(&node).gossip_loop()),
        ];
        *node.tasks.lock() = tasks;

        node.register();
        info!(
            identity = %node.identity,
            registry = %node.config.registry,
            devices = inventory.device_count(),
            "Peer started"
        );
        Ok(node)
    }

    pub fn identity(&self) -> &PeerAddress {
        &self.identity
    }

    pub fn engine(&self) -> &PropagationEngine<DeviceSet> {
        &self.engine
    }

    pub fn inventory(&self) -> Inventory {
        self.engine.metrics().inventory()
    }

    /// Overlay neighbours, sorted.
    pub fn neighbors(&self) -> Vec<PeerAddress> {
        self.links.neighbors()
    }

    fn register(&self) {
        let message = Message::Register {
            identity: self.identity.clone(),
            device_string: self.inventory().device_string(),
        };
        self.transport.send(&self.config.registry, message.encode());
    }

    fn on_envelope(&self, Envelope { from, message }: Envelope) {
        debug!(tag = ?message.tag(), from = ?from, "Received message");
        if !self.is_stopped() {
            self.on_message(message);
        }
    }

    /// Handle one message from the network.
    ///
    /// `InitiateConnections` adopts the assigned devices, reseeds the gossip
    /// tables, and links to the listed neighbours.
    pub fn on_message(&self, message: Message) {
        match message {
            Message::InitiateConnections {
                neighbors,
                device_string,
            } => self.initiate_connections(&neighbors, &device_string),
            Message::Introduction { identity } => {
                // Only overlay neighbours dial a peer with an introduction
                if identity != self.config.registry && identity != self.identity {
                    if self.links.link(identity.clone()) {
                        info!(peer = %identity, "Overlay neighbour connected");
                    }
                    self.engine.broadcast_state(&self.links);
                }
            }
            Message::ListPeersRequest => {
                let reply = Message::ListPeersResponse {
                    peer: self.identity.clone(),
                    neighbors: self.neighbors(),
                };
                self.transport.send(&self.config.registry, reply.encode());
            }
            Message::Shutdown => {
                info!("Shutdown requested by registry");
                self.stop();
            }
            other => match self.engine.handle(other, &self.links) {
                Ok(()) => {}
                Err(ProtocolError::NotPropagation(tag)) => {
                    warn!(?tag, "Unexpected message at a peer")
                }
                Err(e) => warn!("Failed to handle message: {}", e),
            },
        }
    }

    fn initiate_connections(&self, neighbors: &[PeerAddress], device_string: &str) {
        match device_string.parse::<Inventory>() {
            Ok(inventory) => {
                self.engine.metrics().replace(inventory);
                self.engine.seed_tables();
            }
            Err(e) => warn!("Keeping current devices: {}", e),
        }

        for peer in neighbors {
            self.links.link(peer.clone());
            self.transport.connect(peer);
        }
        info!(dialed = neighbors.len(), "Overlay connections initiated");
        self.engine.broadcast_state(&self.links);
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.gossip_interval);
        let mut stop = self.shutdown.subscribe();
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.neighbors().is_empty() {
                        debug!("Anti-entropy round");
                        self.engine.broadcast_state(&self.links);
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }

    /// Run an operator command and return its output.
    pub fn execute(&self, command: PeerCommand) -> String {
        match command {
            PeerCommand::Neighbors => {
                let neighbors = self.neighbors();
                let mut out = format!("{} neighbours", neighbors.len());
                for n in neighbors {
                    let _ = write!(out, "\n  {}", n);
                }
                out
            }
            PeerCommand::Devices => {
                let inventory = self.inventory();
                let mut out = format!(
                    "{} devices ({})",
                    inventory.device_count(),
                    inventory.device_string()
                );
                for (kind, count) in inventory.iter() {
                    let _ = write!(out, "\n  {:?} x{}", kind, count);
                }
                out
            }
            PeerCommand::GossipTables => {
                let mut out = String::from("distances:");
                for entry in self.engine.distance_snapshot() {
                    let holders: Vec<String> = entry.holders.iter().map(|h| h.to_string()).collect();
                    let _ = write!(
                        out,
                        "\n  {} distance {} via {}",
                        entry.name,
                        entry.distance,
                        holders.join(", ")
                    );
                }
                out.push_str("\nlocations:");
                for loc in self.engine.location_snapshot() {
                    let _ = write!(out, "\n  {} at {}", loc.name, loc.holder);
                }
                out
            }
            PeerCommand::Help => PEER_HELP.to_string(),
        }
    }

    /// Stop serving. Queued frames are still flushed.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.shutdown();
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the peer has stopped.
    pub async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenAddr;
    use std::collections::BTreeSet;
    use std::time::Duration;

    async fn lone_peer() -> Arc<PeerNode> {
        let config = PeerConfig {
            listen: ListenAddr {
                host: "127.0.0.1".into(),
                port: 0,
            },
            // Nothing listens here; registration is dropped with a warning
            registry: PeerAddress::new("127.0.0.1", 1),
            device_count: 5,
            cache_size: 100,
            query_cache_size: 40,
            gossip_interval: Duration::from_secs(60),
            skip_probability: 0.01,
        };
        PeerNode::start(config).await.unwrap()
    }

    fn own_names(peer: &PeerNode) -> (BTreeSet<String>, BTreeSet<String>) {
        let me = peer.identity().clone();
        let distances = peer
            .engine()
            .distance_snapshot()
            .into_iter()
            .filter(|e| e.distance == 0 && e.holders.contains(&me))
            .map(|e| e.name)
            .collect();
        let locations = peer
            .engine()
            .location_snapshot()
            .into_iter()
            .filter(|l| l.holder == me)
            .map(|l| l.name)
            .collect();
        (distances, locations)
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn assigned_devices_replace_advertised_metrics() {
        let peer = lone_peer().await;
        assert!(peer.engine().distance_snapshot().is_empty());
        assert!(peer.engine().location_snapshot().is_empty());

        // One air pollution monitor
        peer.on_message(Message::InitiateConnections {
            neighbors: Vec::new(),
            device_string: "1".into(),
        });
        let expected = names(&["AIR_QUALITY", "POWER_CONSUMPTION", "POWER_STATE"]);
        assert_eq!(own_names(&peer), (expected.clone(), expected));

        // Swapped for one light switch
        peer.on_message(Message::InitiateConnections {
            neighbors: Vec::new(),
            device_string: "0000001".into(),
        });
        let expected = names(&["LIGHT_STATUS", "POWER_CONSUMPTION"]);
        assert_eq!(own_names(&peer), (expected.clone(), expected.clone()));
        assert_eq!(peer.engine().distance_snapshot().len(), 2);
        assert_eq!(peer.engine().location_snapshot().len(), 2);
        assert_eq!(peer.inventory().device_count(), 1);

        peer.stop();
    }

    #[tokio::test]
    async fn listed_and_introduced_peers_become_neighbours() {
        let peer = lone_peer().await;
        let listed = PeerAddress::new("127.0.0.1", 3);
        let dialer = PeerAddress::new("127.0.0.1", 4);

        peer.on_message(Message::InitiateConnections {
            neighbors: vec![listed.clone()],
            device_string: "1".into(),
        });
        peer.on_message(Message::Introduction {
            identity: dialer.clone(),
        });
        // The registry is never an overlay neighbour
        peer.on_message(Message::Introduction {
            identity: PeerAddress::new("127.0.0.1", 1),
        });

        assert_eq!(peer.neighbors(), vec![listed, dialer]);
        peer.stop();
    }
}
