//! Registry process.
//!
//! The registry is the coordinator: peers register with it, it builds or
//! imports the overlay and hands every peer its connection list, it injects
//! queries at random peers, and it collects the partial results that flow
//! back.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use chorus_protocols::{
    GossipType, Message, QueryMessage, QueryType, ResultAggregator, ResultMetrics,
};
use chorus_topology::{NetworkMap, PeerAddress, TopologyBuilder};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::{RegistryCommand, REGISTRY_HELP};
use crate::config::RegistryConfig;
use crate::devices::Inventory;
use crate::error::{NodeError, Result};
use crate::transport::{self, Envelope, Handler, Transport};

/// A peer that has registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub identity: PeerAddress,
    pub inventory: Inventory,
}

/// Progress of the latest `checkpeers` round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayCheck {
    pub expected: usize,
    pub responses: usize,
    pub successes: usize,
}

#[derive(Debug, Serialize)]
struct ResultRow {
    id: Uuid,
    #[serde(flatten)]
    metrics: ResultMetrics,
}

/// A running registry.
pub struct RegistryNode {
    identity: PeerAddress,
    transport: Arc<Transport>,
    builder: TopologyBuilder,
    peers: Mutex<Vec<Registration>>,
    overlay: Mutex<Option<NetworkMap>>,
    check: Mutex<OverlayCheck>,
    results: ResultAggregator,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistryNode {
    /// Bind and start accepting registrations.
    pub async fn start(config: RegistryConfig) -> Result<Arc<Self>> {
        let listener = transport::bind(&config.listen).await?;
        let identity = PeerAddress::new(config.listen.host.clone(), listener.local_addr()?.port());
        let (shutdown, _) = watch::channel(false);

        let node = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let handler: Handler = Arc::new(move |Envelope { from, message }: Envelope| {
                if let Some(node) = weak.upgrade() {
                    debug!(tag = ?message.tag(), from = ?from, "Received message");
                    node.on_message(message);
                }
            });
            Self {
                transport: Transport::new(identity.clone(), handler),
                identity,
                builder: TopologyBuilder::default(),
                peers: Mutex::new(Vec::new()),
                overlay: Mutex::new(None),
                check: Mutex::new(OverlayCheck::default()),
                results: ResultAggregator::new(),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }
        });

        *node.tasks.lock() = vec![node.transport.spawn_listener(listener)];

        info!(identity = %node.identity, "Registry started");
        Ok(node)
    }

    pub fn identity(&self) -> &PeerAddress {
        &self.identity
    }

    pub fn results(&self) -> &ResultAggregator {
        &self.results
    }

    /// Registered peers in registration order.
    pub fn peers(&self) -> Vec<Registration> {
        self.peers.lock().clone()
    }

    pub fn overlay(&self) -> Option<NetworkMap> {
        self.overlay.lock().clone()
    }

    pub fn overlay_check(&self) -> OverlayCheck {
        *self.check.lock()
    }

    /// Handle one message from the network.
    pub fn on_message(&self, message: Message) {
        match message {
            Message::Register {
                identity,
                device_string,
            } => {
                self.register(identity, &device_string);
            }
            Message::ListPeersResponse { peer, neighbors } => self.record_check(&peer, &neighbors),
            Message::Introduction { identity } => debug!(%identity, "Connection introduced"),
            other => {
                if !self.results.observe_message(&other) {
                    warn!(tag = ?other.tag(), "Unexpected message at the registry");
                }
            }
        }
    }

    /// Add a peer. Returns false when the registration is refused.
    pub fn register(&self, identity: PeerAddress, device_string: &str) -> bool {
        if identity == self.identity {
            warn!(%identity, "Refusing registration under the registry's own address");
            return false;
        }
        let inventory = match device_string.parse::<Inventory>() {
            Ok(inventory) => inventory,
            Err(e) => {
                warn!(%identity, "Refusing registration: {}", e);
                return false;
            }
        };

        let mut peers = self.peers.lock();
        if peers.iter().any(|p| p.identity == identity) {
            warn!(%identity, "Duplicate registration ignored");
            return false;
        }
        peers.push(Registration {
            identity: identity.clone(),
            inventory,
        });
        info!(%identity, registered = peers.len(), "Peer registered");
        true
    }

    fn record_check(&self, peer: &PeerAddress, neighbors: &[PeerAddress]) {
        let overlay = self.overlay.lock();
        let Some(map) = overlay.as_ref() else {
            warn!(%peer, "Neighbour report without an overlay");
            return;
        };
        let expected: BTreeSet<PeerAddress> = match map.neighbors(peer) {
            Ok(list) => list.into_iter().map(|(p, _)| p).collect(),
            Err(e) => {
                warn!(%peer, "Neighbour report from outside the overlay: {}", e);
                return;
            }
        };
        let actual: BTreeSet<PeerAddress> = neighbors.iter().cloned().collect();

        let mut check = self.check.lock();
        check.responses += 1;
        if expected == actual {
            check.successes += 1;
            info!(
                %peer,
                successes = check.successes,
                expected = check.expected,
                "Peer neighbours match the overlay"
            );
        } else {
            let missing: Vec<String> = expected.difference(&actual).map(|p| p.to_string()).collect();
            let unexpected: Vec<String> = actual.difference(&expected).map(|p| p.to_string()).collect();
            warn!(%peer, ?missing, ?unexpected, "Peer neighbours differ from the overlay");
        }
    }

    /// Run an operator command and return its output.
    pub fn execute(&self, command: RegistryCommand) -> Result<String> {
        match command {
            RegistryCommand::ListPeers => {
                let peers = self.peers();
                let mut out = format!("{} registered peers", peers.len());
                for p in peers {
                    let _ = write!(
                        out,
                        "\n  {} ({} devices)",
                        p.identity,
                        p.inventory.device_count()
                    );
                }
                Ok(out)
            }
            RegistryCommand::BuildOverlay {
                min_degree,
                max_degree,
            } => self.build_overlay(min_degree, max_degree),
            RegistryCommand::ExportOverlay(path) => {
                let overlay = self.overlay.lock();
                let map = overlay.as_ref().ok_or_else(no_overlay)?;
                map.save(&path)?;
                Ok(format!("Overlay written to {}", path.display()))
            }
            RegistryCommand::ImportOverlay(path) => {
                let identities: Vec<PeerAddress> =
                    self.peers().into_iter().map(|p| p.identity).collect();
                let map = NetworkMap::load(&path)?.retarget(&identities)?;
                let summary = format!(
                    "Imported overlay: {} vertices, {} edges",
                    map.len(),
                    map.edge_count()
                );
                *self.overlay.lock() = Some(map);
                Ok(summary)
            }
            RegistryCommand::ConnectPeers => self.connect_peers(),
            RegistryCommand::CheckPeers => self.check_peers(),
            RegistryCommand::Query {
                query_type,
                metric,
                hop_limit,
            } => {
                let (id, entry) = self.inject(query_type, &metric, hop_limit)?;
                Ok(format!("Started {} query {} at {}", query_type, id, entry))
            }
            RegistryCommand::PrintResults => {
                let rows: Vec<ResultRow> = self
                    .results
                    .snapshot()
                    .into_iter()
                    .map(|(id, metrics)| ResultRow { id, metrics })
                    .collect();
                Ok(serde_json::to_string_pretty(&rows)?)
            }
            RegistryCommand::ExportResults(path) => {
                self.results.export_csv(&path)?;
                Ok(format!(
                    "{} results written to {}",
                    self.results.len(),
                    path.display()
                ))
            }
            RegistryCommand::ClearResults => {
                self.results.clear();
                Ok("Results cleared".to_string())
            }
            RegistryCommand::Shutdown => {
                let count = self.shutdown_peers();
                self.stop();
                Ok(format!("Shutdown sent to {} peers", count))
            }
            RegistryCommand::Help => Ok(REGISTRY_HELP.to_string()),
        }
    }

    fn build_overlay(&self, min_degree: usize, max_degree: usize) -> Result<String> {
        let peers: Vec<(PeerAddress, u32)> = self
            .peers()
            .into_iter()
            .map(|p| (p.identity, p.inventory.device_count() as u32))
            .collect();
        let map =
            self.builder
                .build_with_devices(&peers, min_degree, max_degree, &mut rand::thread_rng())?;
        let summary = format!(
            "Built overlay: {} vertices, {} edges",
            map.len(),
            map.edge_count()
        );
        info!(vertices = map.len(), edges = map.edge_count(), "Overlay built");
        *self.overlay.lock() = Some(map);
        Ok(summary)
    }

    /// Send each vertex its connection-initiation list and device string.
    ///
    /// A peer keeps its registered devices when their count matches the
    /// vertex. Otherwise it gets a fresh inventory of the vertex's size, as
    /// happens after importing an overlay built elsewhere.
    fn connect_peers(&self) -> Result<String> {
        let overlay = self.overlay.lock();
        let map = overlay.as_ref().ok_or_else(no_overlay)?;
        let registered = self.peers();
        let mut rng = rand::thread_rng();

        for vertex in map.vertices() {
            let neighbors = map.connection_initiation_list(&vertex.identity)?;
            let inventory = registered
                .iter()
                .find(|r| r.identity == vertex.identity)
                .map(|r| r.inventory)
                .filter(|inv| inv.device_count() == vertex.device_count as usize)
                .unwrap_or_else(|| Inventory::with_total(vertex.device_count as usize, &mut rng));
            let message = Message::InitiateConnections {
                neighbors,
                device_string: inventory.device_string(),
            };
            self.transport.send(&vertex.identity, message.encode());
        }
        info!(peers = map.len(), "Connection lists sent");
        Ok(format!("Sent connection lists to {} peers", map.len()))
    }

    fn check_peers(&self) -> Result<String> {
        let overlay = self.overlay.lock();
        let map = overlay.as_ref().ok_or_else(no_overlay)?;
        *self.check.lock() = OverlayCheck {
            expected: map.len(),
            ..OverlayCheck::default()
        };
        let request = Message::ListPeersRequest.encode();
        for vertex in map.vertices() {
            self.transport.send(&vertex.identity, request.clone());
        }
        Ok(format!("Requested neighbour lists from {} peers", map.len()))
    }

    /// Start a query at a uniformly random registered peer.
    pub fn inject(
        &self,
        query_type: QueryType,
        metric: &str,
        hop_limit: i32,
    ) -> Result<(Uuid, PeerAddress)> {
        let entry = self
            .peers
            .lock()
            .choose(&mut rand::thread_rng())
            .map(|p| p.identity.clone())
            .ok_or_else(|| NodeError::Command("no registered peers".into()))?;

        let query = QueryMessage::new(self.identity.clone(), metric, hop_limit);
        let id = query.id;
        self.results.track(id, query_type, hop_limit);

        let message = match query_type {
            QueryType::Flood => Message::Flood(query),
            QueryType::RandomWalk => Message::RandomWalk(query),
            QueryType::GossipDistance => Message::GossipQuery {
                query,
                gossip_type: GossipType::Distance,
            },
            QueryType::GossipLocation => Message::GossipQuery {
                query,
                gossip_type: GossipType::Location,
            },
        };
        self.transport.send(&entry, message.encode());
        info!(%id, %entry, %query_type, metric, hop_limit, "Query injected");
        Ok((id, entry))
    }

    fn shutdown_peers(&self) -> usize {
        let peers = self.peers();
        let shutdown = Message::Shutdown.encode();
        for p in &peers {
            self.transport.send(&p.identity, shutdown.clone());
        }
        info!(peers = peers.len(), "Shutdown sent");
        peers.len()
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

    /// Resolves once the registry has stopped.
    pub async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

fn no_overlay() -> NodeError {
    NodeError::Command("no overlay; run buildoverlay or importoverlay first".into())
}
