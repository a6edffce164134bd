//! TCP transport with a lazily dialed connection cache.
//!
//! Every frame is a 4-byte big-endian length followed by one encoded
//! [`Message`]. Each connection runs a reader task that decodes frames and
//! hands them to the process's [`Handler`] in arrival order, and a writer
//! task that drains an unbounded queue, so sending never blocks the caller.
//!
//! Cached connections are keyed by the remote peer's listening address. A
//! dialer always sends `Introduction` first so the acceptor can key the
//! connection the same way. One-off sends ([`Transport::send_once`]) open an
//! unintroduced connection, write a single frame, and close it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chorus_protocols::{Message, Outbound};
use chorus_topology::PeerAddress;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ListenAddr;
use crate::error::{NodeError, Result};

/// Largest frame accepted from the network.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A decoded message and the peer it came from, if the connection has been
/// introduced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: Option<PeerAddress>,
    pub message: Message,
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(NodeError::FrameTooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read one length-prefixed frame. `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Bytes>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(NodeError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

/// Receives every decoded message, called from the connection's reader task.
pub type Handler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Bind a TCP listener.
pub async fn bind(listen: &ListenAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind((listen.host.as_str(), listen.port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Open connections of one process, keyed by remote identity.
pub struct Transport {
    identity: PeerAddress,
    connections: DashMap<PeerAddress, mpsc::UnboundedSender<Bytes>>,
    handler: Handler,
    closing: watch::Sender<bool>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("identity", &self.identity)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Create a transport that passes every decoded message to `handler`.
    pub fn new(identity: PeerAddress, handler: Handler) -> Arc<Self> {
        let (closing, _) = watch::channel(false);
        Arc::new(Self {
            identity,
            connections: DashMap::new(),
            handler,
            closing,
        })
    }

    pub fn identity(&self) -> &PeerAddress {
        &self.identity
    }

    /// Accept connections until the task is aborted.
    pub fn spawn_listener(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(%remote, "Accepted connection");
                        this.attach(stream, remote.to_string());
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        })
    }

    fn attach(self: &Arc<Self>, stream: TcpStream, label: String) {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(self).write_loop(writer, rx));
        tokio::spawn(Arc::clone(self).read_loop(reader, label, None, tx));
    }

    /// The send queue for `peer`, dialing if there is no open connection.
    /// The dial happens in the background; frames queue up meanwhile.
    pub fn connect(self: &Arc<Self>, peer: &PeerAddress) -> mpsc::UnboundedSender<Bytes> {
        if self.is_shut_down() {
            let (closed, _) = mpsc::unbounded_channel();
            return closed;
        }
        self.connections.remove_if(peer, |_, tx| tx.is_closed());

        let mut fresh = None;
        let tx = self
            .connections
            .entry(peer.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let intro = Message::Introduction {
                    identity: self.identity.clone(),
                };
                // Queued before the entry is visible to other senders
                let _ = tx.send(intro.encode());
                fresh = Some(rx);
                tx
            })
            .value()
            .clone();

        if let Some(rx) = fresh {
            tokio::spawn(Arc::clone(self).dial(peer.clone(), tx.clone(), rx));
        }
        tx
    }

    async fn dial(
        self: Arc<Self>,
        peer: PeerAddress,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        match TcpStream::connect((peer.host.as_str(), peer.port)).await {
            Ok(stream) => {
                debug!(%peer, "Connected");
                let (reader, writer) = stream.into_split();
                tokio::spawn(Arc::clone(&self).read_loop(
                    reader,
                    peer.to_string(),
                    Some(peer),
                    tx,
                ));
                self.write_loop(writer, rx).await;
            }
            Err(e) => {
                warn!(%peer, "Dial failed: {}", e);
                drop(rx);
                self.connections.remove_if(&peer, |_, t| t.same_channel(&tx));
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        label: String,
        mut identity: Option<PeerAddress>,
        writer: mpsc::UnboundedSender<Bytes>,
    ) {
        let mut closing = self.closing.subscribe();
        loop {
            let read = tokio::select! {
                read = read_frame(&mut reader) => read,
                _ = closing.changed() => break,
            };
            let frame = match read {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(remote = %label, "Connection closed");
                    break;
                }
                Err(e) => {
                    warn!(remote = %label, "Read error: {}", e);
                    break;
                }
            };

            let message = match Message::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(remote = %label, "Dropping connection after bad frame: {}", e);
                    break;
                }
            };

            if let Message::Introduction { identity: ref remote } = message {
                if identity.is_none() {
                    info!(remote = %label, peer = %remote, "Peer introduced");
                    self.connections.insert(remote.clone(), writer.clone());
                    identity = Some(remote.clone());
                }
            }

            (self.handler)(Envelope {
                from: identity.clone(),
                message,
            });
        }

        if let Some(peer) = identity {
            self.connections
                .remove_if(&peer, |_, tx| tx.same_channel(&writer));
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                warn!("Write error: {}", e);
                break;
            }
        }
        drop(rx);
        self.connections.retain(|_, tx| !tx.is_closed());
    }

    /// Queue `payload` for `peer`.
    pub fn send(self: &Arc<Self>, peer: &PeerAddress, payload: Bytes) {
        if self.is_shut_down() {
            return;
        }
        if self.connect(peer).send(payload).is_err() {
            warn!(%peer, "Connection gone, message dropped");
            self.connections.remove_if(peer, |_, tx| tx.is_closed());
        }
    }

    /// Deliver one frame without joining the connection cache.
    ///
    /// An open cached connection to `peer` is reused. Otherwise a fresh
    /// connection carries the frame, unintroduced, and is closed after it.
    pub fn send_once(self: &Arc<Self>, peer: &PeerAddress, mut payload: Bytes) {
        if self.is_shut_down() {
            return;
        }
        let cached = self.connections.get(peer).map(|tx| tx.value().clone());
        if let Some(tx) = cached {
            match tx.send(payload) {
                Ok(()) => return,
                Err(mpsc::error::SendError(p)) => payload = p,
            }
        }

        let peer = peer.clone();
        tokio::spawn(async move {
            let sent = async {
                let mut stream = TcpStream::connect((peer.host.as_str(), peer.port)).await?;
                write_frame(&mut stream, &payload).await?;
                stream.shutdown().await?;
                Ok::<_, NodeError>(())
            };
            match sent.await {
                Ok(()) => debug!(%peer, "One-off frame delivered"),
                Err(e) => warn!(%peer, "One-off send failed: {}", e),
            }
        });
    }

    /// Identities with an open connection, sorted.
    pub fn peers(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self
            .connections
            .iter()
            .filter(|c| !c.value().is_closed())
            .map(|c| c.key().clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn is_connected(&self, peer: &PeerAddress) -> bool {
        self.connections
            .get(peer)
            .map_or(false, |tx| !tx.is_closed())
    }

    /// Close every connection and refuse new sends. Writers flush what is
    /// already queued before their sockets close.
    pub fn shutdown(&self) {
        self.closing.send_replace(true);
        self.connections.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        *self.closing.borrow()
    }
}

/// The overlay neighbours of a peer and the transport that reaches them.
///
/// Only peers added with [`link`](Self::link) are neighbours. Sends to anyone
/// else (originator replies, gossip jumps to distant holders) go out as
/// one-off frames and never become links.
#[derive(Debug, Clone)]
pub struct OverlayLinks {
    transport: Arc<Transport>,
    neighbors: Arc<RwLock<BTreeSet<PeerAddress>>>,
}

impl OverlayLinks {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            neighbors: Arc::default(),
        }
    }

    /// Add an overlay neighbour. Returns true if it is new.
    pub fn link(&self, peer: PeerAddress) -> bool {
        self.neighbors.write().insert(peer)
    }

    pub fn is_linked(&self, peer: &PeerAddress) -> bool {
        self.neighbors.read().contains(peer)
    }
}

impl Outbound for OverlayLinks {
    fn send(&self, peer: &PeerAddress, payload: Bytes) {
        if self.is_linked(peer) {
            self.transport.send(peer, payload);
        } else {
            self.transport.send_once(peer, payload);
        }
    }

    fn send_all(&self, payload: Bytes, exclude: &[PeerAddress]) {
        for peer in self.neighbors() {
            if !exclude.contains(&peer) {
                self.transport.send(&peer, payload.clone());
            }
        }
    }

    fn send_to_random(&self, payload: Bytes, exclude: &[PeerAddress]) -> Option<PeerAddress> {
        let candidates: Vec<PeerAddress> = self
            .neighbors()
            .into_iter()
            .filter(|p| !exclude.contains(p))
            .collect();
        let pick = candidates.choose(&mut rand::thread_rng())?.clone();
        self.transport.send(&pick, payload);
        Some(pick)
    }

    /// Sorted.
    fn neighbors(&self) -> Vec<PeerAddress> {
        self.neighbors.read().iter().cloned().collect()
    }
}
