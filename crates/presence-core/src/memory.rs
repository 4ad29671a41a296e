//! In-memory substrate.
//!
//! A loopback network of in-process nodes. Tests drive discovery, connects and
//! disconnects explicitly; links identify both ends immediately and streams
//! are channel pairs.

use crate::peer_id::PeerIdentity;
use crate::transport::{ProtocolStream, Result, Substrate, SubstrateEvent, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// Event channel capacity per node.
pub const MEMORY_EVENT_CAPACITY: usize = 64;

struct Node {
    label: String,
    protocols: Vec<String>,
    online: bool,
    events: mpsc::Sender<SubstrateEvent>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<PeerIdentity, Node>,
    /// Links keyed by (lower, higher) identity
    links: HashSet<(PeerIdentity, PeerIdentity)>,
    dials: HashMap<(PeerIdentity, PeerIdentity), usize>,
    streams: HashMap<(PeerIdentity, PeerIdentity), usize>,
}

impl NetworkState {
    fn notify(&self, id: &PeerIdentity, event: SubstrateEvent) {
        if let Some(node) = self.nodes.get(id) {
            if let Err(e) = node.events.try_send(event) {
                debug!("Dropping event for {}: {}", id, e);
            }
        }
    }

    fn identify(&self, to: &PeerIdentity, about: &PeerIdentity) {
        if let Some(node) = self.nodes.get(about) {
            self.notify(to, SubstrateEvent::Connected(about.clone()));
            self.notify(
                to,
                SubstrateEvent::Identified {
                    peer: about.clone(),
                    protocols: node.protocols.clone(),
                    label: node.label.clone(),
                },
            );
        }
    }

    fn unlink(&mut self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        if self.links.remove(&link_key(a, b)) {
            self.notify(a, SubstrateEvent::Disconnected(b.clone()));
            self.notify(b, SubstrateEvent::Disconnected(a.clone()));
            true
        } else {
            false
        }
    }

    fn linked_to(&self, id: &PeerIdentity) -> Vec<PeerIdentity> {
        self.links
            .iter()
            .filter_map(|(a, b)| {
                if a == id {
                    Some(b.clone())
                } else if b == id {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }
}

fn link_key(a: &PeerIdentity, b: &PeerIdentity) -> (PeerIdentity, PeerIdentity) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Shared handle to an in-memory network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a node and return its substrate with the event receiver.
    pub fn join(
        &self,
        id: PeerIdentity,
        label: impl Into<String>,
        protocols: Vec<String>,
    ) -> (MemorySubstrate, mpsc::Receiver<SubstrateEvent>) {
        let (tx, rx) = mpsc::channel(MEMORY_EVENT_CAPACITY);
        self.lock().nodes.insert(
            id.clone(),
            Node {
                label: label.into(),
                protocols,
                online: true,
                events: tx,
            },
        );
        (
            MemorySubstrate {
                id,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Tell `observer` that `target` was found on the local network.
    pub fn discover(&self, observer: &PeerIdentity, target: &PeerIdentity) {
        self.lock()
            .notify(observer, SubstrateEvent::Discovered(target.clone()));
    }

    /// Link `from` to `to`, as if `from` dialed.
    ///
    /// Both ends see `Connected` then `Identified`. Linking an already linked
    /// pair succeeds without new events.
    pub fn connect(&self, from: &PeerIdentity, to: &PeerIdentity) -> Result<()> {
        let mut state = self.lock();
        *state.dials.entry((from.clone(), to.clone())).or_default() += 1;

        if !state.nodes.contains_key(from) {
            return Err(TransportError::Stopped);
        }
        match state.nodes.get(to) {
            Some(node) if node.online => {}
            _ => return Err(TransportError::ConnectionFailed(format!("{} unreachable", to))),
        }

        if !state.links.insert(link_key(from, to)) {
            return Ok(());
        }
        state.identify(from, to);
        state.identify(to, from);
        Ok(())
    }

    /// Repeat the identify exchange on an existing link: `observer` sees
    /// `Identified` for `about` again.
    pub fn reidentify(&self, observer: &PeerIdentity, about: &PeerIdentity) -> bool {
        let state = self.lock();
        if !state.links.contains(&link_key(observer, about)) {
            return false;
        }
        let Some(node) = state.nodes.get(about) else {
            return false;
        };
        state.notify(
            observer,
            SubstrateEvent::Identified {
                peer: about.clone(),
                protocols: node.protocols.clone(),
                label: node.label.clone(),
            },
        );
        true
    }

    /// Drop the link between `a` and `b`. Both ends see `Disconnected`.
    pub fn disconnect(&self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        self.lock().unlink(a, b)
    }

    /// Take a node off the network (dropping its links) or bring it back.
    pub fn set_online(&self, id: &PeerIdentity, online: bool) {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(id) {
            node.online = online;
        }
        if !online {
            for other in state.linked_to(id) {
                state.unlink(id, &other);
            }
        }
    }

    /// How many times `from` tried to reach `to`.
    pub fn dial_attempts(&self, from: &PeerIdentity, to: &PeerIdentity) -> usize {
        self.lock()
            .dials
            .get(&(from.clone(), to.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// How many protocol streams `from` opened to `to`.
    pub fn streams_opened(&self, from: &PeerIdentity, to: &PeerIdentity) -> usize {
        self.lock()
            .streams
            .get(&(from.clone(), to.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_linked(&self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        self.lock().links.contains(&link_key(a, b))
    }

    fn open_stream(
        &self,
        from: &PeerIdentity,
        to: &PeerIdentity,
        protocol: &str,
    ) -> Result<Box<dyn ProtocolStream>> {
        let mut state = self.lock();
        if !state.links.contains(&link_key(from, to)) {
            return Err(TransportError::PeerNotFound(to.to_string()));
        }
        let supported = state
            .nodes
            .get(to)
            .map(|n| n.protocols.iter().any(|p| p == protocol))
            .unwrap_or(false);
        if !supported {
            return Err(TransportError::ProtocolUnsupported {
                peer: to.to_string(),
                protocol: protocol.to_string(),
            });
        }

        *state.streams.entry((from.clone(), to.clone())).or_default() += 1;

        let (local, remote) = MemoryStream::pair();
        let node = state
            .nodes
            .get(to)
            .ok_or_else(|| TransportError::PeerNotFound(to.to_string()))?;
        node.events
            .try_send(SubstrateEvent::InboundStream {
                peer: from.clone(),
                protocol: protocol.to_string(),
                stream: Box::new(remote),
            })
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(Box::new(local))
    }

    fn leave(&self, id: &PeerIdentity) {
        let mut state = self.lock();
        for other in state.linked_to(id) {
            state.unlink(id, &other);
        }
        // Dropping the node closes its event channel
        state.nodes.remove(id);
    }
}

/// One node's view of a `MemoryNetwork`.
pub struct MemorySubstrate {
    id: PeerIdentity,
    network: MemoryNetwork,
}

#[async_trait]
impl Substrate for MemorySubstrate {
    fn local_identity(&self) -> PeerIdentity {
        self.id.clone()
    }

    async fn dial(&self, peer: &PeerIdentity) -> Result<()> {
        self.network.connect(&self.id, peer)
    }

    async fn open_protocol_stream(
        &self,
        peer: &PeerIdentity,
        protocol: &str,
    ) -> Result<Box<dyn ProtocolStream>> {
        self.network.open_stream(&self.id, peer, protocol)
    }

    async fn stop(&self) -> Result<()> {
        self.network.leave(&self.id);
        Ok(())
    }
}

/// One end of an in-memory stream.
pub struct MemoryStream {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryStream {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }
}

#[async_trait]
impl ProtocolStream for MemoryStream {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportError::SendFailed("stream closed".into()))?;
        tx.send(payload.to_vec())
            .map_err(|_| TransportError::SendFailed("remote dropped".into()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}
