//! Peer connections and the connection table.
//!
//! At most one live connection is kept per remote peer. Each registered
//! connection runs a task that watches the socket; when it ends, the task
//! removes its own table entry and reports the disconnect, unless it was
//! already replaced.

use futures::{SinkExt, StreamExt};
use presence_core::transport::SubstrateEvent;
use presence_core::PeerIdentity;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, info};

/// Connection direction from our perspective.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionDirection {
    Incoming,
    Outgoing,
}

/// What to do with a newly identified connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateCheckResult {
    /// First connection to this peer
    NoDuplicate,
    /// Keep the existing connection, close the new one
    CloseThis,
    /// Keep the new connection, close the existing one
    CloseOther,
}

/// Decide between two connections to the same peer.
///
/// A repeat in the same direction loses to the established one. Across
/// directions, both sides keep the connection dialed by the lower identity,
/// so they agree without talking about it.
pub fn check_duplicate_connection(
    local: &PeerIdentity,
    remote: &PeerIdentity,
    direction: ConnectionDirection,
    existing: Option<ConnectionDirection>,
) -> DuplicateCheckResult {
    let Some(existing) = existing else {
        return DuplicateCheckResult::NoDuplicate;
    };
    if existing == direction {
        return DuplicateCheckResult::CloseThis;
    }

    let keep = if local < remote {
        ConnectionDirection::Outgoing
    } else {
        ConnectionDirection::Incoming
    };
    if direction == keep {
        DuplicateCheckResult::CloseOther
    } else {
        DuplicateCheckResult::CloseThis
    }
}

struct ConnectionEntry {
    conn_id: u64,
    direction: ConnectionDirection,
    /// Dropping or firing this closes the connection
    close: oneshot::Sender<()>,
}

/// Live connections keyed by remote identity.
///
/// Guarded by an async mutex that is held while the matching substrate
/// events are sent, so a disconnect can never overtake its connect.
#[derive(Default)]
pub struct ConnectionTable {
    connections: HashMap<PeerIdentity, ConnectionEntry>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn direction(&self, peer: &PeerIdentity) -> Option<ConnectionDirection> {
        self.connections.get(peer).map(|e| e.direction)
    }

    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.connections.contains_key(peer)
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn insert(
        &mut self,
        peer: PeerIdentity,
        conn_id: u64,
        direction: ConnectionDirection,
    ) -> oneshot::Receiver<()> {
        let (close, close_rx) = oneshot::channel();
        let previous = self.connections.insert(
            peer,
            ConnectionEntry {
                conn_id,
                direction,
                close,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.close.send(());
        }
        close_rx
    }

    /// Remove the entry only if it still belongs to `conn_id`.
    fn remove_if_current(&mut self, peer: &PeerIdentity, conn_id: u64) -> bool {
        match self.connections.get(peer) {
            Some(entry) if entry.conn_id == conn_id => {
                self.connections.remove(peer);
                true
            }
            _ => false,
        }
    }

    /// Close every connection. Their tasks exit without reporting.
    pub fn close_all(&mut self) {
        for (peer, entry) in self.connections.drain() {
            debug!("Closing connection to {}", peer);
            let _ = entry.close.send(());
        }
    }
}

/// Identity and label learned from the remote's identify frame.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub id: PeerIdentity,
    pub label: String,
    pub protocols: Vec<String>,
}

/// Register an identified connection and start watching it.
///
/// Returns false if an existing connection won and this one was closed.
pub async fn register<S>(
    table: &Arc<Mutex<ConnectionTable>>,
    events: &mpsc::Sender<SubstrateEvent>,
    local: &PeerIdentity,
    remote: RemotePeer,
    conn_id: u64,
    direction: ConnectionDirection,
    mut ws: WebSocketStream<S>,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut guard = table.lock().await;
    let existing = guard.direction(&remote.id);

    match check_duplicate_connection(local, &remote.id, direction, existing) {
        DuplicateCheckResult::CloseThis => {
            drop(guard);
            info!(
                "Duplicate connection to {} ({:?}), keeping existing",
                remote.id, direction
            );
            let _ = ws.close(None).await;
            false
        }
        DuplicateCheckResult::CloseOther => {
            info!(
                "Duplicate connection to {}, keeping new {:?} connection",
                remote.id, direction
            );
            let close_rx = guard.insert(remote.id.clone(), conn_id, direction);
            tokio::spawn(watch_connection(
                Arc::clone(table),
                events.clone(),
                remote.id,
                conn_id,
                ws,
                close_rx,
            ));
            true
        }
        DuplicateCheckResult::NoDuplicate => {
            info!(
                "Connected to {} ({}, {:?})",
                remote.id, remote.label, direction
            );
            let close_rx = guard.insert(remote.id.clone(), conn_id, direction);
            tokio::spawn(watch_connection(
                Arc::clone(table),
                events.clone(),
                remote.id.clone(),
                conn_id,
                ws,
                close_rx,
            ));

            let _ = events
                .send(SubstrateEvent::Connected(remote.id.clone()))
                .await;
            let _ = events
                .send(SubstrateEvent::Identified {
                    peer: remote.id,
                    protocols: remote.protocols,
                    label: remote.label,
                })
                .await;
            true
        }
    }
}

/// Watch a registered connection until either side closes it.
async fn watch_connection<S>(
    table: Arc<Mutex<ConnectionTable>>,
    events: mpsc::Sender<SubstrateEvent>,
    peer: PeerIdentity,
    conn_id: u64,
    mut ws: WebSocketStream<S>,
    mut close_rx: oneshot::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            _ = &mut close_rx => {
                debug!("Closing connection {} to {}", conn_id, peer);
                let _ = ws.close(None).await;
                break;
            }
            msg = ws.next() => match msg {
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame from {}", peer);
                    break;
                }
                Some(Ok(_)) => {
                    // Nothing but control frames is expected after identify
                    continue;
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("Connection {} to {} ended", conn_id, peer);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error on connection to {}: {}", peer, e);
                    break;
                }
            }
        }
    }

    let mut guard = table.lock().await;
    if guard.remove_if_current(&peer, conn_id) {
        info!("Disconnected from {}", peer);
        let _ = events.send(SubstrateEvent::Disconnected(peer)).await;
    }
}

/// Send a binary frame, mapping errors to text for logging.
pub async fn send_frame<S>(ws: &mut WebSocketStream<S>, data: Vec<u8>) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(Message::Binary(data.into()))
        .await
        .map_err(|e| e.to_string())
}

/// Read the next data frame, skipping pings. None once the connection ends.
pub async fn next_frame<S>(ws: &mut WebSocketStream<S>) -> Option<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await? {
            Ok(Message::Binary(data)) => return Some(data.to_vec()),
            Ok(Message::Text(text)) => return Some(text.into_bytes()),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
}
