//! Substrate trait for the peer-to-peer networking layer.
//!
//! Implementations:
//! - In-memory: loopback network of in-process nodes (`crate::memory`)
//! - WebSocket: listener + dialer with an identify exchange (presence-daemon)

use crate::peer_id::PeerIdentity;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Protocol {protocol} not supported by {peer}")]
    ProtocolUnsupported { peer: String, protocol: String },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Substrate stopped")]
    Stopped,

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A bidirectional byte stream scoped to one application protocol.
#[async_trait]
pub trait ProtocolStream: Send {
    /// Send one payload
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Receive the next payload; `None` once the remote has closed
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;

    /// Close our side of the stream
    async fn close(&mut self) -> Result<()>;
}

/// Lifecycle events emitted by the substrate, in the order they happen.
pub enum SubstrateEvent {
    /// Peer found by a discovery mechanism (not yet connected)
    Discovered(PeerIdentity),
    /// Transport connection established
    Connected(PeerIdentity),
    /// Identify exchange finished
    Identified {
        peer: PeerIdentity,
        protocols: Vec<String>,
        label: String,
    },
    /// Transport connection gone
    Disconnected(PeerIdentity),
    /// Remote peer opened a stream to us for `protocol`
    InboundStream {
        peer: PeerIdentity,
        protocol: String,
        stream: Box<dyn ProtocolStream>,
    },
}

impl SubstrateEvent {
    /// Peer this event refers to.
    pub fn peer(&self) -> &PeerIdentity {
        match self {
            Self::Discovered(peer)
            | Self::Connected(peer)
            | Self::Disconnected(peer)
            | Self::Identified { peer, .. }
            | Self::InboundStream { peer, .. } => peer,
        }
    }
}

impl fmt::Debug for SubstrateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovered(peer) => f.debug_tuple("Discovered").field(peer).finish(),
            Self::Connected(peer) => f.debug_tuple("Connected").field(peer).finish(),
            Self::Disconnected(peer) => f.debug_tuple("Disconnected").field(peer).finish(),
            Self::Identified {
                peer,
                protocols,
                label,
            } => f
                .debug_struct("Identified")
                .field("peer", peer)
                .field("protocols", protocols)
                .field("label", label)
                .finish(),
            Self::InboundStream { peer, protocol, .. } => f
                .debug_struct("InboundStream")
                .field("peer", peer)
                .field("protocol", protocol)
                .finish_non_exhaustive(),
        }
    }
}

/// Operations the orchestrator invokes on the substrate.
///
/// Events flow the other way, over the channel handed out when the
/// substrate is created.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Our own identity
    fn local_identity(&self) -> PeerIdentity;

    /// Establish a transport connection to a peer
    async fn dial(&self, peer: &PeerIdentity) -> Result<()>;

    /// Open a new stream to a connected peer for `protocol`
    async fn open_protocol_stream(
        &self,
        peer: &PeerIdentity,
        protocol: &str,
    ) -> Result<Box<dyn ProtocolStream>>;

    /// Shut the substrate down, closing all connections
    async fn stop(&self) -> Result<()>;
}
