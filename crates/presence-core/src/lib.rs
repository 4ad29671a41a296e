//! presence-core: peer presence and handshake orchestration.
//!
//! This crate provides:
//! - The substrate abstraction the orchestrator runs on (plus an in-memory one)
//! - The one-round application handshake
//! - The session state machine tracking the backend and discovered peers
//! - A status feed for the UI layer

pub mod config;
pub mod events;
pub mod memory;
pub mod orchestrator;
pub mod peer_id;
pub mod peers;
pub mod protocol;
pub mod transport;

pub use config::{ConfigError, PeerAddress, PresenceConfig};
pub use events::{StatusEvent, StatusPublisher, StatusSnapshot, Subscription};
pub use memory::{MemoryNetwork, MemoryStream, MemorySubstrate};
pub use orchestrator::{
    OrchestratorError, OrchestratorHandle, OrchestratorSettings, SessionOrchestrator,
};
pub use peer_id::{PeerIdError, PeerIdentity};
pub use peers::{ConnectionStatus, PeerRegistry, PeerRole, PeerSession, SessionState};
pub use protocol::{Greeting, HandshakeError, HandshakeOutcome, HandshakeStatus};
pub use transport::{ProtocolStream, Substrate, SubstrateEvent, TransportError};
