//! Peer registry for tracking sessions with other peers.
//!
//! Owned by the orchestrator task and mutated only from there, so it carries
//! no locking of its own.

use crate::peer_id::PeerIdentity;
use crate::protocol::HandshakeStatus;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Name shown for peers that identified without a label.
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Which side of the system a peer is.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PeerRole {
    /// The designated bootstrap peer
    Backend,
    /// Any peer found through discovery or an inbound connection
    Client,
}

/// Where a session is in its lifecycle.
///
/// Disconnected peers are removed from the registry instead of being kept
/// in a terminal state.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Discovered,
    /// Outbound dial in flight
    Dialing,
    /// Transport up, waiting for identify
    Connected,
    /// Identified; waiting for the remote side to handshake us
    Identifying,
    /// Handshake in flight
    Handshaking,
    Established,
}

impl SessionState {
    /// A handshake is running or has completed.
    pub fn is_handshaking_or_established(self) -> bool {
        matches!(self, Self::Handshaking | Self::Established)
    }
}

/// One other peer's relationship to this process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSession {
    pub id: PeerIdentity,
    pub role: PeerRole,
    pub state: SessionState,
    /// Label from the identify exchange
    pub display_name: Option<String>,
    /// When the session was created (ms since epoch)
    pub first_seen: u64,
    pub last_handshake: Option<HandshakeStatus>,
    /// Whether `peerFound` has been published for this session
    pub announced: bool,
}

/// Externally visible connection status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub is_connected: bool,
}

/// Registry of sessions plus the set of peers already dialed from discovery.
pub struct PeerRegistry {
    backend: PeerIdentity,
    sessions: HashMap<PeerIdentity, PeerSession>,
    dialed: HashSet<PeerIdentity>,
}

impl PeerRegistry {
    pub fn new(backend: PeerIdentity) -> Self {
        Self {
            backend,
            sessions: HashMap::new(),
            dialed: HashSet::new(),
        }
    }

    pub fn backend(&self) -> &PeerIdentity {
        &self.backend
    }

    pub fn is_backend(&self, id: &PeerIdentity) -> bool {
        *id == self.backend
    }

    /// Record a discovery dial. Returns false if `id` was already dialed.
    pub fn mark_dialed(&mut self, id: &PeerIdentity) -> bool {
        self.dialed.insert(id.clone())
    }

    pub fn clear_dialed(&mut self, id: &PeerIdentity) {
        self.dialed.remove(id);
    }

    pub fn is_dialed(&self, id: &PeerIdentity) -> bool {
        self.dialed.contains(id)
    }

    /// Get or create the session for `id`.
    ///
    /// New sessions start in `Discovered`. The backend's role is always
    /// `Backend` regardless of what the caller asks for.
    pub fn upsert_session(&mut self, id: &PeerIdentity, role: PeerRole, now: u64) -> &mut PeerSession {
        let role = if self.is_backend(id) {
            PeerRole::Backend
        } else {
            role
        };

        let session = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| PeerSession {
                id: id.clone(),
                role,
                state: SessionState::Discovered,
                display_name: None,
                first_seen: now,
                last_handshake: None,
                announced: false,
            });
        session.role = role;
        session
    }

    pub fn remove_session(&mut self, id: &PeerIdentity) -> Option<PeerSession> {
        self.sessions.remove(id)
    }

    pub fn session(&self, id: &PeerIdentity) -> Option<&PeerSession> {
        self.sessions.get(id)
    }

    pub fn session_mut(&mut self, id: &PeerIdentity) -> Option<&mut PeerSession> {
        self.sessions.get_mut(id)
    }

    /// All sessions, in no particular order.
    pub fn sessions(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Connected iff the backend session exists and its handshake succeeded.
    pub fn status(&self) -> ConnectionStatus {
        let is_connected = self
            .sessions
            .get(&self.backend)
            .map(|s| {
                s.state == SessionState::Established
                    && s.last_handshake == Some(HandshakeStatus::Succeeded)
            })
            .unwrap_or(false);
        ConnectionStatus { is_connected }
    }

    pub fn display_name(&self, id: &PeerIdentity) -> Option<&str> {
        self.sessions.get(id)?.display_name.as_deref()
    }
}
