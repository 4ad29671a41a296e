//! Session orchestrator: the connection and handshake state machine.
//!
//! A single task consumes substrate events in arrival order, consults the
//! registry and spawns handshakes, dials and reconnects as background tasks.
//! Those tasks report back over an internal channel, so the loop itself
//! never waits on the network.

use crate::config::{ConfigError, PresenceConfig};
use crate::events::{StatusEvent, StatusPublisher};
use crate::peer_id::PeerIdentity;
use crate::peers::{
    ConnectionStatus, PeerRegistry, PeerRole, PeerSession, SessionState, UNKNOWN_DEVICE,
};
use crate::protocol::handshake::{self, HandshakeError, HandshakeOutcome, HandshakeStatus};
use crate::transport::{Substrate, SubstrateEvent, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Orchestrator is not running")]
    NotRunning,
    #[error("Orchestrator task failed: {0}")]
    TaskFailed(String),
}

/// Fixed parameters for one orchestrator lifetime.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub backend: PeerIdentity,
    pub protocol: String,
    /// Label sent in our greeting
    pub local_label: String,
    pub reconnect_delay: Duration,
    pub handshake_timeout: Duration,
}

impl OrchestratorSettings {
    /// The backend is the identity in the first bootstrap address.
    pub fn from_config(
        config: &PresenceConfig,
        local_label: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let backend = config.backend_peer()?.ok_or(ConfigError::NoBackendPeer)?;
        Ok(Self {
            backend,
            protocol: config.protocol.clone(),
            local_label: local_label.into(),
            reconnect_delay: config.reconnect_delay(),
            handshake_timeout: config.handshake_timeout(),
        })
    }
}

/// Results from background tasks.
enum TaskReport {
    Handshake {
        peer: PeerIdentity,
        attempt: u64,
        outcome: HandshakeOutcome,
    },
    DialFailed {
        peer: PeerIdentity,
        error: TransportError,
    },
    Responded {
        peer: PeerIdentity,
        result: Result<Option<String>, HandshakeError>,
    },
}

enum Command {
    Status(oneshot::Sender<ConnectionStatus>),
    Sessions(oneshot::Sender<Vec<PeerSession>>),
    Shutdown(oneshot::Sender<()>),
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Owns the registry and drives sessions from substrate events.
pub struct SessionOrchestrator {
    settings: OrchestratorSettings,
    local_id: PeerIdentity,
    substrate: Arc<dyn Substrate>,
    events: mpsc::Receiver<SubstrateEvent>,
    publisher: Arc<StatusPublisher>,
    registry: PeerRegistry,
    /// In-flight handshake per peer, tagged with its attempt number
    handshakes: HashMap<PeerIdentity, (u64, AbortHandle)>,
    next_attempt: u64,
    background: JoinSet<()>,
    reports_tx: mpsc::UnboundedSender<TaskReport>,
    reports_rx: mpsc::UnboundedReceiver<TaskReport>,
}

impl SessionOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        substrate: Arc<dyn Substrate>,
        events: mpsc::Receiver<SubstrateEvent>,
        publisher: Arc<StatusPublisher>,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            registry: PeerRegistry::new(settings.backend.clone()),
            local_id: substrate.local_identity(),
            settings,
            substrate,
            events,
            publisher,
            handshakes: HashMap::new(),
            next_attempt: 0,
            background: JoinSet::new(),
            reports_tx,
            reports_rx,
        }
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local_id
    }

    /// Publish our identity and spawn the event loop.
    pub fn start(self) -> OrchestratorHandle {
        info!(
            "Starting orchestrator as {} (backend {})",
            self.local_id, self.settings.backend
        );
        self.publisher.set_local_identity(&self.local_id);

        let local_id = self.local_id.clone();
        let (command_tx, command_rx) = mpsc::channel(16);
        let task = tokio::spawn(self.run(command_rx));

        OrchestratorHandle {
            local_id,
            commands: command_tx,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("Substrate event channel closed, stopping orchestrator");
                        break;
                    }
                },
                Some(report) = self.reports_rx.recv() => self.handle_report(report),
                Some(command) = commands.recv() => match command {
                    Command::Status(reply) => {
                        let _ = reply.send(self.registry.status());
                    }
                    Command::Sessions(reply) => {
                        let _ = reply.send(self.registry.sessions().cloned().collect());
                    }
                    Command::Shutdown(done) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                },
                Some(_) = self.background.join_next(), if !self.background.is_empty() => {}
            }
        }
        self.background.shutdown().await;
    }

    async fn shutdown(&mut self) {
        info!("Stopping orchestrator");
        self.handshakes.clear();
        self.background.shutdown().await;
        if let Err(e) = self.substrate.stop().await {
            warn!("Error stopping substrate: {}", e);
        }
    }

    fn publish_status(&self) {
        self.publisher
            .publish(StatusEvent::ConnectionStatus(self.registry.status()));
    }

    // ==================== Substrate events ====================

    fn handle_event(&mut self, event: SubstrateEvent) {
        debug!("Substrate event: {:?}", event);
        match event {
            SubstrateEvent::Discovered(peer) => self.on_discovered(peer),
            SubstrateEvent::Connected(peer) => self.on_connected(peer),
            SubstrateEvent::Identified {
                peer,
                protocols,
                label,
            } => self.on_identified(peer, protocols, label),
            SubstrateEvent::Disconnected(peer) => self.on_disconnected(peer),
            SubstrateEvent::InboundStream {
                peer,
                protocol,
                stream,
            } => {
                if protocol != self.settings.protocol {
                    debug!("Ignoring inbound {} stream from {}", protocol, peer);
                    return;
                }
                let reports = self.reports_tx.clone();
                let label = self.settings.local_label.clone();
                let wait = self.settings.handshake_timeout;
                self.background.spawn(async move {
                    let result = handshake::respond(stream, &label, wait).await;
                    let _ = reports.send(TaskReport::Responded { peer, result });
                });
            }
        }
    }

    fn on_discovered(&mut self, peer: PeerIdentity) {
        if self.registry.is_backend(&peer) {
            debug!("Discovered backend {}, bootstrap handles it", peer);
            return;
        }
        if self.registry.session(&peer).is_some() {
            debug!("Discovered {} but a session already exists", peer);
            return;
        }
        if !self.registry.mark_dialed(&peer) {
            debug!("Already dialed {}", peer);
            return;
        }

        info!("Discovered peer {}, dialing", peer);
        self.registry
            .upsert_session(&peer, PeerRole::Client, now_ms())
            .state = SessionState::Dialing;

        let substrate = Arc::clone(&self.substrate);
        let reports = self.reports_tx.clone();
        self.background.spawn(async move {
            if let Err(error) = substrate.dial(&peer).await {
                let _ = reports.send(TaskReport::DialFailed { peer, error });
            }
        });
    }

    fn on_connected(&mut self, peer: PeerIdentity) {
        let is_backend = self.registry.is_backend(&peer);
        let role = if is_backend {
            PeerRole::Backend
        } else {
            PeerRole::Client
        };
        let session = self.registry.upsert_session(&peer, role, now_ms());

        if is_backend {
            if session.state.is_handshaking_or_established() {
                debug!("Backend {} reconnected while {:?}", peer, session.state);
                return;
            }
            info!("Connected to backend {}", peer);
            self.start_handshake(&peer);
        } else if matches!(
            session.state,
            SessionState::Discovered | SessionState::Dialing
        ) {
            info!("Connected to peer {}", peer);
            session.state = SessionState::Connected;
        }
    }

    fn on_identified(&mut self, peer: PeerIdentity, protocols: Vec<String>, label: String) {
        if !protocols.iter().any(|p| *p == self.settings.protocol) {
            debug!("Peer {} does not speak {}", peer, self.settings.protocol);
            return;
        }
        if self.registry.is_backend(&peer) {
            return;
        }
        let Some(session) = self.registry.session_mut(&peer) else {
            debug!("Identify for unknown peer {}", peer);
            return;
        };

        let name = if label.is_empty() {
            UNKNOWN_DEVICE.to_string()
        } else {
            label
        };
        let renamed = session.display_name.as_deref() != Some(name.as_str());
        session.display_name = Some(name.clone());
        if !session.announced || renamed {
            session.announced = true;
            info!("Found peer {} ({})", peer, name);
            self.publisher.publish(StatusEvent::PeerFound {
                id: peer.clone(),
                name,
            });
        }

        if session.state.is_handshaking_or_established() {
            return;
        }
        if self.local_id < peer {
            self.start_handshake(&peer);
        } else if let Some(session) = self.registry.session_mut(&peer) {
            debug!("Waiting for {} to initiate the handshake", peer);
            session.state = SessionState::Identifying;
        }
    }

    fn on_disconnected(&mut self, peer: PeerIdentity) {
        if let Some((_, handle)) = self.handshakes.remove(&peer) {
            handle.abort();
        }
        self.registry.clear_dialed(&peer);

        let Some(session) = self.registry.remove_session(&peer) else {
            debug!("Disconnect from unknown peer {}", peer);
            return;
        };

        if session.role == PeerRole::Backend {
            warn!(
                "Disconnected from backend {}, reconnecting in {:?}",
                peer, self.settings.reconnect_delay
            );
            self.publish_status();
            self.schedule_reconnect(peer);
        } else {
            info!("Peer {} disconnected", peer);
            if session.announced {
                self.publisher
                    .publish(StatusEvent::PeerDisconnected { id: peer });
            }
        }
    }

    fn schedule_reconnect(&mut self, peer: PeerIdentity) {
        let substrate = Arc::clone(&self.substrate);
        let delay = self.settings.reconnect_delay;
        self.background.spawn(async move {
            tokio::time::sleep(delay).await;
            match substrate.dial(&peer).await {
                Ok(()) => info!("Reconnected to backend {}", peer),
                Err(e) => warn!("Reconnect to backend {} failed: {}", peer, e),
            }
        });
    }

    fn start_handshake(&mut self, peer: &PeerIdentity) {
        self.next_attempt += 1;
        let attempt = self.next_attempt;

        if let Some(session) = self.registry.session_mut(peer) {
            session.state = SessionState::Handshaking;
        }

        let substrate = Arc::clone(&self.substrate);
        let reports = self.reports_tx.clone();
        let protocol = self.settings.protocol.clone();
        let label = self.settings.local_label.clone();
        let wait = self.settings.handshake_timeout;
        let target = peer.clone();

        debug!("Starting handshake #{} with {}", attempt, peer);
        let handle = self.background.spawn(async move {
            let outcome =
                handshake::perform(substrate.as_ref(), &target, &protocol, &label, wait).await;
            let _ = reports.send(TaskReport::Handshake {
                peer: target,
                attempt,
                outcome,
            });
        });

        if let Some((_, previous)) = self.handshakes.insert(peer.clone(), (attempt, handle)) {
            previous.abort();
        }
    }

    // ==================== Task reports ====================

    fn handle_report(&mut self, report: TaskReport) {
        match report {
            TaskReport::Handshake {
                peer,
                attempt,
                outcome,
            } => self.on_handshake_finished(peer, attempt, outcome),
            TaskReport::DialFailed { peer, error } => {
                warn!("Dial to {} failed: {}", peer, error);
                let pending = self
                    .registry
                    .session(&peer)
                    .map(|s| s.state == SessionState::Dialing)
                    .unwrap_or(false);
                if pending {
                    self.registry.remove_session(&peer);
                    self.registry.clear_dialed(&peer);
                }
            }
            TaskReport::Responded { peer, result } => match result {
                Ok(remote) => {
                    debug!("Answered handshake from {} ({:?})", peer, remote);
                    if self.registry.is_backend(&peer) {
                        return;
                    }
                    if let Some(session) = self.registry.session_mut(&peer) {
                        if session.state != SessionState::Handshaking {
                            session.state = SessionState::Established;
                            session.last_handshake = Some(HandshakeStatus::Succeeded);
                        }
                    }
                }
                Err(e) => warn!("Inbound handshake from {} failed: {}", peer, e),
            },
        }
    }

    fn on_handshake_finished(&mut self, peer: PeerIdentity, attempt: u64, outcome: HandshakeOutcome) {
        match self.handshakes.get(&peer) {
            Some((current, _)) if *current == attempt => {
                self.handshakes.remove(&peer);
            }
            _ => {
                debug!("Discarding stale handshake #{} with {}", attempt, peer);
                return;
            }
        }

        let is_backend = self.registry.is_backend(&peer);
        let Some(session) = self.registry.session_mut(&peer) else {
            return;
        };
        session.last_handshake = Some(outcome.status());

        match &outcome {
            HandshakeOutcome::Succeeded { reply } => {
                info!("Handshake with {} succeeded: {}", peer, reply);
                session.state = SessionState::Established;
            }
            HandshakeOutcome::SoftFailed { timed_out } => {
                if *timed_out {
                    warn!("Handshake with {} timed out", peer);
                } else {
                    warn!("Handshake with {} closed without a reply", peer);
                }
                session.state = if is_backend {
                    SessionState::Connected
                } else {
                    SessionState::Identifying
                };
            }
            HandshakeOutcome::Failed(e) => {
                warn!("Handshake with {} failed: {}", peer, e);
                session.state = if is_backend {
                    SessionState::Connected
                } else {
                    SessionState::Identifying
                };
            }
        }

        if is_backend {
            self.publish_status();
        }
    }
}

/// Handle to a running orchestrator.
pub struct OrchestratorHandle {
    local_id: PeerIdentity,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local_id
    }

    pub async fn connection_status(&self) -> Result<ConnectionStatus, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .await
            .map_err(|_| OrchestratorError::NotRunning)?;
        rx.await.map_err(|_| OrchestratorError::NotRunning)
    }

    /// Copy of every current session.
    pub async fn sessions(&self) -> Result<Vec<PeerSession>, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Sessions(tx))
            .await
            .map_err(|_| OrchestratorError::NotRunning)?;
        rx.await.map_err(|_| OrchestratorError::NotRunning)
    }

    /// Whether the event loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel background work, stop the substrate and wait for the loop.
    pub async fn stop(self) -> Result<(), OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        self.task
            .await
            .map_err(|e| OrchestratorError::TaskFailed(e.to_string()))
    }
}
