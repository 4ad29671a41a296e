//! WebSocket substrate.
//!
//! One listener accepts two kinds of connections, told apart by their first
//! control frame: peer connections (`identify` both ways, then kept open
//! until either side leaves) and protocol streams (`stream`, then payload
//! frames until closed). Outgoing streams always use a fresh connection to
//! the peer's advertised address.

use crate::bootstrap::{dial_until_connected, BackoffConfig};
use crate::connection::{
    self, next_frame, send_frame, ConnectionDirection, ConnectionTable, RemotePeer,
};
use crate::message::{ControlMessage, IdentifyMessage, StreamMessage};
use crate::stream::WsProtocolStream;
use async_trait::async_trait;
use presence_core::transport::{
    ProtocolStream, Result, Substrate, SubstrateEvent, TransportError,
};
use presence_core::{PeerAddress, PeerIdentity};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Capacity of the substrate event channel.
pub const DAEMON_EVENT_CAPACITY: usize = 256;

/// Startup parameters for [`WsSubstrate`].
#[derive(Debug, Clone)]
pub struct SubstrateConfig {
    pub local_id: PeerIdentity,
    /// Label sent in identify
    pub label: String,
    /// Protocols we accept streams for
    pub protocols: Vec<String>,
    /// Socket address to listen on, e.g. "0.0.0.0:4002"
    pub listen: String,
    /// Address other peers should dial, if different from the listen address
    pub advertise_address: Option<String>,
    /// Peers dialed at startup until the first connection succeeds
    pub bootstrap: Vec<PeerAddress>,
    /// Bound on connecting and on waiting for the first control frame
    pub identify_timeout: Duration,
    pub bootstrap_backoff: BackoffConfig,
}

impl SubstrateConfig {
    pub fn new(local_id: PeerIdentity, label: impl Into<String>, listen: impl Into<String>) -> Self {
        Self {
            local_id,
            label: label.into(),
            protocols: Vec::new(),
            listen: listen.into(),
            advertise_address: None,
            bootstrap: Vec::new(),
            identify_timeout: Duration::from_secs(10),
            bootstrap_backoff: BackoffConfig::default(),
        }
    }
}

struct Inner {
    local_id: PeerIdentity,
    label: String,
    protocols: Vec<String>,
    local_addr: SocketAddr,
    listen_url: Option<String>,
    identify_timeout: Duration,
    table: Arc<Mutex<ConnectionTable>>,
    events: mpsc::Sender<SubstrateEvent>,
    /// Dialable URL per peer, from bootstrap, discovery or identify
    addresses: std::sync::Mutex<HashMap<PeerIdentity, String>>,
    /// Protocols each peer listed in its last identify
    remote_protocols: std::sync::Mutex<HashMap<PeerIdentity, Vec<String>>>,
    next_conn_id: AtomicU64,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Substrate over plain WebSocket connections.
#[derive(Clone)]
pub struct WsSubstrate {
    inner: Arc<Inner>,
}

impl WsSubstrate {
    /// Bind the listener, start accepting and start dialing bootstrap peers.
    pub async fn start(
        config: SubstrateConfig,
    ) -> Result<(Self, mpsc::Receiver<SubstrateEvent>)> {
        let listener = TcpListener::bind(config.listen.as_str()).await.map_err(|e| {
            TransportError::Other(format!("Failed to bind {}: {}", config.listen, e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let listen_url = advertised_url(config.advertise_address.as_deref(), local_addr);
        info!(
            "Listening on {} as {} (advertising {})",
            local_addr,
            config.local_id,
            listen_url.as_deref().unwrap_or("nothing")
        );

        let (events, events_rx) = mpsc::channel(DAEMON_EVENT_CAPACITY);
        let addresses = config
            .bootstrap
            .iter()
            .map(|addr| (addr.peer.clone(), addr.url.clone()))
            .collect();

        let substrate = Self {
            inner: Arc::new(Inner {
                local_id: config.local_id,
                label: config.label,
                protocols: config.protocols,
                local_addr,
                listen_url,
                identify_timeout: config.identify_timeout,
                table: Arc::new(Mutex::new(ConnectionTable::new())),
                events,
                addresses: std::sync::Mutex::new(addresses),
                remote_protocols: std::sync::Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(0),
                tasks: std::sync::Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        };

        let mut tasks = Vec::with_capacity(config.bootstrap.len() + 1);
        tasks.push(tokio::spawn(substrate.clone().accept_loop(listener)));
        for addr in config.bootstrap {
            info!("Dialing bootstrap peer {}", addr);
            let dialer: Arc<dyn Substrate> = Arc::new(substrate.clone());
            let backoff = config.bootstrap_backoff.clone();
            tasks.push(tokio::spawn(async move {
                dial_until_connected(dialer, addr.peer, backoff).await;
            }));
        }
        substrate.lock_tasks().extend(tasks);

        Ok((substrate, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// URL other peers are told to dial, if we know one.
    pub fn listen_url(&self) -> Option<&str> {
        self.inner.listen_url.as_deref()
    }

    /// Record where `peer` can be dialed.
    pub fn remember_address(&self, peer: PeerIdentity, url: impl Into<String>) {
        let url = url.into();
        debug!("Address for {}: {}", peer, url);
        self.inner
            .addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer, url);
    }

    pub fn forget_address(&self, peer: &PeerIdentity) {
        self.inner
            .addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer);
    }

    pub fn address_of(&self, peer: &PeerIdentity) -> Option<String> {
        self.inner
            .addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
    }

    pub async fn is_connected(&self, peer: &PeerIdentity) -> bool {
        self.inner.table.lock().await.contains(peer)
    }

    pub async fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.inner.table.lock().await.peers()
    }

    /// Report a peer found by discovery. Ignored once stopped.
    pub async fn announce_discovered(&self, peer: PeerIdentity) {
        if self.is_stopped() || peer == self.inner.local_id {
            return;
        }
        let _ = self.inner.events.send(SubstrateEvent::Discovered(peer)).await;
    }

    fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_conn_id(&self) -> u64 {
        self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    fn identify_frame(&self) -> Vec<u8> {
        ControlMessage::identify(
            self.inner.local_id.as_str(),
            &self.inner.label,
            &self.inner.protocols,
            self.inner.listen_url.as_deref(),
        )
        .to_binary()
        .unwrap_or_default()
    }

    fn remember_protocols(&self, peer: &PeerIdentity, protocols: &[String]) {
        self.inner
            .remote_protocols
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.clone(), protocols.to_vec());
    }

    fn supports(&self, peer: &PeerIdentity, protocol: &str) -> bool {
        self.inner
            .remote_protocols
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .is_none_or(|protocols| protocols.iter().any(|p| p == protocol))
    }

    // ==================== Incoming ====================

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.accept_connection(stream, addr).await });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    async fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let mut ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake with {} failed: {}", addr, e);
                return;
            }
        };

        let first = timeout(self.inner.identify_timeout, next_frame(&mut ws)).await;
        let frame = match first {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("{} closed before sending a control frame", addr);
                return;
            }
            Err(_) => {
                warn!("No control frame from {} within {:?}", addr, self.inner.identify_timeout);
                let _ = ws.close(None).await;
                return;
            }
        };

        match ControlMessage::from_binary(&frame) {
            Some(ControlMessage::Identify(msg)) => self.accept_peer(ws, msg, addr).await,
            Some(ControlMessage::Stream(msg)) => self.accept_stream(ws, msg, addr).await,
            None => {
                warn!("Invalid control frame from {}, closing", addr);
                let _ = ws.close(None).await;
            }
        }
    }

    async fn accept_peer(
        &self,
        mut ws: WebSocketStream<TcpStream>,
        msg: IdentifyMessage,
        addr: SocketAddr,
    ) {
        let remote: PeerIdentity = match msg.peer_id.parse() {
            Ok(id) => id,
            Err(e) => {
                warn!("Invalid peer id from {}: {}", addr, e);
                let _ = ws.close(None).await;
                return;
            }
        };
        if remote == self.inner.local_id {
            warn!("Rejecting connection from ourselves at {}", addr);
            let _ = ws.close(None).await;
            return;
        }
        if self.is_stopped() {
            let _ = ws.close(None).await;
            return;
        }

        if let Err(e) = send_frame(&mut ws, self.identify_frame()).await {
            warn!("Failed to send identify to {}: {}", addr, e);
            return;
        }

        if let Some(url) = &msg.listen_addr {
            self.remember_address(remote.clone(), url.clone());
        }
        self.remember_protocols(&remote, &msg.protocols);

        let peer = RemotePeer {
            id: remote,
            label: msg.agent_version,
            protocols: msg.protocols,
        };
        let conn_id = self.next_conn_id();
        connection::register(
            &self.inner.table,
            &self.inner.events,
            &self.inner.local_id,
            peer,
            conn_id,
            ConnectionDirection::Incoming,
            ws,
        )
        .await;
    }

    async fn accept_stream(
        &self,
        mut ws: WebSocketStream<TcpStream>,
        msg: StreamMessage,
        addr: SocketAddr,
    ) {
        let peer: PeerIdentity = match msg.peer_id.parse() {
            Ok(id) => id,
            Err(e) => {
                warn!("Invalid peer id on stream from {}: {}", addr, e);
                let _ = ws.close(None).await;
                return;
            }
        };
        if !self.inner.protocols.contains(&msg.protocol) {
            warn!("Rejecting {} stream from {}: protocol not supported", msg.protocol, peer);
            let _ = ws.close(None).await;
            return;
        }

        debug!("Inbound {} stream from {}", msg.protocol, peer);
        let stream: Box<dyn ProtocolStream> = Box::new(WsProtocolStream::new(ws));
        let _ = self
            .inner
            .events
            .send(SubstrateEvent::InboundStream {
                peer,
                protocol: msg.protocol,
                stream,
            })
            .await;
    }

    // ==================== Outgoing ====================

    async fn connect(&self, url: &str) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let (ws, _) = timeout(self.inner.identify_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("Timed out connecting to {}", url)))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", url, e)))?;
        Ok(ws)
    }

    async fn exchange_identify<S>(
        &self,
        ws: &mut WebSocketStream<S>,
        expected: &PeerIdentity,
    ) -> Result<IdentifyMessage>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        send_frame(ws, self.identify_frame())
            .await
            .map_err(TransportError::SendFailed)?;

        let frame = timeout(self.inner.identify_timeout, next_frame(ws))
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!("No identify from {}", expected))
            })?
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("{} closed during identify", expected))
            })?;

        let Some(ControlMessage::Identify(msg)) = ControlMessage::from_binary(&frame) else {
            return Err(TransportError::ConnectionFailed(format!(
                "{} did not answer with identify",
                expected
            )));
        };
        if msg.peer_id != expected.as_str() {
            return Err(TransportError::ConnectionFailed(format!(
                "Expected {}, found {}",
                expected, msg.peer_id
            )));
        }
        Ok(msg)
    }
}

#[async_trait]
impl Substrate for WsSubstrate {
    fn local_identity(&self) -> PeerIdentity {
        self.inner.local_id.clone()
    }

    async fn dial(&self, peer: &PeerIdentity) -> Result<()> {
        if self.is_stopped() {
            return Err(TransportError::Stopped);
        }
        if self.is_connected(peer).await {
            debug!("Already connected to {}", peer);
            return Ok(());
        }
        let url = self
            .address_of(peer)
            .ok_or_else(|| TransportError::PeerNotFound(peer.to_string()))?;

        debug!("Dialing {} at {}", peer, url);
        let mut ws = self.connect(&url).await?;
        let msg = match self.exchange_identify(&mut ws, peer).await {
            Ok(msg) => msg,
            Err(e) => {
                let _ = ws.close(None).await;
                return Err(e);
            }
        };
        self.remember_protocols(peer, &msg.protocols);

        let remote = RemotePeer {
            id: peer.clone(),
            label: msg.agent_version,
            protocols: msg.protocols,
        };
        let conn_id = self.next_conn_id();
        connection::register(
            &self.inner.table,
            &self.inner.events,
            &self.inner.local_id,
            remote,
            conn_id,
            ConnectionDirection::Outgoing,
            ws,
        )
        .await;
        Ok(())
    }

    async fn open_protocol_stream(
        &self,
        peer: &PeerIdentity,
        protocol: &str,
    ) -> Result<Box<dyn ProtocolStream>> {
        if self.is_stopped() {
            return Err(TransportError::Stopped);
        }
        if !self.is_connected(peer).await {
            return Err(TransportError::PeerNotFound(peer.to_string()));
        }
        if !self.supports(peer, protocol) {
            return Err(TransportError::ProtocolUnsupported {
                peer: peer.to_string(),
                protocol: protocol.to_string(),
            });
        }
        let url = self.address_of(peer).ok_or_else(|| {
            TransportError::PeerNotFound(format!("{} (no dialable address)", peer))
        })?;

        let mut ws = self.connect(&url).await?;
        let frame = ControlMessage::stream(self.inner.local_id.as_str(), protocol)
            .to_binary()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        send_frame(&mut ws, frame)
            .await
            .map_err(TransportError::SendFailed)?;

        debug!("Opened {} stream to {}", protocol, peer);
        Ok(Box::new(WsProtocolStream::new(ws)))
    }

    async fn stop(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Stopping substrate");
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.inner.table.lock().await.close_all();
        Ok(())
    }
}

/// URL to advertise for a listener bound at `local_addr`.
///
/// An explicit advertise address wins. A wildcard bind advertises the
/// primary local IP.
fn advertised_url(advertise: Option<&str>, local_addr: SocketAddr) -> Option<String> {
    if let Some(addr) = advertise {
        return Some(if addr.starts_with("ws://") || addr.starts_with("wss://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("ws://{}", addr)
        });
    }
    if !local_addr.ip().is_unspecified() {
        return Some(format!("ws://{}", local_addr));
    }
    match local_ip_address::local_ip() {
        Ok(ip) => Some(format!("ws://{}", SocketAddr::new(ip, local_addr.port()))),
        Err(e) => {
            warn!("Could not determine local IP to advertise: {}", e);
            None
        }
    }
}
