//! End-to-end tests for presence-daemon.
//!
//! Runs WebSocket substrates on loopback ports and drives them either with
//! raw WebSocket clients (to pin down the wire format) or with each other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use presence_core::protocol::handshake;
use presence_core::{
    HandshakeOutcome, OrchestratorSettings, PeerAddress, PeerIdentity, SessionOrchestrator,
    StatusEvent, StatusPublisher, Substrate, SubstrateEvent, TransportError,
};
use presence_daemon::{backend, ControlMessage, SubstrateConfig, WsSubstrate};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const PROTOCOL: &str = "/whoosh/client-hello/1.0";

/// Raw WebSocket client speaking the control-frame format by hand.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    peer_id: String,
}

impl TestClient {
    async fn connect(substrate: &WsSubstrate) -> Self {
        let url = format!("ws://{}", substrate.local_addr());
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");
        Self {
            ws,
            peer_id: format!("test-client-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Connect, send identify and read the substrate's identify back.
    async fn connect_and_identify(substrate: &WsSubstrate, label: &str) -> (Self, ControlMessage) {
        let mut client = Self::connect(substrate).await;
        let identify =
            ControlMessage::identify(&client.peer_id, label, &[PROTOCOL.to_string()], None);
        client.send_binary(&identify.to_binary().unwrap()).await;

        let reply = client.recv_message().await.expect("Expected identify reply");
        let reply = ControlMessage::from_binary(&reply).expect("Expected control frame");
        (client, reply)
    }

    /// Connect and open a protocol stream.
    async fn open_stream(substrate: &WsSubstrate, protocol: &str) -> Self {
        let mut client = Self::connect(substrate).await;
        let frame = ControlMessage::stream(&client.peer_id, protocol);
        client.send_binary(&frame.to_binary().unwrap()).await;
        client
    }

    fn identity(&self) -> PeerIdentity {
        self.peer_id.parse().unwrap()
    }

    /// Next data frame, or None once the connection is closed.
    async fn recv_message(&mut self) -> Option<Vec<u8>> {
        loop {
            match timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("Timeout waiting for message")
            {
                Some(Ok(Message::Binary(data))) => return Some(data.to_vec()),
                Some(Ok(Message::Text(text))) => return Some(text.into_bytes()),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                _ => continue,
            }
        }
    }

    async fn send_binary(&mut self, data: &[u8]) {
        self.ws
            .send(Message::Binary(data.to_vec().into()))
            .await
            .expect("Failed to send message");
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn id(s: &str) -> PeerIdentity {
    s.parse().unwrap()
}

fn config(local: &str, label: &str) -> SubstrateConfig {
    let mut config = SubstrateConfig::new(id(local), label, "127.0.0.1:0");
    config.protocols = vec![PROTOCOL.to_string()];
    config.identify_timeout = Duration::from_secs(2);
    config
}

async fn start(local: &str, label: &str) -> (WsSubstrate, mpsc::Receiver<SubstrateEvent>) {
    WsSubstrate::start(config(local, label))
        .await
        .expect("Failed to start substrate")
}

fn address_of(substrate: &WsSubstrate) -> PeerAddress {
    format!(
        "{}/p2p/{}",
        substrate.listen_url().unwrap(),
        substrate.local_identity()
    )
    .parse()
    .unwrap()
}

async fn next_event(events: &mut mpsc::Receiver<SubstrateEvent>) -> SubstrateEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Timeout waiting for substrate event")
        .expect("Event channel closed")
}

async fn no_event(events: &mut mpsc::Receiver<SubstrateEvent>, wait: Duration) -> bool {
    timeout(wait, events.recv()).await.is_err()
}

async fn wait_until(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ============================================================================
// Identify exchange
// ============================================================================

#[tokio::test]
async fn test_identify_reply_wire_format() {
    let (substrate, _events) = start("a1", "Whoosh-alpha").await;
    let (client, reply) = TestClient::connect_and_identify(&substrate, "DeviceX").await;

    let ControlMessage::Identify(identify) = reply else {
        panic!("Expected identify, got {:?}", reply);
    };
    assert_eq!(identify.version, 1);
    assert_eq!(identify.peer_id, "a1");
    assert_eq!(identify.agent_version, "Whoosh-alpha");
    assert_eq!(identify.protocols, vec![PROTOCOL.to_string()]);
    assert_eq!(
        identify.listen_addr,
        Some(format!("ws://{}", substrate.local_addr()))
    );

    client.close().await;
}

#[tokio::test]
async fn test_identify_emits_connected_identified_disconnected() {
    let (substrate, mut events) = start("a1", "Whoosh-alpha").await;
    let (client, _) = TestClient::connect_and_identify(&substrate, "DeviceX").await;
    let remote = client.identity();

    match next_event(&mut events).await {
        SubstrateEvent::Connected(peer) => assert_eq!(peer, remote),
        other => panic!("Expected Connected, got {:?}", other),
    }
    match next_event(&mut events).await {
        SubstrateEvent::Identified {
            peer,
            protocols,
            label,
        } => {
            assert_eq!(peer, remote);
            assert_eq!(protocols, vec![PROTOCOL.to_string()]);
            assert_eq!(label, "DeviceX");
        }
        other => panic!("Expected Identified, got {:?}", other),
    }
    assert!(substrate.is_connected(&remote).await);

    client.close().await;
    match next_event(&mut events).await {
        SubstrateEvent::Disconnected(peer) => assert_eq!(peer, remote),
        other => panic!("Expected Disconnected, got {:?}", other),
    }
    assert!(!substrate.is_connected(&remote).await);
}

#[tokio::test]
async fn test_invalid_control_frame_is_closed() {
    let (substrate, mut events) = start("a1", "Whoosh-alpha").await;
    let mut client = TestClient::connect(&substrate).await;

    client.send_binary(b"Hello from DeviceX").await;

    assert_eq!(client.recv_message().await, None);
    assert!(no_event(&mut events, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_identify_from_ourselves_is_rejected() {
    let (substrate, mut events) = start("a1", "Whoosh-alpha").await;
    let mut client = TestClient::connect(&substrate).await;

    let identify = ControlMessage::identify("a1", "Whoosh-alpha", &[], None);
    client.send_binary(&identify.to_binary().unwrap()).await;

    assert_eq!(client.recv_message().await, None);
    assert!(no_event(&mut events, Duration::from_millis(200)).await);
}

// ============================================================================
// Protocol streams
// ============================================================================

#[tokio::test]
async fn test_inbound_stream_is_routed() {
    let (substrate, mut events) = start("a1", "Whoosh-alpha").await;
    let mut client = TestClient::open_stream(&substrate, PROTOCOL).await;
    client.send_binary(b"Hello from DeviceX").await;

    let SubstrateEvent::InboundStream {
        peer,
        protocol,
        stream,
    } = next_event(&mut events).await
    else {
        panic!("Expected InboundStream");
    };
    assert_eq!(peer, client.identity());
    assert_eq!(protocol, PROTOCOL);

    let greeting = handshake::respond(stream, "Whoosh-alpha", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(greeting.as_deref(), Some("DeviceX"));

    let reply = client.recv_message().await.unwrap();
    assert_eq!(reply, b"Hello from Whoosh-alpha, DeviceX");
    // Responder closes after one reply
    assert_eq!(client.recv_message().await, None);
}

#[tokio::test]
async fn test_unsupported_protocol_stream_is_rejected() {
    let (substrate, mut events) = start("a1", "Whoosh-alpha").await;
    let mut client = TestClient::open_stream(&substrate, "/other/1.0").await;

    assert_eq!(client.recv_message().await, None);
    assert!(no_event(&mut events, Duration::from_millis(200)).await);
}

// ============================================================================
// Substrate to substrate
// ============================================================================

#[tokio::test]
async fn test_dial_connects_both_sides() {
    let (alpha, mut alpha_events) = start("a1", "Whoosh-alpha").await;
    let (beta, mut beta_events) = start("b2", "Whoosh-beta").await;
    alpha.remember_address(id("b2"), beta.listen_url().unwrap());

    alpha.dial(&id("b2")).await.unwrap();

    assert!(matches!(
        next_event(&mut alpha_events).await,
        SubstrateEvent::Connected(p) if p == id("b2")
    ));
    match next_event(&mut alpha_events).await {
        SubstrateEvent::Identified { peer, label, .. } => {
            assert_eq!(peer, id("b2"));
            assert_eq!(label, "Whoosh-beta");
        }
        other => panic!("Expected Identified, got {:?}", other),
    }
    assert!(matches!(
        next_event(&mut beta_events).await,
        SubstrateEvent::Connected(p) if p == id("a1")
    ));
    match next_event(&mut beta_events).await {
        SubstrateEvent::Identified { peer, label, .. } => {
            assert_eq!(peer, id("a1"));
            assert_eq!(label, "Whoosh-alpha");
        }
        other => panic!("Expected Identified, got {:?}", other),
    }

    // Beta learned where to reach alpha from the identify frame
    assert_eq!(beta.address_of(&id("a1")), alpha.listen_url().map(str::to_string));

    // Dialing again is a no-op
    alpha.dial(&id("b2")).await.unwrap();
    assert!(no_event(&mut alpha_events, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_handshake_over_websocket_streams() {
    let (alpha, _alpha_events) = start("a1", "Whoosh-alpha").await;
    let (beta, mut beta_events) = start("b2", "Whoosh-beta").await;
    alpha.remember_address(id("b2"), beta.listen_url().unwrap());
    alpha.dial(&id("b2")).await.unwrap();

    let initiator = tokio::spawn({
        let alpha = alpha.clone();
        async move {
            handshake::perform(
                &alpha,
                &id("b2"),
                PROTOCOL,
                "Whoosh-alpha",
                Duration::from_secs(2),
            )
            .await
        }
    });

    let stream = loop {
        match next_event(&mut beta_events).await {
            SubstrateEvent::InboundStream { stream, .. } => break stream,
            _ => continue,
        }
    };
    handshake::respond(stream, "Whoosh-beta", Duration::from_secs(2))
        .await
        .unwrap();

    match initiator.await.unwrap() {
        HandshakeOutcome::Succeeded { reply } => {
            assert_eq!(reply, "Hello from Whoosh-beta, Whoosh-alpha");
        }
        other => panic!("Expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_open_stream_requires_connection() {
    let (alpha, _alpha_events) = start("a1", "Whoosh-alpha").await;
    let (beta, _beta_events) = start("b2", "Whoosh-beta").await;
    alpha.remember_address(id("b2"), beta.listen_url().unwrap());

    let result = alpha.open_protocol_stream(&id("b2"), PROTOCOL).await;
    assert!(matches!(result, Err(TransportError::PeerNotFound(_))));
}

#[tokio::test]
async fn test_open_stream_checks_remote_protocols() {
    let (alpha, _alpha_events) = start("a1", "Whoosh-alpha").await;
    let (beta, _beta_events) = start("b2", "Whoosh-beta").await;
    alpha.remember_address(id("b2"), beta.listen_url().unwrap());
    alpha.dial(&id("b2")).await.unwrap();

    let result = alpha.open_protocol_stream(&id("b2"), "/other/1.0").await;
    assert!(matches!(
        result,
        Err(TransportError::ProtocolUnsupported { .. })
    ));
}

#[tokio::test]
async fn test_dial_wrong_identity_fails() {
    let (alpha, mut alpha_events) = start("a1", "Whoosh-alpha").await;
    let (beta, _beta_events) = start("b2", "Whoosh-beta").await;
    alpha.remember_address(id("impostor"), beta.listen_url().unwrap());

    let result = alpha.dial(&id("impostor")).await;
    assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    assert!(!alpha.is_connected(&id("b2")).await);
    assert!(no_event(&mut alpha_events, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_dial_refused_fails() {
    let (alpha, _alpha_events) = start("a1", "Whoosh-alpha").await;
    let (beta, _beta_events) = start("b2", "Whoosh-beta").await;
    let url = beta.listen_url().unwrap().to_string();
    beta.stop().await.unwrap();
    drop(beta);
    tokio::time::sleep(Duration::from_millis(50)).await;

    alpha.remember_address(id("b2"), url);
    let result = alpha.dial(&id("b2")).await;
    assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
}

#[tokio::test]
async fn test_simultaneous_dial_keeps_one_connection() {
    let (alpha, _alpha_events) = start("a1", "Whoosh-alpha").await;
    let (beta, _beta_events) = start("b2", "Whoosh-beta").await;
    alpha.remember_address(id("b2"), beta.listen_url().unwrap());
    beta.remember_address(id("a1"), alpha.listen_url().unwrap());

    let (a, b) = tokio::join!(alpha.dial(&id("b2")), beta.dial(&id("a1")));
    assert!(a.is_ok());
    assert!(b.is_ok());
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(alpha.connected_peers().await, vec![id("b2")]);
    assert_eq!(beta.connected_peers().await, vec![id("a1")]);
}

#[tokio::test]
async fn test_stop_disconnects_remote() {
    let (alpha, _alpha_events) = start("a1", "Whoosh-alpha").await;
    let (beta, mut beta_events) = start("b2", "Whoosh-beta").await;
    alpha.remember_address(id("b2"), beta.listen_url().unwrap());
    alpha.dial(&id("b2")).await.unwrap();

    alpha.stop().await.unwrap();

    let disconnected = loop {
        if let SubstrateEvent::Disconnected(peer) = next_event(&mut beta_events).await {
            break peer;
        }
    };
    assert_eq!(disconnected, id("a1"));
    assert!(matches!(
        alpha.dial(&id("b2")).await,
        Err(TransportError::Stopped)
    ));
}

// ============================================================================
// Client daemon against backend daemon
// ============================================================================

#[tokio::test]
async fn test_client_reaches_backend_and_notices_loss() {
    let (backend_substrate, backend_events) = start("backend1", "Whoosh-backend").await;
    let server = tokio::spawn(backend::serve(
        backend_events,
        "Whoosh-backend".to_string(),
        PROTOCOL.to_string(),
        Duration::from_secs(2),
    ));

    let mut client_config = config("client1", "Whoosh-client");
    client_config.bootstrap = vec![address_of(&backend_substrate)];
    let (client, client_events) = WsSubstrate::start(client_config).await.unwrap();

    let publisher = Arc::new(StatusPublisher::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = publisher.subscribe({
        let seen = Arc::clone(&seen);
        move |event| seen.lock().unwrap().push(event)
    });

    let settings = OrchestratorSettings {
        backend: id("backend1"),
        protocol: PROTOCOL.to_string(),
        local_label: "Whoosh-client".to_string(),
        reconnect_delay: Duration::from_millis(200),
        handshake_timeout: Duration::from_secs(2),
    };
    let handle = SessionOrchestrator::new(
        settings,
        Arc::new(client.clone()),
        client_events,
        Arc::clone(&publisher),
    )
    .start();

    assert!(
        wait_until(|| publisher.snapshot().connection_status.is_connected).await,
        "client never reached the backend"
    );
    assert_eq!(publisher.snapshot().peer_id, "client1");
    assert!(seen.lock().unwrap().iter().any(|e| matches!(
        e,
        StatusEvent::ConnectionStatus(s) if s.is_connected
    )));

    // The backend goes away; its listener closes with it
    backend_substrate.stop().await.unwrap();
    server.abort();

    assert!(
        wait_until(|| !publisher.snapshot().connection_status.is_connected).await,
        "client never noticed the backend leaving"
    );
    assert!(!handle.connection_status().await.unwrap().is_connected);

    handle.stop().await.unwrap();
}
