//! One-shot application handshake.
//!
//! The initiator sends a plaintext greeting and waits a bounded time for a
//! single reply. The responder reads the greeting, answers once and closes.
//! There is no second round.

use crate::peer_id::PeerIdentity;
use crate::transport::{ProtocolStream, Substrate, TransportError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info};

/// Every greeting starts with this prefix.
pub const GREETING_PREFIX: &str = "Hello from ";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Failed to open handshake stream: {0}")]
    Open(#[source] TransportError),
    #[error("Failed to send handshake: {0}")]
    Send(#[source] TransportError),
    #[error("Failed to read handshake: {0}")]
    Receive(#[source] TransportError),
}

/// Greeting payload: `"Hello from <label>"` as UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub label: String,
}

impl Greeting {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}{}", GREETING_PREFIX, self.label).into_bytes()
    }

    /// Returns None if the payload is not UTF-8 or lacks the greeting prefix.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let label = text.strip_prefix(GREETING_PREFIX)?;
        Some(Self::new(label))
    }
}

/// How a handshake ended, as recorded on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HandshakeStatus {
    Succeeded,
    SoftFailed,
    Failed,
}

/// Result of running the initiator side.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Remote answered with a non-empty payload
    Succeeded { reply: String },
    /// Remote closed without answering, or the wait elapsed
    SoftFailed { timed_out: bool },
    /// Transport error before a determinate close
    Failed(HandshakeError),
}

impl HandshakeOutcome {
    pub fn status(&self) -> HandshakeStatus {
        match self {
            Self::Succeeded { .. } => HandshakeStatus::Succeeded,
            Self::SoftFailed { .. } => HandshakeStatus::SoftFailed,
            Self::Failed(_) => HandshakeStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Open a stream to `peer` and run the initiator side over it.
pub async fn perform(
    substrate: &dyn Substrate,
    peer: &PeerIdentity,
    protocol: &str,
    local_label: &str,
    wait: Duration,
) -> HandshakeOutcome {
    match substrate.open_protocol_stream(peer, protocol).await {
        Ok(stream) => initiate(stream, local_label, wait).await,
        Err(e) => HandshakeOutcome::Failed(HandshakeError::Open(e)),
    }
}

/// Run the initiator side over an open stream. The stream is always closed.
pub async fn initiate(
    mut stream: Box<dyn ProtocolStream>,
    local_label: &str,
    wait: Duration,
) -> HandshakeOutcome {
    let outcome = exchange(stream.as_mut(), local_label, wait).await;
    if let Err(e) = stream.close().await {
        debug!("Error closing handshake stream: {}", e);
    }
    outcome
}

async fn exchange(
    stream: &mut dyn ProtocolStream,
    local_label: &str,
    wait: Duration,
) -> HandshakeOutcome {
    if let Err(e) = stream.send(&Greeting::new(local_label).to_bytes()).await {
        return HandshakeOutcome::Failed(HandshakeError::Send(e));
    }

    match timeout(wait, read_payload(stream)).await {
        Ok(Ok(Some(reply))) => HandshakeOutcome::Succeeded {
            reply: String::from_utf8_lossy(&reply).into_owned(),
        },
        Ok(Ok(None)) => HandshakeOutcome::SoftFailed { timed_out: false },
        Ok(Err(e)) => HandshakeOutcome::Failed(HandshakeError::Receive(e)),
        Err(_) => HandshakeOutcome::SoftFailed { timed_out: true },
    }
}

/// Next non-empty payload, or None once the stream ends.
async fn read_payload(
    stream: &mut dyn ProtocolStream,
) -> Result<Option<Vec<u8>>, TransportError> {
    loop {
        match stream.recv().await? {
            Some(payload) if payload.is_empty() => continue,
            other => return Ok(other),
        }
    }
}

/// Reply text for an inbound greeting.
pub fn reply_for(local_label: &str, greeting: Option<&[u8]>) -> String {
    let remote = greeting.map(|data| match Greeting::from_bytes(data) {
        Some(g) => g.label,
        None => String::from_utf8_lossy(data).into_owned(),
    });
    match remote {
        Some(remote) if !remote.is_empty() => {
            format!("{}{}, {}", GREETING_PREFIX, local_label, remote)
        }
        _ => format!("{}{}", GREETING_PREFIX, local_label),
    }
}

/// Run the responder side: read one greeting, answer once, close.
///
/// Returns the remote's greeting label when one was received.
pub async fn respond(
    mut stream: Box<dyn ProtocolStream>,
    local_label: &str,
    wait: Duration,
) -> Result<Option<String>, HandshakeError> {
    let result = answer(stream.as_mut(), local_label, wait).await;
    if let Err(e) = stream.close().await {
        debug!("Error closing responder stream: {}", e);
    }
    result
}

async fn answer(
    stream: &mut dyn ProtocolStream,
    local_label: &str,
    wait: Duration,
) -> Result<Option<String>, HandshakeError> {
    let greeting = match timeout(wait, read_payload(stream)).await {
        Ok(Ok(greeting)) => greeting,
        Ok(Err(e)) => return Err(HandshakeError::Receive(e)),
        Err(_) => {
            debug!("No greeting within {:?}, answering anyway", wait);
            None
        }
    };

    if let Some(data) = &greeting {
        info!(
            "Received greeting: {}",
            String::from_utf8_lossy(data)
        );
    }

    let reply = reply_for(local_label, greeting.as_deref());
    stream
        .send(reply.as_bytes())
        .await
        .map_err(HandshakeError::Send)?;

    Ok(greeting
        .as_deref()
        .and_then(Greeting::from_bytes)
        .map(|g| g.label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Stream that replays scripted receive results and records what was sent.
    struct ScriptedStream {
        incoming: VecDeque<Result<Option<Vec<u8>>, TransportError>>,
        /// Block forever once the script runs out
        hang_when_empty: bool,
        fail_send: bool,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl ScriptedStream {
        fn new(incoming: Vec<Result<Option<Vec<u8>>, TransportError>>) -> Self {
            Self {
                incoming: incoming.into(),
                hang_when_empty: false,
                fail_send: false,
                sent: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(Mutex::new(false)),
            }
        }
    }

    #[async_trait]
    impl ProtocolStream for ScriptedStream {
        async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
            if self.fail_send {
                return Err(TransportError::SendFailed("reset".into()));
            }
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            match self.incoming.pop_front() {
                Some(next) => next,
                None if self.hang_when_empty => std::future::pending().await,
                None => Ok(None),
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    const WAIT: Duration = Duration::from_millis(200);

    // ==================== Greeting ====================

    #[test]
    fn test_greeting_wire_format() {
        let greeting = Greeting::new("Whoosh-laptop");
        assert_eq!(greeting.to_bytes(), b"Hello from Whoosh-laptop".to_vec());
        assert_eq!(
            Greeting::from_bytes(b"Hello from Whoosh-laptop"),
            Some(greeting)
        );
    }

    #[test]
    fn test_greeting_rejects_other_text() {
        assert!(Greeting::from_bytes(b"Goodbye").is_none());
        assert!(Greeting::from_bytes(&[0xff, 0xfe]).is_none());
    }

    #[test]
    fn test_reply_references_both_labels() {
        assert_eq!(
            reply_for("backend", Some(b"Hello from laptop")),
            "Hello from backend, laptop"
        );
        assert_eq!(reply_for("backend", Some(b"hi")), "Hello from backend, hi");
        assert_eq!(reply_for("backend", None), "Hello from backend");
    }

    // ==================== Initiator ====================

    #[tokio::test]
    async fn test_reply_means_succeeded() {
        let stream = ScriptedStream::new(vec![Ok(Some(b"Hello from backend".to_vec()))]);
        let sent = stream.sent.clone();
        let closed = stream.closed.clone();

        let outcome = initiate(Box::new(stream), "laptop", WAIT).await;

        match outcome {
            HandshakeOutcome::Succeeded { reply } => assert_eq!(reply, "Hello from backend"),
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(sent.lock().unwrap().as_slice(), &[b"Hello from laptop".to_vec()]);
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_close_without_reply_is_soft_failure() {
        let stream = ScriptedStream::new(vec![Ok(None)]);
        let closed = stream.closed.clone();

        let outcome = initiate(Box::new(stream), "laptop", WAIT).await;

        assert!(matches!(
            outcome,
            HandshakeOutcome::SoftFailed { timed_out: false }
        ));
        assert_eq!(outcome.status(), HandshakeStatus::SoftFailed);
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_empty_payloads_are_skipped() {
        let stream = ScriptedStream::new(vec![Ok(Some(Vec::new())), Ok(Some(b"ack".to_vec()))]);
        let outcome = initiate(Box::new(stream), "laptop", WAIT).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_read_error_is_failure() {
        let stream = ScriptedStream::new(vec![Err(TransportError::ReceiveFailed("reset".into()))]);
        let closed = stream.closed.clone();

        let outcome = initiate(Box::new(stream), "laptop", WAIT).await;

        assert!(matches!(
            outcome,
            HandshakeOutcome::Failed(HandshakeError::Receive(_))
        ));
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_send_error_is_failure() {
        let mut stream = ScriptedStream::new(vec![]);
        stream.fail_send = true;
        let closed = stream.closed.clone();

        let outcome = initiate(Box::new(stream), "laptop", WAIT).await;

        assert!(matches!(
            outcome,
            HandshakeOutcome::Failed(HandshakeError::Send(_))
        ));
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_silence_times_out_as_soft_failure() {
        let mut stream = ScriptedStream::new(vec![]);
        stream.hang_when_empty = true;
        let closed = stream.closed.clone();

        let outcome = initiate(Box::new(stream), "laptop", Duration::from_millis(20)).await;

        assert!(matches!(
            outcome,
            HandshakeOutcome::SoftFailed { timed_out: true }
        ));
        assert!(*closed.lock().unwrap());
    }

    // ==================== Responder ====================

    #[tokio::test]
    async fn test_responder_answers_once_and_closes() {
        let stream = ScriptedStream::new(vec![Ok(Some(b"Hello from laptop".to_vec()))]);
        let sent = stream.sent.clone();
        let closed = stream.closed.clone();

        let label = respond(Box::new(stream), "backend", WAIT).await.unwrap();

        assert_eq!(label.as_deref(), Some("laptop"));
        assert_eq!(
            sent.lock().unwrap().as_slice(),
            &[b"Hello from backend, laptop".to_vec()]
        );
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_responder_read_error_is_returned() {
        let stream = ScriptedStream::new(vec![Err(TransportError::ReceiveFailed("reset".into()))]);
        let sent = stream.sent.clone();
        let closed = stream.closed.clone();

        let result = respond(Box::new(stream), "backend", WAIT).await;

        assert!(matches!(result, Err(HandshakeError::Receive(_))));
        assert!(sent.lock().unwrap().is_empty());
        assert!(*closed.lock().unwrap());
    }
}
