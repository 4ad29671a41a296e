//! JSON-lines bridge between the status publisher and a UI process.
//!
//! Status events are written one JSON object per line. The UI may send
//! requests back, one per line:
//! - `ready`: re-send current status and identity
//! - `status`: answer with the current connection status
//! - `peer-id`: answer with the local identity

use presence_core::{StatusEvent, StatusPublisher, Subscription};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// A line-oriented request from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiRequest {
    Ready,
    Status,
    PeerId,
}

impl UiRequest {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "ready" => Some(Self::Ready),
            "status" => Some(Self::Status),
            "peer-id" => Some(Self::PeerId),
            _ => None,
        }
    }
}

/// Encode one event as a JSON line (without the newline).
pub fn encode_line(event: &StatusEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(line) => Some(line),
        Err(e) => {
            warn!("Failed to encode status event: {}", e);
            None
        }
    }
}

/// Forward every published event to `sink` as a JSON line.
///
/// Starts with the current status and identity.
pub fn subscribe_lines(
    publisher: &Arc<StatusPublisher>,
    sink: impl Fn(String) + Send + Sync + 'static,
) -> Subscription {
    publisher.subscribe_with_replay(move |event| {
        if let Some(line) = encode_line(&event) {
            sink(line);
        }
    })
}

/// Answer a request. Direct answers are returned; `Ready` replays through
/// the subscription instead.
pub fn handle_request(publisher: &StatusPublisher, request: UiRequest) -> Option<StatusEvent> {
    match request {
        UiRequest::Ready => {
            publisher.replay();
            None
        }
        UiRequest::Status => Some(StatusEvent::ConnectionStatus(
            publisher.snapshot().connection_status,
        )),
        UiRequest::PeerId => Some(StatusEvent::PeerIdUpdate {
            id: publisher.snapshot().peer_id,
        }),
    }
}

/// Serve requests from `reader` until it ends.
pub async fn serve_requests<R>(
    reader: R,
    publisher: Arc<StatusPublisher>,
    sink: impl Fn(String),
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let Some(request) = UiRequest::parse(&line) else {
                    warn!("Unknown UI request: {:?}", line);
                    continue;
                };
                debug!("UI request: {:?}", request);
                let answer = handle_request(&publisher, request);
                if let Some(encoded) = answer.as_ref().and_then(encode_line) {
                    sink(encoded);
                }
            }
            Ok(None) => {
                debug!("UI request stream closed");
                break;
            }
            Err(e) => {
                warn!("Failed to read UI request: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::{ConnectionStatus, PeerIdentity};
    use std::sync::Mutex;

    fn collector() -> (Arc<Mutex<Vec<String>>>, impl Fn(String) + Send + Sync + 'static) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        (lines, move |line| sink_lines.lock().unwrap().push(line))
    }

    #[test]
    fn test_parse_requests() {
        assert_eq!(UiRequest::parse("ready\n"), Some(UiRequest::Ready));
        assert_eq!(UiRequest::parse(" status "), Some(UiRequest::Status));
        assert_eq!(UiRequest::parse("peer-id"), Some(UiRequest::PeerId));
        assert_eq!(UiRequest::parse("shutdown"), None);
    }

    #[test]
    fn test_subscription_starts_with_current_state() {
        let publisher = Arc::new(StatusPublisher::new());
        let (lines, sink) = collector();
        let _sub = subscribe_lines(&publisher, sink);

        assert_eq!(
            *lines.lock().unwrap(),
            vec![
                r#"{"connectionStatus":{"isConnected":false}}"#.to_string(),
                r#"{"peerIdUpdate":{"id":"Initializing..."}}"#.to_string(),
            ]
        );
    }

    #[test]
    fn test_published_events_become_lines() {
        let publisher = Arc::new(StatusPublisher::new());
        let (lines, sink) = collector();
        let _sub = subscribe_lines(&publisher, sink);
        lines.lock().unwrap().clear();

        publisher.publish(StatusEvent::PeerFound {
            id: "b2".parse().unwrap(),
            name: "DeviceX".to_string(),
        });
        assert_eq!(
            lines.lock().unwrap().last().unwrap(),
            r#"{"peerFound":{"id":"b2","name":"DeviceX"}}"#
        );
    }

    #[tokio::test]
    async fn test_serve_requests() {
        let publisher = Arc::new(StatusPublisher::new());
        publisher.set_local_identity(&"a1".parse::<PeerIdentity>().unwrap());
        publisher.publish(StatusEvent::ConnectionStatus(ConnectionStatus {
            is_connected: true,
        }));

        let (replayed, replay_sink) = collector();
        let _sub = subscribe_lines(&publisher, replay_sink);
        replayed.lock().unwrap().clear();

        let (answers, answer_sink) = collector();
        let input: &[u8] = b"status\npeer-id\nbogus\n\nready\n";
        serve_requests(input, Arc::clone(&publisher), answer_sink).await;

        assert_eq!(
            *answers.lock().unwrap(),
            vec![
                r#"{"connectionStatus":{"isConnected":true}}"#.to_string(),
                r#"{"peerIdUpdate":{"id":"a1"}}"#.to_string(),
            ]
        );
        // "ready" went out through the subscription
        assert_eq!(replayed.lock().unwrap().len(), 2);
    }
}
