//! Protocol streams carried on their own WebSocket connection.

use crate::message::MAX_MESSAGE_SIZE;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use presence_core::transport::{ProtocolStream, Result, TransportError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, warn};

/// One protocol stream: each binary frame is a payload, a close frame ends it.
pub struct WsProtocolStream<S> {
    ws: WebSocketStream<S>,
    closed: bool,
}

impl<S> WsProtocolStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connection whose control frame has already been exchanged.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws, closed: false }
    }
}

#[async_trait]
impl<S> ProtocolStream for WsProtocolStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TransportError::SendFailed("stream closed".into()));
        }
        self.ws
            .send(Message::Binary(payload.to_vec().into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.ws.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Stream closed by remote");
                            return Ok(None);
                        }
                    };
                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Stream payload exceeds max size ({} > {}), dropping",
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }
                    return Ok(Some(data));
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.ws.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(e.to_string())),
        }
    }
}
