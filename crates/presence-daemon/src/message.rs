//! Control frames for the WebSocket substrate.
//!
//! Every connection opens with one JSON control frame sent as a binary
//! WebSocket message. Peer connections exchange `identify` in both
//! directions; protocol streams send a single `stream` frame, after which
//! each binary frame is one payload.

use serde::{Deserialize, Serialize};

/// Wire format version carried in every control frame.
pub const WIRE_VERSION: u32 = 1;

/// Frames larger than this are dropped.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Identity, label and supported protocols of one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyMessage {
    pub version: u32,
    pub peer_id: String,
    /// Human-readable label ("Whoosh-<hostname>")
    pub agent_version: String,
    pub protocols: Vec<String>,
    /// Where this peer accepts connections, if anywhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,
}

/// Opens a protocol stream on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub version: u32,
    pub peer_id: String,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    Identify(IdentifyMessage),
    Stream(StreamMessage),
}

impl ControlMessage {
    pub fn identify(
        peer_id: &str,
        agent_version: &str,
        protocols: &[String],
        listen_addr: Option<&str>,
    ) -> Self {
        Self::Identify(IdentifyMessage {
            version: WIRE_VERSION,
            peer_id: peer_id.to_string(),
            agent_version: agent_version.to_string(),
            protocols: protocols.to_vec(),
            listen_addr: listen_addr.map(str::to_string),
        })
    }

    pub fn stream(peer_id: &str, protocol: &str) -> Self {
        Self::Stream(StreamMessage {
            version: WIRE_VERSION,
            peer_id: peer_id.to_string(),
            protocol: protocol.to_string(),
        })
    }

    /// Serialize to UTF-8 JSON bytes for sending as a binary WebSocket frame.
    pub fn to_binary(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse a control frame.
    ///
    /// Returns None if the data is not a control frame of a version we speak.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let msg: Self = serde_json::from_slice(data).ok()?;
        if msg.version() == WIRE_VERSION {
            Some(msg)
        } else {
            None
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            Self::Identify(m) => m.version,
            Self::Stream(m) => m.version,
        }
    }

    pub fn peer_id(&self) -> &str {
        match self {
            Self::Identify(m) => &m.peer_id,
            Self::Stream(m) => &m.peer_id,
        }
    }
}
