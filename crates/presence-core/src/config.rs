//! Static configuration for the presence layer.
//!
//! Everything here is fixed at startup; nothing is renegotiated at runtime.

use crate::peer_id::{PeerIdError, PeerIdentity};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Application protocol spoken by participating peers.
pub const DEFAULT_PROTOCOL: &str = "/whoosh/client-hello/1.0";

/// Service tag used for local network discovery.
pub const DEFAULT_DISCOVERY_TAG: &str = "whoosh-local";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Address {0:?} has no /p2p/<peer-id> component")]
    MissingPeerId(String),
    #[error("Unsupported address format: {0:?}")]
    UnsupportedAddress(String),
    #[error("Invalid peer id in address {address:?}: {source}")]
    InvalidPeerId {
        address: String,
        #[source]
        source: PeerIdError,
    },
    #[error("No bootstrap peers configured, cannot determine the backend peer")]
    NoBackendPeer,
}

/// Presence-layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceConfig {
    /// Application protocol identifier
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Bootstrap addresses; the first entry's identity is the backend peer
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// Delay before the single reconnect attempt after losing the backend
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Bounded wait for the handshake reply
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// How often local discovery re-announces peers we have not connected to
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,

    /// Local discovery service tag
    #[serde(default = "default_discovery_tag")]
    pub discovery_tag: String,

    /// Label sent in identify and greetings (defaults to "Whoosh-<hostname>")
    #[serde(default)]
    pub device_name: Option<String>,
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_discovery_interval_ms() -> u64 {
    5000
}

fn default_discovery_tag() -> String {
    DEFAULT_DISCOVERY_TAG.to_string()
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            bootstrap_peers: Vec::new(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            discovery_interval_ms: default_discovery_interval_ms(),
            discovery_tag: default_discovery_tag(),
            device_name: None,
        }
    }
}

impl PresenceConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    /// Parse all bootstrap addresses.
    pub fn bootstrap_addresses(&self) -> Result<Vec<PeerAddress>, ConfigError> {
        self.bootstrap_peers.iter().map(|a| a.parse()).collect()
    }

    /// Identity embedded in the first bootstrap address, if any.
    pub fn backend_peer(&self) -> Result<Option<PeerIdentity>, ConfigError> {
        match self.bootstrap_peers.first() {
            Some(addr) => Ok(Some(addr.parse::<PeerAddress>()?.peer)),
            None => Ok(None),
        }
    }
}

/// A dialable WebSocket address with an embedded peer identity.
///
/// Accepts `ws://host:port/p2p/<id>` (or `wss://`) and the multiaddr form
/// `/ip4/<host>/tcp/<port>/ws/p2p/<id>` (`ip6`, `dns`, `dns4`, `dns6` too).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    /// WebSocket URL without the `/p2p/` suffix
    pub url: String,
    pub peer: PeerIdentity,
}

impl PeerAddress {
    pub fn new(url: impl Into<String>, peer: PeerIdentity) -> Self {
        Self {
            url: url.into(),
            peer,
        }
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/p2p/{}", self.url, self.peer)
    }
}

impl FromStr for PeerAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, id) = s
            .rsplit_once("/p2p/")
            .ok_or_else(|| ConfigError::MissingPeerId(s.to_string()))?;

        let peer = id.parse().map_err(|source| ConfigError::InvalidPeerId {
            address: s.to_string(),
            source,
        })?;

        let url = if base.starts_with("ws://") || base.starts_with("wss://") {
            base.trim_end_matches('/').to_string()
        } else if base.starts_with('/') {
            multiaddr_to_url(base).ok_or_else(|| ConfigError::UnsupportedAddress(s.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedAddress(s.to_string()));
        };

        Ok(Self { url, peer })
    }
}

/// Convert `/ip4/1.2.3.4/tcp/4002/ws` into `ws://1.2.3.4:4002`.
fn multiaddr_to_url(addr: &str) -> Option<String> {
    let parts: Vec<&str> = addr.trim_start_matches('/').split('/').collect();
    match parts.as_slice() {
        [proto, host, "tcp", port, scheme @ ("ws" | "wss")] => {
            port.parse::<u16>().ok()?;
            let host = match *proto {
                "ip6" => format!("[{}]", host),
                "ip4" | "dns" | "dns4" | "dns6" => host.to_string(),
                _ => return None,
            };
            Some(format!("{}://{}:{}", scheme, host, port))
        }
        _ => None,
    }
}
