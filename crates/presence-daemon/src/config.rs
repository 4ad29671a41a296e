//! Daemon configuration file.
//!
//! A JSON object holding the presence settings plus daemon-only fields.
//! Every field is optional.

use anyhow::{Context, Result};
use presence_core::{ConfigError, PeerAddress, PeerIdentity, PresenceConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(flatten)]
    pub presence: PresenceConfig,

    /// Socket address to accept connections on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Address peers should dial us at (defaults to the local IP)
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Advertise and browse on the LAN via mDNS
    #[serde(default = "default_true")]
    pub mdns: bool,

    /// Addresses announced as discovered every discovery interval
    #[serde(default)]
    pub static_peers: Vec<String>,

    /// Fixed identity (generated at startup if not set)
    #[serde(default)]
    pub peer_id: Option<String>,
}

fn default_listen() -> String {
    "0.0.0.0:4002".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            presence: PresenceConfig::default(),
            listen: default_listen(),
            advertise_address: None,
            mdns: true,
            static_peers: Vec::new(),
            peer_id: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, or defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn static_addresses(&self) -> Result<Vec<PeerAddress>, ConfigError> {
        self.static_peers.iter().map(|a| a.parse()).collect()
    }

    /// Configured identity, or a freshly generated one.
    pub fn identity(&self) -> Result<PeerIdentity> {
        match &self.peer_id {
            Some(id) => id
                .parse()
                .with_context(|| format!("Invalid peer id {:?}", id)),
            None => Ok(PeerIdentity::generate()),
        }
    }

    /// Label sent in identify and greetings.
    pub fn device_name(&self) -> String {
        if let Some(name) = &self.presence.device_name {
            return name.clone();
        }
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        format!("Whoosh-{}", host)
    }

    /// Client mode needs a backend; without bootstrap peers we act as one.
    pub fn is_backend(&self) -> bool {
        self.presence.bootstrap_peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("presence.json")).unwrap();

        assert_eq!(config.listen, "0.0.0.0:4002");
        assert!(config.mdns);
        assert!(config.is_backend());
        assert_eq!(config.presence.protocol, "/whoosh/client-hello/1.0");
    }

    #[test]
    fn test_load_flattened_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.json");
        std::fs::write(
            &path,
            r#"{
                "bootstrapPeers": ["/ip4/10.0.0.1/tcp/4002/ws/p2p/backend1"],
                "reconnectDelayMs": 250,
                "deviceName": "Whoosh-test",
                "listen": "127.0.0.1:0",
                "mdns": false,
                "staticPeers": ["ws://10.0.0.2:4002/p2p/peer2"],
                "peerId": "a1b2c3"
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.presence.reconnect_delay(), Duration::from_millis(250));
        assert_eq!(config.presence.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.device_name(), "Whoosh-test");
        assert_eq!(config.listen, "127.0.0.1:0");
        assert!(!config.mdns);
        assert!(!config.is_backend());
        assert_eq!(config.identity().unwrap().as_str(), "a1b2c3");

        let statics = config.static_addresses().unwrap();
        assert_eq!(statics[0].url, "ws://10.0.0.2:4002");
        assert_eq!(statics[0].peer.as_str(), "peer2");
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_invalid_peer_id_is_an_error() {
        let config = Config {
            peer_id: Some("has space".to_string()),
            ..Config::default()
        };
        assert!(config.identity().is_err());
    }

    #[test]
    fn test_default_device_name_uses_hostname() {
        assert!(Config::default().device_name().starts_with("Whoosh-"));
    }
}
