//! presence-daemon: runs presence orchestration over WebSockets.
//!
//! The library half holds everything the binary wires together, so the
//! end-to-end tests can drive real substrates in-process.

pub mod backend;
pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod message;
pub mod stream;
pub mod substrate;

pub use bootstrap::BackoffConfig;
pub use config::Config;
pub use connection::ConnectionDirection;
pub use message::ControlMessage;
pub use substrate::{SubstrateConfig, WsSubstrate};
