//! Application protocol spoken over substrate streams.
//!
//! Only one exchange exists: the single-round liveness handshake.

pub mod handshake;

pub use handshake::{
    Greeting, HandshakeError, HandshakeOutcome, HandshakeStatus, GREETING_PREFIX,
};
