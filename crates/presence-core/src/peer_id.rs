//! PeerIdentity: identifier the substrate assigns to a peer.
//!
//! Opaque to the orchestrator. The canonical string form is the only form
//! ever compared, so the derived `Ord` (byte-wise on the string) is the
//! total order both sides of a tie-break agree on.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Peer identity cannot be empty")]
    Empty,
    #[error("Invalid character {0:?} in peer identity")]
    InvalidChar(char),
}

/// A peer identity in canonical string form.
///
/// # Examples
/// ```
/// use presence_core::PeerIdentity;
///
/// let a: PeerIdentity = "12D3KooWAlpha".parse().unwrap();
/// let b: PeerIdentity = "12D3KooWBeta".parse().unwrap();
/// assert!(a < b);
/// assert_eq!(a.to_string(), "12D3KooWAlpha");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Generate a new random identity (16 lowercase hex chars).
    ///
    /// Never returns the all-zero identity.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(format!("{:016x}", id));
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerIdentity {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PeerIdError::Empty);
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(PeerIdError::InvalidChar(c));
        }
        Ok(Self(s.to_string()))
    }
}

impl AsRef<str> for PeerIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Serialize as the canonical string so events and logs agree
impl serde::Serialize for PeerIdentity {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerIdentity {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
