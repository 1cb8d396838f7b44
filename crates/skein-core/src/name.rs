//! Peer identity.
//!
//! A `PeerName` is 48 bits wide, the same width as a MAC address, and is
//! rendered the same way (`aa:bb:cc:dd:ee:ff`). Names are totally ordered;
//! route computation relies on that order for determinism.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Bytes a name occupies on the wire.
pub const NAME_SIZE: usize = 6;

/// Random tie-breaker distinguishing incarnations of the same name.
pub type PeerUid = u64;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PeerName(u64);

/// The name no real peer can have. Used as the next hop of ourself.
pub const UNKNOWN_PEER_NAME: PeerName = PeerName(0);

impl PeerName {
    /// Derive a name from a hardware address.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut wide = [0u8; 8];
        wide[2..].copy_from_slice(&mac);
        Self(u64::from_be_bytes(wide))
    }

    /// A random, locally administered, unicast name.
    pub fn random() -> Self {
        let mut mac = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut mac);
        mac[0] = (mac[0] | 0x02) & 0xfe;
        Self::from_mac(mac)
    }

    /// Read a name from the first `NAME_SIZE` bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NameError> {
        let mac: [u8; 6] = bytes
            .get(..NAME_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(NameError::Truncated(bytes.len()))?;
        Ok(Self::from_mac(mac))
    }

    pub fn to_bytes(self) -> [u8; NAME_SIZE] {
        let wide = self.0.to_be_bytes();
        let mut out = [0u8; NAME_SIZE];
        out.copy_from_slice(&wide[2..]);
        out
    }

    pub fn is_unknown(self) -> bool {
        self == UNKNOWN_PEER_NAME
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for PeerName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mac = [0u8; NAME_SIZE];
        let mut parts = s.split(':');
        for byte in mac.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| NameError::Invalid(s.to_string()))?;
            let decoded = hex::decode(part).map_err(|_| NameError::Invalid(s.to_string()))?;
            *byte = decoded[0];
        }
        if parts.next().is_some() {
            return Err(NameError::Invalid(s.to_string()));
        }
        Ok(Self::from_mac(mac))
    }
}

impl From<PeerName> for String {
    fn from(name: PeerName) -> String {
        name.to_string()
    }
}

impl TryFrom<String> for PeerName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

pub fn random_uid() -> PeerUid {
    rand::thread_rng().next_u64()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("invalid peer name {0:?}")]
    Invalid(String),

    #[error("peer name needs {NAME_SIZE} bytes, got {0}")]
    Truncated(usize),
}
