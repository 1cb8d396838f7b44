//! skein-core: peer names, wire format, crypto, Ethernet handling and
//! configuration. Every other skein crate depends on this one.

pub mod config;
pub mod crypto;
pub mod ethernet;
pub mod name;
pub mod wire;

pub use config::SkeinConfig;
pub use name::{PeerName, PeerUid, UNKNOWN_PEER_NAME};
