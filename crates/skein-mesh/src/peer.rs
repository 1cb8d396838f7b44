//! Peers and the connections between them.
//!
//! A `Peer` is everything we know about one router in the mesh: its
//! identity, a version that increases whenever its connection set changes,
//! and the connections it has to other peers. Connections from ourself are
//! live links owned by the daemon; everyone else's are remote summaries
//! learned from topology gossip.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use skein_core::name::{PeerName, PeerUid};

/// A live connection from ourself to a neighbour.
///
/// Implemented by the daemon's connection actor. The peer table only needs
/// to observe the link and ask it to close.
pub trait LocalLink: Send + Sync + 'static {
    fn remote_name(&self) -> PeerName;
    fn remote_tcp_addr(&self) -> SocketAddr;
    fn outbound(&self) -> bool;
    fn established(&self) -> bool;

    /// Connection uid, shared by both ends of the link.
    fn uid(&self) -> u64;

    /// Ask the connection to close. Must not block.
    fn shutdown(&self, reason: &str);
}

/// A connection between two other peers, as last advertised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConnection {
    pub remote: PeerName,
    pub remote_tcp_addr: SocketAddr,
    pub outbound: bool,
    pub established: bool,
}

pub enum Connection<L> {
    Local(Arc<L>),
    Remote(RemoteConnection),
}

impl<L> Clone for Connection<L> {
    fn clone(&self) -> Self {
        match self {
            Connection::Local(link) => Connection::Local(link.clone()),
            Connection::Remote(remote) => Connection::Remote(remote.clone()),
        }
    }
}

impl<L: LocalLink> Connection<L> {
    pub fn remote(&self) -> PeerName {
        match self {
            Connection::Local(link) => link.remote_name(),
            Connection::Remote(r) => r.remote,
        }
    }

    pub fn remote_tcp_addr(&self) -> SocketAddr {
        match self {
            Connection::Local(link) => link.remote_tcp_addr(),
            Connection::Remote(r) => r.remote_tcp_addr,
        }
    }

    pub fn outbound(&self) -> bool {
        match self {
            Connection::Local(link) => link.outbound(),
            Connection::Remote(r) => r.outbound,
        }
    }

    pub fn established(&self) -> bool {
        match self {
            Connection::Local(link) => link.established(),
            Connection::Remote(r) => r.established,
        }
    }

    pub fn as_local(&self) -> Option<&Arc<L>> {
        match self {
            Connection::Local(link) => Some(link),
            Connection::Remote(_) => None,
        }
    }

    fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            name: self.remote(),
            tcp_addr: self.remote_tcp_addr(),
            outbound: self.outbound(),
            established: self.established(),
        }
    }
}

impl<L: LocalLink> fmt::Debug for Connection<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Connection::Local(_) => "local",
            Connection::Remote(_) => "remote",
        };
        f.debug_struct("Connection")
            .field("kind", &kind)
            .field("remote", &self.remote())
            .field("addr", &self.remote_tcp_addr())
            .field("established", &self.established())
            .finish()
    }
}

pub struct Peer<L> {
    pub name: PeerName,
    pub uid: PeerUid,
    pub version: u64,
    pub connections: BTreeMap<PeerName, Connection<L>>,
    pub(crate) local_refs: usize,
}

impl<L: LocalLink> Peer<L> {
    pub fn new(name: PeerName, uid: PeerUid) -> Self {
        Self {
            name,
            uid,
            version: 0,
            connections: BTreeMap::new(),
            local_refs: 0,
        }
    }

    pub fn is_locally_referenced(&self) -> bool {
        self.local_refs > 0
    }

    /// Edge to `remote` usable for routing. The established variant also
    /// requires the remote side to report an established connection back.
    pub(crate) fn has_edge_to(&self, remote: &Peer<L>, established_and_symmetric: bool) -> bool {
        let Some(conn) = self.connections.get(&remote.name) else {
            return false;
        };
        if !established_and_symmetric {
            return true;
        }
        conn.established()
            && remote
                .connections
                .get(&self.name)
                .is_some_and(|back| back.established())
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            name: self.name,
            uid: self.uid,
            version: self.version,
            connections: self.connections.values().map(Connection::summary).collect(),
        }
    }

    /// One-line description for status output.
    pub fn info(&self) -> String {
        format!("{} (v{}) (UID {})", self.name, self.version, self.uid)
    }
}

impl<L: LocalLink> fmt::Debug for Peer<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("uid", &self.uid)
            .field("version", &self.version)
            .field("connections", &self.connections)
            .finish()
    }
}

// ── Gossip summaries ──────────────────────────────────────────────────────────

/// How a peer is described in a topology update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub name: PeerName,
    pub uid: PeerUid,
    pub version: u64,
    pub connections: Vec<ConnectionSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub name: PeerName,
    pub tcp_addr: SocketAddr,
    pub outbound: bool,
    pub established: bool,
}

impl ConnectionSummary {
    pub(crate) fn into_remote(self) -> RemoteConnection {
        RemoteConnection {
            remote: self.name,
            remote_tcp_addr: self.tcp_addr,
            outbound: self.outbound,
            established: self.established,
        }
    }
}
