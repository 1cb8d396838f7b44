//! The peer table: every peer we know about and how they connect.
//!
//! `Peers` wraps a `PeerTable` in a read-write lock. Route computation and
//! gossip encoding take the read side; connection changes and topology
//! updates take the write side. No lock is held while calling back into a
//! `LocalLink`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use skein_core::name::{PeerName, PeerUid, UNKNOWN_PEER_NAME};

use crate::connection_maker::AdvertisedTargets;
use crate::peer::{Connection, LocalLink, Peer, PeerSummary};

// ── Table ─────────────────────────────────────────────────────────────────────

pub struct PeerTable<L> {
    ourself: PeerName,
    by_name: BTreeMap<PeerName, Peer<L>>,
}

impl<L: LocalLink> PeerTable<L> {
    fn new(ourself: PeerName, uid: PeerUid) -> Self {
        let mut peer = Peer::new(ourself, uid);
        peer.version = 1;
        peer.local_refs = 1;
        let mut by_name = BTreeMap::new();
        by_name.insert(ourself, peer);
        Self { ourself, by_name }
    }

    pub fn ourself(&self) -> PeerName {
        self.ourself
    }

    pub fn get(&self, name: &PeerName) -> Option<&Peer<L>> {
        self.by_name.get(name)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer<L>> {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, peer: Peer<L>) {
        self.by_name.insert(peer.name, peer);
    }

    fn ourself_mut(&mut self) -> &mut Peer<L> {
        let ourself = self.ourself;
        self.by_name
            .entry(ourself)
            .or_insert_with(|| Peer::new(ourself, 0))
    }

    /// Breadth-first widening from `start`, returning whether `stop_at` was
    /// reached and the next hop from `start` for every peer reached.
    ///
    /// Each level is visited in name order so every peer computing over the
    /// same graph gets the same answer. `start` maps to `UNKNOWN_PEER_NAME`;
    /// its neighbours map to themselves; everyone else inherits the hop of
    /// the peer they were first reached through.
    pub fn routes(
        &self,
        start: PeerName,
        stop_at: Option<PeerName>,
        established_and_symmetric: bool,
    ) -> (bool, BTreeMap<PeerName, PeerName>) {
        let mut routes = BTreeMap::new();
        if !self.by_name.contains_key(&start) {
            return (false, routes);
        }
        routes.insert(start, UNKNOWN_PEER_NAME);
        let mut next = vec![start];
        while !next.is_empty() {
            let mut worklist = std::mem::take(&mut next);
            worklist.sort();
            for cur_name in worklist {
                if stop_at == Some(cur_name) {
                    return (true, routes);
                }
                let Some(cur) = self.by_name.get(&cur_name) else {
                    continue;
                };
                for remote_name in cur.connections.keys() {
                    if routes.contains_key(remote_name) {
                        continue;
                    }
                    let Some(remote) = self.by_name.get(remote_name) else {
                        continue;
                    };
                    if !cur.has_edge_to(remote, established_and_symmetric) {
                        continue;
                    }
                    let hop = if cur_name == start {
                        *remote_name
                    } else {
                        routes.get(&cur_name).copied().unwrap_or(*remote_name)
                    };
                    routes.insert(*remote_name, hop);
                    next.push(*remote_name);
                }
            }
        }
        (false, routes)
    }

    /// Neighbours of `at` that a broadcast from `origin` should be passed
    /// on to, in name order. Empty when `at` is not reachable from `origin`.
    pub fn broadcast_hops_at(
        &self,
        at: PeerName,
        origin: PeerName,
        established_and_symmetric: bool,
    ) -> Vec<PeerName> {
        let (found, reached) = self.routes(origin, Some(at), established_and_symmetric);
        if !found {
            return Vec::new();
        }
        let Some(at_peer) = self.by_name.get(&at) else {
            return Vec::new();
        };
        at_peer
            .connections
            .keys()
            .filter(|name| !reached.contains_key(name))
            .filter(|name| {
                self.by_name
                    .get(name)
                    .is_some_and(|remote| at_peer.has_edge_to(remote, established_and_symmetric))
            })
            .copied()
            .collect()
    }

    pub fn broadcast_hops(&self, origin: PeerName, established_and_symmetric: bool) -> Vec<PeerName> {
        self.broadcast_hops_at(self.ourself, origin, established_and_symmetric)
    }

    /// Drop peers that are neither reachable from ourself over any
    /// connection nor locally referenced.
    fn garbage_collect(&mut self) -> Vec<PeerName> {
        let (_, reached) = self.routes(self.ourself, None, false);
        let removed: Vec<PeerName> = self
            .by_name
            .values()
            .filter(|p| !reached.contains_key(&p.name) && !p.is_locally_referenced())
            .map(|p| p.name)
            .collect();
        for name in &removed {
            self.by_name.remove(name);
        }
        removed
    }
}

// ── Shared handle ─────────────────────────────────────────────────────────────

/// Result of merging a topology update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Every peer named in the update.
    pub names: Vec<PeerName>,
    /// Peers that were new or newer; relay these to other neighbours.
    pub changed: Vec<PeerName>,
    /// Peers we know a newer version of than the sender does.
    pub newer_here: Vec<PeerName>,
    /// Peers garbage-collected after applying the update.
    pub removed: Vec<PeerName>,
    /// Our own version was bumped past a stale incarnation of us.
    pub ourself_modified: bool,
}

impl UpdateOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.changed.is_empty() && !self.ourself_modified
    }
}

pub struct Peers<L> {
    ourself: PeerName,
    table: RwLock<PeerTable<L>>,
}

impl<L: LocalLink> Peers<L> {
    pub fn new(ourself: PeerName, uid: PeerUid) -> Self {
        Self {
            ourself,
            table: RwLock::new(PeerTable::new(ourself, uid)),
        }
    }

    pub fn ourself(&self) -> PeerName {
        self.ourself
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PeerTable<L>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PeerTable<L>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ourself_uid(&self) -> PeerUid {
        self.read().get(&self.ourself).map(|p| p.uid).unwrap_or_default()
    }

    pub fn ourself_version(&self) -> u64 {
        self.read().get(&self.ourself).map(|p| p.version).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<PeerName> {
        self.read().by_name.keys().copied().collect()
    }

    /// Take a local reference on `name`, inserting it if unknown. Fails if
    /// a peer by that name exists with a different uid.
    pub fn fetch_with_default(&self, name: PeerName, uid: PeerUid) -> Result<(), PeersError> {
        let mut table = self.write();
        match table.by_name.get_mut(&name) {
            Some(existing) if existing.uid != uid => Err(PeersError::NameCollision(name)),
            Some(existing) => {
                existing.local_refs += 1;
                Ok(())
            }
            None => {
                let mut peer = Peer::new(name, uid);
                peer.local_refs = 1;
                table.by_name.insert(name, peer);
                Ok(())
            }
        }
    }

    pub fn dereference(&self, name: PeerName) {
        if let Some(peer) = self.write().by_name.get_mut(&name) {
            peer.local_refs = peer.local_refs.saturating_sub(1);
        }
    }

    /// Add a live connection from ourself.
    ///
    /// When a connection to the same peer already exists, an established
    /// one always wins; otherwise the lower connection uid wins, and equal
    /// uids kill both. Both ends see the same uid so they make the same
    /// choice. Losing links are shut down after the table lock is released.
    pub fn add_local_connection(&self, link: Arc<L>, limit: usize) -> Result<(), PeersError> {
        let remote = link.remote_name();
        let mut losers = Vec::new();
        let result = {
            let mut table = self.write();
            let ourself = table.ourself_mut();
            let verdict = match ourself.connections.get(&remote) {
                Some(Connection::Local(existing)) if Arc::ptr_eq(existing, &link) => return Ok(()),
                Some(Connection::Local(existing)) if existing.established() => {
                    Err(PeersError::DuplicateConnection(remote))
                }
                Some(Connection::Local(existing)) if existing.uid() == link.uid() => {
                    losers.push(existing.clone());
                    ourself.connections.remove(&remote);
                    ourself.version += 1;
                    Err(PeersError::DuplicateConnection(remote))
                }
                Some(Connection::Local(existing)) if link.uid() < existing.uid() => {
                    losers.push(existing.clone());
                    ourself.connections.remove(&remote);
                    Ok(())
                }
                Some(Connection::Local(_)) => Err(PeersError::DuplicateConnection(remote)),
                Some(Connection::Remote(_)) | None => Ok(()),
            };
            verdict.and_then(|()| {
                if limit > 0 && ourself.connections.len() >= limit {
                    return Err(PeersError::TooManyConnections(limit));
                }
                ourself.connections.insert(remote, Connection::Local(link));
                ourself.version += 1;
                Ok(())
            })
        };
        for loser in losers {
            tracing::info!(peer = %remote, uid = loser.uid(), "dropping duplicate connection");
            loser.shutdown("duplicate connection");
        }
        result
    }

    /// Remove our connection to `name` if it is still the one with `uid`.
    /// Returns whether anything was removed.
    pub fn delete_local_connection(&self, name: PeerName, uid: u64) -> bool {
        let mut table = self.write();
        let ourself = table.ourself_mut();
        let matches = ourself
            .connections
            .get(&name)
            .and_then(Connection::as_local)
            .is_some_and(|link| link.uid() == uid);
        if matches {
            ourself.connections.remove(&name);
            ourself.version += 1;
        }
        matches
    }

    /// Record that our connection to `name` became established.
    pub fn connection_established(&self, name: PeerName, uid: u64) -> bool {
        let mut table = self.write();
        let ourself = table.ourself_mut();
        let matches = ourself
            .connections
            .get(&name)
            .and_then(Connection::as_local)
            .is_some_and(|link| link.uid() == uid);
        if matches {
            ourself.version += 1;
        }
        matches
    }

    pub fn local_connection(&self, name: PeerName) -> Option<Arc<L>> {
        self.read()
            .get(&self.ourself)
            .and_then(|p| p.connections.get(&name))
            .and_then(Connection::as_local)
            .cloned()
    }

    pub fn local_connections(&self) -> Vec<Arc<L>> {
        self.read()
            .get(&self.ourself)
            .map(|p| {
                p.connections
                    .values()
                    .filter_map(Connection::as_local)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.read()
            .get(&self.ourself)
            .map(|p| p.connections.len())
            .unwrap_or_default()
    }

    /// Merge a JSON topology update into the table.
    ///
    /// The update is validated in full before anything is applied: a name
    /// collision or a reference to a peer we cannot place rejects it.
    pub fn apply_update(&self, update: &[u8]) -> Result<UpdateOutcome, PeersError> {
        let summaries: Vec<PeerSummary> = serde_json::from_slice(update)?;
        let mut table = self.write();

        let in_update: BTreeSet<PeerName> = summaries.iter().map(|s| s.name).collect();
        for summary in &summaries {
            if let Some(existing) = table.by_name.get(&summary.name) {
                if existing.uid != summary.uid && summary.name != self.ourself {
                    return Err(PeersError::NameCollision(summary.name));
                }
            }
            for conn in &summary.connections {
                if !in_update.contains(&conn.name) && !table.by_name.contains_key(&conn.name) {
                    return Err(PeersError::UnknownPeer(conn.name));
                }
            }
        }

        let mut outcome = UpdateOutcome {
            names: in_update.iter().copied().collect(),
            ..UpdateOutcome::default()
        };
        let mut changed = BTreeSet::new();
        for summary in summaries {
            let name = summary.name;
            if name == self.ourself {
                let ours = table.ourself_mut();
                if summary.uid != ours.uid && summary.version >= ours.version {
                    ours.version = summary.version + 1;
                    outcome.ourself_modified = true;
                } else if summary.version < ours.version {
                    outcome.newer_here.push(name);
                }
                continue;
            }
            let connections = summary
                .connections
                .into_iter()
                .map(|c| (c.name, Connection::Remote(c.into_remote())))
                .collect();
            match table.by_name.get_mut(&name) {
                None => {
                    let mut peer = Peer::new(name, summary.uid);
                    peer.version = summary.version;
                    peer.connections = connections;
                    table.by_name.insert(name, peer);
                    changed.insert(name);
                }
                Some(peer) if summary.version > peer.version => {
                    peer.version = summary.version;
                    peer.connections = connections;
                    changed.insert(name);
                }
                Some(peer) if summary.version < peer.version => outcome.newer_here.push(name),
                Some(_) => {}
            }
        }

        outcome.removed = table.garbage_collect();
        for name in &outcome.removed {
            changed.remove(name);
        }
        outcome.newer_here.retain(|n| !outcome.removed.contains(n));
        outcome.changed = changed.into_iter().collect();
        Ok(outcome)
    }

    /// JSON update describing the given peers. Unknown names are skipped.
    pub fn encode_peers(&self, names: &[PeerName]) -> Result<Vec<u8>, PeersError> {
        let table = self.read();
        let summaries: Vec<PeerSummary> = names
            .iter()
            .filter_map(|n| table.get(n))
            .map(Peer::summary)
            .collect();
        Ok(serde_json::to_vec(&summaries)?)
    }

    pub fn encode_all(&self) -> Result<Vec<u8>, PeersError> {
        let table = self.read();
        let summaries: Vec<PeerSummary> = table.peers().map(Peer::summary).collect();
        Ok(serde_json::to_vec(&summaries)?)
    }

    pub fn garbage_collect(&self) -> Vec<PeerName> {
        let removed = self.write().garbage_collect();
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "garbage collected peers");
        }
        removed
    }

    /// Text dump of every peer and its connections.
    pub fn status(&self) -> String {
        let table = self.read();
        let mut out = String::new();
        for peer in table.peers() {
            let _ = writeln!(out, "{}", peer.info());
            for conn in peer.connections.values() {
                let established = if conn.established() { "" } else { " (unestablished)" };
                let _ = writeln!(
                    out,
                    "   -> {} [{}{}]",
                    conn.remote(),
                    conn.remote_tcp_addr(),
                    established
                );
            }
        }
        out
    }
}

impl<L: LocalLink> AdvertisedTargets for Peers<L> {
    /// Addresses other peers use to reach peers we are not connected to.
    /// Inbound connections advertise an ephemeral port, so those are
    /// rewritten to `port`.
    fn advertised_targets(&self, connected: &BTreeSet<PeerName>, port: u16) -> Vec<SocketAddr> {
        let table = self.read();
        let mut targets = Vec::new();
        for peer in table.peers().filter(|p| p.name != self.ourself) {
            for (other, conn) in &peer.connections {
                if *other == self.ourself || connected.contains(other) {
                    continue;
                }
                let mut addr = conn.remote_tcp_addr();
                if !conn.outbound() {
                    addr.set_port(port);
                }
                targets.push(addr);
            }
        }
        targets
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PeersError {
    #[error("peer name collision: {0} is already known with a different uid")]
    NameCollision(PeerName),

    #[error("multiple connections to {0}")]
    DuplicateConnection(PeerName),

    #[error("connection limit reached ({0})")]
    TooManyConnections(usize),

    #[error("update references unknown peer {0}")]
    UnknownPeer(PeerName),

    #[error("malformed topology update: {0}")]
    Codec(#[from] serde_json::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
