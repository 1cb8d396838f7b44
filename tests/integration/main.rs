//! Skein integration test harness.
//!
//! Tests in this crate drive the control plane of several routers inside
//! one process. Each simulated router has its own peer table and routes
//! task; links between them are in-memory and topology only spreads
//! through real encoded updates, so convergence is exercised end to end
//! without sockets.
//!
//!   cargo test --test integration

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use skein_core::name::{PeerName, PeerUid};
use skein_mesh::{LocalLink, Peers, PeersError, Routes};

mod discovery;
mod flooding;
mod topology;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const PORT: u16 = 6783;

/// Gossip rounds after which a mesh that still changes is considered stuck.
pub const MAX_ROUNDS: usize = 64;

pub fn name(n: u8) -> PeerName {
    PeerName::from_mac([0x02, 0, 0, 0, 0, n])
}

pub fn uid(n: u8) -> PeerUid {
    u64::from(n) * 100 + 7
}

/// The address router `n` listens on.
pub fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], PORT))
}

/// One end of an in-memory link.
pub struct SimLink {
    remote: PeerName,
    addr: SocketAddr,
    outbound: bool,
    uid: u64,
    established: AtomicBool,
    shutdown: Mutex<Option<String>>,
}

impl SimLink {
    pub fn new(remote: PeerName, addr: SocketAddr, outbound: bool, uid: u64) -> Self {
        Self {
            remote,
            addr,
            outbound,
            uid,
            established: AtomicBool::new(false),
            shutdown: Mutex::new(None),
        }
    }

    pub fn set_established(&self, established: bool) {
        self.established.store(established, Ordering::SeqCst);
    }

    pub fn shutdown_reason(&self) -> Option<String> {
        self.shutdown.lock().unwrap().clone()
    }
}

impl LocalLink for SimLink {
    fn remote_name(&self) -> PeerName {
        self.remote
    }

    fn remote_tcp_addr(&self) -> SocketAddr {
        self.addr
    }

    fn outbound(&self) -> bool {
        self.outbound
    }

    fn established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    fn uid(&self) -> u64 {
        self.uid
    }

    fn shutdown(&self, reason: &str) {
        *self.shutdown.lock().unwrap() = Some(reason.to_string());
    }
}

pub struct Router {
    pub id: u8,
    pub peers: Arc<Peers<SimLink>>,
    pub routes: Routes<SimLink>,
}

impl Router {
    fn new(id: u8) -> Self {
        let peers = Arc::new(Peers::new(name(id), uid(id)));
        let routes = Routes::start(peers.clone(), tracing::info_span!("routes", router = id));
        Self { id, peers, routes }
    }

    pub fn name(&self) -> PeerName {
        name(self.id)
    }

    pub fn neighbours(&self) -> BTreeSet<PeerName> {
        self.peers
            .local_connections()
            .iter()
            .map(|l| l.remote_name())
            .collect()
    }
}

/// A set of simulated routers.
pub struct Mesh {
    pub routers: BTreeMap<PeerName, Router>,
    next_conn_uid: Mutex<u64>,
}

impl Mesh {
    /// Routers `1..=n`, not yet connected. Must be built inside a runtime.
    pub fn new(n: u8) -> Self {
        let routers = (1..=n).map(|i| (name(i), Router::new(i))).collect();
        Self {
            routers,
            next_conn_uid: Mutex::new(1),
        }
    }

    pub fn router(&self, n: u8) -> &Router {
        &self.routers[&name(n)]
    }

    /// Link `a` to `b`, `a` dialling. Both ends are established at once.
    pub fn connect(&self, a: u8, b: u8) {
        let conn_uid = {
            let mut next = self.next_conn_uid.lock().unwrap();
            *next += 1;
            *next
        };
        let ends = [
            (a, b, addr(b), true),
            (b, a, SocketAddr::from(([10, 0, 0, a], 40000 + u16::from(b))), false),
        ];
        for (at, remote, remote_addr, outbound) in ends {
            let router = self.router(at);
            router.peers.fetch_with_default(name(remote), uid(remote)).unwrap();
            let link = Arc::new(SimLink::new(name(remote), remote_addr, outbound, conn_uid));
            link.set_established(true);
            router.peers.add_local_connection(link, 0).unwrap();
            assert!(router.peers.connection_established(name(remote), conn_uid));
        }
    }

    /// Tear down the link between `a` and `b` at both ends.
    pub fn disconnect(&self, a: u8, b: u8) {
        for (at, remote) in [(a, b), (b, a)] {
            let router = self.router(at);
            let link = router.peers.local_connection(name(remote)).unwrap();
            assert!(router.peers.delete_local_connection(name(remote), link.uid()));
            router.peers.dereference(name(remote));
            router.peers.garbage_collect();
        }
    }

    /// Exchange full tables between neighbours until nothing changes.
    /// Returns the number of rounds that changed something.
    pub fn gossip(&self) -> usize {
        for round in 0..MAX_ROUNDS {
            let mut changed = false;
            for router in self.routers.values() {
                let update = router.peers.encode_all().unwrap();
                for neighbour in router.neighbours() {
                    match self.routers[&neighbour].peers.apply_update(&update) {
                        Ok(outcome) => changed |= !outcome.is_unchanged(),
                        Err(PeersError::UnknownPeer(_)) => {}
                        Err(e) => panic!("update from {} rejected: {e}", router.name()),
                    }
                }
            }
            if !changed {
                return round;
            }
        }
        panic!("mesh did not converge in {MAX_ROUNDS} rounds");
    }

    /// Gossip to a fixed point, then bring every routing table up to date.
    pub async fn settle(&self) {
        self.gossip();
        for router in self.routers.values() {
            router.routes.recalculate();
            router.routes.ensure_recalculated().await;
        }
    }
}
