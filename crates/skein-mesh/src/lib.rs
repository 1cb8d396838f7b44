//! skein-mesh: the control plane shared by every skein router: the peer
//! table, route computation over it, and the connection maker that keeps
//! us connected to the peers we should be talking to.

pub mod connection_maker;
pub mod peer;
pub mod peers;
pub mod routes;

pub use connection_maker::{
    AddrError, AdvertisedTargets, AttemptError, Backoff, ConnectionMaker, ConnectionMakerSettings,
    Dialer,
};
pub use peer::{Connection, LocalLink, Peer, PeerSummary, RemoteConnection};
pub use peers::{PeerTable, Peers, PeersError, UpdateOutcome};
pub use routes::Routes;

#[cfg(test)]
pub(crate) mod testing {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use skein_core::name::PeerName;

    use crate::peer::LocalLink;

    pub fn name(n: u8) -> PeerName {
        PeerName::from_mac([0x02, 0, 0, 0, 0, n])
    }

    pub struct TestLink {
        remote: PeerName,
        addr: SocketAddr,
        uid: u64,
        established: AtomicBool,
        shutdown: Mutex<Option<String>>,
    }

    impl TestLink {
        pub fn new(remote: PeerName, uid: u64) -> Arc<Self> {
            let last = remote.to_bytes()[5];
            Arc::new(Self {
                remote,
                addr: SocketAddr::from(([10, 0, 0, last], 6783)),
                uid,
                established: AtomicBool::new(false),
                shutdown: Mutex::new(None),
            })
        }

        pub fn set_established(&self, established: bool) {
            self.established.store(established, Ordering::SeqCst);
        }

        pub fn shutdown_reason(&self) -> Option<String> {
            self.shutdown.lock().unwrap().clone()
        }
    }

    impl LocalLink for TestLink {
        fn remote_name(&self) -> PeerName {
            self.remote
        }

        fn remote_tcp_addr(&self) -> SocketAddr {
            self.addr
        }

        fn outbound(&self) -> bool {
            true
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
}
