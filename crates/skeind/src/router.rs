//! The router ties the mesh together: it owns the peer table, routes,
//! MAC cache and connection maker, accepts connections, and moves frames
//! between the capture interface and peer connections.
//!
//! Capture and UDP receive run on dedicated OS threads. They call into
//! the blocking halves of the routes and forwarder APIs, so frames are
//! backpressured by full forwarder channels rather than dropped.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context};
use futures::future::{BoxFuture, FutureExt};
use skein_core::config::SkeinConfig;
use skein_core::ethernet::{format_mac, frag_needed, DecodedFrame};
use skein_core::name::{PeerName, NAME_SIZE};
use skein_core::wire::{
    frames, heartbeat_uid, is_frag_test, is_pmtu_discovery, FrameRef, ProtocolTag,
    ETHERNET_OVERHEAD, GOSSIP_INTERVAL, HANDSHAKE_TIMEOUT, MAX_UDP_PACKET_SIZE,
};
use skein_mesh::{
    AttemptError, Backoff, ConnectionMaker, ConnectionMakerSettings, Dialer, Peers, Routes,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::capture::{Injector, PacketSource};
use crate::connection::{self, Identity, LocalConnection};
use crate::forwarder::ForwardError;
use crate::mac_cache::MacCache;

pub struct Router {
    identity: Identity,
    pub config: SkeinConfig,
    pub peers: Arc<Peers<LocalConnection>>,
    pub routes: Routes<LocalConnection>,
    pub macs: MacCache,
    pub cm: ConnectionMaker,
    udp: Arc<UdpSocket>,
    injector: Arc<dyn Injector>,
    shutdown: broadcast::Sender<()>,
    stopping: AtomicBool,
}

/// Dials outbound connections for the connection maker. The returned
/// future lives as long as the connection does.
struct RouterDialer {
    router: Weak<Router>,
}

impl Dialer for RouterDialer {
    fn dial(&self, addr: SocketAddr, direct: bool) -> BoxFuture<'static, Result<(), AttemptError>> {
        let router = self.router.clone();
        async move {
            let router = router
                .upgrade()
                .ok_or_else(|| anyhow!("router stopped"))?;
            tracing::debug!(%addr, direct, "dialling");
            let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| anyhow!("connect to {addr} timed out"))?
                .with_context(|| format!("connect to {addr}"))?;
            connection::run(router, stream, addr, true)
                .await
                .map_err(AttemptError::from)
        }
        .boxed()
    }
}

impl Router {
    /// Build the router and start its routes and connection maker tasks.
    /// `udp` is the shared data-plane socket; it should have a read
    /// timeout so the receive thread notices shutdown.
    pub fn new(
        identity: Identity,
        config: SkeinConfig,
        udp: Arc<UdpSocket>,
        injector: Arc<dyn Injector>,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let peers = Arc::new(Peers::new(identity.name, identity.uid));
        let routes = Routes::start(peers.clone(), tracing::info_span!("routes"));
        let macs = MacCache::new(config.router.mac_max_age());
        Arc::new_cyclic(|weak| {
            let settings = ConnectionMakerSettings {
                port: config.router.port,
                discovery: config.router.peer_discovery,
                backoff: Backoff {
                    initial: config.connection_maker.initial_interval(),
                    max: config.connection_maker.max_interval(),
                },
            };
            let cm = ConnectionMaker::start(
                settings,
                Arc::new(RouterDialer {
                    router: weak.clone(),
                }),
                peers.clone(),
                shutdown.subscribe(),
                tracing::info_span!("connection_maker"),
            );
            Self {
                identity,
                config,
                peers,
                routes,
                macs,
                cm,
                udp,
                injector,
                shutdown,
                stopping: AtomicBool::new(false),
            }
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn ourself(&self) -> PeerName {
        self.identity.name
    }

    pub fn udp_socket(&self) -> Arc<UdpSocket> {
        self.udp.clone()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Stop the data-plane threads and every task listening for shutdown.
    pub fn stop(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.send(());
        }
    }

    // ── Gossip ────────────────────────────────────────────────────────────────

    /// Send the summaries of `names` to every connection except the one
    /// to `except`.
    pub fn relay_update(&self, names: &[PeerName], except: Option<PeerName>) {
        let payload = match self.peers.encode_peers(names) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode topology update");
                return;
            }
        };
        for conn in self.peers.local_connections() {
            if Some(conn.remote()) != except {
                conn.send_control(ProtocolTag::Update, payload.clone());
            }
        }
    }

    /// Tell every neighbour about our own, changed, connection set.
    pub fn gossip_ourself(&self) {
        self.relay_update(&[self.ourself()], None);
    }

    /// Periodically push the whole table to a few random neighbours so
    /// that lost updates eventually heal.
    pub async fn gossip_loop(self: Arc<Self>) {
        let mut shutdown = self.subscribe_shutdown();
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {}
            }
            let neighbours = self.routes.random_neighbours(self.ourself());
            if neighbours.is_empty() {
                continue;
            }
            let payload = match self.peers.encode_all() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "could not encode topology");
                    continue;
                }
            };
            tracing::debug!(neighbours = neighbours.len(), "periodic gossip");
            for name in neighbours {
                if let Some(conn) = self.peers.local_connection(name) {
                    conn.send_control(ProtocolTag::Update, payload.clone());
                }
            }
        }
    }

    pub async fn mac_expiry_loop(self: Arc<Self>) {
        let mut shutdown = self.subscribe_shutdown();
        let period = (self.config.router.mac_max_age() / 2).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {}
            }
            for (mac, peer) in self.macs.expire(std::time::Instant::now()) {
                tracing::debug!(mac = format_mac(&mac), %peer, "expired MAC");
            }
        }
    }

    // ── TCP ───────────────────────────────────────────────────────────────────

    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.subscribe_shutdown();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => return,
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            tracing::info!(%addr, "inbound connection");
            let router = self.clone();
            tokio::spawn(async move {
                let _ = connection::run(router, stream, addr, false).await;
            });
        }
    }

    // ── Data plane ────────────────────────────────────────────────────────────

    /// Receive UDP packets until the router stops. Runs on its own thread.
    pub fn udp_listener(&self) {
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        while !self.is_stopping() {
            match self.udp.recv_from(&mut buf) {
                Ok((n, from)) => self.handle_udp_packet(&buf[..n], from),
                Err(e) if is_poll_timeout(&e) => {}
                Err(e) => tracing::debug!(error = %e, "udp receive failed"),
            }
        }
    }

    /// Read captured frames until the router stops. Runs on its own
    /// thread. A capture failure stops the router.
    pub fn capture_loop(&self, source: &dyn PacketSource) {
        while !self.is_stopping() {
            match source.read_packet() {
                Ok(frame) => self.handle_captured_frame(&frame),
                Err(e) if is_poll_timeout(&e) => {}
                Err(e) => {
                    tracing::error!(error = %e, "capture failed");
                    self.stop();
                }
            }
        }
    }

    pub fn handle_captured_frame(&self, frame: &[u8]) {
        let Ok(dec) = DecodedFrame::decode(frame) else {
            return;
        };
        let ourself = self.ourself();
        if self.macs.lookup(&dec.src_mac).is_some_and(|peer| peer != ourself) {
            // We injected this one.
            return;
        }
        if self.macs.enter(dec.src_mac, ourself) {
            tracing::info!(mac = format_mac(&dec.src_mac), "discovered local MAC");
        }
        if dec.drop_frame() {
            return;
        }
        let dst = self.macs.lookup(&dec.dst_mac);
        if dst == Some(ourself) {
            return;
        }
        let df = dec.dont_fragment();
        tracing::trace!(
            src = format_mac(&dec.src_mac),
            dst = format_mac(&dec.dst_mac),
            len = frame.len(),
            df,
            "captured"
        );
        let result = match dst {
            Some(dst) if !dec.is_broadcast() => self.relay(ourself, dst, df, frame, Some(&dec)),
            _ => self.relay_broadcast(ourself, df, frame, Some(&dec)),
        };
        match result {
            Ok(()) => {}
            Err(ForwardError::FrameTooBig { effective_pmtu }) => {
                match frag_needed(frame, effective_pmtu) {
                    Ok(icmp) => {
                        tracing::debug!(effective_pmtu, "frame too big, sending ICMP locally");
                        if let Err(e) = self.injector.write_packet(&icmp) {
                            tracing::warn!(error = %e, "inject failed");
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "cannot build ICMP reply"),
                }
            }
            Err(e) => tracing::debug!(error = %e, "forward failed"),
        }
    }

    pub fn handle_udp_packet(&self, packet: &[u8], from: SocketAddr) {
        if packet.len() < NAME_SIZE {
            tracing::debug!(%from, len = packet.len(), "runt packet");
            return;
        }
        let (sender, payload) = packet.split_at(NAME_SIZE);
        let Ok(sender) = PeerName::from_bytes(sender) else {
            return;
        };
        let Some(conn) = self.peers.local_connection(sender) else {
            tracing::debug!(%from, peer = %sender, "packet from peer we are not connected to");
            return;
        };
        let plain = match conn.decryptor().decrypt(payload) {
            Ok(plain) => plain,
            Err(e) => {
                tracing::debug!(%from, peer = %sender, error = %e, "cannot decrypt packet");
                return;
            }
        };
        for frame in frames(&plain) {
            match frame {
                Ok(frame) => self.handle_frame(&conn, from, frame),
                Err(e) => {
                    tracing::debug!(%from, peer = %sender, error = %e, "malformed packet");
                    break;
                }
            }
        }
    }

    fn handle_frame(&self, conn: &LocalConnection, from: SocketAddr, f: FrameRef<'_>) {
        let known = {
            let table = self.peers.read();
            table.get(&f.src).is_some() && table.get(&f.dst).is_some()
        };
        if !known {
            tracing::trace!(src = %f.src, dst = %f.dst, "frame between unknown peers");
            return;
        }
        let ourself = self.ourself();

        if f.dst != ourself {
            let Ok(dec) = DecodedFrame::decode(f.frame) else {
                return;
            };
            if self.macs.enter(dec.src_mac, f.src) {
                tracing::info!(mac = format_mac(&dec.src_mac), peer = %f.src, "discovered remote MAC");
            }
            let result = self.relay(f.src, f.dst, dec.dont_fragment(), f.frame, Some(&dec));
            self.frame_too_big_to_peer(result, f.src, f.frame);
            return;
        }

        let from_neighbour = conn.remote() == f.src;
        if let Some(uid) = heartbeat_uid(f.frame) {
            if from_neighbour && uid == skein_mesh::LocalLink::uid(conn) {
                conn.heartbeat_received(from);
            }
            return;
        }
        if is_frag_test(f.frame) {
            if from_neighbour {
                conn.send_control(ProtocolTag::FragmentationReceived, Vec::new());
            }
            return;
        }
        if is_pmtu_discovery(f.frame) {
            return;
        }

        let Ok(dec) = DecodedFrame::decode(f.frame) else {
            return;
        };
        if dec.is_pmtu_verify() {
            if from_neighbour {
                let len = u16::try_from(f.frame.len() - ETHERNET_OVERHEAD).unwrap_or(u16::MAX);
                conn.send_control(ProtocolTag::PmtuVerified, len.to_be_bytes().to_vec());
            }
            return;
        }

        if self.macs.enter(dec.src_mac, f.src) {
            tracing::info!(mac = format_mac(&dec.src_mac), peer = %f.src, "discovered remote MAC");
        }
        tracing::trace!(src = %f.src, len = f.frame.len(), "injecting");
        if let Err(e) = self.injector.write_packet(f.frame) {
            tracing::warn!(error = %e, "inject failed");
        }

        if dec.is_broadcast() || self.macs.lookup(&dec.dst_mac) != Some(ourself) {
            let result = self.relay_broadcast(f.src, dec.dont_fragment(), f.frame, Some(&dec));
            self.frame_too_big_to_peer(result, f.src, f.frame);
        }
    }

    /// A relayed frame was too big for the next hop: tell its sender
    /// with an ICMP message routed back through the mesh.
    fn frame_too_big_to_peer(&self, result: Result<(), ForwardError>, src: PeerName, frame: &[u8]) {
        match result {
            Ok(()) => {}
            Err(ForwardError::FrameTooBig { effective_pmtu }) => {
                let icmp = match frag_needed(frame, effective_pmtu) {
                    Ok(icmp) => icmp,
                    Err(e) => {
                        tracing::debug!(error = %e, "cannot build ICMP reply");
                        return;
                    }
                };
                if let Err(e) = self.relay(self.ourself(), src, false, &icmp, None) {
                    tracing::debug!(error = %e, peer = %src, "could not return ICMP");
                }
            }
            Err(e) => tracing::debug!(error = %e, "relay failed"),
        }
    }

    fn relay(
        &self,
        src: PeerName,
        dst: PeerName,
        df: bool,
        frame: &[u8],
        dec: Option<&DecodedFrame>,
    ) -> Result<(), ForwardError> {
        let Some(hop) = self.routes.unicast(dst) else {
            tracing::debug!(peer = %dst, "no route to destination");
            return Ok(());
        };
        let Some(conn) = self.peers.local_connection(hop) else {
            tracing::debug!(peer = %hop, "no connection to next hop");
            return Ok(());
        };
        conn.blocking_forward(df, src, dst, frame, dec)
    }

    /// Flood a frame originating at `src` to our next hops in its
    /// broadcast tree. Each copy is addressed to the hop itself.
    fn relay_broadcast(
        &self,
        src: PeerName,
        df: bool,
        frame: &[u8],
        dec: Option<&DecodedFrame>,
    ) -> Result<(), ForwardError> {
        for hop in self.routes.blocking_broadcast(src) {
            if let Some(conn) = self.peers.local_connection(hop) {
                conn.blocking_forward(df, src, hop, frame, dec)?;
            }
        }
        Ok(())
    }
}

fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use skein_core::crypto::{Encryptor, PlainEncryptor};
    use skein_core::wire::{
        frag_test_frame, heartbeat_frame, pmtu_discovery_frame, PMTU_DISCOVERY_SIZE,
    };
    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::{Command, Handshake};

    fn name(n: u8) -> PeerName {
        PeerName::from_mac([0x02, 0, 0, 0, 0, n])
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Vec<u8>>>);

    impl Injector for Recorder {
        fn write_packet(&self, frame: &[u8]) -> io::Result<()> {
            self.0.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    impl Recorder {
        fn frames(&self) -> Vec<Vec<u8>> {
            self.0.lock().unwrap().clone()
        }
    }

    fn router() -> (Arc<Router>, Arc<Recorder>) {
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let injector = Arc::new(Recorder::default());
        let (shutdown, _) = broadcast::channel(1);
        let identity = Identity {
            name: name(1),
            uid: 1,
            psk: None,
        };
        let router = Router::new(
            identity,
            SkeinConfig::default(),
            udp,
            injector.clone(),
            shutdown,
        );
        (router, injector)
    }

    /// Register a connection to `remote` without running its actor.
    fn connect(router: &Router, remote: PeerName, conn_uid: u64) -> mpsc::UnboundedReceiver<Command> {
        let hs = Handshake {
            remote_name: remote,
            remote_uid: 2,
            conn_uid,
            version: 1,
            keys: None,
        };
        let (conn, rx) = LocalConnection::new(router.ourself(), &hs, "127.0.0.1:6783".parse().unwrap(), true);
        router.peers.fetch_with_default(remote, 2).unwrap();
        router.peers.add_local_connection(conn, 0).unwrap();
        rx
    }

    fn packet(src: PeerName, dst: PeerName, frame: &[u8]) -> Vec<u8> {
        let mut enc = PlainEncryptor::new(src);
        enc.append_frame(src, dst, frame).unwrap();
        enc.bytes().unwrap()
    }

    fn ethernet(dst: [u8; 6], src: [u8; 6], len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; len];
        frame[..6].copy_from_slice(&dst);
        frame[6..12].copy_from_slice(&src);
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        frame
    }

    const LOCAL_MAC: [u8; 6] = [0x0a, 0, 0, 0, 0, 1];
    const REMOTE_MAC: [u8; 6] = [0x0a, 0, 0, 0, 0, 2];
    const FROM: &str = "127.0.0.1:40000";

    async fn on_data_plane<F: FnOnce() + Send + 'static>(f: F) {
        tokio::task::spawn_blocking(f).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn captured_frames_learn_local_macs() {
        let (router, _) = router();
        let r = router.clone();
        on_data_plane(move || {
            r.handle_captured_frame(&ethernet([0xff; 6], LOCAL_MAC, 60));
            // Spanning tree: learn the sender, never forward.
            r.handle_captured_frame(&ethernet([0x01, 0x80, 0xc2, 0, 0, 0], [0x0a, 0, 0, 0, 0, 3], 60));
        })
        .await;
        assert_eq!(router.macs.lookup(&LOCAL_MAC), Some(name(1)));
        assert_eq!(router.macs.lookup(&[0x0a, 0, 0, 0, 0, 3]), Some(name(1)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn frames_we_injected_are_not_recaptured() {
        let (router, _) = router();
        router.macs.enter(REMOTE_MAC, name(2));
        let r = router.clone();
        on_data_plane(move || r.handle_captured_frame(&ethernet([0xff; 6], REMOTE_MAC, 60))).await;
        assert_eq!(router.macs.lookup(&REMOTE_MAC), Some(name(2)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inbound_frames_are_injected_and_learned() {
        let (router, injector) = router();
        let _rx = connect(&router, name(2), 7);
        let frame = ethernet(LOCAL_MAC, REMOTE_MAC, 60);
        router.macs.enter(LOCAL_MAC, name(1));

        let r = router.clone();
        let pkt = packet(name(2), name(1), &frame);
        on_data_plane(move || r.handle_udp_packet(&pkt, FROM.parse().unwrap())).await;

        assert_eq!(injector.frames(), vec![frame]);
        assert_eq!(router.macs.lookup(&REMOTE_MAC), Some(name(2)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn heartbeats_reach_their_connection() {
        let (router, injector) = router();
        let mut rx = connect(&router, name(2), 7);

        let r = router.clone();
        on_data_plane(move || {
            let from = FROM.parse().unwrap();
            r.handle_udp_packet(&packet(name(2), name(1), &heartbeat_frame(8)), from);
            r.handle_udp_packet(&packet(name(2), name(1), &heartbeat_frame(7)), from);
        })
        .await;

        assert!(matches!(rx.try_recv(), Ok(Command::Heartbeat(addr)) if addr == FROM.parse().unwrap()));
        assert!(rx.try_recv().is_err());
        assert!(injector.frames().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sentinel_frames_are_answered_over_tcp() {
        let (router, injector) = router();
        let mut rx = connect(&router, name(2), 7);

        let r = router.clone();
        on_data_plane(move || {
            let from = FROM.parse().unwrap();
            r.handle_udp_packet(&packet(name(2), name(1), &frag_test_frame()), from);
            r.handle_udp_packet(&packet(name(2), name(1), &vec![0u8; 1200 + ETHERNET_OVERHEAD]), from);
        })
        .await;

        assert!(matches!(
            rx.try_recv(),
            Ok(Command::Send(ProtocolTag::FragmentationReceived, _))
        ));
        match rx.try_recv() {
            Ok(Command::Send(ProtocolTag::PmtuVerified, payload)) => {
                assert_eq!(payload, 1200u16.to_be_bytes());
            }
            _ => panic!("expected PMTU verification"),
        }
        assert!(injector.frames().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn verification_at_discovery_length_is_answered() {
        let (router, injector) = router();
        let mut rx = connect(&router, name(2), 7);

        let r = router.clone();
        on_data_plane(move || {
            let from = FROM.parse().unwrap();
            r.handle_udp_packet(&packet(name(2), name(1), &pmtu_discovery_frame()), from);
            r.handle_udp_packet(&packet(name(2), name(1), &vec![0u8; PMTU_DISCOVERY_SIZE]), from);
        })
        .await;

        match rx.try_recv() {
            Ok(Command::Send(ProtocolTag::PmtuVerified, payload)) => {
                let expected = (PMTU_DISCOVERY_SIZE - ETHERNET_OVERHEAD) as u16;
                assert_eq!(payload, expected.to_be_bytes());
            }
            _ => panic!("expected PMTU verification"),
        }
        assert!(rx.try_recv().is_err());
        assert!(injector.frames().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn packets_from_strangers_are_ignored() {
        let (router, injector) = router();
        let r = router.clone();
        on_data_plane(move || {
            let frame = ethernet(LOCAL_MAC, REMOTE_MAC, 60);
            r.handle_udp_packet(&packet(name(9), name(1), &frame), FROM.parse().unwrap());
            r.handle_udp_packet(&[1, 2, 3], FROM.parse().unwrap());
        })
        .await;
        assert!(injector.frames().is_empty());
        assert!(router.macs.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_is_idempotent() {
        let (router, _) = router();
        let mut shutdown = router.subscribe_shutdown();
        router.stop();
        router.stop();
        assert!(router.is_stopping());
        assert!(shutdown.recv().await.is_ok());
    }
}
