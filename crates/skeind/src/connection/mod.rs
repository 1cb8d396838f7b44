//! One live connection to a neighbouring router.
//!
//! A connection is a TCP control channel plus two forwarder pipelines
//! that carry frames to the peer over UDP. `run` drives the whole
//! lifecycle: handshake, registration in the peer table, heartbeats and
//! control messages, and teardown. Other tasks talk to the running
//! connection through `LocalConnection`, which the peer table holds.

pub mod handshake;
pub mod tcp;

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use skein_core::crypto::{
    CryptoError, Decryptor, Encryptor, PlainEncryptor, SealedEncryptor, SessionCipher,
};
use skein_core::ethernet::{fragment, DecodedFrame};
use skein_core::name::{PeerName, PeerUid};
use skein_core::wire::{
    frag_test_frame, heartbeat_frame, pmtu_discovery_frame, ProtocolTag, WireError,
    ETHERNET_OVERHEAD, FAST_HEARTBEAT, FRAG_TEST_INTERVAL, HEARTBEAT_TIMEOUT, READ_TIMEOUT,
    SLOW_HEARTBEAT, TCP_HEARTBEAT,
};
use skein_mesh::{AttemptError, LocalLink, PeersError};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::Instrument;

use crate::forwarder::{ForwardError, ForwardedFrame, Forwarder, PmtuSettings};
use crate::router::Router;
use crate::udp_sender::{RawUdpSender, SimpleUdpSender, UdpSender};

pub use handshake::{handshake, Handshake, Identity};
use tcp::ControlCodec;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("malformed introduction: {0}")]
    Intro(#[from] serde_json::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    /// `ours` is whether we have a password configured.
    #[error("encryption mismatch (password configured here: {ours})")]
    EncryptionMismatch { ours: bool },

    #[error("cannot connect to ourself")]
    ConnectToSelf,

    #[error(transparent)]
    Peers(#[from] PeersError),

    #[error("timed out waiting for UDP heartbeat")]
    HeartbeatTimeout,

    #[error("no control message within {READ_TIMEOUT:?}")]
    ReadTimeout,

    #[error("{0}")]
    Closed(String),
}

impl From<ConnectionError> for AttemptError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectToSelf => AttemptError::ConnectToSelf,
            ConnectionError::Peers(PeersError::NameCollision(name)) => {
                AttemptError::NameCollision(name)
            }
            other => AttemptError::Other(other.into()),
        }
    }
}

// ── Shared handle ─────────────────────────────────────────────────────────────

pub(crate) enum Command {
    Shutdown(String),
    Heartbeat(SocketAddr),
    Send(ProtocolTag, Vec<u8>),
}

pub(crate) struct Forwarders {
    df: Forwarder,
    plain: Forwarder,
}

impl Forwarders {
    async fn stop(&self) {
        self.df.stop().await;
        self.plain.stop().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Df,
    Plain,
}

#[derive(Default)]
struct UdpPath {
    addr: Option<SocketAddr>,
    forwarders: Option<Arc<Forwarders>>,
}

pub struct LocalConnection {
    ourself: PeerName,
    remote: PeerName,
    remote_uid: PeerUid,
    uid: u64,
    remote_tcp_addr: SocketAddr,
    outbound: bool,
    established: AtomicBool,
    stack_frag: AtomicBool,
    path: RwLock<UdpPath>,
    data_cipher: Option<Arc<SessionCipher>>,
    decryptor: Decryptor,
    commands: mpsc::UnboundedSender<Command>,
}

impl LocalConnection {
    pub(crate) fn new(
        ourself: PeerName,
        handshake: &Handshake,
        remote_tcp_addr: SocketAddr,
        outbound: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let data_cipher = handshake.keys.as_ref().map(|k| Arc::new(k.data()));
        let decryptor = match &data_cipher {
            Some(cipher) => Decryptor::Sealed(cipher.clone()),
            None => Decryptor::Plain,
        };
        let conn = Arc::new(Self {
            ourself,
            remote: handshake.remote_name,
            remote_uid: handshake.remote_uid,
            uid: handshake.conn_uid,
            remote_tcp_addr,
            outbound,
            established: AtomicBool::new(false),
            stack_frag: AtomicBool::new(false),
            path: RwLock::new(UdpPath::default()),
            data_cipher,
            decryptor,
            commands,
        });
        (conn, rx)
    }

    pub fn remote(&self) -> PeerName {
        self.remote
    }

    pub fn remote_uid(&self) -> PeerUid {
        self.remote_uid
    }

    pub fn decryptor(&self) -> &Decryptor {
        &self.decryptor
    }

    pub fn remote_udp_addr(&self) -> Option<SocketAddr> {
        self.path.read().unwrap_or_else(PoisonError::into_inner).addr
    }

    pub fn stack_frag(&self) -> bool {
        self.stack_frag.load(Ordering::SeqCst)
    }

    fn forwarders(&self) -> Option<Arc<Forwarders>> {
        self.path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .forwarders
            .clone()
    }

    /// Effective PMTU of the DF pipeline, once there is one.
    pub fn effective_pmtu(&self) -> Option<usize> {
        self.forwarders().map(|f| f.df.effective_pmtu())
    }

    /// A heartbeat for this connection arrived over UDP from `from`.
    pub fn heartbeat_received(&self, from: SocketAddr) {
        let _ = self.commands.send(Command::Heartbeat(from));
    }

    /// Queue a control message. Dropped if the connection is closing.
    pub fn send_control(&self, tag: ProtocolTag, payload: Vec<u8>) {
        let _ = self.commands.send(Command::Send(tag, payload));
    }

    /// Decide which pipeline(s) a frame goes on. `df` means the frame
    /// itself must not be fragmented.
    fn plan(
        &self,
        forwarders: &Forwarders,
        df: bool,
        frame: &[u8],
        dec: Option<&DecodedFrame>,
    ) -> Result<Vec<(Lane, Bytes)>, ForwardError> {
        let effective_pmtu = forwarders.df.effective_pmtu();
        let fits = frame.len().saturating_sub(ETHERNET_OVERHEAD) <= effective_pmtu;
        if df {
            if !fits {
                return Err(ForwardError::FrameTooBig { effective_pmtu });
            }
            return Ok(vec![(Lane::Df, Bytes::copy_from_slice(frame))]);
        }
        let ipv4 = dec.is_some_and(DecodedFrame::is_ipv4);
        if self.stack_frag() || !ipv4 {
            return Ok(vec![(Lane::Plain, Bytes::copy_from_slice(frame))]);
        }
        if fits {
            return Ok(vec![(Lane::Df, Bytes::copy_from_slice(frame))]);
        }
        let segments = fragment(frame, effective_pmtu + ETHERNET_OVERHEAD)?;
        tracing::trace!(segments = segments.len(), "fragmented frame");
        Ok(segments
            .into_iter()
            .map(|s| (Lane::Df, Bytes::from(s)))
            .collect())
    }

    /// Forward a frame from a data-plane thread. Blocks while the
    /// pipeline is full.
    pub fn blocking_forward(
        &self,
        df: bool,
        src: PeerName,
        dst: PeerName,
        frame: &[u8],
        dec: Option<&DecodedFrame>,
    ) -> Result<(), ForwardError> {
        let Some(forwarders) = self.forwarders() else {
            tracing::debug!(peer = %self.remote, "awaiting contact, frame dropped");
            return Ok(());
        };
        for (lane, frame) in self.plan(&forwarders, df, frame, dec)? {
            let pipeline = match lane {
                Lane::Df => &forwarders.df,
                Lane::Plain => &forwarders.plain,
            };
            ignore_closed(pipeline.blocking_forward(ForwardedFrame { src, dst, frame }))?;
        }
        Ok(())
    }

    /// Async counterpart of `blocking_forward`, for frames we originate.
    pub async fn forward(
        &self,
        df: bool,
        src: PeerName,
        dst: PeerName,
        frame: &[u8],
        dec: Option<&DecodedFrame>,
    ) -> Result<(), ForwardError> {
        let Some(forwarders) = self.forwarders() else {
            tracing::debug!(peer = %self.remote, "awaiting contact, frame dropped");
            return Ok(());
        };
        for (lane, frame) in self.plan(&forwarders, df, frame, dec)? {
            let pipeline = match lane {
                Lane::Df => &forwarders.df,
                Lane::Plain => &forwarders.plain,
            };
            ignore_closed(pipeline.forward(ForwardedFrame { src, dst, frame }).await)?;
        }
        Ok(())
    }

    fn encryptor(&self) -> Box<dyn Encryptor> {
        match &self.data_cipher {
            Some(cipher) => Box::new(SealedEncryptor::new(self.ourself, cipher.clone())),
            None => Box::new(PlainEncryptor::new(self.ourself)),
        }
    }

    /// Point the pipelines at `addr`, replacing any previous ones.
    /// Returns the pipelines that were replaced so the caller can stop
    /// them.
    fn start_forwarders(
        &self,
        addr: SocketAddr,
        udp: &Arc<UdpSocket>,
        port: u16,
        settings: &PmtuSettings,
    ) -> Option<Arc<Forwarders>> {
        let plain_sender: Arc<dyn UdpSender> = Arc::new(SimpleUdpSender::new(udp.clone(), addr));
        let df_sender: Arc<dyn UdpSender> = match addr {
            SocketAddr::V4(v4) => match RawUdpSender::new(port, v4) {
                Ok(raw) => Arc::new(raw),
                Err(e) => {
                    tracing::warn!(error = %e, "raw socket unavailable, PMTU discovery disabled");
                    plain_sender.clone()
                }
            },
            SocketAddr::V6(_) => plain_sender.clone(),
        };
        let forwarders = Arc::new(Forwarders {
            df: Forwarder::spawn(
                self.ourself,
                self.remote,
                true,
                settings.clone(),
                self.encryptor(),
                df_sender,
            ),
            plain: Forwarder::spawn(
                self.ourself,
                self.remote,
                false,
                settings.clone(),
                self.encryptor(),
                plain_sender,
            ),
        });
        let mut path = self.path.write().unwrap_or_else(PoisonError::into_inner);
        path.addr = Some(addr);
        path.forwarders.replace(forwarders)
    }

    fn take_forwarders(&self) -> Option<Arc<Forwarders>> {
        self.path
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .forwarders
            .take()
    }
}

fn ignore_closed(result: Result<(), ForwardError>) -> Result<(), ForwardError> {
    match result {
        Err(ForwardError::Closed) => Ok(()),
        other => other,
    }
}

impl LocalLink for LocalConnection {
    fn remote_name(&self) -> PeerName {
        self.remote
    }

    fn remote_tcp_addr(&self) -> SocketAddr {
        self.remote_tcp_addr
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
        let _ = self.commands.send(Command::Shutdown(reason.to_string()));
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

/// Run a connection over `stream` until it closes. `addr` is the peer's
/// TCP address. Returns `Ok` when the router shut the connection down.
pub async fn run(
    router: Arc<Router>,
    mut stream: TcpStream,
    addr: SocketAddr,
    outbound: bool,
) -> Result<(), ConnectionError> {
    let _ = stream.set_nodelay(true);
    let identity = router.identity();
    let hs = match handshake(&mut stream, identity, outbound).await {
        Ok(hs) => hs,
        Err(e) => {
            tracing::info!(%addr, error = %e, "handshake failed");
            return Err(e);
        }
    };
    if hs.remote_name == identity.name {
        return Err(if hs.remote_uid == identity.uid {
            ConnectionError::ConnectToSelf
        } else {
            PeersError::NameCollision(hs.remote_name).into()
        });
    }
    router.peers.fetch_with_default(hs.remote_name, hs.remote_uid)?;

    let span = tracing::info_span!("connection", peer = %hs.remote_name, %addr);
    let (conn, commands) = LocalConnection::new(identity.name, &hs, addr, outbound);
    let codec = ControlCodec::new(hs.keys.as_ref().map(|k| Arc::new(k.control())));
    tracing::info!(parent: &span, outbound, version = hs.version, encrypted = hs.keys.is_some(), "handshake complete");

    let (reader, writer) = stream.into_split();
    let actor = ConnectionActor {
        router: router.clone(),
        conn: conn.clone(),
        commands,
        codec,
        writer,
        heartbeat: None,
        frag_test: None,
        received_heartbeat: false,
        last_heartbeat: Instant::now(),
    };
    let result = actor.run(reader).instrument(span.clone()).await;

    let reason = match &result {
        Ok(()) => String::from("router shutting down"),
        Err(e) => e.to_string(),
    };
    teardown(&router, &conn, &reason).instrument(span.clone()).await;
    tracing::info!(parent: &span, %reason, "connection closed");
    result
}

async fn teardown(router: &Router, conn: &LocalConnection, reason: &str) {
    let removed = router.peers.delete_local_connection(conn.remote, conn.uid);
    router.peers.dereference(conn.remote);
    if let Some(forwarders) = conn.take_forwarders() {
        forwarders.stop().await;
    }
    router.routes.recalculate();
    if removed {
        router.gossip_ourself();
    }
    router
        .cm
        .connection_terminated(conn.remote_tcp_addr, reason.to_string());
    let collected = router.peers.garbage_collect();
    if !collected.is_empty() {
        let purged = router.macs.delete_peers(&collected);
        tracing::debug!(peers = collected.len(), purged, "garbage collected peers");
    }
}

type Message = Result<(ProtocolTag, Vec<u8>), ConnectionError>;

async fn read_loop(mut reader: OwnedReadHalf, codec: ControlCodec, tx: mpsc::Sender<Message>) {
    loop {
        let msg = match tokio::time::timeout(READ_TIMEOUT, codec.read(&mut reader)).await {
            Ok(msg) => msg,
            Err(_) => Err(ConnectionError::ReadTimeout),
        };
        let failed = msg.is_err();
        if tx.send(msg).await.is_err() || failed {
            break;
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn ticker(period: std::time::Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

struct ConnectionActor {
    router: Arc<Router>,
    conn: Arc<LocalConnection>,
    commands: mpsc::UnboundedReceiver<Command>,
    codec: ControlCodec,
    writer: OwnedWriteHalf,
    heartbeat: Option<Interval>,
    frag_test: Option<Interval>,
    received_heartbeat: bool,
    last_heartbeat: Instant,
}

impl ConnectionActor {
    async fn run(mut self, reader: OwnedReadHalf) -> Result<(), ConnectionError> {
        let (msg_tx, mut msg_rx) = mpsc::channel(skein_core::wire::CHANNEL_SIZE);
        let reader = tokio::spawn(read_loop(reader, self.codec.clone(), msg_tx).in_current_span());
        let result = self.serve(&mut msg_rx).await;
        reader.abort();
        result
    }

    async fn serve(&mut self, messages: &mut mpsc::Receiver<Message>) -> Result<(), ConnectionError> {
        let router = self.router.clone();
        let conn = self.conn.clone();
        router
            .peers
            .add_local_connection(conn.clone(), router.config.router.conn_limit)?;
        router
            .cm
            .connection_created(conn.remote_tcp_addr, conn.remote, conn.outbound);
        router.routes.recalculate();

        let everything = router.peers.encode_all()?;
        self.send(ProtocolTag::Update, &everything).await?;
        router.gossip_ourself();

        if conn.outbound {
            // The peer listens for UDP on the same address as TCP.
            self.set_udp_addr(conn.remote_tcp_addr).await;
        }

        let mut shutdown = router.subscribe_shutdown();
        let mut tcp_heartbeat = tokio::time::interval_at(Instant::now() + TCP_HEARTBEAT, TCP_HEARTBEAT);
        tcp_heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                Some(cmd) = self.commands.recv() => match cmd {
                    Command::Shutdown(reason) => return Err(ConnectionError::Closed(reason)),
                    Command::Heartbeat(from) => self.heartbeat_received(from).await?,
                    Command::Send(tag, payload) => self.send(tag, &payload).await?,
                },
                msg = messages.recv() => match msg {
                    Some(Ok((tag, payload))) => self.handle_message(tag, &payload).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(ConnectionError::Closed("reader stopped".into())),
                },
                _ = tick(&mut self.heartbeat) => self.send_heartbeat().await?,
                _ = tick(&mut self.frag_test) => self.start_frag_test().await?,
                _ = tcp_heartbeat.tick() => self.send(ProtocolTag::Heartbeat, &[]).await?,
            }
        }
    }

    async fn send(&mut self, tag: ProtocolTag, payload: &[u8]) -> Result<(), ConnectionError> {
        tracing::trace!(?tag, len = payload.len(), "send");
        self.codec.write(&mut self.writer, tag, payload).await
    }

    /// Send a frame of our own to the peer, logging rather than failing.
    async fn forward_own(&self, df: bool, frame: &[u8]) {
        let conn = &self.conn;
        if let Err(e) = conn.forward(df, conn.ourself, conn.remote, frame, None).await {
            tracing::debug!(error = %e, len = frame.len(), "could not forward");
        }
    }

    async fn set_udp_addr(&mut self, addr: SocketAddr) {
        let router = &self.router;
        let replaced = self.conn.start_forwarders(
            addr,
            &router.udp_socket(),
            router.config.router.port,
            &PmtuSettings::from(&router.config.pmtu),
        );
        if let Some(old) = replaced {
            old.stop().await;
        }
        if !self.conn.established() {
            self.heartbeat = Some(ticker(FAST_HEARTBEAT));
        }
    }

    async fn send_heartbeat(&mut self) -> Result<(), ConnectionError> {
        if self.conn.established() && self.last_heartbeat.elapsed() > HEARTBEAT_TIMEOUT {
            return Err(ConnectionError::HeartbeatTimeout);
        }
        self.forward_own(true, &heartbeat_frame(self.conn.uid)).await;
        Ok(())
    }

    async fn heartbeat_received(&mut self, from: SocketAddr) -> Result<(), ConnectionError> {
        self.last_heartbeat = Instant::now();
        match self.conn.remote_udp_addr() {
            Some(addr) if addr == from => {}
            Some(addr) => {
                tracing::info!(old = %addr, new = %from, "peer moved");
                self.set_udp_addr(from).await;
            }
            None => self.set_udp_addr(from).await,
        }
        if !self.received_heartbeat {
            self.received_heartbeat = true;
            self.send(ProtocolTag::ConnectionEstablished, &[]).await?;
        }
        Ok(())
    }

    /// The peer has heard our heartbeats.
    async fn set_established(&mut self) -> Result<(), ConnectionError> {
        if self.conn.established.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("connection established");
        self.last_heartbeat = Instant::now();
        let router = self.router.clone();
        if router
            .peers
            .connection_established(self.conn.remote, self.conn.uid)
        {
            router.routes.recalculate();
            router.gossip_ourself();
        }

        // Prompt PMTU discovery with a frame most paths cannot carry whole.
        self.forward_own(true, &pmtu_discovery_frame()).await;
        self.heartbeat = Some(ticker(SLOW_HEARTBEAT));
        self.frag_test = Some(ticker(FRAG_TEST_INTERVAL));
        Ok(())
    }

    async fn start_frag_test(&mut self) -> Result<(), ConnectionError> {
        self.conn.stack_frag.store(false, Ordering::SeqCst);
        self.send(ProtocolTag::StartFragmentationTest, &[]).await
    }

    async fn handle_message(&mut self, tag: ProtocolTag, payload: &[u8]) -> Result<(), ConnectionError> {
        tracing::trace!(?tag, len = payload.len(), "received");
        match tag {
            ProtocolTag::ConnectionEstablished => self.set_established().await?,
            ProtocolTag::StartFragmentationTest => {
                self.forward_own(false, &frag_test_frame()).await;
            }
            ProtocolTag::FragmentationReceived => {
                tracing::debug!("stack fragmentation works");
                self.conn.stack_frag.store(true, Ordering::SeqCst);
            }
            ProtocolTag::Heartbeat => {}
            ProtocolTag::FetchAll => {
                let everything = self.router.peers.encode_all()?;
                self.send(ProtocolTag::Update, &everything).await?;
            }
            ProtocolTag::Update => self.handle_update(payload).await?,
            ProtocolTag::PmtuVerified => {
                let len: [u8; 2] = payload
                    .get(..2)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(WireError::Truncated {
                        need: 2,
                        got: payload.len(),
                    })?;
                let len = usize::from(u16::from_be_bytes(len));
                if let Some(forwarders) = self.conn.forwarders() {
                    let verified = forwarders.df.pmtu_verified(len);
                    tracing::debug!(len, verified, "pmtu verification acknowledged");
                }
            }
        }
        Ok(())
    }

    async fn handle_update(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        let router = self.router.clone();
        let outcome = match router.peers.apply_update(payload) {
            Ok(outcome) => outcome,
            Err(PeersError::UnknownPeer(name)) => {
                tracing::debug!(peer = %name, "update references unknown peer, fetching all");
                return self.send(ProtocolTag::FetchAll, &[]).await;
            }
            Err(e) => return Err(e.into()),
        };
        if !outcome.newer_here.is_empty() {
            let newer = router.peers.encode_peers(&outcome.newer_here)?;
            self.send(ProtocolTag::Update, &newer).await?;
        }
        if !outcome.changed.is_empty() {
            router.relay_update(&outcome.changed, Some(self.conn.remote));
        }
        if outcome.ourself_modified {
            router.gossip_ourself();
        }
        if !outcome.removed.is_empty() {
            router.macs.delete_peers(&outcome.removed);
        }
        if !outcome.is_unchanged() || !outcome.removed.is_empty() {
            tracing::debug!(changed = outcome.changed.len(), removed = outcome.removed.len(), "topology changed");
            router.routes.recalculate();
            router.cm.refresh();
        }
        Ok(())
    }
}
