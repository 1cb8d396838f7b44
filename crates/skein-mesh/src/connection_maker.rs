//! Connection maker: keeps us connected to the peers we should be
//! talking to.
//!
//! A single task owns the desired state (direct peers from configuration,
//! plus addresses learned from topology gossip when discovery is on) and
//! the actual state (live connections). Every change is an action closure
//! sent to that task; actions that return `true` trigger a reconcile,
//! which attempts every target whose retry time has come and arms a timer
//! for the next one.
//!
//! Retry delays grow as `min(i + rand(0..=i), max)` after each failure.
//! New targets start at `rand(0..=initial)`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use skein_core::name::PeerName;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::Instrument;

pub const INITIAL_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// A target whose last attempt started longer ago than this is retried
/// promptly when that attempt ends.
pub const RESET_AFTER: Duration = Duration::from_secs(60);

/// Upper bound on how long the task sleeps with nothing scheduled.
const IDLE_WAKEUP: Duration = Duration::from_secs(60 * 60);

// ── Collaborators ─────────────────────────────────────────────────────────────

/// Opens connections on behalf of the connection maker.
///
/// The returned future resolves when the attempt fails, or, if it
/// succeeds, when the resulting connection closes. The target stays in the
/// attempting state until then.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, addr: SocketAddr, direct: bool) -> BoxFuture<'static, Result<(), AttemptError>>;
}

/// Where discovery finds addresses of peers we are not connected to.
pub trait AdvertisedTargets: Send + Sync + 'static {
    fn advertised_targets(&self, connected: &BTreeSet<PeerName>, port: u16) -> Vec<SocketAddr>;
}

#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("cannot connect to ourself")]
    ConnectToSelf,

    #[error("peer name collision with {0}")]
    NameCollision(PeerName),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AttemptError {
    fn is_permanent(&self) -> bool {
        matches!(self, AttemptError::ConnectToSelf | AttemptError::NameCollision(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("cannot resolve {0}: {1}")]
    Resolve(String, std::io::Error),

    #[error("{0} has no IPv4 address")]
    NoIpv4(String),
}

// ── Targets ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Unconnected,
    Attempting,
}

/// An address we want to be connected to.
#[derive(Debug, Clone)]
pub struct Target {
    pub state: TargetState,
    pub attempt_count: u32,
    /// `None` means never retry.
    pub try_after: Option<Instant>,
    pub try_interval: Duration,
    pub last_error: Option<String>,
    /// Identifies the dial in flight, so a late result from an earlier
    /// one cannot move this target.
    attempt_id: u64,
}

fn random_up_to(limit: Duration) -> Duration {
    let nanos = u64::try_from(limit.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
}

impl Target {
    fn new(backoff: &Backoff, now: Instant) -> Self {
        let mut target = Self {
            state: TargetState::Unconnected,
            attempt_count: 0,
            try_after: None,
            try_interval: backoff.initial,
            last_error: None,
            attempt_id: 0,
        };
        target.next_try_now(backoff, now);
        target
    }

    fn next_try_now(&mut self, backoff: &Backoff, now: Instant) {
        self.try_interval = backoff.initial;
        self.try_after = Some(now + random_up_to(backoff.initial));
    }

    fn next_try_later(&mut self, backoff: &Backoff, now: Instant) {
        self.try_interval = (self.try_interval + random_up_to(self.try_interval)).min(backoff.max);
        self.try_after = Some(now + self.try_interval);
    }

    fn next_try_never(&mut self) {
        self.try_after = None;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: INITIAL_INTERVAL,
            max: MAX_INTERVAL,
        }
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConnectionMakerStatus {
    pub direct_peers: Vec<String>,
    pub targets: Vec<(SocketAddr, Target)>,
    pub connections: usize,
    pub taken_at: Instant,
}

impl fmt::Display for ConnectionMakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Direct Peers:")?;
        for peer in &self.direct_peers {
            write!(f, " {peer}")?;
        }
        writeln!(f, "\nReconnects:")?;
        for (addr, target) in &self.targets {
            write!(f, "->[{addr}]")?;
            if let Some(err) = &target.last_error {
                write!(f, " ({err})")?;
            }
            match (target.state, target.try_after) {
                (TargetState::Attempting, _) => {
                    writeln!(f, " trying (attempt {})", target.attempt_count)?
                }
                (TargetState::Unconnected, None) => writeln!(f, " never retried")?,
                (TargetState::Unconnected, Some(at)) => writeln!(
                    f,
                    " next try in {:?}",
                    at.saturating_duration_since(self.taken_at)
                )?,
            }
        }
        Ok(())
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

type Action = Box<dyn FnOnce(&mut MakerState) -> bool + Send>;

#[derive(Clone)]
pub struct ConnectionMaker {
    action_tx: mpsc::UnboundedSender<Action>,
}

pub struct ConnectionMakerSettings {
    /// Port assumed for addresses given without one.
    pub port: u16,
    pub discovery: bool,
    pub backoff: Backoff,
}

impl ConnectionMaker {
    /// Spawn the connection maker task. It runs until `shutdown` fires.
    pub fn start(
        settings: ConnectionMakerSettings,
        dialer: Arc<dyn Dialer>,
        topology: Arc<dyn AdvertisedTargets>,
        shutdown: broadcast::Receiver<()>,
        span: tracing::Span,
    ) -> Self {
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let worker = ConnectionMakerWorker {
            state: MakerState {
                port: settings.port,
                discovery: settings.discovery,
                backoff: settings.backoff,
                dialer,
                topology,
                targets: BTreeMap::new(),
                direct_peers: BTreeMap::new(),
                connections: BTreeMap::new(),
                next_attempt_id: 0,
                action_tx: action_tx.clone(),
            },
            action_rx,
        };
        tokio::spawn(
            async move {
                if let Err(e) = worker.run(shutdown).await {
                    tracing::warn!(error = %e, "connection maker stopped");
                }
            }
            .instrument(span),
        );
        Self { action_tx }
    }

    fn send(&self, action: impl FnOnce(&mut MakerState) -> bool + Send + 'static) {
        if self.action_tx.send(Box::new(action)).is_err() {
            tracing::debug!("connection maker is gone");
        }
    }

    /// Resolve `peers` and make them direct peers, replacing the current
    /// set if `replace`. Addresses without a port use the router's port
    /// when connecting. Existing backoff for these addresses is cut short.
    pub async fn initiate_connections(&self, peers: Vec<String>, replace: bool) -> Vec<AddrError> {
        let mut errors = Vec::new();
        let mut resolved = Vec::with_capacity(peers.len());
        for peer in peers {
            match resolve(&peer).await {
                Ok(addr) => resolved.push((peer, addr)),
                Err(e) => errors.push(e),
            }
        }
        self.send(move |state| {
            if replace {
                state.direct_peers.clear();
            }
            let now = Instant::now();
            for (peer, addr) in resolved {
                let complete = state.complete(addr);
                state.direct_peers.insert(peer, addr);
                if let Some(target) = state.targets.get_mut(&complete) {
                    if target.state == TargetState::Unconnected {
                        target.next_try_now(&state.backoff, now);
                    }
                }
            }
            true
        });
        errors
    }

    pub fn forget_connections(&self, peers: Vec<String>) {
        self.send(move |state| {
            for peer in &peers {
                state.direct_peers.remove(peer);
            }
            true
        });
    }

    /// A connection, inbound or outbound, has been registered.
    pub fn connection_created(&self, addr: SocketAddr, name: PeerName, outbound: bool) {
        self.send(move |state| {
            state.connections.insert(addr, LiveConnection { name, outbound });
            true
        });
    }

    pub fn connection_terminated(&self, addr: SocketAddr, reason: String) {
        self.send(move |state| {
            state.connections.remove(&addr);
            if let Some(target) = state.targets.get_mut(&addr) {
                target.last_error = Some(reason);
            }
            true
        });
    }

    /// Reconcile now, e.g. after the topology changed.
    pub fn refresh(&self) {
        self.send(|_| true);
    }

    pub async fn status_snapshot(&self) -> Option<ConnectionMakerStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(move |state| {
            let _ = tx.send(state.status());
            false
        });
        rx.await.ok()
    }

    pub async fn status(&self) -> String {
        match self.status_snapshot().await {
            Some(status) => status.to_string(),
            None => String::from("connection maker stopped\n"),
        }
    }
}

/// Split `host[:port]` and resolve to an IPv4 socket address. A missing
/// port is returned as 0.
async fn resolve(peer: &str) -> Result<SocketAddr, AddrError> {
    let (host, port) = match peer.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => (peer, 0),
        },
        None => (peer, 0),
    };
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AddrError::Resolve(peer.to_string(), e))?;
    let mut addrs = addrs.filter(SocketAddr::is_ipv4);
    addrs.next().ok_or_else(|| AddrError::NoIpv4(peer.to_string()))
}

// ── Worker ────────────────────────────────────────────────────────────────────

struct LiveConnection {
    name: PeerName,
    outbound: bool,
}

struct MakerState {
    port: u16,
    discovery: bool,
    backoff: Backoff,
    dialer: Arc<dyn Dialer>,
    topology: Arc<dyn AdvertisedTargets>,
    targets: BTreeMap<SocketAddr, Target>,
    /// As given by the user, with the resolved address (port 0 if none).
    direct_peers: BTreeMap<String, SocketAddr>,
    connections: BTreeMap<SocketAddr, LiveConnection>,
    next_attempt_id: u64,
    action_tx: mpsc::UnboundedSender<Action>,
}

impl MakerState {
    fn complete(&self, mut addr: SocketAddr) -> SocketAddr {
        if addr.port() == 0 {
            addr.set_port(self.port);
        }
        addr
    }

    /// Compare desired and actual connectivity, start due attempts and
    /// return how long until the next one is due.
    fn reconcile(&mut self) -> Duration {
        let now = Instant::now();
        let connected_names: BTreeSet<PeerName> =
            self.connections.values().map(|c| c.name).collect();
        let inbound_ips: BTreeSet<IpAddr> = self
            .connections
            .iter()
            .filter(|(_, c)| !c.outbound)
            .map(|(addr, _)| addr.ip())
            .collect();

        let mut valid = BTreeSet::new();
        let mut direct = BTreeSet::new();
        for addr in self.direct_peers.values() {
            let complete = self.complete(*addr);
            direct.insert(complete);
            // A peer given without a port is skipped if it already
            // connected to us.
            if addr.port() == 0 && inbound_ips.contains(&complete.ip()) {
                continue;
            }
            if !self.connections.contains_key(&complete) {
                valid.insert(complete);
            }
        }
        if self.discovery {
            for addr in self.topology.advertised_targets(&connected_names, self.port) {
                if !self.connections.contains_key(&addr) {
                    valid.insert(addr);
                }
            }
        }

        // Connected or no longer wanted, whatever the state of its dial.
        self.targets.retain(|addr, _| valid.contains(addr));
        for addr in &valid {
            if !self.targets.contains_key(addr) {
                self.targets.insert(*addr, Target::new(&self.backoff, now));
            }
        }

        let mut after = IDLE_WAKEUP;
        let mut due = Vec::new();
        for (addr, target) in self.targets.iter_mut() {
            if target.state == TargetState::Attempting {
                continue;
            }
            match target.try_after {
                None => {}
                Some(at) if at <= now => {
                    self.next_attempt_id += 1;
                    target.state = TargetState::Attempting;
                    target.attempt_count += 1;
                    target.attempt_id = self.next_attempt_id;
                    due.push((*addr, target.attempt_id));
                }
                Some(at) => after = after.min(at - now),
            }
        }
        for (addr, id) in due {
            self.attempt(addr, id, direct.contains(&addr));
        }
        after
    }

    fn attempt(&self, addr: SocketAddr, id: u64, direct: bool) {
        tracing::info!(%addr, direct, "attempting connection");
        let attempt = self.dialer.dial(addr, direct);
        let action_tx = self.action_tx.clone();
        tokio::spawn(
            async move {
                let result = attempt.await;
                let finished: Action =
                    Box::new(move |state| state.connection_aborted(addr, id, result));
                let _ = action_tx.send(finished);
            }
            .in_current_span(),
        );
    }

    fn connection_aborted(
        &mut self,
        addr: SocketAddr,
        id: u64,
        result: Result<(), AttemptError>,
    ) -> bool {
        let now = Instant::now();
        let backoff = self.backoff;
        let Some(target) = self.targets.get_mut(&addr) else {
            // Dropped while its dial ran, e.g. because it connected.
            tracing::debug!(%addr, "dial for a removed target ended");
            return true;
        };
        if target.state != TargetState::Attempting || target.attempt_id != id {
            tracing::debug!(%addr, "ignoring result of a stale dial");
            return false;
        }
        target.state = TargetState::Unconnected;
        match &result {
            Ok(()) => tracing::info!(%addr, "connection closed"),
            Err(e) => {
                tracing::info!(%addr, error = %e, "connection attempt ended");
                target.last_error = Some(e.to_string());
            }
        }
        match result {
            Err(e) if e.is_permanent() => target.next_try_never(),
            _ if target.try_after.is_some_and(|at| now > at + RESET_AFTER) => {
                target.next_try_now(&backoff, now)
            }
            _ => target.next_try_later(&backoff, now),
        }
        true
    }

    fn status(&self) -> ConnectionMakerStatus {
        ConnectionMakerStatus {
            direct_peers: self.direct_peers.keys().cloned().collect(),
            targets: self
                .targets
                .iter()
                .map(|(addr, t)| (*addr, t.clone()))
                .collect(),
            connections: self.connections.len(),
            taken_at: Instant::now(),
        }
    }
}

struct ConnectionMakerWorker {
    state: MakerState,
    action_rx: mpsc::UnboundedReceiver<Action>,
}

impl ConnectionMakerWorker {
    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let timer = tokio::time::sleep(IDLE_WAKEUP);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("connection maker shutting down");
                    return Ok(());
                }
                action = self.action_rx.recv() => {
                    let Some(action) = action else {
                        return Ok(());
                    };
                    if action(&mut self.state) {
                        let after = self.state.reconcile();
                        timer.as_mut().reset(Instant::now() + after);
                    }
                }
                () = &mut timer => {
                    let after = self.state.reconcile();
                    timer.as_mut().reset(Instant::now() + after);
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
