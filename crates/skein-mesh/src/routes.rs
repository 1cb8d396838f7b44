//! Routing tables and the actor that keeps them current.
//!
//! Lookups read the tables directly. Everything that computes goes through
//! a single task so recalculations are serialized and coalesced:
//!
//!   recalculate()          ── mpsc(1), try_send ──┐
//!   ensure_recalculated()  ── oneshot waiters ────┼──▶ routes task
//!   broadcast cache misses ── boxed actions ──────┘
//!
//! The task polls the recalculate channel first, so a waiter is only
//! answered once every recalculation requested before it has run.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use rand::seq::SliceRandom;
use skein_core::name::{PeerName, UNKNOWN_PEER_NAME};
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::peer::LocalLink;
use crate::peers::Peers;

type Action<L> = Box<dyn FnOnce(&RoutesState<L>) + Send>;

#[derive(Default)]
struct Tables {
    unicast: BTreeMap<PeerName, PeerName>,
    unicast_all: BTreeMap<PeerName, PeerName>,
    broadcast: HashMap<PeerName, Vec<PeerName>>,
    broadcast_all: HashMap<PeerName, Vec<PeerName>>,
}

impl Tables {
    fn initial(ourself: PeerName) -> Self {
        let mut tables = Tables::default();
        tables.unicast.insert(ourself, UNKNOWN_PEER_NAME);
        tables.unicast_all.insert(ourself, UNKNOWN_PEER_NAME);
        tables.broadcast.insert(ourself, Vec::new());
        tables.broadcast_all.insert(ourself, Vec::new());
        tables
    }

    fn broadcast_table(&self, established: bool) -> &HashMap<PeerName, Vec<PeerName>> {
        if established {
            &self.broadcast
        } else {
            &self.broadcast_all
        }
    }
}

struct RoutesState<L> {
    ourself: PeerName,
    peers: Arc<Peers<L>>,
    tables: RwLock<Tables>,
    generation: AtomicU64,
}

impl<L: LocalLink> RoutesState<L> {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn calculate(&self) {
        let fresh = {
            let table = self.peers.read();
            let (_, unicast) = table.routes(self.ourself, None, true);
            let (_, unicast_all) = table.routes(self.ourself, None, false);
            let mut fresh = Tables {
                unicast,
                unicast_all,
                ..Tables::default()
            };
            fresh
                .broadcast
                .insert(self.ourself, table.broadcast_hops(self.ourself, true));
            fresh
                .broadcast_all
                .insert(self.ourself, table.broadcast_hops(self.ourself, false));
            fresh
        };
        let reachable = fresh.unicast.len();
        *self.tables.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(generation, reachable, "routes recalculated");
    }

    fn cached_broadcast(&self, origin: PeerName, established: bool) -> Option<Vec<PeerName>> {
        self.read().broadcast_table(established).get(&origin).cloned()
    }

    /// Runs on the routes task. Replies before storing so the caller is not
    /// kept waiting on the table write lock.
    fn resolve_broadcast(&self, origin: PeerName, established: bool, reply: oneshot::Sender<Vec<PeerName>>) {
        if let Some(hops) = self.cached_broadcast(origin, established) {
            let _ = reply.send(hops);
            return;
        }
        let hops = self.peers.read().broadcast_hops(origin, established);
        let _ = reply.send(hops.clone());
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if established {
            tables.broadcast.insert(origin, hops);
        } else {
            tables.broadcast_all.insert(origin, hops);
        }
    }
}

/// Handle to the routing tables. Cheap to clone; the routes task exits
/// once every handle is dropped.
pub struct Routes<L> {
    state: Arc<RoutesState<L>>,
    recalc_tx: mpsc::Sender<()>,
    wait_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    action_tx: mpsc::UnboundedSender<Action<L>>,
}

impl<L> Clone for Routes<L> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            recalc_tx: self.recalc_tx.clone(),
            wait_tx: self.wait_tx.clone(),
            action_tx: self.action_tx.clone(),
        }
    }
}

impl<L: LocalLink> Routes<L> {
    /// Spawn the routes task onto the current runtime.
    pub fn start(peers: Arc<Peers<L>>, span: tracing::Span) -> Self {
        let ourself = peers.ourself();
        let state = Arc::new(RoutesState {
            ourself,
            peers,
            tables: RwLock::new(Tables::initial(ourself)),
            generation: AtomicU64::new(0),
        });
        let (recalc_tx, recalc_rx) = mpsc::channel(1);
        let (wait_tx, wait_rx) = mpsc::unbounded_channel();
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(state.clone(), recalc_rx, wait_rx, action_rx).instrument(span));
        Self {
            state,
            recalc_tx,
            wait_tx,
            action_tx,
        }
    }

    pub fn ourself(&self) -> PeerName {
        self.state.ourself
    }

    /// Next hop towards `name` over established symmetric connections.
    pub fn unicast(&self, name: PeerName) -> Option<PeerName> {
        self.state.read().unicast.get(&name).copied()
    }

    /// Next hop towards `name` over any connection.
    pub fn unicast_all(&self, name: PeerName) -> Option<PeerName> {
        self.state.read().unicast_all.get(&name).copied()
    }

    pub async fn broadcast(&self, origin: PeerName) -> Vec<PeerName> {
        self.lookup_broadcast(origin, true).await
    }

    pub async fn broadcast_all(&self, origin: PeerName) -> Vec<PeerName> {
        self.lookup_broadcast(origin, false).await
    }

    /// For data-plane threads outside the runtime. Must not be called
    /// from async context.
    pub fn blocking_broadcast(&self, origin: PeerName) -> Vec<PeerName> {
        self.blocking_lookup_broadcast(origin, true)
    }

    pub fn blocking_broadcast_all(&self, origin: PeerName) -> Vec<PeerName> {
        self.blocking_lookup_broadcast(origin, false)
    }

    async fn lookup_broadcast(&self, origin: PeerName, established: bool) -> Vec<PeerName> {
        if let Some(hops) = self.state.cached_broadcast(origin, established) {
            return hops;
        }
        match self.request_broadcast(origin, established) {
            Some(rx) => rx.await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn blocking_lookup_broadcast(&self, origin: PeerName, established: bool) -> Vec<PeerName> {
        if let Some(hops) = self.state.cached_broadcast(origin, established) {
            return hops;
        }
        match self.request_broadcast(origin, established) {
            Some(rx) => rx.blocking_recv().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn request_broadcast(
        &self,
        origin: PeerName,
        established: bool,
    ) -> Option<oneshot::Receiver<Vec<PeerName>>> {
        let (tx, rx) = oneshot::channel();
        let action: Action<L> =
            Box::new(move |state| state.resolve_broadcast(origin, established, tx));
        self.action_tx.send(action).ok().map(|()| rx)
    }

    /// Up to `floor(log2(n))` distinct next hops, `n` being the number of
    /// peers we can reach at all. Each destination is equally likely to
    /// contribute its hop, so neighbours that carry more of the mesh are
    /// picked more often.
    pub fn random_neighbours(&self, except: PeerName) -> Vec<PeerName> {
        let (mut hops, count) = {
            let tables = self.state.read();
            let count = tables.unicast_all.len().checked_ilog2().unwrap_or(0) as usize;
            let hops: Vec<PeerName> = tables
                .unicast_all
                .values()
                .copied()
                .filter(|hop| !hop.is_unknown() && *hop != except)
                .collect();
            (hops, count)
        };
        hops.shuffle(&mut rand::thread_rng());
        let mut picked = Vec::with_capacity(count);
        for hop in hops {
            if picked.len() == count {
                break;
            }
            if !picked.contains(&hop) {
                picked.push(hop);
            }
        }
        picked
    }

    /// Request a recalculation. Never blocks; requests made while one is
    /// already pending are folded into it.
    pub fn recalculate(&self) {
        let _ = self.recalc_tx.try_send(());
    }

    /// Wait until every recalculation requested before this call has run.
    pub async fn ensure_recalculated(&self) {
        let (tx, rx) = oneshot::channel();
        if self.wait_tx.send(tx).is_ok() {
            let _ = rx.await;
        }
    }

    /// Completed recalculations since start.
    pub fn generation(&self) -> u64 {
        self.state.generation.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> String {
        let tables = self.state.read();
        let mut out = String::from("unicast:\n");
        for (name, hop) in &tables.unicast {
            let _ = writeln!(out, "{name} -> {hop}");
        }
        out.push_str("broadcast:\n");
        let mut origins: Vec<_> = tables.broadcast.iter().collect();
        origins.sort_by_key(|(origin, _)| **origin);
        for (origin, hops) in origins {
            let _ = writeln!(out, "{origin} -> {hops:?}");
        }
        out
    }
}

async fn run<L: LocalLink>(
    state: Arc<RoutesState<L>>,
    mut recalc_rx: mpsc::Receiver<()>,
    mut wait_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    mut action_rx: mpsc::UnboundedReceiver<Action<L>>,
) {
    loop {
        tokio::select! {
            biased;

            msg = recalc_rx.recv() => match msg {
                Some(()) => state.calculate(),
                None => break,
            },

            Some(waiter) = wait_rx.recv() => {
                let _ = waiter.send(());
            }

            Some(action) = action_rx.recv() => action(&*state),
        }
    }
    tracing::debug!("routes task stopped");
}
