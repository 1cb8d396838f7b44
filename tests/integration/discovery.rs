use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use skein_mesh::{AttemptError, Backoff, ConnectionMaker, ConnectionMakerSettings, Dialer};
use tokio::sync::{broadcast, mpsc};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Connection maker driven by a gossiped peer table
// ══════════════════════════════════════════════════════════════════════════════

/// Records every attempt and holds it open until the test says otherwise,
/// the way a real dial future lives as long as its connection.
struct RecordingDialer {
    attempts: mpsc::UnboundedSender<(SocketAddr, bool)>,
    hangup: broadcast::Sender<()>,
}

impl Dialer for RecordingDialer {
    fn dial(&self, addr: SocketAddr, direct: bool) -> BoxFuture<'static, Result<(), AttemptError>> {
        let mut hangup = self.hangup.subscribe();
        let _ = self.attempts.send((addr, direct));
        async move {
            let _ = hangup.recv().await;
            Err(AttemptError::Other(anyhow::anyhow!("connection reset")))
        }
        .boxed()
    }
}

struct Maker {
    cm: ConnectionMaker,
    attempts: mpsc::UnboundedReceiver<(SocketAddr, bool)>,
    hangup: broadcast::Sender<()>,
    _shutdown: broadcast::Sender<()>,
}

fn maker(router: &Router, discovery: bool) -> Maker {
    let (attempts_tx, attempts) = mpsc::unbounded_channel();
    let (hangup, _) = broadcast::channel(4);
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let cm = ConnectionMaker::start(
        ConnectionMakerSettings {
            port: PORT,
            discovery,
            backoff: Backoff::default(),
        },
        Arc::new(RecordingDialer {
            attempts: attempts_tx,
            hangup: hangup.clone(),
        }),
        router.peers.clone(),
        shutdown_rx,
        tracing::info_span!("connection_maker", router = router.id),
    );
    Maker {
        cm,
        attempts,
        hangup,
        _shutdown: shutdown,
    }
}

/// Router 1 only knows router 2, but gossip tells it where router 3 is.
#[tokio::test(start_paused = true)]
async fn discovery_dials_peers_learned_from_gossip() {
    let mesh = Mesh::new(3);
    mesh.connect(1, 2);
    mesh.connect(2, 3);
    mesh.settle().await;

    let mut m = maker(mesh.router(1), true);
    m.cm.connection_created(addr(2), name(2), true);
    m.cm.refresh();

    let (dialled, direct) = m.attempts.recv().await.unwrap();
    assert_eq!(dialled, addr(3));
    assert!(!direct);

    let status = m.cm.status().await;
    assert!(status.contains(&format!("->[{}] trying (attempt 1)", addr(3))), "{status}");
}

/// Without discovery only configured peers are dialled, even though the
/// table knows where router 3 is.
#[tokio::test(start_paused = true)]
async fn direct_peers_only_without_discovery() {
    let mesh = Mesh::new(3);
    mesh.connect(2, 1);
    mesh.connect(3, 2);
    mesh.settle().await;

    let mut m = maker(mesh.router(1), false);
    m.cm.connection_created(SocketAddr::from(([10, 0, 0, 2], 40001)), name(2), false);
    m.cm.initiate_connections(vec!["10.0.0.9".to_string()], false).await;

    let (dialled, direct) = m.attempts.recv().await.unwrap();
    assert_eq!(dialled, SocketAddr::from(([10, 0, 0, 9], PORT)));
    assert!(direct);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(m.attempts.try_recv().is_err());
}

/// A failed attempt to a still-advertised peer is retried after backoff.
#[tokio::test(start_paused = true)]
async fn dropped_discovered_connection_is_retried() {
    let mesh = Mesh::new(3);
    mesh.connect(1, 2);
    mesh.connect(2, 3);
    mesh.settle().await;

    let mut m = maker(mesh.router(1), true);
    m.cm.connection_created(addr(2), name(2), true);
    m.cm.refresh();
    assert_eq!(m.attempts.recv().await.unwrap().0, addr(3));

    let _ = m.hangup.send(());
    let (again, _) = tokio::time::timeout(Duration::from_secs(10 * 60), m.attempts.recv())
        .await
        .expect("retry within the maximum interval")
        .unwrap();
    assert_eq!(again, addr(3));
}

/// Once router 1 is connected to router 3 itself, it stops advertising a
/// target for it.
#[tokio::test(start_paused = true)]
async fn connected_peers_are_not_targets() {
    let mesh = Mesh::new(3);
    mesh.connect(1, 2);
    mesh.connect(2, 3);
    mesh.connect(1, 3);
    mesh.settle().await;

    let mut m = maker(mesh.router(1), true);
    m.cm.connection_created(addr(2), name(2), true);
    m.cm.connection_created(addr(3), name(3), true);
    m.cm.refresh();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(m.attempts.try_recv().is_err());
    let status = m.cm.status_snapshot().await.unwrap();
    assert!(status.targets.is_empty());
    assert_eq!(status.connections, 2);
}
