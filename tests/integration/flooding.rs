use std::collections::{BTreeMap, VecDeque};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Broadcast flooding
// ══════════════════════════════════════════════════════════════════════════════

/// Flood one broadcast from `origin`, each router passing it on to the
/// hops its own routes give for that origin. Returns how many copies
/// every router received.
async fn flood(mesh: &Mesh, origin: u8) -> BTreeMap<u8, usize> {
    let mut received: BTreeMap<u8, usize> = mesh.routers.values().map(|r| (r.id, 0)).collect();
    let mut queue = VecDeque::from([origin]);
    let mut steps = 0;
    while let Some(at) = queue.pop_front() {
        for hop in mesh.router(at).routes.broadcast(name(origin)).await {
            let id = hop.to_bytes()[5];
            *received.entry(id).or_default() += 1;
            queue.push_back(id);
            steps += 1;
            assert!(steps < 1000, "broadcast from {origin} loops");
        }
    }
    received
}

fn assert_exactly_once(received: &BTreeMap<u8, usize>, origin: u8) {
    for (id, count) in received {
        let expected = usize::from(*id != origin);
        assert_eq!(*count, expected, "router {id} got {count} copies of {origin}'s broadcast");
    }
}

/// Ring with chords: plenty of redundant paths, still one copy each.
#[tokio::test]
async fn broadcast_reaches_everyone_exactly_once() {
    let mesh = Mesh::new(8);
    for i in 1..=8 {
        mesh.connect(i, i % 8 + 1);
    }
    mesh.connect(1, 5);
    mesh.connect(2, 7);
    mesh.connect(3, 6);
    mesh.settle().await;

    for origin in 1..=8 {
        assert_exactly_once(&flood(&mesh, origin).await, origin);
    }
}

/// Full mesh: the origin sends to everyone directly and nobody relays.
#[tokio::test]
async fn full_mesh_broadcast_is_one_hop() {
    let mesh = Mesh::new(5);
    for a in 1..=5 {
        for b in a + 1..=5 {
            mesh.connect(a, b);
        }
    }
    mesh.settle().await;

    let hops = mesh.router(3).routes.broadcast(name(3)).await;
    assert_eq!(hops, vec![name(1), name(2), name(4), name(5)]);
    for relay in [1, 2, 4, 5] {
        assert!(mesh.router(relay).routes.broadcast(name(3)).await.is_empty());
    }
    assert_exactly_once(&flood(&mesh, 3).await, 3);
}

/// After a partition each side still floods exactly once within itself.
#[tokio::test]
async fn broadcast_stays_inside_a_partition() {
    let mesh = Mesh::new(6);
    for i in 1..6 {
        mesh.connect(i, i + 1);
    }
    mesh.connect(1, 3);
    mesh.connect(4, 6);
    mesh.settle().await;

    mesh.disconnect(3, 4);
    mesh.settle().await;

    let received = flood(&mesh, 2).await;
    assert_eq!(received[&1], 1);
    assert_eq!(received[&3], 1);
    for far in 4..=6 {
        assert_eq!(received[&far], 0);
    }
}
