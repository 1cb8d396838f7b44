use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Topology gossip and unicast routes
// ══════════════════════════════════════════════════════════════════════════════

/// A line of five routers: every router learns every other one, and the
/// next hop towards either end is the adjacent router on that side.
#[tokio::test]
async fn line_converges_with_adjacent_next_hops() {
    let mesh = Mesh::new(5);
    for i in 1..5 {
        mesh.connect(i, i + 1);
    }
    mesh.settle().await;

    for router in mesh.routers.values() {
        assert_eq!(router.peers.names().len(), 5, "router {} is missing peers", router.id);
    }
    let first = mesh.router(1);
    assert_eq!(first.routes.unicast(name(5)), Some(name(2)));
    assert_eq!(first.routes.unicast(name(2)), Some(name(2)));
    let middle = mesh.router(3);
    assert_eq!(middle.routes.unicast(name(1)), Some(name(2)));
    assert_eq!(middle.routes.unicast(name(5)), Some(name(4)));
    assert_eq!(middle.routes.unicast(name(3)), None);
}

/// Every router computes the same table from the same graph, so the path a
/// frame takes through a ring never loops.
#[tokio::test]
async fn ring_paths_terminate() {
    let mesh = Mesh::new(6);
    for i in 1..=6 {
        mesh.connect(i, i % 6 + 1);
    }
    mesh.settle().await;

    for src in 1..=6u8 {
        for dst in 1..=6u8 {
            if src == dst {
                continue;
            }
            let mut at = src;
            let mut hops = 0;
            while at != dst {
                let hop = mesh
                    .router(at)
                    .routes
                    .unicast(name(dst))
                    .unwrap_or_else(|| panic!("{at} has no route to {dst}"));
                at = hop.to_bytes()[5];
                hops += 1;
                assert!(hops <= 3, "path {src} -> {dst} is too long");
            }
        }
    }
}

/// Cutting a link in a line partitions the mesh: the far side becomes
/// unreachable and is garbage collected once the change has spread.
#[tokio::test]
async fn partition_collects_unreachable_peers() {
    let mesh = Mesh::new(4);
    for i in 1..4 {
        mesh.connect(i, i + 1);
    }
    mesh.settle().await;
    assert_eq!(mesh.router(1).routes.unicast(name(4)), Some(name(2)));

    mesh.disconnect(2, 3);
    mesh.settle().await;

    let left = mesh.router(1);
    assert_eq!(left.routes.unicast(name(4)), None);
    assert_eq!(left.routes.unicast(name(3)), None);
    let mut names = left.peers.names();
    names.sort();
    assert_eq!(names, vec![name(1), name(2)]);
    assert_eq!(mesh.router(4).peers.names().len(), 2);
}

/// A link added later is picked up as a shortcut.
#[tokio::test]
async fn new_link_shortens_routes() {
    let mesh = Mesh::new(4);
    for i in 1..4 {
        mesh.connect(i, i + 1);
    }
    mesh.settle().await;
    assert_eq!(mesh.router(1).routes.unicast(name(4)), Some(name(2)));

    mesh.connect(1, 4);
    mesh.settle().await;
    assert_eq!(mesh.router(1).routes.unicast(name(4)), Some(name(4)));
    assert_eq!(mesh.router(4).routes.unicast(name(1)), Some(name(1)));
}

/// Unestablished links carry gossip but not unicast traffic.
#[tokio::test]
async fn unicast_needs_established_links_at_both_ends() {
    let mesh = Mesh::new(3);
    mesh.connect(1, 2);
    mesh.connect(2, 3);
    mesh.settle().await;
    assert_eq!(mesh.router(1).routes.unicast(name(3)), Some(name(2)));

    let link = mesh.router(3).peers.local_connection(name(2)).unwrap();
    link.set_established(false);
    // The flag change only travels once our version moves.
    assert!(mesh.router(3).peers.connection_established(name(2), link.uid()));
    mesh.settle().await;

    let first = mesh.router(1);
    assert_eq!(first.routes.unicast(name(3)), None);
    assert_eq!(first.routes.unicast_all(name(3)), Some(name(2)));
}

/// A duplicate link between the same pair is resolved the same way at
/// both ends, and the loser is told to shut down.
#[tokio::test]
async fn duplicate_links_lose_consistently() {
    let mesh = Mesh::new(2);
    mesh.connect(1, 2);
    let first = mesh.router(1).peers.local_connection(name(2)).unwrap();
    first.set_established(false);

    let replacement = std::sync::Arc::new(SimLink::new(name(2), addr(2), true, 0));
    mesh.router(1).peers.fetch_with_default(name(2), uid(2)).unwrap();
    mesh.router(1)
        .peers
        .add_local_connection(replacement.clone(), 0)
        .unwrap();

    assert_eq!(first.shutdown_reason().as_deref(), Some("duplicate connection"));
    let current = mesh.router(1).peers.local_connection(name(2)).unwrap();
    assert_eq!(current.uid(), 0);
}
