//! Replication from a live store to radius-limited mirrors.

mod common;

use blockgraph_core::{
    config::GraphStoreConfig,
    nodekey::LinkKey,
    properties::{BlockPos, ChunkSectionPos},
    sync::{GraphMirror, ObserverId, SyncServer},
    world::GraphStore,
};
use common::{open_store, place_run, test_universe, visible_state, wire, wire_at};
use tempfile::TempDir;
use test_log::test;

fn deliver(server: &mut SyncServer, store: &mut GraphStore, id: ObserverId, mirror: &mut GraphMirror) {
    server.flush(store);
    for bytes in server.take_outbox(id) {
        mirror.receive(bytes).unwrap();
    }
}

/// Panics unless the mirror holds exactly what the store has inside the mirror's view.
fn assert_mirrors(store: &mut GraphStore, mirror: &GraphMirror) {
    let (nodes, links) = visible_state(store, mirror.center(), mirror.radius());
    let mirrored = mirror.nodes();
    assert_eq!(mirrored.len(), nodes.len(), "node count");
    for (node, id) in nodes.iter() {
        assert_eq!(mirror.graph_of(node), Some(*id), "owner of {node}");
    }
    assert!(mirrored.iter().all(|node| nodes.contains_key(node)));
    assert_eq!(mirror.links(), links);
}

#[test]
fn test_mirror_follows_structural_changes() {
    let dir = TempDir::new().unwrap();
    let universe = test_universe();
    let mut store = open_store(dir.path(), universe.clone(), GraphStoreConfig::default());
    place_run(&mut store, 0..5);

    let origin = ChunkSectionPos::new(0, 0, 0);
    let mut server = SyncServer::new();
    let observer = server.add_observer(&mut store, origin, 1);
    let mut mirror = GraphMirror::new(universe, origin, 1);
    deliver(&mut server, &mut store, observer, &mut mirror);
    assert_eq!(mirror.node_count(), 5);
    assert_mirrors(&mut store, &mirror);

    // grows through section 1 into section 2, which is out of view
    place_run(&mut store, 5..41);
    deliver(&mut server, &mut store, observer, &mut mirror);
    assert_eq!(mirror.node_count(), 32);
    assert_mirrors(&mut store, &mirror);

    store.remove_node(BlockPos::new(10, 0, 0), wire()).unwrap();
    deliver(&mut server, &mut store, observer, &mut mirror);
    assert_mirrors(&mut store, &mirror);

    assert!(store
        .disconnect_nodes(&wire_at(20, 0, 0), &wire_at(21, 0, 0), &LinkKey::empty())
        .unwrap());
    deliver(&mut server, &mut store, observer, &mut mirror);
    assert_mirrors(&mut store, &mirror);
    assert_ne!(
        mirror.graph_of(&wire_at(20, 0, 0)),
        mirror.graph_of(&wire_at(21, 0, 0))
    );

    store
        .connect_nodes(&wire_at(9, 0, 0), &wire_at(11, 0, 0), LinkKey::empty())
        .unwrap()
        .unwrap();
    deliver(&mut server, &mut store, observer, &mut mirror);
    assert_mirrors(&mut store, &mirror);
    assert_eq!(
        mirror.graph_of(&wire_at(0, 0, 0)),
        mirror.graph_of(&wire_at(20, 0, 0))
    );

    // the view moves one section past the end of the run
    let moved = ChunkSectionPos::new(2, 0, 0);
    assert!(server.move_observer(observer, moved, 1));
    mirror.set_view(moved, 1);
    deliver(&mut server, &mut store, observer, &mut mirror);
    assert!(mirror.graph_of(&wire_at(0, 0, 0)).is_none());
    assert!(mirror.graph_of(&wire_at(40, 0, 0)).is_some());
    assert_mirrors(&mut store, &mirror);
}

#[test]
fn test_late_observer_matches_early_one() {
    let dir = TempDir::new().unwrap();
    let universe = test_universe();
    let mut store = open_store(dir.path(), universe.clone(), GraphStoreConfig::default());
    let origin = ChunkSectionPos::new(0, 0, 0);
    let mut server = SyncServer::new();

    let early = server.add_observer(&mut store, origin, 1);
    let mut early_mirror = GraphMirror::new(universe.clone(), origin, 1);
    deliver(&mut server, &mut store, early, &mut early_mirror);
    assert_eq!(early_mirror.node_count(), 0);

    place_run(&mut store, -20..20);
    store.remove_node(BlockPos::new(-3, 0, 0), wire()).unwrap();
    store.add_node(BlockPos::new(0, 1, 0), wire(), None).unwrap();
    deliver(&mut server, &mut store, early, &mut early_mirror);

    let late = server.add_observer(&mut store, origin, 1);
    let mut late_mirror = GraphMirror::new(universe, origin, 1);
    deliver(&mut server, &mut store, late, &mut late_mirror);
    // the early mirror gets nothing new from that flush
    assert!(server.take_outbox(early).is_empty());

    assert_mirrors(&mut store, &early_mirror);
    assert_mirrors(&mut store, &late_mirror);
    assert_eq!(early_mirror.nodes(), late_mirror.nodes());
    assert_eq!(early_mirror.links(), late_mirror.links());
}

#[test]
fn test_removed_observer_gets_nothing() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(dir.path(), test_universe(), GraphStoreConfig::default());
    let mut server = SyncServer::new();
    let observer = server.add_observer(&mut store, ChunkSectionPos::new(0, 0, 0), 0);
    server.flush(&mut store);
    assert_eq!(server.known_sections(observer).map(|known| known.len()), Some(1));

    assert!(server.remove_observer(observer));
    place_run(&mut store, 0..3);
    server.flush(&mut store);
    assert!(server.take_outbox(observer).is_empty());
    assert!(server.observer_ids().is_empty());
}
