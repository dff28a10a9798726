//! Saving, unloading, reloading and repairing stored graphs.

mod common;

use blockgraph_core::{
    config::{GraphStoreConfig, SaveMode, TomlConfigProvider},
    event::GraphEvent,
    properties::{BlockPos, ChunkSectionPos},
    world::{GraphStore, RebuildListener, RebuildStatus},
};
use common::{assert_consistent, open_store, place_run, tally_of, test_universe, wire, wire_at};
use parking_lot::Mutex;
use std::{path::Path, sync::Arc};
use tempfile::TempDir;
use test_log::test;

fn config(save_mode: SaveMode) -> GraphStoreConfig {
    GraphStoreConfig {
        save_mode,
        max_chunk_age: 2,
        ..Default::default()
    }
}

fn graph_files(root: &Path) -> usize {
    std::fs::read_dir(root.join("graphs"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

fn graph_file(root: &Path, id: u64) -> std::path::PathBuf {
    root.join("graphs").join(format!("{id:016X}.dat"))
}

#[test]
fn test_graphs_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let (id, tally) = {
        let mut store = open_store(dir.path(), test_universe(), GraphStoreConfig::default());
        place_run(&mut store, 0..3);
        store
            .add_node(BlockPos::new(0, 0, 1), wire(), None)
            .unwrap();
        let id = store.find_node(&wire_at(0, 0, 0)).unwrap().graph_id;
        let tally = tally_of(store.get_graph(id).unwrap());
        store.close().unwrap();
        (id, tally)
    };
    assert!(graph_file(dir.path(), id).exists());
    assert!(dir.path().join("state.dat").exists());

    let mut store = open_store(dir.path(), test_universe(), GraphStoreConfig::default());
    assert!(store.loaded_graph_ids().is_empty(), "graphs load lazily");
    let handle = store.find_node(&wire_at(2, 0, 0)).unwrap();
    assert_eq!(handle.graph_id, id);

    let graph = store.get_graph(id).unwrap();
    assert_eq!(graph.size(), 4);
    assert_eq!(graph.link_count(), 3);
    assert_eq!(tally_of(graph), tally);
    assert_consistent(&store);
}

#[test]
fn test_id_allocation_resumes_after_reopen() {
    let dir = TempDir::new().unwrap();
    let last = {
        let mut store = open_store(dir.path(), test_universe(), GraphStoreConfig::default());
        for x in [0, 10, 20] {
            store.add_node(BlockPos::new(x, 0, 0), wire(), None).unwrap();
        }
        let last = store.loaded_graph_ids().into_iter().max().unwrap();
        // the newest graph is gone, but its id must stay retired
        store.remove_node(BlockPos::new(20, 0, 0), wire()).unwrap();
        store.close().unwrap();
        last
    };

    let mut store = open_store(dir.path(), test_universe(), GraphStoreConfig::default());
    let next = store.add_node(BlockPos::new(30, 0, 0), wire(), None).unwrap().graph_id;
    assert!(next > last);
    store.close().unwrap();

    // without the state file, the highest id on disk is the floor
    std::fs::remove_file(dir.path().join("state.dat")).unwrap();
    let mut store = open_store(dir.path(), test_universe(), GraphStoreConfig::default());
    let after_rescan = store.add_node(BlockPos::new(40, 0, 0), wire(), None).unwrap().graph_id;
    assert!(after_rescan > next);
}

#[test]
fn test_corrupt_graph_file_is_deleted() {
    let dir = TempDir::new().unwrap();
    let id = {
        let mut store = open_store(dir.path(), test_universe(), GraphStoreConfig::default());
        place_run(&mut store, 0..2);
        let id = store.find_node(&wire_at(0, 0, 0)).unwrap().graph_id;
        store.close().unwrap();
        id
    };
    std::fs::write(graph_file(dir.path(), id), b"BGGR not really a graph").unwrap();

    let mut store = open_store(dir.path(), test_universe(), GraphStoreConfig::default());
    assert!(store.get_graph(id).is_none());
    assert!(!graph_file(dir.path(), id).exists());
    assert!(store.find_node(&wire_at(0, 0, 0)).is_none());
    assert!(!store.all_graph_ids().unwrap().contains(&id));

    // the position is usable again
    let fresh = store.add_node(BlockPos::new(0, 0, 0), wire(), None).unwrap();
    assert_ne!(fresh.graph_id, id);
}

#[test]
fn test_idle_graphs_unload_and_reload() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(dir.path(), test_universe(), config(SaveMode::OnUnload));
    store.set_event_recording(true);
    let id = store.add_node(BlockPos::new(0, 0, 0), wire(), None).unwrap().graph_id;
    assert!(!graph_file(dir.path(), id).exists());

    for _ in 0..5 {
        store.tick();
    }
    assert!(store.loaded_graph_ids().is_empty());
    assert!(graph_file(dir.path(), id).exists(), "saved on unload");
    assert!(store.drain_events().contains(&GraphEvent::Unloading(id)));

    assert_eq!(store.get_graph(id).map(|graph| graph.size()), Some(1));
    assert_eq!(store.loaded_graph_ids(), vec![id]);
}

#[test]
fn test_host_loaded_columns_keep_graphs() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(dir.path(), test_universe(), config(SaveMode::OnUnload));
    let pos = BlockPos::new(0, 0, 0);
    store.on_world_chunk_load(pos.section().column());
    let id = store.add_node(pos, wire(), None).unwrap().graph_id;

    for _ in 0..10 {
        store.tick();
    }
    assert_eq!(store.loaded_graph_ids(), vec![id]);

    store.on_world_chunk_unload(pos.section().column());
    for _ in 0..5 {
        store.tick();
    }
    assert!(store.loaded_graph_ids().is_empty());
}

#[test]
fn test_save_modes_pace_writes() {
    let separate = |store: &mut GraphStore, count: i32| {
        for i in 0..count {
            store.add_node(BlockPos::new(i * 3, 0, 0), wire(), None).unwrap();
        }
    };

    let dir = TempDir::new().unwrap();
    let mut store = open_store(dir.path(), test_universe(), config(SaveMode::OnUnload));
    separate(&mut store, 4);
    store.tick();
    assert_eq!(graph_files(dir.path()), 0);
    store.save_all().unwrap();
    assert_eq!(graph_files(dir.path()), 4);

    let dir = TempDir::new().unwrap();
    let mut store = open_store(dir.path(), test_universe(), config(SaveMode::Immediate));
    separate(&mut store, 4);
    store.tick();
    assert_eq!(graph_files(dir.path()), 4);

    let dir = TempDir::new().unwrap();
    let mut store = open_store(dir.path(), test_universe(), config(SaveMode::Incremental));
    separate(&mut store, 20);
    store.tick();
    assert_eq!(graph_files(dir.path()), 2, "a tenth of the dirty set per tick");
    store.tick();
    assert_eq!(graph_files(dir.path()), 4);
}

#[test]
fn test_remove_empty_graphs_sweeps_disk() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(dir.path(), test_universe(), GraphStoreConfig::default());
    place_run(&mut store, 0..2);
    store.save_all().unwrap();
    let live = store.find_node(&wire_at(0, 0, 0)).unwrap().graph_id;

    // a valid but empty graph record left behind on disk
    let empty_id = live + 100;
    let empty = blockgraph_core::codec::GraphRecord::default();
    blockgraph_core::codec::write_framed(
        &graph_file(dir.path(), empty_id),
        blockgraph_core::codec::GRAPH_MAGIC,
        &empty,
    )
    .unwrap();

    let removed = store.remove_empty_graphs().unwrap();
    assert_eq!(removed, vec![empty_id]);
    assert!(!graph_file(dir.path(), empty_id).exists());
    assert!(store.get_graph(live).is_some());
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl RebuildListener for Recorder {
    fn on_begin(&mut self, graph_count: usize, chunk_count: usize) {
        self.0.lock().push(format!("begin {graph_count} {chunk_count}"));
    }

    fn on_progress(&mut self, done: usize, total: usize) {
        self.0.lock().push(format!("progress {done}/{total}"));
    }

    fn on_complete(&mut self, done: usize) {
        self.0.lock().push(format!("complete {done}"));
    }

    fn on_already_running(&mut self, progress: f32) {
        self.0.lock().push(format!("running {progress:.1}"));
    }
}

#[test]
fn test_rebuild_restores_a_cleared_index() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(
        dir.path(),
        test_universe(),
        GraphStoreConfig {
            max_graphs_rebuilt_per_tick: 1,
            ..Default::default()
        },
    );
    place_run(&mut store, 0..3);
    store.add_node(BlockPos::new(8, 8, 8), wire(), None).unwrap();
    let section = ChunkSectionPos::new(0, 0, 0);
    assert_eq!(store.graph_ids_in_section(section).len(), 2);

    let log = Recorder::default();
    let status = store
        .rebuild_chunks([section], Box::new(log.clone()))
        .unwrap();
    assert_eq!(status, RebuildStatus::Started);
    assert!(store.find_node(&wire_at(0, 0, 0)).is_none(), "index was cleared");

    let second = store
        .rebuild_chunks([section], Box::new(log.clone()))
        .unwrap();
    assert_eq!(second, RebuildStatus::AlreadyRunning(0.0));

    let mut ticks = 0;
    while store.rebuild_progress().is_some() {
        store.tick();
        ticks += 1;
        assert!(ticks < 10, "rebuild never finished");
    }
    assert_eq!(ticks, 2);
    assert_eq!(
        *log.0.lock(),
        vec!["begin 2 1", "running 0.0", "complete 2"]
    );
    assert_eq!(store.graph_ids_in_section(section).len(), 2);
    assert!(store.find_node(&wire_at(0, 0, 0)).is_some());
    assert!(store.find_node(&wire_at(8, 8, 8)).is_some());
}

#[test]
fn test_store_config_from_toml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blockgraph.toml");
    std::fs::write(&path, "save_mode = \"immediate\"\nmax_chunk_age = 5\n").unwrap();

    let config = TomlConfigProvider::new(path).get_store_config().unwrap();
    assert_eq!(config.save_mode, SaveMode::Immediate);

    let mut store = open_store(&dir.path().join("world"), test_universe(), config);
    store.add_node(BlockPos::new(0, 0, 0), wire(), None).unwrap();
    store.tick();
    assert_eq!(graph_files(&dir.path().join("world")), 1);
}
