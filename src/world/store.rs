use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};
use walkdir::WalkDir;

use super::{
    chunk::KeyLookup,
    pending::PendingSet,
    rebuild::{ChunkRebuild, RebuildListener, RebuildStatus},
    region::RegionStore,
    timer::UnloadTimer,
};
use crate::{
    codec::{read_framed, write_framed, GraphRecord, StateRecord, GRAPH_MAGIC, STATE_MAGIC},
    config::{GraphStoreConfig, SaveMode},
    entity::NodeEntity,
    error::BlockGraphError,
    event::GraphEvent,
    graph::{BlockGraph, GraphHost, LinkHandle, NodeHandle},
    nodekey::{HalfLink, LinkKey, NodePos, NodeValue},
    properties::{BlockPos, ChunkPos, ChunkSectionPos},
    sync::{ChunkSnapshot, GraphDelta, SyncMessage},
    universe::{GraphUniverse, NodeView},
};

const GRAPH_DIR: &str = "graphs";
const REGION_DIR: &str = "regions";
const STATE_FILE: &str = "state.dat";

/// Everything a graph reports to while it changes: the spatial index, unload timers, dirty
/// tracking, deferred callbacks and recorded events/deltas.
struct StoreState {
    universe: Arc<GraphUniverse>,
    regions: RegionStore,
    graph_timer: UnloadTimer<ChunkSectionPos>,
    unsaved: PendingSet<u64>,
    callbacks: PendingSet<NodePos>,
    validate: HashMap<NodePos, bool>,
    events: Option<Vec<GraphEvent>>,
    deltas: Option<Vec<GraphDelta>>,
}

impl StoreState {
    fn emit(&mut self, event: GraphEvent) {
        tracing::trace!("[GraphStore] {event}");
        if let Some(events) = self.events.as_mut() {
            events.push(event);
        }
    }

    fn touch(&mut self, graph: &BlockGraph) {
        for section in graph.sections() {
            self.graph_timer.on_chunk_use(section);
        }
    }
}

impl GraphHost for StoreState {
    fn universe(&self) -> &GraphUniverse {
        &self.universe
    }

    fn put_graph_with_node(&mut self, graph_id: u64, node: &NodePos) {
        self.regions.put_graph_with_node(graph_id, node);
        self.graph_timer.on_chunk_use(node.pos.section());
    }

    fn remove_graph_with_node(&mut self, graph_id: u64, node: &NodePos) {
        self.regions.remove_graph_with_node(graph_id, node);
    }

    fn remove_graph_in_pos(&mut self, graph_id: u64, pos: BlockPos) {
        self.regions.remove_graph_in_pos(graph_id, pos);
    }

    fn remove_graph_in_chunk(&mut self, graph_id: u64, section: ChunkSectionPos) {
        self.regions.remove_graph(section, graph_id);
    }

    fn schedule_callback(&mut self, node: &NodePos, validate: bool) {
        self.callbacks.insert(node.clone());
        *self.validate.entry(node.clone()).or_insert(false) |= validate;
    }

    fn mark_dirty(&mut self, graph_id: u64) {
        self.unsaved.insert(graph_id);
    }

    fn records_deltas(&self) -> bool {
        self.deltas.is_some()
    }

    fn push_delta(&mut self, delta: GraphDelta) {
        if let Some(deltas) = self.deltas.as_mut() {
            deltas.push(delta);
        }
    }
}

/// All block graphs of one world.
///
/// Graphs are loaded from `root/graphs` on first reference and unloaded once every section
/// they occupy has been idle for [`GraphStoreConfig::max_chunk_age`] ticks. The spatial index
/// lives in `root/regions`; `root/state.dat` remembers the last allocated graph id.
///
/// The store is single-threaded: all state changes happen inside its methods, and the deferred
/// work queued by them runs on [`tick`](Self::tick).
pub struct GraphStore {
    root: PathBuf,
    graph_dir: PathBuf,
    universe: Arc<GraphUniverse>,
    config: GraphStoreConfig,
    graphs: BTreeMap<u64, BlockGraph>,
    state: StoreState,
    update_nodes: PendingSet<BlockPos>,
    update_connections: PendingSet<BlockPos>,
    rebuild: Option<ChunkRebuild>,
    last_allocated_graph_id: u64,
    closed: bool,
}

fn graph_path(graph_dir: &Path, id: u64) -> PathBuf {
    graph_dir.join(format!("{id:016X}.dat"))
}

/// Advances `last` to the next id that is neither zero nor `taken`.
fn next_graph_id(last: &mut u64, taken: impl Fn(u64) -> bool) -> u64 {
    loop {
        *last = last.wrapping_add(1);
        if *last != 0 && !taken(*last) {
            return *last;
        }
    }
}

fn graph_ids_on_disk(graph_dir: &Path) -> Result<BTreeSet<u64>, BlockGraphError> {
    let pattern = Regex::new(r"^[0-9A-Fa-f]{16}\.dat$")?;
    let mut ids = BTreeSet::new();
    if !graph_dir.exists() {
        return Ok(ids);
    }
    for entry in WalkDir::new(graph_dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !entry.file_type().is_file() || !pattern.is_match(name) {
            continue;
        }
        if let Ok(id) = u64::from_str_radix(&name[..16], 16) {
            ids.insert(id);
        }
    }
    Ok(ids)
}

impl GraphStore {
    pub fn open(
        root: impl Into<PathBuf>,
        universe: Arc<GraphUniverse>,
        config: GraphStoreConfig,
    ) -> Result<Self, BlockGraphError> {
        let root = root.into();
        let graph_dir = root.join(GRAPH_DIR);
        std::fs::create_dir_all(&graph_dir)?;
        std::fs::create_dir_all(root.join(REGION_DIR))?;

        let last_allocated_graph_id =
            match read_framed::<StateRecord>(&root.join(STATE_FILE), STATE_MAGIC) {
                Ok(Some(state)) => state.last_allocated_graph_id,
                Ok(None) => graph_ids_on_disk(&graph_dir)?.last().copied().unwrap_or(0),
                Err(err) => {
                    tracing::error!(
                        "[GraphStore::open] Error reading world state: {err}. Rescanning graph files."
                    );
                    graph_ids_on_disk(&graph_dir)?.last().copied().unwrap_or(0)
                }
            };

        let regions = RegionStore::new(root.join(REGION_DIR), universe.clone(), &config);
        tracing::debug!(
            "[GraphStore::open] Opened {} (last allocated graph id {last_allocated_graph_id:016X})",
            root.display()
        );
        Ok(GraphStore {
            state: StoreState {
                universe: universe.clone(),
                regions,
                graph_timer: UnloadTimer::new(config.max_chunk_age),
                unsaved: PendingSet::new(),
                callbacks: PendingSet::new(),
                validate: HashMap::new(),
                events: None,
                deltas: None,
            },
            root,
            graph_dir,
            universe,
            config,
            graphs: BTreeMap::new(),
            update_nodes: PendingSet::new(),
            update_connections: PendingSet::new(),
            rebuild: None,
            last_allocated_graph_id,
            closed: false,
        })
    }

    pub fn universe(&self) -> &Arc<GraphUniverse> {
        &self.universe
    }

    pub fn config(&self) -> &GraphStoreConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), BlockGraphError> {
        if self.closed {
            return Err(BlockGraphError::Closed);
        }
        Ok(())
    }

    // --- events and deltas -------------------------------------------------------------------

    pub fn set_event_recording(&mut self, enabled: bool) {
        match (enabled, self.state.events.is_some()) {
            (true, false) => self.state.events = Some(Vec::new()),
            (false, true) => self.state.events = None,
            _ => {}
        }
    }

    pub fn drain_events(&mut self) -> Vec<GraphEvent> {
        self.state
            .events
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Turns recording of sync deltas on or off. Turned on by
    /// [`SyncServer::add_observer`](crate::sync::SyncServer::add_observer).
    pub fn set_delta_recording(&mut self, enabled: bool) {
        match (enabled, self.state.deltas.is_some()) {
            (true, false) => self.state.deltas = Some(Vec::new()),
            (false, true) => self.state.deltas = None,
            _ => {}
        }
    }

    pub fn drain_deltas(&mut self) -> Vec<GraphDelta> {
        self.state
            .deltas
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    // --- graph loading -----------------------------------------------------------------------

    fn allocate_id(&mut self) -> u64 {
        let graphs = &self.graphs;
        let graph_dir = &self.graph_dir;
        next_graph_id(&mut self.last_allocated_graph_id, |id| {
            graphs.contains_key(&id) || graph_path(graph_dir, id).exists()
        })
    }

    /// Reads a graph file. Corrupt files are deleted and empty graphs destroyed; both yield
    /// `None`, as does a missing file.
    fn read_graph(&mut self, id: u64) -> Option<BlockGraph> {
        let path = graph_path(&self.graph_dir, id);
        let record = match read_framed::<GraphRecord>(&path, GRAPH_MAGIC) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(err) if !err.is_corrupt_data() => {
                tracing::error!("[GraphStore::read_graph] Error reading graph {id:016X}: {err}");
                return None;
            }
            Err(err) => {
                tracing::error!(
                    "[GraphStore::read_graph] Error loading graph {id:016X}: {err}. Deleting corrupt graph file."
                );
                if let Err(err) = std::fs::remove_file(&path) {
                    tracing::error!(
                        "[GraphStore::read_graph] Could not delete {}: {err}",
                        path.display()
                    );
                }
                return None;
            }
        };

        let chunks: Vec<ChunkSectionPos> = record
            .chunks
            .iter()
            .map(|packed| ChunkSectionPos::from_u64(*packed))
            .collect();
        let graph = record.into_graph(id, &self.universe);
        if graph.is_empty() {
            tracing::warn!("[GraphStore::read_graph] Loaded empty graph {id:016X}. Destroying.");
            for section in chunks {
                self.state.regions.remove_graph(section, id);
            }
            self.delete_graph_file(id);
            self.state.emit(GraphEvent::Destroyed(id));
            return None;
        }
        Some(graph)
    }

    /// Makes sure `id` is in memory. Returns false if it does not exist.
    fn load_graph(&mut self, id: u64) -> bool {
        if let Some(graph) = self.graphs.get(&id) {
            self.state.touch(graph);
            return true;
        }
        if self.closed {
            return false;
        }
        let Some(graph) = self.read_graph(id) else {
            return false;
        };
        tracing::debug!("[GraphStore::load_graph] Loaded graph {id:016X} ({} nodes)", graph.size());
        self.state.touch(&graph);
        self.graphs.insert(id, graph);
        true
    }

    /// A graph by id, loading it if needed.
    pub fn get_graph(&mut self, id: u64) -> Option<&BlockGraph> {
        if !self.load_graph(id) {
            return None;
        }
        self.graphs.get(&id)
    }

    /// Mutable access, for graph entity state. Structural changes go through the store.
    pub fn get_graph_mut(&mut self, id: u64) -> Option<&mut BlockGraph> {
        if !self.load_graph(id) {
            return None;
        }
        self.state.unsaved.insert(id);
        self.graphs.get_mut(&id)
    }

    pub fn loaded_graph_ids(&self) -> Vec<u64> {
        self.graphs.keys().copied().collect()
    }

    /// Every graph id in memory or on disk.
    pub fn all_graph_ids(&self) -> Result<BTreeSet<u64>, BlockGraphError> {
        let mut ids = graph_ids_on_disk(&self.graph_dir)?;
        ids.extend(self.graphs.keys().copied());
        Ok(ids)
    }

    pub fn graph_ids_in_section(&mut self, section: ChunkSectionPos) -> Vec<u64> {
        self.state
            .regions
            .get_if_exists(section)
            .map(|chunk| chunk.graphs().collect())
            .unwrap_or_default()
    }

    pub fn graph_ids_at(&mut self, pos: BlockPos) -> Vec<u64> {
        self.state
            .regions
            .get_if_exists(pos.section())
            .map(|chunk| chunk.graphs_at(pos.local()).collect())
            .unwrap_or_default()
    }

    fn nodes_at_with_graphs(&mut self, pos: BlockPos) -> Vec<(u64, NodePos)> {
        let mut found = Vec::new();
        for id in self.graph_ids_at(pos) {
            if !self.load_graph(id) {
                tracing::warn!(
                    "[GraphStore::nodes_at] Index lists missing graph {id:016X} at {pos}. Run GraphStore::rebuild_chunks on {} to fix.",
                    pos.section()
                );
                continue;
            }
            if let Some(graph) = self.graphs.get(&id) {
                found.extend(graph.nodes_at(pos).map(|(_, node)| (id, node.clone())));
            }
        }
        found
    }

    /// Every node at `pos`, across graphs.
    pub fn nodes_at(&mut self, pos: BlockPos) -> Vec<NodePos> {
        let mut seen = HashSet::new();
        self.nodes_at_with_graphs(pos)
            .into_iter()
            .map(|(_, node)| node)
            .filter(|node| seen.insert(node.clone()))
            .collect()
    }

    /// Recomputes a section's exact key map from the graphs it lists.
    fn build_section_keys(&mut self, section: ChunkSectionPos) {
        let ids = self.graph_ids_in_section(section);
        let mut entries = Vec::new();
        for id in ids {
            if !self.load_graph(id) {
                continue;
            }
            if let Some(graph) = self.graphs.get(&id) {
                entries.extend(
                    graph
                        .nodes_in_section(section)
                        .into_iter()
                        .map(|node| (node.clone(), id)),
                );
            }
        }
        tracing::debug!(
            "[GraphStore::build_section_keys] Built {} key(s) for {section}",
            entries.len()
        );
        self.state.regions.build_keys(section, entries);
    }

    /// The id of the graph holding `node`, if any.
    fn find_graph_id(&mut self, node: &NodePos) -> Option<u64> {
        let section = node.pos.section();
        let mut lookup = self.state.regions.get_if_exists(section)?.lookup(node);
        if lookup == KeyLookup::Unbuilt {
            self.build_section_keys(section);
            lookup = self.state.regions.get_if_exists(section)?.lookup(node);
        }
        let KeyLookup::Found(id) = lookup else {
            return None;
        };
        if self.load_graph(id) && self.graphs.get(&id).is_some_and(|graph| graph.contains(node)) {
            return Some(id);
        }
        tracing::warn!(
            "[GraphStore::find_graph_id] Index maps {node} to graph {id:016X}, which does not contain it. Run GraphStore::rebuild_chunks on {section} to fix."
        );
        None
    }

    pub fn find_node(&mut self, node: &NodePos) -> Option<NodeHandle> {
        let id = self.find_graph_id(node)?;
        let ix = self.graphs.get(&id)?.find(node)?;
        Some(NodeHandle::new(id, ix))
    }

    // --- structural operations ---------------------------------------------------------------

    /// Adds a node, or returns the existing one when an equal value is already at `pos` (in
    /// which case `entity` is dropped). A new node starts in its own graph and immediately
    /// connects to whatever it finds.
    pub fn add_node(
        &mut self,
        pos: BlockPos,
        value: NodeValue,
        entity: Option<Box<dyn NodeEntity>>,
    ) -> Result<NodeHandle, BlockGraphError> {
        self.ensure_open()?;
        let node = NodePos::new(pos, value);
        if let Some(existing) = self.find_node(&node) {
            return Ok(existing);
        }

        self.create_singleton(&node, entity);
        self.refresh_node_connections(&node);
        self.find_node(&node).ok_or_else(|| {
            BlockGraphError::NotFound(format!("{node} vanished while connecting"))
        })
    }

    fn create_singleton(&mut self, node: &NodePos, entity: Option<Box<dyn NodeEntity>>) -> u64 {
        let id = self.allocate_id();
        let mut graph = BlockGraph::new(id, &self.universe);
        graph.create_node(&mut self.state, node.pos, node.node.clone(), entity);
        self.graphs.insert(id, graph);
        self.state.emit(GraphEvent::Created(id));
        tracing::debug!("[GraphStore::create_singleton] Graph {id:016X} created for {node}");
        id
    }

    /// Removes a node. Returns false if it was not there.
    pub fn remove_node(&mut self, pos: BlockPos, value: NodeValue) -> Result<bool, BlockGraphError> {
        self.ensure_open()?;
        let node = NodePos::new(pos, value);
        let Some(id) = self.find_graph_id(&node) else {
            return Ok(false);
        };
        Ok(self.destroy_node_in(id, &node))
    }

    fn destroy_node_in(&mut self, id: u64, node: &NodePos) -> bool {
        let Some(graph) = self.graphs.get_mut(&id) else {
            return false;
        };
        let Some(ix) = graph.find(node) else {
            return false;
        };
        if graph.destroy_node(&mut self.state, ix) {
            self.forget_graph(id);
        } else {
            self.split_graph(id);
        }
        true
    }

    /// Links two existing nodes, merging their graphs if needed.
    pub fn connect_nodes(
        &mut self,
        a: &NodePos,
        b: &NodePos,
        key: LinkKey,
    ) -> Result<Option<LinkHandle>, BlockGraphError> {
        self.ensure_open()?;
        Ok(self.connect(a, b, key))
    }

    fn connect(&mut self, a: &NodePos, b: &NodePos, key: LinkKey) -> Option<LinkHandle> {
        let a_id = self.find_graph_id(a)?;
        let b_id = self.find_graph_id(b)?;
        let id = if a_id == b_id {
            a_id
        } else {
            self.merge_graphs(a_id, b_id)?
        };
        let graph = self.graphs.get_mut(&id)?;
        let (Some(a_ix), Some(b_ix)) = (graph.find(a), graph.find(b)) else {
            tracing::warn!(
                "[GraphStore::connect_nodes] {a} or {b} missing from graph {id:016X} after merge. Run GraphStore::rebuild_chunks on {} to fix. Splitting to recover.",
                a.pos.section()
            );
            self.split_graph(id);
            return None;
        };
        let edge = graph.link(&mut self.state, a_ix, b_ix, key, None)?;
        Some(LinkHandle::new(id, edge))
    }

    /// Removes the link keyed `key` between two nodes, splitting the graph if that disconnected
    /// it. Returns false if there was no such link.
    pub fn disconnect_nodes(
        &mut self,
        a: &NodePos,
        b: &NodePos,
        key: &LinkKey,
    ) -> Result<bool, BlockGraphError> {
        self.ensure_open()?;
        let Some(id) = self.find_graph_id(a) else {
            return Ok(false);
        };
        let Some(graph) = self.graphs.get_mut(&id) else {
            return Ok(false);
        };
        let (Some(a_ix), Some(b_ix)) = (graph.find(a), graph.find(b)) else {
            return Ok(false);
        };
        let removed = graph.unlink(&mut self.state, a_ix, b_ix, key);
        self.split_graph(id);
        Ok(removed)
    }

    /// Merges two graphs into whichever is larger (`a` on a tie). Returns the survivor's id.
    pub fn merge_graphs(&mut self, a: u64, b: u64) -> Option<u64> {
        if a == b {
            return self.load_graph(a).then_some(a);
        }
        if !self.load_graph(a) || !self.load_graph(b) {
            return None;
        }
        let a_size = self.graphs.get(&a)?.size();
        let b_size = self.graphs.get(&b)?.size();
        let (into_id, from_id) = if a_size >= b_size { (a, b) } else { (b, a) };

        let from = self.graphs.remove(&from_id)?;
        let from_sections: Vec<ChunkSectionPos> = from.sections().collect();
        let Some(into) = self.graphs.get_mut(&into_id) else {
            self.graphs.insert(from_id, from);
            return None;
        };
        into.merge(&mut self.state, from);

        for section in from_sections {
            self.state.regions.remove_graph(section, from_id);
        }
        self.state.unsaved.remove(&from_id);
        self.delete_graph_file(from_id);
        self.state.emit(GraphEvent::Destroyed(from_id));
        self.state.emit(GraphEvent::Updated(into_id));
        tracing::debug!("[GraphStore::merge_graphs] Merged {from_id:016X} into {into_id:016X}");
        Some(into_id)
    }

    /// Splits `id` into its connected components. Returns the ids of the new graphs.
    pub fn split_graph(&mut self, id: u64) -> Vec<u64> {
        let Some(mut graph) = self.graphs.remove(&id) else {
            return Vec::new();
        };
        let split_off = {
            let graphs = &self.graphs;
            let graph_dir = &self.graph_dir;
            let last = &mut self.last_allocated_graph_id;
            let mut alloc = || {
                next_graph_id(last, |candidate| {
                    candidate == id
                        || graphs.contains_key(&candidate)
                        || graph_path(graph_dir, candidate).exists()
                })
            };
            graph.split(&mut self.state, &mut alloc)
        };
        self.graphs.insert(id, graph);

        let mut new_ids = Vec::with_capacity(split_off.len());
        for new_graph in split_off {
            let new_id = new_graph.id();
            self.state.touch(&new_graph);
            self.graphs.insert(new_id, new_graph);
            self.state.emit(GraphEvent::Created(new_id));
            new_ids.push(new_id);
        }
        if !new_ids.is_empty() {
            self.state.emit(GraphEvent::Updated(id));
            tracing::debug!(
                "[GraphStore::split_graph] Split {} graph(s) off {id:016X}",
                new_ids.len()
            );
        }
        new_ids
    }

    /// Drops an emptied graph from memory, the index and disk.
    fn forget_graph(&mut self, id: u64) {
        if let Some(mut graph) = self.graphs.remove(&id) {
            let sections: Vec<ChunkSectionPos> = graph.sections().collect();
            for section in sections {
                self.state.regions.remove_graph(section, id);
            }
            graph.on_destroy();
        }
        self.state.unsaved.remove(&id);
        self.delete_graph_file(id);
        self.state.emit(GraphEvent::Destroyed(id));
        tracing::debug!("[GraphStore::forget_graph] Graph {id:016X} destroyed");
    }

    fn delete_graph_file(&self, id: u64) {
        let path = graph_path(&self.graph_dir, id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::error!(
                "[GraphStore::delete_graph_file] Could not delete {}: {err}",
                path.display()
            ),
        }
    }

    /// Destroys a graph and every node in it. Returns false if it did not exist.
    pub fn destroy_graph(&mut self, id: u64) -> Result<bool, BlockGraphError> {
        self.ensure_open()?;
        if !self.load_graph(id) {
            return Ok(false);
        }
        if self.state.records_deltas() {
            if let Some(graph) = self.graphs.get(&id) {
                let removals: Vec<GraphDelta> = graph
                    .nodes()
                    .map(|(_, node)| {
                        GraphDelta::new(
                            vec![node.pos.section()],
                            SyncMessage::NodeRemove {
                                graph_id: id,
                                node: node.clone(),
                            },
                        )
                    })
                    .collect();
                for delta in removals {
                    self.state.push_delta(delta);
                }
            }
        }
        self.forget_graph(id);
        Ok(true)
    }

    // --- discovery-driven refreshes ----------------------------------------------------------

    /// Queues a node refresh at `pos` for the next tick.
    pub fn update_nodes(&mut self, pos: BlockPos) -> Result<(), BlockGraphError> {
        self.ensure_open()?;
        self.update_nodes.insert(pos);
        Ok(())
    }

    /// Queues a connection refresh at `pos` for the next tick.
    pub fn update_connections(&mut self, pos: BlockPos) -> Result<(), BlockGraphError> {
        self.ensure_open()?;
        self.update_connections.insert(pos);
        Ok(())
    }

    /// Brings the nodes at `pos` in line with what the universe's discoverers report.
    pub fn refresh_nodes_at(&mut self, pos: BlockPos) -> Result<(), BlockGraphError> {
        self.ensure_open()?;
        let discovered = self.universe.discover(pos);
        let present = self.nodes_at_with_graphs(pos);

        let mut seen: HashSet<NodePos> = HashSet::new();
        for (id, node) in present {
            if !seen.insert(node.clone()) {
                tracing::warn!(
                    "[GraphStore::refresh_nodes_at] Duplicate nodes {node} found at {pos}. Removing the copy in graph {id:016X}."
                );
                self.destroy_node_in(id, &node);
                continue;
            }
            if node.node.is_automatic_removal() && !discovered.contains(&node.node) {
                // an earlier removal may have split the node into another graph
                if let Some(current) = self.find_graph_id(&node) {
                    self.destroy_node_in(current, &node);
                }
                seen.remove(&node);
            }
        }

        let mut added = Vec::new();
        for value in discovered {
            let node = NodePos::new(pos, value);
            if !seen.contains(&node) {
                self.create_singleton(&node, None);
                added.push(node);
            }
        }
        for node in added {
            self.refresh_node_connections(&node);
        }
        Ok(())
    }

    /// Brings the links of every node at `pos` in line with what the nodes want.
    pub fn refresh_connections_at(&mut self, pos: BlockPos) -> Result<(), BlockGraphError> {
        self.ensure_open()?;
        for node in self.nodes_at(pos) {
            self.refresh_node_connections(&node);
        }
        Ok(())
    }

    fn refresh_node_connections(&mut self, node: &NodePos) {
        let Some(id) = self.find_graph_id(node) else {
            return;
        };
        let Some(old) = self
            .graphs
            .get(&id)
            .and_then(|graph| graph.find(node).map(|ix| graph.connections(ix)))
        else {
            return;
        };

        let found = {
            let mut view = StoreView(self);
            node.node.find_connections(node, &mut view)
        };
        let mut wanted: Vec<(HalfLink, u64)> = Vec::new();
        for link in found {
            let Some(other_id) = self.find_graph_id(&link.other) else {
                continue;
            };
            let accepted = {
                let mut view = StoreView(self);
                link.other
                    .node
                    .can_connect(&link.other, &mut view, &link.reverse(node))
            };
            if accepted && !wanted.iter().any(|(existing, _)| existing == &link) {
                wanted.push((link, other_id));
            }
        }

        let old_set: HashSet<&HalfLink> = old.iter().collect();
        let new_links: Vec<HalfLink> = wanted
            .iter()
            .filter(|(link, other_id)| *other_id != id || !old_set.contains(link))
            .map(|(link, _)| link.clone())
            .collect();
        let removed: Vec<HalfLink> = old
            .iter()
            .filter(|link| {
                link.key.is_automatic_removal() && !wanted.iter().any(|(wanted, _)| wanted == *link)
            })
            .cloned()
            .collect();

        for link in new_links {
            self.connect(node, &link.other, link.key);
        }

        // connecting may have merged the node into another graph
        let Some(id) = self.find_graph_id(node) else {
            return;
        };
        if removed.is_empty() {
            self.state.emit(GraphEvent::Updated(id));
            return;
        }
        if let Some(graph) = self.graphs.get_mut(&id) {
            for link in removed {
                if let (Some(a), Some(b)) = (graph.find(node), graph.find(&link.other)) {
                    graph.unlink(&mut self.state, a, b, &link.key);
                }
            }
        }
        self.split_graph(id);
    }

    // --- tick --------------------------------------------------------------------------------

    /// Runs one tick: rebuild step, index eviction, graph ticks, queued node and connection
    /// refreshes, deferred callbacks, graph eviction and background saving, in that order.
    pub fn tick(&mut self) {
        if self.closed {
            return;
        }
        self.advance_rebuild();

        self.state.regions.tick();
        self.state.graph_timer.tick();

        for graph in self.graphs.values_mut() {
            graph.tick();
        }

        for pos in self.update_nodes.take() {
            if let Err(err) = self.refresh_nodes_at(pos) {
                tracing::error!("[GraphStore::tick] Node refresh at {pos} failed: {err}");
            }
        }
        for pos in self.update_connections.take() {
            if let Err(err) = self.refresh_connections_at(pos) {
                tracing::error!("[GraphStore::tick] Connection refresh at {pos} failed: {err}");
            }
        }

        self.run_callbacks();
        self.unload_idle_graphs();
        self.save_dirty_graphs();
    }

    fn run_callbacks(&mut self) {
        for node in self.state.callbacks.take() {
            let validate = self.state.validate.remove(&node).unwrap_or(false);
            let Some(id) = self.find_graph_id(&node) else {
                continue;
            };
            let Some(links) = self
                .graphs
                .get(&id)
                .and_then(|graph| graph.find(&node).map(|ix| graph.connections(ix)))
            else {
                continue;
            };
            node.node.on_connections_changed(&node, &links);

            if validate {
                let valid = {
                    let mut view = StoreView(self);
                    node.node.is_valid(&node, &mut view)
                };
                if !valid {
                    tracing::debug!("[GraphStore::run_callbacks] {node} is no longer valid. Removing.");
                    self.destroy_node_in(id, &node);
                }
            }
        }
        self.state.validate.clear();
    }

    fn unload_idle_graphs(&mut self) {
        let expired = self.state.graph_timer.chunks_to_unload();
        if expired.is_empty() {
            return;
        }
        let mut candidates = BTreeSet::new();
        for section in expired {
            self.state.graph_timer.on_chunk_unload(section);
            candidates.extend(
                self.graphs
                    .values()
                    .filter(|graph| graph.in_section(section))
                    .map(|graph| graph.id()),
            );
        }
        for id in candidates {
            let idle = self.graphs.get(&id).is_some_and(|graph| {
                graph
                    .sections()
                    .all(|section| !self.state.graph_timer.is_chunk_loaded(&section))
            });
            if idle {
                self.unload_graph(id);
            }
        }
    }

    fn unload_graph(&mut self, id: u64) {
        if self.state.unsaved.remove(&id) {
            if let Err(err) = self.save_graph(id) {
                tracing::error!("[GraphStore::unload_graph] Error saving graph {id:016X}: {err}");
            }
        }
        if let Some(mut graph) = self.graphs.remove(&id) {
            self.state.emit(GraphEvent::Unloading(id));
            graph.on_unload();
            tracing::debug!("[GraphStore::unload_graph] Unloaded graph {id:016X}");
        }
    }

    fn save_graph(&self, id: u64) -> Result<(), BlockGraphError> {
        let Some(graph) = self.graphs.get(&id) else {
            return Ok(());
        };
        if graph.is_empty() {
            tracing::warn!("[GraphStore::save_graph] Refusing to save empty graph {id:016X}");
            return Ok(());
        }
        write_framed(
            &graph_path(&self.graph_dir, id),
            GRAPH_MAGIC,
            &GraphRecord::from_graph(graph),
        )
    }

    fn save_state(&self) -> Result<(), BlockGraphError> {
        write_framed(
            &self.root.join(STATE_FILE),
            STATE_MAGIC,
            &StateRecord {
                last_allocated_graph_id: self.last_allocated_graph_id,
            },
        )
    }

    fn save_dirty_graphs(&mut self) {
        if self.state.unsaved.is_empty() {
            return;
        }
        let count = match self.config.save_mode {
            SaveMode::OnUnload => return,
            SaveMode::Incremental => self
                .state
                .unsaved
                .len()
                .div_ceil(self.config.incremental_save_factor.max(1)),
            SaveMode::Immediate => self.state.unsaved.len(),
        };
        for _ in 0..count {
            let Some(id) = self.state.unsaved.pop_front() else {
                break;
            };
            if let Err(err) = self.save_graph(id) {
                tracing::error!("[GraphStore::save_dirty_graphs] Error saving graph {id:016X}: {err}");
            }
        }
        if let Err(err) = self.save_state() {
            tracing::error!("[GraphStore::save_dirty_graphs] Error saving world state: {err}");
        }
    }

    // --- host world chunk lifecycle ------------------------------------------------------------

    pub fn on_world_chunk_load(&mut self, column: ChunkPos) {
        self.state.regions.on_world_chunk_load(column);
        self.state.graph_timer.on_world_chunk_load(column);
    }

    pub fn on_world_chunk_unload(&mut self, column: ChunkPos) {
        self.state.regions.on_world_chunk_unload(column);
        self.state.graph_timer.on_world_chunk_unload(column);
    }

    // --- maintenance -------------------------------------------------------------------------

    /// Clears the spatial index of `sections` and re-inserts every graph's nodes there, a
    /// bounded number of graphs per tick. Refused (with the running pass's progress) while
    /// another rebuild is in progress.
    pub fn rebuild_chunks(
        &mut self,
        sections: impl IntoIterator<Item = ChunkSectionPos>,
        mut listener: Box<dyn RebuildListener>,
    ) -> Result<RebuildStatus, BlockGraphError> {
        self.ensure_open()?;
        if let Some(running) = self.rebuild.as_ref() {
            let progress = running.progress();
            listener.on_already_running(progress);
            return Ok(RebuildStatus::AlreadyRunning(progress));
        }
        let sections: BTreeSet<ChunkSectionPos> = sections.into_iter().collect();
        let graph_ids = self.all_graph_ids()?;
        for section in sections.iter() {
            self.state.regions.clear(*section);
        }
        self.rebuild = Some(ChunkRebuild::new(sections, graph_ids, listener));
        Ok(RebuildStatus::Started)
    }

    /// Progress of the running rebuild, if any.
    pub fn rebuild_progress(&self) -> Option<f32> {
        self.rebuild.as_ref().map(ChunkRebuild::progress)
    }

    fn advance_rebuild(&mut self) {
        let Some(mut rebuild) = self.rebuild.take() else {
            return;
        };
        let batch = rebuild.next_batch(self.config.max_graphs_rebuilt_per_tick);
        for id in batch.iter().copied() {
            if !self.load_graph(id) {
                continue;
            }
            let Some(graph) = self.graphs.get(&id) else {
                continue;
            };
            let nodes: Vec<NodePos> = graph
                .nodes()
                .map(|(_, node)| node)
                .filter(|node| rebuild.sections.contains(&node.pos.section()))
                .cloned()
                .collect();
            for node in nodes {
                self.state.regions.put_graph_with_node(id, &node);
            }
        }
        if !rebuild.finish_tick(batch.len(), self.config.rebuild_progress_interval) {
            self.rebuild = Some(rebuild);
        }
    }

    /// Destroys every empty graph, loaded or on disk. Returns their ids.
    pub fn remove_empty_graphs(&mut self) -> Result<Vec<u64>, BlockGraphError> {
        self.ensure_open()?;
        let mut removed = Vec::new();
        for id in self.all_graph_ids()? {
            if let Some(graph) = self.graphs.get(&id) {
                if graph.is_empty() {
                    tracing::warn!(
                        "[GraphStore::remove_empty_graphs] Loaded graph {id:016X} is empty. Destroying."
                    );
                    self.forget_graph(id);
                    removed.push(id);
                }
                continue;
            }
            if !self.load_graph(id) && !graph_path(&self.graph_dir, id).exists() {
                removed.push(id);
            }
        }
        Ok(removed)
    }

    /// Ids of loaded graphs that are empty or not connected. Always empty when the store is
    /// consistent.
    pub fn check_loaded_graphs(&self) -> Vec<u64> {
        self.graphs
            .values()
            .filter(|graph| graph.is_empty() || !graph.is_connected())
            .map(|graph| graph.id())
            .collect()
    }

    /// Full state of every graph touching `section`, for sync.
    pub fn snapshot_section(&mut self, section: ChunkSectionPos) -> Result<ChunkSnapshot, BlockGraphError> {
        self.ensure_open()?;
        let ids = self.graph_ids_in_section(section);
        let mut loaded = Vec::with_capacity(ids.len());
        for id in ids {
            if self.load_graph(id) {
                loaded.push(id);
            }
        }
        Ok(ChunkSnapshot::from_graphs(
            section,
            loaded.iter().filter_map(|id| self.graphs.get(id)),
        ))
    }

    /// Writes every loaded graph, the spatial index and the world state.
    pub fn save_all(&mut self) -> Result<(), BlockGraphError> {
        for id in self.graphs.keys() {
            self.save_graph(*id)?;
        }
        self.state.unsaved.clear();
        self.state.regions.save_all()?;
        self.save_state()
    }

    /// Saves everything and releases all graphs. Further mutations fail with
    /// [`BlockGraphError::Closed`]. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), BlockGraphError> {
        if self.closed {
            return Ok(());
        }
        self.save_all()?;
        for (id, mut graph) in std::mem::take(&mut self.graphs) {
            self.state.emit(GraphEvent::Unloading(id));
            graph.on_unload();
        }
        self.state.regions.close()?;
        self.rebuild = None;
        self.closed = true;
        tracing::debug!("[GraphStore::close] Closed {}", self.root.display());
        Ok(())
    }
}

/// Node lookups for discovery callbacks, backed by the store.
struct StoreView<'a>(&'a mut GraphStore);

impl NodeView for StoreView<'_> {
    fn nodes_at(&mut self, pos: BlockPos) -> Vec<NodeValue> {
        self.0
            .nodes_at(pos)
            .into_iter()
            .map(|node| node.node)
            .collect()
    }

    fn contains(&mut self, node: &NodePos) -> bool {
        self.0.find_graph_id(node).is_some()
    }
}
