//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use blockgraph_core::{
    codec::{from_payload, to_payload, Payload},
    config::GraphStoreConfig,
    entity::GraphEntity,
    graph::BlockGraph,
    nodekey::{BlockNode, HalfLink, LinkKey, LinkPos, NodePos, NodeValue},
    properties::{BlockPos, ChunkSectionPos, TypeKey},
    universe::{GraphUniverse, NodeView, UniverseBuilder},
    world::GraphStore,
    BlockGraphError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};

pub const WIRE: &str = "test:wire";
pub const TALLY: &str = "test:tally";

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Connects to face-adjacent wires of the same channel. An anchored wire stops being valid
/// once it has no such neighbor left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Wire {
    pub channel: u8,
    pub anchored: bool,
}

impl Wire {
    fn same_channel(&self, value: &NodeValue) -> bool {
        value
            .downcast_ref::<Wire>()
            .is_some_and(|other| other.channel == self.channel)
    }
}

impl BlockNode for Wire {
    fn type_key(&self) -> TypeKey {
        TypeKey::from(WIRE)
    }

    fn to_payload(&self) -> Payload {
        to_payload(self).unwrap_or(Payload::Null)
    }

    fn find_connections(&self, this: &NodePos, view: &mut dyn NodeView) -> Vec<HalfLink> {
        let mut found = Vec::new();
        for neighbor in this.pos.neighbors() {
            for value in view.nodes_at(neighbor) {
                if self.same_channel(&value) {
                    found.push(HalfLink::new(NodePos::new(neighbor, value), LinkKey::empty()));
                }
            }
        }
        found
    }

    fn can_connect(&self, this: &NodePos, _view: &mut dyn NodeView, candidate: &HalfLink) -> bool {
        self.same_channel(&candidate.other.node)
            && this.pos.neighbors().contains(&candidate.other.pos)
            && candidate.key == LinkKey::empty()
    }

    fn is_valid(&self, this: &NodePos, view: &mut dyn NodeView) -> bool {
        if !self.anchored {
            return true;
        }
        this.pos
            .neighbors()
            .into_iter()
            .any(|neighbor| view.nodes_at(neighbor).iter().any(|value| self.same_channel(value)))
    }
}

#[allow(dead_code)]
pub fn wire() -> NodeValue {
    NodeValue::new(Wire {
        channel: 0,
        anchored: false,
    })
}

#[allow(dead_code)]
pub fn anchored_wire() -> NodeValue {
    NodeValue::new(Wire {
        channel: 0,
        anchored: true,
    })
}

#[allow(dead_code)]
pub fn wire_at(x: i32, y: i32, z: i32) -> NodePos {
    NodePos::new(BlockPos::new(x, y, z), wire())
}

/// Counts graph updates; merges add up, splits copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub updates: u64,
}

impl GraphEntity for Tally {
    fn type_key(&self) -> TypeKey {
        TypeKey::from(TALLY)
    }

    fn to_payload(&self) -> Payload {
        to_payload(self).unwrap_or(Payload::Null)
    }

    fn on_update(&mut self) {
        self.updates += 1;
    }

    fn merge(&mut self, other: Box<dyn GraphEntity>) {
        if let Some(other) = other.as_any().downcast_ref::<Tally>() {
            self.updates += other.updates;
        }
    }

    fn split_new(&self, _original: &BlockGraph, _new_graph: &BlockGraph) -> Box<dyn GraphEntity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[allow(dead_code)]
pub fn tally_of(graph: &BlockGraph) -> u64 {
    graph
        .graph_entity(&TypeKey::from(TALLY))
        .and_then(|entity| entity.as_any().downcast_ref::<Tally>())
        .map(|tally| tally.updates)
        .unwrap_or(0)
}

fn decode_wire(payload: &Payload) -> Result<NodeValue, BlockGraphError> {
    Ok(NodeValue::new(from_payload::<Wire>(payload)?))
}

fn builder() -> UniverseBuilder {
    GraphUniverse::builder("test:universe")
        .node_type(WIRE, decode_wire)
        .graph_entity_type(
            TALLY,
            || Box::new(Tally::default()) as Box<dyn GraphEntity>,
            |payload| Ok(Box::new(from_payload::<Tally>(payload)?) as Box<dyn GraphEntity>),
        )
}

/// A universe without discoverers.
#[allow(dead_code)]
pub fn test_universe() -> Arc<GraphUniverse> {
    builder().build()
}

/// The node values a scripted host world reports per position.
#[derive(Debug, Clone, Default)]
pub struct TestWorld(Arc<Mutex<HashMap<BlockPos, Vec<NodeValue>>>>);

#[allow(dead_code)]
impl TestWorld {
    pub fn set(&self, pos: BlockPos, values: Vec<NodeValue>) {
        let mut blocks = self.0.lock();
        if values.is_empty() {
            blocks.remove(&pos);
        } else {
            blocks.insert(pos, values);
        }
    }

    pub fn place(&self, pos: BlockPos) {
        self.set(pos, vec![wire()]);
    }

    pub fn clear(&self, pos: BlockPos) {
        self.set(pos, Vec::new());
    }
}

/// A universe whose discoverer reads from the returned [`TestWorld`].
#[allow(dead_code)]
pub fn world_universe() -> (Arc<GraphUniverse>, TestWorld) {
    let world = TestWorld::default();
    let blocks = world.clone();
    let universe = builder()
        .discoverer(move |pos: BlockPos| blocks.0.lock().get(&pos).cloned().unwrap_or_default())
        .build();
    (universe, world)
}

#[allow(dead_code)]
pub fn open_store(root: &Path, universe: Arc<GraphUniverse>, config: GraphStoreConfig) -> GraphStore {
    init_logging();
    GraphStore::open(root, universe, config).unwrap()
}

/// Adds a straight run of plain wires along x. Adjacent wires connect on their own.
#[allow(dead_code)]
pub fn place_run(store: &mut GraphStore, xs: impl IntoIterator<Item = i32>) {
    for x in xs {
        store.add_node(BlockPos::new(x, 0, 0), wire(), None).unwrap();
    }
}

/// Panics unless every loaded graph is non-empty and connected.
#[allow(dead_code)]
pub fn assert_consistent(store: &GraphStore) {
    let broken = store.check_loaded_graphs();
    assert!(broken.is_empty(), "inconsistent graphs: {broken:X?}");
}

/// The store's nodes and links inside `center`'s cube of `radius`, plus the owner of each node.
#[allow(dead_code)]
pub fn visible_state(
    store: &mut GraphStore,
    center: ChunkSectionPos,
    radius: u32,
) -> (HashMap<NodePos, u64>, HashSet<LinkPos>) {
    let in_view = |node: &NodePos| center.distance(&node.pos.section()) <= radius;
    let mut nodes = HashMap::new();
    let mut links = HashSet::new();
    for id in store.all_graph_ids().unwrap() {
        let Some(graph) = store.get_graph(id) else {
            continue;
        };
        for (_, node) in graph.nodes() {
            if in_view(node) {
                nodes.insert(node.clone(), id);
            }
        }
        links.extend(
            graph
                .links()
                .filter(|link| in_view(&link.first) && in_view(&link.second)),
        );
    }
    (nodes, links)
}
