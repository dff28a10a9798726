//! Shared test utilities: a wire node type, a tally graph entity and a scriptable world.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{any::Any, collections::HashMap, sync::Arc};

use crate::{
    codec::{from_payload, to_payload, Payload},
    entity::GraphEntity,
    error::BlockGraphError,
    graph::BlockGraph,
    nodekey::{BlockNode, HalfLink, LinkKey, NodePos, NodeValue},
    properties::{BlockPos, TypeKey},
    universe::{GraphUniverse, NodeView},
};

pub const WIRE: &str = "test:wire";
pub const TALLY: &str = "test:tally";

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Connects to every face-adjacent wire of the same channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Wire {
    pub channel: u8,
}

impl BlockNode for Wire {
    fn type_key(&self) -> TypeKey {
        TypeKey::from(WIRE)
    }

    fn to_payload(&self) -> Payload {
        Payload::Integer(self.channel.into())
    }

    fn find_connections(&self, this: &NodePos, view: &mut dyn NodeView) -> Vec<HalfLink> {
        let mut found = Vec::new();
        for neighbor in this.pos.neighbors() {
            for value in view.nodes_at(neighbor) {
                if value.downcast_ref::<Wire>() == Some(self) {
                    found.push(HalfLink::new(NodePos::new(neighbor, value), LinkKey::empty()));
                }
            }
        }
        found
    }

    fn can_connect(&self, this: &NodePos, _view: &mut dyn NodeView, candidate: &HalfLink) -> bool {
        candidate.other.node.downcast_ref::<Wire>() == Some(self)
            && this.pos.neighbors().contains(&candidate.other.pos)
            && candidate.key == LinkKey::empty()
    }
}

pub fn wire() -> NodeValue {
    NodeValue::new(Wire { channel: 0 })
}

pub fn wire_on(channel: u8) -> NodeValue {
    NodeValue::new(Wire { channel })
}

pub fn wire_at(x: i32, y: i32, z: i32) -> NodePos {
    NodePos::new(BlockPos::new(x, y, z), wire())
}

fn decode_wire(payload: &Payload) -> Result<NodeValue, BlockGraphError> {
    let channel: u8 = from_payload(payload)?;
    Ok(wire_on(channel))
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

pub fn tally_of(graph: &BlockGraph) -> u64 {
    graph
        .graph_entity(&TypeKey::from(TALLY))
        .and_then(|entity| entity.as_any().downcast_ref::<Tally>())
        .map(|tally| tally.updates)
        .unwrap_or(0)
}

fn builder() -> crate::universe::UniverseBuilder {
    GraphUniverse::builder("test:universe")
        .node_type(WIRE, decode_wire)
        .graph_entity_type(
            TALLY,
            || Box::new(Tally::default()) as Box<dyn GraphEntity>,
            |payload| Ok(Box::new(from_payload::<Tally>(payload)?) as Box<dyn GraphEntity>),
        )
}

/// A universe without discoverers.
pub fn test_universe() -> Arc<GraphUniverse> {
    builder().build()
}

/// The node values a scripted host world reports per position.
#[derive(Debug, Clone, Default)]
pub struct TestWorld(Arc<Mutex<HashMap<BlockPos, Vec<NodeValue>>>>);

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
pub fn world_universe() -> (Arc<GraphUniverse>, TestWorld) {
    let world = TestWorld::default();
    let blocks = world.clone();
    let universe = builder()
        .discoverer(move |pos: BlockPos| blocks.0.lock().get(&pos).cloned().unwrap_or_default())
        .build();
    (universe, world)
}
