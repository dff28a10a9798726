//! Connected-component graphs and the seam they use to talk to their owner.
//!
//! A [`BlockGraph`] owns an arena of nodes and keyed links and implements the structural
//! operations (create/destroy node, link/unlink, merge, split). Everything outside the graph
//! that must follow a structural change (the spatial index, dirty tracking, deferred node
//! callbacks and outgoing sync deltas) is reached through the [`GraphHost`] trait, implemented
//! by the authoritative [`GraphStore`](crate::world::GraphStore) and by the receive-side
//! [`GraphMirror`](crate::sync::GraphMirror).
//!
//! Handles ([`NodeHandle`], [`LinkHandle`]) pair a graph id with an arena index. Node indices
//! are stable across removals inside one graph but are not carried over by merge or split; the
//! stable identity of a node is its [`NodePos`](crate::nodekey::NodePos).

use petgraph::stable_graph::{EdgeIndex, NodeIndex};
use std::fmt;

use crate::{
    nodekey::NodePos,
    properties::{BlockPos, ChunkSectionPos},
    sync::GraphDelta,
    universe::GraphUniverse,
};

mod block_graph;

pub use block_graph::{BlockGraph, LinkSlot, NodeSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle {
    pub graph_id: u64,
    pub index: NodeIndex,
}

impl NodeHandle {
    pub fn new(graph_id: u64, index: NodeIndex) -> Self {
        NodeHandle { graph_id, index }
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}#{}", self.graph_id, self.index.index())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkHandle {
    pub graph_id: u64,
    pub index: EdgeIndex,
}

impl LinkHandle {
    pub fn new(graph_id: u64, index: EdgeIndex) -> Self {
        LinkHandle { graph_id, index }
    }
}

/// Everything a graph notifies while it changes shape.
pub trait GraphHost {
    fn universe(&self) -> &GraphUniverse;

    /// `node` now belongs to `graph_id`.
    fn put_graph_with_node(&mut self, graph_id: u64, node: &NodePos);

    /// `node` no longer belongs to `graph_id`.
    fn remove_graph_with_node(&mut self, graph_id: u64, node: &NodePos);

    /// `graph_id` has no nodes left at `pos`.
    fn remove_graph_in_pos(&mut self, graph_id: u64, pos: BlockPos);

    /// `graph_id` has no nodes left in `section`.
    fn remove_graph_in_chunk(&mut self, graph_id: u64, section: ChunkSectionPos);

    /// Queue a deferred connections-changed callback for `node`, optionally followed by a
    /// validity check.
    fn schedule_callback(&mut self, node: &NodePos, validate: bool);

    fn mark_dirty(&mut self, graph_id: u64);

    fn records_deltas(&self) -> bool;

    fn push_delta(&mut self, delta: GraphDelta);
}
