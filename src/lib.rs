//! # blockgraph-core
//!
//! Connected-component graphs of nodes anchored to block positions in a streamed 3D chunked
//! world, with region persistence and delta replication to radius-limited mirrors.
//!
//! ## Overview
//!
//! Nodes are identified by value: a [`BlockPos`](properties::BlockPos) plus an immutable
//! [`NodeValue`](nodekey::NodeValue). Links are undirected and keyed by a
//! [`LinkKey`](nodekey::LinkKey). Every maximal connected set of nodes is one
//! [`BlockGraph`](graph::BlockGraph) with a unique `u64` id, and the store keeps that invariant
//! across every change: connecting nodes of two graphs merges them, removing a node or link
//! that disconnects a graph splits it.
//!
//! ## Architecture
//!
//! - **[`universe`]**: the type registry (node types, link keys, entities, discoverers)
//! - **[`graph`]**: the graph arena and its merge/split/link operations
//! - **[`world`]**: [`GraphStore`](world::GraphStore), the spatial index and unload timers
//! - **[`codec`]**: framed CBOR persistence of graphs, index columns and world state
//! - **[`sync`]**: wire protocol, [`SyncServer`](sync::SyncServer) and
//!   [`GraphMirror`](sync::GraphMirror)
//! - **[`config`]**: store tuning, loadable from TOML
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockgraph_core::{
//!     config::GraphStoreConfig, properties::BlockPos, universe::GraphUniverse, world::GraphStore,
//! };
//!
//! # fn main() -> Result<(), blockgraph_core::BlockGraphError> {
//! let universe = GraphUniverse::builder("example:world")
//!     // .node_type("example:wire", decode_wire)
//!     // .discoverer(|pos: BlockPos| world_nodes_at(pos))
//!     .build();
//! let mut store = GraphStore::open("./world/blockgraph", universe, GraphStoreConfig::default())?;
//!
//! // The host world reports block changes; the store rediscovers nodes on the next tick.
//! store.update_nodes(BlockPos::new(0, 64, 0))?;
//! store.tick();
//!
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod graph;
pub mod nodekey;
pub mod properties;
pub mod sync;
pub mod universe;
pub mod world;

#[cfg(test)]
mod tests;

pub use error::*;
