//! The authoritative store and the spatial index it keeps over the chunked world.
//!
//! [`GraphStore`] owns every loaded [`BlockGraph`](crate::graph::BlockGraph) of a world and
//! routes structural changes through them. The [`RegionStore`] maps sections to the graphs
//! that touch them and persists that map per chunk column. [`UnloadTimer`]s evict both kinds of
//! state once the host world has stopped using it.

pub mod chunk;
pub mod pending;
pub mod rebuild;
pub mod region;
pub mod store;
pub mod timer;

pub use chunk::{GraphChunk, KeyIndex, KeyLookup};
pub use pending::PendingSet;
pub use rebuild::{LoggingRebuildListener, RebuildListener, RebuildStatus};
pub use region::RegionStore;
pub use store::GraphStore;
pub use timer::{TimerKey, UnloadTimer};
