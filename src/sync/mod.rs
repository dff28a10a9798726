//! Delta replication of graph state to radius-limited remote mirrors.
//!
//! The authoritative [`GraphStore`](crate::world::GraphStore) records a [`GraphDelta`] for every
//! structural change once delta recording is on. A [`SyncServer`] routes those deltas to the
//! observers whose known sections they touch, and sends a full [`ChunkSnapshot`] for each
//! section that enters an observer's range. A [`GraphMirror`] applies the received messages.
//!
//! Mirrors are allowed to be incomplete: a message referencing a node or graph the mirror never
//! saw is dropped, and the next snapshot of that section repairs whatever was missed.

pub mod message;
pub mod mirror;
pub mod server;
pub mod wire;

pub use message::{ChunkSnapshot, SnapshotGraph, SnapshotLink, SyncLink, SyncMessage, SyncNode};
pub use mirror::GraphMirror;
pub use server::{ObserverId, SyncServer};

use crate::properties::ChunkSectionPos;

/// A change together with the sections whose observers need it.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphDelta {
    pub sections: Vec<ChunkSectionPos>,
    pub message: SyncMessage,
}

impl GraphDelta {
    pub fn new(sections: Vec<ChunkSectionPos>, message: SyncMessage) -> Self {
        GraphDelta { sections, message }
    }

    pub fn touches(&self, section: &ChunkSectionPos) -> bool {
        self.sections.contains(section)
    }
}
