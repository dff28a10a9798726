use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    hash::Hash,
};

use crate::properties::{ChunkPos, ChunkSectionPos};

/// Anything tracked by an [`UnloadTimer`]: chunk columns or chunk sections.
pub trait TimerKey: Copy + Eq + Hash + Ord {
    fn column(&self) -> ChunkPos;
}

impl TimerKey for ChunkPos {
    fn column(&self) -> ChunkPos {
        *self
    }
}

impl TimerKey for ChunkSectionPos {
    fn column(&self) -> ChunkPos {
        ChunkSectionPos::column(self)
    }
}

/// Idle-age tracking for in-memory data keyed by chunk.
///
/// Data in a column the host world has loaded never expires. Otherwise every use pushes the
/// key's deadline to `now + max_age`; keys whose deadline has passed are reported by
/// [`chunks_to_unload`](Self::chunks_to_unload) until acknowledged with
/// [`on_chunk_unload`](Self::on_chunk_unload).
#[derive(Debug, Clone)]
pub struct UnloadTimer<K: TimerKey> {
    max_age: u64,
    tick_age: u64,
    world_loaded: HashSet<ChunkPos>,
    in_use: BTreeSet<K>,
    to_unload: BTreeMap<K, u64>,
}

impl<K: TimerKey> UnloadTimer<K> {
    pub fn new(max_age: u64) -> Self {
        UnloadTimer {
            max_age,
            tick_age: 0,
            world_loaded: HashSet::new(),
            in_use: BTreeSet::new(),
            to_unload: BTreeMap::new(),
        }
    }

    pub fn on_world_chunk_load(&mut self, column: ChunkPos) {
        self.world_loaded.insert(column);
        self.to_unload.retain(|key, _| key.column() != column);
    }

    pub fn on_world_chunk_unload(&mut self, column: ChunkPos) {
        self.world_loaded.remove(&column);
        let deadline = self.tick_age + self.max_age;
        for key in self.in_use.iter().filter(|key| key.column() == column) {
            self.to_unload.insert(*key, deadline);
        }
    }

    pub fn is_world_chunk_loaded(&self, column: ChunkPos) -> bool {
        self.world_loaded.contains(&column)
    }

    pub fn on_chunk_use(&mut self, key: K) {
        self.in_use.insert(key);
        if !self.world_loaded.contains(&key.column()) {
            self.to_unload.insert(key, self.tick_age + self.max_age);
        }
    }

    pub fn is_chunk_loaded(&self, key: &K) -> bool {
        self.in_use.contains(key)
    }

    pub fn on_chunk_unload(&mut self, key: K) {
        self.in_use.remove(&key);
        self.to_unload.remove(&key);
    }

    pub fn tick(&mut self) {
        self.tick_age += 1;
    }

    pub fn chunks_to_unload(&self) -> Vec<K> {
        self.to_unload
            .iter()
            .filter(|(_, deadline)| **deadline < self.tick_age)
            .map(|(key, _)| *key)
            .collect()
    }
}
