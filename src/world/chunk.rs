//! Spatial index of one chunk section.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{
    codec::{KeyRecord, PositionRecord, SectionRecord},
    nodekey::NodePos,
    properties::{ChunkSectionPos, LocalPos},
    universe::GraphUniverse,
};

/// The exact `(position, node value) -> graph id` map of a section.
///
/// `Unbuilt` means the map is not known and must be recomputed by scanning every graph the
/// section lists (see [`GraphChunk::build_keys`]) before lookups can answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyIndex {
    Unbuilt,
    Built(HashMap<NodePos, u64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLookup {
    /// The exact map has to be built first.
    Unbuilt,
    Absent,
    Found(u64),
}

#[derive(Debug, Clone)]
pub struct GraphChunk {
    pos: ChunkSectionPos,
    graphs_in_chunk: BTreeSet<u64>,
    graphs_in_pos: BTreeMap<LocalPos, BTreeSet<u64>>,
    keys: KeyIndex,
}

impl GraphChunk {
    /// A section nothing has been placed in yet. Its (empty) exact map is trivially complete.
    pub fn new(pos: ChunkSectionPos) -> Self {
        GraphChunk {
            pos,
            graphs_in_chunk: BTreeSet::new(),
            graphs_in_pos: BTreeMap::new(),
            keys: KeyIndex::Built(HashMap::new()),
        }
    }

    pub fn pos(&self) -> ChunkSectionPos {
        self.pos
    }

    pub fn graphs(&self) -> impl Iterator<Item = u64> + '_ {
        self.graphs_in_chunk.iter().copied()
    }

    pub fn graphs_at(&self, local: LocalPos) -> impl Iterator<Item = u64> + '_ {
        self.graphs_in_pos.get(&local).into_iter().flatten().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs_in_chunk.is_empty()
    }

    pub fn keys(&self) -> &KeyIndex {
        &self.keys
    }

    pub fn keys_built(&self) -> bool {
        matches!(self.keys, KeyIndex::Built(_))
    }

    pub fn lookup(&self, node: &NodePos) -> KeyLookup {
        match &self.keys {
            KeyIndex::Unbuilt => KeyLookup::Unbuilt,
            KeyIndex::Built(keys) => keys
                .get(node)
                .map_or(KeyLookup::Absent, |id| KeyLookup::Found(*id)),
        }
    }

    pub fn put_graph_with_node(&mut self, id: u64, node: &NodePos) {
        self.graphs_in_chunk.insert(id);
        self.graphs_in_pos
            .entry(node.pos.local())
            .or_default()
            .insert(id);
        if let KeyIndex::Built(keys) = &mut self.keys {
            keys.insert(node.clone(), id);
        }
    }

    pub fn remove_graph_with_node(&mut self, id: u64, node: &NodePos) {
        if let KeyIndex::Built(keys) = &mut self.keys {
            if keys.get(node) == Some(&id) {
                keys.remove(node);
            }
        }
    }

    pub fn remove_graph_in_pos(&mut self, id: u64, local: LocalPos) {
        if let Some(ids) = self.graphs_in_pos.get_mut(&local) {
            ids.remove(&id);
            if ids.is_empty() {
                self.graphs_in_pos.remove(&local);
            }
        }
    }

    /// Forgets `id` entirely.
    pub fn remove_graph(&mut self, id: u64) {
        self.graphs_in_chunk.remove(&id);
        self.graphs_in_pos.retain(|_, ids| {
            ids.remove(&id);
            !ids.is_empty()
        });
        if let KeyIndex::Built(keys) = &mut self.keys {
            keys.retain(|_, graph| *graph != id);
        }
    }

    pub fn clear(&mut self) {
        self.graphs_in_chunk.clear();
        self.graphs_in_pos.clear();
        self.keys = KeyIndex::Built(HashMap::new());
    }

    pub fn invalidate_keys(&mut self) {
        self.keys = KeyIndex::Unbuilt;
    }

    /// Replaces the exact map with `entries`, normally gathered by scanning every graph in
    /// [`graphs`](Self::graphs) for nodes inside this section.
    pub fn build_keys(&mut self, entries: impl IntoIterator<Item = (NodePos, u64)>) {
        let keys: HashMap<NodePos, u64> = entries
            .into_iter()
            .filter(|(node, _)| self.pos.contains(node.pos))
            .collect();
        self.keys = KeyIndex::Built(keys);
    }

    pub fn to_record(&self) -> SectionRecord {
        let mut keys_at: BTreeMap<LocalPos, Vec<KeyRecord>> = BTreeMap::new();
        if let KeyIndex::Built(keys) = &self.keys {
            for (node, graph_id) in keys.iter() {
                keys_at.entry(node.pos.local()).or_default().push(KeyRecord {
                    graph_id: *graph_id,
                    type_key: node.node.type_key(),
                    payload: node.node.to_payload(),
                });
            }
        }

        let positions = self
            .graphs_in_pos
            .iter()
            .map(|(local, ids)| PositionRecord {
                x: local.x,
                y: local.y,
                z: local.z,
                graphs: ids.iter().copied().collect(),
                keys: keys_at.remove(local).unwrap_or_default(),
            })
            .collect();

        SectionRecord {
            graphs_in_chunk: self.graphs_in_chunk.iter().copied().collect(),
            positions,
            keys_complete: self.keys_built(),
        }
    }

    /// Decodes a section. Key entries of unknown type are skipped with a warning and leave the
    /// exact map unbuilt so it is recomputed from the graphs on first use.
    pub fn from_record(pos: ChunkSectionPos, record: SectionRecord, universe: &GraphUniverse) -> Self {
        let mut chunk = GraphChunk {
            pos,
            graphs_in_chunk: record.graphs_in_chunk.into_iter().collect(),
            graphs_in_pos: BTreeMap::new(),
            keys: KeyIndex::Unbuilt,
        };

        let mut complete = record.keys_complete;
        let mut keys = HashMap::new();
        for entry in record.positions {
            let local = LocalPos::new(entry.x, entry.y, entry.z);
            if !local.is_valid() {
                tracing::warn!(
                    "[GraphChunk::from_record] Section {pos}: invalid local position {local:?}. Skipping."
                );
                complete = false;
                continue;
            }
            if !entry.graphs.is_empty() {
                chunk
                    .graphs_in_pos
                    .insert(local, entry.graphs.iter().copied().collect());
            }
            for key in entry.keys {
                match universe.decode_node(&key.type_key, &key.payload) {
                    Ok(value) => {
                        keys.insert(NodePos::new(pos.block_at(local), value), key.graph_id);
                    }
                    Err(err) => {
                        tracing::warn!(
                            "[GraphChunk::from_record] Section {pos}: skipping key at {local:?}: {err}"
                        );
                        complete = false;
                    }
                }
            }
        }

        if complete {
            chunk.keys = KeyIndex::Built(keys);
        }
        chunk
    }
}
