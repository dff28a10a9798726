//! Lazily loaded, column-grouped storage for the spatial index.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use super::{chunk::GraphChunk, pending::PendingSet, timer::UnloadTimer};
use crate::{
    codec::{read_framed, write_framed, ColumnRecord, COLUMN_MAGIC},
    config::{GraphStoreConfig, SaveMode},
    error::BlockGraphError,
    nodekey::NodePos,
    properties::{BlockPos, ChunkPos, ChunkSectionPos},
    universe::GraphUniverse,
};

type Column = BTreeMap<i32, GraphChunk>;

/// Holds [`GraphChunk`]s in memory by column, loading each column file on first access and
/// writing it back according to the configured [`SaveMode`] or when the column goes idle.
pub struct RegionStore {
    dir: PathBuf,
    universe: Arc<GraphUniverse>,
    save_mode: SaveMode,
    incremental_save_factor: usize,
    columns: HashMap<ChunkPos, Column>,
    unsaved: PendingSet<ChunkPos>,
    timer: UnloadTimer<ChunkPos>,
    closed: bool,
}

impl RegionStore {
    pub fn new(dir: impl Into<PathBuf>, universe: Arc<GraphUniverse>, config: &GraphStoreConfig) -> Self {
        RegionStore {
            dir: dir.into(),
            universe,
            save_mode: config.save_mode,
            incremental_save_factor: config.incremental_save_factor.max(1),
            columns: HashMap::new(),
            unsaved: PendingSet::new(),
            timer: UnloadTimer::new(config.max_chunk_age),
            closed: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn column_path(&self, column: ChunkPos) -> PathBuf {
        self.dir.join(format!("c.{}.{}.dat", column.x, column.z))
    }

    fn read_column(&self, column: ChunkPos) -> Column {
        let path = self.column_path(column);
        match read_framed::<ColumnRecord>(&path, COLUMN_MAGIC) {
            Ok(Some(record)) => record
                .sections
                .into_iter()
                .map(|(y, section)| {
                    let pos = ChunkSectionPos::new(column.x, y, column.z);
                    (y, GraphChunk::from_record(pos, section, &self.universe))
                })
                .collect(),
            Ok(None) => Column::new(),
            Err(err) if !err.is_corrupt_data() => {
                tracing::error!(
                    "[RegionStore::read_column] Error reading chunk column {column}: {err}"
                );
                Column::new()
            }
            Err(err) => {
                tracing::error!(
                    "[RegionStore::read_column] Error loading chunk column {column}: {err}. Discarding column."
                );
                if let Err(err) = std::fs::remove_file(&path) {
                    tracing::warn!(
                        "[RegionStore::read_column] Could not delete corrupt column file {}: {err}",
                        path.display()
                    );
                }
                Column::new()
            }
        }
    }

    fn column_mut(&mut self, column: ChunkPos) -> &mut Column {
        self.timer.on_chunk_use(column);
        if !self.columns.contains_key(&column) {
            let loaded = self.read_column(column);
            self.columns.insert(column, loaded);
        }
        self.columns.entry(column).or_default()
    }

    fn mark_dirty(&mut self, column: ChunkPos) {
        self.unsaved.insert(column);
    }

    pub fn get_or_create(&mut self, section: ChunkSectionPos) -> &mut GraphChunk {
        let column = section.column();
        let created = !self.column_mut(column).contains_key(&section.y);
        if created {
            self.mark_dirty(column);
        }
        self.column_mut(column)
            .entry(section.y)
            .or_insert_with(|| GraphChunk::new(section))
    }

    pub fn get_if_exists(&mut self, section: ChunkSectionPos) -> Option<&GraphChunk> {
        self.column_mut(section.column()).get(&section.y)
    }

    /// Applies `f` to an existing section and marks its column dirty.
    fn modify<R>(
        &mut self,
        section: ChunkSectionPos,
        f: impl FnOnce(&mut GraphChunk) -> R,
    ) -> Option<R> {
        let result = self
            .column_mut(section.column())
            .get_mut(&section.y)
            .map(f);
        if result.is_some() {
            self.mark_dirty(section.column());
        }
        result
    }

    pub fn put_graph_with_node(&mut self, id: u64, node: &NodePos) {
        let section = node.pos.section();
        self.get_or_create(section).put_graph_with_node(id, node);
        self.mark_dirty(section.column());
    }

    pub fn remove_graph_with_node(&mut self, id: u64, node: &NodePos) {
        let section = node.pos.section();
        if self
            .modify(section, |chunk| chunk.remove_graph_with_node(id, node))
            .is_none()
        {
            tracing::warn!(
                "[RegionStore::remove_graph_with_node] Tried to remove node from non-existent chunk. Id: {id:016X}, chunk: {section}, node: {node}"
            );
        }
    }

    pub fn remove_graph_in_pos(&mut self, id: u64, pos: BlockPos) {
        if self
            .modify(pos.section(), |chunk| chunk.remove_graph_in_pos(id, pos.local()))
            .is_none()
        {
            tracing::warn!(
                "[RegionStore::remove_graph_in_pos] Tried to remove graph from non-existent chunk. Id: {id:016X}, pos: {pos}"
            );
        }
    }

    pub fn remove_graph(&mut self, section: ChunkSectionPos, id: u64) {
        self.modify(section, |chunk| chunk.remove_graph(id));
    }

    pub fn clear(&mut self, section: ChunkSectionPos) {
        self.get_or_create(section).clear();
        self.mark_dirty(section.column());
    }

    pub fn build_keys(
        &mut self,
        section: ChunkSectionPos,
        entries: impl IntoIterator<Item = (NodePos, u64)>,
    ) {
        self.modify(section, |chunk| chunk.build_keys(entries));
    }

    pub fn on_world_chunk_load(&mut self, column: ChunkPos) {
        if self.closed {
            return;
        }
        self.timer.on_world_chunk_load(column);
        self.column_mut(column);
    }

    pub fn on_world_chunk_unload(&mut self, column: ChunkPos) {
        self.timer.on_world_chunk_unload(column);
    }

    pub fn is_column_loaded(&self, column: ChunkPos) -> bool {
        self.columns.contains_key(&column)
    }

    pub fn loaded_columns(&self) -> usize {
        self.columns.len()
    }

    /// Evicts idle columns (saving dirty ones) and runs the background save policy.
    pub fn tick(&mut self) {
        self.timer.tick();

        for column in self.timer.chunks_to_unload() {
            if self.unsaved.remove(&column) {
                if let Err(err) = self.save_column(column) {
                    tracing::error!(
                        "[RegionStore::tick] Error saving chunk column {column} before unload: {err}"
                    );
                }
            }
            self.columns.remove(&column);
            self.timer.on_chunk_unload(column);
        }

        if self.unsaved.is_empty() || self.save_mode == SaveMode::OnUnload {
            return;
        }
        let mut save_count = match self.save_mode {
            SaveMode::Immediate => self.unsaved.len(),
            _ => self.unsaved.len().div_ceil(self.incremental_save_factor),
        };
        while save_count > 0 {
            let Some(column) = self.unsaved.pop_front() else {
                break;
            };
            if let Err(err) = self.save_column(column) {
                tracing::error!("[RegionStore::tick] Error saving chunk column {column}: {err}");
            }
            save_count -= 1;
        }
    }

    pub fn save_column(&mut self, column: ChunkPos) -> Result<(), BlockGraphError> {
        let Some(sections) = self.columns.get(&column) else {
            return Ok(());
        };
        let record = ColumnRecord {
            sections: sections
                .iter()
                .filter(|(_, chunk)| !chunk.is_empty())
                .map(|(y, chunk)| (*y, chunk.to_record()))
                .collect(),
        };
        let path = self.column_path(column);
        if record.sections.is_empty() {
            match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            }
        } else {
            write_framed(&path, COLUMN_MAGIC, &record)
        }
    }

    pub fn save_all(&mut self) -> Result<(), BlockGraphError> {
        let columns: Vec<ChunkPos> = self.columns.keys().copied().collect();
        for column in columns {
            self.save_column(column)?;
        }
        self.unsaved.clear();
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), BlockGraphError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.save_all()
    }
}
