use std::collections::{BTreeSet, VecDeque};

use crate::properties::ChunkSectionPos;

/// Progress callbacks of a [`GraphStore::rebuild_chunks`](super::GraphStore::rebuild_chunks)
/// pass. Every method logs by default.
pub trait RebuildListener: Send {
    fn on_begin(&mut self, graph_count: usize, chunk_count: usize) {
        tracing::info!(
            "[RebuildListener] Rebuilding {chunk_count} chunk(s) from {graph_count} graph(s)"
        );
    }

    fn on_progress(&mut self, done: usize, total: usize) {
        tracing::info!("[RebuildListener] Rebuilt {done}/{total} graphs");
    }

    fn on_complete(&mut self, done: usize) {
        tracing::info!("[RebuildListener] Rebuild complete after {done} graphs");
    }

    /// Called on a listener whose rebuild request was refused because another pass is running.
    fn on_already_running(&mut self, progress: f32) {
        tracing::warn!(
            "[RebuildListener] A rebuild is already running ({:.0}% done)",
            progress * 100.0
        );
    }
}

/// A listener that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRebuildListener;

impl RebuildListener for LoggingRebuildListener {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RebuildStatus {
    Started,
    /// Another pass is running; carries its progress fraction.
    AlreadyRunning(f32),
}

/// Resumable state of one rebuild pass, advanced a bounded number of graphs per tick.
pub(crate) struct ChunkRebuild {
    pub(crate) sections: BTreeSet<ChunkSectionPos>,
    pending: VecDeque<u64>,
    total: usize,
    done: usize,
    ticks: u64,
    listener: Box<dyn RebuildListener>,
}

impl ChunkRebuild {
    pub(crate) fn new(
        sections: BTreeSet<ChunkSectionPos>,
        graph_ids: impl IntoIterator<Item = u64>,
        mut listener: Box<dyn RebuildListener>,
    ) -> Self {
        let pending: VecDeque<u64> = graph_ids.into_iter().collect();
        listener.on_begin(pending.len(), sections.len());
        ChunkRebuild {
            sections,
            total: pending.len(),
            pending,
            done: 0,
            ticks: 0,
            listener,
        }
    }

    pub(crate) fn progress(&self) -> f32 {
        if self.total == 0 {
            return 1.0;
        }
        self.done as f32 / self.total as f32
    }

    /// The next batch of graph ids to re-index, at most `max`.
    pub(crate) fn next_batch(&mut self, max: usize) -> Vec<u64> {
        let count = max.max(1).min(self.pending.len());
        self.pending.drain(..count).collect()
    }

    /// Records a finished batch. Returns true once every graph has been processed.
    pub(crate) fn finish_tick(&mut self, processed: usize, progress_interval: u64) -> bool {
        self.done += processed;
        self.ticks += 1;
        if self.pending.is_empty() {
            self.listener.on_complete(self.done);
            return true;
        }
        if progress_interval > 0 && self.ticks % progress_interval == 0 {
            self.listener.on_progress(self.done, self.total);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl RebuildListener for Recorder {
        fn on_begin(&mut self, graph_count: usize, chunk_count: usize) {
            self.0.lock().push(format!("begin {graph_count} {chunk_count}"));
        }
        fn on_progress(&mut self, done: usize, total: usize) {
            self.0.lock().push(format!("progress {done}/{total}"));
        }
        fn on_complete(&mut self, done: usize) {
            self.0.lock().push(format!("complete {done}"));
        }
    }

    #[test]
    fn test_rebuild_batches_and_reports() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sections = [ChunkSectionPos::new(0, 0, 0)].into_iter().collect();
        let mut rebuild = ChunkRebuild::new(sections, 1..=5, Box::new(Recorder(log.clone())));

        let mut ticks = 0;
        loop {
            let batch = rebuild.next_batch(2);
            ticks += 1;
            if rebuild.finish_tick(batch.len(), 2) {
                break;
            }
        }
        assert_eq!(ticks, 3);
        assert_eq!(rebuild.progress(), 1.0);
        assert_eq!(
            *log.lock(),
            vec!["begin 5 1", "progress 4/5", "complete 5"]
        );
    }
}
