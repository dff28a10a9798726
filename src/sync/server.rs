use bytes::Bytes;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use super::{message::SyncMessage, wire::PaletteWriter, GraphDelta};
use crate::{properties::ChunkSectionPos, world::GraphStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

#[derive(Debug)]
struct Observer {
    center: ChunkSectionPos,
    radius: u32,
    /// Sections this observer has been sent a snapshot for (or was told were empty).
    known: BTreeSet<ChunkSectionPos>,
    palette: PaletteWriter,
    outbox: Vec<Bytes>,
}

impl Observer {
    fn wanted(&self) -> BTreeSet<ChunkSectionPos> {
        self.center.cube(self.radius).collect()
    }

    fn send(&mut self, id: ObserverId, message: &SyncMessage) {
        match message.encode(&mut self.palette) {
            Ok(bytes) => self.outbox.push(bytes),
            Err(err) => tracing::error!(
                "[SyncServer::send] Failed to encode {} for {id}: {err}",
                message.kind()
            ),
        }
    }

    fn wants(&self, delta: &GraphDelta) -> bool {
        delta.sections.iter().any(|section| self.known.contains(section))
    }
}

/// Authoritative side of replication: tracks what every observer has seen and turns the
/// store's recorded deltas into per-observer message queues.
///
/// Call [`flush`](Self::flush) after each [`GraphStore::tick`] (or any batch of changes) and
/// hand each observer's [`take_outbox`](Self::take_outbox) bytes to the transport in order.
#[derive(Debug, Default)]
pub struct SyncServer {
    observers: BTreeMap<ObserverId, Observer>,
    next_id: u64,
}

impl SyncServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer and turns on delta recording. It receives snapshots for its range
    /// on the next flush.
    pub fn add_observer(
        &mut self,
        store: &mut GraphStore,
        center: ChunkSectionPos,
        radius: u32,
    ) -> ObserverId {
        store.set_delta_recording(true);
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.insert(
            id,
            Observer {
                center,
                radius,
                known: BTreeSet::new(),
                palette: PaletteWriter::new(),
                outbox: Vec::new(),
            },
        );
        tracing::debug!("[SyncServer::add_observer] {id} at {center} radius {radius}");
        id
    }

    /// Moves an observer's range. Sections that left it are forgotten without a message; sections
    /// that entered it are snapshotted on the next flush.
    pub fn move_observer(&mut self, id: ObserverId, center: ChunkSectionPos, radius: u32) -> bool {
        let Some(observer) = self.observers.get_mut(&id) else {
            return false;
        };
        observer.center = center;
        observer.radius = radius;
        let wanted = observer.wanted();
        observer.known.retain(|section| wanted.contains(section));
        true
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove(&id).is_some()
    }

    pub fn observer_ids(&self) -> Vec<ObserverId> {
        self.observers.keys().copied().collect()
    }

    pub fn known_sections(&self, id: ObserverId) -> Option<&BTreeSet<ChunkSectionPos>> {
        self.observers.get(&id).map(|observer| &observer.known)
    }

    /// Routes recorded deltas to observers that know one of their sections, then snapshots
    /// sections newly in range and forgets sections out of range.
    pub fn flush(&mut self, store: &mut GraphStore) {
        let deltas = store.drain_deltas();
        for (id, observer) in self.observers.iter_mut() {
            for delta in deltas.iter() {
                if observer.wants(delta) {
                    observer.send(*id, &delta.message);
                }
            }
        }

        for (id, observer) in self.observers.iter_mut() {
            let wanted = observer.wanted();
            observer.known.retain(|section| wanted.contains(section));

            let entered: Vec<ChunkSectionPos> = wanted
                .into_iter()
                .filter(|section| !observer.known.contains(section))
                .collect();
            for section in entered {
                match store.snapshot_section(section) {
                    Ok(snapshot) => {
                        if !snapshot.is_empty() {
                            observer.send(*id, &SyncMessage::Snapshot(snapshot));
                        }
                        observer.known.insert(section);
                    }
                    Err(err) => tracing::error!(
                        "[SyncServer::flush] Could not snapshot {section} for {id}: {err}"
                    ),
                }
            }
        }
    }

    /// Encoded messages queued for `id`, oldest first.
    pub fn take_outbox(&mut self, id: ObserverId) -> Vec<Bytes> {
        self.observers
            .get_mut(&id)
            .map(|observer| std::mem::take(&mut observer.outbox))
            .unwrap_or_default()
    }
}
