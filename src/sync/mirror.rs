use bytes::Bytes;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use super::{
    message::{ChunkSnapshot, SyncLink, SyncMessage, SyncNode},
    wire::PaletteReader,
    GraphDelta,
};
use crate::{
    entity::{EntityPayload, GraphEntity, LinkEntity, NodeEntity},
    error::BlockGraphError,
    graph::{BlockGraph, GraphHost},
    nodekey::{LinkPos, NodePos},
    properties::{BlockPos, ChunkSectionPos, TypeKey},
    universe::GraphUniverse,
};

/// Node and section bookkeeping for mirrored graphs.
struct MirrorHost {
    universe: Arc<GraphUniverse>,
    nodes: HashMap<NodePos, u64>,
    sections: HashMap<ChunkSectionPos, BTreeSet<u64>>,
}

impl MirrorHost {
    fn forget_graph(&mut self, graph_id: u64) {
        self.nodes.retain(|_, id| *id != graph_id);
        self.sections.retain(|_, ids| {
            ids.remove(&graph_id);
            !ids.is_empty()
        });
    }
}

impl GraphHost for MirrorHost {
    fn universe(&self) -> &GraphUniverse {
        &self.universe
    }

    fn put_graph_with_node(&mut self, graph_id: u64, node: &NodePos) {
        self.nodes.insert(node.clone(), graph_id);
        self.sections
            .entry(node.pos.section())
            .or_default()
            .insert(graph_id);
    }

    fn remove_graph_with_node(&mut self, graph_id: u64, node: &NodePos) {
        if self.nodes.get(node) == Some(&graph_id) {
            self.nodes.remove(node);
        }
    }

    fn remove_graph_in_pos(&mut self, _graph_id: u64, _pos: BlockPos) {}

    fn remove_graph_in_chunk(&mut self, graph_id: u64, section: ChunkSectionPos) {
        if let Some(ids) = self.sections.get_mut(&section) {
            ids.remove(&graph_id);
            if ids.is_empty() {
                self.sections.remove(&section);
            }
        }
    }

    fn schedule_callback(&mut self, _node: &NodePos, _validate: bool) {}

    fn mark_dirty(&mut self, _graph_id: u64) {}

    fn records_deltas(&self) -> bool {
        false
    }

    fn push_delta(&mut self, _delta: GraphDelta) {}
}

/// Receive-side replica of the graphs around one view center.
///
/// The mirror never decides connectivity itself: merges and splits happen only when the server
/// says so, which means mirrored graphs may be partial and need not be connected.
pub struct GraphMirror {
    universe: Arc<GraphUniverse>,
    palette: PaletteReader,
    center: ChunkSectionPos,
    radius: u32,
    graphs: BTreeMap<u64, BlockGraph>,
    host: MirrorHost,
}

impl GraphMirror {
    pub fn new(universe: Arc<GraphUniverse>, center: ChunkSectionPos, radius: u32) -> Self {
        GraphMirror {
            host: MirrorHost {
                universe: universe.clone(),
                nodes: HashMap::new(),
                sections: HashMap::new(),
            },
            universe,
            palette: PaletteReader::new(),
            center,
            radius,
            graphs: BTreeMap::new(),
        }
    }

    pub fn center(&self) -> ChunkSectionPos {
        self.center
    }

    pub fn radius(&self) -> u32 {
        self.radius
    }

    pub fn in_view(&self, section: ChunkSectionPos) -> bool {
        self.center.distance(&section) <= self.radius
    }

    pub fn graph(&self, id: u64) -> Option<&BlockGraph> {
        self.graphs.get(&id)
    }

    pub fn graphs(&self) -> impl Iterator<Item = &BlockGraph> {
        self.graphs.values()
    }

    pub fn graph_ids(&self) -> Vec<u64> {
        self.graphs.keys().copied().collect()
    }

    /// The graph a node is mirrored under.
    pub fn graph_of(&self, node: &NodePos) -> Option<u64> {
        self.host.nodes.get(node).copied()
    }

    pub fn nodes(&self) -> HashSet<NodePos> {
        self.graphs
            .values()
            .flat_map(|graph| graph.nodes().map(|(_, node)| node.clone()))
            .collect()
    }

    pub fn links(&self) -> HashSet<LinkPos> {
        self.graphs.values().flat_map(|graph| graph.links()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.host.nodes.len()
    }

    /// Decodes and applies one message from the server.
    pub fn receive(&mut self, bytes: impl Into<Bytes>) -> Result<(), BlockGraphError> {
        let message = SyncMessage::decode(bytes, &mut self.palette, &self.universe)?;
        self.apply(message)
    }

    pub fn apply(&mut self, message: SyncMessage) -> Result<(), BlockGraphError> {
        tracing::trace!("[GraphMirror::apply] {}", message.kind());
        match message {
            SyncMessage::Snapshot(snapshot) => self.apply_snapshot(snapshot),
            SyncMessage::NodeAdd {
                graph_id,
                graph_entities,
                node,
            } => self.apply_node_add(graph_id, &graph_entities, node),
            SyncMessage::NodeRemove { graph_id, node } => {
                self.apply_node_remove(graph_id, &node);
                Ok(())
            }
            SyncMessage::Link { graph_id, link } => self.apply_link(graph_id, link),
            SyncMessage::Unlink { graph_id, link } => {
                self.apply_unlink(graph_id, &link);
                Ok(())
            }
            SyncMessage::Merge {
                from_id,
                into_id,
                into_entities,
            } => self.apply_merge(from_id, into_id, &into_entities),
            SyncMessage::Split {
                from_id,
                into_id,
                into_entities,
                moved,
            } => self.apply_split(from_id, into_id, &into_entities, &moved),
        }
    }

    /// Moves the view, discarding everything mirrored outside it.
    pub fn set_view(&mut self, center: ChunkSectionPos, radius: u32) {
        self.center = center;
        self.radius = radius;
        let outside: Vec<ChunkSectionPos> = self
            .host
            .sections
            .keys()
            .copied()
            .filter(|section| !self.in_view(*section))
            .collect();
        for section in outside {
            self.clear_section(section);
        }
    }

    fn decode_graph_entities(
        &self,
        payloads: &[EntityPayload],
    ) -> Result<BTreeMap<TypeKey, Box<dyn GraphEntity>>, BlockGraphError> {
        let mut entities = self.universe.new_graph_entities();
        for payload in payloads {
            entities.insert(
                payload.type_key.clone(),
                self.universe.decode_graph_entity(payload)?,
            );
        }
        Ok(entities)
    }

    fn decode_node_entity(
        &self,
        payload: Option<&EntityPayload>,
    ) -> Result<Option<Box<dyn NodeEntity>>, BlockGraphError> {
        payload
            .map(|payload| self.universe.decode_node_entity(payload))
            .transpose()
    }

    fn decode_link_entity(
        &self,
        payload: Option<&EntityPayload>,
    ) -> Result<Option<Box<dyn LinkEntity>>, BlockGraphError> {
        payload
            .map(|payload| self.universe.decode_link_entity(payload))
            .transpose()
    }

    fn ensure_graph(&mut self, graph_id: u64, entities: &[EntityPayload]) -> Result<(), BlockGraphError> {
        if !self.graphs.contains_key(&graph_id) {
            let entities = self.decode_graph_entities(entities)?;
            self.graphs
                .insert(graph_id, BlockGraph::with_entities(graph_id, entities));
        }
        Ok(())
    }

    fn drop_if_empty(&mut self, graph_id: u64) {
        if self.graphs.get(&graph_id).is_some_and(|graph| graph.is_empty()) {
            if let Some(mut graph) = self.graphs.remove(&graph_id) {
                graph.on_destroy();
            }
            self.host.forget_graph(graph_id);
        }
    }

    fn apply_node_add(
        &mut self,
        graph_id: u64,
        graph_entities: &[EntityPayload],
        node: SyncNode,
    ) -> Result<(), BlockGraphError> {
        if !self.in_view(node.node.pos.section()) {
            return Ok(());
        }
        if let Some(existing) = self.host.nodes.get(&node.node) {
            tracing::debug!(
                "[GraphMirror::apply_node_add] {} already mirrored in graph {existing:016X}",
                node.node
            );
            return Ok(());
        }
        let entity = self.decode_node_entity(node.entity.as_ref())?;
        self.ensure_graph(graph_id, graph_entities)?;
        let Some(graph) = self.graphs.get_mut(&graph_id) else {
            return Ok(());
        };
        graph.create_node(&mut self.host, node.node.pos, node.node.node, entity);
        Ok(())
    }

    fn apply_node_remove(&mut self, graph_id: u64, node: &NodePos) {
        let Some(graph) = self.graphs.get_mut(&graph_id) else {
            return;
        };
        let Some(ix) = graph.find(node) else {
            return;
        };
        graph.destroy_node(&mut self.host, ix);
        self.drop_if_empty(graph_id);
    }

    fn apply_link(&mut self, graph_id: u64, link: SyncLink) -> Result<(), BlockGraphError> {
        let entity = self.decode_link_entity(link.entity.as_ref())?;
        let Some(graph) = self.graphs.get_mut(&graph_id) else {
            return Ok(());
        };
        let (Some(a), Some(b)) = (graph.find(&link.link.first), graph.find(&link.link.second))
        else {
            return Ok(());
        };
        graph.link(&mut self.host, a, b, link.link.key, entity);
        Ok(())
    }

    fn apply_unlink(&mut self, graph_id: u64, link: &LinkPos) {
        let Some(graph) = self.graphs.get_mut(&graph_id) else {
            return;
        };
        if let (Some(a), Some(b)) = (graph.find(&link.first), graph.find(&link.second)) {
            graph.unlink(&mut self.host, a, b, &link.key);
        }
    }

    fn apply_merge(
        &mut self,
        from_id: u64,
        into_id: u64,
        into_entities: &[EntityPayload],
    ) -> Result<(), BlockGraphError> {
        if from_id == into_id || !self.graphs.contains_key(&from_id) {
            return Ok(());
        }
        self.ensure_graph(into_id, into_entities)?;
        let (Some(from), Some(into)) = (self.graphs.remove(&from_id), self.graphs.get_mut(&into_id))
        else {
            return Ok(());
        };
        into.merge(&mut self.host, from);
        self.host.forget_graph(from_id);
        Ok(())
    }

    fn apply_split(
        &mut self,
        from_id: u64,
        into_id: u64,
        into_entities: &[EntityPayload],
        moved: &[NodePos],
    ) -> Result<(), BlockGraphError> {
        let Some(mut from) = self.graphs.remove(&from_id) else {
            return Ok(());
        };
        let mut into = match self.graphs.remove(&into_id) {
            Some(existing) => existing,
            None => match self.decode_graph_entities(into_entities) {
                Ok(entities) => BlockGraph::with_entities(into_id, entities),
                Err(err) => {
                    self.graphs.insert(from_id, from);
                    return Err(err);
                }
            },
        };
        from.split_into(&mut self.host, &mut into, moved);

        if !into.is_empty() {
            self.graphs.insert(into_id, into);
        }
        self.graphs.insert(from_id, from);
        self.drop_if_empty(from_id);
        Ok(())
    }

    /// Removes every mirrored node in `section`, along with graphs left empty.
    fn clear_section(&mut self, section: ChunkSectionPos) {
        let ids: Vec<u64> = self
            .host
            .sections
            .get(&section)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            let Some(graph) = self.graphs.get_mut(&id) else {
                continue;
            };
            let nodes: Vec<NodePos> = graph.nodes_in_section(section).into_iter().cloned().collect();
            for node in nodes {
                if let Some(ix) = graph.find(&node) {
                    graph.destroy_node(&mut self.host, ix);
                }
            }
            self.drop_if_empty(id);
        }
        self.host.sections.remove(&section);
    }

    fn apply_snapshot(&mut self, snapshot: ChunkSnapshot) -> Result<(), BlockGraphError> {
        let section = snapshot.section;
        if !self.in_view(section) {
            tracing::debug!(
                "[GraphMirror::apply_snapshot] Ignoring snapshot of {section} outside the view"
            );
            return Ok(());
        }

        // Decode everything up front so a bad entity leaves the mirror untouched.
        let mut decoded = Vec::with_capacity(snapshot.graphs.len());
        for graph in snapshot.graphs {
            let entities = self.decode_graph_entities(&graph.entities)?;
            let mut nodes = Vec::with_capacity(graph.nodes.len());
            for node in graph.nodes {
                let entity = self.decode_node_entity(node.entity.as_ref())?;
                nodes.push((node.node, entity));
            }
            let mut internal = Vec::with_capacity(graph.internal_links.len());
            for link in graph.internal_links {
                let entity = self.decode_link_entity(link.entity.as_ref())?;
                internal.push((link.first as usize, link.second as usize, link.key, entity));
            }
            let mut external = Vec::with_capacity(graph.external_links.len());
            for link in graph.external_links {
                let entity = self.decode_link_entity(link.entity.as_ref())?;
                external.push((link.link, entity));
            }
            decoded.push((graph.graph_id, entities, nodes, internal, external));
        }

        self.clear_section(section);

        for (graph_id, entities, nodes, internal, external) in decoded {
            let graph = self
                .graphs
                .entry(graph_id)
                .or_insert_with(|| BlockGraph::with_entities(graph_id, BTreeMap::new()));
            graph.set_entities(entities);

            let mut indices = Vec::with_capacity(nodes.len());
            for (node, entity) in nodes {
                indices.push(graph.create_node(&mut self.host, node.pos, node.node, entity));
            }
            for (first, second, key, entity) in internal {
                if let (Some(&a), Some(&b)) = (indices.get(first), indices.get(second)) {
                    graph.link(&mut self.host, a, b, key, entity);
                }
            }
            for (link, entity) in external {
                if let (Some(a), Some(b)) = (graph.find(&link.first), graph.find(&link.second)) {
                    graph.link(&mut self.host, a, b, link.key, entity);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        nodekey::LinkKey,
        tests::helpers::{test_universe, wire},
    };

    fn wire_at(x: i32, y: i32, z: i32) -> NodePos {
        NodePos::new(BlockPos::new(x, y, z), wire())
    }

    fn node_add(graph_id: u64, node: NodePos) -> SyncMessage {
        SyncMessage::NodeAdd {
            graph_id,
            graph_entities: Vec::new(),
            node: SyncNode { node, entity: None },
        }
    }

    #[test]
    fn test_node_add_outside_view_is_dropped() {
        let mut mirror = GraphMirror::new(test_universe(), ChunkSectionPos::new(0, 0, 0), 1);
        mirror.apply(node_add(1, wire_at(0, 0, 0))).unwrap();
        mirror.apply(node_add(2, wire_at(100, 0, 0))).unwrap();
        assert_eq!(mirror.graph_ids(), vec![1]);
        assert_eq!(mirror.node_count(), 1);
    }

    #[test]
    fn test_unknown_references_are_ignored() {
        let mut mirror = GraphMirror::new(test_universe(), ChunkSectionPos::new(0, 0, 0), 2);
        mirror.apply(node_add(1, wire_at(0, 0, 0))).unwrap();

        mirror
            .apply(SyncMessage::Link {
                graph_id: 1,
                link: SyncLink {
                    link: LinkPos::new(wire_at(0, 0, 0), wire_at(1, 0, 0), LinkKey::empty()),
                    entity: None,
                },
            })
            .unwrap();
        mirror
            .apply(SyncMessage::Merge {
                from_id: 9,
                into_id: 1,
                into_entities: Vec::new(),
            })
            .unwrap();
        mirror
            .apply(SyncMessage::NodeRemove {
                graph_id: 1,
                node: wire_at(3, 3, 3),
            })
            .unwrap();

        assert_eq!(mirror.graph_ids(), vec![1]);
        assert!(mirror.links().is_empty());
    }

    #[test]
    fn test_merge_into_unknown_graph_creates_it() {
        let mut mirror = GraphMirror::new(test_universe(), ChunkSectionPos::new(0, 0, 0), 2);
        mirror.apply(node_add(4, wire_at(0, 0, 0))).unwrap();
        mirror
            .apply(SyncMessage::Merge {
                from_id: 4,
                into_id: 7,
                into_entities: Vec::new(),
            })
            .unwrap();
        assert_eq!(mirror.graph_ids(), vec![7]);
        assert_eq!(mirror.graph_of(&wire_at(0, 0, 0)), Some(7));
    }

    #[test]
    fn test_split_moves_only_known_nodes() {
        let mut mirror = GraphMirror::new(test_universe(), ChunkSectionPos::new(0, 0, 0), 2);
        mirror.apply(node_add(1, wire_at(0, 0, 0))).unwrap();
        mirror.apply(node_add(1, wire_at(1, 0, 0))).unwrap();
        mirror
            .apply(SyncMessage::Split {
                from_id: 1,
                into_id: 2,
                into_entities: Vec::new(),
                moved: vec![wire_at(1, 0, 0), wire_at(200, 0, 0)],
            })
            .unwrap();
        assert_eq!(mirror.graph_of(&wire_at(0, 0, 0)), Some(1));
        assert_eq!(mirror.graph_of(&wire_at(1, 0, 0)), Some(2));
        assert_eq!(mirror.graph(2).map(|graph| graph.size()), Some(1));
    }

    #[test]
    fn test_set_view_discards_far_sections() {
        let mut mirror = GraphMirror::new(test_universe(), ChunkSectionPos::new(0, 0, 0), 3);
        mirror.apply(node_add(1, wire_at(0, 0, 0))).unwrap();
        mirror.apply(node_add(2, wire_at(40, 0, 0))).unwrap();
        assert_eq!(mirror.graph_ids(), vec![1, 2]);

        mirror.set_view(ChunkSectionPos::new(3, 0, 0), 1);
        assert_eq!(mirror.graph_ids(), vec![2]);
        assert_eq!(mirror.node_count(), 1);
    }
}
