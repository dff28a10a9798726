use petgraph::{
    stable_graph::{EdgeIndex, NodeIndex, StableGraph},
    visit::{depth_first_search, Control, DfsEvent, EdgeRef, IntoEdgeReferences},
    Undirected,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
};

use super::GraphHost;
use crate::{
    entity::{EntityPayload, GraphEntity, LinkEntity, NodeEntity},
    nodekey::{HalfLink, LinkKey, LinkPos, NodePos, NodeValue},
    properties::{BlockPos, ChunkSectionPos, TypeKey},
    sync::{GraphDelta, SyncLink, SyncMessage, SyncNode},
    universe::GraphUniverse,
};

pub struct NodeSlot {
    pub(crate) node: NodePos,
    pub(crate) entity: Option<Box<dyn NodeEntity>>,
}

impl NodeSlot {
    pub(crate) fn new(node: NodePos, entity: Option<Box<dyn NodeEntity>>) -> Self {
        NodeSlot { node, entity }
    }

    pub fn node(&self) -> &NodePos {
        &self.node
    }

    pub fn entity(&self) -> Option<&dyn NodeEntity> {
        self.entity.as_deref()
    }

    fn to_sync(&self) -> SyncNode {
        SyncNode {
            node: self.node.clone(),
            entity: self.entity.as_ref().map(|e| e.to_entity_payload()),
        }
    }
}

pub struct LinkSlot {
    pub(crate) key: LinkKey,
    pub(crate) entity: Option<Box<dyn LinkEntity>>,
}

impl LinkSlot {
    pub(crate) fn new(key: LinkKey, entity: Option<Box<dyn LinkEntity>>) -> Self {
        LinkSlot { key, entity }
    }

    pub fn key(&self) -> &LinkKey {
        &self.key
    }

    pub fn entity(&self) -> Option<&dyn LinkEntity> {
        self.entity.as_deref()
    }
}

type NodeArena = StableGraph<NodeSlot, LinkSlot, Undirected>;

/// One connected component.
pub struct BlockGraph {
    id: u64,
    arena: NodeArena,
    index: HashMap<NodePos, NodeIndex>,
    positions: HashMap<BlockPos, Vec<NodeIndex>>,
    sections: BTreeMap<ChunkSectionPos, usize>,
    entities: BTreeMap<TypeKey, Box<dyn GraphEntity>>,
}

impl BlockGraph {
    /// An empty graph carrying a fresh instance of every graph entity type in `universe`.
    pub fn new(id: u64, universe: &GraphUniverse) -> Self {
        BlockGraph::with_entities(id, universe.new_graph_entities())
    }

    pub(crate) fn with_entities(id: u64, entities: BTreeMap<TypeKey, Box<dyn GraphEntity>>) -> Self {
        BlockGraph {
            id,
            arena: NodeArena::default(),
            index: HashMap::new(),
            positions: HashMap::new(),
            sections: BTreeMap::new(),
            entities,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Node count.
    pub fn size(&self) -> usize {
        self.arena.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.node_count() == 0
    }

    pub fn link_count(&self) -> usize {
        self.arena.edge_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &NodePos)> + '_ {
        self.arena
            .node_indices()
            .map(move |ix| (ix, &self.arena[ix].node))
    }

    pub fn node(&self, ix: NodeIndex) -> Option<&NodePos> {
        self.arena.node_weight(ix).map(|slot| &slot.node)
    }

    pub fn slot(&self, ix: NodeIndex) -> Option<&NodeSlot> {
        self.arena.node_weight(ix)
    }

    pub fn find(&self, node: &NodePos) -> Option<NodeIndex> {
        self.index.get(node).copied()
    }

    pub fn contains(&self, node: &NodePos) -> bool {
        self.index.contains_key(node)
    }

    pub fn nodes_at(&self, pos: BlockPos) -> impl Iterator<Item = (NodeIndex, &NodePos)> + '_ {
        self.positions
            .get(&pos)
            .into_iter()
            .flatten()
            .map(move |&ix| (ix, &self.arena[ix].node))
    }

    pub fn nodes_in_section(&self, section: ChunkSectionPos) -> Vec<&NodePos> {
        if !self.sections.contains_key(&section) {
            return Vec::new();
        }
        self.arena
            .node_weights()
            .map(|slot| &slot.node)
            .filter(|node| node.pos.section() == section)
            .collect()
    }

    /// Every chunk section this graph has at least one node in.
    pub fn sections(&self) -> impl Iterator<Item = ChunkSectionPos> + '_ {
        self.sections.keys().copied()
    }

    pub fn in_section(&self, section: ChunkSectionPos) -> bool {
        self.sections.contains_key(&section)
    }

    pub fn links(&self) -> impl Iterator<Item = LinkPos> + '_ {
        self.arena.edge_references().map(move |edge| {
            LinkPos::new(
                self.arena[edge.source()].node.clone(),
                self.arena[edge.target()].node.clone(),
                edge.weight().key.clone(),
            )
        })
    }

    /// Raw link list: endpoint indices and the link slot.
    pub fn link_slots(&self) -> impl Iterator<Item = (NodeIndex, NodeIndex, &LinkSlot)> + '_ {
        self.arena
            .edge_references()
            .map(|edge| (edge.source(), edge.target(), edge.weight()))
    }

    /// Links of `ix`, seen from `ix`.
    pub fn connections(&self, ix: NodeIndex) -> Vec<HalfLink> {
        if !self.arena.contains_node(ix) {
            return Vec::new();
        }
        self.arena
            .edges(ix)
            .map(|edge| {
                let other = if edge.source() == ix { edge.target() } else { edge.source() };
                HalfLink::new(self.arena[other].node.clone(), edge.weight().key.clone())
            })
            .collect()
    }

    pub fn find_link(&self, a: NodeIndex, b: NodeIndex, key: &LinkKey) -> Option<EdgeIndex> {
        if !self.arena.contains_node(a) || !self.arena.contains_node(b) {
            return None;
        }
        self.arena
            .edges(a)
            .find(|edge| {
                let other = if edge.source() == a { edge.target() } else { edge.source() };
                other == b && &edge.weight().key == key
            })
            .map(|edge| edge.id())
    }

    pub fn node_entity(&self, ix: NodeIndex) -> Option<&dyn NodeEntity> {
        self.arena.node_weight(ix).and_then(|slot| slot.entity.as_deref())
    }

    pub fn node_entity_mut(&mut self, ix: NodeIndex) -> Option<&mut (dyn NodeEntity + 'static)> {
        self.arena
            .node_weight_mut(ix)
            .and_then(|slot| slot.entity.as_deref_mut())
    }

    pub fn link_entity(&self, link: EdgeIndex) -> Option<&dyn LinkEntity> {
        self.arena
            .edge_weight(link)
            .and_then(|slot| slot.entity.as_deref())
    }

    pub fn graph_entity(&self, key: &TypeKey) -> Option<&dyn GraphEntity> {
        self.entities.get(key).map(|entity| entity.as_ref())
    }

    pub fn graph_entity_mut(&mut self, key: &TypeKey) -> Option<&mut (dyn GraphEntity + 'static)> {
        self.entities.get_mut(key).map(|entity| entity.as_mut())
    }

    pub fn graph_entities(&self) -> impl Iterator<Item = &dyn GraphEntity> + '_ {
        self.entities.values().map(|entity| entity.as_ref())
    }

    /// Replaces every graph entity, as when a mirror receives authoritative state.
    pub(crate) fn set_entities(&mut self, entities: BTreeMap<TypeKey, Box<dyn GraphEntity>>) {
        self.entities = entities;
    }

    pub fn entity_payloads(&self) -> Vec<EntityPayload> {
        self.entities
            .values()
            .map(|entity| entity.to_entity_payload())
            .collect()
    }

    pub(crate) fn sync_node(&self, ix: NodeIndex) -> Option<SyncNode> {
        self.arena.node_weight(ix).map(NodeSlot::to_sync)
    }

    pub(crate) fn sync_link(&self, link: EdgeIndex) -> Option<SyncLink> {
        let (a, b) = self.arena.edge_endpoints(link)?;
        let slot = self.arena.edge_weight(link)?;
        Some(SyncLink {
            link: LinkPos::new(
                self.arena[a].node.clone(),
                self.arena[b].node.clone(),
                slot.key.clone(),
            ),
            entity: slot.entity.as_ref().map(|e| e.to_entity_payload()),
        })
    }

    /// Connected components in traversal order; the last one is the one a split keeps.
    pub fn components(&self) -> Vec<Vec<NodeIndex>> {
        let mut unchecked: BTreeSet<NodeIndex> = self.arena.node_indices().collect();
        let mut components = Vec::new();
        while let Some(&start) = unchecked.iter().next() {
            let mut component = Vec::new();
            depth_first_search(&self.arena, Some(start), |event| {
                if let DfsEvent::Discover(ix, _) = event {
                    component.push(ix);
                }
                Control::<()>::Continue
            });
            for ix in component.iter() {
                unchecked.remove(ix);
            }
            components.push(component);
        }
        components
    }

    pub fn is_connected(&self) -> bool {
        self.components().len() <= 1
    }

    /// Adds a node with no side effects outside the graph. Used when decoding.
    pub(crate) fn insert_slot(&mut self, slot: NodeSlot) -> NodeIndex {
        let pos = slot.node.pos;
        let node = slot.node.clone();
        let ix = self.arena.add_node(slot);
        self.index.insert(node, ix);
        self.positions.entry(pos).or_default().push(ix);
        *self.sections.entry(pos.section()).or_insert(0) += 1;
        ix
    }

    pub(crate) fn insert_link_slot(&mut self, a: NodeIndex, b: NodeIndex, slot: LinkSlot) -> EdgeIndex {
        self.arena.add_edge(a, b, slot)
    }

    /// Removes a node (and any links still attached to it) and reports the index changes.
    fn detach_node(&mut self, host: &mut dyn GraphHost, ix: NodeIndex) -> Option<NodeSlot> {
        let slot = self.arena.remove_node(ix)?;
        let node = &slot.node;
        self.index.remove(node);
        host.remove_graph_with_node(self.id, node);

        if let Some(at_pos) = self.positions.get_mut(&node.pos) {
            at_pos.retain(|other| *other != ix);
            if at_pos.is_empty() {
                self.positions.remove(&node.pos);
                host.remove_graph_in_pos(self.id, node.pos);
            }
        }

        let section = node.pos.section();
        if let Some(count) = self.sections.get_mut(&section) {
            *count -= 1;
            if *count == 0 {
                self.sections.remove(&section);
                host.remove_graph_in_chunk(self.id, section);
            }
        }
        Some(slot)
    }

    pub fn create_node(
        &mut self,
        host: &mut dyn GraphHost,
        pos: BlockPos,
        value: NodeValue,
        entity: Option<Box<dyn NodeEntity>>,
    ) -> NodeIndex {
        let node = NodePos::new(pos, value);
        if let Some(existing) = self.find(&node) {
            return existing;
        }

        let mut entity = entity.or_else(|| node.node.create_node_entity(&node));
        if let Some(entity) = entity.as_mut() {
            entity.on_added(&node);
        }
        let ix = self.insert_slot(NodeSlot::new(node.clone(), entity));
        host.put_graph_with_node(self.id, &node);

        let node_entity = self.arena[ix].entity.as_deref();
        for graph_entity in self.entities.values_mut() {
            graph_entity.on_node_created(&node, node_entity);
        }
        host.mark_dirty(self.id);

        if host.records_deltas() {
            if let Some(sync_node) = self.sync_node(ix) {
                host.push_delta(GraphDelta::new(
                    vec![pos.section()],
                    SyncMessage::NodeAdd {
                        graph_id: self.id,
                        graph_entities: self.entity_payloads(),
                        node: sync_node,
                    },
                ));
            }
        }
        ix
    }

    /// Destroys a node and its links. Returns true when the graph is left empty, in which case
    /// the owner must destroy it; otherwise the owner decides whether to split.
    pub fn destroy_node(&mut self, host: &mut dyn GraphHost, ix: NodeIndex) -> bool {
        let Some(node) = self.node(ix).cloned() else {
            return self.is_empty();
        };

        if host.records_deltas() {
            host.push_delta(GraphDelta::new(
                vec![node.pos.section()],
                SyncMessage::NodeRemove {
                    graph_id: self.id,
                    node: node.clone(),
                },
            ));
        }

        let incident: Vec<EdgeIndex> = self.arena.edges(ix).map(|edge| edge.id()).collect();
        let mut removed_links = Vec::new();
        for link in incident {
            let Some((a, b)) = self.arena.edge_endpoints(link) else {
                continue;
            };
            let other = if a == ix { b } else { a };
            if other != ix {
                host.schedule_callback(&self.arena[other].node, true);
            }
            let pos = LinkPos::new(
                self.arena[a].node.clone(),
                self.arena[b].node.clone(),
                self.arena[link].key.clone(),
            );
            if let Some(slot) = self.arena.remove_edge(link) {
                removed_links.push((pos, slot));
            }
        }

        let Some(mut slot) = self.detach_node(host, ix) else {
            return self.is_empty();
        };

        if let Some(entity) = slot.entity.as_mut() {
            entity.on_delete();
        }
        for (_, link) in removed_links.iter_mut() {
            if let Some(entity) = link.entity.as_mut() {
                entity.on_delete();
            }
        }
        let removed: Vec<(LinkPos, Option<&dyn LinkEntity>)> = removed_links
            .iter()
            .map(|(pos, link)| (pos.clone(), link.entity.as_deref()))
            .collect();
        for graph_entity in self.entities.values_mut() {
            graph_entity.on_node_destroyed(&node, slot.entity.as_deref(), &removed);
        }
        host.mark_dirty(self.id);
        self.is_empty()
    }

    /// Links two nodes of this graph. Linking an already linked pair with the same key returns
    /// the existing link and drops `entity`.
    pub fn link(
        &mut self,
        host: &mut dyn GraphHost,
        a: NodeIndex,
        b: NodeIndex,
        key: LinkKey,
        entity: Option<Box<dyn LinkEntity>>,
    ) -> Option<EdgeIndex> {
        if !self.arena.contains_node(a) || !self.arena.contains_node(b) {
            return None;
        }
        if let Some(existing) = self.find_link(a, b, &key) {
            return Some(existing);
        }

        let link = LinkPos::new(
            self.arena[a].node.clone(),
            self.arena[b].node.clone(),
            key.clone(),
        );
        let entity = entity.or_else(|| key.create_link_entity(&link));
        let edge = self.arena.add_edge(a, b, LinkSlot::new(key, entity));

        host.schedule_callback(&link.first, false);
        host.schedule_callback(&link.second, false);
        for graph_entity in self.entities.values_mut() {
            graph_entity.on_link(&link.first, &link.second, &link.key);
        }
        host.mark_dirty(self.id);

        if host.records_deltas() {
            if let Some(sync_link) = self.sync_link(edge) {
                host.push_delta(GraphDelta::new(
                    link_sections(&link),
                    SyncMessage::Link {
                        graph_id: self.id,
                        link: sync_link,
                    },
                ));
            }
        }
        Some(edge)
    }

    /// Removes the link keyed `key` between `a` and `b`. Returns false if there was none.
    pub fn unlink(
        &mut self,
        host: &mut dyn GraphHost,
        a: NodeIndex,
        b: NodeIndex,
        key: &LinkKey,
    ) -> bool {
        let Some(edge) = self.find_link(a, b, key) else {
            return false;
        };
        let link = LinkPos::new(
            self.arena[a].node.clone(),
            self.arena[b].node.clone(),
            key.clone(),
        );

        if host.records_deltas() {
            host.push_delta(GraphDelta::new(
                link_sections(&link),
                SyncMessage::Unlink {
                    graph_id: self.id,
                    link: link.clone(),
                },
            ));
        }

        let Some(mut slot) = self.arena.remove_edge(edge) else {
            return false;
        };
        if let Some(entity) = slot.entity.as_mut() {
            entity.on_delete();
        }

        host.schedule_callback(&link.first, true);
        host.schedule_callback(&link.second, true);
        for graph_entity in self.entities.values_mut() {
            graph_entity.on_unlink(&link.first, &link.second, &link.key);
        }
        host.mark_dirty(self.id);
        true
    }

    /// Absorbs `other`: its nodes, links and entities move into this graph and are reported to
    /// the host under this graph's id. The caller is responsible for forgetting `other`'s id.
    pub fn merge(&mut self, host: &mut dyn GraphHost, mut other: BlockGraph) {
        if other.id == self.id {
            tracing::warn!("[BlockGraph::merge] Refusing to merge graph {} into itself", self.id);
            return;
        }

        if host.records_deltas() {
            let sections: BTreeSet<ChunkSectionPos> =
                self.sections().chain(other.sections()).collect();
            host.push_delta(GraphDelta::new(
                sections.into_iter().collect(),
                SyncMessage::Merge {
                    from_id: other.id,
                    into_id: self.id,
                    into_entities: self.entity_payloads(),
                },
            ));
        }

        let edge_ids: Vec<EdgeIndex> = other.arena.edge_indices().collect();
        let mut moved_links = Vec::with_capacity(edge_ids.len());
        for edge in edge_ids {
            if let Some((a, b)) = other.arena.edge_endpoints(edge) {
                if let Some(slot) = other.arena.remove_edge(edge) {
                    moved_links.push((a, b, slot));
                }
            }
        }

        let node_ids: Vec<NodeIndex> = other.arena.node_indices().collect();
        let mut mapping = HashMap::with_capacity(node_ids.len());
        for old in node_ids {
            let Some(slot) = other.arena.remove_node(old) else {
                continue;
            };
            if let Some(existing) = self.find(&slot.node) {
                tracing::warn!(
                    "[BlockGraph::merge] Node {} exists in both graph {} and graph {}. Keeping one.",
                    slot.node,
                    self.id,
                    other.id
                );
                mapping.insert(old, existing);
                continue;
            }
            host.put_graph_with_node(self.id, &slot.node);
            mapping.insert(old, self.insert_slot(slot));
        }

        for (a, b, slot) in moved_links {
            let (Some(&a), Some(&b)) = (mapping.get(&a), mapping.get(&b)) else {
                continue;
            };
            if self.find_link(a, b, &slot.key).is_none() {
                self.arena.add_edge(a, b, slot);
            }
        }

        for (key, entity) in std::mem::take(&mut other.entities) {
            match self.entities.get_mut(&key) {
                Some(ours) => ours.merge(entity),
                None => {
                    tracing::warn!(
                        "[BlockGraph::merge] Graph {} has no '{}' entity to merge graph {}'s into. Adopting it.",
                        self.id,
                        key,
                        other.id
                    );
                    self.entities.insert(key, entity);
                }
            }
        }

        host.mark_dirty(self.id);
    }

    /// Splits off every connected component but one into new graphs with ids from `alloc`.
    ///
    /// The component kept under this graph's id is the last one found by the traversal, unless
    /// a split-off component is larger, in which case the largest is kept instead. Returns an
    /// empty list when the graph is still connected.
    pub fn split(
        &mut self,
        host: &mut dyn GraphHost,
        alloc: &mut dyn FnMut() -> u64,
    ) -> Vec<BlockGraph> {
        let mut components = self.components();
        if components.len() <= 1 {
            return Vec::new();
        }

        let Some(mut kept) = components.pop() else {
            return Vec::new();
        };
        let largest = components
            .iter()
            .enumerate()
            .map(|(i, component)| (i, component.len()))
            .max_by_key(|(_, len)| *len);
        if let Some((largest, len)) = largest {
            if len > kept.len() {
                std::mem::swap(&mut components[largest], &mut kept);
            }
        }

        let original_sections: Vec<ChunkSectionPos> = self.sections().collect();
        let mut split_off = Vec::with_capacity(components.len());
        for component in components {
            let mut new_graph = BlockGraph::with_entities(alloc(), BTreeMap::new());
            let moved = self.move_nodes_into(host, &mut new_graph, &component);

            let new_entities: Vec<(TypeKey, Box<dyn GraphEntity>)> = self
                .entities
                .iter()
                .map(|(key, entity)| (key.clone(), entity.split_new(self, &new_graph)))
                .collect();
            new_graph.entities.extend(new_entities);

            if host.records_deltas() {
                host.push_delta(GraphDelta::new(
                    original_sections.clone(),
                    SyncMessage::Split {
                        from_id: self.id,
                        into_id: new_graph.id,
                        into_entities: new_graph.entity_payloads(),
                        moved,
                    },
                ));
            }
            host.mark_dirty(new_graph.id);
            split_off.push(new_graph);
        }

        host.mark_dirty(self.id);
        split_off
    }

    /// Moves the listed nodes (the ones this graph actually holds) into `into`, together with
    /// the links among them. Used by mirrors replaying a split they only partially see.
    pub(crate) fn split_into(
        &mut self,
        host: &mut dyn GraphHost,
        into: &mut BlockGraph,
        nodes: &[NodePos],
    ) -> Vec<NodePos> {
        let indices: Vec<NodeIndex> = nodes.iter().filter_map(|node| self.find(node)).collect();
        self.move_nodes_into(host, into, &indices)
    }

    fn move_nodes_into(
        &mut self,
        host: &mut dyn GraphHost,
        into: &mut BlockGraph,
        nodes: &[NodeIndex],
    ) -> Vec<NodePos> {
        let moving: HashSet<NodeIndex> = nodes.iter().copied().collect();

        let mut links = Vec::new();
        let mut seen = HashSet::new();
        for &ix in nodes {
            let incident: Vec<EdgeIndex> = self.arena.edges(ix).map(|edge| edge.id()).collect();
            for edge in incident {
                if !seen.insert(edge) {
                    continue;
                }
                let Some((a, b)) = self.arena.edge_endpoints(edge) else {
                    continue;
                };
                let Some(mut slot) = self.arena.remove_edge(edge) else {
                    continue;
                };
                if moving.contains(&a) && moving.contains(&b) {
                    links.push((a, b, slot));
                } else {
                    tracing::debug!(
                        "[BlockGraph::move_nodes_into] Dropping link crossing out of graph {}",
                        self.id
                    );
                    if let Some(entity) = slot.entity.as_mut() {
                        entity.on_delete();
                    }
                }
            }
        }

        let mut mapping = HashMap::with_capacity(nodes.len());
        let mut moved = Vec::with_capacity(nodes.len());
        for &ix in nodes {
            let Some(slot) = self.detach_node(host, ix) else {
                continue;
            };
            moved.push(slot.node.clone());
            host.put_graph_with_node(into.id, &slot.node);
            mapping.insert(ix, into.insert_slot(slot));
        }

        for (a, b, slot) in links {
            if let (Some(&a), Some(&b)) = (mapping.get(&a), mapping.get(&b)) {
                into.arena.add_edge(a, b, slot);
            }
        }
        moved
    }

    pub fn tick(&mut self) {
        for entity in self.entities.values_mut() {
            entity.on_tick();
        }
    }

    /// The graph is leaving memory but continues to exist on disk.
    pub fn on_unload(&mut self) {
        for slot in self.arena.node_weights_mut() {
            if let Some(entity) = slot.entity.as_mut() {
                entity.on_unload();
            }
        }
        for slot in self.arena.edge_weights_mut() {
            if let Some(entity) = slot.entity.as_mut() {
                entity.on_unload();
            }
        }
        for entity in self.entities.values_mut() {
            entity.on_unload();
        }
    }

    pub fn on_destroy(&mut self) {
        for entity in self.entities.values_mut() {
            entity.on_destroy();
        }
    }
}

impl fmt::Debug for BlockGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockGraph")
            .field("id", &format_args!("{:016X}", self.id))
            .field("nodes", &self.arena.node_count())
            .field("links", &self.arena.edge_count())
            .field("sections", &self.sections.len())
            .field("entities", &self.entities.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn link_sections(link: &LinkPos) -> Vec<ChunkSectionPos> {
    let first = link.first.pos.section();
    let second = link.second.pos.section();
    if first == second {
        vec![first]
    } else {
        vec![first, second]
    }
}
