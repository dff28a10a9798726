//! The type registry every component resolves identifiers through.
//!
//! A [`GraphUniverse`] is built once with [`UniverseBuilder`] and shared as
//! `Arc<GraphUniverse>` by the store, the codecs and sync mirrors. It maps [`TypeKey`]s to
//! decoders for node values, link keys and entities, lists the graph entity types every graph
//! carries, and holds the [`NodeDiscoverer`]s consulted by node refreshes.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use crate::{
    codec::Payload,
    entity::{EntityPayload, GraphEntity, LinkEntity, NodeEntity},
    error::BlockGraphError,
    nodekey::{LinkKey, NodePos, NodeValue},
    properties::{BlockPos, TypeKey},
};

type Decoder<T> = Box<dyn Fn(&Payload) -> Result<T, BlockGraphError> + Send + Sync>;

/// Reports which node values should exist at a position. Supplied by the host world.
pub trait NodeDiscoverer: Send + Sync {
    fn discover(&self, pos: BlockPos) -> Vec<NodeValue>;
}

impl<F> NodeDiscoverer for F
where
    F: Fn(BlockPos) -> Vec<NodeValue> + Send + Sync,
{
    fn discover(&self, pos: BlockPos) -> Vec<NodeValue> {
        self(pos)
    }
}

/// Read access to the nodes currently present, used by connection discovery.
///
/// Takes `&mut self` because answering may load graphs from storage.
pub trait NodeView {
    fn nodes_at(&mut self, pos: BlockPos) -> Vec<NodeValue>;

    fn contains(&mut self, node: &NodePos) -> bool {
        self.nodes_at(node.pos).contains(&node.node)
    }
}

/// Registration for one graph entity type.
pub struct GraphEntityType {
    key: TypeKey,
    factory: Box<dyn Fn() -> Box<dyn GraphEntity> + Send + Sync>,
    decoder: Decoder<Box<dyn GraphEntity>>,
}

impl GraphEntityType {
    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    pub fn create(&self) -> Box<dyn GraphEntity> {
        (self.factory)()
    }

    pub fn decode(&self, payload: &Payload) -> Result<Box<dyn GraphEntity>, BlockGraphError> {
        (self.decoder)(payload)
    }
}

impl fmt::Debug for GraphEntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphEntityType")
            .field("key", &self.key)
            .finish()
    }
}

pub struct GraphUniverse {
    id: TypeKey,
    nodes: HashMap<TypeKey, Decoder<NodeValue>>,
    link_keys: HashMap<TypeKey, Decoder<LinkKey>>,
    node_entities: HashMap<TypeKey, Decoder<Box<dyn NodeEntity>>>,
    link_entities: HashMap<TypeKey, Decoder<Box<dyn LinkEntity>>>,
    graph_entities: BTreeMap<TypeKey, GraphEntityType>,
    discoverers: Vec<Box<dyn NodeDiscoverer>>,
}

impl GraphUniverse {
    pub fn builder(id: impl Into<TypeKey>) -> UniverseBuilder {
        UniverseBuilder::new(id.into())
    }

    pub fn id(&self) -> &TypeKey {
        &self.id
    }

    pub fn has_node_type(&self, key: &TypeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn has_link_key_type(&self, key: &TypeKey) -> bool {
        self.link_keys.contains_key(key)
    }

    pub fn has_node_entity_type(&self, key: &TypeKey) -> bool {
        self.node_entities.contains_key(key)
    }

    pub fn has_link_entity_type(&self, key: &TypeKey) -> bool {
        self.link_entities.contains_key(key)
    }

    pub fn has_graph_entity_type(&self, key: &TypeKey) -> bool {
        self.graph_entities.contains_key(key)
    }

    pub fn decode_node(&self, key: &TypeKey, payload: &Payload) -> Result<NodeValue, BlockGraphError> {
        let decoder = self
            .nodes
            .get(key)
            .ok_or_else(|| BlockGraphError::UnknownType(key.to_string()))?;
        decoder(payload)
    }

    pub fn decode_link_key(&self, key: &TypeKey, payload: &Payload) -> Result<LinkKey, BlockGraphError> {
        let decoder = self
            .link_keys
            .get(key)
            .ok_or_else(|| BlockGraphError::UnknownType(key.to_string()))?;
        decoder(payload)
    }

    pub fn decode_node_entity(
        &self,
        entity: &EntityPayload,
    ) -> Result<Box<dyn NodeEntity>, BlockGraphError> {
        let decoder = self
            .node_entities
            .get(&entity.type_key)
            .ok_or_else(|| BlockGraphError::UnknownType(entity.type_key.to_string()))?;
        decoder(&entity.payload)
    }

    pub fn decode_link_entity(
        &self,
        entity: &EntityPayload,
    ) -> Result<Box<dyn LinkEntity>, BlockGraphError> {
        let decoder = self
            .link_entities
            .get(&entity.type_key)
            .ok_or_else(|| BlockGraphError::UnknownType(entity.type_key.to_string()))?;
        decoder(&entity.payload)
    }

    pub fn graph_entity_type(&self, key: &TypeKey) -> Option<&GraphEntityType> {
        self.graph_entities.get(key)
    }

    pub fn graph_entity_types(&self) -> impl Iterator<Item = &GraphEntityType> {
        self.graph_entities.values()
    }

    pub fn decode_graph_entity(
        &self,
        entity: &EntityPayload,
    ) -> Result<Box<dyn GraphEntity>, BlockGraphError> {
        self.graph_entity_type(&entity.type_key)
            .ok_or_else(|| BlockGraphError::UnknownType(entity.type_key.to_string()))?
            .decode(&entity.payload)
    }

    /// A fresh instance of every registered graph entity type.
    pub fn new_graph_entities(&self) -> BTreeMap<TypeKey, Box<dyn GraphEntity>> {
        self.graph_entities
            .values()
            .map(|ty| (ty.key.clone(), ty.create()))
            .collect()
    }

    /// Union of what every discoverer reports at `pos`, first occurrence first.
    pub fn discover(&self, pos: BlockPos) -> Vec<NodeValue> {
        let mut found: Vec<NodeValue> = Vec::new();
        for discoverer in self.discoverers.iter() {
            for value in discoverer.discover(pos) {
                if !found.contains(&value) {
                    found.push(value);
                }
            }
        }
        found
    }
}

impl fmt::Debug for GraphUniverse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphUniverse")
            .field("id", &self.id)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("link_keys", &self.link_keys.keys().collect::<Vec<_>>())
            .field("graph_entities", &self.graph_entities.keys().collect::<Vec<_>>())
            .field("discoverers", &self.discoverers.len())
            .finish()
    }
}

pub struct UniverseBuilder {
    universe: GraphUniverse,
}

impl UniverseBuilder {
    fn new(id: TypeKey) -> Self {
        let mut universe = GraphUniverse {
            id,
            nodes: HashMap::new(),
            link_keys: HashMap::new(),
            node_entities: HashMap::new(),
            link_entities: HashMap::new(),
            graph_entities: BTreeMap::new(),
            discoverers: Vec::new(),
        };
        universe.link_keys.insert(
            TypeKey::from(crate::nodekey::EmptyLinkKey::TYPE_KEY),
            Box::new(|_| Ok(LinkKey::empty())),
        );
        UniverseBuilder { universe }
    }

    pub fn node_type<F>(mut self, key: impl Into<TypeKey>, decode: F) -> Self
    where
        F: Fn(&Payload) -> Result<NodeValue, BlockGraphError> + Send + Sync + 'static,
    {
        self.universe.nodes.insert(key.into(), Box::new(decode));
        self
    }

    pub fn link_key_type<F>(mut self, key: impl Into<TypeKey>, decode: F) -> Self
    where
        F: Fn(&Payload) -> Result<LinkKey, BlockGraphError> + Send + Sync + 'static,
    {
        self.universe.link_keys.insert(key.into(), Box::new(decode));
        self
    }

    pub fn node_entity_type<F>(mut self, key: impl Into<TypeKey>, decode: F) -> Self
    where
        F: Fn(&Payload) -> Result<Box<dyn NodeEntity>, BlockGraphError> + Send + Sync + 'static,
    {
        self.universe.node_entities.insert(key.into(), Box::new(decode));
        self
    }

    pub fn link_entity_type<F>(mut self, key: impl Into<TypeKey>, decode: F) -> Self
    where
        F: Fn(&Payload) -> Result<Box<dyn LinkEntity>, BlockGraphError> + Send + Sync + 'static,
    {
        self.universe.link_entities.insert(key.into(), Box::new(decode));
        self
    }

    pub fn graph_entity_type<C, D>(mut self, key: impl Into<TypeKey>, create: C, decode: D) -> Self
    where
        C: Fn() -> Box<dyn GraphEntity> + Send + Sync + 'static,
        D: Fn(&Payload) -> Result<Box<dyn GraphEntity>, BlockGraphError> + Send + Sync + 'static,
    {
        let key = key.into();
        self.universe.graph_entities.insert(
            key.clone(),
            GraphEntityType {
                key,
                factory: Box::new(create),
                decoder: Box::new(decode),
            },
        );
        self
    }

    pub fn discoverer(mut self, discoverer: impl NodeDiscoverer + 'static) -> Self {
        self.universe.discoverers.push(Box::new(discoverer));
        self
    }

    pub fn build(self) -> Arc<GraphUniverse> {
        Arc::new(self.universe)
    }
}
