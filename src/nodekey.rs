//! Value identity for nodes and links.
//!
//! A node is identified by its position plus an immutable [`NodeValue`]; a link by its two
//! endpoints plus a [`LinkKey`]. Both wrap user types behind `Arc<dyn ...>` and compare
//! structurally through [`DynValue`], so equal values built independently (for example one
//! decoded from disk and one produced by discovery) are the same node.
//!
//! Implementations of [`BlockNode`] and [`BlockLinkKey`] must give consistent `Eq`/`Hash`.
//! Duplicate detection and discovery diffing rely on it and do not re-check it.

use std::{
    any::{Any, TypeId},
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
    ops::Deref,
    sync::Arc,
};

use crate::{
    codec::Payload,
    entity::{LinkEntity, NodeEntity},
    properties::{BlockPos, TypeKey},
    universe::NodeView,
};

/// Object-safe equality and hashing, implemented for every `Eq + Hash` type.
pub trait DynValue: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn Any) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
}

impl<T: Any + fmt::Debug + Eq + Hash + Send + Sync> DynValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|other| self == other)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }
}

/// Behavior of a node type.
///
/// `can_connect` must accept exactly the candidates `find_connections` would return, in both
/// directions; a link is only created when both endpoints agree.
pub trait BlockNode: DynValue {
    fn type_key(&self) -> TypeKey;

    fn to_payload(&self) -> Payload;

    /// The links this node wants, given its own position and a view of the world.
    fn find_connections(&self, this: &NodePos, view: &mut dyn NodeView) -> Vec<HalfLink>;

    fn can_connect(&self, this: &NodePos, view: &mut dyn NodeView, candidate: &HalfLink) -> bool;

    /// Whether this node disappears when discovery stops reporting it.
    fn is_automatic_removal(&self) -> bool {
        true
    }

    fn is_valid(&self, _this: &NodePos, _view: &mut dyn NodeView) -> bool {
        true
    }

    fn on_connections_changed(&self, _this: &NodePos, _links: &[HalfLink]) {}

    fn create_node_entity(&self, _this: &NodePos) -> Option<Box<dyn NodeEntity>> {
        None
    }
}

/// Behavior of a link key type.
pub trait BlockLinkKey: DynValue {
    fn type_key(&self) -> TypeKey;

    fn to_payload(&self) -> Payload;

    /// Whether the link is dropped by a connection refresh once neither endpoint wants it.
    fn is_automatic_removal(&self) -> bool {
        true
    }

    fn create_link_entity(&self, _link: &LinkPos) -> Option<Box<dyn LinkEntity>> {
        None
    }
}

#[derive(Clone)]
pub struct NodeValue(Arc<dyn BlockNode>);

impl NodeValue {
    pub fn new<N: BlockNode>(node: N) -> Self {
        NodeValue(Arc::new(node))
    }

    pub fn downcast_ref<N: BlockNode>(&self) -> Option<&N> {
        self.0.as_any().downcast_ref::<N>()
    }
}

impl Deref for NodeValue {
    type Target = dyn BlockNode;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for NodeValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_any())
    }
}

impl Eq for NodeValue {}

impl Hash for NodeValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.dyn_hash(state);
    }
}

impl fmt::Debug for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

#[derive(Clone)]
pub struct LinkKey(Arc<dyn BlockLinkKey>);

impl LinkKey {
    pub fn new<K: BlockLinkKey>(key: K) -> Self {
        LinkKey(Arc::new(key))
    }

    pub fn empty() -> Self {
        LinkKey::new(EmptyLinkKey)
    }

    pub fn downcast_ref<K: BlockLinkKey>(&self) -> Option<&K> {
        self.0.as_any().downcast_ref::<K>()
    }
}

impl Deref for LinkKey {
    type Target = dyn BlockLinkKey;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for LinkKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_any())
    }
}

impl Eq for LinkKey {}

impl Hash for LinkKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.dyn_hash(state);
    }
}

impl fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// The default key for links that carry no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmptyLinkKey;

impl EmptyLinkKey {
    pub const TYPE_KEY: &'static str = "blockgraph:empty";
}

impl BlockLinkKey for EmptyLinkKey {
    fn type_key(&self) -> TypeKey {
        TypeKey::from(Self::TYPE_KEY)
    }

    fn to_payload(&self) -> Payload {
        Payload::Null
    }
}

/// A node's full identity: where it is and what it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodePos {
    pub pos: BlockPos,
    pub node: NodeValue,
}

impl NodePos {
    pub fn new(pos: BlockPos, node: NodeValue) -> Self {
        NodePos { pos, node }
    }
}

impl fmt::Display for NodePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.node, self.pos)
    }
}

/// One side of a link as seen from the other endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HalfLink {
    pub other: NodePos,
    pub key: LinkKey,
}

impl HalfLink {
    pub fn new(other: NodePos, key: LinkKey) -> Self {
        HalfLink { other, key }
    }

    /// Turns this into a full link anchored at `this`.
    pub fn to_link(&self, this: &NodePos) -> LinkPos {
        LinkPos::new(this.clone(), self.other.clone(), self.key.clone())
    }

    /// The same link seen from the other endpoint.
    pub fn reverse(&self, this: &NodePos) -> HalfLink {
        HalfLink::new(this.clone(), self.key.clone())
    }
}

/// An undirected keyed link. Equality and hashing ignore endpoint order.
#[derive(Debug, Clone)]
pub struct LinkPos {
    pub first: NodePos,
    pub second: NodePos,
    pub key: LinkKey,
}

impl LinkPos {
    pub fn new(first: NodePos, second: NodePos, key: LinkKey) -> Self {
        LinkPos { first, second, key }
    }

    pub fn other(&self, this: &NodePos) -> Option<&NodePos> {
        if &self.first == this {
            Some(&self.second)
        } else if &self.second == this {
            Some(&self.first)
        } else {
            None
        }
    }

    pub fn contains(&self, node: &NodePos) -> bool {
        &self.first == node || &self.second == node
    }
}

impl PartialEq for LinkPos {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && ((self.first == other.first && self.second == other.second)
                || (self.first == other.second && self.second == other.first))
    }
}

impl Eq for LinkPos {}

impl Hash for LinkPos {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fn single<T: Hash>(value: &T) -> u64 {
            let mut hasher = DefaultHasher::new();
            value.hash(&mut hasher);
            hasher.finish()
        }
        state.write_u64(single(&self.first).wrapping_add(single(&self.second)));
        self.key.hash(state);
    }
}

impl fmt::Display for LinkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-{:?}-> {}", self.first, self.key, self.second)
    }
}
