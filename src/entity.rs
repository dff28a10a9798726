//! Mutable payloads attached to nodes, links and whole graphs.
//!
//! Entities are the only mutable state in a graph. Node and link entities live and die with
//! their node or link. Graph entities follow the graph through merges (the absorbed graph's
//! entity is folded into the survivor's via [`GraphEntity::merge`]) and splits (every new
//! component receives a copy from [`GraphEntity::split_new`]).

use std::{any::Any, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    codec::Payload,
    graph::BlockGraph,
    nodekey::{LinkKey, LinkPos, NodePos},
    properties::TypeKey,
};

/// A type-tagged entity payload, as stored on disk and sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPayload {
    pub type_key: TypeKey,
    pub payload: Payload,
}

impl EntityPayload {
    pub fn new(type_key: TypeKey, payload: Payload) -> Self {
        EntityPayload { type_key, payload }
    }
}

pub trait NodeEntity: fmt::Debug + Send + 'static {
    fn type_key(&self) -> TypeKey;

    fn to_payload(&self) -> Payload;

    /// Called once the node holding this entity exists in its graph.
    fn on_added(&mut self, _node: &NodePos) {}

    fn on_unload(&mut self) {}

    /// Called when the node is destroyed. Not called on unload.
    fn on_delete(&mut self) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn to_entity_payload(&self) -> EntityPayload {
        EntityPayload::new(self.type_key(), self.to_payload())
    }
}

pub trait LinkEntity: fmt::Debug + Send + 'static {
    fn type_key(&self) -> TypeKey;

    fn to_payload(&self) -> Payload;

    fn on_unload(&mut self) {}

    fn on_delete(&mut self) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn to_entity_payload(&self) -> EntityPayload {
        EntityPayload::new(self.type_key(), self.to_payload())
    }
}

/// Graph-wide state. Every registered graph entity type has exactly one instance per graph.
pub trait GraphEntity: fmt::Debug + Send + 'static {
    fn type_key(&self) -> TypeKey;

    fn to_payload(&self) -> Payload;

    fn on_node_created(&mut self, _node: &NodePos, _entity: Option<&dyn NodeEntity>) {
        self.on_update();
    }

    /// `removed_links` are the node's links, already gone from the graph. They are not also
    /// reported through [`on_unlink`](Self::on_unlink).
    fn on_node_destroyed(
        &mut self,
        _node: &NodePos,
        _entity: Option<&dyn NodeEntity>,
        _removed_links: &[(LinkPos, Option<&dyn LinkEntity>)],
    ) {
        self.on_update();
    }

    fn on_link(&mut self, _a: &NodePos, _b: &NodePos, _key: &LinkKey) {
        self.on_update();
    }

    fn on_unlink(&mut self, _a: &NodePos, _b: &NodePos, _key: &LinkKey) {
        self.on_update();
    }

    fn on_update(&mut self) {}

    fn on_tick(&mut self) {}

    fn on_unload(&mut self) {}

    fn on_destroy(&mut self) {}

    /// Folds `other` (always of the same type) into `self` when its graph is absorbed.
    fn merge(&mut self, other: Box<dyn GraphEntity>);

    /// Produces the entity for a component split off from `original`.
    ///
    /// `new_graph` already holds the moved nodes and links; `original` no longer does.
    fn split_new(&self, original: &BlockGraph, new_graph: &BlockGraph) -> Box<dyn GraphEntity>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn to_entity_payload(&self) -> EntityPayload {
        EntityPayload::new(self.type_key(), self.to_payload())
    }
}
