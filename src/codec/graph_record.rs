use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::Payload;
use crate::{
    entity::{EntityPayload, GraphEntity},
    graph::{BlockGraph, LinkSlot, NodeSlot},
    nodekey::NodePos,
    properties::{BlockPos, ChunkSectionPos, TypeKey},
    universe::GraphUniverse,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub pos: BlockPos,
    pub type_key: TypeKey,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub first: u32,
    pub second: u32,
    pub key_type: TypeKey,
    pub key: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityPayload>,
}

/// On-disk form of one graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    /// Packed [`ChunkSectionPos`] keys of every section the graph occupies.
    pub chunks: Vec<u64>,
    pub nodes: Vec<NodeRecord>,
    pub links: Vec<LinkRecord>,
    pub graph_entities: BTreeMap<TypeKey, Payload>,
}

impl GraphRecord {
    pub fn from_graph(graph: &BlockGraph) -> Self {
        let mut positions = HashMap::with_capacity(graph.size());
        let mut nodes = Vec::with_capacity(graph.size());
        for (ix, node) in graph.nodes() {
            positions.insert(ix, nodes.len() as u32);
            nodes.push(NodeRecord {
                pos: node.pos,
                type_key: node.node.type_key(),
                payload: node.node.to_payload(),
                entity: graph.node_entity(ix).map(|e| e.to_entity_payload()),
            });
        }

        let links = graph
            .link_slots()
            .filter_map(|(a, b, slot)| {
                Some(LinkRecord {
                    first: *positions.get(&a)?,
                    second: *positions.get(&b)?,
                    key_type: slot.key().type_key(),
                    key: slot.key().to_payload(),
                    entity: slot.entity().map(|e| e.to_entity_payload()),
                })
            })
            .collect();

        GraphRecord {
            chunks: graph.sections().map(|section| section.as_u64()).collect(),
            nodes,
            links,
            graph_entities: graph
                .graph_entities()
                .map(|entity| (entity.type_key(), entity.to_payload()))
                .collect(),
        }
    }

    /// Rebuilds a graph. Elements of unknown type are skipped with a warning, as are links
    /// pointing at skipped or out-of-range nodes. Registered graph entity types missing from the
    /// record get a fresh instance.
    pub fn into_graph(self, id: u64, universe: &GraphUniverse) -> BlockGraph {
        let mut entities: BTreeMap<TypeKey, Box<dyn GraphEntity>> = BTreeMap::new();
        for (type_key, payload) in self.graph_entities {
            let Some(entity_type) = universe.graph_entity_type(&type_key) else {
                tracing::warn!(
                    "[GraphRecord::into_graph] Graph {id:016X}: unknown graph entity type '{type_key}'. Skipping."
                );
                continue;
            };
            match entity_type.decode(&payload) {
                Ok(entity) => {
                    entities.insert(type_key, entity);
                }
                Err(err) => tracing::warn!(
                    "[GraphRecord::into_graph] Graph {id:016X}: failed to decode graph entity '{type_key}': {err}. Skipping."
                ),
            }
        }
        for entity_type in universe.graph_entity_types() {
            if !entities.contains_key(entity_type.key()) {
                tracing::warn!(
                    "[GraphRecord::into_graph] Graph {id:016X} has no '{}' entity. Creating a new one.",
                    entity_type.key()
                );
                entities.insert(entity_type.key().clone(), entity_type.create());
            }
        }

        let mut graph = BlockGraph::with_entities(id, entities);
        let mut indices = Vec::with_capacity(self.nodes.len());
        for record in self.nodes {
            let value = match universe.decode_node(&record.type_key, &record.payload) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(
                        "[GraphRecord::into_graph] Graph {id:016X}: skipping node at {}: {err}",
                        record.pos
                    );
                    indices.push(None);
                    continue;
                }
            };
            let entity = record.entity.and_then(|entity| {
                universe
                    .decode_node_entity(&entity)
                    .map_err(|err| {
                        tracing::warn!(
                            "[GraphRecord::into_graph] Graph {id:016X}: dropping node entity at {}: {err}",
                            record.pos
                        )
                    })
                    .ok()
            });
            let node = NodePos::new(record.pos, value);
            if graph.contains(&node) {
                tracing::warn!(
                    "[GraphRecord::into_graph] Graph {id:016X}: duplicate node {node}. Skipping."
                );
                indices.push(graph.find(&node));
                continue;
            }
            indices.push(Some(graph.insert_slot(NodeSlot::new(node, entity))));
        }

        for record in self.links {
            let endpoints = (
                indices.get(record.first as usize).copied().flatten(),
                indices.get(record.second as usize).copied().flatten(),
            );
            let (Some(a), Some(b)) = endpoints else {
                tracing::warn!(
                    "[GraphRecord::into_graph] Graph {id:016X}: link {} -> {} references a missing node. Skipping.",
                    record.first,
                    record.second
                );
                continue;
            };
            let key = match universe.decode_link_key(&record.key_type, &record.key) {
                Ok(key) => key,
                Err(err) => {
                    tracing::warn!(
                        "[GraphRecord::into_graph] Graph {id:016X}: skipping link: {err}"
                    );
                    continue;
                }
            };
            let entity = record.entity.and_then(|entity| {
                universe
                    .decode_link_entity(&entity)
                    .map_err(|err| {
                        tracing::warn!(
                            "[GraphRecord::into_graph] Graph {id:016X}: dropping link entity: {err}"
                        )
                    })
                    .ok()
            });
            if graph.find_link(a, b, &key).is_none() {
                graph.insert_link_slot(a, b, LinkSlot::new(key, entity));
            }
        }

        let recorded: Vec<ChunkSectionPos> = self
            .chunks
            .iter()
            .map(|packed| ChunkSectionPos::from_u64(*packed))
            .collect();
        if recorded.len() != graph.sections().count()
            || recorded.iter().any(|section| !graph.in_section(*section))
        {
            tracing::debug!(
                "[GraphRecord::into_graph] Graph {id:016X}: recorded chunk list differs from node positions; using node positions"
            );
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        nodekey::EmptyLinkKey,
        tests::helpers::{init_logging, test_universe, wire_at, TALLY},
    };

    fn node(x: i32, type_key: &str) -> NodeRecord {
        NodeRecord {
            pos: BlockPos::new(x, 0, 0),
            type_key: TypeKey::from(type_key),
            payload: Payload::Integer(0.into()),
            entity: None,
        }
    }

    fn link(first: u32, second: u32) -> LinkRecord {
        LinkRecord {
            first,
            second,
            key_type: TypeKey::from(EmptyLinkKey::TYPE_KEY),
            key: Payload::Null,
            entity: None,
        }
    }

    #[test]
    fn test_unknown_node_type_is_skipped_with_its_links() {
        init_logging();
        let record = GraphRecord {
            chunks: vec![ChunkSectionPos::new(0, 0, 0).as_u64()],
            nodes: vec![node(0, "test:wire"), node(1, "mod:removed"), node(2, "test:wire")],
            links: vec![link(0, 1), link(1, 2), link(0, 2), link(0, 7)],
            graph_entities: BTreeMap::new(),
        };

        let graph = record.into_graph(5, &test_universe());
        assert_eq!(graph.id(), 5);
        assert_eq!(graph.size(), 2);
        assert!(graph.contains(&wire_at(0, 0, 0)));
        assert!(graph.contains(&wire_at(2, 0, 0)));
        assert_eq!(graph.link_count(), 1);
        assert!(graph.graph_entity(&TypeKey::from(TALLY)).is_some());
    }

    #[test]
    fn test_unknown_graph_entity_is_dropped() {
        init_logging();
        let mut graph_entities = BTreeMap::new();
        graph_entities.insert(TypeKey::from("mod:removed"), Payload::Null);
        let record = GraphRecord {
            chunks: Vec::new(),
            nodes: vec![node(0, "test:wire")],
            links: Vec::new(),
            graph_entities,
        };

        let graph = record.into_graph(1, &test_universe());
        assert_eq!(graph.size(), 1);
        assert_eq!(graph.graph_entities().count(), 1);
        assert!(graph.graph_entity(&TypeKey::from(TALLY)).is_some());
    }
}
