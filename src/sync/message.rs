use bytes::Bytes;
use std::collections::HashMap;

use super::wire::{PaletteReader, PaletteWriter, WireReader, WireWriter};
use crate::{
    entity::EntityPayload,
    error::BlockGraphError,
    graph::BlockGraph,
    nodekey::{LinkKey, LinkPos, NodePos, NodeValue},
    properties::{ChunkSectionPos, LocalPos},
    universe::GraphUniverse,
};

const KIND_SNAPSHOT: u8 = 0;
const KIND_NODE_ADD: u8 = 1;
const KIND_MERGE: u8 = 2;
const KIND_LINK: u8 = 3;
const KIND_UNLINK: u8 = 4;
const KIND_SPLIT: u8 = 5;
const KIND_NODE_REMOVE: u8 = 6;

/// A node plus its entity state, as replicated.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncNode {
    pub node: NodePos,
    pub entity: Option<EntityPayload>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncLink {
    pub link: LinkPos,
    pub entity: Option<EntityPayload>,
}

/// A link between two nodes of the same snapshot, by index into its node list.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotLink {
    pub first: u32,
    pub second: u32,
    pub key: LinkKey,
    pub entity: Option<EntityPayload>,
}

/// The part of one graph that lies inside a snapshot's section.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotGraph {
    pub graph_id: u64,
    pub entities: Vec<EntityPayload>,
    pub nodes: Vec<SyncNode>,
    pub internal_links: Vec<SnapshotLink>,
    /// Links leaving the section, with both endpoints spelled out.
    pub external_links: Vec<SyncLink>,
}

/// Full state of every graph touching one section.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSnapshot {
    pub section: ChunkSectionPos,
    pub graphs: Vec<SnapshotGraph>,
}

impl ChunkSnapshot {
    pub fn from_graphs<'a>(
        section: ChunkSectionPos,
        graphs: impl IntoIterator<Item = &'a BlockGraph>,
    ) -> Self {
        let graphs = graphs
            .into_iter()
            .filter(|graph| graph.in_section(section))
            .map(|graph| {
                let mut local_index = HashMap::new();
                let mut nodes = Vec::new();
                for (ix, node) in graph.nodes() {
                    if node.pos.section() != section {
                        continue;
                    }
                    local_index.insert(ix, nodes.len() as u32);
                    nodes.push(SyncNode {
                        node: node.clone(),
                        entity: graph.node_entity(ix).map(|e| e.to_entity_payload()),
                    });
                }

                let mut internal_links = Vec::new();
                let mut external_links = Vec::new();
                for (a, b, slot) in graph.link_slots() {
                    let entity = slot.entity().map(|e| e.to_entity_payload());
                    match (local_index.get(&a), local_index.get(&b)) {
                        (Some(&first), Some(&second)) => internal_links.push(SnapshotLink {
                            first,
                            second,
                            key: slot.key().clone(),
                            entity,
                        }),
                        (None, None) => {}
                        _ => {
                            let (Some(first), Some(second)) = (graph.node(a), graph.node(b)) else {
                                continue;
                            };
                            external_links.push(SyncLink {
                                link: LinkPos::new(first.clone(), second.clone(), slot.key().clone()),
                                entity,
                            });
                        }
                    }
                }

                SnapshotGraph {
                    graph_id: graph.id(),
                    entities: graph.entity_payloads(),
                    nodes,
                    internal_links,
                    external_links,
                }
            })
            .collect();
        ChunkSnapshot { section, graphs }
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

/// One replicated change, or a full section snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    Snapshot(ChunkSnapshot),
    NodeAdd {
        graph_id: u64,
        graph_entities: Vec<EntityPayload>,
        node: SyncNode,
    },
    /// `from_id` was absorbed into `into_id`. `into_entities` is the survivor's state before the
    /// merge, so a receiver that never saw it can still fold `from_id` in.
    Merge {
        from_id: u64,
        into_id: u64,
        into_entities: Vec<EntityPayload>,
    },
    Link {
        graph_id: u64,
        link: SyncLink,
    },
    Unlink {
        graph_id: u64,
        link: LinkPos,
    },
    Split {
        from_id: u64,
        into_id: u64,
        into_entities: Vec<EntityPayload>,
        moved: Vec<NodePos>,
    },
    NodeRemove {
        graph_id: u64,
        node: NodePos,
    },
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Snapshot(_) => "Snapshot",
            SyncMessage::NodeAdd { .. } => "NodeAdd",
            SyncMessage::Merge { .. } => "Merge",
            SyncMessage::Link { .. } => "Link",
            SyncMessage::Unlink { .. } => "Unlink",
            SyncMessage::Split { .. } => "Split",
            SyncMessage::NodeRemove { .. } => "NodeRemove",
        }
    }

    /// Encodes as `kind | palette additions | body`. New type identifiers used by the body are
    /// announced in the same message.
    pub fn encode(&self, palette: &mut PaletteWriter) -> Result<Bytes, BlockGraphError> {
        let mut body = Encoder {
            out: WireWriter::new(),
            palette,
        };
        let kind = match self {
            SyncMessage::Snapshot(snapshot) => {
                body.snapshot(snapshot)?;
                KIND_SNAPSHOT
            }
            SyncMessage::NodeAdd {
                graph_id,
                graph_entities,
                node,
            } => {
                body.out.write_varint(*graph_id);
                body.entities(graph_entities)?;
                body.sync_node(node)?;
                KIND_NODE_ADD
            }
            SyncMessage::Merge {
                from_id,
                into_id,
                into_entities,
            } => {
                body.out.write_varint(*from_id);
                body.out.write_varint(*into_id);
                body.entities(into_entities)?;
                KIND_MERGE
            }
            SyncMessage::Link { graph_id, link } => {
                body.out.write_varint(*graph_id);
                body.link_pos(&link.link)?;
                body.opt_entity(link.entity.as_ref())?;
                KIND_LINK
            }
            SyncMessage::Unlink { graph_id, link } => {
                body.out.write_varint(*graph_id);
                body.link_pos(link)?;
                KIND_UNLINK
            }
            SyncMessage::Split {
                from_id,
                into_id,
                into_entities,
                moved,
            } => {
                body.out.write_varint(*from_id);
                body.out.write_varint(*into_id);
                body.entities(into_entities)?;
                body.out.write_len(moved.len());
                for node in moved {
                    body.node_pos(node)?;
                }
                KIND_SPLIT
            }
            SyncMessage::NodeRemove { graph_id, node } => {
                body.out.write_varint(*graph_id);
                body.node_pos(node)?;
                KIND_NODE_REMOVE
            }
        };
        let Encoder { out: body, palette } = body;

        let mut out = WireWriter::new();
        out.write_u8(kind);
        palette.write_additions(&mut out);
        out.append(body);
        Ok(out.freeze())
    }

    /// Decodes one message. Any unknown type identifier or malformed field fails the whole
    /// message; nothing is partially applied.
    pub fn decode(
        bytes: impl Into<Bytes>,
        palette: &mut PaletteReader,
        universe: &GraphUniverse,
    ) -> Result<SyncMessage, BlockGraphError> {
        let mut input = WireReader::new(bytes);
        let kind = input.read_u8()?;
        palette.read_additions(&mut input)?;
        let mut body = Decoder {
            input,
            palette: &*palette,
            universe,
        };

        let message = match kind {
            KIND_SNAPSHOT => SyncMessage::Snapshot(body.snapshot()?),
            KIND_NODE_ADD => SyncMessage::NodeAdd {
                graph_id: body.input.read_varint()?,
                graph_entities: body.entities()?,
                node: body.sync_node()?,
            },
            KIND_MERGE => SyncMessage::Merge {
                from_id: body.input.read_varint()?,
                into_id: body.input.read_varint()?,
                into_entities: body.entities()?,
            },
            KIND_LINK => {
                let graph_id = body.input.read_varint()?;
                let link = body.link_pos()?;
                let entity = body.opt_entity(EntityKind::Link)?;
                SyncMessage::Link {
                    graph_id,
                    link: SyncLink { link, entity },
                }
            }
            KIND_UNLINK => SyncMessage::Unlink {
                graph_id: body.input.read_varint()?,
                link: body.link_pos()?,
            },
            KIND_SPLIT => {
                let from_id = body.input.read_varint()?;
                let into_id = body.input.read_varint()?;
                let into_entities = body.entities()?;
                let count = body.input.read_len()?;
                let mut moved = Vec::with_capacity(count);
                for _ in 0..count {
                    moved.push(body.node_pos()?);
                }
                SyncMessage::Split {
                    from_id,
                    into_id,
                    into_entities,
                    moved,
                }
            }
            KIND_NODE_REMOVE => SyncMessage::NodeRemove {
                graph_id: body.input.read_varint()?,
                node: body.node_pos()?,
            },
            other => {
                return Err(BlockGraphError::Protocol(format!(
                    "unknown message kind {other}"
                )))
            }
        };
        body.input.finish()?;
        Ok(message)
    }
}

struct Encoder<'a> {
    out: WireWriter,
    palette: &'a mut PaletteWriter,
}

impl Encoder<'_> {
    fn node_pos(&mut self, node: &NodePos) -> Result<(), BlockGraphError> {
        self.out.write_block_pos(node.pos);
        self.palette.write_key(&mut self.out, &node.node.type_key());
        self.out.write_payload(&node.node.to_payload())
    }

    fn link_key(&mut self, key: &LinkKey) -> Result<(), BlockGraphError> {
        self.palette.write_key(&mut self.out, &key.type_key());
        self.out.write_payload(&key.to_payload())
    }

    fn link_pos(&mut self, link: &LinkPos) -> Result<(), BlockGraphError> {
        self.node_pos(&link.first)?;
        self.node_pos(&link.second)?;
        self.link_key(&link.key)
    }

    fn entity(&mut self, entity: &EntityPayload) -> Result<(), BlockGraphError> {
        self.palette.write_key(&mut self.out, &entity.type_key);
        self.out.write_payload(&entity.payload)
    }

    fn opt_entity(&mut self, entity: Option<&EntityPayload>) -> Result<(), BlockGraphError> {
        self.out.write_bool(entity.is_some());
        match entity {
            Some(entity) => self.entity(entity),
            None => Ok(()),
        }
    }

    fn entities(&mut self, entities: &[EntityPayload]) -> Result<(), BlockGraphError> {
        self.out.write_len(entities.len());
        for entity in entities {
            self.entity(entity)?;
        }
        Ok(())
    }

    fn sync_node(&mut self, node: &SyncNode) -> Result<(), BlockGraphError> {
        self.node_pos(&node.node)?;
        self.opt_entity(node.entity.as_ref())
    }

    fn snapshot(&mut self, snapshot: &ChunkSnapshot) -> Result<(), BlockGraphError> {
        let section = snapshot.section;
        self.out.write_section(section);
        self.out.write_len(snapshot.graphs.len());
        for graph in snapshot.graphs.iter() {
            self.out.write_varint(graph.graph_id);
            self.entities(&graph.entities)?;

            self.out.write_len(graph.nodes.len());
            for node in graph.nodes.iter() {
                if !section.contains(node.node.pos) {
                    return Err(BlockGraphError::Protocol(format!(
                        "snapshot of {section} lists node {} outside the section",
                        node.node
                    )));
                }
                // Nodes travel as section-local positions.
                let local = node.node.pos.local();
                self.out.write_u8(local.x);
                self.out.write_u8(local.y);
                self.out.write_u8(local.z);
                self.palette.write_key(&mut self.out, &node.node.node.type_key());
                self.out.write_payload(&node.node.node.to_payload())?;
                self.opt_entity(node.entity.as_ref())?;
            }

            self.out.write_len(graph.internal_links.len());
            for link in graph.internal_links.iter() {
                self.out.write_varint(link.first as u64);
                self.out.write_varint(link.second as u64);
                self.link_key(&link.key)?;
                self.opt_entity(link.entity.as_ref())?;
            }

            self.out.write_len(graph.external_links.len());
            for link in graph.external_links.iter() {
                self.link_pos(&link.link)?;
                self.opt_entity(link.entity.as_ref())?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum EntityKind {
    Node,
    Link,
    Graph,
}

struct Decoder<'a> {
    input: WireReader,
    palette: &'a PaletteReader,
    universe: &'a GraphUniverse,
}

impl Decoder<'_> {
    fn node_value(&mut self) -> Result<NodeValue, BlockGraphError> {
        let type_key = self.palette.read_key(&mut self.input)?;
        if !self.universe.has_node_type(&type_key) {
            return Err(BlockGraphError::UnknownType(type_key.to_string()));
        }
        let payload = self.input.read_payload()?;
        self.universe.decode_node(&type_key, &payload)
    }

    fn node_pos(&mut self) -> Result<NodePos, BlockGraphError> {
        let pos = self.input.read_block_pos()?;
        let value = self.node_value()?;
        Ok(NodePos::new(pos, value))
    }

    fn link_key(&mut self) -> Result<LinkKey, BlockGraphError> {
        let type_key = self.palette.read_key(&mut self.input)?;
        if !self.universe.has_link_key_type(&type_key) {
            return Err(BlockGraphError::UnknownType(type_key.to_string()));
        }
        let payload = self.input.read_payload()?;
        self.universe.decode_link_key(&type_key, &payload)
    }

    fn link_pos(&mut self) -> Result<LinkPos, BlockGraphError> {
        let first = self.node_pos()?;
        let second = self.node_pos()?;
        let key = self.link_key()?;
        Ok(LinkPos::new(first, second, key))
    }

    fn entity(&mut self, kind: EntityKind) -> Result<EntityPayload, BlockGraphError> {
        let type_key = self.palette.read_key(&mut self.input)?;
        let known = match kind {
            EntityKind::Node => self.universe.has_node_entity_type(&type_key),
            EntityKind::Link => self.universe.has_link_entity_type(&type_key),
            EntityKind::Graph => self.universe.has_graph_entity_type(&type_key),
        };
        if !known {
            return Err(BlockGraphError::UnknownType(type_key.to_string()));
        }
        let payload = self.input.read_payload()?;
        Ok(EntityPayload::new(type_key, payload))
    }

    fn opt_entity(&mut self, kind: EntityKind) -> Result<Option<EntityPayload>, BlockGraphError> {
        if self.input.read_bool()? {
            Ok(Some(self.entity(kind)?))
        } else {
            Ok(None)
        }
    }

    fn entities(&mut self) -> Result<Vec<EntityPayload>, BlockGraphError> {
        let count = self.input.read_len()?;
        let mut entities = Vec::with_capacity(count);
        for _ in 0..count {
            entities.push(self.entity(EntityKind::Graph)?);
        }
        Ok(entities)
    }

    fn sync_node(&mut self) -> Result<SyncNode, BlockGraphError> {
        let node = self.node_pos()?;
        let entity = self.opt_entity(EntityKind::Node)?;
        Ok(SyncNode { node, entity })
    }

    fn snapshot(&mut self) -> Result<ChunkSnapshot, BlockGraphError> {
        let section = self.input.read_section()?;
        let graph_count = self.input.read_len()?;
        let mut graphs = Vec::with_capacity(graph_count);
        for _ in 0..graph_count {
            let graph_id = self.input.read_varint()?;
            let entities = self.entities()?;

            let node_count = self.input.read_len()?;
            let mut nodes = Vec::with_capacity(node_count);
            for _ in 0..node_count {
                let local = LocalPos::new(
                    self.input.read_u8()?,
                    self.input.read_u8()?,
                    self.input.read_u8()?,
                );
                if !local.is_valid() {
                    return Err(BlockGraphError::Protocol(format!(
                        "invalid local position {local:?} in snapshot of {section}"
                    )));
                }
                let value = self.node_value()?;
                let entity = self.opt_entity(EntityKind::Node)?;
                nodes.push(SyncNode {
                    node: NodePos::new(section.block_at(local), value),
                    entity,
                });
            }

            let link_count = self.input.read_len()?;
            let mut internal_links = Vec::with_capacity(link_count);
            for _ in 0..link_count {
                let first = self.node_index(node_count)?;
                let second = self.node_index(node_count)?;
                let key = self.link_key()?;
                let entity = self.opt_entity(EntityKind::Link)?;
                internal_links.push(SnapshotLink {
                    first,
                    second,
                    key,
                    entity,
                });
            }

            let external_count = self.input.read_len()?;
            let mut external_links = Vec::with_capacity(external_count);
            for _ in 0..external_count {
                let link = self.link_pos()?;
                let entity = self.opt_entity(EntityKind::Link)?;
                external_links.push(SyncLink { link, entity });
            }

            graphs.push(SnapshotGraph {
                graph_id,
                entities,
                nodes,
                internal_links,
                external_links,
            });
        }
        Ok(ChunkSnapshot { section, graphs })
    }

    fn node_index(&mut self, node_count: usize) -> Result<u32, BlockGraphError> {
        let index = self.input.read_varint()?;
        if index >= node_count as u64 {
            return Err(BlockGraphError::Protocol(format!(
                "internal link references node {index} of {node_count}"
            )));
        }
        Ok(index as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        properties::{BlockPos, TypeKey},
        tests::helpers::{test_universe, wire},
    };

    fn wire_at(x: i32, y: i32, z: i32) -> NodePos {
        NodePos::new(BlockPos::new(x, y, z), wire())
    }

    #[test]
    fn test_link_message_decodes_against_universe() {
        let universe = test_universe();
        let message = SyncMessage::Link {
            graph_id: 0xABCD,
            link: SyncLink {
                link: LinkPos::new(wire_at(0, 0, 0), wire_at(0, -1, 0), LinkKey::empty()),
                entity: None,
            },
        };
        let mut writer = PaletteWriter::new();
        let mut reader = PaletteReader::new();
        let first = message.encode(&mut writer).unwrap();
        let second = message.encode(&mut writer).unwrap();
        assert!(second.len() < first.len(), "identifiers are only announced once");

        assert_eq!(SyncMessage::decode(first, &mut reader, &universe).unwrap(), message);
        assert_eq!(SyncMessage::decode(second, &mut reader, &universe).unwrap(), message);
    }

    #[test]
    fn test_unknown_type_fails_the_message() {
        let universe = test_universe();
        let message = SyncMessage::Merge {
            from_id: 1,
            into_id: 2,
            into_entities: vec![EntityPayload::new(
                TypeKey::from("mod:never_registered"),
                crate::codec::Payload::Null,
            )],
        };
        let bytes = message.encode(&mut PaletteWriter::new()).unwrap();
        let err = SyncMessage::decode(bytes, &mut PaletteReader::new(), &universe).unwrap_err();
        assert_eq!(err, BlockGraphError::UnknownType("mod:never_registered".to_string()));
    }

    #[test]
    fn test_snapshot_bad_internal_index_is_rejected() {
        let universe = test_universe();
        let section = ChunkSectionPos::new(0, 0, 0);
        let snapshot = ChunkSnapshot {
            section,
            graphs: vec![SnapshotGraph {
                graph_id: 1,
                entities: Vec::new(),
                nodes: vec![SyncNode {
                    node: wire_at(1, 1, 1),
                    entity: None,
                }],
                internal_links: vec![SnapshotLink {
                    first: 0,
                    second: 4,
                    key: LinkKey::empty(),
                    entity: None,
                }],
                external_links: Vec::new(),
            }],
        };
        let bytes = SyncMessage::Snapshot(snapshot)
            .encode(&mut PaletteWriter::new())
            .unwrap();
        let err = SyncMessage::decode(bytes, &mut PaletteReader::new(), &universe).unwrap_err();
        assert!(matches!(err, BlockGraphError::Protocol(_)));
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let universe = test_universe();
        let message = SyncMessage::NodeRemove {
            graph_id: 3,
            node: wire_at(5, 5, 5),
        };
        let mut bytes = message.encode(&mut PaletteWriter::new()).unwrap().to_vec();
        bytes.push(0);
        assert!(SyncMessage::decode(bytes, &mut PaletteReader::new(), &universe).is_err());
    }
}
