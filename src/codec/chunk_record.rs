use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Payload;
use crate::properties::TypeKey;

/// One exact-key entry: the node value at a position and the graph holding it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub graph_id: u64,
    pub type_key: TypeKey,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub x: u8,
    pub y: u8,
    pub z: u8,
    pub graphs: Vec<u64>,
    #[serde(default)]
    pub keys: Vec<KeyRecord>,
}

/// Spatial index of one chunk section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionRecord {
    pub graphs_in_chunk: Vec<u64>,
    pub positions: Vec<PositionRecord>,
    /// Whether `keys` lists every node in the section. When false the exact-key map is rebuilt
    /// from the graphs after loading.
    #[serde(default)]
    pub keys_complete: bool,
}

/// All indexed sections of one chunk column, keyed by section `y`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnRecord {
    pub sections: BTreeMap<i32, SectionRecord>,
}
