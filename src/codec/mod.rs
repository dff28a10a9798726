//! Persistence codec.
//!
//! Everything written to disk is a serde record encoded as CBOR (a self-describing binary tree
//! format, via `ciborium`) inside a small checksummed frame:
//!
//! ```text
//! magic [u8; 4] | version u32 LE | payload length u32 LE | crc32 u32 LE | CBOR payload
//! ```
//!
//! Three record kinds exist:
//!
//! - [`GraphRecord`]: one file per graph, named by the graph id.
//! - [`ColumnRecord`]: the spatial index sections of one chunk column.
//! - [`StateRecord`]: world-level state (the last allocated graph id).
//!
//! Decoding node, link and entity payloads goes through the
//! [`GraphUniverse`](crate::universe::GraphUniverse). Elements whose type is unknown are
//! logged and skipped, so one stale type never costs the whole file.

use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use crate::error::BlockGraphError;

pub mod chunk_record;
pub mod graph_record;

pub use chunk_record::{ColumnRecord, KeyRecord, PositionRecord, SectionRecord};
pub use graph_record::{GraphRecord, LinkRecord, NodeRecord};

/// Opaque, self-describing payload of a node value, link key or entity.
pub type Payload = ciborium::Value;

pub const GRAPH_MAGIC: &[u8; 4] = b"BGGR";
pub const COLUMN_MAGIC: &[u8; 4] = b"BGCI";
pub const STATE_MAGIC: &[u8; 4] = b"BGST";
pub const FILE_VERSION: u32 = 1;

const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StateRecord {
    pub last_allocated_graph_id: u64,
}

/// Converts any serde value into a [`Payload`].
pub fn to_payload<T: Serialize>(value: &T) -> Result<Payload, BlockGraphError> {
    Ok(Payload::serialized(value)?)
}

/// Reads a serde value back out of a [`Payload`].
pub fn from_payload<T: DeserializeOwned>(payload: &Payload) -> Result<T, BlockGraphError> {
    Ok(payload.deserialized()?)
}

pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, BlockGraphError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)?;
    Ok(bytes)
}

pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BlockGraphError> {
    Ok(ciborium::from_reader(bytes)?)
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Writes `record` to `path` inside a checksummed frame.
pub fn write_framed<T: Serialize>(
    path: &Path,
    magic: &[u8; 4],
    record: &T,
) -> Result<(), BlockGraphError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let encoded = encode_cbor(record)?;
    let length = u32::try_from(encoded.len())
        .map_err(|_| BlockGraphError::Codec(format!("record too large: {} bytes", encoded.len())))?;

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(magic)?;
    writer.write_all(&FILE_VERSION.to_le_bytes())?;
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&crc32(&encoded).to_le_bytes())?;
    writer.write_all(&encoded)?;
    writer.flush()?;
    Ok(())
}

/// Reads a framed record. A missing file is `Ok(None)`; anything unreadable is an error.
pub fn read_framed<T: DeserializeOwned>(
    path: &Path,
    magic: &[u8; 4],
) -> Result<Option<T>, BlockGraphError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                BlockGraphError::Corrupt(format!("{}: truncated header", path.display()))
            }
            _ => err.into(),
        })?;
    if &header[0..4] != magic {
        return Err(BlockGraphError::Corrupt(format!(
            "{}: magic mismatch",
            path.display()
        )));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != FILE_VERSION {
        return Err(BlockGraphError::Corrupt(format!(
            "{}: unsupported version {version}",
            path.display()
        )));
    }
    let length = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let checksum = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);

    let mut payload = Vec::new();
    reader.read_to_end(&mut payload)?;
    if payload.len() != length {
        return Err(BlockGraphError::Corrupt(format!(
            "{}: expected {length} payload bytes, found {}",
            path.display(),
            payload.len()
        )));
    }
    if crc32(&payload) != checksum {
        return Err(BlockGraphError::Corrupt(format!(
            "{}: checksum mismatch",
            path.display()
        )));
    }
    decode_cbor(&payload).map(Some)
}
