//! Byte-level primitives of the sync protocol.
//!
//! Integers are LEB128 varints (signed ones zigzag-encoded first), strings and opaque payloads
//! are length-prefixed, and type identifiers travel as indices into a per-connection
//! [`PaletteWriter`]/[`PaletteReader`] pair: the first message using a type carries the
//! `(index, identifier)` pair, later ones only the index.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::{
    codec::{decode_cbor, encode_cbor, Payload},
    error::BlockGraphError,
    properties::{BlockPos, ChunkSectionPos, TypeKey},
};

const MAX_VARINT_LEN: usize = 10;

#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ (-((value & 1) as i64))
}

#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn write_varint(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.buf.put_u8(byte);
            if value == 0 {
                break;
            }
        }
    }

    pub fn write_len(&mut self, len: usize) {
        self.write_varint(len as u64);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_varint(zigzag_encode(value as i64));
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.buf.put_slice(bytes);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_block_pos(&mut self, pos: BlockPos) {
        self.write_i32(pos.x);
        self.write_i32(pos.y);
        self.write_i32(pos.z);
    }

    pub fn write_section(&mut self, section: ChunkSectionPos) {
        self.write_i32(section.x);
        self.write_i32(section.y);
        self.write_i32(section.z);
    }

    pub fn write_payload(&mut self, payload: &Payload) -> Result<(), BlockGraphError> {
        let encoded = encode_cbor(payload)?;
        self.write_bytes(&encoded);
        Ok(())
    }

    /// Appends another writer's bytes verbatim.
    pub fn append(&mut self, other: WireWriter) {
        self.buf.extend_from_slice(&other.buf);
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

#[derive(Debug, Clone)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        WireReader { buf: buf.into() }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, count: usize, what: &str) -> Result<(), BlockGraphError> {
        if self.buf.remaining() < count {
            return Err(BlockGraphError::Protocol(format!(
                "unexpected end of message reading {what}: need {count} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, BlockGraphError> {
        self.need(1, "byte")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, BlockGraphError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(BlockGraphError::Protocol(format!("invalid bool byte {other}"))),
        }
    }

    pub fn read_varint(&mut self) -> Result<u64, BlockGraphError> {
        let mut result: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            self.need(1, "varint")?;
            let byte = self.buf.get_u8();
            let payload = (byte & 0x7F) as u64;
            let shift = 7 * i as u32;
            if shift >= 63 && payload > 1 {
                return Err(BlockGraphError::Protocol("varint overflow".to_string()));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(BlockGraphError::Protocol("varint too long".to_string()))
    }

    /// A length or count. Bounded by the bytes left so a bad prefix cannot trigger a huge
    /// allocation.
    pub fn read_len(&mut self) -> Result<usize, BlockGraphError> {
        let len = self.read_varint()?;
        if len > self.buf.remaining() as u64 {
            return Err(BlockGraphError::Protocol(format!(
                "length {len} exceeds the {} bytes left in the message",
                self.buf.remaining()
            )));
        }
        Ok(len as usize)
    }

    pub fn read_i32(&mut self) -> Result<i32, BlockGraphError> {
        let value = zigzag_decode(self.read_varint()?);
        i32::try_from(value)
            .map_err(|_| BlockGraphError::Protocol(format!("{value} does not fit in i32")))
    }

    pub fn read_bytes(&mut self) -> Result<Bytes, BlockGraphError> {
        let len = self.read_len()?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_str(&mut self) -> Result<String, BlockGraphError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| BlockGraphError::Protocol(format!("invalid utf-8 string: {err}")))
    }

    pub fn read_block_pos(&mut self) -> Result<BlockPos, BlockGraphError> {
        Ok(BlockPos::new(
            self.read_i32()?,
            self.read_i32()?,
            self.read_i32()?,
        ))
    }

    pub fn read_section(&mut self) -> Result<ChunkSectionPos, BlockGraphError> {
        Ok(ChunkSectionPos::new(
            self.read_i32()?,
            self.read_i32()?,
            self.read_i32()?,
        ))
    }

    pub fn read_payload(&mut self) -> Result<Payload, BlockGraphError> {
        let bytes = self.read_bytes()?;
        decode_cbor(&bytes).map_err(|err| BlockGraphError::Protocol(format!("bad payload: {err}")))
    }

    pub fn finish(&self) -> Result<(), BlockGraphError> {
        if self.buf.has_remaining() {
            return Err(BlockGraphError::Protocol(format!(
                "{} trailing bytes after message",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

/// Send side of a connection's identifier palette.
#[derive(Debug, Default)]
pub struct PaletteWriter {
    ids: HashMap<TypeKey, u32>,
    pending: Vec<(u32, TypeKey)>,
}

impl PaletteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The palette index of `key`, assigning one (and queueing the announcement) if new.
    pub fn index_of(&mut self, key: &TypeKey) -> u32 {
        if let Some(&index) = self.ids.get(key) {
            return index;
        }
        let index = self.ids.len() as u32;
        self.ids.insert(key.clone(), index);
        self.pending.push((index, key.clone()));
        index
    }

    pub fn write_key(&mut self, out: &mut WireWriter, key: &TypeKey) {
        let index = self.index_of(key);
        out.write_varint(index as u64);
    }

    /// Writes and clears the announcements queued since the last call.
    pub fn write_additions(&mut self, out: &mut WireWriter) {
        out.write_len(self.pending.len());
        for (index, key) in self.pending.drain(..) {
            out.write_varint(index as u64);
            out.write_str(key.as_str());
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Receive side of a connection's identifier palette.
#[derive(Debug, Default)]
pub struct PaletteReader {
    keys: HashMap<u32, TypeKey>,
}

impl PaletteReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_additions(&mut self, input: &mut WireReader) -> Result<(), BlockGraphError> {
        let count = input.read_len()?;
        for _ in 0..count {
            let index = u32::try_from(input.read_varint()?)
                .map_err(|_| BlockGraphError::Protocol("palette index out of range".to_string()))?;
            let key = TypeKey::new(input.read_str()?);
            if let Some(previous) = self.keys.insert(index, key.clone()) {
                if previous != key {
                    return Err(BlockGraphError::Protocol(format!(
                        "palette index {index} re-announced as '{key}' (was '{previous}')"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn read_key(&self, input: &mut WireReader) -> Result<TypeKey, BlockGraphError> {
        let index = input.read_varint()?;
        u32::try_from(index)
            .ok()
            .and_then(|index| self.keys.get(&index))
            .cloned()
            .ok_or_else(|| BlockGraphError::Protocol(format!("unknown palette index {index}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_and_signed_values() {
        let mut out = WireWriter::new();
        for value in [0u64, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            out.write_varint(value);
        }
        for value in [0i32, -1, 1, i32::MIN, i32::MAX] {
            out.write_i32(value);
        }
        let mut input = WireReader::new(out.freeze());
        for value in [0u64, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            assert_eq!(input.read_varint().unwrap(), value);
        }
        for value in [0i32, -1, 1, i32::MIN, i32::MAX] {
            assert_eq!(input.read_i32().unwrap(), value);
        }
        input.finish().unwrap();
    }

    #[test]
    fn test_truncated_input_is_protocol_error() {
        let mut input = WireReader::new(Bytes::from_static(&[0x80, 0x80]));
        assert!(matches!(
            input.read_varint(),
            Err(BlockGraphError::Protocol(_))
        ));

        let mut input = WireReader::new(Bytes::from_static(&[0x05, b'a']));
        assert!(input.read_str().is_err(), "length prefix beyond the buffer");
    }

    #[test]
    fn test_palette_announces_each_key_once() {
        let mut palette = PaletteWriter::new();
        let mut reader = PaletteReader::new();
        let wire = TypeKey::from("test:wire");
        let lamp = TypeKey::from("test:lamp");

        let mut first = WireWriter::new();
        let mut body = WireWriter::new();
        palette.write_key(&mut body, &wire);
        palette.write_key(&mut body, &lamp);
        palette.write_key(&mut body, &wire);
        palette.write_additions(&mut first);
        first.append(body);

        let mut input = WireReader::new(first.freeze());
        reader.read_additions(&mut input).unwrap();
        assert_eq!(reader.read_key(&mut input).unwrap(), wire);
        assert_eq!(reader.read_key(&mut input).unwrap(), lamp);
        assert_eq!(reader.read_key(&mut input).unwrap(), wire);

        let mut second = WireWriter::new();
        palette.write_key(&mut WireWriter::new(), &lamp);
        palette.write_additions(&mut second);
        let mut input = WireReader::new(second.freeze());
        assert_eq!(input.read_len().unwrap(), 0, "nothing new to announce");
    }
}
