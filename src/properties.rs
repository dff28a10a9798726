//! Spatial coordinates and type identifiers shared by every layer.
//!
//! The world is partitioned into cubic chunk sections of [`SECTION_SIZE`] blocks per axis.
//! Sections stacked along `y` share a [`ChunkPos`] column, which is the unit the host world
//! loads and unloads and the unit the region store persists.

use serde::{Deserialize, Serialize};
use std::fmt;

/// log2 of the section edge length.
pub const SECTION_SHIFT: i32 = 4;
/// Blocks per section edge.
pub const SECTION_SIZE: i32 = 1 << SECTION_SHIFT;
const SECTION_MASK: i32 = SECTION_SIZE - 1;

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        BlockPos { x, y, z }
    }

    pub fn offset(&self, dx: i32, dy: i32, dz: i32) -> Self {
        BlockPos::new(self.x + dx, self.y + dy, self.z + dz)
    }

    /// The six face-adjacent positions.
    pub fn neighbors(&self) -> [BlockPos; 6] {
        [
            self.offset(1, 0, 0),
            self.offset(-1, 0, 0),
            self.offset(0, 1, 0),
            self.offset(0, -1, 0),
            self.offset(0, 0, 1),
            self.offset(0, 0, -1),
        ]
    }

    pub fn section(&self) -> ChunkSectionPos {
        ChunkSectionPos::new(
            self.x >> SECTION_SHIFT,
            self.y >> SECTION_SHIFT,
            self.z >> SECTION_SHIFT,
        )
    }

    pub fn local(&self) -> LocalPos {
        LocalPos::new(
            (self.x & SECTION_MASK) as u8,
            (self.y & SECTION_MASK) as u8,
            (self.z & SECTION_MASK) as u8,
        )
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Section coordinates (block coordinates shifted right by [`SECTION_SHIFT`]).
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ChunkSectionPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkSectionPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        ChunkSectionPos { x, y, z }
    }

    pub fn column(&self) -> ChunkPos {
        ChunkPos::new(self.x, self.z)
    }

    pub fn origin(&self) -> BlockPos {
        BlockPos::new(
            self.x << SECTION_SHIFT,
            self.y << SECTION_SHIFT,
            self.z << SECTION_SHIFT,
        )
    }

    pub fn block_at(&self, local: LocalPos) -> BlockPos {
        self.origin()
            .offset(local.x as i32, local.y as i32, local.z as i32)
    }

    pub fn contains(&self, pos: BlockPos) -> bool {
        pos.section() == *self
    }

    /// Chebyshev distance in sections.
    pub fn distance(&self, other: &ChunkSectionPos) -> u32 {
        let dx = (self.x as i64 - other.x as i64).unsigned_abs();
        let dy = (self.y as i64 - other.y as i64).unsigned_abs();
        let dz = (self.z as i64 - other.z as i64).unsigned_abs();
        dx.max(dy).max(dz) as u32
    }

    /// Every section within `radius` (Chebyshev) of this one.
    /// The cube is clipped at the `i32` bounds.
    pub fn cube(&self, radius: u32) -> impl Iterator<Item = ChunkSectionPos> {
        let r = i32::try_from(radius).unwrap_or(i32::MAX);
        let span = |c: i32| c.saturating_sub(r)..=c.saturating_add(r);
        let (xs, ys, zs) = (span(self.x), span(self.y), span(self.z));
        xs.flat_map(move |x| {
            let zs = zs.clone();
            ys.clone()
                .flat_map(move |y| zs.clone().map(move |z| ChunkSectionPos::new(x, y, z)))
        })
    }

    /// Packs into 64 bits: 22 bits x, 20 bits y, 22 bits z.
    pub fn as_u64(&self) -> u64 {
        let x = (self.x as i64 & 0x3F_FFFF) << 42;
        let z = (self.z as i64 & 0x3F_FFFF) << 20;
        let y = self.y as i64 & 0xF_FFFF;
        (x | z | y) as u64
    }

    pub fn from_u64(packed: u64) -> Self {
        let packed = packed as i64;
        ChunkSectionPos::new(
            (packed >> 42) as i32,
            ((packed << 44) >> 44) as i32,
            ((packed << 22) >> 42) as i32,
        )
    }
}

impl fmt::Display for ChunkSectionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.x, self.y, self.z)
    }
}

/// A column of sections sharing `x`/`z`.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, z: i32) -> Self {
        ChunkPos { x, z }
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

/// Position of a block inside its section.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LocalPos {
    pub x: u8,
    pub y: u8,
    pub z: u8,
}

impl LocalPos {
    pub const fn new(x: u8, y: u8, z: u8) -> Self {
        LocalPos { x, y, z }
    }

    pub fn is_valid(&self) -> bool {
        (self.x as i32) < SECTION_SIZE
            && (self.y as i32) < SECTION_SIZE
            && (self.z as i32) < SECTION_SIZE
    }
}

/// Namespaced identifier (`namespace:path`) naming a registered node, link key or entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeKey(String);

impl TypeKey {
    pub fn new(id: impl Into<String>) -> Self {
        TypeKey(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn namespace(&self) -> &str {
        self.0.split_once(':').map(|(ns, _)| ns).unwrap_or("")
    }

    pub fn path(&self) -> &str {
        self.0.split_once(':').map(|(_, path)| path).unwrap_or(&self.0)
    }
}

impl From<&str> for TypeKey {
    fn from(id: &str) -> Self {
        TypeKey::new(id)
    }
}

impl From<String> for TypeKey {
    fn from(id: String) -> Self {
        TypeKey(id)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_block_sections() {
        let pos = BlockPos::new(-1, -17, 16);
        assert_eq!(pos.section(), ChunkSectionPos::new(-1, -2, 1));
        assert_eq!(pos.local(), LocalPos::new(15, 15, 0));
        assert_eq!(pos.section().block_at(pos.local()), pos);
    }

    #[test]
    fn test_section_packing_keeps_sign() {
        for section in [
            ChunkSectionPos::new(0, 0, 0),
            ChunkSectionPos::new(-1, -1, -1),
            ChunkSectionPos::new(2_000_000, -500_000, -2_000_000),
            ChunkSectionPos::new(-37, 12, 99),
        ] {
            assert_eq!(ChunkSectionPos::from_u64(section.as_u64()), section);
        }
    }

    #[test]
    fn test_cube_and_distance() {
        let center = ChunkSectionPos::new(3, -2, 0);
        let cube: Vec<_> = center.cube(1).collect();
        assert_eq!(cube.len(), 27);
        assert!(cube.iter().all(|s| s.distance(&center) <= 1));
        assert_eq!(center.distance(&ChunkSectionPos::new(5, -2, -1)), 2);
    }

    #[test]
    fn test_cube_clips_at_coordinate_limits() {
        let corner = ChunkSectionPos::new(i32::MAX, i32::MIN, 0);
        let cube: Vec<_> = corner.cube(1).collect();
        assert_eq!(cube.len(), 2 * 2 * 3);
        assert!(cube.contains(&ChunkSectionPos::new(i32::MAX - 1, i32::MIN + 1, -1)));

        let huge = ChunkSectionPos::new(i32::MAX, i32::MAX, i32::MAX).cube(u32::MAX);
        assert_eq!(huge.take(4).count(), 4);
    }

    #[test]
    fn test_type_key_parts() {
        let key = TypeKey::from("example:wire");
        assert_eq!(key.namespace(), "example");
        assert_eq!(key.path(), "wire");
        assert_eq!(key.to_string(), "example:wire");
    }
}
