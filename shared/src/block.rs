//! Block types and the integer coordinate key used by the sparse terrain maps.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Every block the simulation knows about.
///
/// The discriminant is the on-disk id used by map templates, so existing
/// values must never be renumbered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockType {
    #[default]
    Air = 0,
    /// Indestructible world floor.
    Bedrock = 1,
    Stone = 2,
    Dirt = 3,
    Grass = 4,
    Sand = 5,
    Wood = 6,
    Planks = 7,
    Brick = 8,
    Glass = 9,
    Water = 10,
    /// Invisible light emitter placed by map authors.
    Light = 11,
}

impl BlockType {
    pub const ALL: [BlockType; 12] = [
        BlockType::Air,
        BlockType::Bedrock,
        BlockType::Stone,
        BlockType::Dirt,
        BlockType::Grass,
        BlockType::Sand,
        BlockType::Wood,
        BlockType::Planks,
        BlockType::Brick,
        BlockType::Glass,
        BlockType::Water,
        BlockType::Light,
    ];

    /// Converts a template id back into a block; unknown ids read as air.
    pub fn from_id(id: u8) -> Self {
        match id {
            1 => BlockType::Bedrock,
            2 => BlockType::Stone,
            3 => BlockType::Dirt,
            4 => BlockType::Grass,
            5 => BlockType::Sand,
            6 => BlockType::Wood,
            7 => BlockType::Planks,
            8 => BlockType::Brick,
            9 => BlockType::Glass,
            10 => BlockType::Water,
            11 => BlockType::Light,
            _ => BlockType::Air,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Whether the block stops player movement and line of sight.
    pub fn is_solid(self) -> bool {
        !matches!(self, BlockType::Air | BlockType::Water | BlockType::Light)
    }

    /// Whether a player is allowed to place this type at all.
    pub fn is_placeable(self) -> bool {
        !matches!(self, BlockType::Air | BlockType::Bedrock)
    }
}

/// Integer voxel coordinate used as the key of the override layer and the
/// player-placed set.
///
/// Hashing folds the three components through [`hash_combine`] into a single
/// `u64` before handing it to the map's hasher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockKey {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Combined 64-bit hash of the coordinate triple.
    pub fn combined(&self) -> u64 {
        let mut seed = 0u64;
        seed = hash_combine(seed, self.x as u32 as u64);
        seed = hash_combine(seed, self.y as u32 as u64);
        hash_combine(seed, self.z as u32 as u64)
    }
}

impl Hash for BlockKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.combined());
    }
}

/// Boost-style hash combine: `seed ^= value + φ + (seed << 6) + (seed >> 2)`.
pub fn hash_combine(seed: u64, value: u64) -> u64 {
    seed ^ value
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_block_id_roundtrip() {
        for id in 0..=11u8 {
            assert_eq!(BlockType::from_id(id).id(), id);
        }
        assert_eq!(BlockType::from_id(200), BlockType::Air);
    }

    #[test]
    fn test_all_is_indexed_by_id() {
        for (i, block) in BlockType::ALL.iter().enumerate() {
            assert_eq!(block.id() as usize, i);
        }
    }

    #[test]
    fn test_solidity() {
        assert!(!BlockType::Air.is_solid());
        assert!(!BlockType::Water.is_solid());
        assert!(!BlockType::Light.is_solid());
        assert!(BlockType::Stone.is_solid());
        assert!(BlockType::Bedrock.is_solid());
        assert!(BlockType::Glass.is_solid());
    }

    #[test]
    fn test_placeable() {
        assert!(!BlockType::Air.is_placeable());
        assert!(!BlockType::Bedrock.is_placeable());
        assert!(BlockType::Brick.is_placeable());
    }

    #[test]
    fn test_block_key_hash_distinguishes_permutations() {
        let a = BlockKey::new(1, 2, 3).combined();
        let b = BlockKey::new(3, 2, 1).combined();
        let c = BlockKey::new(-1, 2, 3).combined();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_block_key_in_hash_set() {
        let mut set = HashSet::new();
        set.insert(BlockKey::new(0, 0, 0));
        set.insert(BlockKey::new(0, 0, 0));
        set.insert(BlockKey::new(-5, 10, 7));
        assert_eq!(set.len(), 2);
        assert!(set.contains(&BlockKey::new(-5, 10, 7)));
    }
}
