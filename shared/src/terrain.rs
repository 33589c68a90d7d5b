//! Layered, mutable block store.
//!
//! Queries resolve top-down through three layers:
//! 1. sparse runtime overrides,
//! 2. the map template when one is active,
//! 3. the seeded procedural generator otherwise.
//!
//! Coordinates that a player placed are tracked separately, because whether a
//! block may be broken depends on where it came from rather than on its type.

use crate::block::{BlockKey, BlockType};
use crate::noise::{fbm_2d, NoiseConfig, PermutationTable};
use crate::template::MapTemplate;
use crate::{WORLD_HALF_EXTENT, WORLD_HEIGHT};
use std::collections::{HashMap, HashSet};

/// Height field generator: dense stone, a few layers of dirt, a grass cap and
/// an unbreakable bedrock floor at y = 0.
#[derive(Debug, Clone)]
pub struct TerrainGenerator {
    seed: u64,
    perm: PermutationTable,
    config: NoiseConfig,
}

impl TerrainGenerator {
    pub const BASE_HEIGHT: f64 = 20.0;
    pub const HEIGHT_VARIATION: f64 = 10.0;

    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            perm: PermutationTable::new(seed),
            config: NoiseConfig::default(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Height of the first air block above the column's surface.
    pub fn column_height(&self, x: i32, z: i32) -> i32 {
        let n = fbm_2d(&self.perm, &self.config, x as f64, z as f64);
        let height = (Self::BASE_HEIGHT + n * Self::HEIGHT_VARIATION).round() as i32;
        height.clamp(2, WORLD_HEIGHT - 1)
    }

    pub fn block_at(&self, x: i32, y: i32, z: i32) -> BlockType {
        if y == 0 {
            return BlockType::Bedrock;
        }
        if !(0..WORLD_HEIGHT).contains(&y) {
            return BlockType::Air;
        }

        let height = self.column_height(x, z);
        if y < height - 4 {
            BlockType::Stone
        } else if y < height - 1 {
            BlockType::Dirt
        } else if y == height - 1 {
            BlockType::Grass
        } else {
            BlockType::Air
        }
    }
}

/// Authoritative world terrain.
#[derive(Debug, Clone)]
pub struct Terrain {
    generator: TerrainGenerator,
    template: Option<MapTemplate>,
    overrides: HashMap<BlockKey, BlockType>,
    player_placed: HashSet<BlockKey>,
}

impl Terrain {
    /// Fully procedural, fully breakable terrain.
    pub fn new(seed: u64) -> Self {
        Self {
            generator: TerrainGenerator::new(seed),
            template: None,
            overrides: HashMap::new(),
            player_placed: HashSet::new(),
        }
    }

    /// Terrain backed by a template; invalid templates are discarded and the
    /// terrain stays procedural.
    pub fn with_template(seed: u64, template: MapTemplate) -> Self {
        let mut terrain = Self::new(seed);
        if template.is_valid() {
            terrain.template = Some(template);
        }
        terrain
    }

    pub fn seed(&self) -> u64 {
        self.generator.seed()
    }

    pub fn template(&self) -> Option<&MapTemplate> {
        self.template.as_ref()
    }

    pub fn has_template(&self) -> bool {
        self.template.is_some()
    }

    /// Whether a coordinate may ever be edited.
    pub fn in_bounds(x: i32, y: i32, z: i32) -> bool {
        (0..WORLD_HEIGHT).contains(&y)
            && (-WORLD_HALF_EXTENT..WORLD_HALF_EXTENT).contains(&x)
            && (-WORLD_HALF_EXTENT..WORLD_HALF_EXTENT).contains(&z)
    }

    /// Block produced by the template or generator, ignoring overrides.
    pub fn base_block(&self, x: i32, y: i32, z: i32) -> BlockType {
        match &self.template {
            Some(template) => template.get_block(x, y, z),
            None => self.generator.block_at(x, y, z),
        }
    }

    pub fn get_block(&self, x: i32, y: i32, z: i32) -> BlockType {
        if let Some(block) = self.overrides.get(&BlockKey::new(x, y, z)) {
            return *block;
        }
        self.base_block(x, y, z)
    }

    pub fn is_solid(&self, x: i32, y: i32, z: i32) -> bool {
        self.get_block(x, y, z).is_solid()
    }

    /// Editor/system edit. Never marks the coordinate as player-placed and
    /// drops the override when it would match the base layer.
    ///
    /// Returns false for out-of-range coordinates, which are ignored.
    pub fn set_block(&mut self, x: i32, y: i32, z: i32, block: BlockType) -> bool {
        if !Self::in_bounds(x, y, z) {
            return false;
        }
        let key = BlockKey::new(x, y, z);
        self.player_placed.remove(&key);
        if block == self.base_block(x, y, z) {
            self.overrides.remove(&key);
        } else {
            self.overrides.insert(key, block);
        }
        true
    }

    /// Player placement. The override is kept even when it matches the base
    /// layer so the block stays breakable as a player block.
    pub fn place_player_block(&mut self, x: i32, y: i32, z: i32, block: BlockType) -> bool {
        if !Self::in_bounds(x, y, z) {
            return false;
        }
        let key = BlockKey::new(x, y, z);
        self.overrides.insert(key, block);
        self.player_placed.insert(key);
        true
    }

    /// Player break. Always leaves an air override behind, even over air in
    /// the base layer, so the edit stays visible.
    pub fn break_player_block(&mut self, x: i32, y: i32, z: i32) -> bool {
        if !Self::in_bounds(x, y, z) {
            return false;
        }
        let key = BlockKey::new(x, y, z);
        self.overrides.insert(key, BlockType::Air);
        self.player_placed.remove(&key);
        true
    }

    pub fn is_player_placed(&self, x: i32, y: i32, z: i32) -> bool {
        self.player_placed.contains(&BlockKey::new(x, y, z))
    }

    /// Breakability policy for player actions.
    pub fn can_player_break(&self, x: i32, y: i32, z: i32) -> bool {
        let block = self.get_block(x, y, z);
        if matches!(block, BlockType::Air | BlockType::Bedrock) {
            return false;
        }

        let Some(template) = &self.template else {
            return true;
        };

        let key = BlockKey::new(x, y, z);
        if self.player_placed.contains(&key) {
            return true;
        }
        if self.overrides.contains_key(&key) {
            // Placed by the editor or a script: not part of the template.
            return false;
        }
        template.contains_column(x, z) && template.is_breakable(block)
    }

    /// Y of the first non-solid block above the highest solid block at or
    /// below `from_y` in the column; 0 when the column is empty.
    pub fn surface_below(&self, x: i32, z: i32, from_y: i32) -> i32 {
        let mut y = from_y.min(WORLD_HEIGHT - 1);
        while y >= 0 {
            if self.is_solid(x, y, z) {
                return y + 1;
            }
            y -= 1;
        }
        0
    }

    /// Y of the first non-solid block above the topmost solid block.
    pub fn surface_height(&self, x: i32, z: i32) -> i32 {
        self.surface_below(x, z, WORLD_HEIGHT - 1)
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }

    pub fn player_placed_count(&self) -> usize {
        self.player_placed.len()
    }

    /// Inclusive `(min, max)` corners of all overridden coordinates.
    pub fn override_bounds(&self) -> Option<(BlockKey, BlockKey)> {
        let mut keys = self.overrides.keys();
        let first = *keys.next()?;
        Some(keys.fold((first, first), |(min, max), k| {
            (
                BlockKey::new(min.x.min(k.x), min.y.min(k.y), min.z.min(k.z)),
                BlockKey::new(max.x.max(k.x), max.y.max(k.y), max.z.max(k.z)),
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template_terrain() -> Terrain {
        let mut template = MapTemplate::new("test", 1, (0, 0), (0, 0));
        for x in 0..16 {
            for z in 0..16 {
                template.set_block(x, 0, z, BlockType::Bedrock);
                template.set_block(x, 1, z, BlockType::Stone);
                template.set_block(x, 2, z, BlockType::Brick);
            }
        }
        template.set_breakable(BlockType::Brick, true);
        Terrain::with_template(7, template)
    }

    #[test]
    fn test_procedural_layers() {
        let terrain = Terrain::new(12345);
        let h = TerrainGenerator::new(12345).column_height(3, -8);

        assert_eq!(terrain.get_block(3, 0, -8), BlockType::Bedrock);
        assert_eq!(terrain.get_block(3, h - 1, -8), BlockType::Grass);
        assert_eq!(terrain.get_block(3, h - 2, -8), BlockType::Dirt);
        assert_eq!(terrain.get_block(3, h - 4, -8), BlockType::Dirt);
        assert_eq!(terrain.get_block(3, h - 5, -8), BlockType::Stone);
        assert_eq!(terrain.get_block(3, h, -8), BlockType::Air);
        assert_eq!(terrain.surface_height(3, -8), h);
    }

    #[test]
    fn test_generator_is_deterministic() {
        let a = Terrain::new(99);
        let b = Terrain::new(99);
        for x in (-64..64).step_by(7) {
            for z in (-64..64).step_by(5) {
                for y in 0..WORLD_HEIGHT {
                    assert_eq!(a.get_block(x, y, z), b.get_block(x, y, z));
                }
            }
        }
    }

    #[test]
    fn test_override_precedence() {
        let mut terrain = Terrain::new(1);
        let h = terrain.surface_height(0, 0);
        assert!(terrain.set_block(0, h + 3, 0, BlockType::Glass));
        assert_eq!(terrain.get_block(0, h + 3, 0), BlockType::Glass);
        assert_eq!(terrain.override_count(), 1);
    }

    #[test]
    fn test_editor_drops_redundant_override() {
        let mut terrain = Terrain::new(1);
        let h = terrain.surface_height(5, 5);
        terrain.set_block(5, h - 1, 5, BlockType::Sand);
        assert_eq!(terrain.override_count(), 1);
        terrain.set_block(5, h - 1, 5, BlockType::Grass);
        assert_eq!(terrain.override_count(), 0);
        assert!(!terrain.is_player_placed(5, h - 1, 5));
    }

    #[test]
    fn test_player_place_keeps_redundant_override() {
        let mut terrain = Terrain::new(1);
        let h = terrain.surface_height(2, 2);
        terrain.place_player_block(2, h - 1, 2, BlockType::Grass);
        assert_eq!(terrain.override_count(), 1);
        assert!(terrain.is_player_placed(2, h - 1, 2));
    }

    #[test]
    fn test_player_place_is_idempotent() {
        let mut terrain = Terrain::new(1);
        terrain.place_player_block(0, 40, 0, BlockType::Brick);
        terrain.place_player_block(0, 40, 0, BlockType::Brick);
        assert_eq!(terrain.get_block(0, 40, 0), BlockType::Brick);
        assert_eq!(terrain.player_placed_count(), 1);
    }

    #[test]
    fn test_break_forces_air_override() {
        let mut terrain = Terrain::new(1);
        terrain.break_player_block(0, 50, 0);
        assert_eq!(terrain.get_block(0, 50, 0), BlockType::Air);
        assert_eq!(terrain.override_count(), 1);
    }

    #[test]
    fn test_break_then_place_restores_query() {
        let mut terrain = template_terrain();
        let before = terrain.get_block(4, 2, 4);
        terrain.break_player_block(4, 2, 4);
        assert_eq!(terrain.get_block(4, 2, 4), BlockType::Air);
        terrain.place_player_block(4, 2, 4, before);
        assert_eq!(terrain.get_block(4, 2, 4), before);
    }

    #[test]
    fn test_out_of_range_edits_ignored() {
        let mut terrain = Terrain::new(1);
        assert!(!terrain.set_block(0, -1, 0, BlockType::Stone));
        assert!(!terrain.place_player_block(0, WORLD_HEIGHT, 0, BlockType::Stone));
        assert!(!terrain.break_player_block(WORLD_HALF_EXTENT, 10, 0));
        assert_eq!(terrain.override_count(), 0);
    }

    #[test]
    fn test_breakability_legacy() {
        let mut terrain = Terrain::new(1);
        let h = terrain.surface_height(0, 0);
        assert!(!terrain.can_player_break(0, 0, 0));
        assert!(!terrain.can_player_break(0, h + 2, 0));
        assert!(terrain.can_player_break(0, h - 1, 0));
        terrain.set_block(0, h + 2, 0, BlockType::Brick);
        assert!(terrain.can_player_break(0, h + 2, 0));
    }

    #[test]
    fn test_breakability_with_template() {
        let mut terrain = template_terrain();
        assert!(!terrain.can_player_break(3, 0, 3));
        assert!(!terrain.can_player_break(3, 1, 3));
        assert!(terrain.can_player_break(3, 2, 3));
        assert!(!terrain.can_player_break(3, 5, 3));

        terrain.place_player_block(3, 3, 3, BlockType::Stone);
        assert!(terrain.can_player_break(3, 3, 3));

        // Editor block inside the template is a "ghost" block.
        terrain.set_block(3, 4, 3, BlockType::Brick);
        assert!(!terrain.can_player_break(3, 4, 3));
    }

    #[test]
    fn test_template_layer_replaces_generator() {
        let terrain = template_terrain();
        assert_eq!(terrain.get_block(1, 2, 1), BlockType::Brick);
        assert_eq!(terrain.get_block(1, 3, 1), BlockType::Air);
        assert_eq!(terrain.get_block(100, 1, 100), BlockType::Air);
    }

    #[test]
    fn test_invalid_template_falls_back() {
        let terrain = Terrain::with_template(3, MapTemplate::new("", 0, (0, 0), (0, 0)));
        assert!(!terrain.has_template());
        assert_eq!(terrain.get_block(0, 0, 0), BlockType::Bedrock);
    }

    #[test]
    fn test_override_bounds() {
        let mut terrain = Terrain::new(1);
        assert!(terrain.override_bounds().is_none());
        terrain.break_player_block(-2, 30, 5);
        terrain.break_player_block(4, 31, -1);
        let (min, max) = terrain.override_bounds().unwrap();
        assert_eq!(min, BlockKey::new(-2, 30, -1));
        assert_eq!(max, BlockKey::new(4, 31, 5));
    }
}
