//! Authoritative world state and the rules applied to it.
//!
//! [`GameState`] owns the terrain and decides what player requests do to it.
//! It knows nothing about connections; the network layer looks up the
//! acting player's body and hands it in.

use log::{debug, info, warn};
use shared::physics::{apply_input, voxel, PlayerBody, Vec3};
use shared::protocol::{InputFrame, RejectReason};
use shared::reach::is_reachable;
use shared::template::{MapTemplate, TemplateError, TEMPLATE_EXTENSION};
use shared::terrain::Terrain;
use shared::{BlockType, CHUNK_SIZE, EYE_HEIGHT, MAX_REACH, WORLD_HEIGHT};
use std::path::{Path, PathBuf};

/// Effect of an accepted block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockChange {
    Placed(BlockType),
    Broken,
}

/// Layers below y = 0 a player may fall before being killed.
const KILL_DEPTH: f32 = 16.0;

pub struct GameState {
    pub terrain: Terrain,
    spawn: Vec3,
    maps_dir: Option<PathBuf>,
    /// Current round number; 0 before the first round.
    pub round: u32,
    pub round_active: bool,
}

impl GameState {
    pub fn new(terrain: Terrain, maps_dir: Option<PathBuf>) -> Self {
        let spawn = match terrain.template().and_then(|t| t.spawn) {
            Some([x, y, z]) => Vec3::new(x, y, z),
            None => {
                let y = terrain.surface_height(0, 0) as f32;
                Vec3::new(0.5, y, 0.5)
            }
        };
        info!(
            "World ready: seed {}, {}, spawn ({:.1}, {:.1}, {:.1})",
            terrain.seed(),
            if terrain.has_template() {
                "template terrain"
            } else {
                "procedural terrain"
            },
            spawn.x,
            spawn.y,
            spawn.z
        );
        Self {
            terrain,
            spawn,
            maps_dir,
            round: 0,
            round_active: false,
        }
    }

    /// Builds the world for `seed`, using the newest template in `maps_dir`
    /// when one is available.
    pub fn load(seed: u64, maps_dir: Option<PathBuf>) -> Self {
        let template = maps_dir
            .as_deref()
            .and_then(shared::template::load_latest_template);
        let terrain = match template {
            Some(template) => Terrain::with_template(seed, template),
            None => Terrain::new(seed),
        };
        Self::new(terrain, maps_dir)
    }

    pub fn spawn_point(&self) -> Vec3 {
        self.spawn
    }

    pub fn maps_dir(&self) -> Option<&Path> {
        self.maps_dir.as_deref()
    }

    pub fn spawn_body(&self) -> PlayerBody {
        PlayerBody::at(self.spawn)
    }

    pub fn eye_position(body: &PlayerBody) -> Vec3 {
        body.position.add(&Vec3::new(0.0, EYE_HEIGHT, 0.0))
    }

    /// Advances one body by `dt` under `input`. Template worlds get full
    /// collision; procedural worlds use surface snapping.
    pub fn step_player(&self, body: &mut PlayerBody, input: &InputFrame, jump_held: bool, dt: f32) {
        apply_input(body, input, jump_held);
        if self.terrain.has_template() {
            body.integrate(&self.terrain, dt);
        } else {
            body.integrate_legacy(&self.terrain, dt);
        }
    }

    /// Whether the body has fallen out of the world.
    pub fn is_out_of_world(body: &PlayerBody) -> bool {
        body.position.y < -KILL_DEPTH
    }

    /// Validates and applies a block request from `actor`.
    ///
    /// `Ok(None)` means the coordinate is outside the world and the request
    /// is ignored without a reply. `others` are the bodies a placement must
    /// not intersect; the actor's own body is checked as well.
    pub fn try_set_block<'a>(
        &mut self,
        actor: &PlayerBody,
        others: impl IntoIterator<Item = &'a PlayerBody>,
        x: i32,
        y: i32,
        z: i32,
        block: BlockType,
    ) -> Result<Option<BlockChange>, RejectReason> {
        if !Terrain::in_bounds(x, y, z) {
            debug!("Ignoring block request outside the world at ({}, {}, {})", x, y, z);
            return Ok(None);
        }

        if block != BlockType::Air && !block.is_placeable() {
            return Err(RejectReason::InvalidBlock);
        }

        let eye = Self::eye_position(actor);
        if !is_reachable(&self.terrain, eye, (x, y, z), MAX_REACH) {
            return Err(RejectReason::Unreachable);
        }

        if block == BlockType::Air {
            if !self.terrain.can_player_break(x, y, z) {
                return Err(RejectReason::Unbreakable);
            }
            self.terrain.break_player_block(x, y, z);
            return Ok(Some(BlockChange::Broken));
        }

        if self.terrain.is_solid(x, y, z) {
            return Err(RejectReason::Occupied);
        }
        if block.is_solid()
            && (actor.overlaps_voxel(x, y, z)
                || others.into_iter().any(|body| body.overlaps_voxel(x, y, z)))
        {
            return Err(RejectReason::Occupied);
        }

        self.terrain.place_player_block(x, y, z, block);
        Ok(Some(BlockChange::Placed(block)))
    }

    /// Editor or script write; bypasses every player rule except bounds.
    pub fn set_block(&mut self, x: i32, y: i32, z: i32, block: BlockType) -> bool {
        if !Terrain::in_bounds(x, y, z) {
            return false;
        }
        self.terrain.set_block(x, y, z, block)
    }

    /// Snapshot of the current terrain as a template.
    ///
    /// Template worlds export the template's chunk range; procedural worlds
    /// export the chunks touched by edits. Returns `None` when a procedural
    /// world has no edits.
    pub fn capture_template(&self, id: &str, name: &str) -> Option<MapTemplate> {
        let (chunk_min, chunk_max, version) = match self.terrain.template() {
            Some(t) => (
                (t.chunk_min_x, t.chunk_min_z),
                (t.chunk_max_x, t.chunk_max_z),
                t.version + 1,
            ),
            None => {
                let (min, max) = self.terrain.override_bounds()?;
                (
                    (min.x.div_euclid(CHUNK_SIZE), min.z.div_euclid(CHUNK_SIZE)),
                    (max.x.div_euclid(CHUNK_SIZE), max.z.div_euclid(CHUNK_SIZE)),
                    1,
                )
            }
        };

        let mut template = MapTemplate::new(id, version, chunk_min, chunk_max);
        template.name = name.to_string();
        template.spawn = Some([self.spawn.x, self.spawn.y, self.spawn.z]);
        match self.terrain.template() {
            Some(source) => {
                for block in source.breakable_blocks() {
                    template.set_breakable(block, true);
                }
            }
            None => {
                for block in BlockType::ALL {
                    if block != BlockType::Air && block != BlockType::Bedrock {
                        template.set_breakable(block, true);
                    }
                }
            }
        }

        let (min_x, min_z, max_x, max_z) = template.block_bounds();
        for x in min_x..=max_x {
            for z in min_z..=max_z {
                for y in 0..WORLD_HEIGHT {
                    let block = self.terrain.get_block(x, y, z);
                    if block != BlockType::Air {
                        template.set_block(x, y, z, block);
                    }
                }
            }
        }
        Some(template)
    }

    /// Writes the current terrain into the maps directory. Returns the file
    /// name on success.
    pub fn export_map(&self, name: &str) -> Result<String, TemplateError> {
        let dir = self
            .maps_dir
            .as_deref()
            .ok_or_else(|| TemplateError::Invalid("no maps directory configured".into()))?;

        let id = sanitize_map_name(name);
        let template = self
            .capture_template(&id, name)
            .ok_or_else(|| TemplateError::Invalid("nothing to export".into()))?;

        let file_name = format!("{}.{}", id, TEMPLATE_EXTENSION);
        let path = unique_path(dir, &file_name);
        template.save(&path)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(file_name);
        info!("Exported map '{}' to {}", name, path.display());
        Ok(file_name)
    }

    /// Voxel the body's feet are in, for logs.
    pub fn feet_voxel(body: &PlayerBody) -> (i32, i32, i32) {
        (
            voxel(body.position.x),
            voxel(body.position.y),
            voxel(body.position.z),
        )
    }
}

/// Keeps ASCII letters, digits, `-` and `_`; anything else becomes `_`.
pub fn sanitize_map_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .take(48)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "map".to_string()
    } else {
        cleaned
    }
}

fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = file_name
        .strip_suffix(&format!(".{}", TEMPLATE_EXTENSION))
        .unwrap_or(file_name);
    for n in 2.. {
        let candidate = dir.join(format!("{}-{}.{}", stem, n, TEMPLATE_EXTENSION));
        if !candidate.exists() {
            return candidate;
        }
    }
    warn!("Could not find a free file name for {}", file_name);
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::PLAYER_WIDTH;

    /// One chunk of flat stone, top surface at y = 5.
    fn flat_template() -> MapTemplate {
        let mut template = MapTemplate::new("flat", 1, (0, 0), (0, 0));
        for x in 0..CHUNK_SIZE {
            for z in 0..CHUNK_SIZE {
                template.set_block(x, 0, z, BlockType::Bedrock);
                for y in 1..5 {
                    template.set_block(x, y, z, BlockType::Stone);
                }
            }
        }
        template.set_breakable(BlockType::Stone, true);
        template.spawn = Some([4.5, 5.0, 4.5]);
        template
    }

    fn nobody() -> Vec<&'static PlayerBody> {
        Vec::new()
    }

    fn flat_game() -> GameState {
        GameState::new(Terrain::with_template(3, flat_template()), None)
    }

    #[test]
    fn test_spawn_comes_from_template() {
        let game = flat_game();
        assert_eq!(game.spawn_point(), Vec3::new(4.5, 5.0, 4.5));
    }

    #[test]
    fn test_procedural_spawn_is_on_surface() {
        let game = GameState::new(Terrain::new(11), None);
        let expected = game.terrain.surface_height(0, 0) as f32;
        assert_approx_eq!(game.spawn_point().y, expected, 1e-6);
    }

    #[test]
    fn test_place_next_to_player() {
        let mut game = flat_game();
        let actor = game.spawn_body();
        let result = game.try_set_block(&actor, nobody(), 6, 5, 4, BlockType::Brick);
        assert_eq!(result, Ok(Some(BlockChange::Placed(BlockType::Brick))));
        assert_eq!(game.terrain.get_block(6, 5, 4), BlockType::Brick);
        assert!(game.terrain.is_player_placed(6, 5, 4));
    }

    #[test]
    fn test_place_into_own_body_is_occupied() {
        let mut game = flat_game();
        let actor = game.spawn_body();
        let result = game.try_set_block(&actor, nobody(), 4, 5, 4, BlockType::Brick);
        assert_eq!(result, Err(RejectReason::Occupied));
    }

    #[test]
    fn test_place_into_other_player_is_occupied() {
        let mut game = flat_game();
        let actor = game.spawn_body();
        let other = PlayerBody::at(Vec3::new(6.5, 5.0, 4.5));
        let result = game.try_set_block(&actor, [&other], 6, 5, 4, BlockType::Brick);
        assert_eq!(result, Err(RejectReason::Occupied));
    }

    #[test]
    fn test_place_non_solid_block_inside_player_is_allowed() {
        let mut game = flat_game();
        let actor = game.spawn_body();
        let result = game.try_set_block(&actor, nobody(), 4, 6, 4, BlockType::Light);
        assert_eq!(result, Ok(Some(BlockChange::Placed(BlockType::Light))));
    }

    #[test]
    fn test_place_into_solid_is_occupied() {
        let mut game = flat_game();
        let actor = game.spawn_body();
        let result = game.try_set_block(&actor, nobody(), 5, 4, 4, BlockType::Brick);
        assert_eq!(result, Err(RejectReason::Occupied));
    }

    #[test]
    fn test_bedrock_cannot_be_placed() {
        let mut game = flat_game();
        let actor = game.spawn_body();
        let result = game.try_set_block(&actor, nobody(), 6, 5, 4, BlockType::Bedrock);
        assert_eq!(result, Err(RejectReason::InvalidBlock));
    }

    #[test]
    fn test_far_target_is_unreachable() {
        let mut game = flat_game();
        let actor = game.spawn_body();
        let result = game.try_set_block(&actor, nobody(), 14, 5, 14, BlockType::Brick);
        assert_eq!(result, Err(RejectReason::Unreachable));
    }

    #[test]
    fn test_out_of_world_is_ignored() {
        let mut game = flat_game();
        let actor = game.spawn_body();
        assert_eq!(
            game.try_set_block(&actor, nobody(), 4, -1, 4, BlockType::Brick),
            Ok(None)
        );
        assert_eq!(
            game.try_set_block(&actor, nobody(), 4, WORLD_HEIGHT, 4, BlockType::Air),
            Ok(None)
        );
    }

    #[test]
    fn test_break_template_block() {
        let mut game = flat_game();
        let actor = game.spawn_body();
        let result = game.try_set_block(&actor, nobody(), 5, 4, 4, BlockType::Air);
        assert_eq!(result, Ok(Some(BlockChange::Broken)));
        assert_eq!(game.terrain.get_block(5, 4, 4), BlockType::Air);
    }

    #[test]
    fn test_break_bedrock_is_refused() {
        let mut game = flat_game();
        // Dig a shaft so bedrock is in reach and visible.
        for y in 1..5 {
            game.set_block(4, y, 4, BlockType::Air);
        }
        let mut actor = game.spawn_body();
        actor.position.y = 1.0;
        let result = game.try_set_block(&actor, nobody(), 4, 0, 4, BlockType::Air);
        assert_eq!(result, Err(RejectReason::Unbreakable));
    }

    #[test]
    fn test_step_player_walks_forward() {
        let game = flat_game();
        let mut body = game.spawn_body();
        body.on_ground = true;
        let input = InputFrame {
            move_y: 1.0,
            ..InputFrame::default()
        };
        let start_z = body.position.z;
        for _ in 0..10 {
            game.step_player(&mut body, &input, false, 1.0 / 30.0);
        }
        assert!(body.position.z > start_z);
        assert_approx_eq!(body.position.y, 5.0, 1e-5);
        assert!(body.position.x - PLAYER_WIDTH / 2.0 > 4.0);
    }

    #[test]
    fn test_out_of_world_detection() {
        let body = PlayerBody::at(Vec3::new(0.0, -20.0, 0.0));
        assert!(GameState::is_out_of_world(&body));
        let body = PlayerBody::at(Vec3::new(0.0, 0.0, 0.0));
        assert!(!GameState::is_out_of_world(&body));
    }

    #[test]
    fn test_export_without_maps_dir_fails() {
        let game = flat_game();
        assert!(game.export_map("arena").is_err());
    }

    #[test]
    fn test_export_and_reload_template() {
        let dir = tempfile::tempdir().unwrap();
        let mut game = GameState::new(
            Terrain::with_template(3, flat_template()),
            Some(dir.path().to_path_buf()),
        );
        game.set_block(2, 5, 2, BlockType::Glass);

        let file_name = game.export_map("My Arena!").unwrap();
        assert_eq!(file_name, "My_Arena_.json");

        let loaded = MapTemplate::load(&dir.path().join(&file_name)).unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.get_block(2, 5, 2), BlockType::Glass);
        assert_eq!(loaded.get_block(2, 4, 2), BlockType::Stone);
        assert!(loaded.is_breakable(BlockType::Stone));

        let second = game.export_map("My Arena!").unwrap();
        assert_eq!(second, "My_Arena_-2.json");
    }

    #[test]
    fn test_export_procedural_needs_edits() {
        let dir = tempfile::tempdir().unwrap();
        let mut game = GameState::new(Terrain::new(5), Some(dir.path().to_path_buf()));
        assert!(game.export_map("empty").is_err());

        game.set_block(20, 40, -3, BlockType::Brick);
        let file_name = game.export_map("edits").unwrap();
        let loaded = MapTemplate::load(&dir.path().join(file_name)).unwrap();
        assert_eq!(loaded.chunk_min_x, 1);
        assert_eq!(loaded.chunk_min_z, -1);
        assert_eq!(loaded.get_block(20, 40, -3), BlockType::Brick);
    }

    #[test]
    fn test_sanitize_map_name() {
        assert_eq!(sanitize_map_name("  ok-name_1 "), "ok-name_1");
        assert_eq!(sanitize_map_name("../etc"), "___etc");
        assert_eq!(sanitize_map_name(""), "map");
    }
}
