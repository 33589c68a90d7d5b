//! Reachability check for block actions.

use crate::physics::{voxel, Vec3};
use crate::terrain::Terrain;

/// Distance between ray samples, in blocks.
pub const RAY_STEP: f32 = 0.05;

/// Whether the voxel at `target` can be interacted with from `eye`.
///
/// The ray runs from the eye to the center of the target voxel. It is rejected
/// when the target is farther than `max_distance` or when a solid voxel other
/// than the target is sampled first. A ray that runs out without touching the
/// target or an occluder counts as reachable.
pub fn is_reachable(terrain: &Terrain, eye: Vec3, target: (i32, i32, i32), max_distance: f32) -> bool {
    let center = Vec3::new(
        target.0 as f32 + 0.5,
        target.1 as f32 + 0.5,
        target.2 as f32 + 0.5,
    );
    let delta = center.sub(&eye);
    let distance = delta.length();

    if !distance.is_finite() || distance > max_distance {
        return false;
    }
    if distance < 1e-4 {
        return true;
    }

    let dir = delta.scale(1.0 / distance);
    let mut t = 0.0;
    while t <= distance {
        let p = eye.add(&dir.scale(t));
        let cell = (voxel(p.x), voxel(p.y), voxel(p.z));
        if cell == target {
            return true;
        }
        if terrain.is_solid(cell.0, cell.1, cell.2) {
            return false;
        }
        t += RAY_STEP;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockType;
    use crate::template::MapTemplate;

    fn open_world() -> Terrain {
        Terrain::with_template(1, MapTemplate::new("reach", 1, (-1, -1), (1, 1)))
    }

    #[test]
    fn test_clear_line_is_reachable() {
        let terrain = open_world();
        let eye = Vec3::new(0.5, 5.5, 0.5);
        assert!(is_reachable(&terrain, eye, (0, 5, 2), 6.0));
    }

    #[test]
    fn test_occluded_target_is_rejected() {
        let mut terrain = open_world();
        terrain.set_block(0, 5, 1, BlockType::Stone);
        let eye = Vec3::new(0.5, 5.5, 0.5);
        assert!(!is_reachable(&terrain, eye, (0, 5, 2), 6.0));
    }

    #[test]
    fn test_solid_target_itself_is_reachable() {
        let mut terrain = open_world();
        terrain.set_block(0, 5, 2, BlockType::Stone);
        let eye = Vec3::new(0.5, 5.5, 0.5);
        assert!(is_reachable(&terrain, eye, (0, 5, 2), 6.0));
    }

    #[test]
    fn test_too_far_is_rejected() {
        let terrain = open_world();
        let eye = Vec3::new(0.5, 5.5, 0.5);
        assert!(!is_reachable(&terrain, eye, (0, 5, 10), 6.0));
    }

    #[test]
    fn test_zero_distance_is_reachable() {
        let terrain = open_world();
        assert!(is_reachable(&terrain, Vec3::new(3.5, 3.5, 3.5), (3, 3, 3), 6.0));
    }

    #[test]
    fn test_non_solid_blocks_do_not_occlude() {
        let mut terrain = open_world();
        terrain.set_block(0, 5, 1, BlockType::Water);
        terrain.set_block(0, 5, 2, BlockType::Light);
        let eye = Vec3::new(0.5, 5.5, 0.5);
        assert!(is_reachable(&terrain, eye, (0, 5, 3), 6.0));
    }

    #[test]
    fn test_nan_eye_is_rejected() {
        let terrain = open_world();
        let eye = Vec3::new(f32::NAN, 5.5, 0.5);
        assert!(!is_reachable(&terrain, eye, (0, 5, 2), 6.0));
    }
}
