//! Player kinematics against voxel terrain.
//!
//! The player is an axis-aligned box anchored at its feet. Movement is
//! resolved one axis at a time (X, then Z, then Y): a separable-axis
//! approximation that lets a player slide along one wall while blocked by
//! another.

use crate::protocol::InputFrame;
use crate::terrain::Terrain;
use crate::{
    GRAVITY, JUMP_VELOCITY, PLAYER_HEIGHT, PLAYER_WIDTH, SPRINT_SPEED, TERMINAL_VELOCITY,
    WALK_SPEED,
};
use serde::{Deserialize, Serialize};

/// Inward shrink of the footprint so touching faces do not count as overlap.
pub const EPSILON: f32 = 1e-4;
/// Gap left between the player and a wall after clamping.
pub const SKIN: f32 = 1e-3;
/// Longest single-axis move tested against one boundary voxel.
const MAX_AXIS_STEP: f32 = 0.9;

/// Floor-based world to voxel mapping; correct for negative coordinates.
pub fn voxel(coord: f32) -> i32 {
    coord.floor() as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn sub(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn add(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn scale(&self, s: f32) -> Vec3 {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }
}

/// Authoritative kinematic state of one player.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayerBody {
    /// Feet position (center of the footprint, bottom of the box).
    pub position: Vec3,
    pub velocity: Vec3,
    pub on_ground: bool,
}

impl PlayerBody {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            on_ground: false,
        }
    }

    /// Inclusive voxel range covered by the player on one axis, shrunk by
    /// [`EPSILON`].
    fn span(min: f32, max: f32) -> (i32, i32) {
        (voxel(min + EPSILON), voxel(max - EPSILON))
    }

    fn x_span(&self) -> (i32, i32) {
        let half = PLAYER_WIDTH / 2.0;
        Self::span(self.position.x - half, self.position.x + half)
    }

    fn z_span(&self) -> (i32, i32) {
        let half = PLAYER_WIDTH / 2.0;
        Self::span(self.position.z - half, self.position.z + half)
    }

    fn y_span(&self) -> (i32, i32) {
        Self::span(self.position.y, self.position.y + PLAYER_HEIGHT)
    }

    /// Whether the player's box overlaps voxel (x, y, z).
    pub fn overlaps_voxel(&self, x: i32, y: i32, z: i32) -> bool {
        let (x0, x1) = self.x_span();
        let (y0, y1) = self.y_span();
        let (z0, z1) = self.z_span();
        (x0..=x1).contains(&x) && (y0..=y1).contains(&y) && (z0..=z1).contains(&z)
    }

    /// Moves along X by `dx`, stopping at the first solid voxel face.
    pub fn resolve_x(&mut self, terrain: &Terrain, dx: f32) -> bool {
        if dx == 0.0 {
            return false;
        }
        let half = PLAYER_WIDTH / 2.0;
        let (y0, y1) = self.y_span();
        let (z0, z1) = self.z_span();

        let leading = if dx > 0.0 {
            self.position.x + half + dx
        } else {
            self.position.x - half + dx
        };
        let boundary = voxel(leading);

        let blocked = (y0..=y1).any(|y| (z0..=z1).any(|z| terrain.is_solid(boundary, y, z)));
        if blocked {
            self.position.x = if dx > 0.0 {
                boundary as f32 - half - SKIN
            } else {
                (boundary + 1) as f32 + half + SKIN
            };
            self.velocity.x = 0.0;
        } else {
            self.position.x += dx;
        }
        blocked
    }

    /// Moves along Z by `dz`, stopping at the first solid voxel face.
    pub fn resolve_z(&mut self, terrain: &Terrain, dz: f32) -> bool {
        if dz == 0.0 {
            return false;
        }
        let half = PLAYER_WIDTH / 2.0;
        let (x0, x1) = self.x_span();
        let (y0, y1) = self.y_span();

        let leading = if dz > 0.0 {
            self.position.z + half + dz
        } else {
            self.position.z - half + dz
        };
        let boundary = voxel(leading);

        let blocked = (x0..=x1).any(|x| (y0..=y1).any(|y| terrain.is_solid(x, y, boundary)));
        if blocked {
            self.position.z = if dz > 0.0 {
                boundary as f32 - half - SKIN
            } else {
                (boundary + 1) as f32 + half + SKIN
            };
            self.velocity.z = 0.0;
        } else {
            self.position.z += dz;
        }
        blocked
    }

    /// Moves along Y by `dy`. Downward contact lands the player exactly on
    /// the block's top face and sets `on_ground`; upward contact only stops
    /// the ascent.
    pub fn resolve_y(&mut self, terrain: &Terrain, dy: f32) -> bool {
        if dy == 0.0 {
            return false;
        }
        let (x0, x1) = self.x_span();
        let (z0, z1) = self.z_span();
        let footprint_solid =
            |y: i32| (x0..=x1).any(|x| (z0..=z1).any(|z| terrain.is_solid(x, y, z)));

        if dy < 0.0 {
            let boundary = voxel(self.position.y + dy);
            if footprint_solid(boundary) {
                self.position.y = (boundary + 1) as f32;
                self.velocity.y = 0.0;
                self.on_ground = true;
                return true;
            }
            self.position.y += dy;
            self.on_ground = false;
            false
        } else {
            self.on_ground = false;
            let boundary = voxel(self.position.y + PLAYER_HEIGHT + dy);
            if footprint_solid(boundary) {
                self.position.y = boundary as f32 - PLAYER_HEIGHT - SKIN;
                self.velocity.y = 0.0;
                return true;
            }
            self.position.y += dy;
            false
        }
    }

    /// Whether solid ground is directly under the footprint.
    pub fn is_supported(&self, terrain: &Terrain) -> bool {
        let (x0, x1) = self.x_span();
        let (z0, z1) = self.z_span();
        let below = voxel(self.position.y - EPSILON);
        (x0..=x1).any(|x| (z0..=z1).any(|z| terrain.is_solid(x, below, z)))
    }

    /// Gravity, then X, Z and Y resolution for one step of `dt` seconds.
    pub fn integrate(&mut self, terrain: &Terrain, dt: f32) {
        if !self.on_ground {
            self.velocity.y = (self.velocity.y - GRAVITY * dt).max(-TERMINAL_VELOCITY);
        }

        Self::sweep(self.velocity.x * dt, |d| self.resolve_x(terrain, d));
        Self::sweep(self.velocity.z * dt, |d| self.resolve_z(terrain, d));

        if self.velocity.y != 0.0 {
            Self::sweep(self.velocity.y * dt, |d| self.resolve_y(terrain, d));
        } else if self.on_ground {
            self.on_ground = self.is_supported(terrain);
        }
    }

    /// Splits a displacement into sub-moves short enough that no voxel is
    /// skipped, stopping at the first contact.
    fn sweep(displacement: f32, mut resolve: impl FnMut(f32) -> bool) {
        let steps = (displacement.abs() / MAX_AXIS_STEP).ceil().max(1.0) as u32;
        let step = displacement / steps as f32;
        for _ in 0..steps {
            if resolve(step) {
                break;
            }
        }
    }

    /// Simplified movement used when no map template is loaded: no wall
    /// collision, feet snap to the column surface under the player.
    pub fn integrate_legacy(&mut self, terrain: &Terrain, dt: f32) {
        if !self.on_ground {
            self.velocity.y = (self.velocity.y - GRAVITY * dt).max(-TERMINAL_VELOCITY);
        }

        self.position = self.position.add(&self.velocity.scale(dt));

        // Allow stepping up to one block; taller walls are climbed over a few ticks.
        let ground = terrain.surface_below(
            voxel(self.position.x),
            voxel(self.position.z),
            voxel(self.position.y) + 1,
        ) as f32;
        if self.position.y <= ground {
            self.position.y = ground;
            self.velocity.y = 0.0;
            self.on_ground = true;
        } else {
            self.on_ground = false;
        }
    }
}

/// Horizontal velocity from input axes rotated by yaw, scaled by walk or
/// sprint speed. Yaw 0 faces +Z; positive `move_x` strafes toward +X.
pub fn input_velocity(input: &InputFrame) -> (f32, f32) {
    let mut mx = input.move_x;
    let mut my = input.move_y;
    if !mx.is_finite() || !my.is_finite() {
        return (0.0, 0.0);
    }
    let len = (mx * mx + my * my).sqrt();
    if len > 1.0 {
        mx /= len;
        my /= len;
    }

    let speed = if input.sprint { SPRINT_SPEED } else { WALK_SPEED };
    let yaw = if input.yaw.is_finite() { input.yaw } else { 0.0 };
    let (sin, cos) = yaw.sin_cos();

    let vx = (mx * cos + my * sin) * speed;
    let vz = (-mx * sin + my * cos) * speed;
    (vx, vz)
}

/// Applies one input to the body: horizontal velocity and an edge-triggered
/// jump. `jump_was_held` is the jump state of the previous input.
pub fn apply_input(body: &mut PlayerBody, input: &InputFrame, jump_was_held: bool) {
    let (vx, vz) = input_velocity(input);
    body.velocity.x = vx;
    body.velocity.z = vz;

    if input.jump && !jump_was_held && body.on_ground {
        body.velocity.y = JUMP_VELOCITY;
        body.on_ground = false;
    }
}
