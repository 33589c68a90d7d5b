//! Performance benchmarks for critical game systems
//!
//! Thresholds are loose enough for debug builds on slow CI machines; they
//! catch order-of-magnitude regressions only.

use shared::physics::apply_input;
use shared::protocol::{InputFrame, Message, PlayerState};
use shared::reach::is_reachable;
use shared::template::MapTemplate;
use shared::terrain::Terrain;
use shared::{decode, encode, BlockType, PlayerBody, Vec3, CHUNK_SIZE, MAX_REACH};
use std::time::Instant;

fn arena() -> Terrain {
    let mut template = MapTemplate::new("bench", 1, (-2, -2), (1, 1));
    for x in -2 * CHUNK_SIZE..2 * CHUNK_SIZE {
        for z in -2 * CHUNK_SIZE..2 * CHUNK_SIZE {
            template.set_block(x, 0, z, BlockType::Bedrock);
            for y in 1..8 {
                template.set_block(x, y, z, BlockType::Stone);
            }
            if (x + z) % 7 == 0 {
                template.set_block(x, 8, z, BlockType::Brick);
            }
        }
    }
    Terrain::with_template(1, template)
}

/// Benchmarks procedural block queries, which hash and sample noise per call
#[test]
fn benchmark_procedural_queries() {
    let terrain = Terrain::new(1337);
    let iterations = 100_000;
    let start = Instant::now();

    let mut solid = 0;
    for i in 0..iterations {
        let x = (i % 317) - 158;
        let z = (i / 317) - 158;
        if terrain.is_solid(x, 20, z) {
            solid += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Procedural queries: {} iterations in {:?} ({:.2} ns/iter), {} solid",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64,
        solid
    );

    assert!(duration.as_millis() < 5000);
}

/// Benchmarks template block queries
#[test]
fn benchmark_template_queries() {
    let terrain = arena();
    let iterations = 200_000;
    let start = Instant::now();

    let mut solid = 0;
    for i in 0..iterations {
        if terrain.is_solid((i % 64) - 32, i % 10, (i / 64 % 64) - 32) {
            solid += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Template queries: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(solid > 0);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks per-axis collision for sixteen players over three seconds of ticks
#[test]
fn benchmark_collision_integration() {
    let terrain = arena();
    let mut bodies: Vec<PlayerBody> = (0..16)
        .map(|i| PlayerBody::at(Vec3::new(i as f32 * 2.0 - 15.5, 9.0, 3.5)))
        .collect();
    let input = InputFrame {
        move_y: 1.0,
        sprint: true,
        ..InputFrame::default()
    };

    let ticks = 30 * 3;
    let start = Instant::now();
    for tick in 0..ticks {
        let jump = tick % 20 == 0;
        for body in bodies.iter_mut() {
            let frame = InputFrame { jump, ..input };
            apply_input(body, &frame, false);
            body.integrate(&terrain, 1.0 / 30.0);
        }
    }

    let duration = start.elapsed();
    println!(
        "Collision: {} body steps in {:?} ({:.2} μs/step)",
        ticks * bodies.len(),
        duration,
        duration.as_micros() as f64 / (ticks * bodies.len()) as f64
    );

    assert!(bodies.iter().all(|b| b.position.y >= 8.0 - 1e-3));
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks reachability rays at maximum distance
#[test]
fn benchmark_reachability() {
    let terrain = arena();
    let eye = Vec3::new(0.5, 9.6, 0.5);
    let iterations = 10_000;
    let start = Instant::now();

    for i in 0..iterations {
        let target = ((i % 9) - 4, 8, (i / 9 % 9) - 4);
        let _ = is_reachable(&terrain, eye, target, MAX_REACH);
    }

    let duration = start.elapsed();
    println!(
        "Reachability: {} rays in {:?} ({:.2} μs/ray)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks encoding and decoding a full remote player update
#[test]
fn benchmark_codec() {
    let players: Vec<PlayerState> = (1..=16)
        .map(|id| PlayerState {
            player_id: id,
            position: Vec3::new(id as f32, 10.0, -(id as f32)),
            velocity: Vec3::new(1.0, 0.0, 1.0),
            on_ground: true,
            health: 100,
            team: (id % 2) as u8,
        })
        .collect();
    let message = Message::RemotePlayers {
        server_tick: 123_456,
        players,
    };

    let iterations = 10_000;
    let start = Instant::now();
    let mut bytes = 0;
    for _ in 0..iterations {
        let encoded = encode(&message).unwrap();
        bytes = encoded.len();
        let decoded = decode(&encoded).unwrap();
        assert!(matches!(decoded, Message::RemotePlayers { .. }));
    }

    let duration = start.elapsed();
    println!(
        "Codec: {} round trips of {} bytes in {:?} ({:.2} μs/iter)",
        iterations,
        bytes,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(bytes < 1200);
    assert!(duration.as_millis() < 2000);
}
