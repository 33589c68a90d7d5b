//! Seeded coherent noise used by the procedural terrain generator.
//!
//! The permutation table is built eagerly in [`PermutationTable::new`] and never
//! mutated afterwards, so a generator is a pure function of its seed.

use ::noise::core::perlin;
use ::noise::permutationtable::NoiseHasher;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Fisher-Yates shuffled 0..=255, duplicated to 512 entries so lattice
/// lookups never need to wrap.
#[derive(Debug, Clone)]
pub struct PermutationTable {
    values: [u8; 512],
}

impl PermutationTable {
    pub fn new(seed: u64) -> Self {
        let mut base: Vec<u8> = (0..=255u8).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        base.shuffle(&mut rng);

        let mut values = [0u8; 512];
        for (i, slot) in values.iter_mut().enumerate() {
            *slot = base[i & 255];
        }
        Self { values }
    }

    fn at(&self, index: usize) -> usize {
        self.values[index & 511] as usize
    }
}

impl NoiseHasher for PermutationTable {
    /// Chains lattice coordinates through the table, one lookup per axis.
    fn hash(&self, to_hash: &[isize]) -> usize {
        to_hash
            .iter()
            .fold(0, |acc, &coord| self.at(acc + (coord & 255) as usize))
    }
}

/// 2D gradient noise over the seeded table, roughly in [-1, 1].
pub fn perlin_2d(perm: &PermutationTable, x: f64, y: f64) -> f64 {
    perlin::perlin_2d([x, y].into(), perm)
}

/// Configuration for multi-octave sampling.
#[derive(Debug, Clone)]
pub struct NoiseConfig {
    pub octaves: u32,
    /// Base frequency (scale) of the first octave.
    pub frequency: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            octaves: 4,
            frequency: 1.0 / 48.0,
        }
    }
}

/// Fractal sum of [`perlin_2d`] with halving amplitude and doubling frequency
/// per octave, normalized back to roughly [-1, 1].
pub fn fbm_2d(perm: &PermutationTable, config: &NoiseConfig, x: f64, y: f64) -> f64 {
    let mut value = 0.0;
    let mut amplitude = 1.0;
    let mut frequency = config.frequency;
    let mut max_value = 0.0;

    for _ in 0..config.octaves {
        value += perlin_2d(perm, x * frequency, y * frequency) * amplitude;
        max_value += amplitude;
        amplitude *= 0.5;
        frequency *= 2.0;
    }

    if max_value == 0.0 {
        0.0
    } else {
        value / max_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutation_is_a_permutation() {
        let perm = PermutationTable::new(42);
        let mut seen = [false; 256];
        for i in 0..256 {
            seen[perm.at(i)] = true;
        }
        assert!(seen.iter().all(|s| *s));
        for i in 0..256 {
            assert_eq!(perm.at(i), perm.at(i + 256));
        }
    }

    #[test]
    fn test_same_seed_same_table() {
        let a = PermutationTable::new(7);
        let b = PermutationTable::new(7);
        assert_eq!(a.values, b.values);
    }

    #[test]
    fn test_different_seed_different_table() {
        let a = PermutationTable::new(1);
        let b = PermutationTable::new(2);
        assert_ne!(a.values, b.values);
    }

    #[test]
    fn test_noise_is_zero_on_lattice() {
        let perm = PermutationTable::new(3);
        assert_eq!(perlin_2d(&perm, 4.0, -9.0), 0.0);
    }

    #[test]
    fn test_hash_depends_on_every_axis() {
        let perm = PermutationTable::new(5);
        let base = perm.hash(&[3, 9]);
        assert_eq!(base, perm.hash(&[3, 9]));
        assert_eq!(base, perm.hash(&[3 + 256, 9 - 256]));
        assert!((0..256).any(|x| perm.hash(&[x, 9]) != base));
        assert!((0..256).any(|y| perm.hash(&[3, y]) != base));
    }

    #[test]
    fn test_noise_is_deterministic() {
        let a = PermutationTable::new(21);
        let b = PermutationTable::new(21);
        for i in 0..64 {
            let (x, y) = (i as f64 * 0.37, i as f64 * -0.91);
            assert_eq!(perlin_2d(&a, x, y), perlin_2d(&b, x, y));
        }
    }

    #[test]
    fn test_fbm_range() {
        let perm = PermutationTable::new(99);
        let config = NoiseConfig::default();
        for i in -50..50 {
            let v = fbm_2d(&perm, &config, i as f64 * 3.7, i as f64 * -1.3);
            assert!((-1.0..=1.0).contains(&v), "out of range: {v}");
        }
    }
}
