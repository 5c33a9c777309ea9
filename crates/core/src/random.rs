use labwired_utest_config::{RngConfig, RngKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const RAND_MAX: i32 = i32::MAX;

/// `srand` / `rand` pair exposed to the harness.
pub trait RandomSource {
    fn seed(&mut self, seed: u32);
    fn next(&mut self) -> i32;
}

/// Ignores the seed and always yields 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedRandom;

impl RandomSource for FixedRandom {
    fn seed(&mut self, _seed: u32) {}

    fn next(&mut self) -> i32 {
        1
    }
}

#[derive(Debug, Clone)]
pub struct SeededRandom {
    rng: StdRng,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomSource for SeededRandom {
    fn seed(&mut self, seed: u32) {
        self.rng = StdRng::seed_from_u64(seed as u64);
    }

    fn next(&mut self) -> i32 {
        self.rng.gen_range(0..=RAND_MAX)
    }
}

pub fn from_config(config: &RngConfig) -> Box<dyn RandomSource> {
    match config.kind {
        RngKind::Fixed => Box::new(FixedRandom),
        RngKind::Seeded => Box::new(SeededRandom::new(config.seed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_random() {
        let mut rng = FixedRandom;
        rng.seed(1234);
        assert_eq!(rng.next(), 1);
        assert_eq!(rng.next(), 1);
    }

    #[test]
    fn test_reseeding_repeats_sequence() {
        let mut rng = SeededRandom::new(0);
        rng.seed(7);
        let first: Vec<i32> = (0..8).map(|_| rng.next()).collect();
        rng.seed(7);
        let second: Vec<i32> = (0..8).map(|_| rng.next()).collect();
        assert_eq!(first, second);
        assert!(first.iter().all(|&v| v >= 0));
    }
}
