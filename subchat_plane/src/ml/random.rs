use std::sync::{Arc, Mutex};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::ml::NodeValue;

pub trait RNG {
    /// returns a sample from the uniform distribution over `[0, 1)`
    fn rand(&self) -> NodeValue;
}

#[derive(Clone)]
pub struct RngStrategy {
    source: Arc<dyn RNG + Send + Sync>,
    seed: Option<u32>,
}

impl Default for RngStrategy {
    fn default() -> Self {
        Self {
            source: Arc::new(EntropyRng::default()),
            seed: None,
        }
    }
}

impl RngStrategy {
    pub fn testable(seed: u32) -> Self {
        Self {
            source: Arc::new(SeedableTestRng::new(seed)),
            seed: Some(seed),
        }
    }

    pub fn from_seed(seed: Option<u32>) -> Self {
        seed.map(Self::testable).unwrap_or_default()
    }

    /// Returns `true` if the rng strategy replays a fixed seed.
    #[must_use]
    pub fn is_debug(&self) -> bool {
        self.seed.is_some()
    }
}

impl RNG for RngStrategy {
    fn rand(&self) -> NodeValue {
        self.source.rand()
    }
}

impl std::fmt::Debug for RngStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.seed {
            Some(seed) => f.debug_struct("Debug").field("seed", &seed).finish(),
            None => write!(f, "Default"),
        }
    }
}

pub struct EntropyRng(Mutex<StdRng>);

impl Default for EntropyRng {
    fn default() -> Self {
        Self(Mutex::new(StdRng::from_entropy()))
    }
}

impl RNG for EntropyRng {
    fn rand(&self) -> NodeValue {
        let mut rng = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen::<NodeValue>()
    }
}

pub struct SeedableTestRng(Mutex<algo::MersenneTwister>);

impl SeedableTestRng {
    pub fn new(seed: u32) -> Self {
        Self(Mutex::new(algo::MersenneTwister::new(seed)))
    }
}

impl RNG for SeedableTestRng {
    fn rand(&self) -> NodeValue {
        let sample = {
            let mut inner = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.next_u32()
        };
        algo::to_unit_interval(sample)
    }
}

mod algo {
    const STATE_LEN: usize = 624;
    const SHIFT_LEN: usize = 397;

    use crate::ml::NodeValue;

    const UNIT_INTERVAL_MULTIPLIER: f64 = 1.0 / (u32::MAX as f64 + 1.0);

    /// Maps a sample onto `[0, 1)`, clamping values the narrowing cast rounds up to one.
    pub fn to_unit_interval(sample: u32) -> NodeValue {
        let value = (sample as f64 * UNIT_INTERVAL_MULTIPLIER) as NodeValue;
        value.min(1.0 - NodeValue::EPSILON / 2.0)
    }

    pub struct MersenneTwister {
        state: [u32; STATE_LEN],
        index: usize,
    }

    impl MersenneTwister {
        pub fn new(seed: u32) -> Self {
            let mut state = [0; STATE_LEN];
            state[0] = seed;
            for i in 1..STATE_LEN {
                let prev = state[i - 1];
                state[i] = 0x6c07_8965_u32
                    .wrapping_mul(prev ^ (prev >> 30))
                    .wrapping_add(i as u32);
            }
            Self {
                state,
                index: STATE_LEN,
            }
        }

        pub fn next_u32(&mut self) -> u32 {
            if self.index >= STATE_LEN {
                self.twist();
            }
            let mut y = self.state[self.index];
            y ^= y >> 11;
            y ^= (y << 7) & 0x9d2c_5680;
            y ^= (y << 15) & 0xefc6_0000;
            y ^= y >> 18;
            self.index += 1;
            y
        }

        fn twist(&mut self) {
            const MATRIX_A: u32 = 0x9908_b0df;
            const UPPER_MASK: u32 = 0x8000_0000;
            const LOWER_MASK: u32 = 0x7fff_ffff;
            for i in 0..STATE_LEN {
                let x = (self.state[i] & UPPER_MASK)
                    .wrapping_add(self.state[(i + 1) % STATE_LEN] & LOWER_MASK);
                let mut x_a = x >> 1;
                if x % 2 != 0 {
                    x_a ^= MATRIX_A;
                }
                self.state[i] = self.state[(i + SHIFT_LEN) % STATE_LEN] ^ x_a;
            }
            self.index = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_rng_strategy_replays_same_samples() {
        let rng_1 = RngStrategy::testable(1234);
        let rng_2 = RngStrategy::testable(1234);

        let samples_1: Vec<_> = (0..32).map(|_| rng_1.rand()).collect();
        let samples_2: Vec<_> = (0..32).map(|_| rng_2.rand()).collect();

        assert_eq!(samples_1, samples_2);
        assert!(rng_1.is_debug());
        assert!(!RngStrategy::default().is_debug());
    }

    #[test]
    fn cloned_rng_strategy_shares_sample_stream() {
        let rng = RngStrategy::testable(42);
        let cloned = rng.clone();

        let first = rng.rand();
        let second = cloned.rand();

        assert_ne!(first, second);
    }

    #[test]
    fn unit_interval_excludes_one() {
        assert_eq!(algo::to_unit_interval(0), 0.0);
        assert!(algo::to_unit_interval(u32::MAX) < 1.0);
        assert!(algo::to_unit_interval(u32::MAX - 1) < 1.0);
        assert!(algo::to_unit_interval(u32::MAX) > 0.99);
    }

    #[test]
    fn seedable_test_rng_samples_uniformly() {
        let rng = SeedableTestRng::new(6);
        assert_rng(&rng);
    }

    #[test]
    fn entropy_rng_samples_uniformly() {
        let rng = EntropyRng::default();
        assert_rng(&rng);
    }

    fn assert_rng(rng: &dyn RNG) {
        let mut buckets = vec![0; 13];
        let span = 1.0 / buckets.len() as NodeValue;

        let iters = 10_000;
        for _ in 0..iters {
            let rand = rng.rand();
            assert!((0.0..1.0).contains(&rand), "sample out of range: {rand}");
            let last = buckets.len() - 1;
            let bucket_idx = (rand / span) as usize;
            buckets[bucket_idx.min(last)] += 1;
        }

        let min_expected = iters / (buckets.len() + 1);
        for (i, bucket) in buckets.iter().enumerate() {
            assert!(
                *bucket > min_expected,
                "bucket[{i}] distribution is not even {:?}",
                buckets
            )
        }
    }
}
