//! Per-worker congruential random number generator.
//!
//! Heap selection must be cheap and uniform in `[0, heap_p)`. A 48-bit LCG
//! provides the draws; modulo bias is removed by rejecting raw draws above a
//! precomputed threshold.

use rand::RngCore;

const RND_MULTIPLIER: u64 = 0x5DEECE66D;
const RND_ADDEND: u64 = 0xB;
const RND_MASK: u64 = (1 << 48) - 1;

/// Output range of a single draw (the high 32 bits of the 48-bit state).
const RND_RANGE: u64 = 1 << 32;

pub struct Cong {
    seed: u64,
}

impl Cong {
    pub const fn new(seed: u64) -> Self {
        Self {
            seed: seed & RND_MASK,
        }
    }

    pub fn seeded() -> Self {
        Self::new(rand::rng().next_u64())
    }

    /// True until [`reseed`](Self::reseed) or a nonzero-seed construction.
    pub fn is_unseeded(&self) -> bool {
        self.seed == 0
    }

    pub fn reseed(&mut self) {
        self.seed = rand::rng().next_u64() & RND_MASK;
    }

    #[inline]
    fn next(&mut self) -> u64 {
        self.seed = self
            .seed
            .wrapping_mul(RND_MULTIPLIER)
            .wrapping_add(RND_ADDEND)
            & RND_MASK;
        self.seed >> 16
    }

    /// Uniform draw in `[0, max)`. `unbias` must come from
    /// [`unbias_threshold`] for the same `max`.
    #[inline]
    pub fn next_below(&mut self, max: u64, unbias: u64) -> u64 {
        loop {
            let r = self.next();
            if r <= unbias {
                return r % max;
            }
        }
    }
}

/// Largest raw draw for which `raw % max` stays uniform.
pub fn unbias_threshold(max: u64) -> u64 {
    debug_assert!(max > 0 && max < RND_RANGE);
    RND_RANGE - (RND_RANGE % max) - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_stay_in_range() {
        let mut rng = Cong::new(0x1234_5678_9abc);
        let max = 13;
        let unbias = unbias_threshold(max);
        for _ in 0..10_000 {
            assert!(rng.next_below(max, unbias) < max);
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Cong::new(42);
        let mut b = Cong::new(42);
        let unbias = unbias_threshold(97);
        for _ in 0..100 {
            assert_eq!(a.next_below(97, unbias), b.next_below(97, unbias));
        }
    }

    #[test]
    fn every_bucket_reachable() {
        let mut rng = Cong::seeded();
        let max = 8;
        let unbias = unbias_threshold(max);
        let mut seen = [false; 8];
        for _ in 0..100_000 {
            seen[rng.next_below(max, unbias) as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn unbias_threshold_is_a_multiple_boundary() {
        for max in [2u64, 3, 7, 32, 129, 1000] {
            let t = unbias_threshold(max);
            assert_eq!((t + 1) % max, 0);
            assert!(t < 1 << 32);
        }
    }
}
