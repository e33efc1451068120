//! Per-worker scratch state: each worker thread owns one `WorkerLocal`, seeded once at
//! startup and never shared, mirroring the search engine's per-thread RNG/scratch bundle.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// State private to one worker thread.
pub struct WorkerLocal {
    pub tid: usize,
    pub rng: Xoshiro256PlusPlus,
    /// Consecutive empty `run_next` sweeps, driving the idle backoff ladder.
    pub idle_streak: u32,
}

impl WorkerLocal {
    /// Seed deterministically from the process-wide seed and this worker's id, so a
    /// fixed `base_seed` reproduces the same per-worker RNG streams across runs.
    pub fn new(tid: usize, base_seed: u64) -> Self {
        let expanded = seed128_from_base(base_seed, tid as u64);
        WorkerLocal {
            tid,
            rng: Xoshiro256PlusPlus::seed_from_u64(expanded),
            idle_streak: 0,
        }
    }

    /// Uniform integer in `[0, bound)`. Returns 0 if `bound == 0`.
    pub fn uniform(&mut self, bound: usize) -> usize {
        if bound == 0 {
            0
        } else {
            self.rng.random_range(0..bound)
        }
    }

    pub fn on_idle(&mut self) {
        self.idle_streak = self.idle_streak.saturating_add(1);
    }

    pub fn on_busy(&mut self) {
        self.idle_streak = 0;
    }
}

/// SplitMix64-style expansion of a 64-bit base seed and a worker index into one 64-bit
/// seed, so each worker's stream is independent even though they all derive from one
/// configured `base_seed`.
fn seed128_from_base(base: u64, tid: u64) -> u64 {
    let mut z = base.wrapping_add(tid.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(1));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
