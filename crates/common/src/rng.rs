//! Randomness capability
//!
//! Address blocks and account codes both need a cryptographically secure
//! source; the trait keeps it injectable so tests can run deterministically.

use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, SeedableRng};

/// Uniform random values from a cryptographically secure source.
pub trait RandomSource: Send + Sync {
    /// Uniform value in `[0, upper)`. `upper` must be non-zero.
    fn below(&self, upper: u64) -> u64;
}

/// OS entropy; the production source.
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn below(&self, upper: u64) -> u64 {
        OsRng.gen_range(0..upper)
    }
}

/// Seeded source for deterministic tests.
pub struct SeededRandom {
    inner: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn below(&self, upper: u64) -> u64 {
        self.inner.lock().gen_range(0..upper)
    }
}

/// Account-code alphabet: 28 symbols, skipping lookalikes (0/O, 1/I) and
/// vowels that could spell words.
pub const CODE_ALPHABET: &[u8] = b"23456789BCDFGHJKLMNPQRSTVWXZ";

/// Account codes are always this long.
pub const CODE_LEN: usize = 15;

/// Generate a fresh account code, e.g. `L7V2BCMM3PRKVF2`.
pub fn generate_code(rng: &dyn RandomSource) -> String {
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.below(CODE_ALPHABET.len() as u64) as usize] as char)
        .collect()
}
