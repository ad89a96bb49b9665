//! Seedable random number generator.
//!
//! The seed source of last resort when the operating system CSPRNG is
//! unavailable. With a seed, every value is deterministic.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Fills buffers from a seeded `StdRng`, or from the thread-local generator
/// when unseeded.
pub struct SeededRng {
    inner: Option<StdRng>,
}

impl SeededRng {
    pub fn new(seed: Option<u64>) -> Self {
        let inner = seed.map(StdRng::seed_from_u64);
        Self { inner }
    }

    /// A generator seeded from the wall clock and the process id.
    ///
    /// Predictable to anyone who can guess both. Only for when nothing better exists.
    pub fn from_clock() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let seed = nanos ^ ((std::process::id() as u64) << 32);
        Self::new(Some(seed))
    }

    pub fn fill(&mut self, dest: &mut [u8]) {
        match self.inner.as_mut() {
            Some(rng) => rng.fill_bytes(dest),
            None => rand::thread_rng().fill_bytes(dest),
        }
    }
}

impl std::fmt::Debug for SeededRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let is_seeded = self.inner.is_some();
        f.debug_struct("SeededRng")
            .field("seeded", &is_seeded)
            .finish()
    }
}
