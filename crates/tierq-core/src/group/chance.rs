//! Random sources for group-uniform decisions.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::Lane;

/// A source of percentage rolls.
pub trait ChanceSource: Send + Sync {
    /// Returns `true` with probability `percent`/100. Values of 100 or more
    /// always hit, 0 never does.
    fn roll(&self, percent: u32) -> bool;
}

/// Rolls once on lane 0 and hands the outcome to every lane.
pub fn group_roll<L: Lane + ?Sized>(lane: &L, source: &dyn ChanceSource, percent: u32) -> bool {
    let hit = lane.is_leader() && source.roll(percent);
    lane.broadcast(u32::from(hit), 0) != 0
}

/// A reproducible ChaCha-backed source.
#[derive(Debug)]
pub struct SeededChance {
    rng: Mutex<ChaCha8Rng>,
}

impl SeededChance {
    /// Creates a source from `seed`.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }
}

impl ChanceSource for SeededChance {
    fn roll(&self, percent: u32) -> bool {
        match percent {
            0 => false,
            p if p >= 100 => true,
            p => self.rng.lock().gen_range(0..100) < p,
        }
    }
}

/// A source that always answers the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedChance(pub bool);

impl ChanceSource for FixedChance {
    fn roll(&self, _percent: u32) -> bool {
        self.0
    }
}
