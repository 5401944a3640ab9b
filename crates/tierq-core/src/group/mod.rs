//! Cooperative worker groups.
//!
//! A worker group is a fixed set of lanes that execute the same code and meet
//! at collectives. Every lane of a group must call the same sequence of
//! collectives; a lane that skips one deadlocks the group.
//!
//! - [`thread`] - A group realised as one OS thread per lane
//! - [`solo`] - The single-lane group
//! - [`chance`] - Random sources for group-uniform decisions

pub mod chance;
pub mod solo;
pub mod thread;

pub use chance::{ChanceSource, FixedChance, SeededChance, group_roll};
pub use solo::SoloLane;
pub use thread::{GroupLane, ThreadGroup};

/// Largest supported group width (one ballot bit per lane).
pub const MAX_WIDTH: u32 = 64;

/// Value lanes broadcast to say "nothing".
pub const NONE: u32 = u32::MAX;

/// One lane's view of its worker group.
pub trait Lane {
    /// Index of this lane, `0..width`.
    fn id(&self) -> u32;

    /// Number of lanes in the group.
    fn width(&self) -> u32;

    /// Blocks until every lane of the group arrives.
    fn barrier(&self);

    /// Returns a mask with bit `i` set iff lane `i` passed `true`.
    fn ballot(&self, predicate: bool) -> u64;

    /// Returns the `value` passed by lane `src` to every lane.
    fn broadcast(&self, value: u32, src: u32) -> u32;

    /// Whether this is lane 0.
    #[inline]
    fn is_leader(&self) -> bool {
        self.id() == 0
    }

    /// Number of lanes in `mask` below this one.
    #[inline]
    fn rank_in(&self, mask: u64) -> u32 {
        rank_below(mask, self.id())
    }
}

/// Number of bits of `mask` below bit `lane`.
#[inline]
#[must_use]
pub const fn rank_below(mask: u64, lane: u32) -> u32 {
    let below = if lane >= 64 { u64::MAX } else { (1u64 << lane) - 1 };
    (mask & below).count_ones()
}

/// Lane index of the `n`-th set bit of `mask`, counting from zero.
///
/// Returns [`NONE`] when `mask` has `n` or fewer bits set.
#[must_use]
pub const fn nth_lane(mask: u64, n: u32) -> u32 {
    let mut rest = mask;
    let mut i = 0;
    while i < n {
        rest &= rest.wrapping_sub(1);
        i += 1;
    }
    if rest == 0 {
        NONE
    } else {
        rest.trailing_zeros()
    }
}
