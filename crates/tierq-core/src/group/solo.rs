//! The single-lane group.

use super::Lane;

/// A group of exactly one lane. Collectives are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloLane;

impl Lane for SoloLane {
    #[inline]
    fn id(&self) -> u32 {
        0
    }

    #[inline]
    fn width(&self) -> u32 {
        1
    }

    #[inline]
    fn barrier(&self) {}

    #[inline]
    fn ballot(&self, predicate: bool) -> u64 {
        u64::from(predicate)
    }

    #[inline]
    fn broadcast(&self, value: u32, _src: u32) -> u32 {
        value
    }
}
