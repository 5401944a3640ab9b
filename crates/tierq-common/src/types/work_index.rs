//! Tier-tagged work indices.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which queue tier a batch was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// The group-local staging chain.
    Local,
    /// The external (global) queue.
    External,
}

/// Opaque index returned with a dequeued batch.
///
/// Bit 31 marks batches that came from the external tier, so the closing
/// half of a two-phase read can be routed back to the right tier. The low 31
/// bits carry the tier's own index (the start slot for local batches).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkIndex(u32);

impl WorkIndex {
    /// Reserved tier bit.
    pub const EXTERNAL_BIT: u32 = 1 << 31;

    /// Largest index either tier may store.
    pub const MAX_INDEX: u32 = Self::EXTERNAL_BIT - 1;

    /// Tags a local-tier index.
    #[must_use]
    pub const fn local(index: u32) -> Self {
        Self(index & Self::MAX_INDEX)
    }

    /// Tags an external-tier index.
    #[must_use]
    pub const fn external(index: u32) -> Self {
        Self((index & Self::MAX_INDEX) | Self::EXTERNAL_BIT)
    }

    /// Returns the tier this index belongs to.
    #[must_use]
    pub const fn tier(self) -> Tier {
        if self.0 & Self::EXTERNAL_BIT != 0 {
            Tier::External
        } else {
            Tier::Local
        }
    }

    /// Returns the index with the tier bit stripped.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 & Self::MAX_INDEX
    }

    /// Returns the raw tagged value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for WorkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkIndex({:?}, {})", self.tier(), self.index())
    }
}
