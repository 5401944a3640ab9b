//! Combiner counters.
//!
//! Counters are bumped by group leaders. Records bound for the external tier
//! are counted before they are pushed, so another group can never finish a
//! record that is not yet counted. Completion counters are read before
//! creation counters in [`CombinerStats::in_flight`]; with release increments
//! and acquire loads the difference never looks smaller than it is.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live combiner counters.
#[derive(Debug, Default)]
pub struct CombinerStats {
    local_enqueued: AtomicU64,
    external_enqueued: AtomicU64,
    spilled: AtomicU64,
    overflowed: AtomicU64,
    dropped: AtomicU64,
    local_batches: AtomicU64,
    external_batches: AtomicU64,
    residual_batches: AtomicU64,
    finished: AtomicU64,
    drained: AtomicU64,
    lost: AtomicU64,
    discarded: AtomicU64,
}

/// A point-in-time copy of [`CombinerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Records stored in a local chain.
    pub local_enqueued: u64,
    /// Records stored in the external tier by producers or the host.
    pub external_enqueued: u64,
    /// Records routed straight to the external tier by the spill roll.
    pub spilled: u64,
    /// Records the local chain refused that then went external.
    pub overflowed: u64,
    /// Records neither tier accepted.
    pub dropped: u64,
    /// Batches taken from a local chain above the high fill threshold.
    pub local_batches: u64,
    /// Batches taken from the external tier.
    pub external_batches: u64,
    /// Batches taken from a local chain below the high fill threshold.
    pub residual_batches: u64,
    /// Records whose batch was finished.
    pub finished: u64,
    /// Local records moved to the external tier at worker end.
    pub drained: u64,
    /// Local records the external tier refused at worker end.
    pub lost: u64,
    /// Local records thrown away at worker end.
    pub discarded: u64,
}

impl StatsSnapshot {
    /// Records stored but not yet finished or given up.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        (self.local_enqueued + self.external_enqueued)
            .saturating_sub(self.finished + self.lost + self.discarded)
    }
}

pub(crate) enum Counter {
    LocalEnqueued,
    ExternalEnqueued,
    Spilled,
    Overflowed,
    Dropped,
    LocalBatches,
    ExternalBatches,
    ResidualBatches,
    Finished,
    Drained,
    Lost,
    Discarded,
}

impl CombinerStats {
    fn cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::LocalEnqueued => &self.local_enqueued,
            Counter::ExternalEnqueued => &self.external_enqueued,
            Counter::Spilled => &self.spilled,
            Counter::Overflowed => &self.overflowed,
            Counter::Dropped => &self.dropped,
            Counter::LocalBatches => &self.local_batches,
            Counter::ExternalBatches => &self.external_batches,
            Counter::ResidualBatches => &self.residual_batches,
            Counter::Finished => &self.finished,
            Counter::Drained => &self.drained,
            Counter::Lost => &self.lost,
            Counter::Discarded => &self.discarded,
        }
    }

    pub(crate) fn add(&self, counter: Counter, n: u32) {
        if n > 0 {
            self.cell(counter)
                .fetch_add(u64::from(n), Ordering::Release);
        }
    }

    pub(crate) fn sub(&self, counter: Counter, n: u32) {
        if n > 0 {
            self.cell(counter)
                .fetch_sub(u64::from(n), Ordering::Release);
        }
    }

    /// Records stored but not yet finished or given up.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        let done = self.finished.load(Ordering::Acquire)
            + self.lost.load(Ordering::Acquire)
            + self.discarded.load(Ordering::Acquire);
        let stored = self.local_enqueued.load(Ordering::Acquire)
            + self.external_enqueued.load(Ordering::Acquire);
        stored.saturating_sub(done)
    }

    /// Copies every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |cell: &AtomicU64| cell.load(Ordering::Acquire);
        StatsSnapshot {
            finished: load(&self.finished),
            lost: load(&self.lost),
            discarded: load(&self.discarded),
            local_enqueued: load(&self.local_enqueued),
            external_enqueued: load(&self.external_enqueued),
            spilled: load(&self.spilled),
            overflowed: load(&self.overflowed),
            dropped: load(&self.dropped),
            local_batches: load(&self.local_batches),
            external_batches: load(&self.external_batches),
            residual_batches: load(&self.residual_batches),
            drained: load(&self.drained),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_accounting() {
        let stats = CombinerStats::default();
        stats.add(Counter::LocalEnqueued, 10);
        stats.add(Counter::ExternalEnqueued, 5);
        stats.add(Counter::Finished, 8);
        stats.add(Counter::Discarded, 2);
        assert_eq!(stats.in_flight(), 5);
        stats.add(Counter::Lost, 1);
        let snap = stats.snapshot();
        assert_eq!(snap.in_flight(), 4);
        assert_eq!(snap.local_enqueued, 10);
        assert_eq!(snap.lost, 1);
    }
}
