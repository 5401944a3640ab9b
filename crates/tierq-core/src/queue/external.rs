//! The external tier interface.
//!
//! The external tier is slower and larger than a group's staging chain and
//! is shared by every group. Records cross this interface as raw words so an
//! implementation need not know the payload types. Methods taking a lane are
//! collective over the calling group.

use serde::{Deserialize, Serialize};
use tierq_common::memory::SharedRegion;
use tierq_common::types::TaskTypeId;

use super::Dequeued;
use super::staging::GroupEnqueue;
use crate::group::{Lane, nth_lane};

/// Batch limit for one task type, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCap {
    /// Task type.
    pub type_id: TaskTypeId,
    /// Words per record.
    pub record_words: u32,
    /// Most records the caller can take at once; zero skips the type.
    pub max: u32,
}

/// Diagnostic counters of an external tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalStats {
    /// Records accepted.
    pub enqueued: u64,
    /// Records refused.
    pub rejected: u64,
    /// Records handed out.
    pub dequeued: u64,
    /// Non-empty batches handed out.
    pub batches: u64,
    /// Records whose two-phase read was closed.
    pub finished: u64,
}

/// A queue tier shared by all worker groups.
pub trait ExternalQueue: Send + Sync {
    /// Group-shared bytes the tier needs per group.
    const REQUIRED_SHARED: u32 = 0;

    /// Whether a group may re-run `worker_start` on state it already set up.
    const SUPPORTS_REUSE_INIT: bool = false;

    /// Threads `global_maintain` needs; zero if it has no work.
    const GLOBAL_MAINTAIN_MIN_THREADS: u32 = 0;

    /// Shared bytes `global_maintain` needs when run with `threads` threads.
    fn global_maintain_shared_memory(threads: u32) -> u32 {
        let _ = threads;
        0
    }

    /// Device-wide maintenance between launches.
    fn global_maintain(&self) {}

    /// Per-group setup.
    fn worker_start<L: Lane + ?Sized>(&self, lane: &L) {
        let _ = lane;
    }

    /// Per-iteration maintenance.
    fn worker_maintain<L: Lane + ?Sized>(&self, lane: &L) {
        let _ = lane;
    }

    /// Single-lane enqueue of one record. Returns `false` if refused.
    fn enqueue(&self, type_id: TaskTypeId, record: &[u32]) -> bool;

    /// Collective enqueue where each lane may offer a record.
    ///
    /// The default places records one at a time through
    /// [`enqueue`](Self::enqueue), the lane owning each record pushing it.
    fn enqueue_group<L: Lane + ?Sized>(
        &self,
        lane: &L,
        type_id: TaskTypeId,
        record: Option<&[u32]>,
        lanes_per_record: u32,
    ) -> GroupEnqueue {
        let lpr = lanes_per_record.max(1);
        let mask = lane.ballot(record.is_some());
        let requested = mask.count_ones() / lpr;
        let mine = lane.rank_in(mask) / lpr;
        let mut outcome = GroupEnqueue {
            requested,
            ..GroupEnqueue::default()
        };
        for r in 0..requested {
            let owner = nth_lane(mask, r * lpr);
            let stored = match record {
                Some(words) if lane.id() == owner => self.enqueue(type_id, words),
                _ => false,
            };
            if lane.broadcast(u32::from(stored), owner) != 0 {
                outcome.granted += 1;
                outcome.placed |= record.is_some() && mine == r;
            }
        }
        outcome
    }

    /// Collective dequeue of one batch of the first type in `caps` that has
    /// records, written to `out` from word 0.
    fn dequeue<L: Lane + ?Sized>(
        &self,
        lane: &L,
        caps: &[BatchCap],
        out: &SharedRegion,
    ) -> Option<Dequeued>;

    /// Collective dequeue of up to `cap.max` records of one type.
    fn dequeue_selected<L: Lane + ?Sized>(&self, lane: &L, cap: &BatchCap, out: &SharedRegion)
    -> u32;

    /// Opens a two-phase read of one type.
    fn start_read<L: Lane + ?Sized>(&self, lane: &L, cap: &BatchCap, out: &SharedRegion) -> u32;

    /// Opens a two-phase read of the first type in `caps` that has records.
    fn dequeue_start_read<L: Lane + ?Sized>(
        &self,
        lane: &L,
        caps: &[BatchCap],
        out: &SharedRegion,
    ) -> Option<Dequeued>;

    /// Closes a two-phase read of `count` records.
    fn finish_read<L: Lane + ?Sized>(&self, lane: &L, type_id: TaskTypeId, count: u32);

    /// Records currently queued for `type_id`.
    fn num_entries(&self, type_id: TaskTypeId) -> usize;

    /// Snapshot of the diagnostic counters.
    fn record(&self) -> ExternalStats;

    /// Clears the diagnostic counters.
    fn reset(&self);
}
