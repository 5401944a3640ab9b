//! Reference external tier: one bounded lock-free queue per task type.
//!
//! Two-phase reads pop their records at the start, so closing a read only
//! updates counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use tierq_common::memory::{RecordWords, SharedRegion};
use tierq_common::types::TaskTypeId;
use tierq_common::utils::hash::{FastHashMap, map_with_capacity};

use super::Dequeued;
use super::external::{BatchCap, ExternalQueue, ExternalStats};
use crate::group::{Lane, NONE};
use crate::task::TaskRegistry;

struct TypeQueue {
    record_words: u32,
    queue: ArrayQueue<RecordWords>,
}

#[derive(Default)]
struct Counters {
    enqueued: CachePadded<AtomicU64>,
    rejected: CachePadded<AtomicU64>,
    dequeued: CachePadded<AtomicU64>,
    batches: CachePadded<AtomicU64>,
    finished: CachePadded<AtomicU64>,
}

/// A global queue shared by every group.
pub struct GlobalQueue {
    queues: Vec<TypeQueue>,
    index: FastHashMap<TaskTypeId, usize>,
    counters: Counters,
}

impl GlobalQueue {
    /// Creates one queue of `capacity` records (at least one) for every
    /// registered type.
    #[must_use]
    pub fn new(registry: &TaskRegistry, capacity: usize) -> Self {
        let mut index = map_with_capacity(registry.len());
        let queues = registry
            .iter()
            .enumerate()
            .map(|(pos, desc)| {
                index.insert(desc.id, pos);
                TypeQueue {
                    record_words: desc.record_words(),
                    queue: ArrayQueue::new(capacity.max(1)),
                }
            })
            .collect();
        Self {
            queues,
            index,
            counters: Counters::default(),
        }
    }

    /// Capacity in records for `type_id`.
    #[must_use]
    pub fn capacity(&self, type_id: TaskTypeId) -> Option<usize> {
        self.queue(type_id).map(|q| q.queue.capacity())
    }

    /// Records queued across all types.
    #[must_use]
    pub fn total_entries(&self) -> usize {
        self.queues.iter().map(|q| q.queue.len()).sum()
    }

    fn queue(&self, type_id: TaskTypeId) -> Option<&TypeQueue> {
        self.index.get(&type_id).map(|&pos| &self.queues[pos])
    }

    /// Pops up to `cap.max` records into `out`. Single lane.
    fn pop_into(&self, cap: &BatchCap, out: &SharedRegion) -> u32 {
        let Some(queue) = self.queue(cap.type_id) else {
            return 0;
        };
        debug_assert_eq!(queue.record_words, cap.record_words);
        debug_assert!(cap.max * cap.record_words <= out.len_words());
        let mut taken = 0;
        while taken < cap.max {
            let Some(words) = queue.queue.pop() else {
                break;
            };
            out.write_record_part(taken * queue.record_words, &words, 0, 1);
            taken += 1;
        }
        if taken > 0 {
            self.counters
                .dequeued
                .fetch_add(u64::from(taken), Ordering::Relaxed);
            self.counters.batches.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    fn pop_any(&self, caps: &[BatchCap], out: &SharedRegion) -> Option<(usize, u32)> {
        caps.iter()
            .enumerate()
            .filter(|(_, cap)| cap.max > 0)
            .find_map(|(i, cap)| {
                let taken = self.pop_into(cap, out);
                (taken > 0).then_some((i, taken))
            })
    }
}

impl std::fmt::Debug for GlobalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalQueue")
            .field("types", &self.queues.len())
            .field("entries", &self.total_entries())
            .finish()
    }
}

impl ExternalQueue for GlobalQueue {
    // Groups keep no state of their own in the tier.
    const SUPPORTS_REUSE_INIT: bool = true;

    fn enqueue(&self, type_id: TaskTypeId, record: &[u32]) -> bool {
        let stored = self.queue(type_id).is_some_and(|queue| {
            debug_assert_eq!(record.len(), queue.record_words as usize);
            queue.queue.push(RecordWords::from_slice(record)).is_ok()
        });
        let counter = if stored {
            &self.counters.enqueued
        } else {
            &self.counters.rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
        stored
    }

    fn dequeue<L: Lane + ?Sized>(
        &self,
        lane: &L,
        caps: &[BatchCap],
        out: &SharedRegion,
    ) -> Option<Dequeued> {
        let (which, count) = if lane.is_leader() {
            self.pop_any(caps, out)
                .map_or((NONE, 0), |(i, n)| (i as u32, n))
        } else {
            (NONE, 0)
        };
        let which = lane.broadcast(which, 0);
        if which == NONE {
            return None;
        }
        let count = lane.broadcast(count, 0);
        Some(Dequeued {
            type_id: caps[which as usize].type_id,
            count,
        })
    }

    fn dequeue_selected<L: Lane + ?Sized>(
        &self,
        lane: &L,
        cap: &BatchCap,
        out: &SharedRegion,
    ) -> u32 {
        let taken = if lane.is_leader() {
            self.pop_into(cap, out)
        } else {
            0
        };
        lane.broadcast(taken, 0)
    }

    fn start_read<L: Lane + ?Sized>(&self, lane: &L, cap: &BatchCap, out: &SharedRegion) -> u32 {
        self.dequeue_selected(lane, cap, out)
    }

    fn dequeue_start_read<L: Lane + ?Sized>(
        &self,
        lane: &L,
        caps: &[BatchCap],
        out: &SharedRegion,
    ) -> Option<Dequeued> {
        self.dequeue(lane, caps, out)
    }

    fn finish_read<L: Lane + ?Sized>(&self, lane: &L, _type_id: TaskTypeId, count: u32) {
        if lane.is_leader() {
            self.counters
                .finished
                .fetch_add(u64::from(count), Ordering::Relaxed);
        }
    }

    fn num_entries(&self, type_id: TaskTypeId) -> usize {
        self.queue(type_id).map_or(0, |q| q.queue.len())
    }

    fn record(&self) -> ExternalStats {
        let c = &self.counters;
        ExternalStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            dequeued: c.dequeued.load(Ordering::Relaxed),
            batches: c.batches.load(Ordering::Relaxed),
            finished: c.finished.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.enqueued,
            &c.rejected,
            &c.dequeued,
            &c.batches,
            &c.finished,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
