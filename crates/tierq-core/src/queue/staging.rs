//! Fixed-capacity LIFO staging buffer in group-shared memory.
//!
//! Each buffer occupies one [`Placement`] of a [`SharedRegion`]:
//!
//! ```text
//! word 0      1         2          3             4 ..
//!      count  type id   capacity   record words  slot 0 | slot 1 | ...
//! ```
//!
//! Writers reserve slots by atomically adding to `count`; a reservation that
//! overshoots the capacity is given back, so `count` settles at or below the
//! capacity. Dequeues and reads take the newest records (the top of the
//! stack). All collective operations must be called by every lane of the
//! group that owns the region.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use tierq_common::memory::{HEADER_WORDS, Placement, SharedRegion, encode_record};
use tierq_common::types::{TaskTypeId, record_words_of};

use crate::group::{Lane, NONE, nth_lane};

const COUNT: u32 = 0;
const TYPE_ID: u32 = 1;
const CAPACITY: u32 = 2;
const RECORD_WORDS: u32 = 3;

/// How a group places the records of one collective enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueMode {
    /// One reservation for all records of the group.
    #[default]
    Coalesced,
    /// One reservation per record.
    PerRecord,
}

/// Outcome of a collective enqueue, identical on every lane except `placed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupEnqueue {
    /// Whether this lane's record was stored.
    pub placed: bool,
    /// Records the group stored.
    pub granted: u32,
    /// Complete records the group offered.
    pub requested: u32,
}

impl GroupEnqueue {
    /// Records offered but not stored.
    #[must_use]
    pub fn refused(&self) -> u32 {
        self.requested - self.granted
    }
}

/// Records taken by a two-phase read: slots `start..start + take`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadSlice {
    /// First slot of the batch.
    pub start: u32,
    /// Number of records in the batch.
    pub take: u32,
}

impl ReadSlice {
    /// Returns `true` if the slice holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.take == 0
    }
}

/// Header fields as stored in shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    /// Live record count.
    pub count: u32,
    /// Task type stored.
    pub type_id: TaskTypeId,
    /// Capacity in records.
    pub capacity: u32,
    /// Words per record.
    pub record_words: u32,
}

/// A LIFO buffer of fixed-size records.
#[derive(Debug, Clone)]
pub struct StagingBuffer {
    region: Arc<SharedRegion>,
    header: u32,
    records: u32,
    capacity: u32,
    stride: u32,
    type_id: TaskTypeId,
}

impl StagingBuffer {
    /// Binds a buffer to `placement` inside `region`.
    ///
    /// # Panics
    ///
    /// Panics if the placement does not fit inside the region.
    #[must_use]
    pub fn new(region: Arc<SharedRegion>, placement: &Placement) -> Self {
        assert!(
            placement.end() <= region.len_bytes(),
            "placement ends at byte {} but the region holds {}",
            placement.end(),
            region.len_bytes()
        );
        Self {
            header: placement.header_word(),
            records: placement.records_word(),
            capacity: placement.capacity,
            stride: placement.record_words(),
            type_id: placement.type_id,
            region,
        }
    }

    /// Task type stored.
    #[must_use]
    pub fn type_id(&self) -> TaskTypeId {
        self.type_id
    }

    /// Capacity in records.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Words per record.
    #[must_use]
    pub fn record_words(&self) -> u32 {
        self.stride
    }

    /// Current record count.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count_cell().load(Ordering::Acquire).min(self.capacity)
    }

    /// Reads the header back from shared memory.
    #[must_use]
    pub fn header(&self) -> BufferHeader {
        BufferHeader {
            count: self.count(),
            type_id: TaskTypeId::new(self.region.load(self.header + TYPE_ID)),
            capacity: self.region.load(self.header + CAPACITY),
            record_words: self.region.load(self.header + RECORD_WORDS),
        }
    }

    /// Zeroes the buffer and writes its header. Collective.
    pub fn init<L: Lane + ?Sized>(&self, lane: &L) {
        self.region.zero_strided(
            self.header,
            HEADER_WORDS + self.capacity * self.stride,
            lane.id(),
            lane.width(),
        );
        lane.barrier();
        if lane.is_leader() {
            self.write_header();
        }
        lane.barrier();
    }

    /// Writes the header and resets the count. Single-lane; callers
    /// publish it with a barrier.
    pub(crate) fn write_header(&self) {
        self.region.store(self.header + TYPE_ID, self.type_id.as_u32());
        self.region.store(self.header + CAPACITY, self.capacity);
        self.region.store(self.header + RECORD_WORDS, self.stride);
        self.count_cell().store(0, Ordering::Release);
    }

    /// Single-lane push of one record. Returns `false` when full.
    pub fn try_push<T: Pod>(&self, record: &T) -> bool {
        debug_assert_eq!(record_words_of::<T>(), self.stride);
        self.try_push_words(&encode_record(record))
    }

    pub(crate) fn try_push_words(&self, words: &[u32]) -> bool {
        match self.reserve_one() {
            Some(slot) => {
                self.write_words(slot, words, 0, 1);
                true
            }
            None => false,
        }
    }

    /// Collective enqueue of one record offered by the whole group.
    ///
    /// Lane 0 reserves the slot and every lane copies a share of the words.
    /// All lanes return the same result.
    pub fn enqueue<T: Pod, L: Lane + ?Sized>(&self, lane: &L, record: &T) -> bool {
        debug_assert_eq!(record_words_of::<T>(), self.stride);
        let words = encode_record(record);
        let slot = if lane.is_leader() {
            self.reserve_one().unwrap_or(NONE)
        } else {
            0
        };
        let slot = lane.broadcast(slot, 0);
        if slot == NONE {
            return false;
        }
        self.write_words(slot, &words, lane.id(), lane.width());
        lane.barrier();
        true
    }

    /// Collective enqueue where each lane may offer a record.
    ///
    /// With `lanes_per_record > 1`, consecutive requesting lanes form one
    /// record: lanes offer identical payloads and split the copy. An
    /// incomplete trailing set of lanes offers nothing.
    pub fn enqueue_group<T: Pod, L: Lane + ?Sized>(
        &self,
        lane: &L,
        record: Option<&T>,
        lanes_per_record: u32,
        mode: EnqueueMode,
    ) -> GroupEnqueue {
        debug_assert_eq!(record_words_of::<T>(), self.stride);
        let words = record.map(encode_record);
        self.enqueue_group_words(lane, words.as_deref(), lanes_per_record, mode)
    }

    pub(crate) fn enqueue_group_words<L: Lane + ?Sized>(
        &self,
        lane: &L,
        words: Option<&[u32]>,
        lanes_per_record: u32,
        mode: EnqueueMode,
    ) -> GroupEnqueue {
        let lpr = lanes_per_record.max(1);
        let mask = lane.ballot(words.is_some());
        let requested = mask.count_ones() / lpr;
        if requested == 0 {
            return GroupEnqueue::default();
        }
        let rank = lane.rank_in(mask);
        let record = rank / lpr;
        let part = rank % lpr;

        let outcome = match mode {
            EnqueueMode::Coalesced => {
                let leader = mask.trailing_zeros();
                let base = if lane.id() == leader {
                    self.reserve_many(requested)
                } else {
                    0
                };
                let base = lane.broadcast(base, leader);
                let granted = if base == NONE {
                    0
                } else {
                    requested.min(self.capacity - base)
                };
                let placed = match words {
                    Some(words) if record < granted => {
                        self.write_words(base + record, words, part, lpr);
                        true
                    }
                    _ => false,
                };
                GroupEnqueue {
                    placed,
                    granted,
                    requested,
                }
            }
            EnqueueMode::PerRecord => {
                let mut outcome = GroupEnqueue {
                    requested,
                    ..GroupEnqueue::default()
                };
                for r in 0..requested {
                    let owner = nth_lane(mask, r * lpr);
                    let slot = if lane.id() == owner {
                        self.reserve_one().unwrap_or(NONE)
                    } else {
                        0
                    };
                    let slot = lane.broadcast(slot, owner);
                    if slot == NONE {
                        continue;
                    }
                    outcome.granted += 1;
                    if let Some(words) = words
                        && record == r
                    {
                        self.write_words(slot, words, part, lpr);
                        outcome.placed = true;
                    }
                }
                outcome
            }
        };
        lane.barrier();
        outcome
    }

    /// Collective dequeue of up to `max_count` of the newest records into
    /// `out` starting at word `out_word`. Returns the number taken, the same
    /// on every lane.
    pub fn dequeue<L: Lane + ?Sized>(
        &self,
        lane: &L,
        out: &SharedRegion,
        out_word: u32,
        max_count: u32,
    ) -> u32 {
        let n = lane.broadcast(if lane.is_leader() { self.count() } else { 0 }, 0);
        let take = max_count.min(n);
        if take == 0 {
            return 0;
        }
        let start = n - take;
        self.region.copy_strided(
            self.slot_word(start),
            out,
            out_word,
            take * self.stride,
            lane.id(),
            lane.width(),
        );
        lane.barrier();
        if lane.is_leader() {
            self.count_cell().store(start, Ordering::Release);
        }
        lane.barrier();
        take
    }

    /// How many records a read of at most `max_count` would take now.
    #[must_use]
    pub fn reserve_read(&self, max_count: u32) -> u32 {
        max_count.min(self.count())
    }

    /// Collective start of a two-phase read of up to `max_count` of the
    /// newest records. The records stay in place and remain counted until
    /// [`finish_read`](Self::finish_read).
    pub fn start_read<L: Lane + ?Sized>(&self, lane: &L, max_count: u32) -> ReadSlice {
        let n = lane.broadcast(if lane.is_leader() { self.count() } else { 0 }, 0);
        let take = max_count.min(n);
        ReadSlice {
            start: n - take,
            take,
        }
    }

    /// Reads the record in `slot`.
    #[must_use]
    pub fn read<T: Pod>(&self, slot: u32) -> T {
        debug_assert!(slot < self.capacity);
        self.region.read_record(self.slot_word(slot))
    }

    /// Collective end of a two-phase read.
    ///
    /// Records pushed above the slice while it was being processed slide
    /// down over it in chunks of at most `take` records, so source and
    /// destination of a chunk never overlap. The count then drops by `take`.
    pub fn finish_read<L: Lane + ?Sized>(&self, lane: &L, slice: ReadSlice) {
        if slice.is_empty() {
            return;
        }
        let current = lane.broadcast(
            if lane.is_leader() {
                self.count_cell().load(Ordering::Acquire)
            } else {
                0
            },
            0,
        );
        let end = slice.start + slice.take;
        let extra = current.min(self.capacity).saturating_sub(end);
        let mut moved = 0;
        while moved < extra {
            let chunk = slice.take.min(extra - moved);
            self.region.copy_strided(
                self.slot_word(end + moved),
                &self.region,
                self.slot_word(slice.start + moved),
                chunk * self.stride,
                lane.id(),
                lane.width(),
            );
            lane.barrier();
            moved += chunk;
        }
        if lane.is_leader() {
            self.count_cell().fetch_sub(slice.take, Ordering::AcqRel);
        }
        lane.barrier();
    }

    /// Copies out the live records, oldest first.
    #[must_use]
    pub fn snapshot<T: Pod>(&self) -> Vec<T> {
        (0..self.count()).map(|slot| self.read(slot)).collect()
    }

    #[inline]
    fn count_cell(&self) -> &AtomicU32 {
        self.region.word(self.header + COUNT)
    }

    #[inline]
    fn slot_word(&self, slot: u32) -> u32 {
        self.records + slot * self.stride
    }

    fn write_words(&self, slot: u32, words: &[u32], part: u32, parts: u32) {
        self.region
            .write_record_part(self.slot_word(slot), words, part, parts);
    }

    fn reserve_one(&self) -> Option<u32> {
        let base = self.reserve_many(1);
        (base != NONE).then_some(base)
    }

    /// Reserves up to `n` slots and returns the first, or [`NONE`] when the
    /// buffer is full. Slots past the capacity are given back.
    fn reserve_many(&self, n: u32) -> u32 {
        let count = self.count_cell();
        if count.load(Ordering::Acquire) >= self.capacity {
            return NONE;
        }
        let base = count.fetch_add(n, Ordering::AcqRel);
        if base >= self.capacity {
            count.fetch_sub(n, Ordering::AcqRel);
            return NONE;
        }
        let end = base + n;
        if end > self.capacity {
            count.fetch_sub(end - self.capacity, Ordering::AcqRel);
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use tierq_common::memory::{LayoutPlanner, SizingDirective, SizingPolicy};

    use super::*;
    use crate::group::{SoloLane, ThreadGroup};

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    struct Item {
        value: u32,
        tag: u32,
        weight: f32,
    }

    fn item(value: u32) -> Item {
        Item {
            value,
            tag: value * 2,
            weight: value as f32 / 2.0,
        }
    }

    fn buffer(capacity: u32) -> StagingBuffer {
        let layout = LayoutPlanner::new(4096)
            .with(SizingDirective::new(
                TaskTypeId::new(5),
                12,
                SizingPolicy::Count(capacity),
            ))
            .plan()
            .unwrap();
        let region = Arc::new(SharedRegion::new(layout.total()));
        let buf = StagingBuffer::new(region, &layout.placements()[0]);
        buf.init(&SoloLane);
        buf
    }

    #[test]
    fn test_init_writes_header() {
        let buf = buffer(10);
        assert_eq!(
            buf.header(),
            BufferHeader {
                count: 0,
                type_id: TaskTypeId::new(5),
                capacity: 10,
                record_words: 3,
            }
        );
    }

    #[test]
    fn test_push_until_full() {
        let buf = buffer(3);
        assert!(buf.try_push(&item(1)));
        assert!(buf.try_push(&item(2)));
        assert!(buf.try_push(&item(3)));
        assert!(!buf.try_push(&item(4)));
        assert_eq!(buf.count(), 3);
        assert_eq!(buf.snapshot::<Item>(), vec![item(1), item(2), item(3)]);
    }

    #[test]
    fn test_dequeue_takes_newest() {
        let buf = buffer(8);
        for v in 0..5 {
            assert!(buf.try_push(&item(v)));
        }
        let out = SharedRegion::with_words(32);
        let taken = buf.dequeue(&SoloLane, &out, 0, 2);
        assert_eq!(taken, 2);
        assert_eq!(buf.count(), 3);
        assert_eq!(out.read_record::<Item>(0), item(3));
        assert_eq!(out.read_record::<Item>(3), item(4));
        assert_eq!(buf.dequeue(&SoloLane, &out, 0, 10), 3);
        assert_eq!(buf.dequeue(&SoloLane, &out, 0, 10), 0);
    }

    #[test]
    fn test_two_phase_read_with_compaction() {
        let buf = buffer(16);
        for v in 0..4 {
            buf.try_push(&item(v));
        }
        let slice = buf.start_read(&SoloLane, 2);
        assert_eq!(slice, ReadSlice { start: 2, take: 2 });
        assert_eq!(buf.read::<Item>(slice.start), item(2));
        assert_eq!(buf.count(), 4);

        // Produced while the slice is held.
        for v in 10..15 {
            buf.try_push(&item(v));
        }
        buf.finish_read(&SoloLane, slice);
        let expected: Vec<Item> = [0, 1, 10, 11, 12, 13, 14].into_iter().map(item).collect();
        assert_eq!(buf.snapshot::<Item>(), expected);
    }

    #[test]
    fn test_finish_read_without_new_records() {
        let buf = buffer(4);
        for v in 0..3 {
            buf.try_push(&item(v));
        }
        let slice = buf.start_read(&SoloLane, 8);
        assert_eq!(slice.take, 3);
        buf.finish_read(&SoloLane, slice);
        assert_eq!(buf.count(), 0);
        assert_eq!(buf.reserve_read(5), 0);
    }

    #[test]
    fn test_collective_enqueue_single_record() {
        let buf = buffer(2);
        let mut group = ThreadGroup::new(3).unwrap();
        let results = group.run(|lane| {
            let a = buf.enqueue(lane, &item(7));
            let b = buf.enqueue(lane, &item(8));
            let c = buf.enqueue(lane, &item(9));
            (a, b, c)
        });
        assert!(results.iter().all(|&r| r == (true, true, false)));
        assert_eq!(buf.snapshot::<Item>(), vec![item(7), item(8)]);
    }

    #[test]
    fn test_group_enqueue_partial_grant() {
        for mode in [EnqueueMode::Coalesced, EnqueueMode::PerRecord] {
            let buf = buffer(4);
            buf.try_push(&item(100));
            let mut group = ThreadGroup::new(8).unwrap();
            let outcomes = group.run(|lane| {
                let offer = (lane.id() % 2 == 0).then(|| item(lane.id()));
                buf.enqueue_group(lane, offer.as_ref(), 1, mode)
            });
            for outcome in &outcomes {
                assert_eq!(outcome.requested, 4);
                assert_eq!(outcome.granted, 3);
                assert_eq!(outcome.refused(), 1);
            }
            let placed = outcomes.iter().filter(|o| o.placed).count();
            assert_eq!(placed, 3);
            // Lanes 0, 2, 4 ranked first and won the slots.
            assert!(outcomes[0].placed && outcomes[2].placed && outcomes[4].placed);
            assert!(!outcomes[6].placed);
            assert_eq!(buf.count(), 4);
            let mut stored: Vec<u32> = buf.snapshot::<Item>().iter().map(|i| i.value).collect();
            stored.sort_unstable();
            assert_eq!(stored, vec![0, 2, 4, 100]);
        }
    }

    #[test]
    fn test_group_enqueue_lanes_per_record() {
        let buf = buffer(8);
        let mut group = ThreadGroup::new(7).unwrap();
        let outcomes = group.run(|lane| {
            // Lanes 0..6 pair up; lane 6 is an incomplete pair.
            let offer = item(lane.id() / 2);
            buf.enqueue_group(lane, Some(&offer), 2, EnqueueMode::Coalesced)
        });
        assert!(outcomes.iter().all(|o| o.requested == 3 && o.granted == 3));
        assert!(!outcomes[6].placed);
        assert_eq!(buf.snapshot::<Item>(), vec![item(0), item(1), item(2)]);
    }

    #[test]
    fn test_full_buffer_rejects_group() {
        let buf = buffer(1);
        buf.try_push(&item(1));
        let mut group = ThreadGroup::new(4).unwrap();
        let outcomes = group.run(|lane| {
            buf.enqueue_group(lane, Some(&item(2)), 1, EnqueueMode::Coalesced)
        });
        assert!(outcomes.iter().all(|o| !o.placed && o.granted == 0));
        assert_eq!(buf.count(), 1);
    }

    #[test]
    fn test_concurrent_pushes_never_exceed_capacity() {
        let buf = buffer(50);
        let mut group = ThreadGroup::new(8).unwrap();
        let pushed = group.run(|lane| {
            (0..20)
                .filter(|i| buf.try_push(&item(lane.id() * 100 + i)))
                .count()
        });
        assert_eq!(pushed.iter().sum::<usize>(), 50);
        assert_eq!(buf.count(), 50);
    }

    #[test]
    fn test_group_read_cycle() {
        let buf = buffer(32);
        for v in 0..6 {
            buf.try_push(&item(v));
        }
        let mut group = ThreadGroup::new(4).unwrap();
        let seen = group.run(|lane| {
            let slice = buf.start_read(lane, 4);
            let mine = (lane.id() < slice.take).then(|| buf.read::<Item>(slice.start + lane.id()));
            let offer = mine.map(|i| item(i.value + 50));
            buf.enqueue_group(lane, offer.as_ref(), 1, EnqueueMode::Coalesced);
            buf.finish_read(lane, slice);
            mine.map(|i| i.value)
        });
        let mut seen: Vec<u32> = seen.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 3, 4, 5]);
        let mut left: Vec<u32> = buf.snapshot::<Item>().iter().map(|i| i.value).collect();
        left.sort_unstable();
        assert_eq!(left, vec![0, 1, 52, 53, 54, 55]);
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn count_stays_within_capacity(
                capacity in 1u32..40,
                ops in prop::collection::vec((0u8..3, 1u32..10), 1..60),
            ) {
                let buf = buffer(capacity);
                let out = SharedRegion::with_words(40 * 3);
                let mut model: Vec<u32> = Vec::new();
                let mut next = 0;
                for (op, n) in ops {
                    match op {
                        0 => {
                            let ok = buf.try_push(&item(next));
                            prop_assert_eq!(ok, model.len() < capacity as usize);
                            if ok {
                                model.push(next);
                            }
                            next += 1;
                        }
                        1 => {
                            let taken = buf.dequeue(&SoloLane, &out, 0, n);
                            let keep = model.len() - taken as usize;
                            prop_assert_eq!(taken as usize, (n as usize).min(model.len()));
                            model.truncate(keep);
                        }
                        _ => {
                            let slice = buf.start_read(&SoloLane, n);
                            let start = slice.start as usize;
                            model.drain(start..start + slice.take as usize);
                            buf.finish_read(&SoloLane, slice);
                        }
                    }
                    prop_assert!(buf.count() <= capacity);
                    let live: Vec<u32> = buf.snapshot::<Item>().iter().map(|i| i.value).collect();
                    prop_assert_eq!(&live, &model);
                }
            }
        }
    }
}
