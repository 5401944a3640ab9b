//! Per-type dispatch over a group's staging buffers.
//!
//! A [`ChainPlan`] is built once and shared by every group: it fixes the
//! task types, their order, and where each buffer lives in the region. Each
//! group then creates its own [`QueueChain`] over a private
//! [`SharedRegion`] sized by the plan.

use std::sync::Arc;

use tierq_common::memory::{Layout, LayoutPlanner, SharedRegion, SizingDirective, SizingPolicy};
use tierq_common::types::{TaskDescriptor, TaskType, TaskTypeId};
use tierq_common::{Error, QueueError, Result};

use super::Dequeued;
use super::staging::{EnqueueMode, GroupEnqueue, ReadSlice, StagingBuffer};
use crate::group::{Lane, NONE};
use crate::task::TaskRegistry;

/// Fill threshold in records for a buffer of `capacity` at `min_fill_percent`.
///
/// The threshold is one above the percentage share, so a 0% threshold still
/// requires one record and a buffer of 10 at 80% needs 9.
#[must_use]
pub fn fill_threshold(min_fill_percent: u32, capacity: u32) -> u32 {
    (u64::from(min_fill_percent.min(100)) * u64::from(capacity) / 100) as u32 + 1
}

/// Immutable description of a chain shared by all groups.
#[derive(Debug, Clone)]
pub struct ChainPlan {
    registry: TaskRegistry,
    layout: Layout,
    extra_shared_budget: Option<u32>,
}

impl ChainPlan {
    /// Starts a plan over a region of `budget` bytes.
    #[must_use]
    pub fn builder(budget: u32) -> ChainPlanBuilder {
        ChainPlanBuilder {
            budget,
            entries: Vec::new(),
            extra_shared_budget: None,
        }
    }

    /// Pairs a registry with a layout planned for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the layout does not list the registry's
    /// types in the same order with the same record sizes.
    pub fn new(registry: TaskRegistry, layout: Layout) -> Result<Self> {
        if registry.len() != layout.len() {
            return Err(Error::Config(format!(
                "layout has {} queues for {} task types",
                layout.len(),
                registry.len()
            )));
        }
        for (desc, placement) in registry.iter().zip(layout.placements()) {
            if desc.id != placement.type_id || desc.record_bytes != placement.record_bytes {
                return Err(Error::Config(format!(
                    "layout entry {} ({} bytes) does not match {} ({} bytes)",
                    placement.type_id, placement.record_bytes, desc.id, desc.record_bytes
                )));
            }
        }
        Ok(Self {
            registry,
            layout,
            extra_shared_budget: None,
        })
    }

    /// Bounds batch sizes by the shared scratch each item needs.
    pub fn with_extra_shared_budget(mut self, budget: Option<u32>) -> Self {
        self.extra_shared_budget = budget;
        self
    }

    /// The task types in chain order.
    #[must_use]
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// The planned layout.
    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Shared scratch available to executing items, if bounded.
    #[must_use]
    pub fn extra_shared_budget(&self) -> Option<u32> {
        self.extra_shared_budget
    }

    /// Bytes a group's region needs.
    #[must_use]
    pub fn region_bytes(&self) -> u32 {
        self.layout.total()
    }

    /// Chain position of `id`.
    pub fn position(&self, id: TaskTypeId) -> std::result::Result<usize, QueueError> {
        self.registry
            .position(id)
            .ok_or(QueueError::UnknownTaskType(id))
    }

    /// Chain position of `T`, with its record size checked.
    pub fn position_of<T: TaskType>(&self) -> std::result::Result<usize, QueueError> {
        self.registry.position_of::<T>()
    }

    /// Descriptor at chain position `pos`.
    ///
    /// # Panics
    ///
    /// Panics if `pos` is out of range.
    #[must_use]
    pub fn descriptor(&self, pos: usize) -> &TaskDescriptor {
        &self.registry.descriptors()[pos]
    }

    /// Largest batch of the type at `pos` a group of `width` lanes takes from
    /// its local buffer. Zero means the type cannot run in such a group.
    #[must_use]
    pub fn batch_cap(&self, pos: usize, width: u32) -> u32 {
        let capacity = self.layout.placements()[pos].capacity;
        self.descriptor(pos)
            .batch_cap(width, self.extra_shared_budget)
            .min(capacity)
    }
}

/// Collects sizing directives for a [`ChainPlan`].
#[derive(Debug, Clone)]
pub struct ChainPlanBuilder {
    budget: u32,
    entries: Vec<(TaskDescriptor, SizingPolicy)>,
    extra_shared_budget: Option<u32>,
}

impl ChainPlanBuilder {
    /// Appends `T` with a fixed record count.
    pub fn count<T: TaskType>(self, count: u32) -> Self {
        self.entry(TaskDescriptor::of::<T>(), SizingPolicy::Count(count))
    }

    /// Appends `T` with a fixed byte size.
    pub fn bytes<T: TaskType>(self, bytes: u32) -> Self {
        self.entry(TaskDescriptor::of::<T>(), SizingPolicy::Bytes(bytes))
    }

    /// Appends `T` with a share of the remaining budget.
    pub fn share<T: TaskType>(self, ratio: u32) -> Self {
        self.entry(TaskDescriptor::of::<T>(), SizingPolicy::Share(ratio))
    }

    /// Appends a run-time descriptor.
    pub fn entry(mut self, desc: TaskDescriptor, policy: SizingPolicy) -> Self {
        self.entries.push((desc, policy));
        self
    }

    /// Sets the shared scratch budget for executing items.
    pub fn extra_shared_budget(mut self, budget: u32) -> Self {
        self.extra_shared_budget = Some(budget);
        self
    }

    /// Plans the layout.
    ///
    /// # Errors
    ///
    /// Returns a [`QueueError::DuplicateTaskType`] or a layout error.
    pub fn build(self) -> Result<ChainPlan> {
        let registry = TaskRegistry::from_descriptors(self.entries.iter().map(|(d, _)| *d))?;
        let directives: Vec<SizingDirective> = self
            .entries
            .iter()
            .map(|(desc, policy)| SizingDirective::for_task(desc, *policy))
            .collect();
        let layout = LayoutPlanner::plan_directives(&directives, self.budget)?;
        Ok(ChainPlan::new(registry, layout)?.with_extra_shared_budget(self.extra_shared_budget))
    }
}

/// Records a two-phase read holds in the local chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalRead {
    /// Task type of the batch.
    pub type_id: TaskTypeId,
    /// Slots held.
    pub slice: ReadSlice,
}

/// One group's chain of staging buffers.
#[derive(Debug)]
pub struct QueueChain {
    plan: Arc<ChainPlan>,
    region: Arc<SharedRegion>,
    buffers: Vec<StagingBuffer>,
}

impl QueueChain {
    /// Allocates a region for `plan` and binds one buffer per task type.
    #[must_use]
    pub fn new(plan: Arc<ChainPlan>) -> Self {
        let region = Arc::new(SharedRegion::new(plan.region_bytes()));
        let buffers = plan
            .layout()
            .placements()
            .iter()
            .map(|placement| StagingBuffer::new(Arc::clone(&region), placement))
            .collect();
        Self {
            plan,
            region,
            buffers,
        }
    }

    /// The shared plan.
    #[must_use]
    pub fn plan(&self) -> &Arc<ChainPlan> {
        &self.plan
    }

    /// The backing region.
    #[must_use]
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Buffers in chain order.
    #[must_use]
    pub fn buffers(&self) -> &[StagingBuffer] {
        &self.buffers
    }

    /// Zeroes the region and writes every header. Collective, once per
    /// group before any other operation.
    pub fn worker_start<L: Lane + ?Sized>(&self, lane: &L) {
        self.region
            .zero_strided(0, self.region.len_words(), lane.id(), lane.width());
        lane.barrier();
        if lane.is_leader() {
            for buffer in &self.buffers {
                buffer.write_header();
            }
        }
        lane.barrier();
    }

    /// The buffer serving `type_id`.
    pub fn buffer(&self, type_id: TaskTypeId) -> std::result::Result<&StagingBuffer, QueueError> {
        Ok(&self.buffers[self.plan.position(type_id)?])
    }

    /// The buffer at chain position `pos`.
    pub(crate) fn buffer_at(&self, pos: usize) -> &StagingBuffer {
        &self.buffers[pos]
    }

    /// Single-lane push of one `T` record.
    pub fn try_push<T: TaskType>(&self, record: &T::Data) -> std::result::Result<bool, QueueError> {
        let pos = self.plan.position_of::<T>()?;
        Ok(self.buffers[pos].try_push(record))
    }

    /// Collective enqueue of one record offered by the whole group.
    pub fn enqueue<T: TaskType, L: Lane + ?Sized>(
        &self,
        lane: &L,
        record: &T::Data,
    ) -> std::result::Result<bool, QueueError> {
        let pos = self.plan.position_of::<T>()?;
        Ok(self.buffers[pos].enqueue(lane, record))
    }

    /// Collective enqueue where each lane may offer a `T` record.
    pub fn enqueue_group<T: TaskType, L: Lane + ?Sized>(
        &self,
        lane: &L,
        record: Option<&T::Data>,
        lanes_per_record: u32,
        mode: EnqueueMode,
    ) -> std::result::Result<GroupEnqueue, QueueError> {
        let pos = self.plan.position_of::<T>()?;
        Ok(self.buffers[pos].enqueue_group(lane, record, lanes_per_record, mode))
    }

    pub(crate) fn enqueue_group_words<L: Lane + ?Sized>(
        &self,
        pos: usize,
        lane: &L,
        words: Option<&[u32]>,
        lanes_per_record: u32,
        mode: EnqueueMode,
    ) -> GroupEnqueue {
        self.buffers[pos].enqueue_group_words(lane, words, lanes_per_record, mode)
    }

    /// Picks the first buffer in chain order that meets `min_fill_percent`.
    /// Collective; every lane gets lane 0's choice.
    fn select<L: Lane + ?Sized>(&self, lane: &L, min_fill_percent: u32) -> Option<usize> {
        let choice = if lane.is_leader() {
            self.first_eligible(min_fill_percent, lane.width())
                .map_or(NONE, |pos| pos as u32)
        } else {
            0
        };
        let choice = lane.broadcast(choice, 0);
        (choice != NONE).then_some(choice as usize)
    }

    fn first_eligible(&self, min_fill_percent: u32, width: u32) -> Option<usize> {
        (0..self.buffers.len()).find(|&pos| {
            let buffer = &self.buffers[pos];
            let cap = self.plan.batch_cap(pos, width);
            if cap == 0 {
                return false;
            }
            let count = buffer.count();
            count > 0 && count >= cap.min(fill_threshold(min_fill_percent, buffer.capacity()))
        })
    }

    /// Collective dequeue from the first eligible buffer into `out` at word
    /// 0. `out` must hold a full batch of the largest record type.
    pub fn dequeue_any<L: Lane + ?Sized>(
        &self,
        lane: &L,
        min_fill_percent: u32,
        out: &SharedRegion,
    ) -> Option<Dequeued> {
        let pos = self.select(lane, min_fill_percent)?;
        let cap = self.plan.batch_cap(pos, lane.width());
        let buffer = &self.buffers[pos];
        let count = buffer.dequeue(lane, out, 0, cap);
        (count > 0).then(|| Dequeued {
            type_id: buffer.type_id(),
            count,
        })
    }

    /// Collective dequeue of up to `max_count` records of `type_id`.
    pub fn dequeue_selected<L: Lane + ?Sized>(
        &self,
        lane: &L,
        type_id: TaskTypeId,
        max_count: u32,
        out: &SharedRegion,
    ) -> std::result::Result<u32, QueueError> {
        Ok(self.buffer(type_id)?.dequeue(lane, out, 0, max_count))
    }

    /// Collective two-phase read from the first eligible buffer.
    pub fn start_read_any<L: Lane + ?Sized>(
        &self,
        lane: &L,
        min_fill_percent: u32,
    ) -> Option<LocalRead> {
        let pos = self.select(lane, min_fill_percent)?;
        let buffer = &self.buffers[pos];
        let slice = buffer.start_read(lane, self.plan.batch_cap(pos, lane.width()));
        (!slice.is_empty()).then(|| LocalRead {
            type_id: buffer.type_id(),
            slice,
        })
    }

    /// Collective two-phase read of up to `max_count` records of `type_id`.
    pub fn start_read_selected<L: Lane + ?Sized>(
        &self,
        lane: &L,
        type_id: TaskTypeId,
        max_count: u32,
    ) -> std::result::Result<LocalRead, QueueError> {
        let slice = self.buffer(type_id)?.start_read(lane, max_count);
        Ok(LocalRead { type_id, slice })
    }

    /// Reads record `i` of a held slice.
    pub fn read<T: TaskType>(
        &self,
        slice: ReadSlice,
        i: u32,
    ) -> std::result::Result<T::Data, QueueError> {
        let pos = self.plan.position_of::<T>()?;
        if i >= slice.take {
            return Err(QueueError::OutOfBatch {
                task: T::ID,
                index: i,
                count: slice.take,
            });
        }
        Ok(self.buffers[pos].read(slice.start + i))
    }

    /// Closes a two-phase read of `T` records.
    pub fn finish_read<T: TaskType, L: Lane + ?Sized>(
        &self,
        lane: &L,
        slice: ReadSlice,
    ) -> std::result::Result<(), QueueError> {
        let pos = self.plan.position_of::<T>()?;
        self.buffers[pos].finish_read(lane, slice);
        Ok(())
    }

    /// Closes a two-phase read by run-time type id.
    pub fn finish_read_id<L: Lane + ?Sized>(
        &self,
        lane: &L,
        type_id: TaskTypeId,
        slice: ReadSlice,
    ) -> std::result::Result<(), QueueError> {
        self.buffer(type_id)?.finish_read(lane, slice);
        Ok(())
    }

    /// Live records of `type_id`.
    pub fn len(&self, type_id: TaskTypeId) -> std::result::Result<u32, QueueError> {
        Ok(self.buffer(type_id)?.count())
    }

    /// Live records across all types.
    #[must_use]
    pub fn total_len(&self) -> u32 {
        self.buffers.iter().map(StagingBuffer::count).sum()
    }

    /// Returns `true` if no buffer holds a record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(|buffer| buffer.count() == 0)
    }
}

#[cfg(test)]
mod tests {
    use tierq_common::LayoutError;

    use super::*;
    use crate::group::{SoloLane, ThreadGroup};

    struct Small;
    impl TaskType for Small {
        type Data = u32;
        const ID: TaskTypeId = TaskTypeId::new(1);
        const NAME: &'static str = "small";
    }

    struct Pair;
    impl TaskType for Pair {
        type Data = [u32; 2];
        const ID: TaskTypeId = TaskTypeId::new(2);
        const NAME: &'static str = "pair";
    }

    struct Heavy;
    impl TaskType for Heavy {
        type Data = [u32; 4];
        const ID: TaskTypeId = TaskTypeId::new(3);
        const NAME: &'static str = "heavy";
        const THREADS_PER_ITEM: u32 = 4;
        const SHARED_PER_ITEM: u32 = 256;
    }

    struct Missing;
    impl TaskType for Missing {
        type Data = u32;
        const ID: TaskTypeId = TaskTypeId::new(99);
        const NAME: &'static str = "missing";
    }

    fn chain(plan: ChainPlan) -> QueueChain {
        let chain = QueueChain::new(Arc::new(plan));
        chain.worker_start(&SoloLane);
        chain
    }

    #[test]
    fn test_fill_threshold() {
        assert_eq!(fill_threshold(0, 10), 1);
        assert_eq!(fill_threshold(80, 10), 9);
        assert_eq!(fill_threshold(100, 10), 11);
        assert_eq!(fill_threshold(250, 10), 11);
    }

    #[test]
    fn test_plan_matches_layout() {
        let plan = ChainPlan::builder(1024)
            .count::<Small>(100)
            .share::<Pair>(1)
            .build()
            .unwrap();
        assert_eq!(plan.registry().len(), 2);
        assert_eq!(plan.position(Pair::ID), Ok(1));
        assert_eq!(plan.layout().placements()[0].capacity, 100);
        assert!(plan.region_bytes() <= 1024);
    }

    #[test]
    fn test_plan_errors() {
        let err = ChainPlan::builder(64).count::<Small>(100).build().unwrap_err();
        assert!(matches!(err, Error::Layout(LayoutError::BudgetExceeded { .. })));

        let err = ChainPlan::builder(1024)
            .count::<Small>(1)
            .count::<Small>(1)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Queue(QueueError::DuplicateTaskType(id)) if id == Small::ID
        ));
    }

    #[test]
    fn test_plan_rejects_mismatched_layout() {
        let registry = TaskRegistry::from_descriptors([TaskDescriptor::of::<Small>()]).unwrap();
        let layout = LayoutPlanner::new(256)
            .with(SizingDirective::count::<Pair>(4))
            .plan()
            .unwrap();
        assert!(matches!(ChainPlan::new(registry, layout), Err(Error::Config(_))));
    }

    #[test]
    fn test_typed_dispatch() {
        let chain = chain(
            ChainPlan::builder(1024)
                .count::<Small>(4)
                .count::<Pair>(4)
                .build()
                .unwrap(),
        );
        assert!(chain.try_push::<Small>(&7).unwrap());
        assert!(chain.try_push::<Pair>(&[1, 2]).unwrap());
        assert!(chain.try_push::<Pair>(&[3, 4]).unwrap());
        assert_eq!(chain.len(Small::ID), Ok(1));
        assert_eq!(chain.len(Pair::ID), Ok(2));
        assert_eq!(chain.total_len(), 3);
        assert_eq!(
            chain.try_push::<Missing>(&1),
            Err(QueueError::UnknownTaskType(Missing::ID))
        );
        assert_eq!(chain.buffer(Pair::ID).unwrap().header().type_id, Pair::ID);
    }

    #[test]
    fn test_dequeue_any_respects_threshold_and_order() {
        let chain = chain(
            ChainPlan::builder(4096)
                .count::<Small>(10)
                .count::<Pair>(10)
                .build()
                .unwrap(),
        );
        let out = SharedRegion::with_words(64);
        let mut group = ThreadGroup::new(16).unwrap();

        for v in 0..3 {
            chain.try_push::<Small>(&v).unwrap();
        }
        for v in 0..9 {
            chain.try_push::<Pair>(&[v, v]).unwrap();
        }
        let got = group.run(|lane| chain.dequeue_any(lane, 80, &out));
        // Small has 3 < 9 records, so Pair is the first to reach 80%.
        assert!(got.iter().all(|d| *d == Some(Dequeued { type_id: Pair::ID, count: 9 })));

        let got = group.run(|lane| chain.dequeue_any(lane, 80, &out));
        assert!(got.iter().all(Option::is_none));

        let got = group.run(|lane| chain.dequeue_any(lane, 0, &out));
        assert!(got.iter().all(|d| *d == Some(Dequeued { type_id: Small::ID, count: 3 })));
        assert_eq!(out.read_record::<u32>(0), 0);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_batch_cap_limits_eligibility() {
        let plan = ChainPlan::builder(4096)
            .count::<Heavy>(32)
            .count::<Small>(32)
            .extra_shared_budget(512)
            .build()
            .unwrap();
        // Eight lanes run two Heavy items; the scratch budget allows two.
        assert_eq!(plan.batch_cap(0, 8), 2);
        assert_eq!(plan.batch_cap(1, 8), 8);
        let chain = chain(plan);
        for v in 0..2 {
            chain.try_push::<Heavy>(&[v; 4]).unwrap();
        }
        chain.try_push::<Small>(&1).unwrap();

        let mut group = ThreadGroup::new(8).unwrap();
        let reads = group.run(|lane| chain.start_read_any(lane, 80));
        // Two records reach the cap of two even though 80% of 32 is far off.
        let read = reads[0].unwrap();
        assert_eq!(read.type_id, Heavy::ID);
        assert_eq!(read.slice, ReadSlice { start: 0, take: 2 });
        group.run(|lane| chain.finish_read::<Heavy, _>(lane, read.slice).unwrap());
        assert_eq!(chain.len(Heavy::ID), Ok(0));
    }

    #[test]
    fn test_unrunnable_type_is_skipped() {
        let plan = ChainPlan::builder(4096)
            .count::<Heavy>(8)
            .count::<Small>(8)
            .extra_shared_budget(100)
            .build()
            .unwrap();
        assert_eq!(plan.batch_cap(0, 8), 0);
        let chain = chain(plan);
        chain.try_push::<Heavy>(&[1; 4]).unwrap();
        chain.try_push::<Small>(&5).unwrap();
        let read = chain.start_read_any(&SoloLane, 0).unwrap();
        assert_eq!(read.type_id, Small::ID);
        assert_eq!(chain.read::<Small>(read.slice, 0), Ok(5));
        assert_eq!(
            chain.read::<Small>(read.slice, 1),
            Err(QueueError::OutOfBatch {
                task: Small::ID,
                index: 1,
                count: 1,
            })
        );
    }

    #[test]
    fn test_selected_operations() {
        let chain = chain(
            ChainPlan::builder(1024)
                .count::<Small>(8)
                .count::<Pair>(8)
                .build()
                .unwrap(),
        );
        for v in 0..5 {
            chain.try_push::<Small>(&v).unwrap();
        }
        let out = SharedRegion::with_words(16);
        assert_eq!(chain.dequeue_selected(&SoloLane, Small::ID, 2, &out), Ok(2));
        assert_eq!(out.read_record::<u32>(0), 3);
        assert_eq!(out.read_record::<u32>(1), 4);

        let read = chain.start_read_selected(&SoloLane, Small::ID, 10).unwrap();
        assert_eq!(read.slice, ReadSlice { start: 0, take: 3 });
        chain.try_push::<Small>(&40).unwrap();
        chain.finish_read_id(&SoloLane, Small::ID, read.slice).unwrap();
        assert_eq!(chain.buffer(Small::ID).unwrap().snapshot::<u32>(), vec![40]);

        assert_eq!(
            chain.dequeue_selected(&SoloLane, Missing::ID, 1, &out),
            Err(QueueError::UnknownTaskType(Missing::ID))
        );
    }

    #[test]
    fn test_group_enqueue_through_chain() {
        let chain = chain(
            ChainPlan::builder(1024)
                .count::<Small>(6)
                .count::<Pair>(6)
                .build()
                .unwrap(),
        );
        let mut group = ThreadGroup::new(8).unwrap();
        let placed = group.run(|lane| {
            let value = lane.id();
            chain
                .enqueue_group::<Small, _>(lane, Some(&value), 1, EnqueueMode::Coalesced)
                .unwrap()
                .placed
        });
        assert_eq!(placed.iter().filter(|p| **p).count(), 6);
        let whole = group.run(|lane| chain.enqueue::<Pair, _>(lane, &[9, 9]).unwrap());
        assert!(whole.iter().all(|p| *p));
        assert_eq!(chain.len(Pair::ID), Ok(1));
    }
}
