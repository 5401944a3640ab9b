//! Two-tier front end.
//!
//! A [`TieredCombiner`] pairs every group's fast [`QueueChain`] with one
//! shared [`ExternalQueue`]:
//!
//! - **enqueue**: try the local chain unless the group's spill roll sends the
//!   records straight out; whatever the chain refuses goes external.
//! - **dequeue**: local chain at the high fill threshold, then the external
//!   tier, then the local chain at any fill so small batches cannot starve.
//! - **finish_read**: routed back to the tier named in the batch's
//!   [`WorkIndex`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tierq_common::memory::{SharedRegion, encode_record};
use tierq_common::types::{GroupId, TaskType, TaskTypeId, Tier, WorkIndex};
use tierq_common::{Error, QueueError, Result};

use super::chain::{ChainPlan, LocalRead, QueueChain};
use super::external::{BatchCap, ExternalQueue};
use super::staging::{EnqueueMode, ReadSlice};
use super::stats::{CombinerStats, Counter, StatsSnapshot};
use crate::group::{ChanceSource, Lane, MAX_WIDTH, SeededChance, group_roll};

/// What `worker_end` does with records left in a group's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualPolicy {
    /// Move them to the external tier.
    #[default]
    Drain,
    /// Throw them away.
    Discard,
}

/// Combiner policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinerConfig {
    /// Percent of enqueues sent straight to the external tier.
    pub spill_chance: u32,
    /// Fill percentage a local buffer needs before it is preferred over the
    /// external tier.
    pub high_fill_percent: u32,
    /// Lanes cooperating on one record.
    pub lanes_per_record: u32,
    /// How local group enqueues reserve slots.
    pub enqueue_mode: EnqueueMode,
    /// What happens to leftover local records.
    pub residual: ResidualPolicy,
    /// Seed for the per-group spill rolls.
    pub seed: u64,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            spill_chance: 0,
            high_fill_percent: 80,
            lanes_per_record: 1,
            enqueue_mode: EnqueueMode::Coalesced,
            residual: ResidualPolicy::Drain,
            seed: 0x5eed,
        }
    }
}

impl CombinerConfig {
    /// Sets the spill percentage.
    pub fn with_spill_chance(mut self, percent: u32) -> Self {
        self.spill_chance = percent;
        self
    }

    /// Sets the high fill threshold.
    pub fn with_high_fill_percent(mut self, percent: u32) -> Self {
        self.high_fill_percent = percent;
        self
    }

    /// Sets the lanes per record.
    pub fn with_lanes_per_record(mut self, lanes: u32) -> Self {
        self.lanes_per_record = lanes;
        self
    }

    /// Sets the local enqueue mode.
    pub fn with_enqueue_mode(mut self, mode: EnqueueMode) -> Self {
        self.enqueue_mode = mode;
        self
    }

    /// Sets the residual policy.
    pub fn with_residual(mut self, policy: ResidualPolicy) -> Self {
        self.residual = policy;
        self
    }

    /// Sets the spill seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for percentages above 100 or a lanes per
    /// record outside `1..=64`.
    pub fn validate(&self) -> Result<()> {
        if self.spill_chance > 100 {
            return Err(Error::Config(format!(
                "spill chance {}% is above 100%",
                self.spill_chance
            )));
        }
        if self.high_fill_percent > 100 {
            return Err(Error::Config(format!(
                "high fill threshold {}% is above 100%",
                self.high_fill_percent
            )));
        }
        if self.lanes_per_record == 0 || self.lanes_per_record > MAX_WIDTH {
            return Err(Error::Config(format!(
                "lanes per record {} is outside 1..={MAX_WIDTH}",
                self.lanes_per_record
            )));
        }
        Ok(())
    }
}

/// A batch handed to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkBatch {
    /// Task type of every record.
    pub type_id: TaskTypeId,
    /// Number of records.
    pub count: u32,
    /// Tier tag plus the tier's own index.
    pub index: WorkIndex,
}

impl WorkBatch {
    /// Tier the batch came from.
    #[must_use]
    pub fn tier(&self) -> Tier {
        self.index.tier()
    }

    fn local(read: LocalRead) -> Self {
        Self {
            type_id: read.type_id,
            count: read.slice.take,
            index: WorkIndex::local(read.slice.start),
        }
    }
}

/// What `worker_end` did with a group's leftover records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Residual {
    /// Records moved to the external tier.
    pub drained: u32,
    /// Records the external tier refused.
    pub lost: u32,
    /// Records thrown away.
    pub discarded: u32,
}

/// Per-group state: the local chain, the scratch region external batches
/// land in, and the group's spill roll source.
pub struct GroupQueues {
    id: GroupId,
    width: u32,
    chain: QueueChain,
    scratch: SharedRegion,
    caps: Vec<BatchCap>,
    chance: Box<dyn ChanceSource>,
}

impl GroupQueues {
    /// Group id.
    #[must_use]
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Lanes in the group.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// The local chain.
    #[must_use]
    pub fn chain(&self) -> &QueueChain {
        &self.chain
    }

    /// Where external batches are copied.
    #[must_use]
    pub fn scratch(&self) -> &SharedRegion {
        &self.scratch
    }

    /// Per-type batch limits in chain order.
    #[must_use]
    pub fn caps(&self) -> &[BatchCap] {
        &self.caps
    }
}

impl std::fmt::Debug for GroupQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupQueues")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("local", &self.chain.total_len())
            .field("scratch", &self.scratch)
            .finish_non_exhaustive()
    }
}

/// The two-tier queue.
pub struct TieredCombiner<Q: ExternalQueue> {
    plan: Arc<ChainPlan>,
    external: Arc<Q>,
    config: CombinerConfig,
    stats: CombinerStats,
}

impl<Q: ExternalQueue> TieredCombiner<Q> {
    /// Creates a combiner.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is out of range.
    pub fn new(plan: Arc<ChainPlan>, external: Arc<Q>, config: CombinerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            plan,
            external,
            config,
            stats: CombinerStats::default(),
        })
    }

    /// The shared chain plan.
    #[must_use]
    pub fn plan(&self) -> &Arc<ChainPlan> {
        &self.plan
    }

    /// The external tier.
    #[must_use]
    pub fn external(&self) -> &Arc<Q> {
        &self.external
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CombinerConfig {
        &self.config
    }

    /// Live counters.
    #[must_use]
    pub fn stats(&self) -> &CombinerStats {
        &self.stats
    }

    /// Copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Records stored in either tier and not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.stats.in_flight()
    }

    /// Creates the state for group `id` of `width` lanes, with a spill roll
    /// seeded from the configured seed and the group id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidGroupWidth`] unless `width` is in `1..=64`.
    pub fn new_group(&self, id: GroupId, width: u32) -> Result<GroupQueues> {
        let seed = self.config.seed ^ u64::from(id.as_u32()).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        self.new_group_with_chance(id, width, Box::new(SeededChance::new(seed)))
    }

    /// Creates group state with an explicit spill roll source.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidGroupWidth`] unless `width` is in `1..=64`.
    pub fn new_group_with_chance(
        &self,
        id: GroupId,
        width: u32,
        chance: Box<dyn ChanceSource>,
    ) -> Result<GroupQueues> {
        if width == 0 || width > MAX_WIDTH {
            return Err(QueueError::InvalidGroupWidth(width).into());
        }
        let extra = self.plan.extra_shared_budget();
        let caps: Vec<BatchCap> = self
            .plan
            .registry()
            .iter()
            .map(|desc| BatchCap {
                type_id: desc.id,
                record_words: desc.record_words(),
                max: desc.batch_cap(width, extra),
            })
            .collect();
        let batch_words = caps
            .iter()
            .map(|cap| cap.max.max(1) * cap.record_words)
            .max()
            .unwrap_or(1);
        let scratch = SharedRegion::with_words(batch_words + Q::REQUIRED_SHARED.div_ceil(4));
        Ok(GroupQueues {
            id,
            width,
            chain: QueueChain::new(Arc::clone(&self.plan)),
            scratch,
            caps,
            chance,
        })
    }

    /// Initialises the group's chain and the external tier's per-group
    /// state. Collective.
    pub fn worker_start<L: Lane + ?Sized>(&self, group: &GroupQueues, lane: &L) {
        debug_assert_eq!(lane.width(), group.width);
        group.chain.worker_start(lane);
        self.external.worker_start(lane);
    }

    /// Per-iteration maintenance. Collective.
    pub fn worker_maintain<L: Lane + ?Sized>(&self, lane: &L) {
        self.external.worker_maintain(lane);
    }

    /// Collective enqueue: each lane offers at most one `T` record. Returns
    /// whether this lane's record was stored in either tier.
    ///
    /// # Errors
    ///
    /// Returns a [`QueueError`] if `T` is not part of the plan. Every lane
    /// gets the same error.
    pub fn enqueue<T: TaskType, L: Lane + ?Sized>(
        &self,
        group: &GroupQueues,
        lane: &L,
        record: Option<&T::Data>,
    ) -> Result<bool> {
        let pos = self.plan.position_of::<T>()?;
        let words = record.map(encode_record);
        Ok(self.enqueue_at(pos, group, lane, words.as_deref()))
    }

    /// Collective enqueue of records given as raw words, for callers that
    /// only know the task type at run time.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownTaskType`] on every lane if `type_id` is
    /// not part of the plan. A lane whose record has the wrong length offers
    /// nothing and gets [`QueueError::RecordSize`] after the group is done.
    pub fn enqueue_raw<L: Lane + ?Sized>(
        &self,
        group: &GroupQueues,
        lane: &L,
        type_id: TaskTypeId,
        record: Option<&[u32]>,
    ) -> Result<bool> {
        let pos = self.plan.position(type_id)?;
        let expected = self.plan.descriptor(pos).record_words();
        let valid = record.filter(|words| words.len() == expected as usize);
        let placed = self.enqueue_at(pos, group, lane, valid);
        match record {
            Some(words) if valid.is_none() => Err(QueueError::RecordSize {
                task: type_id,
                expected,
                found: words.len() as u32,
            }
            .into()),
            _ => Ok(placed),
        }
    }

    fn enqueue_at<L: Lane + ?Sized>(
        &self,
        pos: usize,
        group: &GroupQueues,
        lane: &L,
        words: Option<&[u32]>,
    ) -> bool {
        debug_assert_eq!(lane.width(), group.width);
        let type_id = self.plan.descriptor(pos).id;
        let lpr = self.config.lanes_per_record;
        let leader = lane.is_leader();

        let spill = self.config.spill_chance > 0
            && group_roll(lane, group.chance.as_ref(), self.config.spill_chance);

        let mut pending = words;
        let mut placed = false;
        if !spill {
            let local = group.chain.enqueue_group_words(
                pos,
                lane,
                pending,
                lpr,
                self.config.enqueue_mode,
            );
            if leader {
                self.stats.add(Counter::LocalEnqueued, local.granted);
                self.stats.add(Counter::Overflowed, local.refused());
            }
            if local.placed {
                placed = true;
                pending = None;
            }
        }

        let offered = lane.ballot(pending.is_some()).count_ones() / lpr;
        if offered == 0 {
            return placed;
        }
        if leader {
            self.stats.add(Counter::ExternalEnqueued, offered);
        }
        let external = self.external.enqueue_group(lane, type_id, pending, lpr);
        if leader {
            self.stats.sub(Counter::ExternalEnqueued, external.refused());
            self.stats.add(Counter::Dropped, external.refused());
            if spill {
                self.stats.add(Counter::Spilled, external.requested);
            }
        }
        placed || external.placed
    }

    /// Host-side push of one record into the external tier, for seeding
    /// work before any group runs.
    ///
    /// # Errors
    ///
    /// Returns a [`QueueError`] if `T` is not part of the plan.
    pub fn push<T: TaskType>(&self, record: &T::Data) -> Result<bool> {
        self.plan.position_of::<T>()?;
        self.stats.add(Counter::ExternalEnqueued, 1);
        let stored = self.external.enqueue(T::ID, &encode_record(record));
        if !stored {
            self.stats.sub(Counter::ExternalEnqueued, 1);
            self.stats.add(Counter::Dropped, 1);
        }
        Ok(stored)
    }

    /// Collective dequeue of the next batch, or `None` if neither tier has
    /// work for this group. The batch stays reserved until
    /// [`finish_read`](Self::finish_read).
    pub fn dequeue<L: Lane + ?Sized>(&self, group: &GroupQueues, lane: &L) -> Option<WorkBatch> {
        let leader = lane.is_leader();
        if let Some(read) = group
            .chain
            .start_read_any(lane, self.config.high_fill_percent)
        {
            if leader {
                self.stats.add(Counter::LocalBatches, 1);
            }
            return Some(WorkBatch::local(read));
        }
        if let Some(batch) = self
            .external
            .dequeue_start_read(lane, &group.caps, &group.scratch)
        {
            if leader {
                self.stats.add(Counter::ExternalBatches, 1);
            }
            return Some(WorkBatch {
                type_id: batch.type_id,
                count: batch.count,
                index: WorkIndex::external(0),
            });
        }
        let read = group.chain.start_read_any(lane, 0)?;
        if leader {
            self.stats.add(Counter::ResidualBatches, 1);
        }
        Some(WorkBatch::local(read))
    }

    /// Reads record `i` of `batch`.
    ///
    /// # Errors
    ///
    /// Returns a [`QueueError`] if `T` is not part of the plan, is not the
    /// batch's type, or `i` is not below `batch.count`.
    pub fn read<T: TaskType>(
        &self,
        group: &GroupQueues,
        batch: &WorkBatch,
        i: u32,
    ) -> Result<T::Data> {
        let pos = self.plan.position_of::<T>()?;
        if batch.type_id != T::ID {
            return Err(QueueError::UnknownTaskType(T::ID).into());
        }
        if i >= batch.count {
            return Err(QueueError::OutOfBatch {
                task: T::ID,
                index: i,
                count: batch.count,
            }
            .into());
        }
        Ok(match batch.tier() {
            Tier::Local => group.chain.buffer_at(pos).read(batch.index.index() + i),
            Tier::External => {
                let words = self.plan.descriptor(pos).record_words();
                group.scratch.read_record(i * words)
            }
        })
    }

    /// Closes `batch` in the tier it came from. Collective.
    ///
    /// # Errors
    ///
    /// Returns a [`QueueError`] if the batch's type is not part of the plan.
    pub fn finish_read<L: Lane + ?Sized>(
        &self,
        group: &GroupQueues,
        lane: &L,
        batch: &WorkBatch,
    ) -> Result<()> {
        match batch.tier() {
            Tier::Local => group.chain.finish_read_id(
                lane,
                batch.type_id,
                ReadSlice {
                    start: batch.index.index(),
                    take: batch.count,
                },
            )?,
            Tier::External => self.external.finish_read(lane, batch.type_id, batch.count),
        }
        if lane.is_leader() {
            self.stats.add(Counter::Finished, batch.count);
        }
        Ok(())
    }

    /// Retires a group, applying the residual policy to whatever its chain
    /// still holds. Collective; every lane gets the same report.
    pub fn worker_end<L: Lane + ?Sized>(&self, group: &GroupQueues, lane: &L) -> Residual {
        let leader = lane.is_leader();
        match self.config.residual {
            ResidualPolicy::Discard => {
                let left = if leader { group.chain.total_len() } else { 0 };
                let discarded = lane.broadcast(left, 0);
                if leader {
                    self.stats.add(Counter::Discarded, discarded);
                }
                Residual {
                    discarded,
                    ..Residual::default()
                }
            }
            ResidualPolicy::Drain => {
                let (mut drained, mut lost) = (0, 0);
                for buffer in group.chain.buffers() {
                    let stride = buffer.record_words();
                    let max = (group.scratch.len_words() / stride).max(1);
                    loop {
                        let taken = buffer.dequeue(lane, &group.scratch, 0, max);
                        if taken == 0 {
                            break;
                        }
                        if leader {
                            for i in 0..taken {
                                let words = group.scratch.read_words(i * stride, stride);
                                if self.external.enqueue(buffer.type_id(), &words) {
                                    drained += 1;
                                } else {
                                    lost += 1;
                                }
                            }
                        }
                    }
                }
                if leader {
                    self.stats.add(Counter::Drained, drained);
                    self.stats.add(Counter::Lost, lost);
                }
                Residual {
                    drained: lane.broadcast(drained, 0),
                    lost: lane.broadcast(lost, 0),
                    discarded: 0,
                }
            }
        }
    }
}

impl<Q: ExternalQueue + std::fmt::Debug> std::fmt::Debug for TieredCombiner<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCombiner")
            .field("types", &self.plan.registry().len())
            .field("external", &self.external)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
