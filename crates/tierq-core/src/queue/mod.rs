//! Queue tiers.
//!
//! - [`staging`] - One task type's LIFO buffer in group-shared memory
//! - [`chain`] - The ordered set of staging buffers a group owns
//! - [`external`] - The interface of the slower, larger tier
//! - [`global`] - A lock-free reference external tier
//! - [`combiner`] - The two-tier front end with spill and drain policy
//! - [`stats`] - Combiner counters

pub mod chain;
pub mod combiner;
pub mod external;
pub mod global;
pub mod staging;
pub mod stats;

use tierq_common::types::TaskTypeId;

pub use chain::{ChainPlan, ChainPlanBuilder, LocalRead, QueueChain, fill_threshold};
pub use combiner::{
    CombinerConfig, GroupQueues, Residual, ResidualPolicy, TieredCombiner, WorkBatch,
};
pub use external::{BatchCap, ExternalQueue, ExternalStats};
pub use global::GlobalQueue;
pub use staging::{BufferHeader, EnqueueMode, GroupEnqueue, ReadSlice, StagingBuffer};
pub use stats::{CombinerStats, StatsSnapshot};

/// A batch copied out of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    /// Task type of every record in the batch.
    pub type_id: TaskTypeId,
    /// Number of records.
    pub count: u32,
}
