//! # tierq
//!
//! Two-tier task staging queues for cooperative worker groups.
//!
//! Every worker group keeps a small, fast chain of per-type LIFO buffers in
//! its own shared memory and falls back to one large queue shared by all
//! groups. Start with [`Runtime`] to run task handlers on persistent groups,
//! or use [`TieredCombiner`] directly when you drive the groups yourself.
//!
//! ## Quick Start
//!
//! ```rust
//! use tierq::{ChainPlan, Config, Runtime, TaskType, TaskTypeId};
//!
//! struct Split;
//!
//! impl TaskType for Split {
//!     type Data = [u32; 2]; // (start, len)
//!     const ID: TaskTypeId = TaskTypeId::new(1);
//!     const NAME: &'static str = "split";
//! }
//!
//! let plan = ChainPlan::builder(4096).share::<Split>(1).build()?;
//! let mut runtime = Runtime::new(Config::default().with_groups(2).with_lanes(8), plan)?;
//! runtime.register::<Split, _>(|scope, &[start, len]| {
//!     if len > 1 {
//!         let half = len / 2;
//!         scope.enqueue::<Split>(&[start, half])?;
//!         scope.enqueue::<Split>(&[start + half, len - half])?;
//!     }
//!     Ok(())
//! })?;
//! runtime.seed::<Split>([[0, 64]])?;
//!
//! let report = runtime.run()?;
//! assert_eq!(report.total_executed(), 127);
//! # Ok::<(), tierq::Error>(())
//! ```

// Re-export the runtime API
pub use tierq_engine::{Config, RunReport, Runtime, TaskScope, TypeCount};

// Re-export the queue tiers for callers driving groups themselves
pub use tierq_core::group::{ChanceSource, Lane, SeededChance, SoloLane, ThreadGroup};
pub use tierq_core::queue::{
    ChainPlan, ChainPlanBuilder, CombinerConfig, EnqueueMode, ExternalQueue, GlobalQueue,
    GroupQueues, QueueChain, Residual, ResidualPolicy, StagingBuffer, StatsSnapshot,
    TieredCombiner, WorkBatch,
};

// Re-export core types - you'll need these to declare task types
pub use tierq_common::{
    Error, GroupId, LayoutPlanner, QueueError, Result, SizingDirective, SizingPolicy, TaskType,
    TaskTypeId, WorkIndex,
};
