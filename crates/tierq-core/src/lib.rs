//! # tierq-core
//!
//! Core layer for tierq: cooperative worker groups, staging buffers, queue
//! chains, and the two-tier combiner.
//!
//! This crate provides the queueing substrate itself. It depends only on
//! `tierq-common`.
//!
//! ## Modules
//!
//! - [`group`] - Worker groups, lanes, and group collectives
//! - [`task`] - Task type registry
//! - [`queue`] - Staging buffers, chains, the external tier, and the combiner

#![warn(missing_docs)]

pub mod group;
pub mod queue;
pub mod task;

// Re-export commonly used types
pub use group::{ChanceSource, GroupLane, Lane, SeededChance, SoloLane, ThreadGroup};
pub use queue::{
    ChainPlan, CombinerConfig, EnqueueMode, ExternalQueue, GlobalQueue, GroupQueues, QueueChain,
    ResidualPolicy, StagingBuffer, TieredCombiner, WorkBatch,
};
pub use task::TaskRegistry;
