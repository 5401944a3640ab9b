//! # tierq-common
//!
//! Foundation layer for tierq: identifiers, task descriptors, shared-memory
//! layout planning, and errors.
//!
//! This crate provides the building blocks used by every other tierq crate.
//! It has no internal dependencies and should be kept minimal.
//!
//! ## Modules
//!
//! - [`types`] - Core type definitions (TaskTypeId, WorkIndex, TaskType)
//! - [`memory`] - Word-addressed shared regions and the layout planner
//! - [`utils`] - Utility functions and helpers (hashing, errors)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod memory;
pub mod types;
pub mod utils;

// Re-export commonly used types at crate root
pub use memory::layout::{Layout, LayoutError, LayoutPlanner, SizingDirective, SizingPolicy};
pub use memory::region::SharedRegion;
pub use types::{GroupId, TaskDescriptor, TaskType, TaskTypeId, Tier, WorkIndex};
pub use utils::error::{Error, QueueError, Result};
