//! # tierq-engine
//!
//! The runnable layer of tierq: configuration, a persistent worker-group
//! runtime driving a [`TieredCombiner`](tierq_core::TieredCombiner), and run
//! reports.
//!
//! ## Modules
//!
//! - [`config`] - Configuration options
//! - [`runtime`] - Worker groups, task handlers, and the run loop
//! - [`report`] - What a run did

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod report;
pub mod runtime;

pub use config::Config;
pub use report::{RunReport, TypeCount};
pub use runtime::{Runtime, TaskScope};
