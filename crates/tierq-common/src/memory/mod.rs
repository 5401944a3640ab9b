//! Shared-memory management for staging queues.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                SharedRegion (one per group)              │
//! │  ┌─────────────┬─────────────┬─────────────┬──────────┐  │
//! │  │ Queue A     │ Queue B     │ Queue C     │ unused   │  │
//! │  │ Count(100)  │ Share(1)    │ Share(1)    │          │  │
//! │  └─────────────┴─────────────┴─────────────┴──────────┘  │
//! │        offsets and capacities from the LayoutPlanner      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`layout`] - Budget partitioning (const and run-time planners)
//! - [`region`] - Word-addressed memory and record encoding

pub mod layout;
pub mod region;

pub use layout::{
    ALIGN, HEADER_BYTES, HEADER_WORDS, Layout, LayoutError, LayoutPlanner, LayoutTable, Placement,
    SizingDirective, SizingPolicy, plan_const, plan_table,
};
pub use region::{RecordWords, SharedRegion, decode_record, encode_record};
