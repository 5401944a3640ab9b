//! Utility functions and helpers.
//!
//! - [`error`] - Unified error types
//! - [`hash`] - Fast hash maps for id lookup tables

pub mod error;
pub mod hash;
