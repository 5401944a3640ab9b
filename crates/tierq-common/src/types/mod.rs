//! Core type definitions for tierq.
//!
//! This module contains the fundamental types shared by every tier:
//! - Identifier types ([`TaskTypeId`], [`GroupId`])
//! - Task descriptors ([`TaskType`], [`TaskDescriptor`])
//! - Tier-tagged work handles ([`WorkIndex`], [`Tier`])

mod id;
mod task;
mod work_index;

pub use id::{GroupId, TaskTypeId};
pub use task::{TaskDescriptor, TaskType, WORD_BYTES, record_bytes_of, record_words_of};
pub use work_index::{Tier, WorkIndex};
