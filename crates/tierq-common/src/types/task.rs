//! Task type descriptors.
//!
//! A task type is a static description of one kind of work item: its payload
//! record, a unique id, and the execution facts the dequeue side needs to cap
//! batch sizes. Payloads are plain `bytemuck::Pod` records so they can be
//! copied word-by-word into shared memory.

use bytemuck::Pod;
use serde::Serialize;

use super::TaskTypeId;

/// Size of one shared-memory word in bytes.
pub const WORD_BYTES: u32 = 4;

/// Returns the size of `T` rounded up to whole words (never less than one word).
#[must_use]
pub const fn record_bytes_of<T>() -> u32 {
    let bytes = size_of::<T>() as u32;
    if bytes == 0 {
        WORD_BYTES
    } else {
        bytes.div_ceil(WORD_BYTES) * WORD_BYTES
    }
}

/// Returns the number of words a record of `T` occupies.
#[must_use]
pub const fn record_words_of<T>() -> u32 {
    record_bytes_of::<T>() / WORD_BYTES
}

/// A statically known kind of work item.
///
/// # Example
///
/// ```
/// use tierq_common::types::{TaskType, TaskTypeId};
///
/// struct Blur;
///
/// impl TaskType for Blur {
///     type Data = [u32; 4];
///     const ID: TaskTypeId = TaskTypeId::new(1);
///     const NAME: &'static str = "blur";
/// }
/// ```
pub trait TaskType: Send + Sync + 'static {
    /// Payload record carried by each work item.
    type Data: Pod + Send + Sync;

    /// Unique id within the active set of task types.
    const ID: TaskTypeId;

    /// Human-readable name for diagnostics.
    const NAME: &'static str;

    /// Lanes that cooperate on one item.
    const THREADS_PER_ITEM: u32 = 1;

    /// Extra shared scratch bytes one item needs while it executes.
    const SHARED_PER_ITEM: u32 = 0;
}

/// Run-time copy of the facts a [`TaskType`] declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskDescriptor {
    /// Task type id.
    pub id: TaskTypeId,
    /// Task type name.
    pub name: &'static str,
    /// Record size in bytes, word-rounded.
    pub record_bytes: u32,
    /// Lanes per item.
    pub threads_per_item: u32,
    /// Extra shared bytes per item.
    pub shared_per_item: u32,
}

impl TaskDescriptor {
    /// Builds the descriptor of `T`.
    #[must_use]
    pub const fn of<T: TaskType>() -> Self {
        Self {
            id: T::ID,
            name: T::NAME,
            record_bytes: record_bytes_of::<T::Data>(),
            threads_per_item: T::THREADS_PER_ITEM,
            shared_per_item: T::SHARED_PER_ITEM,
        }
    }

    /// Record size in words.
    #[must_use]
    pub const fn record_words(&self) -> u32 {
        self.record_bytes / WORD_BYTES
    }

    /// Largest batch of this type a group of `width` lanes can execute at once.
    ///
    /// Returns 0 when the extra shared budget cannot fit a single item, which
    /// means the type is not runnable in that group.
    #[must_use]
    pub fn batch_cap(&self, width: u32, extra_shared_budget: Option<u32>) -> u32 {
        let by_threads = (width / self.threads_per_item.max(1)).max(1);
        match extra_shared_budget {
            Some(budget) if self.shared_per_item > 0 => {
                by_threads.min(budget / self.shared_per_item)
            }
            _ => by_threads,
        }
    }
}
