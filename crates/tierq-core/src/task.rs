//! Registry of the task types a queue chain serves.
//!
//! The registry fixes the chain order: position `i` in the registry is queue
//! `i` of every group's chain, and dequeue-any scans in this order.

use tierq_common::types::{TaskDescriptor, TaskType, TaskTypeId};
use tierq_common::utils::hash::{FastHashMap, map_with_capacity};
use tierq_common::QueueError;

/// Ordered set of task types with id lookup.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Vec<TaskDescriptor>,
    index: FastHashMap<TaskTypeId, usize>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry from descriptors in chain order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DuplicateTaskType`] if an id repeats.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = TaskDescriptor>,
    ) -> Result<Self, QueueError> {
        let descriptors = descriptors.into_iter();
        let mut registry = Self {
            tasks: Vec::with_capacity(descriptors.size_hint().0),
            index: map_with_capacity(descriptors.size_hint().0),
        };
        for desc in descriptors {
            registry.register_descriptor(desc)?;
        }
        Ok(registry)
    }

    /// Appends `T` to the chain and returns its position.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DuplicateTaskType`] if `T::ID` is already present.
    pub fn register<T: TaskType>(&mut self) -> Result<usize, QueueError> {
        self.register_descriptor(TaskDescriptor::of::<T>())
    }

    /// Appends a descriptor and returns its position.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DuplicateTaskType`] if the id is already present.
    pub fn register_descriptor(&mut self, desc: TaskDescriptor) -> Result<usize, QueueError> {
        if self.index.contains_key(&desc.id) {
            return Err(QueueError::DuplicateTaskType(desc.id));
        }
        let pos = self.tasks.len();
        self.index.insert(desc.id, pos);
        self.tasks.push(desc);
        Ok(pos)
    }

    /// Chain position of `id`.
    #[must_use]
    pub fn position(&self, id: TaskTypeId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// Chain position of `T`, checking that its record matches the one
    /// registered under `T::ID`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownTaskType`] or [`QueueError::RecordSize`].
    pub fn position_of<T: TaskType>(&self) -> Result<usize, QueueError> {
        let pos = self
            .position(T::ID)
            .ok_or(QueueError::UnknownTaskType(T::ID))?;
        let expected = self.tasks[pos].record_words();
        let found = TaskDescriptor::of::<T>().record_words();
        if expected != found {
            return Err(QueueError::RecordSize {
                task: T::ID,
                expected,
                found,
            });
        }
        Ok(pos)
    }

    /// Descriptor for `id`.
    #[must_use]
    pub fn get(&self, id: TaskTypeId) -> Option<&TaskDescriptor> {
        self.position(id).map(|pos| &self.tasks[pos])
    }

    /// Descriptor at chain position `pos`.
    #[must_use]
    pub fn at(&self, pos: usize) -> Option<&TaskDescriptor> {
        self.tasks.get(pos)
    }

    /// Descriptors in chain order.
    #[must_use]
    pub fn descriptors(&self) -> &[TaskDescriptor] {
        &self.tasks
    }

    /// Iterates descriptors in chain order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.iter()
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
