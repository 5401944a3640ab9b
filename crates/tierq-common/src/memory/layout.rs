//! Shared-memory layout planning for staging queues.
//!
//! Given an ordered list of task types, each tagged with a [`SizingPolicy`],
//! and a total byte budget, the planner computes every queue's record
//! capacity, its 16-byte aligned size and offset within the shared region,
//! and the grand total.
//!
//! ```text
//!  offset 0                                                     budget
//!  ┌──────────────────┬──────────────────┬──────────────────┬────────┐
//!  │ hdr │ records... │ hdr │ records... │ hdr │ records... │ unused │
//!  └──────────────────┴──────────────────┴──────────────────┴────────┘
//!    Count(n)            Share(1)           Share(1)
//! ```
//!
//! Fixed entries (`Count`, `Bytes`) are sized first; whatever remains is split
//! between `Share` entries in proportion to their ratios, each share rounded
//! down to the alignment so the total can never exceed the budget.
//!
//! The algorithm is a `const fn`, so a layout declared as a constant is
//! checked by the compiler:
//!
//! ```compile_fail
//! use tierq_common::memory::layout::{plan_const, SizingDirective, SizingPolicy, LayoutTable};
//! use tierq_common::types::TaskTypeId;
//!
//! // 1000 records of 16 bytes cannot fit in 1 KiB.
//! const LAYOUT: LayoutTable<1> = plan_const(
//!     &[SizingDirective::new(TaskTypeId::new(1), 16, SizingPolicy::Count(1000))],
//!     1024,
//! );
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{TaskDescriptor, TaskType, TaskTypeId, WORD_BYTES, record_bytes_of};

/// Bytes reserved at the front of every queue (count, type id, capacity, record words).
pub const HEADER_BYTES: u32 = 16;

/// Header size in words.
pub const HEADER_WORDS: u32 = HEADER_BYTES / WORD_BYTES;

/// Alignment of every queue's byte range.
pub const ALIGN: u32 = 16;

/// Largest record size the planner accepts.
pub const MAX_RECORD_BYTES: u32 = u32::MAX - (WORD_BYTES - 1);

const ALIGN_MASK: u64 = ALIGN as u64 - 1;

/// Rounds `bytes` up to the queue alignment.
#[must_use]
pub const fn align_up(bytes: u64) -> u64 {
    (bytes + ALIGN_MASK) & !ALIGN_MASK
}

/// Rounds `bytes` down to the queue alignment.
#[must_use]
pub const fn align_down(bytes: u64) -> u64 {
    bytes & !ALIGN_MASK
}

/// How a queue's size is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizingPolicy {
    /// Exactly this many records.
    Count(u32),
    /// Exactly this many bytes (rounded up to the alignment), header included.
    Bytes(u32),
    /// A share of the memory left after fixed entries, weighted by this ratio.
    Share(u32),
}

impl SizingPolicy {
    /// Returns whether the size is known without looking at other entries.
    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        !matches!(self, Self::Share(_))
    }
}

/// Planner input for one task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SizingDirective {
    /// Task type the queue belongs to.
    pub type_id: TaskTypeId,
    /// Record size in bytes, word-rounded.
    pub record_bytes: u32,
    /// Sizing policy.
    pub policy: SizingPolicy,
}

impl SizingDirective {
    /// Creates a directive; `record_bytes` is rounded up to whole words.
    ///
    /// A size with no word-rounded `u32` value is kept as given and rejected
    /// by the planner with [`LayoutError::RecordTooLarge`].
    #[must_use]
    pub const fn new(type_id: TaskTypeId, record_bytes: u32, policy: SizingPolicy) -> Self {
        let record_bytes = match record_bytes.checked_next_multiple_of(WORD_BYTES) {
            Some(rounded) => rounded,
            None => record_bytes,
        };
        Self {
            type_id,
            record_bytes,
            policy,
        }
    }

    /// Creates a directive for a described task.
    #[must_use]
    pub const fn for_task(desc: &TaskDescriptor, policy: SizingPolicy) -> Self {
        Self::new(desc.id, desc.record_bytes, policy)
    }

    /// A queue of `T` holding exactly `count` records.
    #[must_use]
    pub const fn count<T: TaskType>(count: u32) -> Self {
        Self::new(T::ID, record_bytes_of::<T::Data>(), SizingPolicy::Count(count))
    }

    /// A queue of `T` occupying exactly `bytes` bytes.
    #[must_use]
    pub const fn bytes<T: TaskType>(bytes: u32) -> Self {
        Self::new(T::ID, record_bytes_of::<T::Data>(), SizingPolicy::Bytes(bytes))
    }

    /// A queue of `T` taking `ratio` shares of the remaining memory.
    #[must_use]
    pub const fn share<T: TaskType>(ratio: u32) -> Self {
        Self::new(T::ID, record_bytes_of::<T::Data>(), SizingPolicy::Share(ratio))
    }
}

/// Where one queue lives in the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Placement {
    /// Task type the queue belongs to.
    pub type_id: TaskTypeId,
    /// Policy the entry was planned with.
    pub policy: SizingPolicy,
    /// Record size in bytes.
    pub record_bytes: u32,
    /// Number of records the queue holds.
    pub capacity: u32,
    /// Byte offset of the header within the region.
    pub offset: u32,
    /// Bytes owned by the queue, header included.
    pub size: u32,
}

impl Placement {
    const EMPTY: Self = Self {
        type_id: TaskTypeId::new(0),
        policy: SizingPolicy::Count(0),
        record_bytes: 0,
        capacity: 0,
        offset: 0,
        size: 0,
    };

    /// Word offset of the header.
    #[must_use]
    pub const fn header_word(&self) -> u32 {
        self.offset / WORD_BYTES
    }

    /// Word offset of the first record slot.
    #[must_use]
    pub const fn records_word(&self) -> u32 {
        self.header_word() + HEADER_WORDS
    }

    /// Words per record.
    #[must_use]
    pub const fn record_words(&self) -> u32 {
        self.record_bytes / WORD_BYTES
    }

    /// One past the last byte owned by the queue.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// Layout planning failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// The planned layout does not fit the budget.
    #[error("layout needs {required} bytes but the budget is {budget}")]
    BudgetExceeded {
        /// Bytes the fixed entries alone require.
        required: u64,
        /// Available bytes.
        budget: u32,
    },

    /// An entry would not hold a single record.
    #[error("queue for {0} cannot hold a single record")]
    EmptyBuffer(TaskTypeId),

    /// An entry has a zero-sized record.
    #[error("{0} has a zero-sized record")]
    ZeroRecord(TaskTypeId),

    /// A task type appears twice.
    #[error("{0} appears twice in the layout")]
    DuplicateType(TaskTypeId),

    /// An entry's record is larger than any queue can address.
    #[error("{0} has a record too large to place")]
    RecordTooLarge(TaskTypeId),
}

const fn capacity_for(size: u64, record_bytes: u32) -> u64 {
    if size <= HEADER_BYTES as u64 {
        0
    } else {
        (size - HEADER_BYTES as u64) / record_bytes as u64
    }
}

const fn count_size(count: u32, record_bytes: u32) -> u64 {
    align_up(count as u64 * record_bytes as u64 + HEADER_BYTES as u64)
}

/// Plans `directives` into `out`, returning the total bytes used.
///
/// `out` must be at least as long as `directives`.
const fn plan_into(
    directives: &[SizingDirective],
    budget: u32,
    out: &mut [Placement],
) -> Result<u32, LayoutError> {
    // First pass: validate, sum fixed sizes and share weights.
    let mut fixed: u64 = 0;
    let mut weight: u64 = 0;
    let mut i = 0;
    while i < directives.len() {
        let d = directives[i];
        if d.record_bytes == 0 {
            return Err(LayoutError::ZeroRecord(d.type_id));
        }
        if d.record_bytes > MAX_RECORD_BYTES {
            return Err(LayoutError::RecordTooLarge(d.type_id));
        }
        let mut j = 0;
        while j < i {
            if directives[j].type_id.as_u32() == d.type_id.as_u32() {
                return Err(LayoutError::DuplicateType(d.type_id));
            }
            j += 1;
        }
        let size = match d.policy {
            SizingPolicy::Count(0) | SizingPolicy::Share(0) => {
                return Err(LayoutError::EmptyBuffer(d.type_id));
            }
            SizingPolicy::Count(n) => count_size(n, d.record_bytes),
            SizingPolicy::Bytes(b) => {
                let size = align_up(b as u64);
                if capacity_for(size, d.record_bytes) == 0 {
                    return Err(LayoutError::EmptyBuffer(d.type_id));
                }
                size
            }
            SizingPolicy::Share(r) => {
                weight += r as u64;
                0
            }
        };
        fixed = match fixed.checked_add(size) {
            Some(sum) => sum,
            None => u64::MAX,
        };
        i += 1;
    }
    if fixed > budget as u64 {
        return Err(LayoutError::BudgetExceeded {
            required: fixed,
            budget,
        });
    }

    // Second pass: place entries, splitting the remainder between shares.
    let remaining = budget as u64 - fixed;
    let mut offset: u64 = 0;
    i = 0;
    while i < directives.len() {
        let d = directives[i];
        let (size, capacity) = match d.policy {
            SizingPolicy::Count(n) => (count_size(n, d.record_bytes), n as u64),
            SizingPolicy::Bytes(b) => {
                let size = align_up(b as u64);
                (size, capacity_for(size, d.record_bytes))
            }
            SizingPolicy::Share(r) => {
                let size = align_down(remaining * r as u64 / weight);
                let capacity = capacity_for(size, d.record_bytes);
                if capacity == 0 {
                    return Err(LayoutError::EmptyBuffer(d.type_id));
                }
                (size, capacity)
            }
        };
        out[i] = Placement {
            type_id: d.type_id,
            policy: d.policy,
            record_bytes: d.record_bytes,
            capacity: capacity as u32,
            offset: offset as u32,
            size: size as u32,
        };
        offset += size;
        i += 1;
    }
    if offset > budget as u64 {
        return Err(LayoutError::BudgetExceeded {
            required: offset,
            budget,
        });
    }
    Ok(offset as u32)
}

/// A layout computed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTable<const N: usize> {
    /// One placement per directive, in directive order.
    pub placements: [Placement; N],
    /// Bytes used.
    pub total: u32,
    /// Bytes available.
    pub budget: u32,
}

/// Plans a fixed-size directive list in a const context.
pub const fn plan_table<const N: usize>(
    directives: &[SizingDirective; N],
    budget: u32,
) -> Result<LayoutTable<N>, LayoutError> {
    let mut placements = [Placement::EMPTY; N];
    match plan_into(directives, budget, &mut placements) {
        Ok(total) => Ok(LayoutTable {
            placements,
            total,
            budget,
        }),
        Err(e) => Err(e),
    }
}

/// Like [`plan_table`], but an invalid layout stops compilation when used in
/// a `const` item.
#[must_use]
pub const fn plan_const<const N: usize>(
    directives: &[SizingDirective; N],
    budget: u32,
) -> LayoutTable<N> {
    match plan_table(directives, budget) {
        Ok(table) => table,
        Err(LayoutError::BudgetExceeded { .. }) => {
            panic!("queue layout exceeds the shared-memory budget")
        }
        Err(LayoutError::EmptyBuffer(_)) => panic!("a queue in the layout cannot hold one record"),
        Err(LayoutError::ZeroRecord(_)) => panic!("a queue in the layout has a zero-sized record"),
        Err(LayoutError::DuplicateType(_)) => panic!("a task type appears twice in the layout"),
        Err(LayoutError::RecordTooLarge(_)) => {
            panic!("a queue in the layout has an oversized record")
        }
    }
}

/// A planned layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layout {
    placements: Vec<Placement>,
    total: u32,
    budget: u32,
}

impl Layout {
    /// All placements in chain order.
    #[must_use]
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Bytes used by all queues.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Bytes available.
    #[must_use]
    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Bytes of the budget left unassigned.
    #[must_use]
    pub fn unused(&self) -> u32 {
        self.budget - self.total
    }

    /// Number of queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.placements.len()
    }

    /// Returns whether the layout has no queues.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    /// Returns the placement of a task type.
    #[must_use]
    pub fn get(&self, type_id: TaskTypeId) -> Option<&Placement> {
        self.placements.iter().find(|p| p.type_id == type_id)
    }
}

impl<const N: usize> From<LayoutTable<N>> for Layout {
    fn from(table: LayoutTable<N>) -> Self {
        Self {
            placements: table.placements.to_vec(),
            total: table.total,
            budget: table.budget,
        }
    }
}

/// Run-time front end of the planner.
///
/// # Example
///
/// ```
/// use tierq_common::memory::layout::{LayoutPlanner, SizingDirective, SizingPolicy};
/// use tierq_common::types::TaskTypeId;
///
/// let layout = LayoutPlanner::new(1024)
///     .with(SizingDirective::new(TaskTypeId::new(1), 4, SizingPolicy::Count(100)))
///     .with(SizingDirective::new(TaskTypeId::new(2), 4, SizingPolicy::Share(1)))
///     .plan()
///     .unwrap();
/// assert!(layout.total() <= 1024);
/// ```
#[derive(Debug, Clone, Default)]
pub struct LayoutPlanner {
    budget: u32,
    directives: Vec<SizingDirective>,
}

impl LayoutPlanner {
    /// Creates a planner for a region of `budget` bytes.
    #[must_use]
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            directives: Vec::new(),
        }
    }

    /// Appends a directive; chain order follows insertion order.
    pub fn with(mut self, directive: SizingDirective) -> Self {
        self.directives.push(directive);
        self
    }

    /// Appends a directive in place.
    pub fn push(&mut self, directive: SizingDirective) {
        self.directives.push(directive);
    }

    /// The directives collected so far.
    #[must_use]
    pub fn directives(&self) -> &[SizingDirective] {
        &self.directives
    }

    /// Computes the layout.
    pub fn plan(&self) -> Result<Layout, LayoutError> {
        Self::plan_directives(&self.directives, self.budget)
    }

    /// Computes the layout of an arbitrary directive list.
    pub fn plan_directives(
        directives: &[SizingDirective],
        budget: u32,
    ) -> Result<Layout, LayoutError> {
        let mut placements = vec![Placement::EMPTY; directives.len()];
        let total = plan_into(directives, budget, &mut placements)?;
        Ok(Layout {
            placements,
            total,
            budget,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn directive(id: u32, record_bytes: u32, policy: SizingPolicy) -> SizingDirective {
        SizingDirective::new(TaskTypeId::new(id), record_bytes, policy)
    }

    #[test]
    fn test_fixed_count_with_two_equal_shares() {
        let layout = LayoutPlanner::new(1024)
            .with(directive(1, 4, SizingPolicy::Count(100)))
            .with(directive(2, 4, SizingPolicy::Share(1)))
            .with(directive(3, 4, SizingPolicy::Share(1)))
            .plan()
            .unwrap();

        let fixed = layout.placements()[0];
        assert_eq!(fixed.capacity, 100);
        assert_eq!(fixed.size, 416);
        assert_eq!(fixed.offset, 0);

        let a = layout.placements()[1];
        let b = layout.placements()[2];
        assert_eq!(a.capacity, b.capacity);
        assert_eq!(a.size, b.size);
        assert_eq!(a.size % ALIGN, 0);
        assert_eq!(a.size + b.size, 1024 - fixed.size);
        assert_eq!(a.capacity, (a.size - HEADER_BYTES) / 4);
        assert_eq!(a.offset, 416);
        assert_eq!(b.offset, 416 + a.size);
        assert_eq!(layout.total(), 1024);
    }

    #[test]
    fn test_fixed_bytes() {
        let layout = LayoutPlanner::new(4096)
            .with(directive(1, 12, SizingPolicy::Bytes(1000)))
            .plan()
            .unwrap();
        let p = layout.placements()[0];
        assert_eq!(p.size, 1008);
        assert_eq!(p.capacity, (1008 - 16) / 12);
    }

    #[test]
    fn test_share_ratios() {
        let layout = LayoutPlanner::new(1600)
            .with(directive(1, 8, SizingPolicy::Share(3)))
            .with(directive(2, 8, SizingPolicy::Share(1)))
            .plan()
            .unwrap();
        assert_eq!(layout.placements()[0].size, 1200);
        assert_eq!(layout.placements()[1].size, 400);
        assert!(layout.total() <= 1600);
    }

    #[test]
    fn test_share_rounds_down() {
        let layout = LayoutPlanner::new(1000)
            .with(directive(1, 4, SizingPolicy::Share(1)))
            .with(directive(2, 4, SizingPolicy::Share(1)))
            .with(directive(3, 4, SizingPolicy::Share(1)))
            .plan()
            .unwrap();
        // 1000 / 3 = 333 -> 320
        for p in layout.placements() {
            assert_eq!(p.size, 320);
        }
        assert_eq!(layout.unused(), 40);
    }

    #[test]
    fn test_budget_exceeded() {
        let err = LayoutPlanner::new(256)
            .with(directive(1, 16, SizingPolicy::Count(100)))
            .plan()
            .unwrap_err();
        assert_eq!(
            err,
            LayoutError::BudgetExceeded {
                required: 1616,
                budget: 256
            }
        );
    }

    #[test]
    fn test_empty_buffers_rejected() {
        let err = LayoutPlanner::new(1024)
            .with(directive(1, 4, SizingPolicy::Count(0)))
            .plan()
            .unwrap_err();
        assert_eq!(err, LayoutError::EmptyBuffer(TaskTypeId::new(1)));

        let err = LayoutPlanner::new(1024)
            .with(directive(1, 64, SizingPolicy::Bytes(32)))
            .plan()
            .unwrap_err();
        assert_eq!(err, LayoutError::EmptyBuffer(TaskTypeId::new(1)));

        // Fixed entries consume everything; the share gets nothing.
        let err = LayoutPlanner::new(416)
            .with(directive(1, 4, SizingPolicy::Count(100)))
            .with(directive(2, 4, SizingPolicy::Share(1)))
            .plan()
            .unwrap_err();
        assert_eq!(err, LayoutError::EmptyBuffer(TaskTypeId::new(2)));
    }

    #[test]
    fn test_duplicate_and_zero_record() {
        let err = LayoutPlanner::new(1024)
            .with(directive(1, 4, SizingPolicy::Count(4)))
            .with(directive(1, 4, SizingPolicy::Count(4)))
            .plan()
            .unwrap_err();
        assert_eq!(err, LayoutError::DuplicateType(TaskTypeId::new(1)));

        let err = LayoutPlanner::new(1024)
            .with(directive(5, 0, SizingPolicy::Count(4)))
            .plan()
            .unwrap_err();
        assert_eq!(err, LayoutError::ZeroRecord(TaskTypeId::new(5)));
    }

    #[test]
    fn test_record_bytes_word_rounded() {
        let d = directive(1, 10, SizingPolicy::Count(1));
        assert_eq!(d.record_bytes, 12);
        let d = directive(1, MAX_RECORD_BYTES, SizingPolicy::Count(1));
        assert_eq!(d.record_bytes, MAX_RECORD_BYTES);
    }

    #[test]
    fn test_oversized_record_is_an_error() {
        for bytes in [MAX_RECORD_BYTES + 1, u32::MAX] {
            let d = directive(4, bytes, SizingPolicy::Count(1));
            assert_eq!(d.record_bytes, bytes);
            let err = LayoutPlanner::new(1024).with(d).plan().unwrap_err();
            assert_eq!(err, LayoutError::RecordTooLarge(TaskTypeId::new(4)));
        }
        // Still too large once rounded, but reported as a budget problem.
        let d = directive(5, MAX_RECORD_BYTES, SizingPolicy::Count(1));
        let err = LayoutPlanner::new(1024).with(d).plan().unwrap_err();
        assert!(matches!(err, LayoutError::BudgetExceeded { .. }));
    }

    #[test]
    fn test_const_table_matches_runtime() {
        const DIRECTIVES: [SizingDirective; 3] = [
            SizingDirective::new(TaskTypeId::new(1), 8, SizingPolicy::Count(32)),
            SizingDirective::new(TaskTypeId::new(2), 16, SizingPolicy::Share(2)),
            SizingDirective::new(TaskTypeId::new(3), 4, SizingPolicy::Share(1)),
        ];
        const TABLE: LayoutTable<3> = plan_const(&DIRECTIVES, 4096);

        let runtime = LayoutPlanner::plan_directives(&DIRECTIVES, 4096).unwrap();
        assert_eq!(Layout::from(TABLE), runtime);
        assert_eq!(TABLE.total, runtime.total());
    }

    #[test]
    fn test_plan_table_reports_errors() {
        let result = plan_table(
            &[SizingDirective::new(TaskTypeId::new(1), 4, SizingPolicy::Count(1000))],
            64,
        );
        assert!(matches!(result, Err(LayoutError::BudgetExceeded { .. })));
    }

    #[test]
    fn test_placement_word_offsets() {
        let layout = LayoutPlanner::new(1024)
            .with(directive(1, 8, SizingPolicy::Count(3)))
            .with(directive(2, 8, SizingPolicy::Count(3)))
            .plan()
            .unwrap();
        let second = layout.placements()[1];
        assert_eq!(second.offset, 48);
        assert_eq!(second.header_word(), 12);
        assert_eq!(second.records_word(), 16);
        assert_eq!(second.record_words(), 2);
        assert_eq!(layout.get(TaskTypeId::new(2)), Some(&second));
        assert!(layout.get(TaskTypeId::new(9)).is_none());
    }

    fn arb_policy() -> impl Strategy<Value = SizingPolicy> {
        prop_oneof![
            (1u32..64).prop_map(SizingPolicy::Count),
            (64u32..1024).prop_map(SizingPolicy::Bytes),
            (1u32..8).prop_map(SizingPolicy::Share),
        ]
    }

    fn arb_directives() -> impl Strategy<Value = Vec<SizingDirective>> {
        prop::collection::vec((1u32..16, arb_policy()), 1..6).prop_map(|entries| {
            entries
                .into_iter()
                .enumerate()
                .map(|(i, (words, policy))| directive(i as u32, words * 4, policy))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_plan_is_pure(directives in arb_directives(), budget in 256u32..65536) {
            let first = LayoutPlanner::plan_directives(&directives, budget);
            let second = LayoutPlanner::plan_directives(&directives, budget);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_layout_fits_and_never_overlaps(directives in arb_directives(), budget in 256u32..65536) {
            if let Ok(layout) = LayoutPlanner::plan_directives(&directives, budget) {
                prop_assert!(layout.total() <= budget);
                let mut cursor = 0;
                for p in layout.placements() {
                    prop_assert_eq!(p.offset, cursor);
                    prop_assert_eq!(p.offset % ALIGN, 0);
                    prop_assert_eq!(p.size % ALIGN, 0);
                    prop_assert!(p.capacity >= 1);
                    prop_assert!(p.capacity * p.record_bytes + HEADER_BYTES <= p.size);
                    cursor = p.end();
                }
                prop_assert_eq!(cursor, layout.total());
            }
        }
    }
}
