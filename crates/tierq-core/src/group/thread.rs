//! Worker groups backed by OS threads.
//!
//! Collectives go through three rotating padded slots. Collective `k` uses
//! slot `k % 3`; after its barrier lane 0 clears slot `(k + 2) % 3`, which
//! every lane finished reading before entering collective `k` and nobody
//! writes again until after the next barrier. One barrier per collective is
//! therefore enough.

use std::cell::Cell;
use std::sync::Barrier;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use tierq_common::QueueError;

use super::{Lane, MAX_WIDTH};

/// A group of `width` lanes, each running on its own thread.
///
/// # Example
///
/// ```
/// use tierq_core::group::{Lane, ThreadGroup};
///
/// let mut group = ThreadGroup::new(4).unwrap();
/// let masks = group.run(|lane| lane.ballot(lane.id() % 2 == 0));
/// assert!(masks.iter().all(|&m| m == 0b0101));
/// ```
pub struct ThreadGroup {
    width: u32,
    barrier: Barrier,
    slots: [CachePadded<AtomicU64>; 3],
}

impl ThreadGroup {
    /// Creates a group of `width` lanes.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidGroupWidth`] unless `width` is in `1..=64`.
    pub fn new(width: u32) -> Result<Self, QueueError> {
        if width == 0 || width > MAX_WIDTH {
            return Err(QueueError::InvalidGroupWidth(width));
        }
        Ok(Self {
            width,
            barrier: Barrier::new(width as usize),
            slots: Default::default(),
        })
    }

    /// Number of lanes.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Runs `body` once on every lane and returns the results in lane order.
    ///
    /// A panic on any lane is propagated after all lanes have stopped. Lanes
    /// still waiting in a collective when a sibling panics never return, so
    /// bodies must not panic between collectives.
    pub fn run<F, R>(&mut self, body: F) -> Vec<R>
    where
        F: Fn(&GroupLane<'_>) -> R + Sync,
        R: Send,
    {
        for slot in &self.slots {
            slot.store(0, Ordering::Relaxed);
        }
        let group = &*self;
        let body = &body;
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..group.width)
                .map(|id| scope.spawn(move || body(&GroupLane::new(group, id))))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        })
    }
}

impl std::fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("width", &self.width)
            .finish_non_exhaustive()
    }
}

/// One lane of a running [`ThreadGroup`].
pub struct GroupLane<'g> {
    group: &'g ThreadGroup,
    id: u32,
    epoch: Cell<u64>,
}

impl<'g> GroupLane<'g> {
    fn new(group: &'g ThreadGroup, id: u32) -> Self {
        Self {
            group,
            id,
            epoch: Cell::new(0),
        }
    }

    /// Runs one slot-based collective: `publish` writes into the current
    /// slot, then all lanes meet and read it back.
    fn collective(&self, publish: impl FnOnce(&AtomicU64)) -> u64 {
        let epoch = self.epoch.get();
        self.epoch.set(epoch + 1);
        let slots = &self.group.slots;
        let slot = &slots[(epoch % 3) as usize];

        publish(slot);
        self.group.barrier.wait();
        let value = slot.load(Ordering::Acquire);
        if self.id == 0 {
            slots[((epoch + 2) % 3) as usize].store(0, Ordering::Relaxed);
        }
        value
    }
}

impl Lane for GroupLane<'_> {
    #[inline]
    fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    fn width(&self) -> u32 {
        self.group.width
    }

    fn barrier(&self) {
        self.group.barrier.wait();
    }

    fn ballot(&self, predicate: bool) -> u64 {
        let bit = u64::from(predicate) << self.id;
        self.collective(|slot| {
            if bit != 0 {
                slot.fetch_or(bit, Ordering::AcqRel);
            }
        })
    }

    fn broadcast(&self, value: u32, src: u32) -> u32 {
        let id = self.id;
        self.collective(|slot| {
            if id == src {
                slot.store(u64::from(value), Ordering::Release);
            }
        }) as u32
    }
}
