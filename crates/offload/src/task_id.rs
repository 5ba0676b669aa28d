//! Process-local task id allocation
//!
//! Ids are unique within the lifetime of the issuing worker process and embed
//! the owning worker's index, so a task worker can report which originating
//! worker a completion belongs to from the id alone.

use std::sync::atomic::{AtomicI64, Ordering};

/// Correlation key for one dispatched task.
///
/// Unique only within the issuing worker process; collisions across processes
/// are acceptable because correlation lookups are always local.
pub type TaskId = i64;

/// Bits reserved for the owning worker's index in the low end of a task id
const WORKER_BITS: u32 = 16;
const WORKER_MASK: i64 = (1 << WORKER_BITS) - 1;

/// Allocates task ids as `(sequence << 16) | worker_index`.
///
/// The sequence is a wrapping atomic increment; with 47 usable sequence bits
/// an id is never reused while any correlation entry for it can still exist.
pub struct TaskIdAllocator {
    worker_index: u16,
    next_seq: AtomicI64,
}

impl TaskIdAllocator {
    /// Create an allocator owned by the worker at `worker_index`
    pub fn new(worker_index: u16) -> Self {
        Self {
            worker_index,
            next_seq: AtomicI64::new(1),
        }
    }

    /// Allocate the next task id
    pub fn next(&self) -> TaskId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        (seq << WORKER_BITS) | self.worker_index as i64
    }

    /// Recover the worker index an id was issued by
    pub fn source_worker(id: TaskId) -> u16 {
        (id & WORKER_MASK) as u16
    }

    /// Recover the sequence component of an id
    pub fn sequence(id: TaskId) -> i64 {
        id >> WORKER_BITS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_distinct_and_increasing() {
        let alloc = TaskIdAllocator::new(0);
        let a = alloc.next();
        let b = alloc.next();
        let c = alloc.next();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_worker_index_is_recoverable() {
        let alloc = TaskIdAllocator::new(42);
        let id = alloc.next();
        assert_eq!(TaskIdAllocator::source_worker(id), 42);
        assert_eq!(TaskIdAllocator::sequence(id), 1);
    }

    #[test]
    fn test_allocators_for_different_workers_never_collide() {
        let a = TaskIdAllocator::new(1);
        let b = TaskIdAllocator::new(2);
        for _ in 0..100 {
            assert_ne!(a.next(), b.next());
        }
    }
}
