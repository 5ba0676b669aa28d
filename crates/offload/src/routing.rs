//! Task-worker selection
//!
//! Chooses a destination worker for each dispatch: an explicit target wins,
//! otherwise the configured policy (round-robin cursor or the transport's
//! idle signal) decides. Selection only affects load distribution; it has no
//! bearing on completion correlation.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Selection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    /// The task-worker pool is empty; checked before any packing work
    #[error("no task workers configured")]
    NoWorkersAvailable,

    /// Explicit target outside `[0, pool_size)`
    #[error("worker {requested} out of range (pool size {pool_size})")]
    WorkerOutOfRange { requested: usize, pool_size: usize },
}

/// Worker selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectPolicy {
    /// Rotate through the pool with a shared cursor
    RoundRobin,

    /// Prefer a currently-idle worker, falling back to round-robin
    Idle,
}

/// Selects a destination task worker for each dispatch.
pub struct WorkerSelector {
    pool_size: usize,
    policy: SelectPolicy,
    cursor: AtomicUsize,
}

impl WorkerSelector {
    /// Create a selector over a pool of `pool_size` workers
    pub fn new(pool_size: usize, policy: SelectPolicy) -> Self {
        Self {
            pool_size,
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pool size this selector is bounded by
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Choose a destination worker.
    ///
    /// `explicit` is the caller-supplied target, if any; `idle` is the
    /// transport's idle-worker hint, consulted only under
    /// [`SelectPolicy::Idle`].
    pub fn select(
        &self,
        explicit: Option<usize>,
        idle: Option<usize>,
    ) -> Result<usize, SelectError> {
        if self.pool_size == 0 {
            return Err(SelectError::NoWorkersAvailable);
        }

        if let Some(requested) = explicit {
            if requested >= self.pool_size {
                return Err(SelectError::WorkerOutOfRange {
                    requested,
                    pool_size: self.pool_size,
                });
            }
            return Ok(requested);
        }

        if self.policy == SelectPolicy::Idle {
            if let Some(worker) = idle {
                if worker < self.pool_size {
                    return Ok(worker);
                }
            }
            // nobody idle: fall back to rotation
        }

        Ok(self.cursor.fetch_add(1, Ordering::Relaxed) % self.pool_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pool_is_rejected() {
        let selector = WorkerSelector::new(0, SelectPolicy::RoundRobin);
        assert_eq!(
            selector.select(None, None),
            Err(SelectError::NoWorkersAvailable)
        );
        // explicit targets do not bypass the empty-pool check
        assert_eq!(
            selector.select(Some(0), None),
            Err(SelectError::NoWorkersAvailable)
        );
    }

    #[test]
    fn test_explicit_target_wins() {
        let selector = WorkerSelector::new(4, SelectPolicy::RoundRobin);
        assert_eq!(selector.select(Some(2), None), Ok(2));
        assert_eq!(selector.select(Some(0), None), Ok(0));
    }

    #[test]
    fn test_explicit_target_out_of_range() {
        let selector = WorkerSelector::new(4, SelectPolicy::RoundRobin);
        assert_eq!(
            selector.select(Some(4), None),
            Err(SelectError::WorkerOutOfRange {
                requested: 4,
                pool_size: 4
            })
        );
    }

    #[test]
    fn test_round_robin_rotates_through_pool() {
        let selector = WorkerSelector::new(3, SelectPolicy::RoundRobin);
        let picks: Vec<usize> = (0..6).map(|_| selector.select(None, None).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_idle_policy_prefers_idle_worker() {
        let selector = WorkerSelector::new(3, SelectPolicy::Idle);
        assert_eq!(selector.select(None, Some(2)), Ok(2));
    }

    #[test]
    fn test_idle_policy_falls_back_to_round_robin() {
        let selector = WorkerSelector::new(3, SelectPolicy::Idle);
        assert_eq!(selector.select(None, None), Ok(0));
        assert_eq!(selector.select(None, None), Ok(1));
        // an out-of-range idle hint is ignored, not an error
        assert_eq!(selector.select(None, Some(9)), Ok(2));
    }
}
