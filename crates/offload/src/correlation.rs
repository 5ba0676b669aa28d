//! Completion correlation
//!
//! This module provides:
//! - [`WaitCell`] - three-state suspend gate (undecided / completed-early /
//!   suspended) so an early completion can never race a caller into a
//!   double-resume
//! - [`FanInGroup`] - bookkeeping for waiting on the conjunction of several
//!   outstanding tasks with a shared deadline
//! - [`CorrelationTable`] - the process-local map from task id to pending
//!   waiter, owned exclusively by the dispatcher
//!
//! Every entry is destroyed exactly once: by successful completion, by the
//! timeout path evicting it, or (for fan-in groups) when the last member
//! arrives. A completion for an id with no entry is expected after a timeout
//! and is dropped by the caller, never treated as an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::envelope::TaskValue;
use crate::task_id::TaskId;

/// Why a task in a fan-in group produced no value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFailure {
    /// The member never reached a task worker (pack or send failed)
    DispatchFailed,

    /// The shared deadline elapsed before the member completed
    TimedOut,
}

/// Outcome of one task in a fan-in group, indexed by submission order.
///
/// This is the single partial-failure representation used everywhere; there
/// is no separate boolean-array shape.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(TaskValue),
    Failed(TaskFailure),
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    /// Borrow the completed value, if any
    pub fn value(&self) -> Option<&TaskValue> {
        match self {
            TaskOutcome::Completed(v) => Some(v),
            TaskOutcome::Failed(_) => None,
        }
    }
}

const UNDECIDED: u8 = 0;
const COMPLETED: u8 = 1;
const SUSPENDED: u8 = 2;

/// Three-state suspend gate between a waiter and its completion.
///
/// The state is decided atomically, so the suspend call can observe
/// "completed before suspend" and return without blocking instead of relying
/// on a flag captured by reference inside a completion callback.
pub struct WaitCell<T> {
    state: AtomicU8,
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> WaitCell<T> {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(UNDECIDED),
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Deliver the value and wake the waiter if it is already suspended.
    ///
    /// Returns `true` if a suspended waiter was woken, `false` if the value
    /// arrived before the waiter suspended.
    pub fn complete(&self, value: T) -> bool {
        *self.slot.lock() = Some(value);
        let prev = self.state.swap(COMPLETED, Ordering::AcqRel);
        if prev == SUSPENDED {
            self.notify.notify_one();
            true
        } else {
            false
        }
    }

    /// Suspend for up to `timeout`, returning the delivered value or `None`
    /// on timeout.
    ///
    /// If the completion already landed, the value is returned without
    /// suspending at all.
    pub async fn wait(&self, timeout: Duration) -> Option<T> {
        if self
            .state
            .compare_exchange(UNDECIDED, SUSPENDED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // completed before we suspended
            return self.slot.lock().take();
        }

        match tokio::time::timeout(timeout, self.notify.notified()).await {
            Ok(_) => self.slot.lock().take(),
            Err(_) => {
                // a completion may have raced the timer
                if self.state.load(Ordering::Acquire) == COMPLETED {
                    self.slot.lock().take()
                } else {
                    None
                }
            }
        }
    }

    /// Whether a value has been delivered
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }
}

impl<T> Default for WaitCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress report from recording one fan-in member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupProgress {
    /// Recorded; other members are still outstanding
    Pending,

    /// This was the last member; the group waiter has been resumed
    Done,

    /// The id does not belong to this group
    UnknownMember,
}

/// Bookkeeping for one fan-in wait: expected ids in submission order, a slot
/// per member, and a remaining-count that resumes the waiter when it reaches
/// zero.
pub struct FanInGroup {
    members: Vec<TaskId>,
    slots: Mutex<Vec<Option<TaskOutcome>>>,
    remaining: AtomicUsize,
    cell: WaitCell<()>,
}

impl FanInGroup {
    /// Create a group expecting every id in `members`
    pub fn new(members: Vec<TaskId>) -> Arc<Self> {
        let count = members.len();
        Arc::new(Self {
            members,
            slots: Mutex::new(vec![None; count]),
            remaining: AtomicUsize::new(count),
            cell: WaitCell::new(),
        })
    }

    /// Member ids in submission order
    pub fn members(&self) -> &[TaskId] {
        &self.members
    }

    fn position(&self, task_id: TaskId) -> Option<usize> {
        self.members.iter().position(|&id| id == task_id)
    }

    pub(crate) fn record(&self, task_id: TaskId, outcome: TaskOutcome) -> GroupProgress {
        let Some(position) = self.position(task_id) else {
            return GroupProgress::UnknownMember;
        };

        {
            let mut slots = self.slots.lock();
            if slots[position].is_some() {
                // already settled (e.g. marked as a dispatch failure)
                return GroupProgress::Pending;
            }
            slots[position] = Some(outcome);
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.cell.complete(());
            GroupProgress::Done
        } else {
            GroupProgress::Pending
        }
    }

    /// Mark a member that never reached a task worker
    pub fn fail_member(&self, task_id: TaskId) {
        self.record(task_id, TaskOutcome::Failed(TaskFailure::DispatchFailed));
    }

    /// Suspend until every member settles or `timeout` elapses.
    ///
    /// Returns `true` if the group completed fully.
    pub async fn wait(&self, timeout: Duration) -> bool {
        self.cell.wait(timeout).await.is_some()
    }

    /// Drain the result slots, marking unsettled members as timed out.
    ///
    /// Call only after the wait has returned and the group has been evicted.
    pub fn collect(&self) -> Vec<TaskOutcome> {
        self.slots
            .lock()
            .iter_mut()
            .map(|slot| {
                slot.take()
                    .unwrap_or(TaskOutcome::Failed(TaskFailure::TimedOut))
            })
            .collect()
    }
}

/// What happened to a delivered completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// A single waiter was resumed with the value
    Resumed,

    /// A fan-in slot was filled; the group is still waiting
    Recorded,

    /// The last fan-in member arrived and the group waiter was resumed
    GroupResumed,

    /// No entry exists for the id (timed out and evicted, or duplicate);
    /// expected, not an error
    Expired,
}

/// Pending-completion context: a single waiter or a member of a fan-in group.
enum PendingEntry {
    Single(Arc<WaitCell<TaskValue>>),
    FanIn(Arc<FanInGroup>),
}

/// Process-local map from task id to pending waiter.
///
/// Owned exclusively by the dispatcher; a single mutex provides the
/// happens-before between dispatch-side registration and completion-side
/// lookup. The lock is never held across an await point.
pub struct CorrelationTable {
    entries: Mutex<HashMap<TaskId, PendingEntry>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a single waiter for `task_id`
    pub fn register_single(&self, task_id: TaskId, cell: Arc<WaitCell<TaskValue>>) {
        let prior = self
            .entries
            .lock()
            .insert(task_id, PendingEntry::Single(cell));
        debug_assert!(prior.is_none(), "task id registered twice");
    }

    /// Register `group` under every one of its member ids
    pub fn register_fan_in(&self, group: &Arc<FanInGroup>) {
        let mut entries = self.entries.lock();
        for &task_id in group.members() {
            let prior = entries.insert(task_id, PendingEntry::FanIn(Arc::clone(group)));
            debug_assert!(prior.is_none(), "task id registered twice");
        }
    }

    /// Deliver a completion value to whatever is waiting on `task_id`.
    ///
    /// Each id's entry is consumed by its first completion; later deliveries
    /// for the same id report [`CompletionStatus::Expired`].
    pub fn complete(&self, task_id: TaskId, value: TaskValue) -> CompletionStatus {
        let entry = self.entries.lock().remove(&task_id);
        match entry {
            Some(PendingEntry::Single(cell)) => {
                cell.complete(value);
                CompletionStatus::Resumed
            }
            Some(PendingEntry::FanIn(group)) => {
                match group.record(task_id, TaskOutcome::Completed(value)) {
                    GroupProgress::Done => CompletionStatus::GroupResumed,
                    GroupProgress::Pending => CompletionStatus::Recorded,
                    GroupProgress::UnknownMember => {
                        warn!(task_id, "completion does not belong to its fan-in group");
                        CompletionStatus::Expired
                    }
                }
            }
            None => CompletionStatus::Expired,
        }
    }

    /// Remove an entry without resuming its waiter (timeout path)
    pub fn evict(&self, task_id: TaskId) -> bool {
        self.entries.lock().remove(&task_id).is_some()
    }

    /// Remove every member of `group` without resuming (timeout path)
    pub fn evict_group(&self, group: &FanInGroup) {
        let mut entries = self.entries.lock();
        for &task_id in group.members() {
            entries.remove(&task_id);
        }
    }

    /// Number of task ids currently awaiting completion
    pub fn pending_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether a live entry exists for `task_id`
    pub fn contains(&self, task_id: TaskId) -> bool {
        self.entries.lock().contains_key(&task_id)
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(b: &[u8]) -> TaskValue {
        TaskValue::Bytes(b.to_vec())
    }

    // ============================================
    // WaitCell
    // ============================================

    #[tokio::test]
    async fn test_wait_cell_completed_before_suspend() {
        let cell: WaitCell<u32> = WaitCell::new();
        assert!(!cell.complete(7), "no waiter was suspended yet");
        assert!(cell.is_completed());

        // the wait must return immediately without suspending
        let value = cell.wait(Duration::from_millis(1)).await;
        assert_eq!(value, Some(7));
    }

    #[tokio::test]
    async fn test_wait_cell_suspend_then_complete() {
        let cell = Arc::new(WaitCell::<u32>::new());
        let waiter = {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move { cell.wait(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.complete(99);

        assert_eq!(waiter.await.expect("join"), Some(99));
    }

    #[tokio::test]
    async fn test_wait_cell_timeout_returns_none() {
        let cell: WaitCell<u32> = WaitCell::new();
        assert_eq!(cell.wait(Duration::from_millis(5)).await, None);
    }

    // ============================================
    // Single waiters
    // ============================================

    #[tokio::test]
    async fn test_single_round_trip_consumes_entry() {
        let table = CorrelationTable::new();
        let cell = Arc::new(WaitCell::new());
        table.register_single(1, Arc::clone(&cell));
        assert_eq!(table.pending_count(), 1);

        assert_eq!(table.complete(1, bytes(b"result")), CompletionStatus::Resumed);
        assert_eq!(table.pending_count(), 0);
        assert_eq!(cell.wait(Duration::from_millis(1)).await, Some(bytes(b"result")));
    }

    #[test]
    fn test_completion_for_unknown_id_expires() {
        let table = CorrelationTable::new();
        assert_eq!(table.complete(404, bytes(b"late")), CompletionStatus::Expired);
    }

    #[tokio::test]
    async fn test_evicted_entry_never_resumes() {
        let table = CorrelationTable::new();
        let cell = Arc::new(WaitCell::new());
        table.register_single(5, Arc::clone(&cell));

        assert!(table.evict(5));
        assert_eq!(table.complete(5, bytes(b"late")), CompletionStatus::Expired);
        assert!(!cell.is_completed());
    }

    // ============================================
    // Fan-in groups
    // ============================================

    #[tokio::test]
    async fn test_fan_in_completes_in_any_order() {
        let table = CorrelationTable::new();
        let group = FanInGroup::new(vec![10, 11, 12]);
        table.register_fan_in(&group);
        assert_eq!(table.pending_count(), 3);

        assert_eq!(table.complete(12, bytes(b"c")), CompletionStatus::Recorded);
        assert_eq!(table.complete(10, bytes(b"a")), CompletionStatus::Recorded);
        assert_eq!(table.complete(11, bytes(b"b")), CompletionStatus::GroupResumed);
        assert_eq!(table.pending_count(), 0);

        assert!(group.wait(Duration::from_millis(1)).await);
        let results = group.collect();
        assert_eq!(results[0], TaskOutcome::Completed(bytes(b"a")));
        assert_eq!(results[1], TaskOutcome::Completed(bytes(b"b")));
        assert_eq!(results[2], TaskOutcome::Completed(bytes(b"c")));
    }

    #[tokio::test]
    async fn test_fan_in_partial_timeout_marks_missing_slot() {
        let table = CorrelationTable::new();
        let group = FanInGroup::new(vec![20, 21]);
        table.register_fan_in(&group);

        assert_eq!(table.complete(20, bytes(b"done")), CompletionStatus::Recorded);
        assert!(!group.wait(Duration::from_millis(5)).await);

        table.evict_group(&group);
        assert_eq!(table.pending_count(), 0);

        let results = group.collect();
        assert_eq!(results[0], TaskOutcome::Completed(bytes(b"done")));
        assert_eq!(results[1], TaskOutcome::Failed(TaskFailure::TimedOut));
    }

    #[test]
    fn test_fan_in_duplicate_member_completion_expires() {
        let table = CorrelationTable::new();
        let group = FanInGroup::new(vec![30, 31]);
        table.register_fan_in(&group);

        assert_eq!(table.complete(30, bytes(b"x")), CompletionStatus::Recorded);
        // the entry for 30 was consumed; a duplicate no longer correlates
        assert_eq!(table.complete(30, bytes(b"x")), CompletionStatus::Expired);
    }

    #[test]
    fn test_fan_in_dispatch_failure_counts_toward_completion() {
        let table = CorrelationTable::new();
        let group = FanInGroup::new(vec![40, 41]);
        table.register_fan_in(&group);

        table.evict(41);
        group.fail_member(41);

        assert_eq!(table.complete(40, bytes(b"ok")), CompletionStatus::GroupResumed);
        let results = group.collect();
        assert_eq!(results[0], TaskOutcome::Completed(bytes(b"ok")));
        assert_eq!(results[1], TaskOutcome::Failed(TaskFailure::DispatchFailed));
    }
}
