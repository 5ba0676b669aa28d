//! Task dispatch and completion delivery
//!
//! [`TaskDispatcher`] is the per-worker engine instance: it packs values into
//! envelopes, selects a destination task worker, hands the envelope to the
//! transport, and correlates completions back to the exact caller — a
//! fire-and-forget send, a registered callback, a suspended single waiter, or
//! a fan-in group with a shared deadline.
//!
//! All parameter checks run synchronously before any packing or I/O. A
//! correlation entry is registered before its send and evicted immediately if
//! the send fails, so a failed dispatch never leaks table state. On timeout
//! the caller's entry is evicted *before* the error is returned, which makes
//! a double-resume structurally impossible.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use crate::correlation::{
    CompletionStatus, CorrelationTable, FanInGroup, TaskOutcome, WaitCell,
};
use crate::envelope::{
    Envelope, EnvelopeCodec, PackError, SpillStore, TaskFlags, TaskValue, TempFileSpillStore,
};
use crate::routing::{SelectError, SelectPolicy, WorkerSelector};
use crate::stats::{DispatchStats, StatsSnapshot};
use crate::task_id::{TaskId, TaskIdAllocator};
use crate::transport::{TaskTransport, TransportError};

/// Role of the worker process owning a dispatcher instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Request-handling worker; may dispatch tasks
    Request,

    /// Task worker; executes tasks and must not dispatch new ones
    Task,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Index of the worker this dispatcher runs in
    pub worker_index: u16,

    /// Role of the owning worker process
    pub role: WorkerRole,

    /// Size of the task-worker pool
    pub task_workers: usize,

    /// Upper bound on one fan-in group's width
    pub max_concurrent_tasks: usize,

    /// Payloads above this size spill to out-of-band storage
    pub inline_capacity: usize,

    /// Wait timeout applied when the caller does not supply one
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,

    /// Worker selection policy for dispatches without an explicit target
    pub select_policy: SelectPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_index: 0,
            role: WorkerRole::Request,
            task_workers: 1,
            max_concurrent_tasks: 1024,
            inline_capacity: crate::envelope::DEFAULT_INLINE_CAPACITY,
            default_timeout: Duration::from_secs(5),
            select_policy: SelectPolicy::RoundRobin,
        }
    }
}

impl DispatcherConfig {
    /// Create a configuration for a pool of `task_workers`
    pub fn new(task_workers: usize) -> Self {
        Self {
            task_workers,
            ..Default::default()
        }
    }

    /// Set the owning worker's index
    pub fn with_worker_index(mut self, index: u16) -> Self {
        self.worker_index = index;
        self
    }

    /// Set the owning worker's role
    pub fn with_role(mut self, role: WorkerRole) -> Self {
        self.role = role;
        self
    }

    /// Set the task-worker pool size
    pub fn with_task_workers(mut self, count: usize) -> Self {
        self.task_workers = count;
        self
    }

    /// Set the fan-in width bound
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    /// Set the inline payload capacity
    pub fn with_inline_capacity(mut self, bytes: usize) -> Self {
        self.inline_capacity = bytes;
        self
    }

    /// Set the default wait timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the selection policy
    pub fn with_select_policy(mut self, policy: SelectPolicy) -> Self {
        self.select_policy = policy;
        self
    }
}

/// Dispatch errors surfaced to callers
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No task workers configured
    #[error("no task workers configured")]
    NoTaskWorkers,

    /// Explicit destination outside the pool
    #[error("worker {requested} out of range (pool size {pool_size})")]
    WorkerOutOfRange { requested: usize, pool_size: usize },

    /// Dispatching from within a task worker is programmer misuse
    #[error("cannot dispatch from within a task worker")]
    FromTaskWorker,

    /// Fan-in wider than the configured bound
    #[error("too many concurrent tasks: {requested} (limit {limit})")]
    TooManyTasks { requested: usize, limit: usize },

    /// Value could not be packed
    #[error("pack failed: {0}")]
    Pack(#[from] PackError),

    /// Transport rejected the envelope
    #[error("transport send failed: {0}")]
    Transport(#[from] TransportError),

    /// The wait deadline elapsed; the correlation entry has been evicted
    #[error("task {0} timed out")]
    TimedOut(TaskId),

    /// Every member of a fan-in group failed to dispatch
    #[error("every task in the group failed to dispatch")]
    DispatchFailed,
}

impl From<SelectError> for DispatchError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::NoWorkersAvailable => DispatchError::NoTaskWorkers,
            SelectError::WorkerOutOfRange {
                requested,
                pool_size,
            } => DispatchError::WorkerOutOfRange {
                requested,
                pool_size,
            },
        }
    }
}

/// Completion view handed to finish callbacks
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Id of the completed task
    pub task_id: TaskId,

    /// Task worker that produced the completion
    pub source_worker: u16,

    /// When the completion envelope was created
    pub dispatch_time: DateTime<Utc>,

    /// The unpacked completion value
    pub value: TaskValue,
}

/// Per-task completion callback, freed exactly once on completion
pub type FinishCallback = Box<dyn FnOnce(TaskResult) + Send + 'static>;

type DefaultFinishCallback = Arc<dyn Fn(TaskResult) + Send + Sync + 'static>;

/// Per-worker task dispatch engine.
///
/// # Example
///
/// ```ignore
/// use offload::prelude::*;
///
/// let (transport, receivers) = ChannelTransport::new(4);
/// let dispatcher = TaskDispatcher::new(DispatcherConfig::new(4), transport);
///
/// // fire-and-forget
/// let task_id = dispatcher.dispatch(&json!({"op": "resize"}).into(), None).await?;
///
/// // suspend until the result arrives (or 2s elapse)
/// let result = dispatcher
///     .dispatch_wait(&json!({"op": "thumbnail"}).into(), None, Some(Duration::from_secs(2)))
///     .await?;
/// ```
pub struct TaskDispatcher {
    config: DispatcherConfig,
    codec: EnvelopeCodec,
    selector: WorkerSelector,
    transport: Arc<dyn TaskTransport>,
    table: CorrelationTable,
    callbacks: Mutex<HashMap<TaskId, FinishCallback>>,
    finish_callback: RwLock<Option<DefaultFinishCallback>>,
    allocator: TaskIdAllocator,
    stats: DispatchStats,
}

impl TaskDispatcher {
    /// Create a dispatcher spilling oversized payloads to the system temp dir
    pub fn new(config: DispatcherConfig, transport: Arc<dyn TaskTransport>) -> Self {
        Self::with_spill_store(config, transport, Arc::new(TempFileSpillStore::default()))
    }

    /// Create a dispatcher with an explicit spill store
    pub fn with_spill_store(
        config: DispatcherConfig,
        transport: Arc<dyn TaskTransport>,
        spill: Arc<dyn SpillStore>,
    ) -> Self {
        Self {
            codec: EnvelopeCodec::new(config.inline_capacity, spill),
            selector: WorkerSelector::new(config.task_workers, config.select_policy),
            allocator: TaskIdAllocator::new(config.worker_index),
            table: CorrelationTable::new(),
            callbacks: Mutex::new(HashMap::new()),
            finish_callback: RwLock::new(None),
            stats: DispatchStats::new(),
            transport,
            config,
        }
    }

    /// The dispatcher's configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// The envelope codec; task-worker loops use it to unpack requests and
    /// pack replies
    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    /// Install the engine-wide default finish callback, invoked for
    /// completions whose per-task callback is absent
    pub fn set_finish_callback(&self, callback: impl Fn(TaskResult) + Send + Sync + 'static) {
        *self.finish_callback.write() = Some(Arc::new(callback));
    }

    /// Number of task ids currently awaiting completion
    pub fn pending_tasks(&self) -> usize {
        self.table.pending_count()
    }

    /// Idle task workers reported by the transport
    pub fn idle_task_workers(&self) -> usize {
        self.transport.idle_count()
    }

    /// Snapshot of the dispatch counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .snapshot(self.table.pending_count(), self.transport.idle_count())
    }

    // =========================================================================
    // Dispatch entry points
    // =========================================================================

    /// Fire-and-forget dispatch.
    ///
    /// No correlation entry is created; a completion the transport later
    /// reports for this id is logged and dropped.
    #[instrument(skip(self, value), fields(worker_index = self.config.worker_index))]
    pub async fn dispatch(
        &self,
        value: &TaskValue,
        target: Option<usize>,
    ) -> Result<TaskId, DispatchError> {
        self.check_dispatch(None)?;
        let worker = self.selector.select(target, self.idle_hint())?;
        let task_id = self.allocator.next();

        let envelope = self.pack(value, task_id, worker, TaskFlags::NONBLOCKING | TaskFlags::NO_REPLY)?;
        self.transport.send(worker, envelope).await?;
        self.stats.record_dispatched();
        debug!(task_id, worker, "dispatched fire-and-forget task");
        Ok(task_id)
    }

    /// Dispatch with a per-task completion callback.
    ///
    /// The callback is registered before the send and removed again if the
    /// send fails, so a completion racing the dispatch can never miss it.
    #[instrument(skip(self, value, callback), fields(worker_index = self.config.worker_index))]
    pub async fn dispatch_with_callback(
        &self,
        value: &TaskValue,
        target: Option<usize>,
        callback: FinishCallback,
    ) -> Result<TaskId, DispatchError> {
        self.check_dispatch(None)?;
        let worker = self.selector.select(target, self.idle_hint())?;
        let task_id = self.allocator.next();

        let envelope = self.pack(value, task_id, worker, TaskFlags::NONBLOCKING | TaskFlags::CALLBACK)?;
        self.callbacks.lock().insert(task_id, callback);
        if let Err(err) = self.transport.send(worker, envelope).await {
            self.callbacks.lock().remove(&task_id);
            return Err(err.into());
        }
        self.stats.record_dispatched();
        debug!(task_id, worker, "dispatched task with callback");
        Ok(task_id)
    }

    /// Dispatch and suspend until the completion arrives.
    ///
    /// On timeout the correlation entry is evicted first and
    /// [`DispatchError::TimedOut`] returned after, so a late completion finds
    /// no waiter and is dropped.
    #[instrument(skip(self, value), fields(worker_index = self.config.worker_index))]
    pub async fn dispatch_wait(
        &self,
        value: &TaskValue,
        target: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<TaskValue, DispatchError> {
        self.check_dispatch(None)?;
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let worker = self.selector.select(target, self.idle_hint())?;
        let task_id = self.allocator.next();

        let envelope = self.pack(value, task_id, worker, TaskFlags::NONBLOCKING | TaskFlags::COROUTINE)?;
        let cell = Arc::new(WaitCell::new());
        self.table.register_single(task_id, Arc::clone(&cell));
        if let Err(err) = self.transport.send(worker, envelope).await {
            self.table.evict(task_id);
            return Err(err.into());
        }
        self.stats.record_dispatched();

        match cell.wait(timeout).await {
            Some(result) => Ok(result),
            None => {
                // evict-then-return: a completion arriving from here on is
                // expired, never a second resume
                self.table.evict(task_id);
                debug!(task_id, "single-task wait timed out");
                Err(DispatchError::TimedOut(task_id))
            }
        }
    }

    /// Dispatch a group of tasks and suspend until all of them settle or the
    /// shared deadline elapses.
    ///
    /// The result vector is indexed by submission order. A member whose pack
    /// or send fails is recorded as `Failed(DispatchFailed)`; members missing
    /// at the deadline come back as `Failed(TimedOut)`. Fails with
    /// [`DispatchError::TooManyTasks`] before any send when the group is too
    /// wide, and with [`DispatchError::DispatchFailed`] when no member
    /// reached a worker.
    #[instrument(skip(self, values), fields(worker_index = self.config.worker_index, tasks = values.len()))]
    pub async fn dispatch_all(
        &self,
        values: &[TaskValue],
        timeout: Option<Duration>,
    ) -> Result<Vec<TaskOutcome>, DispatchError> {
        self.check_dispatch(Some(values.len()))?;
        let timeout = timeout.unwrap_or(self.config.default_timeout);

        let ids: Vec<TaskId> = values.iter().map(|_| self.allocator.next()).collect();
        let group = FanInGroup::new(ids.clone());
        self.table.register_fan_in(&group);

        let flags = TaskFlags::NONBLOCKING | TaskFlags::COROUTINE | TaskFlags::WAIT_ALL;
        let mut dispatched = 0usize;
        for (task_id, value) in ids.iter().zip(values) {
            match self.send_member(value, *task_id, flags).await {
                Ok(()) => {
                    dispatched += 1;
                    self.stats.record_dispatched();
                }
                Err(err) => {
                    warn!(task_id, error = %err, "fan-in member failed to dispatch");
                    self.table.evict(*task_id);
                    group.fail_member(*task_id);
                }
            }
        }

        if dispatched == 0 {
            self.table.evict_group(&group);
            return Err(DispatchError::DispatchFailed);
        }

        let completed = group.wait(timeout).await;
        // evict before returning, whether the group completed or timed out
        self.table.evict_group(&group);
        if !completed {
            debug!(tasks = ids.len(), "fan-in wait timed out with members outstanding");
        }
        Ok(group.collect())
    }

    // =========================================================================
    // Completion delivery
    // =========================================================================

    /// Deliver one inbound completion envelope.
    ///
    /// Called by the transport once per completion, in arrival order. Never
    /// panics and never returns an error: malformed envelopes, expired ids,
    /// and panicking callbacks are logged and contained here.
    pub fn on_completion(&self, envelope: Envelope) {
        let task_id = envelope.header.task_id;
        let flags = envelope.header.flags;

        let value = match self.codec.unpack(&envelope) {
            Ok(value) => value,
            Err(err) => {
                warn!(task_id, error = %err, "dropping malformed completion");
                return;
            }
        };

        if flags.contains(TaskFlags::CALLBACK) {
            let result = TaskResult {
                task_id,
                source_worker: envelope.header.source_worker,
                dispatch_time: envelope.header.created_at,
                value,
            };
            let callback = self.callbacks.lock().remove(&task_id);
            match callback {
                Some(callback) => {
                    self.stats.record_completed();
                    Self::invoke_callback(task_id, move || callback(result));
                }
                None => {
                    // already handled (timeout race); fall back to the
                    // engine-wide finish callback
                    let fallback = self.finish_callback.read().clone();
                    match fallback {
                        Some(callback) => {
                            self.stats.record_completed();
                            Self::invoke_callback(task_id, move || callback(result));
                        }
                        None => {
                            warn!(task_id, "completion requires a finish callback; dropped");
                        }
                    }
                }
            }
            return;
        }

        match self.table.complete(task_id, value) {
            CompletionStatus::Resumed
            | CompletionStatus::Recorded
            | CompletionStatus::GroupResumed => {
                self.stats.record_completed();
            }
            CompletionStatus::Expired => {
                self.stats.record_expired();
                warn!(task_id, "task has expired");
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn check_dispatch(&self, fan_out: Option<usize>) -> Result<(), DispatchError> {
        if self.config.role == WorkerRole::Task {
            return Err(DispatchError::FromTaskWorker);
        }
        if self.config.task_workers == 0 {
            return Err(DispatchError::NoTaskWorkers);
        }
        if let Some(requested) = fan_out {
            if requested >= self.config.max_concurrent_tasks {
                return Err(DispatchError::TooManyTasks {
                    requested,
                    limit: self.config.max_concurrent_tasks,
                });
            }
        }
        Ok(())
    }

    fn idle_hint(&self) -> Option<usize> {
        match self.config.select_policy {
            SelectPolicy::Idle => self.transport.pick_idle(),
            SelectPolicy::RoundRobin => None,
        }
    }

    fn pack(
        &self,
        value: &TaskValue,
        task_id: TaskId,
        worker: usize,
        flags: TaskFlags,
    ) -> Result<Envelope, PackError> {
        self.codec.pack(
            value,
            task_id,
            self.config.worker_index,
            Some(worker as u16),
            flags,
        )
    }

    async fn send_member(
        &self,
        value: &TaskValue,
        task_id: TaskId,
        flags: TaskFlags,
    ) -> Result<(), DispatchError> {
        let worker = self.selector.select(None, self.idle_hint())?;
        let envelope = self.pack(value, task_id, worker, flags)?;
        self.transport.send(worker, envelope).await?;
        Ok(())
    }

    fn invoke_callback(task_id: TaskId, call: impl FnOnce()) {
        if std::panic::catch_unwind(AssertUnwindSafe(call)).is_err() {
            error!(task_id, "finish callback panicked");
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
