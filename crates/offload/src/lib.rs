//! # Offload
//!
//! Asynchronous task dispatch and completion correlation for worker pools.
//!
//! A request-handling worker hands a value to the engine; the engine packs it
//! into a self-describing envelope, picks a task worker, and sends it over a
//! pluggable transport. When the task worker replies, the completion flows
//! back through the same engine instance, which routes it to whoever is
//! waiting: nobody (fire-and-forget), a one-shot callback, a suspended
//! caller, or a fan-in group collecting a whole batch under one deadline.
//!
//! ## Features
//!
//! - **Fire-and-forget, callback, await, and fan-in** dispatch modes over one
//!   correlation table
//! - **Self-describing envelopes**: serialization state, delivery mode, and
//!   reply routing travel in a flag word with the payload
//! - **Payload spilling**: bodies above a size threshold move to out-of-band
//!   storage and are reclaimed exactly once on unpack
//! - **No double resume**: a three-state wait cell makes the
//!   completion-vs-timeout race winner-take-all by construction
//! - **Pluggable transport**: in-process channels out of the box; the same
//!   trait seam carries real IPC backends
//!
//! ## Architecture
//!
//! ```text
//!   caller                      TaskDispatcher                task workers
//!     │  dispatch*(value)   ┌───────────────────┐
//!     ├────────────────────▶│ check ▸ pack ▸    │   envelope   ┌────────┐
//!     │                     │ select ▸ register │─────────────▶│ worker │
//!     │      suspended on   │                   │              └───┬────┘
//!     │      a WaitCell     │  CorrelationTable │    reply         │
//!     │◀────────────────────│   on_completion   │◀─────────────────┘
//!     │  value / outcome    └───────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use offload::prelude::*;
//! use serde_json::json;
//!
//! let (transport, receivers) = ChannelTransport::new(4);
//! let dispatcher = TaskDispatcher::new(DispatcherConfig::new(4), transport);
//!
//! // fire-and-forget
//! dispatcher.dispatch(&json!({"op": "warm_cache"}).into(), None).await?;
//!
//! // suspend until the result arrives, bounded by a deadline
//! let result = dispatcher
//!     .dispatch_wait(&json!({"op": "render"}).into(), None, Some(Duration::from_secs(2)))
//!     .await?;
//! ```

pub mod correlation;
pub mod dispatch;
pub mod envelope;
pub mod routing;
pub mod stats;
pub mod task_id;
pub mod transport;

pub use correlation::{CompletionStatus, CorrelationTable, FanInGroup, TaskFailure, TaskOutcome, WaitCell};
pub use dispatch::{
    DispatchError, DispatcherConfig, FinishCallback, TaskDispatcher, TaskResult, WorkerRole,
};
pub use envelope::{
    Envelope, EnvelopeBody, EnvelopeCodec, EnvelopeHeader, MemorySpillStore, PackError, SpillError,
    SpillStore, SpillToken, TaskFlags, TaskValue, TempFileSpillStore, UnpackError,
    DEFAULT_INLINE_CAPACITY,
};
pub use routing::{SelectError, SelectPolicy, WorkerSelector};
pub use stats::{DispatchStats, StatsSnapshot};
pub use task_id::{TaskId, TaskIdAllocator};
pub use transport::{ChannelTransport, TaskTransport, TransportError};

/// Convenience re-exports for embedding the engine
pub mod prelude {
    pub use crate::correlation::{TaskFailure, TaskOutcome};
    pub use crate::dispatch::{
        DispatchError, DispatcherConfig, TaskDispatcher, TaskResult, WorkerRole,
    };
    pub use crate::envelope::{Envelope, EnvelopeCodec, TaskFlags, TaskValue};
    pub use crate::routing::SelectPolicy;
    pub use crate::task_id::TaskId;
    pub use crate::transport::{ChannelTransport, TaskTransport};
}
