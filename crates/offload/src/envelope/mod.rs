//! Wire envelopes for task dispatch
//!
//! This module provides:
//! - [`Envelope`] - Fixed-header wire unit carrying a task payload
//! - [`TaskFlags`] - Independent bit-set describing how a task travels
//! - [`TaskValue`] - Application payload: raw bytes or a structured value
//! - [`EnvelopeCodec`] - pack/unpack with temp-file overflow for large payloads
//! - [`SpillStore`] - Capability interface for out-of-band payload storage

mod codec;
mod spill;

pub use codec::{EnvelopeCodec, PackError, UnpackError, DEFAULT_INLINE_CAPACITY};
pub use spill::{MemorySpillStore, SpillError, SpillStore, SpillToken, TempFileSpillStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task_id::TaskId;

/// Flags describing how a task envelope travels and completes.
///
/// This is an independent bit-set, not an enumeration: flags combine freely
/// (e.g. `NONBLOCKING | COROUTINE | WAIT_ALL` on a fan-in member).
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskFlags(u16);

impl TaskFlags {
    /// No flags set
    pub const NONE: TaskFlags = TaskFlags(0);

    /// Payload is a serialized structured value, not raw bytes
    pub const SERIALIZED: TaskFlags = TaskFlags(1 << 0);

    /// Caller will not hard-block the OS thread on this task
    pub const NONBLOCKING: TaskFlags = TaskFlags(1 << 1);

    /// Caller is a suspended lightweight task awaiting resumption
    pub const COROUTINE: TaskFlags = TaskFlags(1 << 2);

    /// Completion must invoke a registered callback
    pub const CALLBACK: TaskFlags = TaskFlags(1 << 3);

    /// Fire-and-forget: no correlation entry exists for this task
    pub const NO_REPLY: TaskFlags = TaskFlags(1 << 4);

    /// Member of a synchronous multi-task wait group
    pub const WAIT_ALL: TaskFlags = TaskFlags(1 << 5);

    /// Inspect the payload without consuming its backing storage
    pub const PEEK: TaskFlags = TaskFlags(1 << 6);

    /// Check whether all flags in `other` are set
    pub fn contains(self, other: TaskFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`
    pub fn insert(&mut self, other: TaskFlags) {
        self.0 |= other.0;
    }

    /// Clear the flags in `other`
    pub fn remove(&mut self, other: TaskFlags) {
        self.0 &= !other.0;
    }

    /// Keep only the flags also present in `mask`
    pub fn intersection(self, mask: TaskFlags) -> TaskFlags {
        TaskFlags(self.0 & mask.0)
    }

    /// Raw bit representation
    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for TaskFlags {
    type Output = TaskFlags;

    fn bitor(self, rhs: TaskFlags) -> TaskFlags {
        TaskFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for TaskFlags {
    fn bitor_assign(&mut self, rhs: TaskFlags) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for TaskFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(TaskFlags, &str); 7] = [
            (TaskFlags::SERIALIZED, "SERIALIZED"),
            (TaskFlags::NONBLOCKING, "NONBLOCKING"),
            (TaskFlags::COROUTINE, "COROUTINE"),
            (TaskFlags::CALLBACK, "CALLBACK"),
            (TaskFlags::NO_REPLY, "NO_REPLY"),
            (TaskFlags::WAIT_ALL, "WAIT_ALL"),
            (TaskFlags::PEEK, "PEEK"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

/// An application payload as handed to (or returned from) the engine.
///
/// Raw bytes travel verbatim; structured values are serialized by the codec
/// and marked with [`TaskFlags::SERIALIZED`] so the receiving side knows to
/// deserialize.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskValue {
    /// Raw byte payload, copied into the envelope as-is
    Bytes(Vec<u8>),

    /// Structured value, serialized to JSON on the wire
    Structured(serde_json::Value),
}

impl TaskValue {
    /// Borrow the raw bytes, if this is a byte payload
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            TaskValue::Bytes(b) => Some(b),
            TaskValue::Structured(_) => None,
        }
    }

    /// Borrow the structured value, if this is one
    pub fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            TaskValue::Bytes(_) => None,
            TaskValue::Structured(v) => Some(v),
        }
    }
}

impl From<Vec<u8>> for TaskValue {
    fn from(bytes: Vec<u8>) -> Self {
        TaskValue::Bytes(bytes)
    }
}

impl From<serde_json::Value> for TaskValue {
    fn from(value: serde_json::Value) -> Self {
        TaskValue::Structured(value)
    }
}

/// Fixed envelope header.
///
/// `len` is always the payload's byte length, whether the body is inline or
/// spilled out-of-band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    /// Correlation key, unique within the issuing worker process
    pub task_id: TaskId,

    /// Index of the worker that created this envelope
    pub source_worker: u16,

    /// Destination worker the selector chose (advisory)
    pub dest_hint: Option<u16>,

    /// Payload byte length
    pub len: u32,

    /// Travel/completion flags
    pub flags: TaskFlags,

    /// Creation timestamp, surfaced to finish callbacks as the dispatch time
    pub created_at: DateTime<Utc>,
}

/// Envelope body: inline bytes, or a token referencing spilled storage.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeBody {
    /// Payload small enough for the transport's inline capacity
    Inline(Vec<u8>),

    /// Payload written out-of-band; the token resolves through a [`SpillStore`]
    Spilled(SpillToken),
}

/// The wire-level unit carrying one task or one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub body: EnvelopeBody,
}

impl Envelope {
    /// Whether the payload lives out-of-band
    pub fn is_spilled(&self) -> bool {
        matches!(self.body, EnvelopeBody::Spilled(_))
    }
}
