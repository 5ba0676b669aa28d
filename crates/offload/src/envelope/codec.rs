//! Envelope pack/unpack
//!
//! Raw byte values are copied in verbatim with `SERIALIZED` clear; structured
//! values are serialized to JSON with `SERIALIZED` set. Payloads larger than
//! the inline capacity are written through the spill store and the envelope
//! carries a token instead of bytes.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use super::spill::{SpillError, SpillStore};
use super::{Envelope, EnvelopeBody, EnvelopeHeader, TaskFlags, TaskValue};
use crate::task_id::TaskId;

/// Default inline payload capacity (bytes)
pub const DEFAULT_INLINE_CAPACITY: usize = 8 * 1024;

/// Errors raised while packing a value into an envelope
#[derive(Debug, Error)]
pub enum PackError {
    /// Zero-length values are legal only for replies
    #[error("cannot pack an empty payload into a request")]
    EmptyPayload,

    /// Structured value failed to serialize
    #[error("payload serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Oversized payload could not be written out-of-band
    #[error("payload spill failed: {0}")]
    Spill(#[from] SpillError),
}

/// Errors raised while unpacking an envelope
#[derive(Debug, Error)]
pub enum UnpackError {
    /// Spilled payload could not be loaded
    #[error("failed to load spilled payload: {0}")]
    Spill(#[from] SpillError),

    /// Payload marked `SERIALIZED` did not deserialize; `offset` is the byte
    /// position the parser stopped at
    #[error("deserialize failed at byte offset {offset}: {source}")]
    DeserializeFailed {
        offset: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Packs and unpacks task envelopes.
///
/// One instance is shared by a dispatcher; the spill store decides where
/// oversized payloads live.
pub struct EnvelopeCodec {
    inline_capacity: usize,
    spill: Arc<dyn SpillStore>,
}

impl EnvelopeCodec {
    /// Create a codec with the given inline capacity and spill store
    pub fn new(inline_capacity: usize, spill: Arc<dyn SpillStore>) -> Self {
        Self {
            inline_capacity,
            spill,
        }
    }

    /// Inline capacity in bytes
    pub fn inline_capacity(&self) -> usize {
        self.inline_capacity
    }

    /// Pack an outbound request.
    ///
    /// Fails with [`PackError::EmptyPayload`] for zero-length values; empty
    /// payloads are legal only on the reply path.
    pub fn pack(
        &self,
        value: &TaskValue,
        task_id: TaskId,
        source_worker: u16,
        dest_hint: Option<u16>,
        flags: TaskFlags,
    ) -> Result<Envelope, PackError> {
        let (bytes, serialized) = Self::encode(value)?;
        if bytes.is_empty() {
            return Err(PackError::EmptyPayload);
        }
        self.assemble(bytes, serialized, task_id, source_worker, dest_hint, flags)
    }

    /// Pack a completion reply for `request`.
    ///
    /// Carries the request's task id and its completion-routing flags
    /// (`COROUTINE`/`CALLBACK`/`WAIT_ALL`/`NONBLOCKING`) so the dispatcher on
    /// the originating worker can correlate it. Empty replies are legal.
    pub fn pack_reply(
        &self,
        request: &EnvelopeHeader,
        source_worker: u16,
        value: &TaskValue,
    ) -> Result<Envelope, PackError> {
        let kept = request.flags.intersection(
            TaskFlags::COROUTINE | TaskFlags::CALLBACK | TaskFlags::WAIT_ALL | TaskFlags::NONBLOCKING,
        );
        let (bytes, serialized) = Self::encode(value)?;
        self.assemble(
            bytes,
            serialized,
            request.task_id,
            source_worker,
            Some(request.source_worker),
            kept,
        )
    }

    /// Unpack an envelope back into its payload value.
    ///
    /// Spilled payloads are re-read and released, unless the envelope carries
    /// [`TaskFlags::PEEK`], in which case the backing storage is left in
    /// place for a later consuming unpack.
    pub fn unpack(&self, envelope: &Envelope) -> Result<TaskValue, UnpackError> {
        let bytes = match &envelope.body {
            EnvelopeBody::Inline(bytes) => bytes.clone(),
            EnvelopeBody::Spilled(token) => {
                let bytes = self.spill.read(token)?;
                if !envelope.header.flags.contains(TaskFlags::PEEK) {
                    self.spill.dispose(token)?;
                }
                bytes
            }
        };

        if envelope.header.flags.contains(TaskFlags::SERIALIZED) {
            let value = serde_json::from_slice(&bytes).map_err(|source| {
                UnpackError::DeserializeFailed {
                    offset: source.column().saturating_sub(1),
                    source,
                }
            })?;
            Ok(TaskValue::Structured(value))
        } else {
            Ok(TaskValue::Bytes(bytes))
        }
    }

    fn encode(value: &TaskValue) -> Result<(Vec<u8>, bool), PackError> {
        match value {
            TaskValue::Bytes(bytes) => Ok((bytes.clone(), false)),
            TaskValue::Structured(v) => {
                let bytes = serde_json::to_vec(v).map_err(PackError::Serialize)?;
                Ok((bytes, true))
            }
        }
    }

    fn assemble(
        &self,
        bytes: Vec<u8>,
        serialized: bool,
        task_id: TaskId,
        source_worker: u16,
        dest_hint: Option<u16>,
        mut flags: TaskFlags,
    ) -> Result<Envelope, PackError> {
        if serialized {
            flags.insert(TaskFlags::SERIALIZED);
        } else {
            flags.remove(TaskFlags::SERIALIZED);
        }

        let len = bytes.len() as u32;
        let body = if bytes.len() > self.inline_capacity {
            let token = self.spill.write(&bytes)?;
            debug!(task_id, len, "payload spilled out-of-band");
            EnvelopeBody::Spilled(token)
        } else {
            EnvelopeBody::Inline(bytes)
        };

        Ok(Envelope {
            header: EnvelopeHeader {
                task_id,
                source_worker,
                dest_hint,
                len,
                flags,
                created_at: Utc::now(),
            },
            body,
        })
    }
}
