//! IPC transport seam
//!
//! The engine only needs a narrow contract from its transport: deliver an
//! envelope to a task worker, and (optionally) report which workers are idle.
//! Completion delivery flows the other way, into
//! [`TaskDispatcher::on_completion`](crate::dispatch::TaskDispatcher::on_completion).
//!
//! [`ChannelTransport`] is the in-process backend used by tests and
//! single-host embedding; real IPC backends (unix-domain sockets, shared
//! message queues) implement the same trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::envelope::Envelope;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The envelope could not be delivered to the worker
    #[error("send to worker {worker} failed: {reason}")]
    SendFailed { worker: usize, reason: String },
}

/// Delivery contract between the dispatcher and a task-worker pool.
#[async_trait]
pub trait TaskTransport: Send + Sync + 'static {
    /// Deliver `envelope` to the task worker at `worker`
    async fn send(&self, worker: usize, envelope: Envelope) -> Result<(), TransportError>;

    /// An idle worker, if the backend tracks idleness
    fn pick_idle(&self) -> Option<usize> {
        None
    }

    /// Number of currently idle task workers
    fn idle_count(&self) -> usize {
        0
    }
}

/// In-process transport backed by one unbounded channel per task worker.
///
/// Workers are marked busy on send; the worker side flips them back with
/// [`ChannelTransport::set_idle`] once a task finishes.
pub struct ChannelTransport {
    senders: Vec<mpsc::UnboundedSender<Envelope>>,
    idle: Vec<AtomicBool>,
}

impl ChannelTransport {
    /// Create a transport for `pool_size` workers, returning the receiving
    /// end for each worker's inbox.
    pub fn new(pool_size: usize) -> (Arc<Self>, Vec<mpsc::UnboundedReceiver<Envelope>>) {
        let mut senders = Vec::with_capacity(pool_size);
        let mut receivers = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }
        let idle = (0..pool_size).map(|_| AtomicBool::new(true)).collect();
        (Arc::new(Self { senders, idle }), receivers)
    }

    /// Mark a worker idle (or busy); called by the worker side
    pub fn set_idle(&self, worker: usize, idle: bool) {
        if let Some(flag) = self.idle.get(worker) {
            flag.store(idle, Ordering::Relaxed);
        }
    }

    /// Pool size this transport serves
    pub fn pool_size(&self) -> usize {
        self.senders.len()
    }
}

#[async_trait]
impl TaskTransport for ChannelTransport {
    async fn send(&self, worker: usize, envelope: Envelope) -> Result<(), TransportError> {
        let sender = self.senders.get(worker).ok_or_else(|| TransportError::SendFailed {
            worker,
            reason: "no such worker".to_string(),
        })?;
        self.set_idle(worker, false);
        sender
            .send(envelope)
            .map_err(|_| TransportError::SendFailed {
                worker,
                reason: "worker inbox closed".to_string(),
            })
    }

    fn pick_idle(&self) -> Option<usize> {
        self.idle
            .iter()
            .position(|flag| flag.load(Ordering::Relaxed))
    }

    fn idle_count(&self) -> usize {
        self.idle
            .iter()
            .filter(|flag| flag.load(Ordering::Relaxed))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio_test::assert_ok;

    use super::*;
    use crate::envelope::{EnvelopeBody, EnvelopeHeader, TaskFlags};

    fn test_envelope(task_id: i64) -> Envelope {
        Envelope {
            header: EnvelopeHeader {
                task_id,
                source_worker: 0,
                dest_hint: None,
                len: 1,
                flags: TaskFlags::NONE,
                created_at: Utc::now(),
            },
            body: EnvelopeBody::Inline(vec![0]),
        }
    }

    #[tokio::test]
    async fn test_send_reaches_the_right_worker() {
        let (transport, mut receivers) = ChannelTransport::new(2);

        tokio_test::assert_ok!(transport.send(1, test_envelope(7)).await);
        let received = receivers[1].recv().await.expect("recv");
        assert_eq!(received.header.task_id, 7);
        assert!(receivers[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_worker_fails() {
        let (transport, _receivers) = ChannelTransport::new(1);
        let err = transport.send(3, test_envelope(1)).await.expect_err("bad worker");
        assert!(matches!(err, TransportError::SendFailed { worker: 3, .. }));
    }

    #[tokio::test]
    async fn test_send_to_closed_inbox_fails() {
        let (transport, receivers) = ChannelTransport::new(1);
        drop(receivers);
        let err = transport.send(0, test_envelope(1)).await.expect_err("closed");
        assert!(matches!(err, TransportError::SendFailed { worker: 0, .. }));
    }

    #[tokio::test]
    async fn test_idle_tracking() {
        let (transport, _receivers) = ChannelTransport::new(3);
        assert_eq!(transport.idle_count(), 3);
        assert_eq!(transport.pick_idle(), Some(0));

        transport.send(0, test_envelope(1)).await.expect("send");
        assert_eq!(transport.idle_count(), 2);
        assert_eq!(transport.pick_idle(), Some(1));

        transport.set_idle(0, true);
        assert_eq!(transport.idle_count(), 3);
    }
}
