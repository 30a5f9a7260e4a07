//! Transport endpoint contract and outbound write serialization.
//!
//! The packet layer below this crate frames, encrypts and MACs packets; we
//! consume it through [`PacketSink`]. SSH record boundaries and MAC counters
//! demand strict byte order on the wire, so every outbound packet funnels
//! through one [`PacketWriter`]: a FIFO queue drained by a single task with
//! at most one send in flight. Enqueue order between concurrent producers is
//! whatever the queue gives and becomes the canonical wire order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;

use sshmux_core::{Error, Result};

use crate::future::WriteFuture;

/// Contract consumed from the packet layer.
///
/// `send_packet` completes once the packet has been handed to the cipher
/// layer; completion order matches call order because only the writer task
/// calls it.
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    async fn send_packet(&self, packet: Bytes) -> Result<()>;

    /// Tear down the underlying transport.
    async fn close(&self);
}

struct WriteOp {
    packet: Bytes,
    done: oneshot::Sender<Result<()>>,
    cancelled: Arc<AtomicBool>,
}

/// Serializes outbound packets onto one transport.
pub struct PacketWriter {
    tx: Mutex<Option<mpsc::UnboundedSender<WriteOp>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PacketWriter {
    /// Spawn the writer task draining the queue into `sink`.
    pub fn new(sink: Arc<dyn PacketSink>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();
        let task = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                if op.cancelled.load(Ordering::Acquire) {
                    let _ = op.done.send(Err(Error::Cancelled));
                    continue;
                }
                trace!(len = op.packet.len(), "writing packet");
                let result = sink.send_packet(op.packet).await;
                let _ = op.done.send(result);
            }
        });
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Enqueue one packet; the returned future resolves when the packet has
    /// been handed to the cipher layer (or failed, or was cancelled).
    pub fn write(&self, packet: Bytes) -> WriteFuture {
        let (done, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = Arc::clone(&cancelled);

        // When the intake is closed or the send fails, the op (and with it
        // the done sender) is dropped and the future resolves ClosedChannel.
        if let Some(tx) = self.tx.lock().expect("writer lock").as_ref() {
            let _ = tx.send(WriteOp {
                packet,
                done,
                cancelled,
            });
        }
        WriteFuture::new(rx, handle)
    }

    /// Stop accepting new packets; already-queued packets still drain.
    pub fn close_intake(&self) {
        self.tx.lock().expect("writer lock").take();
    }

    /// Wait for the queue to drain after `close_intake`.
    pub async fn drained(&self) {
        let task = self.task.lock().expect("writer lock").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Drop the queue on the floor; queued writes resolve `ClosedChannel`.
    pub fn abort(&self) {
        self.tx.lock().expect("writer lock").take();
        if let Some(task) = self.task.lock().expect("writer lock").take() {
            task.abort();
        }
    }
}
