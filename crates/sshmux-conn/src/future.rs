//! Awaitable handles for asynchronous connection-service operations.
//!
//! Open, close, write and request completions are surfaced as futures the
//! caller awaits with an explicit or configured timeout. Timing out never
//! reverses the underlying operation (SSH has no cancellation primitive);
//! cancelling a pending write before it is in flight removes it from the
//! queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, oneshot};

use sshmux_core::{Error, Result};

// =============================================================================
// Latch
// =============================================================================

/// One-shot latch usable by any number of waiters.
#[derive(Debug, Default)]
pub struct Latch {
    set: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the latch. Returns true for the first caller only.
    pub fn trip(&self) -> bool {
        let first = self
            .set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Write Future
// =============================================================================

/// Completion handle for one queued outbound packet.
pub struct WriteFuture {
    rx: oneshot::Receiver<Result<()>>,
    cancelled: Arc<AtomicBool>,
}

impl WriteFuture {
    pub(crate) fn new(rx: oneshot::Receiver<Result<()>>, cancelled: Arc<AtomicBool>) -> Self {
        Self { rx, cancelled }
    }

    /// Wait for the packet to be handed to the cipher layer.
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ClosedChannel),
        }
    }

    /// Like [`wait`](Self::wait) with an upper bound.
    pub async fn wait_timeout(self, bound: Duration) -> Result<()> {
        match tokio::time::timeout(bound, self.rx).await {
            Err(_) => Err(Error::Timeout),
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ClosedChannel),
        }
    }

    /// Cancel the write if it is not yet in flight; it then resolves
    /// `Cancelled` instead of being sent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for WriteFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteFuture").finish()
    }
}

// =============================================================================
// Open Future
// =============================================================================

/// Peer-advertised parameters delivered by a successful channel open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteParams {
    pub remote_id: u32,
    pub window_size: u32,
    pub packet_size: u32,
}

/// Completion handle for an outbound channel open.
pub struct OpenFuture {
    rx: oneshot::Receiver<Result<RemoteParams>>,
    default_timeout: Duration,
    /// Invoked on timeout to dispose of the half-open channel.
    on_timeout: Option<Box<dyn FnOnce() + Send>>,
}

impl OpenFuture {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<RemoteParams>>,
        default_timeout: Duration,
        on_timeout: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            rx,
            default_timeout,
            on_timeout: Some(on_timeout),
        }
    }

    /// Wait for OPEN_CONFIRMATION or OPEN_FAILURE, bounded by the configured
    /// open timeout. On timeout the half-open channel is closed.
    pub async fn wait(self) -> Result<RemoteParams> {
        let bound = self.default_timeout;
        self.wait_timeout(bound).await
    }

    /// Like [`wait`](Self::wait) with an explicit bound.
    pub async fn wait_timeout(mut self, bound: Duration) -> Result<RemoteParams> {
        match tokio::time::timeout(bound, &mut self.rx).await {
            Err(_) => {
                if let Some(abort) = self.on_timeout.take() {
                    abort();
                }
                Err(Error::Timeout)
            }
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ClosedChannel),
        }
    }
}

impl std::fmt::Debug for OpenFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFuture").finish()
    }
}

// =============================================================================
// Request Future
// =============================================================================

/// Reply to a want-reply request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestReply {
    pub success: bool,
    /// Request-specific reply payload (e.g. the bound port for
    /// `tcpip-forward`); empty for channel requests.
    pub payload: Bytes,
}

/// Completion handle for an outbound want-reply request, resolved FIFO
/// against inbound SUCCESS/FAILURE replies.
pub struct RequestFuture {
    rx: oneshot::Receiver<RequestReply>,
    default_timeout: Duration,
}

impl RequestFuture {
    pub(crate) fn new(rx: oneshot::Receiver<RequestReply>, default_timeout: Duration) -> Self {
        Self {
            rx,
            default_timeout,
        }
    }

    pub async fn wait(self) -> Result<RequestReply> {
        let bound = self.default_timeout;
        self.wait_timeout(bound).await
    }

    pub async fn wait_timeout(self, bound: Duration) -> Result<RequestReply> {
        match tokio::time::timeout(bound, self.rx).await {
            Err(_) => Err(Error::Timeout),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ClosedChannel),
        }
    }
}

// =============================================================================
// Close Future
// =============================================================================

/// Completion handle for a channel or service close. Cloneable; every clone
/// resolves once the same close completes.
#[derive(Clone)]
pub struct CloseFuture {
    latch: Arc<Latch>,
}

impl CloseFuture {
    pub(crate) fn new(latch: Arc<Latch>) -> Self {
        Self { latch }
    }

    pub async fn wait(self) {
        self.latch.wait().await;
    }

    pub async fn wait_timeout(self, bound: Duration) -> Result<()> {
        tokio::time::timeout(bound, self.latch.wait())
            .await
            .map_err(|_| Error::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        self.latch.is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latch_wakes_existing_and_future_waiters() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(latch.trip());
        assert!(!latch.trip());
        waiter.await.unwrap();

        // A waiter arriving after the trip returns immediately.
        latch.wait().await;
    }

    #[tokio::test]
    async fn request_future_times_out() {
        let (_tx, rx) = oneshot::channel::<RequestReply>();
        let fut = RequestFuture::new(rx, Duration::from_millis(10));
        assert!(matches!(fut.wait().await, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn request_future_resolves_closed_on_drop() {
        let (tx, rx) = oneshot::channel::<RequestReply>();
        drop(tx);
        let fut = RequestFuture::new(rx, Duration::from_secs(1));
        assert!(matches!(fut.wait().await, Err(Error::ClosedChannel)));
    }

    #[tokio::test]
    async fn open_future_runs_abort_hook_on_timeout() {
        let (_tx, rx) = oneshot::channel();
        let aborted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&aborted);
        let fut = OpenFuture::new(
            rx,
            Duration::from_millis(10),
            Box::new(move || flag.store(true, Ordering::Release)),
        );
        assert!(matches!(fut.wait().await, Err(Error::Timeout)));
        assert!(aborted.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn close_future_clones_resolve_together() {
        let latch = Arc::new(Latch::new());
        let a = CloseFuture::new(Arc::clone(&latch));
        let b = a.clone();
        latch.trip();
        a.wait().await;
        assert!(b.is_closed());
        b.wait().await;
    }
}
