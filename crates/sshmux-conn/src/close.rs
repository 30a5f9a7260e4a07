//! Close coordination.
//!
//! Closing is latched: the first `close()` call picks the mode, every later
//! call (and every clone of the close future) observes the same completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::future::{CloseFuture, Latch};

/// How to shut the service down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Drain channels (writes, EOF, CLOSE handshake), then close
    /// sub-services sequentially, then the transport.
    Graceful,
    /// Fail everything pending and release resources at once.
    Immediate,
}

/// Latched close state shared by the service and its close futures.
#[derive(Debug, Default)]
pub(crate) struct CloseCoordinator {
    begun: AtomicBool,
    done: Arc<Latch>,
}

impl CloseCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns true for the caller that initiates the close.
    pub(crate) fn begin(&self) -> bool {
        self.begun
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True once a close has been initiated (registration barrier).
    pub(crate) fn is_begun(&self) -> bool {
        self.begun.load(Ordering::Acquire)
    }

    pub(crate) fn finish(&self) {
        self.done.trip();
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.is_set()
    }

    pub(crate) fn future(&self) -> CloseFuture {
        CloseFuture::new(Arc::clone(&self.done))
    }
}
