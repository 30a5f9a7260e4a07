//! Per-direction flow-control window for one channel end.
//!
//! Each channel tracks two of these: the local window (credit we granted the
//! peer, consumed as its data arrives, replenished with WINDOW_ADJUST) and
//! the remote window (credit the peer granted us, consumed as we send).
//! Arithmetic is 32-bit unsigned; any overflow is a protocol violation, not
//! a wrap.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Credit accounting for one direction of one channel.
#[derive(Debug)]
pub struct Window {
    size: Mutex<u32>,
    max_size: u32,
    packet_size: u32,
    /// Signalled whenever credit is added, waking blocked senders.
    credit: Notify,
    closed: AtomicBool,
}

impl Window {
    /// Create a window from the advertised initial size and max packet size.
    pub fn new(initial: u32, packet_size: u32) -> Self {
        Self {
            size: Mutex::new(initial),
            max_size: initial,
            packet_size,
            credit: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> u32 {
        *self.size.lock().expect("window lock")
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn packet_size(&self) -> u32 {
        self.packet_size
    }

    /// Take `n` bytes of credit, failing if not enough remains.
    pub fn consume(&self, n: u32) -> Result<()> {
        let mut size = self.size.lock().expect("window lock");
        if n > *size {
            return Err(Error::WindowExhausted {
                requested: n,
                available: *size,
            });
        }
        *size -= n;
        Ok(())
    }

    /// Add `n` bytes of credit, failing if the result would exceed the
    /// negotiated maximum. Returns the new size.
    pub fn expand(&self, n: u32) -> Result<u32> {
        let mut size = self.size.lock().expect("window lock");
        let grown = size.checked_add(n).filter(|v| *v <= self.max_size).ok_or(
            Error::WindowOverflow {
                size: *size,
                delta: n,
                max: self.max_size,
            },
        )?;
        *size = grown;
        drop(size);
        self.credit.notify_waiters();
        Ok(grown)
    }

    /// Enforce the single-packet limit.
    pub fn check_packet(&self, len: usize) -> Result<()> {
        if len > self.packet_size as usize {
            return Err(Error::protocol(format!(
                "packet of {} bytes exceeds negotiated maximum {}",
                len, self.packet_size
            )));
        }
        Ok(())
    }

    /// Account for an inbound data packet against the local window.
    ///
    /// Enforces both the single-packet and the aggregate limit, then
    /// replenishes: once the window drops below half of its maximum, it is
    /// topped back up and the amount to advertise in a WINDOW_ADJUST is
    /// returned.
    pub fn consume_inbound(&self, len: usize) -> Result<Option<u32>> {
        self.check_packet(len)?;
        let mut size = self.size.lock().expect("window lock");
        let n = len as u32;
        if n > *size {
            return Err(Error::WindowExhausted {
                requested: n,
                available: *size,
            });
        }
        *size -= n;
        if *size < self.max_size / 2 {
            let adjust = self.max_size - *size;
            *size = self.max_size;
            Ok(Some(adjust))
        } else {
            Ok(None)
        }
    }

    /// Take `n` bytes of credit, waiting for WINDOW_ADJUST if necessary.
    ///
    /// Fails with `ClosedChannel` if the window is closed while waiting.
    pub async fn reserve(&self, n: u32) -> Result<()> {
        loop {
            let notified = self.credit.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ClosedChannel);
            }
            {
                let mut size = self.size.lock().expect("window lock");
                if n <= *size {
                    *size -= n;
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Fail current and future `reserve` callers; used when the channel
    /// enters Closing.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.credit.notify_waiters();
    }
}
