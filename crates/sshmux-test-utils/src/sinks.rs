//! Recording channel sinks.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

use sshmux_conn::ChannelSink;

/// Sink that records everything a channel delivers.
#[derive(Default)]
pub struct CollectSink {
    data: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
    eof: AtomicBool,
    closed: AtomicBool,
    notify: Notify,
}

impl CollectSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn data(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.stderr.lock().unwrap().clone()
    }

    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until at least `n` bytes of data have been delivered.
    pub async fn wait_data_len(&self, n: usize) {
        let waiter = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.data.lock().unwrap().len() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("timed out waiting for channel data");
    }
}

impl ChannelSink for CollectSink {
    fn data(&self, data: Bytes) {
        self.data.lock().unwrap().extend_from_slice(&data);
        self.notify.notify_waiters();
    }

    fn extended_data(&self, data: Bytes) {
        self.stderr.lock().unwrap().extend_from_slice(&data);
        self.notify.notify_waiters();
    }

    fn eof(&self) {
        self.eof.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}
