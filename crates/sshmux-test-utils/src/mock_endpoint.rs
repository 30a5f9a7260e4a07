//! In-memory packet endpoint for testing without a real transport.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use sshmux_conn::{ConnectionService, PacketSink};
use sshmux_core::Result;
use sshmux_core::wire::split_packet;

/// Records every packet the service writes, in wire order.
pub struct MockEndpoint {
    sent: Mutex<Vec<Bytes>>,
    notify: Notify,
    closed: AtomicBool,
}

impl MockEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Everything written so far, split into (message number, payload).
    pub fn sent_packets(&self) -> Vec<(u8, Bytes)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|p| split_packet(p.clone()).expect("well-formed packet"))
            .collect()
    }

    /// Drain the recorded packets.
    pub fn take_packets(&self) -> Vec<(u8, Bytes)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
            .into_iter()
            .map(|p| split_packet(p).expect("well-formed packet"))
            .collect()
    }

    pub fn packet_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Wait until at least `n` packets have been written.
    ///
    /// Panics after five seconds; a test waiting that long has failed.
    pub async fn wait_for_packets(&self, n: usize) {
        let waiter = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.packet_count() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "timed out waiting for {} packets (have {})",
                    n,
                    self.packet_count()
                )
            });
    }

    /// True once the service closed the transport.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PacketSink for MockEndpoint {
    async fn send_packet(&self, packet: Bytes) -> Result<()> {
        self.sent.lock().unwrap().push(packet);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Deliver one encoded packet to the service as if the peer had sent it.
pub async fn feed(service: &Arc<ConnectionService>, packet: Bytes) -> Result<()> {
    let (cmd, payload) = split_packet(packet)?;
    service.process(cmd, payload).await
}
