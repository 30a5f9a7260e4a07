//! Channel state machine.
//!
//! One `Channel` is one logical bidirectional stream multiplexed over the
//! session. The machine moves Opening → Open → Closing → Closed; EOF in
//! each direction is an independent latch, and Closing supersedes both.
//! CHANNEL_CLOSE is sent exactly once per side regardless of who closes
//! first; a channel is fully closed only after both sides have sent it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use sshmux_core::constants::{
    CHANNEL_AGENT, CHANNEL_DIRECT_TCPIP, CHANNEL_FORWARDED_TCPIP, CHANNEL_SESSION, CHANNEL_X11,
    SSH_EXTENDED_DATA_STDERR, SSH_MSG_CHANNEL_CLOSE, SSH_MSG_CHANNEL_EOF,
    SSH_MSG_CHANNEL_FAILURE, SSH_MSG_CHANNEL_SUCCESS,
};
use sshmux_core::wire::{
    ChannelData, ChannelExtendedData, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelRequest, ChannelWindowAdjust, recipient_packet,
};
use sshmux_core::{ConnectionConfig, Error, Result, Window};

use crate::future::{CloseFuture, Latch, RemoteParams, RequestFuture, RequestReply, WriteFuture};
use crate::transport::PacketWriter;

// =============================================================================
// Channel Kind
// =============================================================================

/// The channel types this service knows, plus an escape hatch for
/// extension types negotiated by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    DirectTcpip,
    ForwardedTcpip,
    X11,
    Agent,
    Other(String),
}

impl ChannelKind {
    pub fn name(&self) -> &str {
        match self {
            ChannelKind::Session => CHANNEL_SESSION,
            ChannelKind::DirectTcpip => CHANNEL_DIRECT_TCPIP,
            ChannelKind::ForwardedTcpip => CHANNEL_FORWARDED_TCPIP,
            ChannelKind::X11 => CHANNEL_X11,
            ChannelKind::Agent => CHANNEL_AGENT,
            ChannelKind::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            CHANNEL_SESSION => ChannelKind::Session,
            CHANNEL_DIRECT_TCPIP => ChannelKind::DirectTcpip,
            CHANNEL_FORWARDED_TCPIP => ChannelKind::ForwardedTcpip,
            CHANNEL_X11 => ChannelKind::X11,
            CHANNEL_AGENT => ChannelKind::Agent,
            other => ChannelKind::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Channel Sink
// =============================================================================

/// User-level consumer of inbound channel events.
///
/// Calls arrive in wire order and under no lock; implementations that need
/// to do I/O should hand off to their own task.
pub trait ChannelSink: Send + Sync {
    fn data(&self, data: Bytes);

    /// Stderr stream of a session channel.
    fn extended_data(&self, data: Bytes) {
        let _ = data;
    }

    fn eof(&self) {}

    fn closed(&self) {}
}

/// Sink that discards everything.
pub struct NullSink;

impl ChannelSink for NullSink {
    fn data(&self, _data: Bytes) {}
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Coarse lifecycle phase. EOF latches are tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    phase: Phase,
    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    close_received: bool,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            phase: Phase::Opening,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            close_received: false,
        }
    }
}

// =============================================================================
// Channel
// =============================================================================

/// One logical stream inside the session.
pub struct Channel {
    local_id: u32,
    kind: ChannelKind,
    remote_id: OnceLock<u32>,
    local_window: Window,
    remote_window: OnceLock<Window>,
    lifecycle: Mutex<Lifecycle>,
    /// FIFO of outstanding want-reply channel requests.
    pending_requests: Mutex<VecDeque<oneshot::Sender<RequestReply>>>,
    /// Resolves the opener's future; present on outbound channels only.
    open_reply: Mutex<Option<oneshot::Sender<Result<RemoteParams>>>>,
    sink: Mutex<Option<Arc<dyn ChannelSink>>>,
    close_latch: Arc<Latch>,
    writer: Arc<PacketWriter>,
    request_timeout: Duration,
}

impl Channel {
    /// Channel created by local user code; remote parameters arrive with
    /// OPEN_CONFIRMATION.
    pub(crate) fn new_outbound(
        local_id: u32,
        kind: ChannelKind,
        writer: Arc<PacketWriter>,
        config: &ConnectionConfig,
        sink: Arc<dyn ChannelSink>,
        open_reply: oneshot::Sender<Result<RemoteParams>>,
    ) -> Self {
        Self {
            local_id,
            kind,
            remote_id: OnceLock::new(),
            local_window: Window::new(config.window_size, config.packet_size),
            remote_window: OnceLock::new(),
            lifecycle: Mutex::new(Lifecycle::new()),
            pending_requests: Mutex::new(VecDeque::new()),
            open_reply: Mutex::new(Some(open_reply)),
            sink: Mutex::new(Some(sink)),
            close_latch: Arc::new(Latch::new()),
            writer,
            request_timeout: config.request_timeout,
        }
    }

    /// Channel created for an inbound CHANNEL_OPEN; remote parameters are
    /// known up front, the sink is attached once the factory accepts.
    pub(crate) fn new_inbound(
        local_id: u32,
        kind: ChannelKind,
        writer: Arc<PacketWriter>,
        config: &ConnectionConfig,
        sender: u32,
        initial_window: u32,
        max_packet: u32,
    ) -> Self {
        let channel = Self {
            local_id,
            kind,
            remote_id: OnceLock::new(),
            local_window: Window::new(config.window_size, config.packet_size),
            remote_window: OnceLock::new(),
            lifecycle: Mutex::new(Lifecycle::new()),
            pending_requests: Mutex::new(VecDeque::new()),
            open_reply: Mutex::new(None),
            sink: Mutex::new(None),
            close_latch: Arc::new(Latch::new()),
            writer,
            request_timeout: config.request_timeout,
        };
        let _ = channel.remote_id.set(sender);
        let _ = channel
            .remote_window
            .set(Window::new(initial_window, max_packet));
        channel
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    pub fn remote_id(&self) -> Option<u32> {
        self.remote_id.get().copied()
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle.lock().expect("lifecycle lock").phase
    }

    pub fn local_window(&self) -> &Window {
        &self.local_window
    }

    pub fn remote_window(&self) -> Option<&Window> {
        self.remote_window.get()
    }

    /// Future resolving once both sides have sent CHANNEL_CLOSE (or the
    /// session force-closed the channel).
    pub fn closed(&self) -> CloseFuture {
        CloseFuture::new(Arc::clone(&self.close_latch))
    }

    fn current_sink(&self) -> Option<Arc<dyn ChannelSink>> {
        self.sink.lock().expect("sink lock").clone()
    }

    /// Attach the user sink and move Opening → Open (inbound accept path).
    pub(crate) fn mark_open(&self, sink: Arc<dyn ChannelSink>) {
        *self.sink.lock().expect("sink lock") = Some(sink);
        let mut lc = self.lifecycle.lock().expect("lifecycle lock");
        if lc.phase == Phase::Opening {
            lc.phase = Phase::Open;
        }
    }

    fn require_remote(&self) -> Result<(u32, &Window)> {
        match (self.remote_id.get(), self.remote_window.get()) {
            (Some(id), Some(win)) => Ok((*id, win)),
            _ => Err(Error::ClosedChannel),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        let lc = self.lifecycle.lock().expect("lifecycle lock");
        if lc.phase != Phase::Open || lc.eof_sent || lc.close_sent {
            return Err(Error::ClosedChannel);
        }
        Ok(())
    }

    // =========================================================================
    // Inbound events (called by the dispatcher, in wire order)
    // =========================================================================

    pub(crate) fn handle_open_confirmation(&self, conf: ChannelOpenConfirmation) -> Result<()> {
        {
            let mut lc = self.lifecycle.lock().expect("lifecycle lock");
            if lc.phase != Phase::Opening {
                return Err(Error::protocol(format!(
                    "OPEN_CONFIRMATION on channel {} in state {:?}",
                    self.local_id, lc.phase
                )));
            }
            let _ = self.remote_id.set(conf.sender);
            let _ = self
                .remote_window
                .set(Window::new(conf.window, conf.max_packet));
            lc.phase = Phase::Open;
        }
        debug!(
            channel = self.local_id,
            remote = conf.sender,
            window = conf.window,
            packet = conf.max_packet,
            "channel open confirmed"
        );
        if let Some(tx) = self.open_reply.lock().expect("open lock").take() {
            let _ = tx.send(Ok(RemoteParams {
                remote_id: conf.sender,
                window_size: conf.window,
                packet_size: conf.max_packet,
            }));
        }
        Ok(())
    }

    pub(crate) fn handle_open_failure(&self, fail: ChannelOpenFailure) -> Result<()> {
        {
            let mut lc = self.lifecycle.lock().expect("lifecycle lock");
            if lc.phase != Phase::Opening {
                return Err(Error::protocol(format!(
                    "OPEN_FAILURE on channel {} in state {:?}",
                    self.local_id, lc.phase
                )));
            }
            lc.phase = Phase::Closed;
        }
        debug!(
            channel = self.local_id,
            code = fail.reason_code,
            message = %fail.message,
            "channel open refused by peer"
        );
        if let Some(tx) = self.open_reply.lock().expect("open lock").take() {
            let _ = tx.send(Err(Error::OpenFailed {
                code: fail.reason_code,
                message: fail.message,
            }));
        }
        self.close_latch.trip();
        Ok(())
    }

    /// Inbound CHANNEL_DATA. Enforces both window limits; crossing the
    /// low-water mark queues a WINDOW_ADJUST back to the peer.
    pub(crate) fn handle_data(&self, data: Bytes) -> Result<()> {
        let deliver = {
            let lc = self.lifecycle.lock().expect("lifecycle lock");
            match lc.phase {
                Phase::Opening => {
                    return Err(Error::protocol(format!(
                        "DATA on channel {} before open completed",
                        self.local_id
                    )));
                }
                Phase::Closed => {
                    return Err(Error::protocol(format!(
                        "DATA on closed channel {}",
                        self.local_id
                    )));
                }
                Phase::Open | Phase::Closing => {}
            }
            if lc.eof_received {
                return Err(Error::protocol(format!(
                    "DATA on channel {} after EOF",
                    self.local_id
                )));
            }
            // Data racing our own CLOSE is window-accounted but not delivered.
            !lc.close_sent
        };

        if let Some(adjust) = self.local_window.consume_inbound(data.len())? {
            self.send_window_adjust(adjust);
        }
        if deliver {
            if let Some(sink) = self.current_sink() {
                sink.data(data);
            }
        } else {
            trace!(channel = self.local_id, len = data.len(), "dropping data after close");
        }
        Ok(())
    }

    /// Inbound CHANNEL_EXTENDED_DATA, stderr only; dispatch has already
    /// rejected other type codes.
    pub(crate) fn handle_extended_data(&self, data: Bytes) -> Result<()> {
        let deliver = {
            let lc = self.lifecycle.lock().expect("lifecycle lock");
            if lc.phase == Phase::Opening || lc.phase == Phase::Closed || lc.eof_received {
                return Err(Error::protocol(format!(
                    "EXTENDED_DATA on channel {} in invalid state",
                    self.local_id
                )));
            }
            !lc.close_sent
        };
        if let Some(adjust) = self.local_window.consume_inbound(data.len())? {
            self.send_window_adjust(adjust);
        }
        if deliver {
            if let Some(sink) = self.current_sink() {
                sink.extended_data(data);
            }
        }
        Ok(())
    }

    pub(crate) fn handle_window_adjust(&self, bytes_to_add: u32) -> Result<()> {
        let win = self
            .remote_window
            .get()
            .ok_or_else(|| Error::protocol("WINDOW_ADJUST before open completed"))?;
        let new_size = win.expand(bytes_to_add)?;
        trace!(channel = self.local_id, add = bytes_to_add, size = new_size, "window adjusted");
        Ok(())
    }

    pub(crate) fn handle_eof(&self) -> Result<()> {
        {
            let mut lc = self.lifecycle.lock().expect("lifecycle lock");
            if lc.eof_received {
                return Err(Error::protocol(format!(
                    "duplicate EOF on channel {}",
                    self.local_id
                )));
            }
            lc.eof_received = true;
        }
        debug!(channel = self.local_id, "peer sent EOF");
        if let Some(sink) = self.current_sink() {
            sink.eof();
        }
        Ok(())
    }

    /// Inbound CHANNEL_CLOSE. Our own CLOSE goes out exactly once even when
    /// the peer closes first; afterwards the channel is fully closed.
    pub(crate) fn handle_close(&self) -> Result<()> {
        let send_ours = {
            let mut lc = self.lifecycle.lock().expect("lifecycle lock");
            if lc.close_received {
                return Err(Error::protocol(format!(
                    "duplicate CLOSE on channel {}",
                    self.local_id
                )));
            }
            lc.close_received = true;
            let send = !lc.close_sent;
            lc.close_sent = true;
            lc.phase = Phase::Closed;
            send
        };
        if send_ours {
            if let Some(id) = self.remote_id() {
                self.writer.write(recipient_packet(SSH_MSG_CHANNEL_CLOSE, id));
            }
        }
        debug!(channel = self.local_id, "channel fully closed");
        self.release();
        Ok(())
    }

    /// Inbound CHANNEL_SUCCESS / CHANNEL_FAILURE, matched FIFO against our
    /// outstanding want-reply requests.
    pub(crate) fn handle_request_reply(&self, success: bool) -> Result<()> {
        let tx = self
            .pending_requests
            .lock()
            .expect("requests lock")
            .pop_front()
            .ok_or_else(|| {
                Error::protocol(format!(
                    "request reply on channel {} with none pending",
                    self.local_id
                ))
            })?;
        let _ = tx.send(RequestReply {
            success,
            payload: Bytes::new(),
        });
        Ok(())
    }

    // =========================================================================
    // Outbound operations
    // =========================================================================

    /// Send data, fragmenting to the peer's maximum packet size and waiting
    /// for window credit as needed. The returned future tracks the final
    /// fragment.
    pub async fn send_data(&self, data: Bytes) -> Result<WriteFuture> {
        self.ensure_writable()?;
        let (remote_id, win) = self.require_remote()?;
        if data.is_empty() {
            return Ok(self.writer.write(
                ChannelData {
                    recipient: remote_id,
                    data,
                }
                .encode(),
            ));
        }

        let max_fragment = (win.packet_size().max(1)) as usize;
        let mut last = None;
        let mut offset = 0;
        while offset < data.len() {
            let len = max_fragment.min(data.len() - offset);
            win.reserve(len as u32).await?;
            // Re-check after a potential wait: EOF/close may have raced in.
            self.ensure_writable()?;
            let fragment = data.slice(offset..offset + len);
            last = Some(self.writer.write(
                ChannelData {
                    recipient: remote_id,
                    data: fragment,
                }
                .encode(),
            ));
            offset += len;
        }
        Ok(last.expect("at least one fragment"))
    }

    /// Send stderr data on a session channel.
    pub async fn send_stderr(&self, data: Bytes) -> Result<WriteFuture> {
        self.ensure_writable()?;
        let (remote_id, win) = self.require_remote()?;
        if data.is_empty() {
            return Ok(self.writer.write(
                ChannelExtendedData {
                    recipient: remote_id,
                    data_type: SSH_EXTENDED_DATA_STDERR,
                    data,
                }
                .encode(),
            ));
        }

        let max_fragment = (win.packet_size().max(1)) as usize;
        let mut last = None;
        let mut offset = 0;
        while offset < data.len() {
            let len = max_fragment.min(data.len() - offset);
            win.reserve(len as u32).await?;
            self.ensure_writable()?;
            let fragment = data.slice(offset..offset + len);
            last = Some(self.writer.write(
                ChannelExtendedData {
                    recipient: remote_id,
                    data_type: SSH_EXTENDED_DATA_STDERR,
                    data: fragment,
                }
                .encode(),
            ));
            offset += len;
        }
        Ok(last.expect("at least one fragment"))
    }

    /// Send CHANNEL_EOF; no data may follow.
    pub fn send_eof(&self) -> Result<WriteFuture> {
        {
            let mut lc = self.lifecycle.lock().expect("lifecycle lock");
            if lc.phase != Phase::Open || lc.eof_sent || lc.close_sent {
                return Err(Error::ClosedChannel);
            }
            lc.eof_sent = true;
        }
        let id = self.remote_id().ok_or(Error::ClosedChannel)?;
        Ok(self.writer.write(recipient_packet(SSH_MSG_CHANNEL_EOF, id)))
    }

    /// Begin closing. CHANNEL_CLOSE is queued once; the returned future
    /// resolves when the peer's CLOSE arrives (or the session force-closes).
    pub fn close(&self) -> CloseFuture {
        let send = {
            let mut lc = self.lifecycle.lock().expect("lifecycle lock");
            if lc.phase == Phase::Closed || lc.close_sent {
                false
            } else {
                lc.close_sent = true;
                lc.phase = if lc.close_received {
                    Phase::Closed
                } else {
                    Phase::Closing
                };
                true
            }
        };
        if send {
            // Blocked senders cannot make progress once we are closing.
            if let Some(win) = self.remote_window.get() {
                win.close();
            }
            if let Some(id) = self.remote_id() {
                self.writer.write(recipient_packet(SSH_MSG_CHANNEL_CLOSE, id));
            }
            debug!(channel = self.local_id, "closing channel");
        }
        self.closed()
    }

    /// EOF-then-CLOSE ordering behind any writes already queued.
    pub fn close_graceful(&self) -> CloseFuture {
        let send_eof = {
            let mut lc = self.lifecycle.lock().expect("lifecycle lock");
            if lc.phase == Phase::Open && !lc.eof_sent && !lc.close_sent {
                lc.eof_sent = true;
                true
            } else {
                false
            }
        };
        if send_eof {
            if let Some(id) = self.remote_id() {
                self.writer.write(recipient_packet(SSH_MSG_CHANNEL_EOF, id));
            }
        }
        self.close()
    }

    /// Send a channel request; with `want_reply` the returned future
    /// resolves FIFO against inbound SUCCESS/FAILURE.
    pub fn request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<Option<RequestFuture>> {
        self.ensure_writable()?;
        let id = self.remote_id().ok_or(Error::ClosedChannel)?;
        let future = if want_reply {
            let (tx, rx) = oneshot::channel();
            self.pending_requests
                .lock()
                .expect("requests lock")
                .push_back(tx);
            Some(RequestFuture::new(rx, self.request_timeout))
        } else {
            None
        };
        self.writer.write(
            ChannelRequest {
                recipient: id,
                name: name.to_string(),
                want_reply,
                payload,
            }
            .encode(),
        );
        Ok(future)
    }

    /// Reply to an inbound want-reply channel request.
    pub(crate) fn send_request_reply(&self, success: bool) {
        if let Some(id) = self.remote_id() {
            let cmd = if success {
                SSH_MSG_CHANNEL_SUCCESS
            } else {
                SSH_MSG_CHANNEL_FAILURE
            };
            self.writer.write(recipient_packet(cmd, id));
        }
    }

    fn send_window_adjust(&self, bytes_to_add: u32) {
        if let Some(id) = self.remote_id() {
            self.writer.write(
                ChannelWindowAdjust {
                    recipient: id,
                    bytes_to_add,
                }
                .encode(),
            );
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Mark the channel dead without any further wire traffic: pending
    /// futures resolve ClosedChannel, blocked senders wake, the sink is
    /// notified. Used for session teardown and open timeouts.
    pub(crate) fn fail_session(&self) {
        {
            let mut lc = self.lifecycle.lock().expect("lifecycle lock");
            lc.phase = Phase::Closed;
        }
        self.release();
    }

    /// Common teardown: wake everything that could still be waiting.
    fn release(&self) {
        self.local_window.close();
        if let Some(win) = self.remote_window.get() {
            win.close();
        }
        // Dropping the senders resolves the matching futures ClosedChannel.
        self.open_reply.lock().expect("open lock").take();
        self.pending_requests
            .lock()
            .expect("requests lock")
            .clear();
        if let Some(sink) = self.current_sink() {
            sink.closed();
        }
        self.close_latch.trip();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("kind", &self.kind)
            .field("remote_id", &self.remote_id.get())
            .field("phase", &self.phase())
            .finish()
    }
}
