//! Connection service: channel registry and inbound dispatcher.
//!
//! One service per authenticated session. It owns every open channel by
//! local id, demultiplexes inbound connection-service messages, negotiates
//! channel opens in both directions and coordinates shutdown.
//!
//! The transport guarantees at most one `process` call per session at a
//! time, so inbound events for a channel reach it in wire order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info, warn};

use sshmux_core::constants::{
    CHANNEL_SESSION, SSH_MSG_CHANNEL_CLOSE, SSH_MSG_CHANNEL_DATA, SSH_MSG_CHANNEL_EOF,
    SSH_MSG_CHANNEL_EXTENDED_DATA, SSH_MSG_CHANNEL_FAILURE, SSH_MSG_CHANNEL_OPEN,
    SSH_MSG_CHANNEL_OPEN_CONFIRMATION, SSH_MSG_CHANNEL_OPEN_FAILURE, SSH_MSG_CHANNEL_REQUEST,
    SSH_MSG_CHANNEL_SUCCESS, SSH_MSG_CHANNEL_WINDOW_ADJUST, SSH_MSG_GLOBAL_REQUEST,
    SSH_MSG_REQUEST_FAILURE, SSH_MSG_REQUEST_SUCCESS, SSH_EXTENDED_DATA_STDERR,
    SSH_OPEN_CONNECT_FAILED, SSH_OPEN_UNKNOWN_CHANNEL_TYPE, open_error_name,
};
use sshmux_core::wire::{
    ChannelData, ChannelExtendedData, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelRequest, ChannelWindowAdjust, GlobalRequest, PacketBuf, WireReader,
};
use sshmux_core::{ConnectionConfig, Error, Result};

use crate::channel::{Channel, ChannelKind, ChannelSink};
use crate::close::{CloseCoordinator, CloseMode};
use crate::forward::{AgentForward, TcpipForwarder, X11Forward};
use crate::future::{CloseFuture, OpenFuture, RequestFuture, RequestReply};
use crate::handlers::{CancelTcpipForwardHandler, NoMoreSessionsHandler, TcpipForwardHandler};
use crate::router::{ChannelRequestHandler, GlobalRequestHandler, RequestOutcome, RequestRouter};
use crate::transport::{PacketSink, PacketWriter};

// =============================================================================
// Channel Factory
// =============================================================================

/// Constructor for inbound channel opens, looked up by type name.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Channel type this factory serves (e.g. `"session"`).
    fn channel_type(&self) -> &str;

    /// Inspect the type-specific open payload and produce the sink for the
    /// new channel. An error refuses the open; `Error::OpenFailed` carries
    /// the reason code to report.
    async fn accept(
        &self,
        channel: &Arc<Channel>,
        type_data: Bytes,
    ) -> Result<Arc<dyn ChannelSink>>;
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`ConnectionService`] with its factories and handler chains.
#[derive(Default)]
pub struct ConnectionServiceBuilder {
    config: ConnectionConfig,
    session_id: Bytes,
    factories: Vec<Arc<dyn ChannelFactory>>,
    global_handlers: Vec<Arc<dyn GlobalRequestHandler>>,
    channel_handlers: Vec<Arc<dyn ChannelRequestHandler>>,
    standard_handlers: bool,
}

impl ConnectionServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Session identifier (the key-exchange hash H), kept for completeness
    /// of the session boundary.
    pub fn session_id(mut self, id: impl Into<Bytes>) -> Self {
        self.session_id = id.into();
        self
    }

    pub fn channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn global_handler(mut self, handler: Arc<dyn GlobalRequestHandler>) -> Self {
        self.global_handlers.push(handler);
        self
    }

    pub fn channel_handler(mut self, handler: Arc<dyn ChannelRequestHandler>) -> Self {
        self.channel_handlers.push(handler);
        self
    }

    /// Append the built-in `tcpip-forward`, `cancel-tcpip-forward` and
    /// `no-more-sessions@openssh.com` handlers after any custom ones.
    pub fn standard_handlers(mut self) -> Self {
        self.standard_handlers = true;
        self
    }

    pub fn build(self, sink: Arc<dyn PacketSink>) -> Arc<ConnectionService> {
        let writer = PacketWriter::new(Arc::clone(&sink));

        let mut global_handlers = self.global_handlers;
        if self.standard_handlers {
            global_handlers.push(Arc::new(TcpipForwardHandler));
            global_handlers.push(Arc::new(CancelTcpipForwardHandler));
            global_handlers.push(Arc::new(NoMoreSessionsHandler));
        }

        let factories = self
            .factories
            .into_iter()
            .map(|f| (f.channel_type().to_string(), f))
            .collect();

        Arc::new_cyclic(|weak| ConnectionService {
            session_id: self.session_id,
            config: self.config,
            sink,
            writer,
            channels: RwLock::new(HashMap::new()),
            next_channel_id: AtomicU32::new(0),
            allow_more_sessions: AtomicBool::new(true),
            factories,
            router: RequestRouter::new(global_handlers, self.channel_handlers),
            global_replies: StdMutex::new(VecDeque::new()),
            tcpip: Arc::new(TcpipForwarder::new(weak.clone())),
            agent: Arc::new(AgentForward::new(weak.clone())),
            x11: Arc::new(X11Forward::new(weak.clone())),
            close: CloseCoordinator::new(),
        })
    }
}

// =============================================================================
// Connection Service
// =============================================================================

/// The RFC 4254 connection service for one session.
pub struct ConnectionService {
    session_id: Bytes,
    config: ConnectionConfig,
    sink: Arc<dyn PacketSink>,
    writer: Arc<PacketWriter>,
    /// Open channels by local id; the only shared mutable collection.
    channels: RwLock<HashMap<u32, Arc<Channel>>>,
    /// Monotonic id source; ids are never reused within a session.
    next_channel_id: AtomicU32,
    allow_more_sessions: AtomicBool,
    factories: HashMap<String, Arc<dyn ChannelFactory>>,
    router: RequestRouter,
    /// FIFO of outstanding want-reply global requests.
    global_replies: StdMutex<VecDeque<oneshot::Sender<RequestReply>>>,
    tcpip: Arc<TcpipForwarder>,
    agent: Arc<AgentForward>,
    x11: Arc<X11Forward>,
    close: CloseCoordinator,
}

impl ConnectionService {
    pub fn builder() -> ConnectionServiceBuilder {
        ConnectionServiceBuilder::new()
    }

    pub fn session_id(&self) -> &Bytes {
        &self.session_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn tcpip_forwarder(&self) -> &Arc<TcpipForwarder> {
        &self.tcpip
    }

    pub fn agent_forward(&self) -> &Arc<AgentForward> {
        &self.agent
    }

    pub fn x11_forward(&self) -> &Arc<X11Forward> {
        &self.x11
    }

    pub fn allow_more_sessions(&self) -> bool {
        self.allow_more_sessions.load(Ordering::Acquire)
    }

    /// Gate new inbound session opens (`no-more-sessions@openssh.com`).
    pub fn set_allow_more_sessions(&self, allow: bool) {
        debug!(allow, "set allow-more-sessions");
        self.allow_more_sessions.store(allow, Ordering::Release);
    }

    pub fn is_closing(&self) -> bool {
        self.close.is_begun()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn channel(&self, local_id: u32) -> Option<Arc<Channel>> {
        self.channels.read().await.get(&local_id).cloned()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Allocate an id and insert a new channel, honoring the channel cap and
    /// the shutdown barrier.
    pub(crate) async fn register<F>(&self, make: F) -> Result<Arc<Channel>>
    where
        F: FnOnce(u32) -> Channel,
    {
        let mut channels = self.channels.write().await;
        if channels.len() >= self.config.max_channels as usize {
            return Err(Error::TooManyChannels {
                limit: self.config.max_channels,
            });
        }
        if self.close.is_begun() {
            return Err(Error::ServiceClosing);
        }
        let local_id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(make(local_id));
        channels.insert(local_id, Arc::clone(&channel));
        debug!(
            channel = local_id,
            kind = %channel.kind(),
            total = channels.len(),
            "registered channel"
        );
        Ok(channel)
    }

    /// Remove a channel from the registry; idempotent.
    pub async fn unregister_channel(&self, local_id: u32) {
        let removed = self.channels.write().await.remove(&local_id);
        debug!(channel = local_id, known = removed.is_some(), "unregistered channel");
    }

    /// Open a channel toward the peer. Returns the registered channel and
    /// the future resolving on OPEN_CONFIRMATION / OPEN_FAILURE.
    pub async fn open_channel(
        self: &Arc<Self>,
        kind: ChannelKind,
        type_data: Bytes,
        sink: Arc<dyn ChannelSink>,
    ) -> Result<(Arc<Channel>, OpenFuture)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let writer = Arc::clone(&self.writer);
        let config = self.config.clone();
        let channel = self
            .register(move |id| Channel::new_outbound(id, kind, writer, &config, sink, reply_tx))
            .await?;

        let open = ChannelOpen {
            channel_type: channel.kind().name().to_string(),
            sender: channel.local_id(),
            initial_window: self.config.window_size,
            max_packet: self.config.packet_size,
            type_data,
        };
        debug!(
            channel = channel.local_id(),
            kind = %channel.kind(),
            "sending CHANNEL_OPEN"
        );
        self.writer.write(open.encode());

        // A timed-out open leaves a half-open channel behind; dispose of it.
        let weak = Arc::downgrade(self);
        let local_id = channel.local_id();
        let on_timeout = Box::new(move || {
            if let Some(service) = weak.upgrade() {
                tokio::spawn(async move {
                    warn!(channel = local_id, "channel open timed out");
                    if let Some(ch) = service.channels.write().await.remove(&local_id) {
                        ch.fail_session();
                    }
                });
            }
        });
        let future = OpenFuture::new(reply_rx, self.config.open_timeout, on_timeout);
        Ok((channel, future))
    }

    /// Send a global request; with `want_reply`, the returned future
    /// resolves FIFO against inbound REQUEST_SUCCESS/FAILURE.
    pub fn send_global_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> Option<RequestFuture> {
        let future = want_reply.then(|| {
            let (tx, rx) = oneshot::channel();
            self.global_replies
                .lock()
                .expect("global replies lock")
                .push_back(tx);
            RequestFuture::new(rx, self.config.request_timeout)
        });
        self.writer.write(
            GlobalRequest {
                name: name.to_string(),
                want_reply,
                payload,
            }
            .encode(),
        );
        future
    }

    /// Send REQUEST_SUCCESS with a request-specific payload (handlers that
    /// return `Replied` use this).
    pub fn send_request_success(&self, payload: Bytes) {
        let mut packet = PacketBuf::with_capacity(SSH_MSG_REQUEST_SUCCESS, payload.len());
        packet.put_raw(&payload);
        self.writer.write(packet.freeze());
    }

    pub fn send_request_failure(&self) {
        self.writer.write(PacketBuf::new(SSH_MSG_REQUEST_FAILURE).freeze());
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Demultiplex one inbound message.
    ///
    /// Session-fatal errors (protocol violations) tear the service down
    /// immediately and are returned to the caller; everything else is
    /// handled internally.
    pub async fn process(self: &Arc<Self>, cmd: u8, payload: Bytes) -> Result<()> {
        let result = self.dispatch(cmd, payload).await;
        if let Err(err) = &result {
            if err.is_fatal() {
                warn!(error = %err, "protocol violation, tearing down session");
                self.shutdown_now().await;
            }
        }
        result
    }

    async fn dispatch(self: &Arc<Self>, cmd: u8, payload: Bytes) -> Result<()> {
        let mut reader = WireReader::new(payload);
        match cmd {
            SSH_MSG_CHANNEL_OPEN => self.handle_channel_open(&mut reader).await,
            SSH_MSG_CHANNEL_OPEN_CONFIRMATION => {
                let conf = ChannelOpenConfirmation::decode(&mut reader)?;
                let channel = self.lookup(conf.recipient, cmd).await?;
                channel.handle_open_confirmation(conf)
            }
            SSH_MSG_CHANNEL_OPEN_FAILURE => {
                let fail = ChannelOpenFailure::decode(&mut reader)?;
                let channel = self.lookup(fail.recipient, cmd).await?;
                self.unregister_channel(channel.local_id()).await;
                channel.handle_open_failure(fail)
            }
            SSH_MSG_CHANNEL_DATA => {
                let msg = ChannelData::decode(&mut reader)?;
                let channel = self.lookup(msg.recipient, cmd).await?;
                channel.handle_data(msg.data)
            }
            SSH_MSG_CHANNEL_EXTENDED_DATA => {
                let msg = ChannelExtendedData::decode(&mut reader)?;
                let channel = self.lookup(msg.recipient, cmd).await?;
                if msg.data_type != SSH_EXTENDED_DATA_STDERR {
                    // Non-standard type codes: the channel is closed, the
                    // session survives.
                    warn!(
                        channel = channel.local_id(),
                        data_type = msg.data_type,
                        "rejecting extended data with non-stderr type"
                    );
                    channel.close();
                    return Ok(());
                }
                channel.handle_extended_data(msg.data)
            }
            SSH_MSG_CHANNEL_WINDOW_ADJUST => {
                let msg = ChannelWindowAdjust::decode(&mut reader)?;
                let channel = self.lookup(msg.recipient, cmd).await?;
                channel.handle_window_adjust(msg.bytes_to_add)
            }
            SSH_MSG_CHANNEL_EOF => {
                let recipient = reader.get_u32()?;
                let channel = self.lookup(recipient, cmd).await?;
                channel.handle_eof()
            }
            SSH_MSG_CHANNEL_CLOSE => {
                let recipient = reader.get_u32()?;
                let channel = self.lookup(recipient, cmd).await?;
                channel.handle_close()?;
                self.unregister_channel(recipient).await;
                Ok(())
            }
            SSH_MSG_CHANNEL_REQUEST => {
                let req = ChannelRequest::decode(&mut reader)?;
                let channel = self.lookup(req.recipient, cmd).await?;
                self.handle_channel_request(channel, req).await
            }
            SSH_MSG_CHANNEL_SUCCESS => {
                let recipient = reader.get_u32()?;
                let channel = self.lookup(recipient, cmd).await?;
                channel.handle_request_reply(true)
            }
            SSH_MSG_CHANNEL_FAILURE => {
                let recipient = reader.get_u32()?;
                let channel = self.lookup(recipient, cmd).await?;
                channel.handle_request_reply(false)
            }
            SSH_MSG_GLOBAL_REQUEST => self.handle_global_request(&mut reader).await,
            SSH_MSG_REQUEST_SUCCESS => self.handle_global_reply(true, &mut reader),
            SSH_MSG_REQUEST_FAILURE => self.handle_global_reply(false, &mut reader),
            _ => Err(Error::UnsupportedMessage { cmd }),
        }
    }

    /// A channel-scoped message naming an unknown recipient is an
    /// invariant violation, not recoverable.
    async fn lookup(&self, recipient: u32, cmd: u8) -> Result<Arc<Channel>> {
        self.channels
            .read()
            .await
            .get(&recipient)
            .cloned()
            .ok_or(Error::UnknownChannel { recipient, cmd })
    }

    async fn handle_channel_open(self: &Arc<Self>, reader: &mut WireReader) -> Result<()> {
        let open = ChannelOpen::decode(reader)?;
        debug!(
            kind = %open.channel_type,
            sender = open.sender,
            window = open.initial_window,
            packet = open.max_packet,
            "received CHANNEL_OPEN"
        );

        if self.close.is_begun() {
            return self.refuse_open(
                open.sender,
                SSH_OPEN_CONNECT_FAILED,
                format!(
                    "service is shutting down while attempting to open channel type={}",
                    open.channel_type
                ),
            );
        }
        let gated = self.config.gate_all_channel_types || open.channel_type == CHANNEL_SESSION;
        if !self.allow_more_sessions() && gated {
            return self.refuse_open(
                open.sender,
                SSH_OPEN_CONNECT_FAILED,
                "additional sessions disabled".to_string(),
            );
        }
        let Some(factory) = self.factories.get(&open.channel_type) else {
            return self.refuse_open(
                open.sender,
                SSH_OPEN_UNKNOWN_CHANNEL_TYPE,
                format!("Unsupported channel type: {}", open.channel_type),
            );
        };

        let kind = ChannelKind::from_name(&open.channel_type);
        let writer = Arc::clone(&self.writer);
        let config = self.config.clone();
        let channel = match self
            .register(move |id| {
                Channel::new_inbound(
                    id,
                    kind,
                    writer,
                    &config,
                    open.sender,
                    open.initial_window,
                    open.max_packet,
                )
            })
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                return self.refuse_open(open.sender, err.open_failure_code(), err.to_string());
            }
        };

        // The factory may do I/O before accepting; never block the
        // dispatcher on it.
        let service = Arc::clone(self);
        let factory = Arc::clone(factory);
        let sender = open.sender;
        let type_data = open.type_data;
        tokio::spawn(async move {
            match factory.accept(&channel, type_data).await {
                Ok(sink) => {
                    channel.mark_open(sink);
                    let confirm = ChannelOpenConfirmation {
                        recipient: sender,
                        sender: channel.local_id(),
                        window: channel.local_window().max_size(),
                        max_packet: channel.local_window().packet_size(),
                        type_data: Bytes::new(),
                    };
                    debug!(
                        channel = channel.local_id(),
                        remote = sender,
                        "sending OPEN_CONFIRMATION"
                    );
                    service.writer.write(confirm.encode());
                }
                Err(err) => {
                    service.unregister_channel(channel.local_id()).await;
                    channel.fail_session();
                    // A factory refusal carries its own reason verbatim;
                    // anything else gets the generic mapping.
                    let (code, message) = match err {
                        Error::OpenFailed { code, message } if code != 0 => (code, message),
                        other => (other.open_failure_code(), other.to_string()),
                    };
                    let _ = service.refuse_open(sender, code, message);
                }
            }
        });
        Ok(())
    }

    fn refuse_open(&self, sender: u32, reason_code: u32, message: String) -> Result<()> {
        debug!(
            sender,
            reason = open_error_name(reason_code),
            message = %message,
            "refusing CHANNEL_OPEN"
        );
        let fail = ChannelOpenFailure {
            recipient: sender,
            reason_code,
            message,
            language: String::new(),
        };
        self.writer.write(fail.encode());
        Ok(())
    }

    async fn handle_channel_request(
        self: &Arc<Self>,
        channel: Arc<Channel>,
        req: ChannelRequest,
    ) -> Result<()> {
        debug!(
            channel = channel.local_id(),
            request = %req.name,
            want_reply = req.want_reply,
            "received CHANNEL_REQUEST"
        );
        let outcome = self
            .router
            .route_channel(self, &channel, &req.name, req.want_reply, &req.payload)
            .await;
        match outcome {
            RequestOutcome::Replied => {}
            RequestOutcome::ReplySuccess => {
                if req.want_reply {
                    channel.send_request_reply(true);
                }
            }
            RequestOutcome::ReplyFailure | RequestOutcome::Unsupported => {
                if req.want_reply {
                    channel.send_request_reply(false);
                }
            }
        }
        Ok(())
    }

    async fn handle_global_request(self: &Arc<Self>, reader: &mut WireReader) -> Result<()> {
        let req = GlobalRequest::decode(reader)?;
        debug!(request = %req.name, want_reply = req.want_reply, "received GLOBAL_REQUEST");
        let outcome = self
            .router
            .route_global(self, &req.name, req.want_reply, &req.payload)
            .await;
        match outcome {
            RequestOutcome::Replied => {}
            RequestOutcome::ReplySuccess => {
                if req.want_reply {
                    self.writer
                        .write(PacketBuf::new(SSH_MSG_REQUEST_SUCCESS).freeze());
                }
            }
            RequestOutcome::ReplyFailure | RequestOutcome::Unsupported => {
                if req.want_reply {
                    self.send_request_failure();
                }
            }
        }
        Ok(())
    }

    fn handle_global_reply(&self, success: bool, reader: &mut WireReader) -> Result<()> {
        let payload = reader.take_rest();
        let tx = self
            .global_replies
            .lock()
            .expect("global replies lock")
            .pop_front()
            .ok_or_else(|| Error::protocol("global request reply with none pending"))?;
        let _ = tx.send(RequestReply { success, payload });
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Begin closing. The first caller picks the mode; every caller gets
    /// the same close future.
    pub fn close(self: &Arc<Self>, mode: CloseMode) -> CloseFuture {
        if self.close.begin() {
            let service = Arc::clone(self);
            tokio::spawn(async move { service.run_close(mode).await });
        }
        self.close.future()
    }

    /// Future resolving once the service has fully shut down.
    pub fn closed(&self) -> CloseFuture {
        self.close.future()
    }

    /// Immediate teardown driven inline (protocol violations).
    async fn shutdown_now(self: &Arc<Self>) {
        if self.close.begin() {
            Arc::clone(self).run_close(CloseMode::Immediate).await;
        } else if !self.close.is_done() {
            self.close.future().wait().await;
        }
    }

    async fn run_close(self: Arc<Self>, mode: CloseMode) {
        info!(?mode, "closing connection service");
        match mode {
            CloseMode::Graceful => {
                // Drain every channel: queued writes, EOF, CLOSE handshake.
                let snapshot: Vec<Arc<Channel>> =
                    self.channels.read().await.values().cloned().collect();
                let mut closings = Vec::with_capacity(snapshot.len());
                for channel in snapshot {
                    if channel.remote_id().is_none() {
                        // Never confirmed; there is no id to close on the wire.
                        channel.fail_session();
                    } else {
                        closings.push(channel.close_graceful());
                    }
                }
                for closing in closings {
                    let _ = closing.wait_timeout(self.config.close_timeout).await;
                }
                let remaining: Vec<Arc<Channel>> = {
                    let mut channels = self.channels.write().await;
                    channels.drain().map(|(_, ch)| ch).collect()
                };
                for channel in remaining {
                    channel.fail_session();
                }

                // Sub-services in sequence, then the transport.
                self.tcpip.close().await;
                self.agent.close().await;
                self.x11.close().await;
                self.writer.close_intake();
                self.writer.drained().await;
                self.sink.close().await;
            }
            CloseMode::Immediate => {
                let channels: Vec<Arc<Channel>> = {
                    let mut channels = self.channels.write().await;
                    channels.drain().map(|(_, ch)| ch).collect()
                };
                for channel in &channels {
                    channel.fail_session();
                }
                self.writer.abort();
                tokio::join!(self.tcpip.close(), self.agent.close(), self.x11.close());
                self.sink.close().await;
            }
        }
        self.close.finish();
        info!("connection service closed");
    }
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService")
            .field("closing", &self.close.is_begun())
            .finish()
    }
}
