//! Ordered handler chains for global and channel requests.
//!
//! A request walks the chain until some handler returns an outcome other
//! than `Unsupported`. Handler errors never reach the dispatch loop; they
//! are logged and reported to the peer as a failure. Handlers should not
//! block the dispatcher: one that needs slow I/O replies on its own
//! (returning `Replied`) and completes asynchronously.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{trace, warn};

use sshmux_core::Result;
use sshmux_core::wire::WireReader;

use crate::channel::Channel;
use crate::service::ConnectionService;

/// What the router should do after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Handler already wrote the reply (or will, asynchronously).
    Replied,
    /// Send SUCCESS iff the requester asked for a reply.
    ReplySuccess,
    /// Send FAILURE iff the requester asked for a reply.
    ReplyFailure,
    /// Not this handler's request; try the next one.
    Unsupported,
}

/// Processor for session-scoped requests (SSH_MSG_GLOBAL_REQUEST).
#[async_trait]
pub trait GlobalRequestHandler: Send + Sync {
    async fn process(
        &self,
        service: &Arc<ConnectionService>,
        name: &str,
        want_reply: bool,
        payload: &mut WireReader,
    ) -> Result<RequestOutcome>;
}

/// Processor for channel-scoped requests (SSH_MSG_CHANNEL_REQUEST).
#[async_trait]
pub trait ChannelRequestHandler: Send + Sync {
    async fn process(
        &self,
        service: &Arc<ConnectionService>,
        channel: &Arc<Channel>,
        name: &str,
        want_reply: bool,
        payload: &mut WireReader,
    ) -> Result<RequestOutcome>;
}

/// The two handler chains of one service.
pub struct RequestRouter {
    global: Vec<Arc<dyn GlobalRequestHandler>>,
    channel: Vec<Arc<dyn ChannelRequestHandler>>,
}

impl RequestRouter {
    pub(crate) fn new(
        global: Vec<Arc<dyn GlobalRequestHandler>>,
        channel: Vec<Arc<dyn ChannelRequestHandler>>,
    ) -> Self {
        Self { global, channel }
    }

    /// Run the global chain. `Unsupported` means no handler accepted.
    pub(crate) async fn route_global(
        &self,
        service: &Arc<ConnectionService>,
        name: &str,
        want_reply: bool,
        payload: &Bytes,
    ) -> RequestOutcome {
        for handler in &self.global {
            // Each handler gets a fresh reader over the same payload.
            let mut reader = WireReader::new(payload.clone());
            match handler.process(service, name, want_reply, &mut reader).await {
                Ok(RequestOutcome::Unsupported) => {
                    trace!(request = name, "handler passed");
                }
                Ok(outcome) => return outcome,
                Err(err) => {
                    warn!(request = name, want_reply, error = %err, "global request handler failed");
                    return RequestOutcome::ReplyFailure;
                }
            }
        }
        warn!(request = name, "unknown global request");
        RequestOutcome::Unsupported
    }

    /// Run the channel chain. `Unsupported` means no handler accepted.
    pub(crate) async fn route_channel(
        &self,
        service: &Arc<ConnectionService>,
        channel: &Arc<Channel>,
        name: &str,
        want_reply: bool,
        payload: &Bytes,
    ) -> RequestOutcome {
        for handler in &self.channel {
            let mut reader = WireReader::new(payload.clone());
            match handler
                .process(service, channel, name, want_reply, &mut reader)
                .await
            {
                Ok(RequestOutcome::Unsupported) => {
                    trace!(channel = channel.local_id(), request = name, "handler passed");
                }
                Ok(outcome) => return outcome,
                Err(err) => {
                    warn!(
                        channel = channel.local_id(),
                        request = name,
                        error = %err,
                        "channel request handler failed"
                    );
                    return RequestOutcome::ReplyFailure;
                }
            }
        }
        warn!(channel = channel.local_id(), request = name, "unknown channel request");
        RequestOutcome::Unsupported
    }
}
