//! Built-in global request handlers.
//!
//! The router knows nothing about request semantics; these handlers cover
//! the connection-level requests every deployment wants: remote forward
//! setup/teardown and the OpenSSH session gate.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use sshmux_core::constants::{
    REQUEST_CANCEL_TCPIP_FORWARD, REQUEST_NO_MORE_SESSIONS, REQUEST_TCPIP_FORWARD,
};
use sshmux_core::wire::WireReader;
use sshmux_core::{Error, Result};

use crate::router::{GlobalRequestHandler, RequestOutcome};
use crate::service::ConnectionService;

fn read_forward_target(payload: &mut WireReader) -> Result<(String, u16)> {
    let address = payload.get_string()?;
    let port = payload.get_u32()?;
    if port > u32::from(u16::MAX) {
        return Err(Error::codec(format!("port {port} out of range")));
    }
    Ok((address, port as u16))
}

/// `tcpip-forward`: bind a listener whose connections become
/// `forwarded-tcpip` channels toward the peer.
pub struct TcpipForwardHandler;

#[async_trait]
impl GlobalRequestHandler for TcpipForwardHandler {
    async fn process(
        &self,
        service: &Arc<ConnectionService>,
        name: &str,
        want_reply: bool,
        payload: &mut WireReader,
    ) -> Result<RequestOutcome> {
        if name != REQUEST_TCPIP_FORWARD {
            return Ok(RequestOutcome::Unsupported);
        }
        let (bind_host, bind_port) = read_forward_target(payload)?;
        debug!(bind_host = %bind_host, bind_port, want_reply, "tcpip-forward");

        let bound_port = service
            .tcpip_forwarder()
            .listen(&bind_host, bind_port)
            .await?;
        info!(bind_host = %bind_host, requested = bind_port, bound = bound_port, "remote forward listening");

        // A wildcard port request is answered with the port actually bound.
        if want_reply && bind_port == 0 {
            service.send_request_success(Bytes::copy_from_slice(
                &u32::from(bound_port).to_be_bytes(),
            ));
            return Ok(RequestOutcome::Replied);
        }
        Ok(RequestOutcome::ReplySuccess)
    }
}

/// `cancel-tcpip-forward`: tear down a listener created by `tcpip-forward`.
pub struct CancelTcpipForwardHandler;

#[async_trait]
impl GlobalRequestHandler for CancelTcpipForwardHandler {
    async fn process(
        &self,
        service: &Arc<ConnectionService>,
        name: &str,
        want_reply: bool,
        payload: &mut WireReader,
    ) -> Result<RequestOutcome> {
        if name != REQUEST_CANCEL_TCPIP_FORWARD {
            return Ok(RequestOutcome::Unsupported);
        }
        let (bind_host, bind_port) = read_forward_target(payload)?;
        debug!(bind_host = %bind_host, bind_port, want_reply, "cancel-tcpip-forward");

        match service
            .tcpip_forwarder()
            .unlisten(&bind_host, bind_port)
            .await
        {
            Ok(()) => Ok(RequestOutcome::ReplySuccess),
            Err(err) => {
                debug!(bind_host = %bind_host, bind_port, error = %err, "no such forward");
                Ok(RequestOutcome::ReplyFailure)
            }
        }
    }
}

/// `no-more-sessions@openssh.com`: refuse further session opens.
pub struct NoMoreSessionsHandler;

#[async_trait]
impl GlobalRequestHandler for NoMoreSessionsHandler {
    async fn process(
        &self,
        service: &Arc<ConnectionService>,
        name: &str,
        _want_reply: bool,
        _payload: &mut WireReader,
    ) -> Result<RequestOutcome> {
        if name != REQUEST_NO_MORE_SESSIONS {
            return Ok(RequestOutcome::Unsupported);
        }
        service.set_allow_more_sessions(false);
        Ok(RequestOutcome::ReplySuccess)
    }
}
