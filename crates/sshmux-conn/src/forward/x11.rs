//! X11 forwarding.
//!
//! One loopback listener per connection; each accepted X client becomes an
//! `x11` channel toward the peer.

use std::net::SocketAddr;
use std::sync::Weak;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use sshmux_core::Result;

use crate::channel::ChannelKind;
use crate::service::ConnectionService;

use super::{ForwardListener, promote_stream, x11_open_payload};

/// The X11 forwarding sub-service of one connection.
pub struct X11Forward {
    service: Weak<ConnectionService>,
    listener: Mutex<Option<(SocketAddr, ForwardListener)>>,
}

impl X11Forward {
    pub(crate) fn new(service: Weak<ConnectionService>) -> Self {
        Self {
            service,
            listener: Mutex::new(None),
        }
    }

    /// Address X clients should connect to, if forwarding is active.
    pub async fn address(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|(addr, _)| *addr)
    }

    /// Start the loopback listener; idempotent.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut guard = self.listener.lock().await;
        if let Some((addr, _)) = guard.as_ref() {
            return Ok(*addr);
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let service = self.service.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                warn!(error = %err, "accept failed on X11 listener");
                                continue;
                            }
                        };
                        let Some(service) = service.upgrade() else { break };
                        debug!(peer = %peer, "accepted X11 client");
                        let type_data = x11_open_payload(&peer.ip().to_string(), peer.port());
                        let (read_half, write_half) = stream.into_split();
                        tokio::spawn(promote_stream(
                            service,
                            ChannelKind::X11,
                            type_data,
                            read_half,
                            write_half,
                        ));
                    }
                }
            }
        });

        *guard = Some((addr, ForwardListener::new(task, shutdown_tx)));
        debug!(%addr, "X11 forwarding listening");
        Ok(addr)
    }

    /// Stop the listener. Called on service shutdown; idempotent.
    pub(crate) async fn close(&self) {
        if let Some((addr, entry)) = self.listener.lock().await.take() {
            debug!(%addr, "stopping X11 listener");
            entry.stop().await;
        }
    }
}
