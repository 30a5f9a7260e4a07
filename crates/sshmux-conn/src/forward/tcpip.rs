//! TCP/IP port forwarding.
//!
//! Two listener flavors share one accept-loop shape:
//! - remote forwards (peer sent `tcpip-forward`): accepted connections open
//!   `forwarded-tcpip` channels toward the peer;
//! - local forwards: accepted connections open `direct-tcpip` channels
//!   asking the peer to reach a target.

use std::collections::HashMap;
use std::sync::Weak;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use sshmux_core::{Error, Result};

use crate::channel::ChannelKind;
use crate::service::ConnectionService;

use super::{ForwardListener, promote_stream, tcpip_open_payload};

/// What an accepted connection should turn into.
#[derive(Clone)]
enum AcceptAction {
    /// `forwarded-tcpip` back to the peer, naming the bound endpoint.
    Forwarded { bind_host: String, bind_port: u16 },
    /// `direct-tcpip`, asking the peer to connect to the target.
    Direct {
        target_host: String,
        target_port: u16,
    },
}

/// The TCP/IP forwarder sub-service of one connection.
pub struct TcpipForwarder {
    service: Weak<ConnectionService>,
    /// Active listeners keyed by (bind host, bound port).
    listeners: Mutex<HashMap<(String, u16), ForwardListener>>,
}

impl TcpipForwarder {
    pub(crate) fn new(service: Weak<ConnectionService>) -> Self {
        Self {
            service,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn bind_addr(host: &str, port: u16) -> String {
        if host.is_empty() || host == "0.0.0.0" {
            format!("0.0.0.0:{port}")
        } else if host == "localhost" {
            format!("127.0.0.1:{port}")
        } else {
            format!("{host}:{port}")
        }
    }

    /// Bind a remote-forward listener; returns the actually bound port
    /// (meaningful when `bind_port` is 0).
    pub async fn listen(&self, bind_host: &str, bind_port: u16) -> Result<u16> {
        let mut listeners = self.listeners.lock().await;
        if bind_port != 0 && listeners.contains_key(&(bind_host.to_string(), bind_port)) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "forward already exists",
            )));
        }

        let listener = TcpListener::bind(Self::bind_addr(bind_host, bind_port)).await?;
        let bound_port = listener.local_addr()?.port();
        let action = AcceptAction::Forwarded {
            bind_host: bind_host.to_string(),
            bind_port: bound_port,
        };
        let entry = self.spawn_accept_loop(listener, action);
        listeners.insert((bind_host.to_string(), bound_port), entry);
        Ok(bound_port)
    }

    /// Bind a local-forward listener; accepted connections ask the peer to
    /// reach `target_host:target_port`.
    pub async fn listen_local(
        &self,
        bind_host: &str,
        bind_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Result<u16> {
        let mut listeners = self.listeners.lock().await;
        let listener = TcpListener::bind(Self::bind_addr(bind_host, bind_port)).await?;
        let bound_port = listener.local_addr()?.port();
        let action = AcceptAction::Direct {
            target_host: target_host.to_string(),
            target_port,
        };
        let entry = self.spawn_accept_loop(listener, action);
        listeners.insert((bind_host.to_string(), bound_port), entry);
        info!(bind_host = %bind_host, bound_port, target = %format!("{target_host}:{target_port}"), "local forward listening");
        Ok(bound_port)
    }

    /// Stop the listener on (bind_host, bind_port).
    pub async fn unlisten(&self, bind_host: &str, bind_port: u16) -> Result<()> {
        let entry = self
            .listeners
            .lock()
            .await
            .remove(&(bind_host.to_string(), bind_port));
        match entry {
            Some(entry) => {
                entry.stop().await;
                info!(bind_host = %bind_host, bind_port, "forward cancelled");
                Ok(())
            }
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such forward",
            ))),
        }
    }

    fn spawn_accept_loop(&self, listener: TcpListener, action: AcceptAction) -> ForwardListener {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let service = self.service.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("forward listener shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                warn!(error = %err, "accept failed on forward listener");
                                continue;
                            }
                        };
                        let Some(service) = service.upgrade() else { break };
                        debug!(peer = %peer, "accepted forwarded connection");

                        let (kind, type_data) = match &action {
                            AcceptAction::Forwarded { bind_host, bind_port } => (
                                ChannelKind::ForwardedTcpip,
                                tcpip_open_payload(
                                    bind_host,
                                    *bind_port,
                                    &peer.ip().to_string(),
                                    peer.port(),
                                ),
                            ),
                            AcceptAction::Direct { target_host, target_port } => (
                                ChannelKind::DirectTcpip,
                                tcpip_open_payload(
                                    target_host,
                                    *target_port,
                                    &peer.ip().to_string(),
                                    peer.port(),
                                ),
                            ),
                        };

                        let (read_half, write_half) = stream.into_split();
                        tokio::spawn(promote_stream(
                            service, kind, type_data, read_half, write_half,
                        ));
                    }
                }
            }
        });
        ForwardListener::new(task, shutdown_tx)
    }

    /// Tear down every listener. Called on service shutdown.
    pub(crate) async fn close(&self) {
        let entries: Vec<_> = {
            let mut listeners = self.listeners.lock().await;
            listeners.drain().collect()
        };
        for ((host, port), entry) in entries {
            debug!(bind_host = %host, bind_port = port, "stopping forward listener");
            entry.stop().await;
        }
    }
}
