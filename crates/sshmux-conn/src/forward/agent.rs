//! Agent forwarding.
//!
//! A local socket stands in for the authentication agent; each client
//! connecting to it becomes an `auth-agent@openssh.com` channel toward the
//! peer, which relays to the real agent. Platform-native socket glue stays
//! outside this core; on Unix we use the ordinary domain-socket listener.

use std::path::{Path, PathBuf};
use std::sync::Weak;

use tokio::sync::Mutex;
use tracing::debug;

use sshmux_core::Result;

use crate::service::ConnectionService;

use super::ForwardListener;

/// The agent forwarding sub-service of one connection.
pub struct AgentForward {
    service: Weak<ConnectionService>,
    listener: Mutex<Option<(PathBuf, ForwardListener)>>,
}

impl AgentForward {
    pub(crate) fn new(service: Weak<ConnectionService>) -> Self {
        Self {
            service,
            listener: Mutex::new(None),
        }
    }

    /// Path of the proxy socket, if forwarding is active.
    pub async fn socket_path(&self) -> Option<PathBuf> {
        self.listener
            .lock()
            .await
            .as_ref()
            .map(|(path, _)| path.clone())
    }

    /// Bind the proxy socket at `path`; idempotent while running.
    #[cfg(unix)]
    pub async fn start(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        use bytes::Bytes;
        use tokio::net::UnixListener;
        use tokio::sync::mpsc;
        use tracing::warn;

        use crate::channel::ChannelKind;

        use super::promote_stream;

        let mut guard = self.listener.lock().await;
        if let Some((existing, _)) = guard.as_ref() {
            return Ok(existing.clone());
        }

        let path = path.as_ref().to_path_buf();
        let listener = UnixListener::bind(&path)?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let service = self.service.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => {
                        let (stream, _) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                warn!(error = %err, "accept failed on agent socket");
                                continue;
                            }
                        };
                        let Some(service) = service.upgrade() else { break };
                        debug!("accepted agent client");
                        let (read_half, write_half) = stream.into_split();
                        tokio::spawn(promote_stream(
                            service,
                            ChannelKind::Agent,
                            Bytes::new(),
                            read_half,
                            write_half,
                        ));
                    }
                }
            }
        });

        *guard = Some((path.clone(), ForwardListener::new(task, shutdown_tx)));
        debug!(path = %path.display(), "agent forwarding listening");
        Ok(path)
    }

    #[cfg(not(unix))]
    pub async fn start(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let _ = path;
        Err(sshmux_core::Error::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "agent forwarding requires unix domain sockets",
        )))
    }

    /// Stop the listener and remove the socket file. Called on service
    /// shutdown; idempotent.
    pub(crate) async fn close(&self) {
        if let Some((path, entry)) = self.listener.lock().await.take() {
            debug!(path = %path.display(), "stopping agent listener");
            entry.stop().await;
            let _ = std::fs::remove_file(&path);
        }
    }
}
