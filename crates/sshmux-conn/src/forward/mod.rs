//! Forwarder sub-services.
//!
//! Each forwarder owns accept sockets and promotes accepted connections
//! into channels owned by the connection service. The service closes the
//! three of them (tcpip, agent, x11) as part of its own shutdown.

mod agent;
mod tcpip;
mod x11;

pub use agent::AgentForward;
pub use tcpip::TcpipForwarder;
pub use x11::X11Forward;

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelKind, ChannelSink};
use crate::service::ConnectionService;

/// Read size for socket-to-channel relays.
pub(crate) const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Handle to one accept loop.
pub(crate) struct ForwardListener {
    task: JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl ForwardListener {
    pub(crate) fn new(task: JoinHandle<()>, shutdown_tx: mpsc::Sender<()>) -> Self {
        Self { task, shutdown_tx }
    }

    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        self.task.abort();
    }
}

enum SocketEvent {
    Data(Bytes),
    Eof,
    Closed,
}

/// Channel sink pumping inbound channel data into a socket write half.
pub(crate) struct SocketSink {
    tx: mpsc::UnboundedSender<SocketEvent>,
}

impl SocketSink {
    /// Spawn the write pump for a connected socket.
    pub(crate) fn spawn<W>(mut write_half: W) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SocketEvent::Data(data) => {
                        if write_half.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    SocketEvent::Eof => {
                        let _ = write_half.shutdown().await;
                    }
                    SocketEvent::Closed => break,
                }
            }
        });
        Arc::new(Self { tx })
    }
}

impl ChannelSink for SocketSink {
    fn data(&self, data: Bytes) {
        let _ = self.tx.send(SocketEvent::Data(data));
    }

    fn eof(&self) {
        let _ = self.tx.send(SocketEvent::Eof);
    }

    fn closed(&self) {
        let _ = self.tx.send(SocketEvent::Closed);
    }
}

/// Pump socket reads into the channel until EOF or error.
pub(crate) fn spawn_read_pump<R>(channel: Arc<Channel>, mut read_half: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = channel.send_eof();
                    break;
                }
                Ok(n) => {
                    if channel
                        .send_data(Bytes::copy_from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    debug!(channel = channel.local_id(), error = %err, "socket read failed");
                    channel.close();
                    break;
                }
            }
        }
    });
}

/// Open a channel for an accepted socket and wire both pumps once the peer
/// confirms.
pub(crate) async fn promote_stream<R, W>(
    service: Arc<ConnectionService>,
    kind: ChannelKind,
    type_data: Bytes,
    read_half: R,
    write_half: W,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let sink = SocketSink::spawn(write_half);
    match service.open_channel(kind, type_data, sink).await {
        Ok((channel, open)) => match open.wait().await {
            Ok(params) => {
                debug!(
                    channel = channel.local_id(),
                    remote = params.remote_id,
                    "forwarded channel confirmed"
                );
                spawn_read_pump(channel, read_half);
            }
            Err(err) => {
                warn!(error = %err, "peer refused forwarded channel");
            }
        },
        Err(err) => {
            warn!(error = %err, "could not register forwarded channel");
        }
    }
}

/// Type-specific payload for `forwarded-tcpip` / `direct-tcpip` opens:
/// connected (or target) endpoint followed by the originator endpoint.
pub(crate) fn tcpip_open_payload(
    address: &str,
    port: u16,
    originator: &str,
    originator_port: u16,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + address.len() + originator.len());
    buf.put_u32(address.len() as u32);
    buf.put_slice(address.as_bytes());
    buf.put_u32(u32::from(port));
    buf.put_u32(originator.len() as u32);
    buf.put_slice(originator.as_bytes());
    buf.put_u32(u32::from(originator_port));
    buf.freeze()
}

/// Type-specific payload for `x11` opens: originator endpoint only.
pub(crate) fn x11_open_payload(originator: &str, originator_port: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + originator.len());
    buf.put_u32(originator.len() as u32);
    buf.put_slice(originator.as_bytes());
    buf.put_u32(u32::from(originator_port));
    buf.freeze()
}
