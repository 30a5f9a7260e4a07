//! sshmux-conn: the SSH-2 Connection Service (RFC 4254).
//!
//! This crate multiplexes logical channels over one already-authenticated,
//! encrypted transport:
//! - Channel registry and inbound packet dispatcher
//! - Per-channel state machine with window accounting
//! - Ordered handler chains for global and channel requests
//! - TCP/X11/agent forwarders that promote sockets into channels
//! - Graceful and immediate shutdown coordination

pub mod channel;
pub mod close;
pub mod forward;
pub mod future;
pub mod handlers;
pub mod router;
pub mod service;
pub mod transport;

pub use channel::{Channel, ChannelKind, ChannelSink, NullSink, Phase};
pub use close::CloseMode;
pub use forward::{AgentForward, TcpipForwarder, X11Forward};
pub use future::{
    CloseFuture, OpenFuture, RemoteParams, RequestFuture, RequestReply, WriteFuture,
};
pub use handlers::{CancelTcpipForwardHandler, NoMoreSessionsHandler, TcpipForwardHandler};
pub use router::{ChannelRequestHandler, GlobalRequestHandler, RequestOutcome, RequestRouter};
pub use service::{ChannelFactory, ConnectionService, ConnectionServiceBuilder};
pub use transport::{PacketSink, PacketWriter};
