//! Error types for the sshmux stack.

use thiserror::Error;

use crate::constants::{SSH_OPEN_CONNECT_FAILED, SSH_OPEN_RESOURCE_SHORTAGE, message_name};

/// Main error type for connection-service operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the transport or a forwarded socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer violated the protocol; fatal to the session.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Malformed message payload.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Channel-scoped message named a recipient we do not know.
    #[error("received {} on unknown channel {recipient}", message_name(*.cmd))]
    UnknownChannel { recipient: u32, cmd: u8 },

    /// Message number outside the connection-service repertoire.
    #[error("unsupported command: {}", message_name(*.cmd))]
    UnsupportedMessage { cmd: u8 },

    /// Flow-control credit exhausted.
    #[error("window exhausted: requested {requested}, available {available}")]
    WindowExhausted { requested: u32, available: u32 },

    /// Window adjust would grow past the negotiated maximum.
    #[error("window overflow: size {size} + adjust {delta} exceeds {max}")]
    WindowOverflow { size: u32, delta: u32, max: u32 },

    /// Concurrent channel cap reached.
    #[error("too many channels: limit {limit} reached")]
    TooManyChannels { limit: u32 },

    /// Service is shutting down; no new channels.
    #[error("connection service is closing")]
    ServiceClosing,

    /// Operation raced with channel or session close.
    #[error("channel closed")]
    ClosedChannel,

    /// Peer refused a channel open.
    #[error("channel open failed (code {code}): {message}")]
    OpenFailed { code: u32, message: String },

    /// An awaited operation did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// A pending operation was cancelled before it started.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns true for errors that must tear down the whole session.
    ///
    /// Everything caused by peer misbehavior below the channel API is
    /// unrecoverable; local capacity/policy refusals and per-operation
    /// outcomes are not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol { .. }
                | Error::Codec { .. }
                | Error::UnknownChannel { .. }
                | Error::UnsupportedMessage { .. }
                | Error::WindowExhausted { .. }
                | Error::WindowOverflow { .. }
        )
    }

    /// Reason code to report when this error aborts an inbound channel open.
    pub fn open_failure_code(&self) -> u32 {
        match self {
            Error::TooManyChannels { .. } => SSH_OPEN_RESOURCE_SHORTAGE,
            Error::ServiceClosing => SSH_OPEN_CONNECT_FAILED,
            Error::OpenFailed { code, .. } if *code != 0 => *code,
            _ => SSH_OPEN_CONNECT_FAILED,
        }
    }

    /// Shorthand for a protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Shorthand for a malformed payload.
    pub fn codec(message: impl Into<String>) -> Self {
        Error::Codec {
            message: message.into(),
        }
    }
}

/// Convenience result type for sshmux operations.
pub type Result<T> = std::result::Result<T, Error>;
