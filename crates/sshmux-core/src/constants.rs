//! Protocol and configuration constants for sshmux.

use std::time::Duration;

// =============================================================================
// Message Numbers (RFC 4254)
// =============================================================================

pub const SSH_MSG_GLOBAL_REQUEST: u8 = 80;
pub const SSH_MSG_REQUEST_SUCCESS: u8 = 81;
pub const SSH_MSG_REQUEST_FAILURE: u8 = 82;

pub const SSH_MSG_CHANNEL_OPEN: u8 = 90;
pub const SSH_MSG_CHANNEL_OPEN_CONFIRMATION: u8 = 91;
pub const SSH_MSG_CHANNEL_OPEN_FAILURE: u8 = 92;
pub const SSH_MSG_CHANNEL_WINDOW_ADJUST: u8 = 93;
pub const SSH_MSG_CHANNEL_DATA: u8 = 94;
pub const SSH_MSG_CHANNEL_EXTENDED_DATA: u8 = 95;
pub const SSH_MSG_CHANNEL_EOF: u8 = 96;
pub const SSH_MSG_CHANNEL_CLOSE: u8 = 97;
pub const SSH_MSG_CHANNEL_REQUEST: u8 = 98;
pub const SSH_MSG_CHANNEL_SUCCESS: u8 = 99;
pub const SSH_MSG_CHANNEL_FAILURE: u8 = 100;

/// Human-readable name of a connection-service message number.
pub fn message_name(cmd: u8) -> &'static str {
    match cmd {
        SSH_MSG_GLOBAL_REQUEST => "SSH_MSG_GLOBAL_REQUEST",
        SSH_MSG_REQUEST_SUCCESS => "SSH_MSG_REQUEST_SUCCESS",
        SSH_MSG_REQUEST_FAILURE => "SSH_MSG_REQUEST_FAILURE",
        SSH_MSG_CHANNEL_OPEN => "SSH_MSG_CHANNEL_OPEN",
        SSH_MSG_CHANNEL_OPEN_CONFIRMATION => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
        SSH_MSG_CHANNEL_OPEN_FAILURE => "SSH_MSG_CHANNEL_OPEN_FAILURE",
        SSH_MSG_CHANNEL_WINDOW_ADJUST => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
        SSH_MSG_CHANNEL_DATA => "SSH_MSG_CHANNEL_DATA",
        SSH_MSG_CHANNEL_EXTENDED_DATA => "SSH_MSG_CHANNEL_EXTENDED_DATA",
        SSH_MSG_CHANNEL_EOF => "SSH_MSG_CHANNEL_EOF",
        SSH_MSG_CHANNEL_CLOSE => "SSH_MSG_CHANNEL_CLOSE",
        SSH_MSG_CHANNEL_REQUEST => "SSH_MSG_CHANNEL_REQUEST",
        SSH_MSG_CHANNEL_SUCCESS => "SSH_MSG_CHANNEL_SUCCESS",
        SSH_MSG_CHANNEL_FAILURE => "SSH_MSG_CHANNEL_FAILURE",
        _ => "SSH_MSG_UNKNOWN",
    }
}

// =============================================================================
// Channel Open Failure Reason Codes (RFC 4254 section 5.1)
// =============================================================================

pub const SSH_OPEN_ADMINISTRATIVELY_PROHIBITED: u32 = 1;
pub const SSH_OPEN_CONNECT_FAILED: u32 = 2;
pub const SSH_OPEN_UNKNOWN_CHANNEL_TYPE: u32 = 3;
pub const SSH_OPEN_RESOURCE_SHORTAGE: u32 = 4;

/// Human-readable name of an open-failure reason code.
pub fn open_error_name(code: u32) -> &'static str {
    match code {
        SSH_OPEN_ADMINISTRATIVELY_PROHIBITED => "SSH_OPEN_ADMINISTRATIVELY_PROHIBITED",
        SSH_OPEN_CONNECT_FAILED => "SSH_OPEN_CONNECT_FAILED",
        SSH_OPEN_UNKNOWN_CHANNEL_TYPE => "SSH_OPEN_UNKNOWN_CHANNEL_TYPE",
        SSH_OPEN_RESOURCE_SHORTAGE => "SSH_OPEN_RESOURCE_SHORTAGE",
        _ => "SSH_OPEN_UNKNOWN_CODE",
    }
}

// =============================================================================
// Extended Data Type Codes (RFC 4254 section 5.2)
// =============================================================================

/// The only extended-data type code with standardized semantics.
pub const SSH_EXTENDED_DATA_STDERR: u32 = 1;

// =============================================================================
// Channel Types
// =============================================================================

pub const CHANNEL_SESSION: &str = "session";
pub const CHANNEL_DIRECT_TCPIP: &str = "direct-tcpip";
pub const CHANNEL_FORWARDED_TCPIP: &str = "forwarded-tcpip";
pub const CHANNEL_X11: &str = "x11";
pub const CHANNEL_AGENT: &str = "auth-agent@openssh.com";

// =============================================================================
// Request Names
// =============================================================================

pub const REQUEST_TCPIP_FORWARD: &str = "tcpip-forward";
pub const REQUEST_CANCEL_TCPIP_FORWARD: &str = "cancel-tcpip-forward";
pub const REQUEST_NO_MORE_SESSIONS: &str = "no-more-sessions@openssh.com";

// =============================================================================
// Default Values
// =============================================================================

/// Default initial window advertised for new channels (2 MiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 0x200000;

/// Default maximum packet size advertised for new channels (32 KiB).
pub const DEFAULT_PACKET_SIZE: u32 = 0x8000;

/// Default cap on concurrently open channels per session (effectively unbounded).
pub const DEFAULT_MAX_CHANNELS: u32 = u32::MAX;

/// Default bound on a channel-open handshake.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a want-reply request round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a graceful per-channel close handshake.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(15);
