//! Connection-service configuration.

use std::time::Duration;

use crate::constants::{
    DEFAULT_CLOSE_TIMEOUT, DEFAULT_MAX_CHANNELS, DEFAULT_OPEN_TIMEOUT, DEFAULT_PACKET_SIZE,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_WINDOW_SIZE,
};

/// Tunables for one connection service instance.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Initial local window advertised for new channels.
    pub window_size: u32,
    /// Maximum packet size advertised for new channels.
    pub packet_size: u32,
    /// Cap on concurrently open channels.
    pub max_channels: u32,
    /// Bound on the channel-open handshake.
    pub open_timeout: Duration,
    /// Bound on a want-reply request round trip.
    pub request_timeout: Duration,
    /// Bound on the per-channel graceful close handshake.
    pub close_timeout: Duration,
    /// When more sessions are disallowed, refuse every channel type instead
    /// of only `"session"` opens. RFC 4254 reads as session-only; some
    /// deployments gate everything.
    pub gate_all_channel_types: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            packet_size: DEFAULT_PACKET_SIZE,
            max_channels: DEFAULT_MAX_CHANNELS,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            gate_all_channel_types: false,
        }
    }
}
