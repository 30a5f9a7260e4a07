//! sshmux-core: protocol-level building blocks for the connection service.
//!
//! This crate provides:
//! - RFC 4254 message numbers, reason codes and defaults
//! - Binary wire encoding and typed message payloads
//! - Per-direction flow-control windows
//! - Error taxonomy shared across the stack
//! - Connection configuration
//! - Logging setup

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod window;
pub mod wire;

pub use config::ConnectionConfig;
pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
pub use window::Window;
