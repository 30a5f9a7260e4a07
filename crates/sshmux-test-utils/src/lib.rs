//! Test utilities for the sshmux connection service.
//!
//! Provides an in-memory packet endpoint standing in for the real
//! transport, plus recording sinks and canned channel factories.

pub mod factories;
pub mod mock_endpoint;
pub mod sinks;

pub use factories::{AcceptFactory, RefuseFactory};
pub use mock_endpoint::{MockEndpoint, feed};
pub use sinks::CollectSink;
