//! A small Layer-4 TCP load balancer.
//!
//! Accepts connections on configured local endpoints and relays each one,
//! byte for byte, to a backend worker chosen round-robin. Connection-time
//! failures are retried against an alternate worker without dropping the
//! client.

use std::time::Duration;

pub mod config;
pub mod error;
mod listener;
pub mod logging;
pub mod server;
mod session;
mod shutdown;

pub use config::Config;
pub use error::Error;
pub(crate) use shutdown::Shutdown;

/// Relay read/write chunk size used when the config does not set one.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Total time the supervisor waits for listeners to drain on shutdown.
pub const GRACEFUL_SHUTDOWN_TIME: Duration = Duration::from_secs(6);

pub type Result<T> = std::result::Result<T, Error>;
