//! Portforwarded - run a process behind NAT with port mappings held for its lifetime
//!
//! This library discovers a UPnP gateway, maps the configured public ports to
//! local ports, supervises a child process while the mappings are up, and
//! removes the mappings again however the run ends.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod gateway;
pub mod mapping;
pub mod supervisor;

pub use cancel::{Cancellation, Interrupter};
pub use config::Settings;
pub use coordinator::{Coordinator, ExitReason, RunReport, RunState};

/// Result type alias for Portforwarded operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Portforwarded operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Settings are missing or malformed
    #[error("Configuration invalid: {0}")]
    ConfigInvalid(String),

    /// Discovery finished without a gateway
    #[error("No UPnP gateway found")]
    NoGateway,

    /// Gateway call failed
    #[error("Gateway error: {0}")]
    Gateway(#[from] gateway::GatewayError),

    /// Executable or working directory could not be used
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

/// Initialize logging
///
/// `RUST_LOG` wins when set; otherwise `verbosity` picks the level
/// (0 = info, 1 = debug, 2+ = trace).
pub fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Ignore the error when a subscriber is already installed (tests, embedding)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests;
