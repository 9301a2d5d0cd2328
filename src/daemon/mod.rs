//! Daemon mode - background process owning the debug sessions
//!
//! The daemon is spawned automatically by CLI commands. It runs the
//! runtimes, holds their inspector connections, and serves the Control API
//! and the push channel over the local IPC socket.

pub mod broadcast;
mod handler;
pub mod process;
pub mod registry;
pub mod script;
mod server;
pub mod session;

use crate::common::{config::Config, Result};

pub use registry::SessionRegistry;
pub use session::{SessionHandle, StepKind};

/// Run in daemon mode
///
/// This is the entry point when the binary is invoked with the hidden
/// `daemon` command.
pub async fn run() -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "Starting bridge daemon"
    );

    let config = Config::load()?;
    server::Daemon::new(config).run().await
}
