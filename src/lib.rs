//! devdock-bridge - remote debugging bridge for script sessions
//!
//! Launches a script under a V8-inspector runtime, attaches to its debug
//! port over WebSocket, and exposes the session through a local Control API
//! and a push channel for observers.

pub mod cli;
pub mod commands;
pub mod common;
pub mod daemon;
pub mod inspector;
pub mod ipc;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use ipc::protocol::{Command, PushMessage, SessionStatus};
