//! Error types for the debug bridge
//!
//! Every Control API failure maps onto one of these variants, and from
//! there onto a stable wire code (see [`IpcError`]) so CLI users and
//! dashboard clients get a clear error kind plus a readable message.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the debug bridge
#[derive(Error, Debug)]
pub enum Error {
    // === Daemon/Connection Errors ===
    #[error("Bridge daemon not running. Start a session with 'devdock-bridge start <script>'")]
    DaemonNotRunning,

    #[error("Failed to spawn daemon: timed out waiting for socket after {0} seconds")]
    DaemonSpawnTimeout(u64),

    #[error("Failed to connect to daemon: {0}")]
    DaemonConnectionFailed(#[source] io::Error),

    #[error("Daemon communication error: {0}")]
    DaemonCommunication(String),

    // === Session Lifecycle Errors ===
    #[error("Failed to launch runtime: {0}")]
    LaunchFailure(String),

    #[error("Debugger unreachable on port {port} after {attempts} attempts")]
    DebuggerUnreachable { port: u16, attempts: u32 },

    #[error("Inspector connection lost: {0}")]
    ConnectionLost(String),

    #[error("Cannot {action} while session is {state}")]
    InvalidSessionState { action: String, state: String },

    // === Lookup Errors ===
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("No active session. Use 'devdock-bridge start <script>' first")]
    NoActiveSession,

    #[error("Breakpoint {0} not found")]
    BreakpointNotFound(String),

    #[error("Scope '{0}' not found in the current frame")]
    ScopeNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Protocol Errors ===
    #[error("Inspector request '{method}' timed out after {secs} seconds")]
    RequestTimeout { method: String, secs: u64 },

    #[error("Inspector request '{method}' failed: {message}")]
    ProtocolError { method: String, message: String },

    #[error("Malformed inspector message: {0}")]
    MalformedMessage(String),

    // === Configuration Errors ===
    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid session state error
    pub fn invalid_state(action: &str, state: impl std::fmt::Display) -> Self {
        Self::InvalidSessionState {
            action: action.to_string(),
            state: state.to_string(),
        }
    }

    /// Create a protocol error from a failed inspector reply
    pub fn protocol(method: &str, message: &str) -> Self {
        Self::ProtocolError {
            method: method.to_string(),
            message: message.to_string(),
        }
    }
}

/// IPC-serializable error for daemon responses
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IpcError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for IpcError {
    fn from(e: &Error) -> Self {
        let code = match e {
            Error::DaemonNotRunning => "DAEMON_NOT_RUNNING",
            Error::LaunchFailure(_) => "LAUNCH_FAILURE",
            Error::DebuggerUnreachable { .. } => "DEBUGGER_UNREACHABLE",
            Error::ConnectionLost(_) => "CONNECTION_LOST",
            Error::InvalidSessionState { .. } => "INVALID_SESSION_STATE",
            Error::SessionNotFound(_) | Error::NoActiveSession => "SESSION_NOT_FOUND",
            Error::BreakpointNotFound(_) => "BREAKPOINT_NOT_FOUND",
            Error::ScopeNotFound(_) => "SCOPE_NOT_FOUND",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Error::ProtocolError { .. } | Error::MalformedMessage(_) => "PROTOCOL_ERROR",
            _ => "INTERNAL_ERROR",
        }
        .to_string();

        Self {
            code,
            message: e.to_string(),
        }
    }
}

impl From<IpcError> for Error {
    fn from(e: IpcError) -> Self {
        // Only variants whose payload survives the trip are rebuilt; the
        // message already carries the details for everything else.
        match e.code.as_str() {
            "DAEMON_NOT_RUNNING" => Error::DaemonNotRunning,
            "LAUNCH_FAILURE" => Error::LaunchFailure(detail(e.message, "Failed to launch runtime: ")),
            "CONNECTION_LOST" => Error::ConnectionLost(detail(e.message, "Inspector connection lost: ")),
            _ => Error::DaemonCommunication(format!("[{}] {}", e.code, e.message)),
        }
    }
}

/// Strip the display prefix so rebuilding the variant does not repeat it
fn detail(message: String, prefix: &str) -> String {
    match message.strip_prefix(prefix) {
        Some(rest) => rest.to_string(),
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_codes() {
        let err = Error::invalid_state("step over", "running");
        let ipc = IpcError::from(&err);
        assert_eq!(ipc.code, "INVALID_SESSION_STATE");
        assert_eq!(ipc.message, "Cannot step over while session is running");

        let ipc = IpcError::from(&Error::RequestTimeout {
            method: "Debugger.resume".to_string(),
            secs: 30,
        });
        assert_eq!(ipc.code, "REQUEST_TIMEOUT");
    }

    #[test]
    fn test_rebuilt_error_keeps_single_prefix() {
        let sent = Error::LaunchFailure("runtime 'node' not found".to_string());
        let received = Error::from(IpcError::from(&sent));
        assert_eq!(received.to_string(), sent.to_string());

        let received = Error::from(IpcError {
            code: "SESSION_NOT_FOUND".to_string(),
            message: "Session abc not found".to_string(),
        });
        assert!(received.to_string().contains("Session abc not found"));
    }
}
