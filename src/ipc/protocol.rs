//! IPC protocol message types
//!
//! Defines the request/response format for the Control API and the
//! messages pushed to observers. Uses a simple length-prefixed JSON
//! protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::error::IpcError;

/// IPC request from CLI to daemon
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for matching responses
    pub id: u64,
    /// The command to execute
    pub command: Command,
}

/// IPC response from daemon to CLI
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    /// Request ID this response corresponds to
    pub id: u64,
    /// Whether the command succeeded
    pub success: bool,
    /// Result data on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error information on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
}

impl Response {
    /// Create a success response
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: u64, error: IpcError) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error),
        }
    }

    /// Create a success response with no data
    pub fn ok(id: u64) -> Self {
        Self::success(id, serde_json::json!({}))
    }
}

/// Commands that can be sent from CLI to daemon
///
/// `session: None` addresses the most recently started session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    // === Session Management ===
    /// Start a session from source text
    Start {
        code: String,
        #[serde(default)]
        break_on_start: bool,
        /// Block until the session has left `launching`
        #[serde(default)]
        wait: bool,
    },

    /// Stop a session (terminates the runtime)
    Stop { session: Option<String> },

    /// List all known sessions
    List,

    /// Get one session's detail
    Detail {
        session: Option<String>,
        #[serde(default = "default_tail")]
        console_tail: usize,
    },

    /// Daemon status
    Status,

    // === Breakpoints ===
    /// Set a breakpoint; `file: None` means the session's own script
    BreakpointSet {
        session: Option<String>,
        file: Option<String>,
        line: u32,
    },

    /// Remove a breakpoint by its protocol id
    BreakpointRemove { session: Option<String>, id: String },

    // === Execution Control ===
    StepOver { session: Option<String> },
    StepInto { session: Option<String> },
    StepOut { session: Option<String> },
    Continue { session: Option<String> },
    Pause { session: Option<String> },

    // === State Inspection ===
    Evaluate {
        session: Option<String>,
        expression: String,
    },

    Variables {
        session: Option<String>,
        scope: String,
    },

    Console {
        session: Option<String>,
        #[serde(default = "default_tail")]
        max: usize,
    },

    // === Push Channel ===
    /// Turn this connection into a push channel
    Subscribe,

    // === Shutdown ===
    /// Stop all sessions and shut down the daemon
    Shutdown,
}

fn default_tail() -> usize {
    20
}

/// Debug session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Runtime spawned, inspector not connected yet
    Launching,
    /// Inspector connected, script executing
    Running,
    /// Stopped at a breakpoint, step or explicit pause
    Paused,
    /// Step/continue acknowledged, waiting for the next event
    Resumed,
    /// Ended cleanly or by request
    Stopped,
    /// Ended abnormally
    Crashed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launching => write!(f, "launching"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Resumed => write!(f, "resumed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

// === Result types for responses ===

/// Runtime-resolved breakpoint location (1-based line)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLocation {
    pub script_id: String,
    pub line: u32,
    pub column: Option<u32>,
}

/// Breakpoint information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointInfo {
    /// Protocol-assigned identifier
    pub id: String,
    pub file: String,
    pub line: u32,
    pub locations: Vec<ResolvedLocation>,
}

/// One captured console line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    /// `stdout`, `stderr`, `exception`, or a console API type like `log`
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Where execution is paused (1-based line and column)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub function_name: String,
}

/// Session list entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub breakpoints: Vec<BreakpointInfo>,
}

/// Full session view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub id: String,
    pub status: SessionStatus,
    pub script_path: String,
    pub breakpoints: Vec<BreakpointInfo>,
    pub console: Vec<ConsoleMessage>,
    pub pause_location: Option<PauseLocation>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Start/stop response
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionStateResult {
    pub session_id: String,
    pub status: SessionStatus,
}

/// Daemon status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResult {
    pub daemon_running: bool,
    pub pid: u32,
    pub active_session: Option<String>,
    pub session_count: usize,
    pub observers: usize,
}

/// Evaluate result, verbatim from the runtime
#[derive(Debug, Serialize, Deserialize)]
pub struct EvaluateResult {
    pub value: Value,
    #[serde(rename = "type")]
    pub value_type: String,
    pub description: Option<String>,
    /// Set when the expression threw
    pub exception: Option<String>,
}

/// Variable information
#[derive(Debug, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub value: Value,
    pub type_name: String,
    pub description: Option<String>,
}

/// Messages pushed to observers, in production order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// Sent once when an observer connects
    Snapshot {
        active: Option<SessionDetail>,
        sessions: Vec<SessionSummary>,
    },
    Status {
        session_id: String,
        status: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
    Console {
        session_id: String,
        message: ConsoleMessage,
    },
    BreakpointSet {
        session_id: String,
        breakpoint: BreakpointInfo,
    },
    BreakpointRemoved {
        session_id: String,
        id: String,
    },
    Paused {
        session_id: String,
        reason: String,
        location: Option<PauseLocation>,
        hit_breakpoints: Vec<String>,
    },
    Resumed {
        session_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let cmd: Command = serde_json::from_str(
            r#"{"type":"breakpoint_set","session":null,"file":"/tmp/a.js","line":3}"#,
        )
        .unwrap();
        match cmd {
            Command::BreakpointSet { session, file, line } => {
                assert!(session.is_none());
                assert_eq!(file.as_deref(), Some("/tmp/a.js"));
                assert_eq!(line, 3);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        // Optional fields fall back to defaults
        let cmd: Command = serde_json::from_str(r#"{"type":"start","code":"1"}"#).unwrap();
        assert!(matches!(cmd, Command::Start { break_on_start: false, wait: false, .. }));
    }

    #[test]
    fn test_push_message_is_tagged() {
        let msg = PushMessage::Status {
            session_id: "s1".to_string(),
            status: SessionStatus::Crashed,
            exit_code: Some(1),
            error: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["status"], "crashed");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Crashed.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert!(!SessionStatus::Launching.is_terminal());
    }
}
