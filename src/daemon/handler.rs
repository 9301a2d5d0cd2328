//! Command handler for processing IPC requests
//!
//! Translates Control API commands into registry and session operations.

use serde_json::json;

use crate::common::{error::IpcError, Result};
use crate::ipc::protocol::{Command, Response, SessionStateResult};

use super::registry::SessionRegistry;
use super::session::StepKind;

/// Handle an IPC command
///
/// `Subscribe` and `Shutdown` change what happens to the connection and
/// are intercepted by the server before they get here.
pub async fn handle_command(registry: &SessionRegistry, id: u64, command: Command) -> Response {
    match handle_command_inner(registry, command).await {
        Ok(result) => Response::success(id, result),
        Err(e) => {
            tracing::debug!(error = %e, "Command failed");
            Response::error(id, IpcError::from(&e))
        }
    }
}

async fn handle_command_inner(registry: &SessionRegistry, command: Command) -> Result<serde_json::Value> {
    match command {
        // === Session Management ===
        Command::Start {
            code,
            break_on_start,
            wait,
        } => {
            let result = registry.start(&code, break_on_start, wait).await?;
            Ok(serde_json::to_value(result)?)
        }

        Command::Stop { session } => {
            let result = registry.stop(session.as_deref()).await?;
            Ok(serde_json::to_value(result)?)
        }

        Command::List => Ok(json!({ "sessions": registry.list().await })),

        Command::Detail { session, console_tail } => {
            let session = registry.get(session.as_deref())?;
            Ok(serde_json::to_value(session.detail(console_tail).await)?)
        }

        Command::Status => Ok(serde_json::to_value(registry.status())?),

        // === Breakpoints ===
        Command::BreakpointSet { session, file, line } => {
            let session = registry.get(session.as_deref())?;
            let info = session.set_breakpoint(file.as_deref(), line).await?;
            Ok(serde_json::to_value(info)?)
        }

        Command::BreakpointRemove { session, id } => {
            let session = registry.get(session.as_deref())?;
            session.remove_breakpoint(&id).await?;
            Ok(json!({ "removed": id }))
        }

        // === Execution Control ===
        Command::StepOver { session } => step(registry, session, StepKind::Over).await,
        Command::StepInto { session } => step(registry, session, StepKind::Into).await,
        Command::StepOut { session } => step(registry, session, StepKind::Out).await,
        Command::Continue { session } => step(registry, session, StepKind::Continue).await,

        Command::Pause { session } => {
            let session = registry.get(session.as_deref())?;
            session.pause().await?;
            Ok(serde_json::to_value(SessionStateResult {
                session_id: session.id().to_string(),
                status: session.status(),
            })?)
        }

        // === State Inspection ===
        Command::Evaluate { session, expression } => {
            let session = registry.get(session.as_deref())?;
            Ok(serde_json::to_value(session.evaluate(&expression).await?)?)
        }

        Command::Variables { session, scope } => {
            let session = registry.get(session.as_deref())?;
            let variables = session.read_variables(&scope).await?;
            Ok(json!({ "scope": scope, "variables": variables }))
        }

        Command::Console { session, max } => {
            let session = registry.get(session.as_deref())?;
            Ok(json!({ "messages": session.console(max).await }))
        }

        // Connection-level commands
        Command::Subscribe | Command::Shutdown => Ok(json!({})),
    }
}

async fn step(registry: &SessionRegistry, session: Option<String>, kind: StepKind) -> Result<serde_json::Value> {
    let session = registry.get(session.as_deref())?;
    let status = session.step(kind).await?;
    Ok(serde_json::to_value(SessionStateResult {
        session_id: session.id().to_string(),
        status,
    })?)
}
