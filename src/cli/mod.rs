//! CLI command handling
//!
//! Dispatches CLI commands to the daemon and formats output.

mod spawn;

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::commands::Commands;
use crate::common::{logging, Error, Result};
use crate::ipc::protocol::{
    BreakpointInfo, Command, ConsoleMessage, EvaluateResult, PauseLocation, SessionDetail,
    SessionStateResult, SessionSummary, StatusResult, VariableInfo,
};
use crate::ipc::DaemonClient;

/// Dispatch a CLI command
///
/// `session` selects a session by id; `None` addresses the active one.
pub async fn dispatch(command: Commands, session: Option<String>) -> Result<()> {
    match command {
        Commands::Daemon => Err(Error::Internal(
            "daemon mode is handled before dispatch".to_string(),
        )),

        Commands::Start {
            script,
            break_on_start,
            wait,
        } => {
            let code = std::fs::read_to_string(&script).map_err(|e| Error::FileRead {
                path: script.display().to_string(),
                error: e.to_string(),
            })?;

            spawn::ensure_daemon_running().await?;
            let mut client = DaemonClient::connect().await?;

            let result = client
                .send_command(Command::Start {
                    code,
                    break_on_start,
                    wait,
                })
                .await?;
            let started: SessionStateResult = serde_json::from_value(result)?;

            println!("Session {} {} ({})", started.session_id, started.status, script.display());
            if break_on_start {
                println!("Paused before the first statement. Use 'devdock-bridge continue' to run.");
            }
            Ok(())
        }

        Commands::Stop => {
            let mut client = DaemonClient::connect().await?;
            let result = client.send_command(Command::Stop { session }).await?;
            let stopped: SessionStateResult = serde_json::from_value(result)?;
            println!("Session {} {}", stopped.session_id, stopped.status);
            Ok(())
        }

        Commands::List => {
            let mut client = DaemonClient::connect().await?;
            let result = client.send_command(Command::List).await?;
            let sessions: Vec<SessionSummary> = serde_json::from_value(result["sessions"].clone())?;

            if sessions.is_empty() {
                println!("No sessions");
            }
            for summary in &sessions {
                println!(
                    "{}  {:<9} {} breakpoint(s)",
                    summary.id,
                    summary.status.to_string(),
                    summary.breakpoints.len()
                );
            }
            Ok(())
        }

        Commands::Show { tail } => {
            let mut client = DaemonClient::connect().await?;
            let result = client
                .send_command(Command::Detail {
                    session,
                    console_tail: tail,
                })
                .await?;
            let detail: SessionDetail = serde_json::from_value(result)?;
            print_detail(&detail);
            Ok(())
        }

        Commands::Break { location } => {
            let (file, line) = parse_location(&location)?;
            let mut client = DaemonClient::connect().await?;
            let result = client
                .send_command(Command::BreakpointSet { session, file, line })
                .await?;
            let info: BreakpointInfo = serde_json::from_value(result)?;
            print_breakpoint_added(&info);
            Ok(())
        }

        Commands::Delete { id } => {
            let mut client = DaemonClient::connect().await?;
            client
                .send_command(Command::BreakpointRemove {
                    session,
                    id: id.clone(),
                })
                .await?;
            println!("Breakpoint {} removed", id);
            Ok(())
        }

        Commands::Next => execution(Command::StepOver { session }, "Stepping over...").await,
        Commands::Step => execution(Command::StepInto { session }, "Stepping into...").await,
        Commands::Finish => execution(Command::StepOut { session }, "Stepping out...").await,
        Commands::Continue => execution(Command::Continue { session }, "Continuing execution...").await,

        Commands::Pause => {
            let mut client = DaemonClient::connect().await?;
            client.send_command(Command::Pause { session }).await?;
            println!("Pause requested");
            Ok(())
        }

        Commands::Eval { expression } => {
            let mut client = DaemonClient::connect().await?;
            let result = client
                .send_command(Command::Evaluate { session, expression })
                .await?;
            let eval: EvaluateResult = serde_json::from_value(result)?;
            print_evaluate(&eval);
            Ok(())
        }

        Commands::Vars { scope } => {
            let mut client = DaemonClient::connect().await?;
            let result = client
                .send_command(Command::Variables {
                    session,
                    scope: scope.clone(),
                })
                .await?;
            let variables: Vec<VariableInfo> = serde_json::from_value(result["variables"].clone())?;

            if variables.is_empty() {
                println!("No variables in {} scope", scope);
            }
            for var in &variables {
                print_variable(var);
            }
            Ok(())
        }

        Commands::Console { tail } => {
            let mut client = DaemonClient::connect().await?;
            let result = client
                .send_command(Command::Console { session, max: tail })
                .await?;
            let messages: Vec<ConsoleMessage> = serde_json::from_value(result["messages"].clone())?;

            if messages.is_empty() {
                println!("(no output)");
            }
            for message in &messages {
                print_console(message);
            }
            Ok(())
        }

        Commands::Watch => {
            spawn::ensure_daemon_running().await?;
            let client = DaemonClient::connect().await?;
            let mut observer = client.subscribe().await?;

            while let Some(message) = observer.next().await? {
                println!("{}", serde_json::to_string(&message)?);
            }
            eprintln!("Daemon closed the push channel");
            Ok(())
        }

        Commands::Status => {
            match DaemonClient::connect().await {
                Ok(mut client) => {
                    let result = client.send_command(Command::Status).await?;
                    let status: StatusResult = serde_json::from_value(result)?;

                    println!("Daemon: running (pid {})", status.pid);
                    match &status.active_session {
                        Some(id) => println!("Active session: {}", id),
                        None => println!("Active session: none"),
                    }
                    println!("Sessions: {}", status.session_count);
                    println!("Observers: {}", status.observers);
                }
                Err(Error::DaemonNotRunning) => {
                    println!("Daemon: not running");
                    println!("Active session: none");
                }
                Err(e) => return Err(e),
            }

            Ok(())
        }

        Commands::Shutdown => {
            match DaemonClient::connect().await {
                Ok(mut client) => {
                    client.send_command(Command::Shutdown).await?;
                    println!("Daemon shutting down");
                }
                Err(Error::DaemonNotRunning) => println!("Daemon: not running"),
                Err(e) => return Err(e),
            }
            Ok(())
        }

        Commands::Logs { lines, follow, clear } => show_logs(lines, follow, clear).await,
    }
}

async fn execution(command: Command, message: &str) -> Result<()> {
    let mut client = DaemonClient::connect().await?;
    let result = client.send_command(command).await?;
    let state: SessionStateResult = serde_json::from_value(result)?;
    println!("{} ({})", message, state.status);
    Ok(())
}

/// Parse `LINE` or `FILE:LINE`
///
/// Existing files are canonicalized so they match the paths the runtime
/// reports.
fn parse_location(location: &str) -> Result<(Option<String>, u32)> {
    let parse_line = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|_| Error::InvalidArgument(format!("invalid line number in '{}'", location)))
    };

    match location.rsplit_once(':') {
        Some((file, line)) if !file.is_empty() => {
            let line = parse_line(line)?;
            let path = PathBuf::from(file);
            let file = path
                .canonicalize()
                .unwrap_or(path)
                .to_string_lossy()
                .into_owned();
            Ok((Some(file), line))
        }
        _ => Ok((None, parse_line(location)?)),
    }
}

fn format_location(location: &PauseLocation) -> String {
    let function = if location.function_name.is_empty() {
        "<anonymous>"
    } else {
        &location.function_name
    };
    format!("{} at {}:{}:{}", function, location.file, location.line, location.column)
}

fn print_detail(detail: &SessionDetail) {
    println!("Session: {}", detail.id);
    println!("Status: {}", detail.status);
    println!("Script: {}", detail.script_path);
    println!("Started: {}", detail.created_at.to_rfc3339());
    if let Some(ended) = detail.ended_at {
        println!("Ended: {}", ended.to_rfc3339());
    }
    if let Some(code) = detail.exit_code {
        println!("Exit code: {}", code);
    }
    if let Some(error) = &detail.error {
        println!("Error: {}", error);
    }
    if let Some(location) = &detail.pause_location {
        println!("Paused in {}", format_location(location));
    }

    if detail.breakpoints.is_empty() {
        println!("Breakpoints: none");
    } else {
        println!("Breakpoints:");
        for bp in &detail.breakpoints {
            print_breakpoint(bp);
        }
    }

    if !detail.console.is_empty() {
        println!("Console:");
        for message in &detail.console {
            print_console(message);
        }
    }
}

fn print_breakpoint_added(info: &BreakpointInfo) {
    if info.locations.is_empty() {
        println!(
            "Breakpoint {} pending at {}:{} (script not loaded yet)",
            info.id, info.file, info.line
        );
    } else {
        println!("Breakpoint {} set at {}:{}", info.id, info.file, info.line);
    }
}

fn print_breakpoint(info: &BreakpointInfo) {
    let status = if info.locations.is_empty() { "?" } else { "✓" };
    let resolved = info
        .locations
        .iter()
        .filter(|loc| loc.line != info.line)
        .map(|loc| format!("resolved to line {}", loc.line))
        .collect::<Vec<_>>()
        .join(", ");

    if resolved.is_empty() {
        println!("  {} {} {}:{}", status, info.id, info.file, info.line);
    } else {
        println!("  {} {} {}:{} ({})", status, info.id, info.file, info.line, resolved);
    }
}

fn print_console(message: &ConsoleMessage) {
    println!(
        "[{}] {:<9} {}",
        message.timestamp.format("%H:%M:%S%.3f"),
        message.kind,
        message.text
    );
}

fn print_evaluate(eval: &EvaluateResult) {
    if let Some(exception) = &eval.exception {
        println!("Uncaught {}", exception);
        return;
    }
    let rendered = match &eval.value {
        serde_json::Value::Null => eval.description.clone().unwrap_or_else(|| eval.value_type.clone()),
        serde_json::Value::String(s) if eval.value_type == "string" => format!("{:?}", s),
        value => value.to_string(),
    };
    println!("{} ({})", rendered, eval.value_type);
}

fn print_variable(var: &VariableInfo) {
    let rendered = match &var.value {
        serde_json::Value::String(s) if var.type_name == "string" => format!("{:?}", s),
        serde_json::Value::String(s) => s.clone(),
        value => value.to_string(),
    };
    println!("  {} = {} ({})", var.name, rendered, var.type_name);
}

/// Print, follow or clear the daemon log
async fn show_logs(lines: usize, follow: bool, clear: bool) -> Result<()> {
    let Some(path) = logging::daemon_log_path() else {
        return Err(Error::Internal("no log directory on this platform".to_string()));
    };

    if clear {
        if path.exists() {
            std::fs::write(&path, "")?;
        }
        println!("Cleared {}", path.display());
        return Ok(());
    }

    if !path.exists() {
        println!("No daemon log at {}", path.display());
        return Ok(());
    }

    let content = read_log(&path)?;
    let all: Vec<&str> = content.lines().collect();
    for line in &all[all.len().saturating_sub(lines)..] {
        println!("{}", line);
    }

    if follow {
        let mut offset = content.len() as u64;
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let mut file = std::fs::File::open(&path)?;
            let len = file.metadata()?.len();
            if len < offset {
                // Truncated by --clear
                offset = 0;
            }
            if len > offset {
                file.seek(SeekFrom::Start(offset))?;
                let mut chunk = String::new();
                file.read_to_string(&mut chunk)?;
                print!("{}", chunk);
                offset = len;
            }
        }
    }
    Ok(())
}

fn read_log(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        assert_eq!(parse_location("12").unwrap(), (None, 12));

        let (file, line) = parse_location("/no/such/app.js:3").unwrap();
        assert_eq!(file.as_deref(), Some("/no/such/app.js"));
        assert_eq!(line, 3);

        assert!(matches!(parse_location("app.js:x"), Err(Error::InvalidArgument(_))));
        assert!(matches!(parse_location("app.js"), Err(Error::InvalidArgument(_))));
    }
}
