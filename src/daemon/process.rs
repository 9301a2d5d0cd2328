//! Runtime process launcher
//!
//! Spawns the scripting runtime with its inspector bound to the debug
//! port, turns every stdout/stderr line into a session event, and reports
//! the exit once both streams are drained.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};

use crate::common::{Error, Result};

use super::session::SessionEvent;

/// How long to wait for a killed runtime to be reaped
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Output streams may outlive the process if it forked; don't wait forever
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Which stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// How the runtime ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when terminated by a signal
    pub code: Option<i32>,
    pub success: bool,
}

/// What to launch
#[derive(Debug)]
pub struct LaunchSpec<'a> {
    pub runtime: &'a Path,
    pub runtime_args: &'a [String],
    pub host: &'a str,
    pub port: u16,
    pub script: &'a Path,
}

impl LaunchSpec<'_> {
    /// The runtime always holds before the first statement; a script short
    /// enough to finish before the bridge attaches would otherwise be lost.
    fn inspect_flag(&self) -> String {
        format!("--inspect-brk={}:{}", self.host, self.port)
    }
}

/// Exclusive ownership of a spawned runtime
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    /// Exit info, once the runtime has been reaped
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exited.borrow()
    }

    /// Watch that flips to `Some` when the runtime has exited
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exited.clone()
    }

    /// Ask the monitor to kill the runtime without waiting
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Kill the runtime and wait until it is reaped
    ///
    /// Once this returns the debug port is free for the next launch.
    pub async fn terminate(&mut self) -> Option<ExitInfo> {
        self.kill();
        let mut exited = self.exited.clone();
        let info = match tokio::time::timeout(KILL_TIMEOUT, exited.wait_for(Option::is_some)).await {
            Ok(Ok(info)) => *info,
            _ => {
                tracing::warn!(pid = ?self.pid, "Runtime did not exit after kill");
                None
            }
        };
        info
    }
}

/// Spawn the runtime for `spec`, reporting to `events`
pub fn spawn(spec: &LaunchSpec<'_>, events: mpsc::UnboundedSender<SessionEvent>) -> Result<ProcessHandle> {
    let mut cmd = Command::new(spec.runtime);
    cmd.args(spec.runtime_args)
        .arg(spec.inspect_flag())
        .arg(spec.script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        Error::LaunchFailure(format!("failed to start {}: {}", spec.runtime.display(), e))
    })?;

    let pid = child.id();
    tracing::info!(
        pid = ?pid,
        runtime = %spec.runtime.display(),
        script = %spec.script.display(),
        port = spec.port,
        "Runtime spawned"
    );

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::LaunchFailure("failed to capture runtime stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::LaunchFailure("failed to capture runtime stderr".to_string()))?;

    let out_task = tokio::spawn(forward_lines(stdout, OutputStream::Stdout, events.clone()));
    let err_task = tokio::spawn(forward_lines(stderr, OutputStream::Stderr, events.clone()));

    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let (exit_tx, exit_rx) = watch::channel(None);

    tokio::spawn(async move {
        // A dropped handle counts as a kill request.
        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut kill_rx => None,
        };
        let status = match status {
            Some(status) => status,
            None => {
                tracing::debug!(pid = ?pid, "Killing runtime");
                let _ = child.start_kill();
                child.wait().await
            }
        };

        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            let _ = out_task.await;
            let _ = err_task.await;
        })
        .await;

        let info = match status {
            Ok(status) => ExitInfo {
                code: status.code(),
                success: status.success(),
            },
            Err(e) => {
                tracing::warn!(pid = ?pid, error = %e, "Failed to reap runtime");
                ExitInfo {
                    code: None,
                    success: false,
                }
            }
        };
        tracing::info!(pid = ?pid, code = ?info.code, "Runtime exited");

        let _ = exit_tx.send(Some(info));
        let _ = events.send(SessionEvent::ProcessExited(info));
    });

    Ok(ProcessHandle {
        pid,
        kill: Some(kill_tx),
        exited: exit_rx,
    })
}

async fn forward_lines<R>(stream: R, kind: OutputStream, events: mpsc::UnboundedSender<SessionEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if events.send(SessionEvent::Output { stream: kind, line }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(stream = kind.as_str(), error = %e, "Output stream error");
                break;
            }
        }
    }
}

/// Wait until nothing is listening on `host:port`
///
/// Returns false if the port is still taken at the deadline.
pub async fn wait_port_free(host: &str, port: u16, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        match tokio::net::TcpStream::connect((host, port)).await {
            Err(_) => return true,
            Ok(_) if start.elapsed() >= deadline => {
                tracing::warn!(host, port, "Debug port still in use");
                return false;
            }
            Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_spec<'a>(script: &'a Path, args: &'a [String]) -> LaunchSpec<'a> {
        LaunchSpec {
            runtime: Path::new("/bin/sh"),
            runtime_args: args,
            host: "127.0.0.1",
            port: 0,
            script,
        }
    }

    /// `sh -c CMD --inspect=... script` runs CMD with the flag as `$0`
    fn sh_args(cmd: &str) -> Vec<String> {
        vec!["-c".to_string(), cmd.to_string()]
    }

    #[tokio::test]
    async fn test_lines_then_exit_in_order() {
        let args = sh_args("echo one; echo two; echo oops >&2; exit 3");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn(&sh_spec(Path::new("unused.js"), &args), tx).unwrap();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit = loop {
            match rx.recv().await.unwrap() {
                SessionEvent::Output { stream: OutputStream::Stdout, line } => stdout.push(line),
                SessionEvent::Output { stream: OutputStream::Stderr, line } => stderr.push(line),
                SessionEvent::ProcessExited(info) => break info,
                _ => {}
            }
        };

        assert_eq!(stdout, vec!["one", "two"]);
        assert_eq!(stderr, vec!["oops"]);
        assert_eq!(exit, ExitInfo { code: Some(3), success: false });
        assert_eq!(handle.exit_info(), Some(exit));
    }

    #[tokio::test]
    async fn test_terminate_reaps_process() {
        let args = sh_args("sleep 30");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut handle = spawn(&sh_spec(Path::new("unused.js"), &args), tx).unwrap();

        let info = handle.terminate().await.unwrap();
        assert!(!info.success);
        assert!(handle.exit_info().is_some());
    }

    #[tokio::test]
    async fn test_missing_runtime_is_launch_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let spec = LaunchSpec {
            runtime: Path::new("/nonexistent/runtime"),
            ..sh_spec(Path::new("x.js"), &[])
        };
        assert!(matches!(spawn(&spec, tx), Err(Error::LaunchFailure(_))));
    }

    #[tokio::test]
    async fn test_free_port_is_detected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(wait_port_free("127.0.0.1", port, Duration::from_millis(100)).await);
    }
}
