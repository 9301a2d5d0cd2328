//! Starting the bridge daemon on demand
//!
//! The CLI re-executes its own binary with the hidden `daemon` subcommand.
//! The daemon outlives the CLI call so sessions and observers survive
//! between invocations.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::common::{paths, Error, Result};
use crate::ipc::{transport, DaemonClient};

/// How long a freshly spawned daemon gets to start listening
const SPAWN_TIMEOUT_SECS: u64 = 5;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Connect to the daemon, spawning it first if nothing is listening
pub async fn ensure_daemon_running() -> Result<()> {
    match DaemonClient::connect().await {
        Ok(_) => Ok(()),
        Err(Error::DaemonNotRunning) => spawn_daemon().await,
        Err(e) => Err(e),
    }
}

async fn spawn_daemon() -> Result<()> {
    let exe = std::env::current_exe()
        .map_err(|e| Error::Internal(format!("Failed to locate the bridge executable: {}", e)))?;
    tracing::debug!(exe = %exe.display(), "Spawning daemon");

    paths::ensure_socket_dir()?;
    paths::remove_socket()?;

    // The daemon writes its own log file; terminal output is discarded.
    let mut cmd = Command::new(&exe);
    cmd.arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    detach(&mut cmd);
    cmd.spawn()
        .map_err(|e| Error::Internal(format!("Failed to spawn daemon: {}", e)))?;

    wait_for_socket().await
}

/// Put the daemon in its own process group so the caller's terminal
/// signals never reach it or the runtimes it launches
#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

/// Poll until the daemon accepts connections
async fn wait_for_socket() -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(SPAWN_TIMEOUT_SECS);

    while Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;

        #[cfg(unix)]
        if !paths::socket_path().exists() {
            continue;
        }

        if transport::connect().await.is_ok() {
            tracing::debug!("Daemon is accepting connections");
            return Ok(());
        }
    }
    Err(Error::DaemonSpawnTimeout(SPAWN_TIMEOUT_SECS))
}
