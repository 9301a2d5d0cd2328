//! Where the bridge keeps its socket, config, logs and session scripts
//!
//! Everything is namespaced under `devdock-bridge`. On Unix the control
//! socket lives in `$XDG_RUNTIME_DIR` (or a per-uid `/tmp` directory); on
//! Windows it is a named pipe and has no directory of its own.

use std::io;
use std::path::PathBuf;

use directories::ProjectDirs;

const APP_NAME: &str = "devdock-bridge";
const SOCKET_FILE: &str = "daemon.sock";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Directory the control socket and session scripts share
#[cfg(unix)]
fn runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join(APP_NAME),
        None => {
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
        }
    }
}

#[cfg(unix)]
pub fn socket_path() -> PathBuf {
    runtime_dir().join(SOCKET_FILE)
}

/// Pipe name; `interprocess` adds the `\\.\pipe\` prefix
#[cfg(windows)]
pub fn socket_path() -> PathBuf {
    PathBuf::from(socket_name())
}

/// Name handed to `interprocess` when binding or connecting
#[cfg(unix)]
pub fn socket_name() -> String {
    socket_path().to_string_lossy().into_owned()
}

#[cfg(windows)]
pub fn socket_name() -> String {
    let user = std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
    format!("{}-{}", APP_NAME, user)
}

/// Create the socket directory, owner-only
#[cfg(unix)]
pub fn ensure_socket_dir() -> io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let dir = runtime_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(dir)
}

#[cfg(windows)]
pub fn ensure_socket_dir() -> io::Result<PathBuf> {
    Ok(PathBuf::new())
}

/// Remove a socket file left behind by a daemon that did not exit cleanly
#[cfg(unix)]
pub fn remove_socket() -> io::Result<()> {
    match std::fs::remove_file(socket_path()) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(windows)]
pub fn remove_socket() -> io::Result<()> {
    Ok(())
}

/// Platform config directory, e.g. `~/.config/devdock-bridge` on Linux
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

pub fn log_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("logs"))
}

/// Directory holding temporary session scripts
///
/// Lives next to the daemon socket so a restarted daemon can sweep
/// scripts orphaned by a previous run.
#[cfg(unix)]
pub fn script_dir() -> PathBuf {
    runtime_dir().join("scripts")
}

#[cfg(windows)]
pub fn script_dir() -> PathBuf {
    std::env::temp_dir().join(format!("{}-scripts", APP_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_is_valid() {
        let path = socket_path();
        assert!(!path.as_os_str().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_scripts_live_beside_the_socket() {
        let socket = socket_path();
        assert_eq!(script_dir().parent(), socket.parent());
        assert!(socket.to_string_lossy().contains(APP_NAME));
    }

    #[test]
    fn test_config_path_is_toml() {
        let path = config_path().expect("config path");
        assert!(path.ends_with("config.toml"));
    }
}
