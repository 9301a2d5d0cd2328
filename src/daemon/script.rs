//! Temporary script store
//!
//! Each session's source text is written to its own uniquely named file.
//! The file is removed when its [`ScriptFile`] is dropped; files orphaned
//! by a daemon that died abnormally are swept on the next startup.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempPath;

use crate::common::{Error, Result};

const PREFIX: &str = "session-";
const SUFFIX: &str = ".js";

/// Directory-backed store for session scripts
#[derive(Debug, Clone)]
pub struct ScriptStore {
    dir: PathBuf,
}

impl ScriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `content` to a fresh file
    ///
    /// Fails with [`Error::LaunchFailure`] when the directory is not
    /// writable; the caller must not create a session in that case.
    pub fn create(&self, content: &str) -> Result<ScriptFile> {
        let launch_err = |e: std::io::Error| {
            Error::LaunchFailure(format!("cannot write script in {}: {}", self.dir.display(), e))
        };

        std::fs::create_dir_all(&self.dir).map_err(launch_err)?;
        // The runtime reports resolved paths; keep ours in the same form.
        let dir = std::fs::canonicalize(&self.dir).map_err(launch_err)?;

        let mut file = tempfile::Builder::new()
            .prefix(PREFIX)
            .suffix(SUFFIX)
            .tempfile_in(&dir)
            .map_err(launch_err)?;
        file.write_all(content.as_bytes()).map_err(launch_err)?;
        file.flush().map_err(launch_err)?;

        let path = file.into_temp_path();
        tracing::debug!(path = %path.display(), bytes = content.len(), "Script written");
        Ok(ScriptFile { path: Some(path) })
    }

    /// Remove scripts left behind by a previous daemon
    pub fn sweep(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(PREFIX) && name.ends_with(SUFFIX) && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, dir = %self.dir.display(), "Swept stale session scripts");
        }
        removed
    }
}

/// A session's script; deleted on drop or on [`ScriptFile::remove`]
#[derive(Debug)]
pub struct ScriptFile {
    path: Option<TempPath>,
}

impl ScriptFile {
    pub fn path(&self) -> &Path {
        match &self.path {
            Some(path) => &**path,
            None => Path::new(""),
        }
    }

    /// Delete the file now
    pub fn remove(&mut self) {
        if let Some(path) = self.path.take() {
            let shown = path.display().to_string();
            if let Err(e) = path.close() {
                tracing::warn!(path = %shown, error = %e, "Failed to remove script");
            }
        }
    }
}

/// The `file://` URL the runtime uses for a local path
pub fn file_url(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/").replace(' ', "%20");
    if raw.starts_with('/') {
        format!("file://{}", raw)
    } else {
        format!("file:///{}", raw)
    }
}

/// Map a user-supplied breakpoint file onto a script URL
///
/// Anything that already looks like a URL is passed through.
pub fn script_url(file: &str) -> String {
    if file.contains("://") {
        file.to_string()
    } else {
        file_url(Path::new(file))
    }
}

/// Inverse of [`file_url`] for display purposes
pub fn url_to_file(url: &str) -> String {
    match url.strip_prefix("file://") {
        Some(rest) => {
            let rest = rest.replace("%20", " ");
            // file:///C:/x → C:/x
            if rest.len() > 3 && rest.as_bytes()[2] == b':' && rest.starts_with('/') {
                rest[1..].to_string()
            } else {
                rest
            }
        }
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_unique_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScriptStore::new(dir.path().join("scripts"));

        let mut a = store.create("console.log(1)").unwrap();
        let b = store.create("console.log(2)").unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(std::fs::read_to_string(a.path()).unwrap(), "console.log(1)");

        let a_path = a.path().to_path_buf();
        a.remove();
        assert!(!a_path.exists());

        let b_path = b.path().to_path_buf();
        drop(b);
        assert!(!b_path.exists());
    }

    #[test]
    fn test_unwritable_dir_is_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let store = ScriptStore::new(blocker.join("scripts"));
        assert!(matches!(store.create("1"), Err(Error::LaunchFailure(_))));
    }

    #[test]
    fn test_sweep_only_touches_session_scripts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("session-abc.js"), "").unwrap();
        std::fs::write(dir.path().join("keep.txt"), "").unwrap();

        let store = ScriptStore::new(dir.path());
        assert_eq!(store.sweep(), 1);
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn test_url_mapping() {
        assert_eq!(file_url(Path::new("/tmp/a b.js")), "file:///tmp/a%20b.js");
        assert_eq!(script_url("file:///x.js"), "file:///x.js");
        assert_eq!(url_to_file("file:///tmp/a%20b.js"), "/tmp/a b.js");
        assert_eq!(url_to_file("file:///C:/work/a.js"), "C:/work/a.js");
        assert_eq!(url_to_file("node:internal/main"), "node:internal/main");
    }
}
