//! Single-instance guard
//!
//! Two agents on one desktop would fight over the Cygwin sentinel, the
//! OpenSSH pipe and the Pageant window. A PID file in the config directory
//! records the running instance; a stale file left by a crash is replaced.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config;

/// Default PID file name
const PID_FILE_NAME: &str = "agent.pid";

/// Errors acquiring the instance guard
#[derive(Error, Debug)]
pub enum InstanceError {
    /// Another live process owns the PID file
    #[error("Another agent instance is already running (pid {0})")]
    AlreadyRunning(u32),

    /// PID file could not be read or written
    #[error("PID file error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Get the default PID file path
pub fn default_pid_path() -> PathBuf {
    config::default_config_dir().join(PID_FILE_NAME)
}

/// Read the PID from the PID file
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn read_pid_file(path: &Path) -> io::Result<Option<u32>> {
    match fs::File::open(path) {
        Ok(mut file) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let pid = contents
                .trim()
                .parse::<u32>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Some(pid))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a PID to the PID file, creating parent directories
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(path)?;
    writeln!(file, "{}", pid)?;
    Ok(())
}

/// Remove the PID file; a missing file is not an error
pub fn remove_pid_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Check if a process with the given PID is still alive
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // EPERM means the process exists but belongs to someone else
    unsafe {
        if libc::kill(pid as libc::pid_t, 0) == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 || handle == INVALID_HANDLE_VALUE {
            return false;
        }
        CloseHandle(handle);
        true
    }
}

/// Holds the PID file for the lifetime of the process
///
/// The file is removed when the guard is dropped.
#[derive(Debug)]
pub struct InstanceGuard {
    path: PathBuf,
}

impl InstanceGuard {
    /// Claim the PID file at `path` for the current process
    pub fn acquire(path: PathBuf) -> Result<Self, InstanceError> {
        let io_err = |source| InstanceError::Io {
            path: path.clone(),
            source,
        };
        let me = std::process::id();

        match read_pid_file(&path) {
            Ok(Some(pid)) if pid != me && is_process_alive(pid) => {
                return Err(InstanceError::AlreadyRunning(pid));
            }
            Ok(Some(pid)) if pid != me => {
                tracing::info!("Replacing stale PID file {:?} (pid {})", path, pid);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!("Ignoring malformed PID file {:?}: {}", path, e);
            }
            Err(e) => return Err(io_err(e)),
        }

        write_pid_file(&path, me).map_err(io_err)?;
        Ok(Self { path })
    }

    /// Claim the default PID file
    pub fn acquire_default() -> Result<Self, InstanceError> {
        Self::acquire(default_pid_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(e) = remove_pid_file(&self.path) {
            tracing::warn!("Failed to remove PID file {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_nonexistent_pid_file() {
        let dir = TempDir::new().unwrap();
        assert!(read_pid_file(&dir.path().join("test.pid")).unwrap().is_none());
    }

    #[test]
    fn test_write_and_read_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.pid");

        write_pid_file(&path, 12345).unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Some(12345));
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_guard_removes_file_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.pid");

        {
            let guard = InstanceGuard::acquire(path.clone()).unwrap();
            assert_eq!(read_pid_file(guard.path()).unwrap(), Some(std::process::id()));
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_guard_replaces_stale_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.pid");
        write_pid_file(&path, 999_999_999).unwrap();

        let _guard = InstanceGuard::acquire(path.clone()).unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Some(std::process::id()));
    }

    #[test]
    fn test_guard_replaces_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.pid");
        fs::write(&path, "not a pid").unwrap();

        let _guard = InstanceGuard::acquire(path.clone()).unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Some(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_guard_refuses_live_owner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live.pid");
        // pid 1 always exists on unix
        write_pid_file(&path, 1).unwrap();

        assert!(matches!(
            InstanceGuard::acquire(path),
            Err(InstanceError::AlreadyRunning(1))
        ));
    }
}
