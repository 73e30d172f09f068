//! Per-environment run lock at `<home>/.opticon/run/<env>.lock`.
//!
//! The file holds `<pid> <rfc3339>`. A lock whose stamped process no longer
//! exists is reclaimed; an unreadable stamp is treated as held.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use opticon_core::{paths, EnvironmentName};

use crate::error::{io_err, SyncError};

/// Held while one environment reconciles. Released on drop.
#[derive(Debug)]
pub struct EnvironmentLock {
    path: PathBuf,
}

impl EnvironmentLock {
    pub fn acquire(home: &Path, environment: &EnvironmentName) -> Result<Self, SyncError> {
        let path = paths::lock_path(home, environment);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }

        let locked = || SyncError::EnvironmentLocked {
            environment: environment.clone(),
            lock: path.clone(),
        };
        let mut file = match create_new(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !holder_is_gone(&path) {
                    return Err(locked());
                }
                tracing::warn!("removing stale lock {}", path.display());
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(io_err(&path, e)),
                }
                match create_new(&path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(locked()),
                    Err(e) => return Err(io_err(&path, e)),
                }
            }
            Err(e) => return Err(io_err(&path, e)),
        };
        let stamp = format!("{} {}\n", std::process::id(), chrono::Utc::now().to_rfc3339());
        if let Err(e) = file.write_all(stamp.as_bytes()) {
            let _ = std::fs::remove_file(&path);
            return Err(io_err(&path, e));
        }

        tracing::debug!("acquired {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn create_new(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Pid stamped into an existing lock file.
fn stamped_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn holder_is_gone(path: &Path) -> bool {
    stamped_pid(path).is_some_and(|pid| !process_alive(pid))
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for EnvironmentLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to release {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_until_first_is_dropped() {
        let home = TempDir::new().unwrap();
        let env = EnvironmentName::from("prod");

        let first = EnvironmentLock::acquire(home.path(), &env).unwrap();
        assert!(first.path().exists());
        let err = EnvironmentLock::acquire(home.path(), &env).unwrap_err();
        assert!(matches!(err, SyncError::EnvironmentLocked { .. }));

        drop(first);
        let again = EnvironmentLock::acquire(home.path(), &env).unwrap();
        assert!(again.path().exists());
    }

    #[test]
    fn locked_error_names_the_file_to_delete() {
        let home = TempDir::new().unwrap();
        let env = EnvironmentName::from("prod");
        let _held = EnvironmentLock::acquire(home.path(), &env).unwrap();

        let message = EnvironmentLock::acquire(home.path(), &env)
            .unwrap_err()
            .to_string();
        assert!(message.contains("prod.lock"));
        assert!(message.contains("delete it if no run is in progress"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lock_left_by_a_dead_process_is_reclaimed() {
        let home = TempDir::new().unwrap();
        let env = EnvironmentName::from("prod");
        let path = paths::lock_path(home.path(), &env);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // Above the kernel's pid_max ceiling, so never a live process.
        std::fs::write(&path, "4194305 2013-12-04T23:31:09+00:00\n").unwrap();

        let lock = EnvironmentLock::acquire(home.path(), &env).unwrap();
        let stamp = std::fs::read_to_string(lock.path()).unwrap();
        assert!(stamp.starts_with(&format!("{} ", std::process::id())));
    }

    #[test]
    fn unreadable_stamp_is_left_alone() {
        let home = TempDir::new().unwrap();
        let env = EnvironmentName::from("prod");
        let path = paths::lock_path(home.path(), &env);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "").unwrap();

        let err = EnvironmentLock::acquire(home.path(), &env).unwrap_err();
        assert!(matches!(err, SyncError::EnvironmentLocked { .. }));
        assert!(path.exists());
    }

    #[test]
    fn environments_lock_independently() {
        let home = TempDir::new().unwrap();
        let _prod = EnvironmentLock::acquire(home.path(), &EnvironmentName::from("prod")).unwrap();
        let _uat = EnvironmentLock::acquire(home.path(), &EnvironmentName::from("uat")).unwrap();
    }
}
