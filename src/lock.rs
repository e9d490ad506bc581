//! Working-tree lock shared by the watcher and foreground write paths.
//!
//! Only one git write path may run at a time. The guard removes its marker on
//! drop, so success, user abort and error paths all release it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{io_err, GateError};
use crate::registry::{process_alive, process_fingerprint};

/// An unreadable lock younger than this may still be mid-write
const FRESH_LOCK_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    holder: String,
    acquired_at: DateTime<Utc>,
    #[serde(default)]
    fingerprint: Option<u64>,
}

#[derive(Debug)]
pub struct WorkTreeLock {
    path: PathBuf,
}

impl WorkTreeLock {
    /// Acquire the lock for `holder` (e.g. "sync", "watcher").
    pub fn acquire(path: impl AsRef<Path>, holder: &str) -> Result<Self, GateError> {
        let path = path.as_ref().to_path_buf();

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let pid = std::process::id();
                    let record = LockHolder {
                        pid,
                        holder: holder.to_string(),
                        acquired_at: Utc::now(),
                        fingerprint: process_fingerprint(pid),
                    };
                    let body = serde_json::to_vec(&record).unwrap_or_default();
                    if let Err(e) = file.write_all(&body) {
                        let _ = fs::remove_file(&path);
                        return Err(io_err(&path, e));
                    }
                    debug!("Acquired working-tree lock for {}", holder);
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let current = read_holder(&path);
                    match current {
                        Some(h) if process_alive(h.pid, h.fingerprint) => {
                            return Err(GateError::WorkTreeBusy {
                                holder: format!("{} (PID {}) since {}", h.holder, h.pid, h.acquired_at),
                            });
                        }
                        None if recently_written(&path) => {
                            // Another writer created the file and is still filling it in
                            return Err(GateError::WorkTreeBusy {
                                holder: "another process (acquiring)".to_string(),
                            });
                        }
                        seen => {
                            if reclaim(&path, seen.as_ref())? {
                                warn!("Reclaimed abandoned working-tree lock at {}", path.display());
                            }
                        }
                    }
                }
                Err(e) => return Err(io_err(&path, e)),
            }
        }

        Err(GateError::WorkTreeBusy {
            holder: "contended".to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkTreeLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released working-tree lock"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to release working-tree lock: {}", e),
        }
    }
}

/// Retire an abandoned lock by renaming it aside, so that two processes that
/// both saw the dead holder cannot each delete the other's fresh lock.
/// Returns false when the file no longer holds what `seen` described.
fn reclaim(path: &Path, seen: Option<&LockHolder>) -> Result<bool, GateError> {
    let graveyard = path.with_extension(format!("stale.{}", std::process::id()));

    match fs::rename(path, &graveyard) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(io_err(path, e)),
    }

    let taken = read_holder(&graveyard);
    let still_abandoned = match (&taken, seen) {
        (Some(taken), Some(seen)) => taken == seen,
        (None, None) => !recently_written(&graveyard),
        _ => false,
    };

    if !still_abandoned {
        debug!("Lock changed hands while reclaiming, restoring it");
        // hard_link refuses to replace a lock created in the meantime
        if let Err(e) = fs::hard_link(&graveyard, path) {
            debug!("Could not restore lock at {}: {}", path.display(), e);
        }
        let _ = fs::remove_file(&graveyard);
        return Ok(false);
    }

    let _ = fs::remove_file(&graveyard);
    Ok(true)
}

fn recently_written(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age < FRESH_LOCK_WINDOW)
        .unwrap_or(false)
}

fn read_holder(path: &Path) -> Option<LockHolder> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gate.lock");

        let lock = WorkTreeLock::acquire(&path, "sync").unwrap();
        assert!(path.exists());

        assert_matches!(
            WorkTreeLock::acquire(&path, "watcher"),
            Err(GateError::WorkTreeBusy { holder }) if holder.starts_with("sync")
        );

        drop(lock);
        assert!(!path.exists());
        assert!(WorkTreeLock::acquire(&path, "watcher").is_ok());
    }

    #[test]
    fn test_released_on_error_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gate.lock");

        let failing = || -> Result<(), GateError> {
            let _lock = WorkTreeLock::acquire(&path, "sync")?;
            Err(GateError::UserAborted)
        };

        assert_matches!(failing(), Err(GateError::UserAborted));
        assert!(!path.exists());
    }

    #[test]
    fn test_abandoned_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gate.lock");
        std::fs::write(
            &path,
            r#"{"pid":2147483000,"holder":"sync","acquired_at":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let lock = WorkTreeLock::acquire(&path, "watcher").unwrap();
        assert_eq!(lock.path(), path.as_path());
    }

    #[test]
    fn test_reclaim_leaves_a_lock_taken_in_the_meantime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gate.lock");
        let dead = LockHolder {
            pid: 2147483000,
            holder: "sync".to_string(),
            acquired_at: Utc::now(),
            fingerprint: None,
        };

        // Another acquirer already replaced the dead holder's lock
        let live = WorkTreeLock::acquire(&path, "watcher").unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        assert!(!reclaim(&path, Some(&dead)).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
        assert_matches!(
            WorkTreeLock::acquire(&path, "sync"),
            Err(GateError::WorkTreeBusy { holder }) if holder.starts_with("watcher")
        );

        drop(live);
        assert!(!path.exists());
    }

    #[test]
    fn test_reclaim_removes_the_dead_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gate.lock");
        let dead = LockHolder {
            pid: 2147483000,
            holder: "sync".to_string(),
            acquired_at: Utc::now(),
            fingerprint: None,
        };
        std::fs::write(&path, serde_json::to_vec(&dead).unwrap()).unwrap();

        assert!(reclaim(&path, Some(&dead)).unwrap());
        assert!(!path.exists());
        // Already gone: nothing to reclaim
        assert!(!reclaim(&path, Some(&dead)).unwrap());
    }

    #[test]
    fn test_half_written_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gate.lock");
        std::fs::write(&path, "").unwrap();

        // Fresh and empty: someone is mid-acquire
        assert_matches!(
            WorkTreeLock::acquire(&path, "sync"),
            Err(GateError::WorkTreeBusy { .. })
        );

        // Old and empty: abandoned
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(std::time::SystemTime::now() - Duration::from_secs(60))
            .unwrap();
        drop(file);

        assert!(WorkTreeLock::acquire(&path, "sync").is_ok());
    }
}
