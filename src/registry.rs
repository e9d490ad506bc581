//! Process registry - the singleton PID marker behind the daemon supervisor.
//!
//! The marker is a small JSON document `{pid, started_at, fingerprint}`. The
//! fingerprint is the kernel start time of the process (Linux), so a PID that
//! was recycled after the daemon died reads as stale instead of running.
//!
//! Reads reclaim stale markers; claims use exclusive creation so two callers
//! can never both own the marker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{io_err, GateError};

/// Contents of the PID marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidMarker {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub fingerprint: Option<u64>,
}

impl PidMarker {
    /// Marker describing a live process right now
    pub fn for_process(pid: u32) -> Self {
        Self {
            pid,
            started_at: Utc::now(),
            fingerprint: process_fingerprint(pid),
        }
    }

    pub fn is_alive(&self) -> bool {
        process_alive(self.pid, self.fingerprint)
    }
}

/// What the marker says about the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonStatus {
    Running(PidMarker),
    Stopped,
    /// A marker existed but its process was gone; the marker has been removed
    Stale(PidMarker),
}

impl DaemonStatus {
    pub fn label(&self) -> &'static str {
        match self {
            DaemonStatus::Running(_) => "running",
            DaemonStatus::Stopped => "stopped",
            DaemonStatus::Stale(_) => "stale",
        }
    }
}

/// An exclusive claim on the marker, released on drop unless recorded
#[derive(Debug)]
pub struct Claim<'a> {
    registry: &'a ProcessRegistry,
    recorded: bool,
}

impl Claim<'_> {
    /// Point the claimed marker at the process that now owns it
    pub fn record(mut self, pid: u32) -> Result<PidMarker, GateError> {
        let marker = PidMarker::for_process(pid);
        self.registry.write_marker(&marker)?;
        self.recorded = true;
        info!("PID marker written: {} (PID: {})", self.registry.path.display(), pid);
        Ok(marker)
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            if let Err(e) = fs::remove_file(&self.registry.path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to release PID marker claim: {}", e);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    path: PathBuf,
}

impl ProcessRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw marker contents. An unparsable marker reads as PID 0 (never alive).
    pub fn read(&self) -> Result<Option<PidMarker>, GateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&self.path, e)),
        };

        Ok(Some(parse_marker(&content).unwrap_or_else(|| {
            warn!("Unreadable PID marker at {}", self.path.display());
            PidMarker {
                pid: 0,
                started_at: DateTime::<Utc>::UNIX_EPOCH,
                fingerprint: None,
            }
        })))
    }

    /// Current status, reclaiming a stale marker as a side effect
    pub fn inspect(&self) -> Result<DaemonStatus, GateError> {
        let Some(marker) = self.read()? else {
            return Ok(DaemonStatus::Stopped);
        };

        if marker.is_alive() {
            return Ok(DaemonStatus::Running(marker));
        }

        if self.reclaim(&marker)? {
            info!("Reclaimed stale PID marker (PID {})", marker.pid);
            Ok(DaemonStatus::Stale(marker))
        } else {
            // Someone else reclaimed or replaced it in the meantime
            self.inspect_once()
        }
    }

    fn inspect_once(&self) -> Result<DaemonStatus, GateError> {
        match self.read()? {
            Some(marker) if marker.is_alive() => Ok(DaemonStatus::Running(marker)),
            Some(marker) => Ok(DaemonStatus::Stale(marker)),
            None => Ok(DaemonStatus::Stopped),
        }
    }

    /// Take exclusive ownership of the marker before launching a daemon.
    ///
    /// The marker initially names the caller; [`Claim::record`] replaces it
    /// with the launched process.
    pub fn claim(&self) -> Result<Claim<'_>, GateError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&self.path) {
                Ok(mut file) => {
                    let marker = PidMarker::for_process(std::process::id());
                    let body = serde_json::to_vec(&marker).unwrap_or_default();
                    file.write_all(&body).map_err(|e| io_err(&self.path, e))?;
                    return Ok(Claim {
                        registry: self,
                        recorded: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.inspect()? {
                    DaemonStatus::Running(marker) => {
                        return Err(GateError::AlreadyRunning { pid: marker.pid })
                    }
                    DaemonStatus::Stale(_) | DaemonStatus::Stopped => continue,
                },
                Err(e) => return Err(io_err(&self.path, e)),
            }
        }

        match self.read()? {
            Some(marker) => Err(GateError::AlreadyRunning { pid: marker.pid }),
            None => Err(io_err(
                &self.path,
                std::io::Error::new(ErrorKind::WouldBlock, "marker contended"),
            )),
        }
    }

    /// Remove the marker if it still names `pid`
    pub fn release_if_owner(&self, pid: u32) -> Result<bool, GateError> {
        match self.read()? {
            Some(marker) if marker.pid == pid => {
                self.remove()?;
                info!("PID marker removed: {}", self.path.display());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn remove(&self) -> Result<(), GateError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&self.path, e)),
        }
    }

    /// Atomically retire a stale marker. Returns false if another caller got
    /// there first.
    fn reclaim(&self, seen: &PidMarker) -> Result<bool, GateError> {
        let graveyard = self
            .path
            .with_extension(format!("stale.{}", std::process::id()));

        match fs::rename(&self.path, &graveyard) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_err(&self.path, e)),
        }

        // The rename may have raced with a fresh claim; put a live marker back
        let taken = fs::read_to_string(&graveyard)
            .ok()
            .and_then(|c| parse_marker(&c));
        if let Some(taken) = taken {
            if taken.pid != seen.pid && taken.is_alive() {
                debug!("Reclaim raced with a live marker, restoring it");
                let _ = fs::rename(&graveyard, &self.path);
                return Ok(false);
            }
        }

        let _ = fs::remove_file(&graveyard);
        Ok(true)
    }

    fn write_marker(&self, marker: &PidMarker) -> Result<(), GateError> {
        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        let body = serde_json::to_vec(marker)
            .map_err(|e| io_err(&tmp, std::io::Error::new(ErrorKind::InvalidData, e)))?;

        fs::write(&tmp, body).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))
    }
}

fn parse_marker(content: &str) -> Option<PidMarker> {
    let content = content.trim();
    if let Ok(marker) = serde_json::from_str::<PidMarker>(content) {
        return Some(marker);
    }

    // Bare numeric markers written by older tooling
    content.parse::<u32>().ok().map(|pid| PidMarker {
        pid,
        started_at: DateTime::<Utc>::UNIX_EPOCH,
        fingerprint: None,
    })
}

/// Best-effort liveness: the process exists, is not a zombie, and (when
/// known) started at the recorded kernel time.
pub fn process_alive(pid: u32, fingerprint: Option<u64>) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return false,
            // EPERM: exists but belongs to someone else
            Err(_) => {}
        }
    }

    match proc_stat(pid) {
        Some(stat) => {
            if matches!(stat.state, 'Z' | 'X') {
                return false;
            }
            match fingerprint {
                Some(expected) => stat.start_time == expected,
                None => true,
            }
        }
        None => cfg!(unix),
    }
}

/// Kernel start time of a process, where the platform exposes it
pub fn process_fingerprint(pid: u32) -> Option<u64> {
    proc_stat(pid).map(|s| s.start_time)
}

struct ProcStat {
    state: char,
    start_time: u64,
}

fn proc_stat(pid: u32) -> Option<ProcStat> {
    if !cfg!(target_os = "linux") {
        return None;
    }

    let content = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_proc_stat(&content)
}

/// Fields after the parenthesised command name start at field 3 (state);
/// starttime is field 22.
fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    let state = fields.first()?.chars().next()?;
    let start_time = fields.get(19)?.parse().ok()?;

    Some(ProcStat { state, start_time })
}
