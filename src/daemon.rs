//! Daemon Supervisor - owns the singleton background watcher.
//!
//! The supervisor never runs the watch loop itself. It claims the PID marker,
//! asks a [`Launcher`] for a detached process and records that process in the
//! marker. Stopping signals the recorded process and removes the marker if it
//! still names that process.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::GateError;
use crate::registry::{DaemonStatus, PidMarker, ProcessRegistry};

/// How often `stop` re-checks the process after signalling it
const STOP_POLL: Duration = Duration::from_millis(100);

/// Spawns the detached watcher process
pub trait Launcher: Send + Sync {
    /// Start the process and return its PID
    fn launch(&self) -> Result<u32>;
}

/// Re-executes the current binary with the hidden `watch` subcommand
pub struct ExecLauncher {
    exe: PathBuf,
    config_path: Option<PathBuf>,
    log_file: PathBuf,
}

impl ExecLauncher {
    pub fn new(config: &Config, config_path: Option<PathBuf>) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate the running executable")?;
        Ok(Self {
            exe,
            config_path,
            log_file: config.log_file_path(),
        })
    }
}

impl Launcher for ExecLauncher {
    fn launch(&self) -> Result<u32> {
        if let Some(parent) = self.log_file.parent() {
            fs::create_dir_all(parent).context("Failed to create log file directory")?;
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_context(|| format!("Failed to open log file {}", self.log_file.display()))?;

        let mut cmd = Command::new(&self.exe);
        if let Some(config_path) = &self.config_path {
            cmd.arg("--config").arg(config_path);
        }
        cmd.arg("watch")
            .stdin(Stdio::null())
            .stdout(log.try_clone().context("Failed to duplicate log handle")?)
            .stderr(log);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group: the terminal's SIGINT/SIGHUP stay with the caller
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.exe.display()))?;

        debug!("Launched {} watch (PID {})", self.exe.display(), child.id());
        Ok(child.id())
    }
}

/// How a running daemon went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited after SIGTERM
    Terminated { pid: u32 },
    /// Ignored SIGTERM past the timeout and was killed
    Killed { pid: u32 },
    /// The marker named a dead process; only the marker was removed
    Reclaimed { pid: u32 },
}

pub struct Supervisor {
    registry: ProcessRegistry,
    launcher: Box<dyn Launcher>,
    stop_timeout: Duration,
}

impl Supervisor {
    pub fn new(registry: ProcessRegistry, launcher: Box<dyn Launcher>, stop_timeout: Duration) -> Self {
        Self {
            registry,
            launcher,
            stop_timeout,
        }
    }

    pub fn from_config(config: &Config, config_path: Option<PathBuf>) -> Result<Self> {
        Ok(Self::new(
            ProcessRegistry::new(config.pid_file_path()),
            Box::new(ExecLauncher::new(config, config_path)?),
            config.stop_timeout(),
        ))
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn start(&self) -> Result<PidMarker, GateError> {
        let claim = self.registry.claim()?;
        let pid = self.launcher.launch().map_err(GateError::Launch)?;
        let marker = claim.record(pid)?;

        info!("Daemon started (PID {})", pid);
        Ok(marker)
    }

    pub async fn stop(&self) -> Result<StopOutcome, GateError> {
        let marker = match self.registry.inspect()? {
            DaemonStatus::Stopped => return Err(GateError::NotRunning),
            DaemonStatus::Stale(marker) => {
                info!("Daemon was not running, removed stale marker (PID {})", marker.pid);
                return Ok(StopOutcome::Reclaimed { pid: marker.pid });
            }
            DaemonStatus::Running(marker) => marker,
        };

        info!("Sending shutdown signal to daemon process {}", marker.pid);
        send_signal(marker.pid, Termination::Graceful);

        let outcome = if self.wait_for_exit(&marker, self.stop_timeout).await {
            StopOutcome::Terminated { pid: marker.pid }
        } else {
            warn!(
                "Daemon (PID {}) still running after {:?}, killing it",
                marker.pid, self.stop_timeout
            );
            send_signal(marker.pid, Termination::Forced);
            self.wait_for_exit(&marker, Duration::from_secs(1)).await;
            StopOutcome::Killed { pid: marker.pid }
        };

        // A daemon started while we waited owns the marker now
        if !self.registry.release_if_owner(marker.pid)? {
            debug!("PID marker no longer names PID {}, leaving it", marker.pid);
        }
        info!("Daemon stopped (PID {})", marker.pid);
        Ok(outcome)
    }

    pub fn status(&self) -> Result<DaemonStatus, GateError> {
        self.registry.inspect()
    }

    pub async fn restart(&self) -> Result<PidMarker, GateError> {
        match self.stop().await {
            Ok(outcome) => debug!("Restart: {:?}", outcome),
            Err(GateError::NotRunning) => debug!("Restart: daemon was not running"),
            Err(e) => return Err(e),
        }
        self.start()
    }

    async fn wait_for_exit(&self, marker: &PidMarker, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !marker.is_alive() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(STOP_POLL).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful,
    Forced,
}

#[cfg(unix)]
fn send_signal(pid: u32, how: Termination) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let sig = match how {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
        debug!("{:?} to PID {} failed: {}", sig, pid, e);
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _how: Termination) {
    warn!("Signalling PID {} is not supported on this platform", pid);
}
