//! Change Watcher - the loop that runs inside the daemon process.
//!
//! Every tick scans the working tree, filters it through the exclusion policy
//! and auto-commits whatever is approved. The watcher never tags. It pushes
//! the branch only when `daemon.auto_push` is set. A failed or slow tick is
//! logged and the loop carries on.
//!
//! The tick deadline bounds the read-only scan. Once a commit has started it
//! runs to completion; killing git mid-write would leave `index.lock` behind
//! and block every later write in the repository.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::GateError;
use crate::git::{short, VersionControl};
use crate::history::{EventType, History};
use crate::lock::WorkTreeLock;
use crate::policy::ExclusionPolicy;
use crate::registry::ProcessRegistry;
use crate::session::Eligibility;

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing approved to commit
    Idle { excluded: usize },
    Committed {
        commit: String,
        files: usize,
        pushed: bool,
    },
    /// Another write path held the working tree
    Skipped { reason: String },
}

pub struct ChangeWatcher {
    vcs: Arc<dyn VersionControl>,
    policy: ExclusionPolicy,
    lock_path: PathBuf,
    interval: Duration,
    tick_timeout: Duration,
    auto_push: bool,
    branch: Option<String>,
    history: Option<Arc<History>>,
}

impl ChangeWatcher {
    pub fn new(vcs: Arc<dyn VersionControl>, policy: ExclusionPolicy, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            vcs,
            policy,
            lock_path: lock_path.into(),
            interval: Duration::from_secs(300),
            tick_timeout: Duration::from_secs(120),
            auto_push: false,
            branch: None,
            history: None,
        }
    }

    pub fn from_config(
        config: &Config,
        vcs: Arc<dyn VersionControl>,
        history: Option<Arc<History>>,
    ) -> Result<Self> {
        let policy = ExclusionPolicy::from_config(&config.policy)?;
        let mut watcher = Self::new(vcs, policy, config.lock_file_path())
            .with_timing(config.watch_interval()?, config.tick_timeout()?)
            .with_auto_push(config.daemon.auto_push, config.branch.clone());
        watcher.history = history;
        Ok(watcher)
    }

    pub fn with_timing(mut self, interval: Duration, tick_timeout: Duration) -> Self {
        self.interval = interval;
        self.tick_timeout = tick_timeout;
        self
    }

    pub fn with_auto_push(mut self, auto_push: bool, branch: Option<String>) -> Self {
        self.auto_push = auto_push;
        self.branch = branch;
        self
    }

    pub fn with_history(mut self, history: Arc<History>) -> Self {
        self.history = Some(history);
        self
    }

    /// One scan-and-commit pass. A scan slower than the tick timeout fails
    /// the tick; the commit and push are never cut short.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let _lock = match WorkTreeLock::acquire(&self.lock_path, "watcher") {
            Ok(lock) => lock,
            Err(GateError::WorkTreeBusy { holder }) => {
                debug!("Working tree busy, skipping tick: {}", holder);
                return Ok(TickOutcome::Skipped { reason: holder });
            }
            Err(e) => return Err(e.into()),
        };

        let changes = tokio::time::timeout(self.tick_timeout, self.vcs.changed_files())
            .await
            .map_err(|_| anyhow!("Working-tree scan exceeded {:?}", self.tick_timeout))?
            .context("Failed to scan working tree")?;

        let (approved, excluded): (Vec<_>, Vec<_>) = changes
            .into_iter()
            .partition(|(path, _)| self.policy.classify(path) == Eligibility::Approved);

        if approved.is_empty() {
            debug!("No approved changes ({} excluded)", excluded.len());
            return Ok(TickOutcome::Idle {
                excluded: excluded.len(),
            });
        }

        let paths: Vec<String> = approved.into_iter().map(|(path, _)| path).collect();
        let message = auto_commit_message(&paths);
        let commit = self
            .vcs
            .commit(&message, &paths)
            .await
            .context("Auto-commit failed")?;

        info!("Auto-committed {} approved files as {}", paths.len(), short(&commit));
        self.note(
            EventType::AutoCommit,
            &format!("auto-committed {} files as {}", paths.len(), short(&commit)),
        );

        let pushed = if self.auto_push {
            self.push_branch().await
        } else {
            false
        };

        Ok(TickOutcome::Committed {
            commit,
            files: paths.len(),
            pushed,
        })
    }

    /// Tick on the interval until `shutdown` fires. Shutdown is honoured
    /// between ticks; a tick in progress is allowed to finish.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Watcher loop started with interval: {:?}", self.interval);

        // Skip the first immediate tick
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received in watcher loop");
                    break;
                }

                _ = timer.tick() => {
                    let started = Instant::now();
                    match self.tick().await {
                        Ok(outcome) => {
                            debug!("Tick finished in {:.2}s: {:?}", started.elapsed().as_secs_f64(), outcome);
                        }
                        Err(e) => {
                            warn!("Watcher tick failed: {:#}", e);
                            self.note(EventType::TickFailed, &format!("{:#}", e));
                        }
                    }
                }
            }
        }

        info!("Watcher loop exiting");
        Ok(())
    }

    /// Daemon entry point: run until SIGTERM/SIGINT, then drop the PID marker
    /// if it still names this process.
    pub async fn serve(&self, registry: &ProcessRegistry) -> Result<()> {
        let (shutdown_sender, shutdown_receiver) = broadcast::channel(1);

        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping watcher...");
            let _ = shutdown_sender.send(());
        });

        let result = self.run(shutdown_receiver).await;

        match registry.release_if_owner(std::process::id()) {
            Ok(true) => {}
            Ok(false) => debug!("PID marker no longer names this process, leaving it"),
            Err(e) => error!("Failed to remove PID marker: {}", e),
        }

        result
    }

    async fn push_branch(&self) -> bool {
        let branch = match &self.branch {
            Some(branch) => branch.clone(),
            None => match self.vcs.current_branch().await {
                Ok(branch) => branch,
                Err(e) => {
                    warn!("Auto-push skipped, cannot resolve branch: {:#}", e);
                    return false;
                }
            },
        };

        match self.vcs.push_branch(&branch).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Auto-push of {} failed: {:#}", branch, e);
                self.note(EventType::PushFailed, &format!("auto-push of {} failed: {:#}", branch, e));
                false
            }
        }
    }

    fn note(&self, event_type: EventType, summary: &str) {
        if let Some(history) = &self.history {
            history.note(event_type, None, summary);
        }
    }
}

fn auto_commit_message(paths: &[String]) -> String {
    let mut message = format!("auto: {} approved change(s)\n", paths.len());
    for path in paths {
        message.push('\n');
        message.push_str(path);
    }
    message
}

/// Wait for SIGTERM or SIGINT (Ctrl+C)
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => debug!("SIGTERM received"),
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        debug!("Ctrl+C received");
    }
}
