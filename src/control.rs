//! Control Surface - the operations behind the CLI.
//!
//! A manual sync walks a one-way state machine:
//!
//! ```text
//! Idle -> Scanning -> AwaitingConfirmation -> Committing -> Tagging -> Publishing -> Done
//!                                        \-> Aborted (declined or any step failed)
//! ```
//!
//! Every write path holds the working-tree lock for its whole duration.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::GateError;
use crate::git::{Divergence, VersionControl};
use crate::github::{ReleaseHost, RemoteRepo};
use crate::history::{EventType, History};
use crate::lock::WorkTreeLock;
use crate::policy::ExclusionPolicy;
use crate::publisher::{PushReport, RemotePublisher};
use crate::session::{approved_paths, FileChangeRecord, Release, SyncRequest, SyncSession};
use crate::tagger::ReleaseTagger;

/// What the operator is asked to approve
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub request: SyncRequest,
    /// Tag name the sync would create right now
    pub tag_preview: String,
    pub approved: Vec<String>,
    pub excluded: usize,
    pub branch: String,
}

impl SessionSummary {
    pub fn file_count(&self) -> usize {
        self.approved.len()
    }
}

/// Injectable confirmation step
pub trait Confirm {
    fn confirm(&self, summary: &SessionSummary) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&SessionSummary) -> bool,
{
    fn confirm(&self, summary: &SessionSummary) -> bool {
        self(summary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncPhase {
    Idle,
    Scanning,
    AwaitingConfirmation,
    Committing,
    Tagging,
    Publishing,
    Done,
    Aborted,
}

impl SyncPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncPhase::Done | SyncPhase::Aborted)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Forward-only phase tracking for one invocation
#[derive(Debug)]
struct PhaseTracker {
    current: SyncPhase,
    visited: Vec<SyncPhase>,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            current: SyncPhase::Idle,
            visited: vec![SyncPhase::Idle],
        }
    }

    fn advance(&mut self, next: SyncPhase) {
        if self.current.is_terminal() || next <= self.current {
            warn!("Ignoring sync transition {} -> {}", self.current, next);
            return;
        }
        debug!("Sync phase: {} -> {}", self.current, next);
        self.current = next;
        self.visited.push(next);
    }
}

/// Result of a successful sync
#[derive(Debug)]
pub struct SyncOutcome {
    pub session: SyncSession,
    pub release: Release,
    /// Soft failure (hosted release), already published otherwise
    pub warning: Option<GateError>,
    pub phases: Vec<SyncPhase>,
}

/// Changed paths split by the policy
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub records: Vec<FileChangeRecord>,
}

impl ScanReport {
    pub fn approved(&self) -> Vec<String> {
        approved_paths(&self.records)
    }

    pub fn excluded_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_approved()).count()
    }
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub branch: String,
    pub divergence: Option<Divergence>,
    /// Why the remote comparison is missing
    pub remote_error: Option<String>,
    pub pending: ScanReport,
    pub unpushed_tags: Vec<String>,
}

#[derive(Debug, Default)]
pub struct InfoReport {
    pub remote_url: Option<String>,
    pub branch: String,
    pub head: Option<String>,
    pub remote: Option<RemoteRepo>,
    pub remote_error: Option<String>,
}

pub struct ControlSurface {
    vcs: Arc<dyn VersionControl>,
    policy: ExclusionPolicy,
    tagger: ReleaseTagger,
    publisher: RemotePublisher,
    host: Option<Arc<dyn ReleaseHost>>,
    lock_path: std::path::PathBuf,
    history: Option<Arc<History>>,
}

impl ControlSurface {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        host: Option<Arc<dyn ReleaseHost>>,
        policy: ExclusionPolicy,
        branch: impl Into<String>,
        lock_path: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            tagger: ReleaseTagger::new(vcs.clone()),
            publisher: RemotePublisher::new(vcs.clone(), host.clone(), branch),
            vcs,
            policy,
            host,
            lock_path: lock_path.into(),
            history: None,
        }
    }

    /// Build from configuration, resolving the branch from the work tree when
    /// none is configured.
    pub async fn from_config(
        config: &Config,
        vcs: Arc<dyn VersionControl>,
        host: Option<Arc<dyn ReleaseHost>>,
        history: Option<Arc<History>>,
    ) -> anyhow::Result<Self> {
        let policy = ExclusionPolicy::from_config(&config.policy)?;
        let branch = match &config.branch {
            Some(branch) => branch.clone(),
            None => vcs.current_branch().await?,
        };

        let mut surface = Self::new(vcs, host, policy, branch, config.lock_file_path());
        surface.history = history;
        Ok(surface)
    }

    pub fn with_tagger(mut self, tagger: ReleaseTagger) -> Self {
        self.tagger = tagger;
        self
    }

    pub fn with_history(mut self, history: Arc<History>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn branch(&self) -> &str {
        self.publisher.branch()
    }

    /// Classify the working tree. Read-only.
    pub async fn scan(&self) -> Result<ScanReport, GateError> {
        let changes = self.vcs.changed_files().await.map_err(GateError::Git)?;

        let records = changes
            .into_iter()
            .map(|(path, status)| FileChangeRecord {
                eligibility: self.policy.classify(&path),
                path,
                status,
            })
            .collect();

        Ok(ScanReport { records })
    }

    /// Gated publish: scan, confirm, commit, tag, push, release.
    pub async fn sync(
        &self,
        class: &str,
        message: &str,
        confirm: &dyn Confirm,
    ) -> Result<SyncOutcome, GateError> {
        let mut phase = PhaseTracker::new();
        let request = SyncRequest::new(class, message)?;
        let _lock = WorkTreeLock::acquire(&self.lock_path, "sync")?;

        let result = self.run_sync(&request, confirm, &mut phase).await;
        match &result {
            Ok(outcome) => info!(
                "Sync {} finished: {} files, tag {}",
                request.class, outcome.session.file_count, outcome.session.tag_name
            ),
            Err(e) => {
                if !matches!(e, GateError::UserAborted) {
                    warn!("Sync {} aborted during {}: {}", request.class, phase.current, e);
                }
                phase.advance(SyncPhase::Aborted);
                // Push and tag failures are recorded where they happen
                if !matches!(e, GateError::PushFailed { .. }) {
                    self.note(EventType::Aborted, None, &format!("{} sync: {}", request.class, e));
                }
            }
        }
        result
    }

    async fn run_sync(
        &self,
        request: &SyncRequest,
        confirm: &dyn Confirm,
        phase: &mut PhaseTracker,
    ) -> Result<SyncOutcome, GateError> {
        phase.advance(SyncPhase::Scanning);
        let scan = self.scan().await?;

        phase.advance(SyncPhase::AwaitingConfirmation);
        let summary = SessionSummary {
            request: request.clone(),
            tag_preview: request.tag_name(Utc::now()),
            approved: scan.approved(),
            excluded: scan.excluded_count(),
            branch: self.branch().to_string(),
        };

        if !confirm.confirm(&summary) {
            info!("Sync declined, nothing changed");
            return Err(GateError::UserAborted);
        }

        phase.advance(SyncPhase::Committing);
        self.tagger.commit_batch(request, &summary.approved).await?;

        phase.advance(SyncPhase::Tagging);
        let session = self.tagger.tag_head(request, summary.file_count()).await?;
        if !session.reused_tag {
            self.note(EventType::Tagged, Some(&session.tag_name), &session.message);
        }

        phase.advance(SyncPhase::Publishing);
        let publication = match self.publisher.publish(&session).await {
            Ok(publication) => publication,
            Err(e) => {
                warn!("{} stays local until the next push: {}", session.tag_name, e);
                self.note(EventType::PushFailed, Some(&session.tag_name), &e.to_string());
                return Err(e);
            }
        };

        match &publication.warning {
            Some(warning) => {
                self.note(EventType::ReleaseFailed, Some(&session.tag_name), &warning.to_string())
            }
            None => self.note(EventType::Published, Some(&session.tag_name), &session.message),
        }

        phase.advance(SyncPhase::Done);
        Ok(SyncOutcome {
            session,
            release: publication.release,
            warning: publication.warning,
            phases: phase.visited.clone(),
        })
    }

    /// Fast-forward the branch from the remote
    pub async fn pull(&self) -> Result<String, GateError> {
        let _lock = WorkTreeLock::acquire(&self.lock_path, "pull")?;
        let summary = self.vcs.pull(self.branch()).await.map_err(GateError::Git)?;
        info!("Pulled {}: {}", self.branch(), summary);
        Ok(summary)
    }

    /// Push the branch and every release tag the remote is missing
    pub async fn push(&self) -> Result<PushReport, GateError> {
        let _lock = WorkTreeLock::acquire(&self.lock_path, "push")?;
        match self.publisher.push_pending().await {
            Ok(report) => {
                for tag in &report.pushed_tags {
                    self.note(EventType::Published, Some(tag), "pushed by push");
                }
                Ok(report)
            }
            Err(e) => {
                self.note(EventType::PushFailed, None, &e.to_string());
                Err(e)
            }
        }
    }

    /// Compare local and remote. Problems are reported, not returned.
    pub async fn check(&self) -> CheckReport {
        let mut report = CheckReport {
            branch: self.branch().to_string(),
            ..Default::default()
        };

        match self.vcs.fetch().await {
            Ok(()) => match self.vcs.divergence(self.branch()).await {
                Ok(divergence) => report.divergence = Some(divergence),
                Err(e) => report.remote_error = Some(format!("{:#}", e)),
            },
            Err(e) => report.remote_error = Some(format!("{:#}", e)),
        }

        match self.scan().await {
            Ok(scan) => report.pending = scan,
            Err(e) => warn!("Cannot scan working tree: {}", e),
        }

        match self.publisher.unpushed_tags().await {
            Ok(tags) => report.unpushed_tags = tags,
            Err(e) => warn!("Cannot list unpushed tags: {}", e),
        }

        report
    }

    /// Remote metadata. Problems are reported, not returned.
    pub async fn info(&self) -> InfoReport {
        let mut report = InfoReport {
            branch: self.branch().to_string(),
            ..Default::default()
        };

        match self.vcs.remote_url().await {
            Ok(url) => report.remote_url = url,
            Err(e) => warn!("Cannot read remote URL: {:#}", e),
        }
        report.head = self.vcs.head().await.ok();

        match &self.host {
            Some(host) => match host.repository_info().await {
                Ok(remote) => report.remote = Some(remote),
                Err(e) => report.remote_error = Some(format!("{:#}", e)),
            },
            None => report.remote_error = Some("hosted-release capability unavailable".to_string()),
        }

        report
    }

    fn note(&self, event_type: EventType, tag: Option<&str>, summary: &str) {
        if let Some(history) = &self.history {
            history.note(event_type, tag, summary);
        }
    }
}
