use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Step of a publication that talks to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    Branch,
    Tag,
    Release,
}

impl fmt::Display for PublishStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishStep::Branch => f.write_str("branch push"),
            PublishStep::Tag => f.write_str("tag push"),
            PublishStep::Release => f.write_str("release creation"),
        }
    }
}

/// Error surface for the sync gate: daemon control, tagging and publication.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("daemon is already running (PID {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("daemon is not running")]
    NotRunning,

    #[error("invalid sync class '{0}' (expected stable, release, hotfix or production)")]
    InvalidClass(String),

    #[error("sync message must not be empty")]
    EmptyMessage,

    #[error("sync aborted by user")]
    UserAborted,

    #[error("commit failed: {0:#}")]
    CommitFailed(#[source] anyhow::Error),

    #[error("tag failed: {0:#}")]
    TagFailed(#[source] anyhow::Error),

    #[error("{step} failed: {source:#}")]
    PushFailed {
        step: PublishStep,
        #[source]
        source: anyhow::Error,
    },

    #[error("release creation failed for {tag}: {source:#}")]
    ReleaseCreationFailed {
        tag: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("working tree is busy ({holder})")]
    WorkTreeBusy { holder: String },

    #[error("marker I/O error at {path}: {source}")]
    Registry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon launch failed: {0:#}")]
    Launch(#[source] anyhow::Error),

    #[error("git error: {0:#}")]
    Git(#[source] anyhow::Error),
}

impl GateError {
    /// Name of the remote step that failed, if this is a publication failure.
    pub fn failed_step(&self) -> Option<PublishStep> {
        match self {
            GateError::PushFailed { step, .. } => Some(*step),
            GateError::ReleaseCreationFailed { .. } => Some(PublishStep::Release),
            _ => None,
        }
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> GateError {
    GateError::Registry {
        path: path.into(),
        source,
    }
}
