//! releasegate - Gated release publishing for a local scratch repository
//!
//! Engineers commit freely in a local repository. Only batches they explicitly
//! approve are tagged, pushed and published as releases to the canonical
//! remote, while a background watcher keeps auto-committing approved changes.
//!
//! ## Core Features
//!
//! - **Exclusion Policy**: Scratch, temp and work-in-progress files never leave the machine
//! - **Daemon Supervision**: Singleton background watcher behind a PID marker
//! - **Release Tagging**: Timestamped, annotated `<class>/<YYYYMMDD_HHMMSS>` tags
//! - **Ordered Publication**: Branch, then tag, then optional GitHub release
//! - **Event History**: SQLite ledger of commits, tags and failures
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`control`]: Operations behind the CLI and the manual sync state machine
//! - [`daemon`]: Start/stop/status/restart of the background watcher
//! - [`git`]: Version-control capability and the git CLI backend
//! - [`github`]: Hosted-release capability and GitHub integration

pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod git;
pub mod github;
pub mod history;
pub mod lock;
pub mod policy;
pub mod publisher;
pub mod registry;
pub mod session;
pub mod tagger;
pub mod watcher;

pub use config::Config;
pub use control::{ControlSurface, SessionSummary, SyncOutcome, SyncPhase};
pub use daemon::{Supervisor, StopOutcome};
pub use error::{GateError, PublishStep};
pub use git::{GitCli, VersionControl};
pub use github::{GitHubReleases, ReleaseHost};
pub use history::{EventType, History};
pub use lock::WorkTreeLock;
pub use policy::ExclusionPolicy;
pub use publisher::RemotePublisher;
pub use registry::{DaemonStatus, PidMarker, ProcessRegistry};
pub use session::{SyncClass, SyncRequest, SyncSession};
pub use tagger::ReleaseTagger;
pub use watcher::ChangeWatcher;
