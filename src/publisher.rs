//! Remote Publisher - push the branch, then the release tag, then create the
//! hosted release.
//!
//! The order is fixed: a tag never reaches the remote before the commit it
//! points at. Branch or tag failures are hard and leave the local tag in place
//! for a retry. A failed hosted release is reported but does not fail the
//! publication, since branch and tag are already out.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{GateError, PublishStep};
use crate::git::VersionControl;
use crate::github::ReleaseHost;
use crate::session::{Release, SyncClass, SyncSession};

/// Result of a publication that reached the remote
#[derive(Debug)]
pub struct Publication {
    pub release: Release,
    /// Soft failure of the hosted-release step
    pub warning: Option<GateError>,
}

/// Result of pushing everything still pending
#[derive(Debug, Default)]
pub struct PushReport {
    pub branch: String,
    pub pushed_tags: Vec<String>,
}

pub struct RemotePublisher {
    vcs: Arc<dyn VersionControl>,
    host: Option<Arc<dyn ReleaseHost>>,
    branch: String,
}

impl RemotePublisher {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        host: Option<Arc<dyn ReleaseHost>>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            vcs,
            host,
            branch: branch.into(),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub async fn publish(&self, session: &SyncSession) -> Result<Publication, GateError> {
        self.vcs
            .push_branch(&self.branch)
            .await
            .map_err(|source| GateError::PushFailed {
                step: PublishStep::Branch,
                source,
            })?;

        self.vcs
            .push_tag(&session.tag_name)
            .await
            .map_err(|source| GateError::PushFailed {
                step: PublishStep::Tag,
                source,
            })?;

        info!("Published {} on {}", session.tag_name, self.branch);

        let mut release = Release {
            tag_name: session.tag_name.clone(),
            commit: session.commit.clone(),
            annotation: session.annotation.clone(),
            published_at: Utc::now(),
            hosted_url: None,
        };

        let warning = match &self.host {
            Some(host) => {
                let title = format!("{} release: {}", session.class, session.message);
                match host
                    .create_release(&session.tag_name, &title, &session.annotation)
                    .await
                {
                    Ok(url) => {
                        release.hosted_url = Some(url);
                        None
                    }
                    Err(source) => {
                        warn!(
                            "Hosted release for {} failed, tag is published: {:#}",
                            session.tag_name, source
                        );
                        Some(GateError::ReleaseCreationFailed {
                            tag: session.tag_name.clone(),
                            source,
                        })
                    }
                }
            }
            None => None,
        };

        Ok(Publication { release, warning })
    }

    /// Release tags that exist locally but not on the remote, oldest first
    pub async fn unpushed_tags(&self) -> Result<Vec<String>, GateError> {
        let local = self.vcs.local_tags().await.map_err(GateError::Git)?;
        let remote: HashSet<String> = self
            .vcs
            .remote_tags()
            .await
            .map_err(GateError::Git)?
            .into_iter()
            .collect();

        let mut pending: Vec<String> = local
            .into_iter()
            .filter(|t| SyncClass::of_tag(t).is_some() && !remote.contains(t))
            .collect();
        // Timestamps sort lexically; order by stamp across classes
        pending.sort_by(|a, b| stamp(a).cmp(stamp(b)).then_with(|| a.cmp(b)));
        Ok(pending)
    }

    /// Push the branch, then every release tag the remote is missing
    pub async fn push_pending(&self) -> Result<PushReport, GateError> {
        let pending = self.unpushed_tags().await?;

        self.vcs
            .push_branch(&self.branch)
            .await
            .map_err(|source| GateError::PushFailed {
                step: PublishStep::Branch,
                source,
            })?;

        let mut report = PushReport {
            branch: self.branch.clone(),
            pushed_tags: Vec::new(),
        };

        for tag in pending {
            self.vcs
                .push_tag(&tag)
                .await
                .map_err(|source| GateError::PushFailed {
                    step: PublishStep::Tag,
                    source,
                })?;
            report.pushed_tags.push(tag);
        }

        info!(
            "Pushed {} and {} pending tags",
            report.branch,
            report.pushed_tags.len()
        );
        Ok(report)
    }
}

fn stamp(tag: &str) -> &str {
    tag.split_once('/').map(|(_, s)| s).unwrap_or(tag)
}
