//! Release Tagger - commit the approved batch, then create a timestamped,
//! annotated tag on it.
//!
//! [`ReleaseTagger::commit_batch`] runs before [`ReleaseTagger::tag_head`],
//! and `tag_request` chains the two, so a failed commit never leaves a tag
//! behind. A tag that was created earlier but never reached the remote is
//! reused instead of stacking a second tag on the same commit.

use chrono::{DateTime, Timelike, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::GateError;
use crate::git::{short, VersionControl};
use crate::session::{SyncClass, SyncRequest, SyncSession};

/// Attempts at finding an unused tag name before giving up
const MAX_NAME_ATTEMPTS: usize = 3;

/// Time source for tag timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct ReleaseTagger {
    vcs: Arc<dyn VersionControl>,
    clock: Arc<dyn Clock>,
}

impl ReleaseTagger {
    pub fn new(vcs: Arc<dyn VersionControl>) -> Self {
        Self::with_clock(vcs, Arc::new(SystemClock))
    }

    pub fn with_clock(vcs: Arc<dyn VersionControl>, clock: Arc<dyn Clock>) -> Self {
        Self { vcs, clock }
    }

    /// Validate, commit `approved` (if any) and tag HEAD.
    pub async fn tag(
        &self,
        class: &str,
        message: &str,
        approved: &[String],
    ) -> Result<SyncSession, GateError> {
        let request = SyncRequest::new(class, message)?;
        self.tag_request(&request, approved).await
    }

    pub async fn tag_request(
        &self,
        request: &SyncRequest,
        approved: &[String],
    ) -> Result<SyncSession, GateError> {
        self.commit_batch(request, approved).await?;
        self.tag_head(request, approved.len()).await
    }

    /// Commit exactly `approved`. An empty batch commits nothing.
    pub async fn commit_batch(&self, request: &SyncRequest, approved: &[String]) -> Result<(), GateError> {
        let committed_at = self.clock.now();
        if approved.is_empty() {
            return Ok(());
        }

        let commit_message = request.commit_message(approved.len(), committed_at);
        let commit = self
            .vcs
            .commit(&commit_message, approved)
            .await
            .map_err(GateError::CommitFailed)?;
        debug!("Committed {} approved files as {}", approved.len(), short(&commit));
        Ok(())
    }

    /// Tag HEAD for a batch of `file_count` files. With nothing committed,
    /// an unpublished tag of the same class already on HEAD is reused.
    pub async fn tag_head(&self, request: &SyncRequest, file_count: usize) -> Result<SyncSession, GateError> {
        if file_count == 0 {
            if let Some(session) = self.reusable_tag(request).await? {
                return Ok(session);
            }
        }

        let commit = self.vcs.head().await.map_err(GateError::TagFailed)?;

        let mut at = self.clock.now();
        let mut attempt = 1;
        let tag_name = loop {
            let candidate = request.tag_name(at);
            let taken = self
                .vcs
                .tag_exists(&candidate)
                .await
                .map_err(GateError::TagFailed)?;
            if !taken {
                break candidate;
            }

            if attempt >= MAX_NAME_ATTEMPTS {
                return Err(GateError::TagFailed(anyhow::anyhow!(
                    "tag {} already exists and no free timestamp was found",
                    candidate
                )));
            }

            debug!("Tag {} exists, waiting for the next second", candidate);
            tokio::time::sleep(until_next_second(at)).await;
            at = self.clock.now();
            attempt += 1;
        };

        let annotation = request.annotation(file_count, at);
        self.vcs
            .create_tag(&tag_name, &annotation)
            .await
            .map_err(GateError::TagFailed)?;

        info!("Tagged {} as {}", short(&commit), tag_name);

        Ok(SyncSession {
            class: request.class,
            message: request.message.clone(),
            timestamp: at,
            tag_name,
            file_count,
            commit,
            annotation,
            reused_tag: false,
        })
    }

    /// A tag of the same class on HEAD that the remote does not have yet
    async fn reusable_tag(&self, request: &SyncRequest) -> Result<Option<SyncSession>, GateError> {
        let at_head = self.vcs.tags_at_head().await.map_err(GateError::TagFailed)?;
        let mut candidates: Vec<String> = at_head
            .into_iter()
            .filter(|t| SyncClass::of_tag(t) == Some(request.class))
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let remote: HashSet<String> = match self.vcs.remote_tags().await {
            Ok(tags) => tags.into_iter().collect(),
            Err(e) => {
                warn!("Cannot list remote tags, not reusing local tags: {:#}", e);
                return Ok(None);
            }
        };

        candidates.retain(|t| !remote.contains(t));
        candidates.sort();
        let Some(tag_name) = candidates.pop() else {
            return Ok(None);
        };

        let commit = self.vcs.head().await.map_err(GateError::TagFailed)?;
        let at = self.clock.now();
        info!("Reusing unpublished tag {}", tag_name);

        Ok(Some(SyncSession {
            class: request.class,
            message: request.message.clone(),
            timestamp: at,
            annotation: request.annotation(0, at),
            tag_name,
            file_count: 0,
            commit,
            reused_tag: true,
        }))
    }
}

fn until_next_second(at: DateTime<Utc>) -> Duration {
    let elapsed = Duration::from_nanos(u64::from(at.nanosecond() % 1_000_000_000));
    Duration::from_secs(1).saturating_sub(elapsed) + Duration::from_millis(5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::MockVersionControl;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use mockall::predicate::eq;
    use std::sync::Mutex;

    /// Clock that returns the given instants in order, repeating the last one
    struct SteppingClock(Mutex<Vec<DateTime<Utc>>>);

    impl SteppingClock {
        fn new(times: Vec<DateTime<Utc>>) -> Arc<Self> {
            let mut times = times;
            times.reverse();
            Arc::new(Self(Mutex::new(times)))
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            let mut times = self.0.lock().unwrap();
            if times.len() > 1 {
                times.pop().unwrap()
            } else {
                times[0]
            }
        }
    }

    fn t(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, sec).unwrap()
    }

    fn paths(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("core/file{}.py", i)).collect()
    }

    #[tokio::test]
    async fn test_empty_message_touches_nothing() {
        // No expectations: any call on the mock panics
        let vcs = MockVersionControl::new();
        let tagger = ReleaseTagger::with_clock(Arc::new(vcs), SteppingClock::new(vec![t(0)]));

        assert_matches!(
            tagger.tag("stable", "  ", &paths(2)).await,
            Err(GateError::EmptyMessage)
        );
        assert_matches!(
            tagger.tag("beta", "msg", &paths(2)).await,
            Err(GateError::InvalidClass(_))
        );
    }

    #[tokio::test]
    async fn test_commit_then_tag() {
        let mut vcs = MockVersionControl::new();
        vcs.expect_commit()
            .withf(|msg, paths| msg.starts_with("[stable] fix ranking") && paths.len() == 3)
            .times(1)
            .returning(|_, _| Ok("c0ffee00".to_string()));
        vcs.expect_head().returning(|| Ok("c0ffee00".to_string()));
        vcs.expect_tag_exists()
            .with(eq("stable/20261018_120001"))
            .returning(|_| Ok(false));
        vcs.expect_create_tag()
            .withf(|name, annotation| {
                name == "stable/20261018_120001" && annotation.contains("files: 3")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let tagger =
            ReleaseTagger::with_clock(Arc::new(vcs), SteppingClock::new(vec![t(0), t(1)]));
        let session = tagger.tag("stable", "fix ranking", &paths(3)).await.unwrap();

        assert_eq!(session.tag_name, "stable/20261018_120001");
        assert_eq!(session.file_count, 3);
        assert_eq!(session.commit, "c0ffee00");
        assert!(!session.reused_tag);
    }

    #[tokio::test]
    async fn test_commit_failure_creates_no_tag() {
        let mut vcs = MockVersionControl::new();
        vcs.expect_commit()
            .returning(|_, _| Err(anyhow::anyhow!("hook rejected commit")));
        vcs.expect_create_tag().never();

        let tagger = ReleaseTagger::with_clock(Arc::new(vcs), SteppingClock::new(vec![t(0)]));
        let err = tagger.tag("hotfix", "patch", &paths(1)).await.unwrap_err();

        assert_matches!(err, GateError::CommitFailed(_));
        assert!(err.to_string().contains("hook rejected commit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_name_waits_for_next_second() {
        let mut vcs = MockVersionControl::new();
        vcs.expect_commit().returning(|_, _| Ok("abc".to_string()));
        vcs.expect_head().returning(|| Ok("abc".to_string()));
        vcs.expect_tag_exists()
            .with(eq("release/20261018_120005"))
            .returning(|_| Ok(true));
        vcs.expect_tag_exists()
            .with(eq("release/20261018_120006"))
            .returning(|_| Ok(false));
        vcs.expect_create_tag()
            .withf(|name, _| name == "release/20261018_120006")
            .times(1)
            .returning(|_, _| Ok(()));

        let clock = SteppingClock::new(vec![t(5), t(5), t(6)]);
        let tagger = ReleaseTagger::with_clock(Arc::new(vcs), clock);
        let session = tagger.tag("release", "weekly", &paths(1)).await.unwrap();

        assert_eq!(session.tag_name, "release/20261018_120006");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_when_clock_stuck() {
        let mut vcs = MockVersionControl::new();
        vcs.expect_commit().returning(|_, _| Ok("abc".to_string()));
        vcs.expect_head().returning(|| Ok("abc".to_string()));
        vcs.expect_tag_exists().returning(|_| Ok(true));
        vcs.expect_create_tag().never();

        let tagger = ReleaseTagger::with_clock(Arc::new(vcs), SteppingClock::new(vec![t(9)]));
        assert_matches!(
            tagger.tag("stable", "again", &paths(1)).await,
            Err(GateError::TagFailed(_))
        );
    }

    #[tokio::test]
    async fn test_reuses_unpublished_tag_without_changes() {
        let mut vcs = MockVersionControl::new();
        vcs.expect_commit().never();
        vcs.expect_create_tag().never();
        vcs.expect_tags_at_head().returning(|| {
            Ok(vec![
                "stable/20261018_110000".to_string(),
                "hotfix/20261018_110500".to_string(),
            ])
        });
        vcs.expect_remote_tags().returning(|| Ok(vec![]));
        vcs.expect_head().returning(|| Ok("abc".to_string()));

        let tagger = ReleaseTagger::with_clock(Arc::new(vcs), SteppingClock::new(vec![t(0)]));
        let session = tagger.tag("stable", "retry", &[]).await.unwrap();

        assert!(session.reused_tag);
        assert_eq!(session.tag_name, "stable/20261018_110000");
    }

    #[tokio::test]
    async fn test_published_tag_is_not_reused() {
        let mut vcs = MockVersionControl::new();
        vcs.expect_tags_at_head()
            .returning(|| Ok(vec!["stable/20261018_110000".to_string()]));
        vcs.expect_remote_tags()
            .returning(|| Ok(vec!["stable/20261018_110000".to_string()]));
        vcs.expect_head().returning(|| Ok("abc".to_string()));
        vcs.expect_tag_exists().returning(|_| Ok(false));
        vcs.expect_create_tag()
            .withf(|name, _| name == "stable/20261018_120000")
            .times(1)
            .returning(|_, _| Ok(()));

        let tagger = ReleaseTagger::with_clock(Arc::new(vcs), SteppingClock::new(vec![t(0)]));
        let session = tagger.tag("stable", "re-tag", &[]).await.unwrap();

        assert!(!session.reused_tag);
        assert_eq!(session.file_count, 0);
    }

    #[test]
    fn test_until_next_second() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::milliseconds(750);
        let wait = until_next_second(at);
        assert!(wait >= Duration::from_millis(250) && wait < Duration::from_millis(300));
    }
}
