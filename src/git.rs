use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use crate::config::Config;
use crate::session::ChangeStatus;

/// How the local branch relates to its remote counterpart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Divergence {
    pub ahead: u32,
    pub behind: u32,
    /// `(status letter, path)` pairs between HEAD and the remote branch
    pub changed_files: Vec<(String, String)>,
}

/// Version-control capability used by the tagger, publisher and watcher.
///
/// Every method maps onto one narrow git primitive so the gate can be driven
/// by an in-memory implementation in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Changed paths in the working tree, untracked files included
    async fn changed_files(&self) -> Result<Vec<(String, ChangeStatus)>>;

    /// Stage and commit exactly `paths`, returning the new commit id
    async fn commit(&self, message: &str, paths: &[String]) -> Result<String>;

    /// Commit id of HEAD
    async fn head(&self) -> Result<String>;

    async fn current_branch(&self) -> Result<String>;

    async fn tag_exists(&self, name: &str) -> Result<bool>;

    /// Tags pointing at HEAD
    async fn tags_at_head(&self) -> Result<Vec<String>>;

    async fn local_tags(&self) -> Result<Vec<String>>;

    async fn remote_tags(&self) -> Result<Vec<String>>;

    /// Annotated tag on HEAD
    async fn create_tag(&self, name: &str, annotation: &str) -> Result<()>;

    async fn push_branch(&self, branch: &str) -> Result<()>;

    /// Push a single tag by explicit refspec
    async fn push_tag(&self, name: &str) -> Result<()>;

    /// Fast-forward-only pull, returning git's summary line
    async fn pull(&self, branch: &str) -> Result<String>;

    async fn fetch(&self) -> Result<()>;

    async fn divergence(&self, branch: &str) -> Result<Divergence>;

    async fn remote_url(&self) -> Result<Option<String>>;
}

/// Git operations through the `git` command line
#[derive(Debug, Clone)]
pub struct GitCli {
    repo: PathBuf,
    remote: String,
    timeout: Duration,
}

impl GitCli {
    pub fn new(repo: impl Into<PathBuf>, remote: impl Into<String>, timeout: Duration) -> Self {
        Self {
            repo: repo.into(),
            remote: remote.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.repository_path(), config.remote.clone(), config.git_timeout())
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Run a read-only git command, returning stdout on success. A timed-out
    /// read is killed.
    async fn git<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.run(args, true).await
    }

    /// Run a git command that writes to the repository. On timeout the caller
    /// gets an error but git is left to finish, so it can release its own
    /// `index.lock` and ref locks.
    async fn git_write<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.run(args, false).await
    }

    async fn run<I, S>(&self, args: I, kill_on_timeout: bool) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let args: Vec<std::ffi::OsString> =
            args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        debug!("git {:?} in {}", args, self.repo.display());

        let output = tokio::time::timeout(
            self.timeout,
            AsyncCommand::new("git")
                .args(&args)
                .current_dir(&self.repo)
                .kill_on_drop(kill_on_timeout)
                .output(),
        )
        .await
        .map_err(|_| anyhow!("git {:?} timed out after {}s", args, self.timeout.as_secs()))?
        .context("Failed to execute git")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {:?} failed: {}", args, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Exit status only, for probes where a non-zero exit is an answer
    async fn git_succeeds(&self, args: &[&str]) -> Result<bool> {
        let status = tokio::time::timeout(
            self.timeout,
            AsyncCommand::new("git")
                .args(args)
                .current_dir(&self.repo)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow!("git {:?} timed out", args))?
        .context("Failed to execute git")?
        .status;

        Ok(status.success())
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn changed_files(&self) -> Result<Vec<(String, ChangeStatus)>> {
        let output = self
            .git([
                "--no-optional-locks",
                "status",
                "--porcelain=v1",
                "-z",
                "--untracked-files=all",
            ])
            .await
            .context("Failed to check git status")?;

        Ok(parse_porcelain_z(&output))
    }

    async fn commit(&self, message: &str, paths: &[String]) -> Result<String> {
        if paths.is_empty() {
            return Err(anyhow!("Nothing to commit"));
        }

        // Paths gone from disk (deletions, rename sources) need no staging;
        // `git add` rejects them once the deletion is already staged, while
        // `git commit -- <path>` still records them against HEAD.
        let present: Vec<String> = paths
            .iter()
            .filter(|p| self.repo.join(p.as_str()).symlink_metadata().is_ok())
            .cloned()
            .collect();
        if !present.is_empty() {
            let mut add = vec!["add".to_string(), "-A".to_string(), "--".to_string()];
            add.extend(present);
            self.git_write(&add).await.context("Failed to stage changes")?;
        }

        let mut commit = vec![
            "commit".to_string(),
            "--quiet".to_string(),
            "-m".to_string(),
            message.to_string(),
            "--".to_string(),
        ];
        commit.extend(paths.iter().cloned());
        self.git_write(&commit).await.context("Failed to commit changes")?;

        let head = self.head().await?;
        info!("Committed {} files as {}", paths.len(), short(&head));
        Ok(head)
    }

    async fn head(&self) -> Result<String> {
        Ok(self
            .git(["rev-parse", "HEAD"])
            .await
            .context("Failed to resolve HEAD")?
            .trim()
            .to_string())
    }

    async fn current_branch(&self) -> Result<String> {
        let branch = self
            .git(["branch", "--show-current"])
            .await
            .context("Failed to get current branch")?
            .trim()
            .to_string();

        if branch.is_empty() {
            return Err(anyhow!("HEAD is detached; configure a branch to publish"));
        }
        Ok(branch)
    }

    async fn tag_exists(&self, name: &str) -> Result<bool> {
        let refname = format!("refs/tags/{}", name);
        self.git_succeeds(&["rev-parse", "--quiet", "--verify", &refname])
            .await
    }

    async fn tags_at_head(&self) -> Result<Vec<String>> {
        let output = self
            .git(["tag", "--points-at", "HEAD"])
            .await
            .context("Failed to list tags at HEAD")?;
        Ok(lines(&output))
    }

    async fn local_tags(&self) -> Result<Vec<String>> {
        let output = self.git(["tag", "--list"]).await.context("Failed to list tags")?;
        Ok(lines(&output))
    }

    async fn remote_tags(&self) -> Result<Vec<String>> {
        let output = self
            .git(["ls-remote", "--tags", "--refs", self.remote.as_str()])
            .await
            .context("Failed to list remote tags")?;

        Ok(output
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .filter_map(|r| r.strip_prefix("refs/tags/"))
            .map(str::to_string)
            .collect())
    }

    async fn create_tag(&self, name: &str, annotation: &str) -> Result<()> {
        self.git_write(["tag", "-a", name, "-m", annotation])
            .await
            .with_context(|| format!("Failed to create tag {}", name))?;
        info!("Created tag {}", name);
        Ok(())
    }

    async fn push_branch(&self, branch: &str) -> Result<()> {
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        self.git_write(["push", self.remote.as_str(), refspec.as_str()])
            .await
            .with_context(|| format!("Failed to push branch {}", branch))?;
        info!("Pushed branch {} to {}", branch, self.remote);
        Ok(())
    }

    async fn push_tag(&self, name: &str) -> Result<()> {
        let refspec = format!("refs/tags/{0}:refs/tags/{0}", name);
        self.git_write(["push", self.remote.as_str(), refspec.as_str()])
            .await
            .with_context(|| format!("Failed to push tag {}", name))?;
        info!("Pushed tag {} to {}", name, self.remote);
        Ok(())
    }

    async fn pull(&self, branch: &str) -> Result<String> {
        let output = self
            .git_write(["pull", "--ff-only", self.remote.as_str(), branch])
            .await
            .context("Failed to pull from remote")?;

        Ok(output
            .lines()
            .last()
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| "Already up to date.".to_string()))
    }

    async fn fetch(&self) -> Result<()> {
        self.git_write(["fetch", "--quiet", self.remote.as_str()])
            .await
            .context("Failed to fetch from remote")?;
        Ok(())
    }

    async fn divergence(&self, branch: &str) -> Result<Divergence> {
        let upstream = format!("{}/{}", self.remote, branch);
        let range = format!("HEAD...{}", upstream);

        let counts = self
            .git(["rev-list", "--left-right", "--count", range.as_str()])
            .await
            .context("Failed to compare with remote branch")?;
        let (ahead, behind) = parse_left_right(&counts)?;

        let diff = self
            .git(["diff", "--name-status", "HEAD", upstream.as_str()])
            .await
            .context("Failed to diff against remote branch")?;

        let changed_files = diff
            .lines()
            .filter_map(|line| {
                let mut parts = line.split('\t');
                let status = parts.next()?.to_string();
                let path = parts.last()?.to_string();
                Some((status, path))
            })
            .collect();

        Ok(Divergence {
            ahead,
            behind,
            changed_files,
        })
    }

    async fn remote_url(&self) -> Result<Option<String>> {
        match self.git(["remote", "get-url", self.remote.as_str()]).await {
            Ok(url) => Ok(Some(url.trim().to_string())),
            Err(e) => {
                debug!("No URL for remote {}: {}", self.remote, e);
                Ok(None)
            }
        }
    }
}

/// Parse `git status --porcelain=v1 -z` output
pub fn parse_porcelain_z(output: &str) -> Vec<(String, ChangeStatus)> {
    let mut changes = Vec::new();
    let mut entries = output.split('\0').filter(|e| !e.is_empty());

    while let Some(entry) = entries.next() {
        if entry.len() < 4 {
            continue;
        }
        let (code, path) = entry.split_at(3);
        let mut code = code.chars();
        let x = code.next().unwrap_or(' ');
        let y = code.next().unwrap_or(' ');

        let status = match (x, y) {
            ('?', '?') => ChangeStatus::Untracked,
            ('D', _) | (_, 'D') => ChangeStatus::Deleted,
            ('A', _) | ('R', _) | ('C', _) | (_, 'R') | (_, 'C') => ChangeStatus::Added,
            _ => ChangeStatus::Modified,
        };
        changes.push((path.to_string(), status));

        // Renames and copies carry the original path as the next entry. A
        // rename source is a deletion that must travel with its target; a
        // copy source is unchanged.
        if matches!(x, 'R' | 'C') || matches!(y, 'R' | 'C') {
            if let Some(source) = entries.next() {
                if x == 'R' || y == 'R' {
                    changes.push((source.to_string(), ChangeStatus::Deleted));
                }
            }
        }
    }

    changes
}

fn parse_left_right(output: &str) -> Result<(u32, u32)> {
    let mut parts = output.split_whitespace().map(str::parse::<u32>);
    match (parts.next(), parts.next()) {
        (Some(Ok(ahead)), Some(Ok(behind))) => Ok((ahead, behind)),
        _ => Err(anyhow!("Unexpected rev-list output: {}", output.trim())),
    }
}

fn lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Abbreviated commit id for display
pub fn short(commit: &str) -> &str {
    &commit[..commit.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_porcelain_statuses() {
        let output = " M core/ranking.py\0?? scratch/idea.py\0A  docs/new.md\0 D old.txt\0MM both.rs\0";
        let changes = parse_porcelain_z(output);

        assert_eq!(
            changes,
            vec![
                ("core/ranking.py".to_string(), ChangeStatus::Modified),
                ("scratch/idea.py".to_string(), ChangeStatus::Untracked),
                ("docs/new.md".to_string(), ChangeStatus::Added),
                ("old.txt".to_string(), ChangeStatus::Deleted),
                ("both.rs".to_string(), ChangeStatus::Modified),
            ]
        );
    }

    #[test]
    fn test_parse_porcelain_rename_keeps_source_as_deletion() {
        let output = "R  new name.md\0old name.md\0 M a.rs\0";
        let changes = parse_porcelain_z(output);

        assert_eq!(
            changes,
            vec![
                ("new name.md".to_string(), ChangeStatus::Added),
                ("old name.md".to_string(), ChangeStatus::Deleted),
                ("a.rs".to_string(), ChangeStatus::Modified),
            ]
        );
    }

    #[test]
    fn test_parse_porcelain_worktree_rename_and_copy() {
        let output = " R moved.rs\0orig.rs\0C  copy.rs\0base.rs\0?? x\0";
        let changes = parse_porcelain_z(output);

        assert_eq!(
            changes,
            vec![
                ("moved.rs".to_string(), ChangeStatus::Added),
                ("orig.rs".to_string(), ChangeStatus::Deleted),
                ("copy.rs".to_string(), ChangeStatus::Added),
                ("x".to_string(), ChangeStatus::Untracked),
            ]
        );
    }

    #[test]
    fn test_parse_left_right() {
        assert_eq!(parse_left_right("3\t1\n").unwrap(), (3, 1));
        assert!(parse_left_right("").is_err());
    }

    #[test]
    fn test_short_commit() {
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
    }
}
