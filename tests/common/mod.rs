//! Common test utilities and helpers for releasegate tests
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use assert_fs::prelude::*;
use assert_fs::TempDir;

use releasegate::git::Divergence;
use releasegate::github::RemoteRepo;
use releasegate::session::ChangeStatus;
use releasegate::{ReleaseHost, VersionControl};

/// A commit recorded by [`FakeVcs`]
#[derive(Debug, Clone)]
pub struct FakeCommit {
    pub id: String,
    pub message: String,
    pub paths: Vec<String>,
}

/// Everything the fake repository knows
#[derive(Debug, Default)]
pub struct RepoState {
    pub working: Vec<(String, ChangeStatus)>,
    pub commits: Vec<FakeCommit>,
    /// tag -> (commit, annotation)
    pub tags: BTreeMap<String, (String, String)>,
    pub remote_tags: BTreeSet<String>,
    /// Commits the remote branch has
    pub remote_commits: usize,
    /// "branch:<name>" / "tag:<name>" in push order
    pub push_log: Vec<String>,
    pub fail_commit: bool,
    pub fail_branch_push: bool,
    pub fail_tag_push: bool,
    /// Scans never complete
    pub stall_scan: bool,
    /// Commits take this long
    pub commit_delay: Option<std::time::Duration>,
    /// A commit is running right now
    pub committing: bool,
}

/// In-memory version control with a remote
#[derive(Debug, Default)]
pub struct FakeVcs {
    pub state: Mutex<RepoState>,
}

impl FakeVcs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add working-tree changes
    pub fn touch(&self, paths: &[&str]) {
        let mut state = self.state.lock().unwrap();
        for path in paths {
            state.working.push((path.to_string(), ChangeStatus::Modified));
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut RepoState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn commits(&self) -> Vec<FakeCommit> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.state.lock().unwrap().tags.keys().cloned().collect()
    }

    pub fn remote_tag_names(&self) -> Vec<String> {
        self.state.lock().unwrap().remote_tags.iter().cloned().collect()
    }

    pub fn push_log(&self) -> Vec<String> {
        self.state.lock().unwrap().push_log.clone()
    }

    fn head_of(state: &RepoState) -> String {
        state
            .commits
            .last()
            .map(|c| c.id.clone())
            .unwrap_or_else(|| "root000000".to_string())
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn changed_files(&self) -> Result<Vec<(String, ChangeStatus)>> {
        let stall = self.state.lock().unwrap().stall_scan;
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(self.state.lock().unwrap().working.clone())
    }

    async fn commit(&self, message: &str, paths: &[String]) -> Result<String> {
        let delay = self.state.lock().unwrap().commit_delay;
        if let Some(delay) = delay {
            self.state.lock().unwrap().committing = true;
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.committing = false;
        if state.fail_commit {
            return Err(anyhow!("pre-commit hook failed"));
        }
        if paths.is_empty() {
            return Err(anyhow!("nothing to commit"));
        }

        state.working.retain(|(p, _)| !paths.contains(p));
        let id = format!("c{:09}", state.commits.len() + 1);
        state.commits.push(FakeCommit {
            id: id.clone(),
            message: message.to_string(),
            paths: paths.to_vec(),
        });
        Ok(id)
    }

    async fn head(&self) -> Result<String> {
        Ok(Self::head_of(&self.state.lock().unwrap()))
    }

    async fn current_branch(&self) -> Result<String> {
        Ok("main".to_string())
    }

    async fn tag_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().tags.contains_key(name))
    }

    async fn tags_at_head(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let head = Self::head_of(&state);
        Ok(state
            .tags
            .iter()
            .filter(|(_, (commit, _))| *commit == head)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn local_tags(&self) -> Result<Vec<String>> {
        Ok(self.tag_names())
    }

    async fn remote_tags(&self) -> Result<Vec<String>> {
        Ok(self.remote_tag_names())
    }

    async fn create_tag(&self, name: &str, annotation: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.tags.contains_key(name) {
            return Err(anyhow!("tag '{}' already exists", name));
        }
        let head = Self::head_of(&state);
        state
            .tags
            .insert(name.to_string(), (head, annotation.to_string()));
        Ok(())
    }

    async fn push_branch(&self, branch: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_branch_push {
            return Err(anyhow!("! [rejected] {} (fetch first)", branch));
        }
        state.remote_commits = state.commits.len();
        state.push_log.push(format!("branch:{}", branch));
        Ok(())
    }

    async fn push_tag(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_tag_push {
            return Err(anyhow!("connection reset by peer"));
        }
        if !state.tags.contains_key(name) {
            return Err(anyhow!("src refspec {} does not match any", name));
        }
        state.remote_tags.insert(name.to_string());
        state.push_log.push(format!("tag:{}", name));
        Ok(())
    }

    async fn pull(&self, _branch: &str) -> Result<String> {
        Ok("Already up to date.".to_string())
    }

    async fn fetch(&self) -> Result<()> {
        Ok(())
    }

    async fn divergence(&self, _branch: &str) -> Result<Divergence> {
        let state = self.state.lock().unwrap();
        Ok(Divergence {
            ahead: (state.commits.len() - state.remote_commits) as u32,
            behind: 0,
            changed_files: state.commits[state.remote_commits..]
                .iter()
                .flat_map(|c| c.paths.iter().map(|p| ("M".to_string(), p.clone())))
                .collect(),
        })
    }

    async fn remote_url(&self) -> Result<Option<String>> {
        Ok(Some("git@github.com:acme/signals.git".to_string()))
    }
}

/// Hosted-release fake that records created releases
#[derive(Debug, Default)]
pub struct FakeHost {
    pub releases: Mutex<Vec<(String, String, String)>>,
    pub fail: AtomicBool,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let host = Self::default();
        host.fail.store(true, Ordering::SeqCst);
        Arc::new(host)
    }

    pub fn release_tags(&self) -> Vec<String> {
        self.releases
            .lock()
            .unwrap()
            .iter()
            .map(|(tag, _, _)| tag.clone())
            .collect()
    }
}

#[async_trait]
impl ReleaseHost for FakeHost {
    async fn create_release(&self, tag: &str, title: &str, notes: &str) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("403 Resource not accessible by integration"));
        }
        let mut releases = self.releases.lock().unwrap();
        releases.push((tag.to_string(), title.to_string(), notes.to_string()));
        Ok(format!(
            "https://github.com/acme/signals/releases/tag/{}",
            tag
        ))
    }

    async fn repository_info(&self) -> Result<RemoteRepo> {
        Ok(RemoteRepo {
            full_name: "acme/signals".to_string(),
            default_branch: Some("main".to_string()),
            private: Some(true),
            ..Default::default()
        })
    }
}

/// Temporary directory with a config file pointing every path inside it
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.child(name).path().to_path_buf()
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config = self.temp_dir.child("config.yml");
        config.write_str(content).expect("Failed to write test config");
        config.path().to_path_buf()
    }

    /// Config whose repository, marker, log and ledger all live in the temp dir
    pub fn create_minimal_config(&self) -> PathBuf {
        let dir = self.temp_dir.path().display();
        let content = format!(
            r#"
repository: "{dir}/repo"
daemon:
  interval: "30s"
  pid_file: "{dir}/releasegate.pid"
  log_file: "{dir}/daemon.log"
git:
  lock_file: "{dir}/releasegate.lock"
github:
  create_releases: false
history:
  db_path: "{dir}/history.db"
logging:
  color: false
"#
        );
        self.create_test_config(&content)
    }
}

/// Assertion helper for command output
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
