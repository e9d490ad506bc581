use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use std::env;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Remote repository metadata reported by `info`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteRepo {
    pub full_name: String,
    pub default_branch: Option<String>,
    pub private: Option<bool>,
    pub html_url: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub latest_release: Option<String>,
}

/// Hosted-release capability (optional collaborator of the publisher)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReleaseHost: Send + Sync {
    /// Create a release for an already-pushed tag, returning its page URL
    async fn create_release(&self, tag: &str, title: &str, notes: &str) -> Result<String>;

    async fn repository_info(&self) -> Result<RemoteRepo>;
}

/// GitHub authentication strategies
#[derive(Debug, Clone)]
pub enum AuthStrategy {
    /// Use GitHub CLI authentication
    GitHubCLI,
    /// Use environment variable token
    EnvironmentToken,
}

/// GitHub releases for one repository
pub struct GitHubReleases {
    client: Octocrab,
    owner: String,
    repo: String,
}

impl GitHubReleases {
    /// Build a client for the configured (or remote-derived) repository.
    /// No request is made until the capability is used.
    pub fn connect(config: &Config, remote_url: Option<&str>) -> Result<Self> {
        let (owner, repo) = match (&config.github.owner, &config.github.repo) {
            (Some(owner), Some(repo)) => (owner.clone(), repo.clone()),
            _ => remote_url
                .and_then(parse_github_slug)
                .context("Cannot determine GitHub repository from remote URL; set github.owner and github.repo")?,
        };

        let (auth_strategy, token) = Self::detect_authentication(config)?;
        info!("Using authentication strategy: {:?}", auth_strategy);

        let client = Octocrab::builder()
            .personal_token(token)
            .build()
            .context("Failed to create GitHub client")?;

        Ok(Self {
            client,
            owner,
            repo,
        })
    }

    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Detect and obtain GitHub authentication
    fn detect_authentication(config: &Config) -> Result<(AuthStrategy, String)> {
        match config.github.auth_method.as_str() {
            "auto" => {
                // Try GitHub CLI first, then environment token
                if let Ok(token) = Self::try_github_cli() {
                    Ok((AuthStrategy::GitHubCLI, token))
                } else if let Ok(token) = Self::try_environment_token() {
                    Ok((AuthStrategy::EnvironmentToken, token))
                } else {
                    Err(anyhow!(
                        "No GitHub authentication found. Either authenticate the GitHub CLI \
                         (gh auth login) or set GITHUB_TOKEN"
                    ))
                }
            }
            "gh_cli" => {
                let token = Self::try_github_cli()
                    .context("GitHub CLI authentication failed. Run: gh auth login")?;
                Ok((AuthStrategy::GitHubCLI, token))
            }
            "token" => {
                let token = Self::try_environment_token()
                    .context("GITHUB_TOKEN environment variable not found or invalid")?;
                Ok((AuthStrategy::EnvironmentToken, token))
            }
            other => Err(anyhow!("Unknown auth method: {}", other)),
        }
    }

    /// Try to get token from GitHub CLI
    fn try_github_cli() -> Result<String> {
        debug!("Attempting GitHub CLI authentication");

        let token_output = Command::new("gh")
            .args(["auth", "token"])
            .output()
            .context("Failed to run GitHub CLI")?;

        if !token_output.status.success() {
            return Err(anyhow!(
                "Failed to retrieve token from GitHub CLI: {}",
                String::from_utf8_lossy(&token_output.stderr)
            ));
        }

        let token = String::from_utf8(token_output.stdout)
            .context("GitHub CLI token is not valid UTF-8")?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(anyhow!("GitHub CLI returned empty token"));
        }

        debug!("Successfully obtained token from GitHub CLI");
        Ok(token)
    }

    /// Try to get token from environment variable
    fn try_environment_token() -> Result<String> {
        debug!("Attempting environment variable authentication");

        let token = env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable not set")?;

        if token.is_empty() {
            return Err(anyhow!("GITHUB_TOKEN is empty"));
        }

        if !token.starts_with("ghp_")
            && !token.starts_with("gho_")
            && !token.starts_with("ghs_")
            && !token.starts_with("github_pat_")
        {
            warn!("GITHUB_TOKEN doesn't look like a GitHub token");
        }

        Ok(token)
    }
}

#[async_trait]
impl ReleaseHost for GitHubReleases {
    async fn create_release(&self, tag: &str, title: &str, notes: &str) -> Result<String> {
        debug!("Creating release {} on {}", tag, self.slug());

        let release = self
            .client
            .repos(&self.owner, &self.repo)
            .releases()
            .create(tag)
            .name(title)
            .body(notes)
            .send()
            .await
            .with_context(|| format!("Failed to create release for tag {}", tag))?;

        let url = release.html_url.to_string();
        info!("Created release {} at {}", tag, url);
        Ok(url)
    }

    async fn repository_info(&self) -> Result<RemoteRepo> {
        let handler = self.client.repos(&self.owner, &self.repo);

        let repo = handler
            .get()
            .await
            .with_context(|| format!("Failed to fetch repository {}", self.slug()))?;

        let latest_release = match handler.releases().get_latest().await {
            Ok(release) => Some(release.tag_name),
            Err(e) => {
                debug!("No latest release for {}: {}", self.slug(), e);
                None
            }
        };

        Ok(RemoteRepo {
            full_name: repo.full_name.unwrap_or_else(|| self.slug()),
            default_branch: repo.default_branch,
            private: repo.private,
            html_url: repo.html_url.map(|u| u.to_string()),
            pushed_at: repo.pushed_at,
            latest_release,
        })
    }
}

/// Extract `(owner, repo)` from a GitHub ssh or https remote URL
pub fn parse_github_slug(url: &str) -> Option<(String, String)> {
    let normalized = url
        .trim()
        .replace("git@github.com:", "https://github.com/")
        .replace("ssh://git@github.com/", "https://github.com/");

    let path = normalized.strip_prefix("https://github.com/")?;
    let path = path.trim_end_matches('/').trim_end_matches(".git");

    let (owner, repo) = path.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }

    Some((owner.to_string(), repo.to_string()))
}
