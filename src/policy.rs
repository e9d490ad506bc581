//! Exclusion Policy Engine - decides which changed paths may ever leave the
//! local repository.
//!
//! Rules are evaluated in order and the first match wins:
//!
//! 1. denylisted suffix (`_temp`, `.tmp`, `.dev.json`, ...) -> excluded
//! 2. denylisted directory prefix (`scratch/`, `temp/`, ...) -> excluded
//! 3. configured glob pattern -> excluded
//! 4. everything else -> approved
//!
//! Classification depends on the path alone. The daemon and the foreground
//! commands build the same policy from the same configuration, so they agree
//! on eligibility without sharing state.

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::PolicyConfig;
use crate::session::Eligibility;

/// Built-in suffix denylist
pub const DEFAULT_EXCLUDED_SUFFIXES: &[&str] = &[
    "_temp", "_debug", "_wip", ".tmp", ".backup", ".dev.json",
];

/// Built-in directory prefixes
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    "temp",
    "tmp",
    "scratch",
    "experiments",
    "experiment",
    "dev_logs",
    "dev-logs",
];

#[derive(Debug, Clone)]
pub struct ExclusionPolicy {
    suffixes: Vec<String>,
    dirs: Vec<Vec<String>>,
    patterns: Vec<Regex>,
}

impl Default for ExclusionPolicy {
    fn default() -> Self {
        Self {
            suffixes: DEFAULT_EXCLUDED_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            dirs: DEFAULT_EXCLUDED_DIRS.iter().map(|d| split_components(d)).collect(),
            patterns: Vec::new(),
        }
    }
}

impl ExclusionPolicy {
    /// Built-in rules extended with the configured extras
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let mut policy = Self::default();

        policy
            .suffixes
            .extend(config.exclude_suffixes.iter().filter(|s| !s.is_empty()).cloned());

        policy.dirs.extend(
            config
                .exclude_dirs
                .iter()
                .map(|d| split_components(d))
                .filter(|c| !c.is_empty()),
        );

        for pattern in &config.exclude_patterns {
            policy.patterns.push(
                glob_to_regex(pattern)
                    .with_context(|| format!("Invalid exclusion pattern: {}", pattern))?,
            );
        }

        Ok(policy)
    }

    /// Classify a repository-relative path. Total and deterministic.
    pub fn classify(&self, path: &str) -> Eligibility {
        let components = split_components(path);
        let Some(file_name) = components.last() else {
            return Eligibility::Approved;
        };

        if self.matches_suffix(file_name) {
            return Eligibility::Excluded;
        }

        let parents = &components[..components.len() - 1];
        if self
            .dirs
            .iter()
            .any(|prefix| parents.len() >= prefix.len() && parents[..prefix.len()] == prefix[..])
        {
            return Eligibility::Excluded;
        }

        let normalized = components.join("/");
        if self.patterns.iter().any(|re| re.is_match(&normalized)) {
            return Eligibility::Excluded;
        }

        Eligibility::Approved
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.classify(path) == Eligibility::Excluded
    }

    /// `notes_wip.md` matches `_wip` through its stem; `a.tmp` matches `.tmp`
    /// through the full name.
    fn matches_suffix(&self, file_name: &str) -> bool {
        let stem = match file_name.rfind('.') {
            Some(idx) if idx > 0 => &file_name[..idx],
            _ => file_name,
        };

        self.suffixes
            .iter()
            .any(|suffix| file_name.ends_with(suffix.as_str()) || stem.ends_with(suffix.as_str()))
    }
}

fn split_components(path: &str) -> Vec<String> {
    path.split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_string)
        .collect()
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern.trim_matches('/')).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped)).context("Failed to compile pattern")
}
