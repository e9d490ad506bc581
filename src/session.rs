//! Data model for a manual sync: classes, sessions, change records and releases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GateError;

/// Timestamp layout used in tag names (`stable/20261018_120000`).
pub const TAG_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Intent of an approved publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncClass {
    Stable,
    Release,
    Hotfix,
    Production,
}

impl SyncClass {
    pub const ALL: [SyncClass; 4] = [
        SyncClass::Stable,
        SyncClass::Release,
        SyncClass::Hotfix,
        SyncClass::Production,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncClass::Stable => "stable",
            SyncClass::Release => "release",
            SyncClass::Hotfix => "hotfix",
            SyncClass::Production => "production",
        }
    }

    /// Prefix shared by every tag of this class
    pub fn tag_prefix(&self) -> String {
        format!("{}/", self.as_str())
    }

    /// Class of a release tag name, if it is one of ours
    pub fn of_tag(tag: &str) -> Option<SyncClass> {
        let (class, stamp) = tag.split_once('/')?;
        let class = class.parse().ok()?;
        chrono::NaiveDateTime::parse_from_str(stamp, TAG_TIMESTAMP_FORMAT).ok()?;
        Some(class)
    }
}

impl FromStr for SyncClass {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(SyncClass::Stable),
            "release" => Ok(SyncClass::Release),
            "hotfix" => Ok(SyncClass::Hotfix),
            "production" => Ok(SyncClass::Production),
            other => Err(GateError::InvalidClass(other.to_string())),
        }
    }
}

impl fmt::Display for SyncClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated class + message pair, the input of every manual sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub class: SyncClass,
    pub message: String,
}

impl SyncRequest {
    /// Validate raw user input. Nothing is touched on failure.
    pub fn new(class: &str, message: &str) -> Result<Self, GateError> {
        let class = class.trim().parse::<SyncClass>()?;
        let message = message.trim();
        if message.is_empty() {
            return Err(GateError::EmptyMessage);
        }

        Ok(Self {
            class,
            message: message.to_string(),
        })
    }

    /// Tag name for this request at the given instant
    pub fn tag_name(&self, at: DateTime<Utc>) -> String {
        format!("{}{}", self.class.tag_prefix(), at.format(TAG_TIMESTAMP_FORMAT))
    }

    /// Structured commit message for the approved batch
    pub fn commit_message(&self, file_count: usize, at: DateTime<Utc>) -> String {
        format!(
            "[{}] {}\n\n{}",
            self.class,
            self.message,
            structured_fields(self, file_count, at)
        )
    }

    /// Annotation body of the release tag
    pub fn annotation(&self, file_count: usize, at: DateTime<Utc>) -> String {
        format!(
            "{} release: {}\n\n{}",
            self.class,
            self.message,
            structured_fields(self, file_count, at)
        )
    }
}

fn structured_fields(request: &SyncRequest, file_count: usize, at: DateTime<Utc>) -> String {
    format!(
        "class: {}\nmessage: {}\nfiles: {}\ntimestamp: {}",
        request.class,
        request.message,
        file_count,
        at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )
}

/// One manual sync, immutable once tagged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    pub class: SyncClass,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub tag_name: String,
    pub file_count: usize,
    /// Commit the tag points at
    pub commit: String,
    pub annotation: String,
    /// The tag already existed locally from an earlier, unpublished attempt
    pub reused_tag: bool,
}

/// Working-tree status of a changed path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
    Untracked,
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeStatus::Added => "added",
            ChangeStatus::Modified => "modified",
            ChangeStatus::Deleted => "deleted",
            ChangeStatus::Untracked => "untracked",
        };
        f.write_str(s)
    }
}

/// Outcome of the exclusion policy for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Eligibility {
    Approved,
    Excluded,
}

/// A changed path found by a scan. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeRecord {
    pub path: String,
    pub status: ChangeStatus,
    pub eligibility: Eligibility,
}

impl FileChangeRecord {
    pub fn is_approved(&self) -> bool {
        self.eligibility == Eligibility::Approved
    }
}

/// Approved paths out of a scan, in scan order
pub fn approved_paths(records: &[FileChangeRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|r| r.is_approved())
        .map(|r| r.path.clone())
        .collect()
}

/// A published tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub tag_name: String,
    pub commit: String,
    pub annotation: String,
    pub published_at: DateTime<Utc>,
    /// Hosted release page, when one was created
    pub hosted_url: Option<String>,
}
