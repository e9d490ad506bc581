//! Event ledger - SQLite record of what the gate and the watcher did.
//!
//! The ledger is informational: failing to write it never fails a sync.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Event types recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// The watcher committed approved changes
    AutoCommit,
    /// A watcher tick failed or timed out
    TickFailed,
    /// A release tag was created locally
    Tagged,
    /// Branch and tag reached the remote
    Published,
    /// A branch or tag push failed
    PushFailed,
    /// Branch and tag are published but the hosted release is missing
    ReleaseFailed,
    /// A manual sync was declined or failed before publishing
    Aborted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AutoCommit => "auto_commit",
            EventType::TickFailed => "tick_failed",
            EventType::Tagged => "tagged",
            EventType::Published => "published",
            EventType::PushFailed => "push_failed",
            EventType::ReleaseFailed => "release_failed",
            EventType::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_commit" => Some(EventType::AutoCommit),
            "tick_failed" => Some(EventType::TickFailed),
            "tagged" => Some(EventType::Tagged),
            "published" => Some(EventType::Published),
            "push_failed" => Some(EventType::PushFailed),
            "release_failed" => Some(EventType::ReleaseFailed),
            "aborted" => Some(EventType::Aborted),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EventType::TickFailed | EventType::PushFailed | EventType::ReleaseFailed
        )
    }
}

/// A ledger entry
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub tag_name: Option<String>,
    pub summary: String,
}

pub struct History {
    conn: Mutex<Connection>,
}

impl History {
    /// Open or create the ledger at a specific path
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create history directory")?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open history at {}", path.display()))?;

        let history = Self {
            conn: Mutex::new(conn),
        };
        history.initialize()?;

        debug!("History opened at {}", path.display());
        Ok(history)
    }

    /// Open an in-memory ledger (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let history = Self {
            conn: Mutex::new(conn),
        };
        history.initialize()?;
        Ok(history)
    }

    fn initialize(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    tag_name TEXT,
                    summary TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_events_time ON events(timestamp);
                CREATE INDEX IF NOT EXISTS idx_events_tag ON events(tag_name);
                "#,
            )
            .context("Failed to initialize history schema")?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("History connection poisoned"))
    }

    /// Append an event
    pub fn record(&self, event_type: EventType, tag_name: Option<&str>, summary: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO events (timestamp, event_type, tag_name, summary) VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now().to_rfc3339(), event_type.as_str(), tag_name, summary],
        )
        .context("Failed to record event")?;

        Ok(conn.last_insert_rowid())
    }

    /// Append an event, logging instead of failing
    pub fn note(&self, event_type: EventType, tag_name: Option<&str>, summary: &str) {
        if let Err(e) = self.record(event_type, tag_name, summary) {
            warn!("Failed to write history event: {:#}", e);
        }
    }

    /// Most recent events, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<SyncEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, event_type, tag_name, summary
                 FROM events ORDER BY id DESC LIMIT ?1",
            )
            .context("Failed to prepare history query")?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query history")?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp, event_type, tag_name, summary) = row?;
            let Some(event_type) = EventType::parse(&event_type) else {
                continue;
            };
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            events.push(SyncEvent {
                id,
                timestamp,
                event_type,
                tag_name,
                summary,
            });
        }

        Ok(events)
    }
}
