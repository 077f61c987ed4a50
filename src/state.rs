//! State Management - SQLite-based persistence for branch heads and backup events
//!
//! This module provides persistent storage for:
//! - The branch-head map recorded at each repository's last successful backup
//! - Backup events (backed up, skipped, failed, pruned)
//!
//! The database is stored in XDG_DATA_HOME/github-backup/state.db

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::catalog::BranchHeads;
use crate::error::{BackupError, BackupResult};

/// Default age after which event log entries are removed
pub const DEFAULT_EVENT_RETENTION_DAYS: i64 = 90;

/// Event types that can occur during a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// A new archive was written
    BackedUp,
    /// Branch heads were unchanged
    Skipped,
    /// The repository's backup failed
    Failed,
    /// An expired archive was deleted
    Pruned,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BackedUp => "backed_up",
            EventType::Skipped => "skipped",
            EventType::Failed => "failed",
            EventType::Pruned => "pruned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backed_up" => Some(EventType::BackedUp),
            "skipped" => Some(EventType::Skipped),
            "failed" => Some(EventType::Failed),
            "pruned" => Some(EventType::Pruned),
            _ => None,
        }
    }
}

/// Last successful backup of one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoState {
    pub key: String,
    pub branch_heads: BranchHeads,
    pub last_backup_at: DateTime<Utc>,
}

/// A backup event record
#[derive(Debug, Clone)]
pub struct BackupEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub repo_key: Option<String>,
    pub event_type: EventType,
    pub summary: String,
}

/// State database manager
///
/// The connection sits behind a mutex so the orchestrator can share one handle
/// between concurrently running repository jobs.
pub struct StateDb {
    conn: Mutex<Connection>,
}

impl StateDb {
    /// Open or create the state database at the default location
    pub fn open() -> BackupResult<Self> {
        Self::open_at(Self::default_path())
    }

    /// Open or create the state database at a specific path
    pub fn open_at(path: impl AsRef<Path>) -> BackupResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;

        info!("State database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing and dry runs)
    pub fn open_in_memory() -> BackupResult<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Default database path
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("github-backup")
            .join("state.db")
    }

    fn conn(&self) -> BackupResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| {
                BackupError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "state database lock poisoned",
                ))
            })
    }

    fn initialize(&self) -> BackupResult<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                key TEXT PRIMARY KEY NOT NULL,
                branch_heads TEXT NOT NULL,
                last_backup_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                repo_key TEXT,
                event_type TEXT NOT NULL,
                summary TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_repo ON events(repo_key, timestamp);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // =========================================================================
    // Repository State Operations
    // =========================================================================

    /// Branch heads recorded at the last successful backup, if any
    pub fn get_branch_heads(&self, key: &str) -> BackupResult<Option<BranchHeads>> {
        Ok(self.get_repo(key)?.map(|state| state.branch_heads))
    }

    pub fn get_repo(&self, key: &str) -> BackupResult<Option<RepoState>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT key, branch_heads, last_backup_at FROM repositories WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((key, heads_json, last_backup_at)) = row else {
            return Ok(None);
        };

        Ok(Some(RepoState {
            key,
            branch_heads: serde_json::from_str(&heads_json)?,
            last_backup_at: parse_timestamp(&last_backup_at),
        }))
    }

    /// Replace the recorded branch heads after a successful backup
    pub fn record_backup(&self, key: &str, heads: &BranchHeads) -> BackupResult<()> {
        let now = Utc::now().to_rfc3339();
        let heads_json = serde_json::to_string(heads)?;

        self.conn()?.execute(
            r#"
            INSERT INTO repositories (key, branch_heads, last_backup_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(key) DO UPDATE SET
                branch_heads = ?2,
                last_backup_at = ?3,
                updated_at = ?3
            "#,
            params![key, heads_json, now],
        )?;

        debug!("Recorded {} branch head(s) for {}", heads.len(), key);
        Ok(())
    }

    /// All repositories with recorded state, ordered by key
    pub fn list_repos(&self) -> BackupResult<Vec<RepoState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, branch_heads, last_backup_at FROM repositories ORDER BY key",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, heads_json, last_backup_at)| {
                Ok(RepoState {
                    key,
                    branch_heads: serde_json::from_str(&heads_json)?,
                    last_backup_at: parse_timestamp(&last_backup_at),
                })
            })
            .collect()
    }

    // =========================================================================
    // Event Operations
    // =========================================================================

    pub fn record_event(
        &self,
        event_type: EventType,
        repo_key: Option<&str>,
        summary: impl AsRef<str>,
    ) -> BackupResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events (timestamp, repo_key, event_type, summary) VALUES (?1, ?2, ?3, ?4)",
            params![
                event_timestamp(Utc::now()),
                repo_key,
                event_type.as_str(),
                summary.as_ref()
            ],
        )?;

        debug!("Recorded event: {} - {}", event_type.as_str(), summary.as_ref());
        Ok(conn.last_insert_rowid())
    }

    /// Events for one repository, newest first
    pub fn get_events_for_repo(
        &self,
        repo_key: &str,
        limit: Option<u32>,
    ) -> BackupResult<Vec<BackupEvent>> {
        let limit_clause = limit.map(|l| format!(" LIMIT {}", l)).unwrap_or_default();
        let sql = format!(
            r#"
            SELECT id, timestamp, repo_key, event_type, summary
            FROM events
            WHERE repo_key = ?1
            ORDER BY id DESC
            {}
            "#,
            limit_clause
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![repo_key], |row| {
                Ok(BackupEvent {
                    id: row.get(0)?,
                    timestamp: parse_timestamp(&row.get::<_, String>(1)?),
                    repo_key: row.get(2)?,
                    event_type: EventType::parse(&row.get::<_, String>(3)?)
                        .unwrap_or(EventType::Failed),
                    summary: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// Drop events recorded before `cutoff`; returns how many were removed
    pub fn cleanup_events_before(&self, cutoff: DateTime<Utc>) -> BackupResult<u64> {
        let count = self.conn()?.execute(
            "DELETE FROM events WHERE timestamp < ?1",
            params![event_timestamp(cutoff)],
        )?;

        if count > 0 {
            info!("Removed {} event(s) recorded before {}", count, cutoff);
        }
        Ok(count as u64)
    }
}

/// Fixed-width UTC form so timestamps compare correctly as text
fn event_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
