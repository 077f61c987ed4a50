//! Error taxonomy for backup operations
//!
//! Configuration errors are fatal and surface before any network call. Every other
//! variant is scoped to a single repository: the orchestrator records it as that
//! repository's failure and moves on to the next one.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type BackupResult<T> = std::result::Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication rejected by GitHub: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("GitHub API error: {0}")]
    Api(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Timed out after {}s while mirroring {url}", timeout.as_secs())]
    TransferTimeout { url: String, timeout: Duration },

    #[error("Remote asked for credentials while mirroring {url} but none are configured")]
    CredentialsRequired { url: String },

    #[error("Mirror transfer of {url} exited with status {code}")]
    TransferFailed { url: String, code: u32 },

    #[error("Failed to spawn transfer process: {0}")]
    Spawn(String),

    #[error("Failed to archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State database error: {0}")]
    State(#[from] rusqlite::Error),

    #[error("Invalid state record: {0}")]
    StateEncoding(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackupError {
    pub fn archive(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Archive {
            path: path.into(),
            source,
        }
    }

    /// Short label used in progress output and the event log
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Config(_) => "config",
            BackupError::Auth(_) => "auth",
            BackupError::NotFound(_) => "not_found",
            BackupError::Api(_) | BackupError::Http(_) => "api",
            BackupError::TransferTimeout { .. } => "transfer_timeout",
            BackupError::CredentialsRequired { .. } => "credentials_required",
            BackupError::TransferFailed { .. } | BackupError::Spawn(_) => "transfer_failed",
            BackupError::Archive { .. } => "archive",
            BackupError::State(_) | BackupError::StateEncoding(_) => "state",
            BackupError::Io(_) => "io",
        }
    }
}
