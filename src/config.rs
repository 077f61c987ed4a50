use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backup::BackupRequest;
use crate::catalog::{Account, Credentials, RepositoryFilter};
use crate::error::{BackupError, BackupResult};
use crate::github::DEFAULT_API_URL;
use crate::state::StateDb;
use crate::transfer::MirrorTransfer;

/// Environment variable used as the password when none is configured
pub const TOKEN_ENV_VAR: &str = "GITHUB_TOKEN";

/// Main configuration structure for github-backup
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directory that receives archives
    #[serde(default)]
    pub output_directory: String,

    /// Whose repositories are backed up
    #[serde(default)]
    pub account: AccountConfig,

    /// Password or personal access token for `account.username`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// How long archives are kept ("30m", "12h", "7d")
    #[serde(default = "default_retention")]
    pub retention: String,

    /// How long entries in the state database's event log are kept
    #[serde(default = "default_event_retention")]
    pub event_retention: String,

    /// GitHub REST API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Mirror transfer settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Repositories backed up concurrently
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// State database location (defaults to the XDG data directory)
    #[serde(default)]
    pub state_file: Option<String>,

    /// Repository filtering configuration
    #[serde(default)]
    pub filters: FilterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Account identity
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AccountConfig {
    /// Organization to back up; takes precedence over `username`
    pub organization: Option<String>,

    /// User to back up, and the login used for credentials
    pub username: Option<String>,
}

/// Mirror transfer configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TransferConfig {
    /// Timeout for each waiting phase of a clone, in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// git executable
    #[serde(default = "default_git_program")]
    pub git_program: String,
}

/// Repository filtering configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FilterConfig {
    /// Repository exclusion patterns
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Include forked repositories
    #[serde(default = "default_true")]
    pub include_forks: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"
}

/// Values given on the command line, overriding the file
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub output_directory: Option<String>,
    pub organization: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub state_file: Option<String>,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_retention() -> String {
    "7d".to_string()
}
fn default_event_retention() -> String {
    "90d".to_string()
}
fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}
fn default_max_parallel() -> usize {
    1
}
fn default_timeout() -> u64 {
    300
}
fn default_git_program() -> String {
    "git".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            git_program: default_git_program(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: Vec::new(),
            include_forks: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Parse a duration such as `90s`, `30m`, `12h` or `7d`. A bare number is seconds.
pub fn parse_duration(duration_str: &str) -> BackupResult<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let (value, unit_secs) = if let Some(value) = duration_str.strip_suffix('s') {
        (value, 1)
    } else if let Some(value) = duration_str.strip_suffix('m') {
        (value, 60)
    } else if let Some(value) = duration_str.strip_suffix('h') {
        (value, 3600)
    } else if let Some(value) = duration_str.strip_suffix('d') {
        (value, 86400)
    } else {
        (duration_str.as_str(), 1)
    };

    value
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|v| v.checked_mul(unit_secs))
        .map(Duration::from_secs)
        .ok_or_else(|| {
            BackupError::Config(format!(
                "Invalid duration '{}'. Use a format like '30m', '12h', '7d'",
                duration_str
            ))
        })
}

impl Config {
    /// Load configuration from the default location, falling back to defaults
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            tracing::debug!("No configuration at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("github-backup").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.output_directory = shellexpand::full(&self.output_directory)
            .context("Failed to expand output_directory path")?
            .into_owned();

        if let Some(state_file) = &self.state_file {
            self.state_file = Some(
                shellexpand::full(state_file)
                    .context("Failed to expand state_file path")?
                    .into_owned(),
            );
        }

        Ok(())
    }

    /// Apply command-line values on top of the file
    pub fn apply_overrides(&mut self, overrides: CliOverrides) -> Result<()> {
        if let Some(dir) = overrides.output_directory {
            self.output_directory = dir;
        }
        if let Some(org) = overrides.organization {
            self.account.organization = Some(org);
        }
        if let Some(user) = overrides.username {
            self.account.username = Some(user);
        }
        if overrides.password.is_some() {
            self.password = overrides.password;
        }
        if overrides.state_file.is_some() {
            self.state_file = overrides.state_file;
        }
        self.expand_paths()
    }

    /// Check everything that must hold before any network call
    pub fn validate(&self) -> BackupResult<()> {
        if self.output_directory.trim().is_empty() {
            return Err(BackupError::Config(
                "output_directory is required".to_string(),
            ));
        }

        if self.max_parallel == 0 {
            return Err(BackupError::Config(
                "max_parallel must be at least 1".to_string(),
            ));
        }

        if self.transfer.timeout == 0 {
            return Err(BackupError::Config(
                "transfer.timeout must be at least 1 second".to_string(),
            ));
        }

        self.retention_window()?;
        self.event_retention_window()?;
        self.account()?;
        self.credentials()?;
        self.filter()?;
        Ok(())
    }

    /// The account to back up
    pub fn account(&self) -> BackupResult<Account> {
        match (&self.account.organization, &self.account.username) {
            (Some(org), _) if !org.is_empty() => Ok(Account::organization(org.clone())),
            (_, Some(user)) if !user.is_empty() => Ok(Account::user(user.clone())),
            _ => Err(BackupError::Config(
                "Either account.organization or account.username is required".to_string(),
            )),
        }
    }

    /// Credentials for the API and the clone prompt, if any
    pub fn credentials(&self) -> BackupResult<Option<Credentials>> {
        let password = self
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| std::env::var(TOKEN_ENV_VAR).ok().filter(|t| !t.is_empty()));

        match (&self.account.username, password) {
            (Some(user), Some(password)) => Ok(Some(Credentials::new(user.clone(), password))),
            (Some(user), None) if self.account.organization.is_some() => {
                Err(BackupError::Config(format!(
                    "A password (or {}) is required for {} to back up an organization",
                    TOKEN_ENV_VAR, user
                )))
            }
            (Some(_), None) => Ok(None),
            (None, Some(_)) if self.password.is_some() => Err(BackupError::Config(
                "A password was given without account.username".to_string(),
            )),
            (None, _) => Ok(None),
        }
    }

    pub fn retention_window(&self) -> BackupResult<chrono::Duration> {
        let window = parse_duration(&self.retention)?;
        chrono::Duration::from_std(window)
            .map_err(|_| BackupError::Config(format!("Retention '{}' is too large", self.retention)))
    }

    pub fn event_retention_window(&self) -> BackupResult<chrono::Duration> {
        let window = parse_duration(&self.event_retention)?;
        chrono::Duration::from_std(window).map_err(|_| {
            BackupError::Config(format!(
                "Event retention '{}' is too large",
                self.event_retention
            ))
        })
    }

    pub fn filter(&self) -> BackupResult<RepositoryFilter> {
        RepositoryFilter::new(&self.filters.exclude_patterns, self.filters.include_forks)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(StateDb::default_path)
    }

    pub fn mirror_transfer(&self) -> MirrorTransfer {
        MirrorTransfer::new(self.transfer.git_program.clone())
    }

    /// Build the request for one run; fails on invalid configuration
    pub fn build_request(&self, dry_run: bool) -> BackupResult<BackupRequest> {
        self.validate()?;

        let mut request = BackupRequest::new(self.account()?, &self.output_directory);
        request.credentials = self.credentials()?;
        request.retention = self.retention_window()?;
        request.event_retention = self.event_retention_window()?;
        request.timeout = Duration::from_secs(self.transfer.timeout);
        request.max_parallel = self.max_parallel;
        request.dry_run = dry_run;
        request.filter = self.filter()?;
        Ok(request)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_directory: String::new(),
            account: AccountConfig::default(),
            password: None,
            retention: default_retention(),
            event_retention: default_event_retention(),
            api_url: default_api_url(),
            transfer: TransferConfig::default(),
            max_parallel: default_max_parallel(),
            state_file: None,
            filters: FilterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
