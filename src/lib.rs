//! github-backup - Incremental mirror backups of a GitHub account
//!
//! github-backup discovers every repository of a user or organization, mirrors the ones
//! whose branch heads moved since the last run, packages each mirror into a timestamped
//! archive and prunes old archives while always keeping at least one per repository.
//!
//! ## Core Features
//!
//! - **Change Detection**: Branch-head maps decide whether a repository needs a backup
//! - **Interactive Transfers**: `git clone --mirror` under a PTY answers credential prompts
//! - **Archiving**: Streaming tar.gz packaging of each mirror
//! - **Retention**: Age-based pruning that never removes a repository's last archive
//! - **Configuration Management**: YAML-based configuration with XDG compliance
//!
//! ## Modules
//!
//! - [`catalog`]: Repository catalog abstraction and filtering
//! - [`github`]: GitHub REST implementation of the catalog
//! - [`detector`]: Skip-or-backup decisions
//! - [`transfer`]: PTY-driven mirror clones
//! - [`archive`]: Archive naming and packaging
//! - [`prune`]: Retention pruning
//! - [`state`]: SQLite persistence of branch heads and events
//! - [`backup`]: The orchestrator tying it all together
//! - [`config`]: Configuration management and parsing

pub mod archive;
pub mod backup;
pub mod catalog;
pub mod config;
pub mod detector;
pub mod error;
pub mod github;
pub mod prune;
pub mod state;
pub mod transfer;

pub use backup::{BackupEngine, BackupRequest, BackupSummary, ProgressEvent, ProgressSink};
pub use catalog::{Account, BranchHeads, Catalog, Credentials, Repository};
pub use config::Config;
pub use error::{BackupError, BackupResult};
pub use github::GitHubCatalog;
pub use state::StateDb;
pub use transfer::{Mirror, MirrorTransfer};
