//! Backup Engine - Orchestrates incremental repository backups
//!
//! For every repository in the account the engine runs change detection, mirrors the
//! ones that need it, archives the mirror and records the branch heads it observed.
//! One repository failing never stops the batch. Retention pruning runs once, after
//! every repository has been processed.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::archive::{self, force_remove_dir_all, ArchiveName};
use crate::catalog::{Account, Catalog, Credentials, Repository, RepositoryFilter};
use crate::detector::{BackupDecision, ChangeDetector, ChangeReason};
use crate::error::{BackupError, BackupResult};
use crate::prune::{self, PruneReport};
use crate::state::{EventType, StateDb, DEFAULT_EVENT_RETENTION_DAYS};
use crate::transfer::{Mirror, DEFAULT_TRANSFER_TIMEOUT};

/// Everything one backup run needs, passed explicitly
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub account: Account,
    pub credentials: Option<Credentials>,
    pub output_dir: PathBuf,
    pub retention: chrono::Duration,
    /// Age after which event log entries are removed
    pub event_retention: chrono::Duration,
    pub timeout: Duration,
    pub max_parallel: usize,
    pub dry_run: bool,
    pub filter: RepositoryFilter,
}

impl BackupRequest {
    pub fn new(account: Account, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            account,
            credentials: None,
            output_dir: output_dir.into(),
            retention: chrono::Duration::days(prune::DEFAULT_RETENTION_DAYS),
            event_retention: chrono::Duration::days(DEFAULT_EVENT_RETENTION_DAYS),
            timeout: DEFAULT_TRANSFER_TIMEOUT,
            max_parallel: 1,
            dry_run: false,
            filter: RepositoryFilter::allow_all(),
        }
    }
}

/// Per-repository progress notifications
#[derive(Debug)]
pub enum ProgressEvent<'a> {
    Started {
        repo: &'a str,
    },
    Succeeded {
        repo: &'a str,
        /// None for a dry run
        archive: Option<&'a Path>,
    },
    Skipped {
        repo: &'a str,
    },
    Failed {
        repo: &'a str,
        error: &'a BackupError,
    },
}

/// Receiver of progress notifications, typically the CLI's printer
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent<'_>);
}

/// Progress sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn report(&self, _event: ProgressEvent<'_>) {}
}

/// Final state of one repository in a run
#[derive(Debug)]
pub enum RepoOutcome {
    BackedUp {
        archive: PathBuf,
        reason: ChangeReason,
    },
    /// Dry run: a backup would have been made
    WouldBackUp {
        reason: ChangeReason,
    },
    Skipped,
    Failed {
        error: BackupError,
    },
}

#[derive(Debug)]
pub struct RepoReport {
    pub name: String,
    pub outcome: RepoOutcome,
}

/// Results from a complete backup run
#[derive(Debug)]
pub struct BackupSummary {
    pub total_repositories: usize,
    pub backed_up: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration: Duration,
    pub reports: Vec<RepoReport>,
    /// None for a dry run or when pruning could not list the output directory
    pub prune: Option<PruneReport>,
    /// Why pruning could not run at all
    pub prune_error: Option<String>,
}

impl BackupSummary {
    /// Whether any repository failed
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Whether pruning failed outright or left an expired archive behind
    pub fn prune_failed(&self) -> bool {
        self.prune_error.is_some() || self.prune.as_ref().is_some_and(|p| !p.failed.is_empty())
    }

    pub fn report_for(&self, name: &str) -> Option<&RepoReport> {
        self.reports.iter().find(|r| r.name == name)
    }
}

/// The engine that sequences detection, transfer, archiving and pruning
pub struct BackupEngine<'a> {
    catalog: &'a dyn Catalog,
    mirror: &'a dyn Mirror,
    state: &'a StateDb,
    progress: &'a dyn ProgressSink,
}

impl<'a> BackupEngine<'a> {
    pub fn new(catalog: &'a dyn Catalog, mirror: &'a dyn Mirror, state: &'a StateDb) -> Self {
        Self {
            catalog,
            mirror,
            state,
            progress: &SilentProgress,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Run a complete backup: list, back up what changed, then prune
    pub async fn run(&self, request: &BackupRequest) -> BackupResult<BackupSummary> {
        let start_time = Instant::now();
        let batch_time = Utc::now();

        info!(
            "Starting backup of {} via {}",
            request.account,
            self.catalog.provider_name()
        );

        // Nothing can be iterated without a listing, so this one is fatal
        let listed = self
            .catalog
            .list_repositories(&request.account, request.credentials.as_ref())
            .await?;
        let original_count = listed.len();
        let repositories = request.filter.apply(listed);
        info!(
            "Filtered {} repositories to {}",
            original_count,
            repositories.len()
        );

        if !request.dry_run {
            tokio::fs::create_dir_all(&request.output_dir).await?;
        }
        let archived = self.archived_repositories(request)?;

        let parallel = request.max_parallel.max(1);
        let reports: Vec<RepoReport> = stream::iter(repositories.iter())
            .map(|repo| self.process_repository(request, repo, batch_time, &archived))
            .buffer_unordered(parallel)
            .collect()
            .await;

        let (prune, prune_error) = if request.dry_run {
            (None, None)
        } else {
            let now = Utc::now();
            let pruned = match self.prune(request, now) {
                Ok(report) => (Some(report), None),
                Err(e) => {
                    error!("Pruning failed: {}", e);
                    (None, Some(e.to_string()))
                }
            };
            self.expire_events(now - request.event_retention);
            pruned
        };

        let mut summary = compile_summary(reports, prune, start_time.elapsed());
        summary.prune_error = prune_error;

        info!(
            "Backup completed in {:.2}s: {} backed up, {} skipped, {} failed",
            summary.duration.as_secs_f64(),
            summary.backed_up,
            summary.skipped,
            summary.failed
        );

        Ok(summary)
    }

    /// Apply the retention window to the output directory
    pub fn prune(&self, request: &BackupRequest, now: DateTime<Utc>) -> BackupResult<PruneReport> {
        if !request.output_dir.is_dir() {
            debug!(
                "Output directory {} does not exist, nothing to prune",
                request.output_dir.display()
            );
            return Ok(PruneReport::default());
        }

        let report = prune::prune_directory(
            &request.account.name,
            &request.output_dir,
            now,
            request.retention,
        )?;

        for path in &report.deleted {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let key = ArchiveName::parse(&file_name).map(|n| n.repository_key());
            self.log_event(EventType::Pruned, key.as_deref(), &file_name);
        }

        info!(
            "Pruned {} archive(s), kept {}",
            report.deleted.len(),
            report.kept.len()
        );
        Ok(report)
    }

    /// Names of repositories of this account with at least one archive on disk
    fn archived_repositories(&self, request: &BackupRequest) -> BackupResult<HashSet<String>> {
        if !request.output_dir.is_dir() {
            return Ok(HashSet::new());
        }

        Ok(prune::scan_archives(&request.output_dir)?
            .into_iter()
            .filter(|a| a.name.account == request.account.name)
            .map(|a| a.name.repository)
            .collect())
    }

    async fn process_repository(
        &self,
        request: &BackupRequest,
        repo: &Repository,
        batch_time: DateTime<Utc>,
        archived: &HashSet<String>,
    ) -> RepoReport {
        let key = request.account.qualify(&repo.name);
        self.progress.report(ProgressEvent::Started { repo: &repo.name });

        let outcome = match self
            .backup_repository(request, repo, batch_time, archived)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!("Backup of {} failed: {}", key, error);
                RepoOutcome::Failed { error }
            }
        };

        match &outcome {
            RepoOutcome::BackedUp { archive, reason } => {
                self.log_event(EventType::BackedUp, Some(&key), reason.as_str());
                self.progress.report(ProgressEvent::Succeeded {
                    repo: &repo.name,
                    archive: Some(archive.as_path()),
                });
            }
            RepoOutcome::WouldBackUp { .. } => {
                self.progress.report(ProgressEvent::Succeeded {
                    repo: &repo.name,
                    archive: None,
                });
            }
            RepoOutcome::Skipped => {
                self.log_event(EventType::Skipped, Some(&key), "branch heads unchanged");
                self.progress
                    .report(ProgressEvent::Skipped { repo: &repo.name });
            }
            RepoOutcome::Failed { error } => {
                self.log_event(EventType::Failed, Some(&key), &error.to_string());
                self.progress.report(ProgressEvent::Failed {
                    repo: &repo.name,
                    error,
                });
            }
        }

        RepoReport {
            name: repo.name.clone(),
            outcome,
        }
    }

    async fn backup_repository(
        &self,
        request: &BackupRequest,
        repo: &Repository,
        batch_time: DateTime<Utc>,
        archived: &HashSet<String>,
    ) -> BackupResult<RepoOutcome> {
        let key = request.account.qualify(&repo.name);
        let prior = self.state.get_branch_heads(&key)?;

        let detector =
            ChangeDetector::new(self.catalog, &request.account, request.credentials.as_ref());
        let decision = match detector.evaluate(repo, prior.as_ref()).await {
            BackupDecision::Skip if !archived.contains(&repo.name) => BackupDecision::Backup {
                reason: ChangeReason::ArchiveMissing,
                current: prior.clone(),
            },
            decision => decision,
        };

        let BackupDecision::Backup { reason, current } = decision else {
            debug!("{} unchanged, skipping", key);
            return Ok(RepoOutcome::Skipped);
        };

        if request.dry_run {
            return Ok(RepoOutcome::WouldBackUp { reason });
        }

        debug!("Backing up {} ({})", key, reason.as_str());

        let commit = repo
            .default_branch
            .as_ref()
            .and_then(|branch| current.as_ref()?.get(branch))
            .map(String::as_str);
        let name = ArchiveName::new(&request.account.name, &repo.name, batch_time, commit);
        let workdir = request.output_dir.join(name.mirror_dir_name());

        if workdir.exists() {
            warn!("Removing stale working directory {}", workdir.display());
            force_remove_dir_all(&workdir)?;
        }

        let status = match self
            .mirror
            .mirror(
                &repo.clone_url,
                &workdir,
                request.credentials.as_ref(),
                request.timeout,
            )
            .await
        {
            Ok(status) => status,
            Err(e) => {
                discard_workdir(&workdir);
                return Err(e);
            }
        };

        if !status.success() {
            discard_workdir(&workdir);
            return Err(BackupError::TransferFailed {
                url: repo.clone_url.clone(),
                code: status.exit_code,
            });
        }

        let archive_path = match archive::archive(&workdir).await {
            Ok(path) => path,
            Err(e) => {
                discard_workdir(&workdir);
                return Err(e);
            }
        };

        match &current {
            Some(heads) => self.state.record_backup(&key, heads)?,
            None => debug!("Branch heads unknown for {}, keeping previous state", key),
        }

        Ok(RepoOutcome::BackedUp {
            archive: archive_path,
            reason,
        })
    }

    fn expire_events(&self, cutoff: DateTime<Utc>) {
        if let Err(e) = self.state.cleanup_events_before(cutoff) {
            warn!("Failed to remove old events: {}", e);
        }
    }

    fn log_event(&self, event_type: EventType, key: Option<&str>, summary: &str) {
        if let Err(e) = self.state.record_event(event_type, key, summary) {
            warn!("Failed to record {} event: {}", event_type.as_str(), e);
        }
    }
}

fn discard_workdir(path: &Path) {
    if let Err(e) = force_remove_dir_all(path) {
        warn!(
            "Failed to remove working directory {}: {}",
            path.display(),
            e
        );
    }
}

fn compile_summary(
    reports: Vec<RepoReport>,
    prune: Option<PruneReport>,
    duration: Duration,
) -> BackupSummary {
    let mut backed_up = 0;
    let mut skipped = 0;
    let mut failed = 0;

    for report in &reports {
        match report.outcome {
            RepoOutcome::BackedUp { .. } | RepoOutcome::WouldBackUp { .. } => backed_up += 1,
            RepoOutcome::Skipped => skipped += 1,
            RepoOutcome::Failed { .. } => failed += 1,
        }
    }

    BackupSummary {
        total_repositories: reports.len(),
        backed_up,
        skipped,
        failed,
        duration,
        reports,
        prune,
        prune_error: None,
    }
}
