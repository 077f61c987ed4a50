//! Change detection - decides whether a repository needs a new backup
//!
//! The fingerprint of a repository is its full branch-head map. A repository is only
//! skipped when the current map could be fetched and is identical to the map recorded
//! at the last successful backup. Everything else, including a failed API call, leads
//! to a backup.

use tracing::{debug, warn};

use crate::catalog::{Account, BranchHeads, Catalog, Credentials, Repository};

/// Why a repository is being backed up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// Never backed up before
    NoPriorState,
    /// A branch was added, removed or moved
    HeadsChanged,
    /// Branch heads could not be fetched
    HeadsUnavailable,
    /// Heads are unchanged but no archive of the repository is on disk
    ArchiveMissing,
}

impl ChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeReason::NoPriorState => "no previous backup",
            ChangeReason::HeadsChanged => "branch heads changed",
            ChangeReason::HeadsUnavailable => "branch heads unavailable",
            ChangeReason::ArchiveMissing => "no archive on disk",
        }
    }
}

/// Outcome of change detection for one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupDecision {
    Skip,
    Backup {
        reason: ChangeReason,
        /// Heads observed before the transfer, persisted once the backup succeeds
        current: Option<BranchHeads>,
    },
}

impl BackupDecision {
    pub fn needs_backup(&self) -> bool {
        matches!(self, BackupDecision::Backup { .. })
    }

    pub fn current_heads(&self) -> Option<&BranchHeads> {
        match self {
            BackupDecision::Backup { current, .. } => current.as_ref(),
            BackupDecision::Skip => None,
        }
    }
}

/// Pure decision rule over recorded and observed branch heads
pub fn decide(prior: Option<&BranchHeads>, current: Option<BranchHeads>) -> BackupDecision {
    match (prior, current) {
        (None, current) => BackupDecision::Backup {
            reason: ChangeReason::NoPriorState,
            current,
        },
        (Some(_), None) => BackupDecision::Backup {
            reason: ChangeReason::HeadsUnavailable,
            current: None,
        },
        (Some(prior), Some(current)) if *prior == current => BackupDecision::Skip,
        (Some(_), Some(current)) => BackupDecision::Backup {
            reason: ChangeReason::HeadsChanged,
            current: Some(current),
        },
    }
}

/// Fetches current branch heads and applies [`decide`]
pub struct ChangeDetector<'a> {
    catalog: &'a dyn Catalog,
    account: &'a Account,
    credentials: Option<&'a Credentials>,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        account: &'a Account,
        credentials: Option<&'a Credentials>,
    ) -> Self {
        Self {
            catalog,
            account,
            credentials,
        }
    }

    pub async fn evaluate(&self, repo: &Repository, prior: Option<&BranchHeads>) -> BackupDecision {
        let current = match self
            .catalog
            .branch_heads(self.account, &repo.name, self.credentials)
            .await
        {
            Ok(heads) => Some(heads),
            Err(e) => {
                warn!(
                    "Could not fetch branch heads for {}, backing up anyway: {}",
                    repo.name, e
                );
                None
            }
        };

        let decision = decide(prior, current);
        debug!("Change detection for {}: {:?}", repo.name, decision);
        decision
    }

    pub async fn needs_backup(&self, repo: &Repository, prior: Option<&BranchHeads>) -> bool {
        self.evaluate(repo, prior).await.needs_backup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackupError, BackupResult};
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    fn heads(pairs: &[(&str, &str)]) -> BranchHeads {
        pairs
            .iter()
            .map(|(b, c)| (b.to_string(), c.to_string()))
            .collect()
    }

    struct FixedCatalog(Option<BranchHeads>);

    #[async_trait]
    impl Catalog for FixedCatalog {
        async fn list_repositories(
            &self,
            _account: &Account,
            _credentials: Option<&Credentials>,
        ) -> BackupResult<Vec<Repository>> {
            Ok(Vec::new())
        }

        async fn branch_heads(
            &self,
            _account: &Account,
            _repo_name: &str,
            _credentials: Option<&Credentials>,
        ) -> BackupResult<BranchHeads> {
            self.0
                .clone()
                .ok_or_else(|| BackupError::Api("Server Error".to_string()))
        }

        fn provider_name(&self) -> &'static str {
            "fixed"
        }
    }

    fn lib() -> Repository {
        Repository {
            name: "lib".to_string(),
            clone_url: "https://github.com/acme/lib.git".to_string(),
            default_branch: Some("main".to_string()),
            is_fork: false,
        }
    }

    #[test]
    fn test_unchanged_heads_skip() {
        let prior = heads(&[("main", "abc123"), ("dev", "fff000")]);
        let current = heads(&[("dev", "fff000"), ("main", "abc123")]);
        assert_eq!(decide(Some(&prior), Some(current)), BackupDecision::Skip);
    }

    #[test]
    fn test_any_difference_triggers_backup() {
        let prior = heads(&[("main", "abc123")]);

        let moved = decide(Some(&prior), Some(heads(&[("main", "def456")])));
        assert_matches!(moved, BackupDecision::Backup { reason: ChangeReason::HeadsChanged, .. });

        let added = decide(
            Some(&prior),
            Some(heads(&[("main", "abc123"), ("feature", "123abc")])),
        );
        assert!(added.needs_backup());

        let removed = decide(Some(&heads(&[("main", "abc123"), ("old", "1")])), Some(prior.clone()));
        assert!(removed.needs_backup());
    }

    #[test]
    fn test_no_prior_state_backs_up() {
        let decision = decide(None, Some(heads(&[("main", "abc123")])));
        assert_matches!(
            decision,
            BackupDecision::Backup { reason: ChangeReason::NoPriorState, current: Some(_) }
        );
    }

    #[test]
    fn test_empty_maps_are_equal() {
        assert_eq!(
            decide(Some(&BranchHeads::new()), Some(BranchHeads::new())),
            BackupDecision::Skip
        );
    }

    #[tokio::test]
    async fn test_api_failure_fails_open() {
        let catalog = FixedCatalog(None);
        let account = Account::organization("acme");
        let detector = ChangeDetector::new(&catalog, &account, None);
        let prior = heads(&[("main", "abc123")]);

        let decision = detector.evaluate(&lib(), Some(&prior)).await;
        assert_eq!(
            decision,
            BackupDecision::Backup {
                reason: ChangeReason::HeadsUnavailable,
                current: None
            }
        );
        assert!(detector.needs_backup(&lib(), Some(&prior)).await);
    }

    #[tokio::test]
    async fn test_detector_scenario_lib() {
        let account = Account::organization("acme");
        let prior = heads(&[("main", "abc123")]);

        let same = FixedCatalog(Some(heads(&[("main", "abc123")])));
        let detector = ChangeDetector::new(&same, &account, None);
        assert!(!detector.needs_backup(&lib(), Some(&prior)).await);

        let moved = FixedCatalog(Some(heads(&[("main", "def456")])));
        let detector = ChangeDetector::new(&moved, &account, None);
        let decision = detector.evaluate(&lib(), Some(&prior)).await;
        assert_eq!(decision.current_heads(), Some(&heads(&[("main", "def456")])));
    }
}
