//! Repository catalog abstraction
//!
//! The orchestrator only talks to the hosting service through the [`Catalog`] trait,
//! which lists the repositories of an account and reports the branch heads of one
//! repository. [`crate::github::GitHubCatalog`] is the production implementation.

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::error::{BackupError, BackupResult};

/// Branch name -> commit identifier
pub type BranchHeads = BTreeMap<String, String>;

/// Whether an account is a personal user or an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    User,
    Organization,
}

/// The account whose repositories are backed up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub kind: AccountKind,
    pub name: String,
}

impl Account {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            kind: AccountKind::User,
            name: name.into(),
        }
    }

    pub fn organization(name: impl Into<String>) -> Self {
        Self {
            kind: AccountKind::Organization,
            name: name.into(),
        }
    }

    /// Key used for persisted state (`account/repository`)
    pub fn qualify(&self, repo_name: &str) -> String {
        format!("{}/{}", self.name, repo_name)
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AccountKind::User => write!(f, "user {}", self.name),
            AccountKind::Organization => write!(f, "organization {}", self.name),
        }
    }
}

/// HTTP Basic credentials, also fed to the interactive clone prompt
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A repository as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// Repository name, unique within the account
    pub name: String,

    /// HTTPS clone URL
    pub clone_url: String,

    /// Default branch, used to pick the commit recorded in archive names
    pub default_branch: Option<String>,

    /// Whether the repository is a fork
    pub is_fork: bool,
}

/// Source of repositories and branch heads for an account
#[async_trait]
pub trait Catalog: Send + Sync {
    /// List every repository owned by the account
    async fn list_repositories(
        &self,
        account: &Account,
        credentials: Option<&Credentials>,
    ) -> BackupResult<Vec<Repository>>;

    /// Current branch heads of one repository
    async fn branch_heads(
        &self,
        account: &Account,
        repo_name: &str,
        credentials: Option<&Credentials>,
    ) -> BackupResult<BranchHeads>;

    /// Provider name for display/logging
    fn provider_name(&self) -> &'static str;
}

/// Exclusion rules applied to the catalog listing
#[derive(Debug, Clone)]
pub struct RepositoryFilter {
    exclude: Vec<Regex>,
    include_forks: bool,
}

impl RepositoryFilter {
    /// Build a filter from glob-style patterns (`*` matches any run of characters)
    pub fn new(patterns: &[String], include_forks: bool) -> BackupResult<Self> {
        let exclude = patterns
            .iter()
            .map(|pattern| {
                let escaped = regex::escape(pattern).replace(r"\*", ".*");
                Regex::new(&format!("^{}$", escaped)).map_err(|e| {
                    BackupError::Config(format!("Invalid exclude pattern '{}': {}", pattern, e))
                })
            })
            .collect::<BackupResult<Vec<_>>>()?;

        Ok(Self {
            exclude,
            include_forks,
        })
    }

    /// A filter that keeps everything
    pub fn allow_all() -> Self {
        Self {
            exclude: Vec::new(),
            include_forks: true,
        }
    }

    pub fn is_excluded(&self, repo: &Repository) -> bool {
        if repo.is_fork && !self.include_forks {
            debug!("Excluding fork repository: {}", repo.name);
            return true;
        }

        if self.exclude.iter().any(|re| re.is_match(&repo.name)) {
            debug!("Excluding repository due to pattern match: {}", repo.name);
            return true;
        }

        false
    }

    pub fn apply(&self, repositories: Vec<Repository>) -> Vec<Repository> {
        repositories
            .into_iter()
            .filter(|repo| !self.is_excluded(repo))
            .collect()
    }
}

impl Default for RepositoryFilter {
    fn default() -> Self {
        Self::allow_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(name: &str, is_fork: bool) -> Repository {
        Repository {
            name: name.to_string(),
            clone_url: format!("https://github.com/acme/{}.git", name),
            default_branch: Some("main".to_string()),
            is_fork,
        }
    }

    #[test]
    fn test_account_qualify() {
        assert_eq!(Account::organization("acme").qualify("lib"), "acme/lib");
        assert_eq!(Account::user("octocat").to_string(), "user octocat");
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("octocat", "hunter2");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("octocat"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_exclusion_patterns() {
        let filter = RepositoryFilter::new(
            &["archived-*".to_string(), "*.github.io".to_string(), "scratch".to_string()],
            true,
        )
        .unwrap();

        assert!(filter.is_excluded(&repo("archived-2019", false)));
        assert!(filter.is_excluded(&repo("acme.github.io", false)));
        assert!(filter.is_excluded(&repo("scratch", false)));
        assert!(!filter.is_excluded(&repo("scratchpad", false)));
        assert!(!filter.is_excluded(&repo("acmeXgithubXio", false)));
        assert!(!filter.is_excluded(&repo("lib", false)));
    }

    #[test]
    fn test_default_filter_keeps_forks() {
        let filter = RepositoryFilter::default();
        let kept = filter.apply(vec![repo("lib", false), repo("upstream-fork", true)]);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_fork_filtering() {
        let no_forks = RepositoryFilter::new(&[], false).unwrap();
        let repos = vec![repo("lib", false), repo("upstream-fork", true)];

        let kept = no_forks.apply(repos.clone());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "lib");

        assert_eq!(RepositoryFilter::allow_all().apply(repos).len(), 2);
    }
}
