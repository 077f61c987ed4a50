//! Retention pruning
//!
//! Archives are grouped per repository and deleted oldest-first once they are older
//! than the retention window, but a repository's last remaining archive is never
//! deleted, however old it is.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::archive::ArchiveName;
use crate::error::BackupResult;

/// Default retention window
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// An archive file found on disk together with its parsed name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub path: PathBuf,
    pub name: ArchiveName,
}

/// What a pruning pass did
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub deleted: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// List the archives in `dir` whose names parse. Anything else is ignored.
pub fn scan_archives(dir: &Path) -> BackupResult<Vec<ArchiveFile>> {
    let mut archives = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };

        match ArchiveName::parse(file_name) {
            Some(name) => archives.push(ArchiveFile {
                path: entry.path(),
                name,
            }),
            None => debug!("Ignoring non-archive file: {}", file_name),
        }
    }

    Ok(archives)
}

/// Decide which archives of `account` to delete. Pure; touches nothing on disk.
///
/// Returns the archives to delete, oldest first.
pub fn plan(
    account: &str,
    archives: &[ArchiveFile],
    now: DateTime<Utc>,
    retention: Duration,
) -> Vec<ArchiveFile> {
    let mut groups: BTreeMap<String, Vec<&ArchiveFile>> = BTreeMap::new();
    for archive in archives.iter().filter(|a| a.name.account == account) {
        groups
            .entry(archive.name.repository_key())
            .or_default()
            .push(archive);
    }

    let mut doomed = Vec::new();

    for (key, mut group) in groups {
        group.sort_by(|a, b| {
            a.name
                .created_at
                .cmp(&b.name.created_at)
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut remaining = group.len();
        for archive in group {
            if remaining <= 1 {
                break;
            }
            if now - archive.name.created_at > retention {
                doomed.push(archive.clone());
                remaining -= 1;
            } else {
                // sorted oldest-first, nothing younger can be expired
                break;
            }
        }

        debug!("Retention for {}: {} archive(s) kept", key, remaining);
    }

    doomed.sort_by(|a, b| a.name.created_at.cmp(&b.name.created_at));
    doomed
}

/// Delete expired archives of `account`, always keeping one per repository
pub fn prune(
    account: &str,
    archives: &[ArchiveFile],
    now: DateTime<Utc>,
    retention: Duration,
) -> PruneReport {
    let doomed = plan(account, archives, now, retention);
    let mut report = PruneReport::default();

    for archive in &doomed {
        match std::fs::remove_file(&archive.path) {
            Ok(()) => {
                info!("Pruned expired archive: {}", archive.path.display());
                report.deleted.push(archive.path.clone());
            }
            Err(e) => {
                warn!("Failed to prune {}: {}", archive.path.display(), e);
                report.failed.push((archive.path.clone(), e.to_string()));
            }
        }
    }

    report.kept = archives
        .iter()
        .filter(|a| a.name.account == account)
        .filter(|a| !doomed.iter().any(|d| d.path == a.path))
        .map(|a| a.path.clone())
        .collect();

    report
}

/// Scan `dir` and prune the archives of `account`
pub fn prune_directory(
    account: &str,
    dir: &Path,
    now: DateTime<Utc>,
    retention: Duration,
) -> BackupResult<PruneReport> {
    let archives = scan_archives(dir)?;
    Ok(prune(account, &archives, now, retention))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn aged(account: &str, repo: &str, days: i64) -> ArchiveFile {
        let name = ArchiveName::new(account, repo, now() - Duration::days(days), None);
        ArchiveFile {
            path: PathBuf::from(format!("/backups/{}", name.file_name())),
            name,
        }
    }

    fn ages(archives: &[ArchiveFile]) -> Vec<i64> {
        archives
            .iter()
            .map(|a| (now() - a.name.created_at).num_days())
            .collect()
    }

    #[test]
    fn test_plan_deletes_only_expired() {
        let archives: Vec<_> = [40, 35, 20, 10, 2]
            .iter()
            .map(|d| aged("acme", "lib", *d))
            .collect();

        let doomed = plan("acme", &archives, now(), Duration::days(30));
        assert_eq!(ages(&doomed), vec![40, 35]);
    }

    #[test]
    fn test_plan_keeps_last_archive_even_if_expired() {
        let archives = vec![aged("acme", "old", 90), aged("acme", "old", 60), aged("acme", "old", 45)];

        let doomed = plan("acme", &archives, now(), Duration::days(30));
        assert_eq!(ages(&doomed), vec![90, 60]);
    }

    #[test]
    fn test_plan_single_archive_untouched() {
        let archives = vec![aged("acme", "lonely", 400)];
        assert!(plan("acme", &archives, now(), Duration::days(7)).is_empty());
    }

    #[test]
    fn test_plan_groups_are_independent() {
        let archives = vec![
            aged("acme", "lib", 40),
            aged("acme", "lib", 1),
            aged("acme", "app", 40),
        ];

        let doomed = plan("acme", &archives, now(), Duration::days(30));
        assert_eq!(doomed.len(), 1);
        assert_eq!(doomed[0].name.repository, "lib");
    }

    #[test]
    fn test_plan_ignores_other_accounts() {
        let archives = vec![aged("other", "lib", 40), aged("other", "lib", 39)];
        assert!(plan("acme", &archives, now(), Duration::days(30)).is_empty());
    }

    #[test]
    fn test_plan_exact_boundary_is_kept() {
        let archives = vec![aged("acme", "lib", 30), aged("acme", "lib", 1)];
        assert!(plan("acme", &archives, now(), Duration::days(30)).is_empty());
    }

    #[quickcheck]
    fn prop_every_group_keeps_an_archive(raw: Vec<(u8, u16)>, retention_days: u8) -> bool {
        let archives: Vec<ArchiveFile> = raw
            .iter()
            .enumerate()
            .map(|(i, (repo, age))| {
                let mut archive = aged("acme", &format!("repo{}", repo % 4), i64::from(*age % 400));
                archive.path = PathBuf::from(format!("/backups/{}-{}", i, archive.name.file_name()));
                archive
            })
            .collect();

        let doomed = plan("acme", &archives, now(), Duration::days(i64::from(retention_days)));
        let doomed_paths: BTreeSet<_> = doomed.iter().map(|a| a.path.clone()).collect();

        let before: BTreeSet<_> = archives.iter().map(|a| a.name.repository.clone()).collect();
        let after: BTreeSet<_> = archives
            .iter()
            .filter(|a| !doomed_paths.contains(&a.path))
            .map(|a| a.name.repository.clone())
            .collect();

        before == after
    }

    #[test]
    fn test_prune_directory_removes_files() {
        let temp = TempDir::new().unwrap();
        let mut expected_kept = Vec::new();

        for days in [40, 35, 20, 10, 2] {
            let name = ArchiveName::new("acme", "lib", now() - Duration::days(days), Some("abc1234"));
            let path = temp.path().join(name.file_name());
            std::fs::write(&path, b"archive").unwrap();
            if days < 30 {
                expected_kept.push(path);
            }
        }
        std::fs::write(temp.path().join("README.txt"), b"not an archive").unwrap();

        let report = prune_directory("acme", temp.path(), now(), Duration::days(30)).unwrap();

        assert_eq!(report.deleted.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(report.kept.len(), 3);
        for path in &expected_kept {
            assert!(path.exists());
        }
        for path in &report.deleted {
            assert!(!path.exists());
        }
        assert!(temp.path().join("README.txt").exists());
    }
}
