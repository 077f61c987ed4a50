//! Archive naming and packaging
//!
//! Archive names carry their own metadata:
//!
//! ```text
//! <account>@<repository>@<YYYYMMDDTHHMMSSZ>@<commit7|none>.git.tar.gz
//! ```
//!
//! `%`, `@`, path separators and control characters inside a component are
//! percent-escaped, so splitting on `@` always yields exactly four fields.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{BackupError, BackupResult};

/// Suffix of the mirror working directory
pub const MIRROR_DIR_SUFFIX: &str = ".git";
/// Suffix of a finished archive
pub const ARCHIVE_SUFFIX: &str = ".git.tar.gz";
/// Suffix of an archive still being written
pub const PARTIAL_SUFFIX: &str = ".partial";

const FIELD_SEPARATOR: char = '@';
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const NO_COMMIT: &str = "none";
const SHORT_COMMIT_LEN: usize = 7;

/// Metadata encoded in an archive file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub account: String,
    pub repository: String,
    pub created_at: DateTime<Utc>,
    pub commit: Option<String>,
}

impl ArchiveName {
    pub fn new(
        account: impl Into<String>,
        repository: impl Into<String>,
        created_at: DateTime<Utc>,
        commit: Option<&str>,
    ) -> Self {
        Self {
            account: account.into(),
            repository: repository.into(),
            created_at: truncate_to_seconds(created_at),
            commit: commit.map(|c| c.chars().take(SHORT_COMMIT_LEN).collect()),
        }
    }

    /// Name without any suffix
    pub fn stem(&self) -> String {
        let commit = self.commit.as_deref().unwrap_or(NO_COMMIT);
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            escape(&self.account),
            escape(&self.repository),
            self.created_at.format(TIMESTAMP_FORMAT),
            escape(commit),
            sep = FIELD_SEPARATOR
        )
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", self.stem(), ARCHIVE_SUFFIX)
    }

    pub fn mirror_dir_name(&self) -> String {
        format!("{}{}", self.stem(), MIRROR_DIR_SUFFIX)
    }

    /// Parse a finished archive file name. Returns None for anything else.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(ARCHIVE_SUFFIX)?;
        let fields: Vec<&str> = stem.split(FIELD_SEPARATOR).collect();
        let [account, repository, timestamp, commit] = fields.as_slice() else {
            return None;
        };

        let created_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
        let commit = unescape(commit)?;

        Some(Self {
            account: unescape(account)?,
            repository: unescape(repository)?,
            created_at: Utc.from_utc_datetime(&created_at),
            commit: (commit != NO_COMMIT).then_some(commit),
        })
    }

    /// Grouping key for retention (`account/repository`)
    pub fn repository_key(&self) -> String {
        format!("{}/{}", self.account, self.repository)
    }
}

fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.timestamp(), 0).single().unwrap_or(ts)
}

fn needs_escape(ch: char) -> bool {
    matches!(ch, '%' | '@' | '/' | '\\') || ch.is_ascii_control()
}

fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for ch in component.chars() {
        if needs_escape(ch) {
            out.push_str(&format!("%{:02X}", ch as u32));
        } else {
            out.push(ch);
        }
    }
    out
}

/// Inverse of [`escape`]. Only the canonical encoding is accepted: uppercase hex,
/// escapes only for characters that need them, and no raw character that needs one.
fn unescape(component: &str) -> Option<String> {
    let mut out = String::with_capacity(component.len());
    let mut chars = component.chars();
    while let Some(ch) = chars.next() {
        if ch == '%' {
            let high = upper_hex_digit(chars.next()?)?;
            let low = upper_hex_digit(chars.next()?)?;
            let decoded = char::from(high * 16 + low);
            if !needs_escape(decoded) {
                return None;
            }
            out.push(decoded);
        } else if needs_escape(ch) {
            return None;
        } else {
            out.push(ch);
        }
    }
    Some(out)
}

fn upper_hex_digit(ch: char) -> Option<u8> {
    match ch {
        '0'..='9' | 'A'..='F' => ch.to_digit(16).map(|d| d as u8),
        _ => None,
    }
}

/// Package `source_dir` into `<source_dir>.tar.gz` next to it and remove
/// `source_dir` afterwards.
///
/// The tarball is streamed through a gzip encoder straight to disk under a
/// `.partial` name and renamed once complete.
pub async fn archive(source_dir: &Path) -> BackupResult<PathBuf> {
    let source_dir = source_dir.to_path_buf();

    tokio::task::spawn_blocking(move || archive_blocking(&source_dir))
        .await
        .map_err(|e| BackupError::Spawn(format!("Archive task failed: {}", e)))?
}

fn archive_path_for(source_dir: &Path) -> PathBuf {
    let mut name = source_dir.as_os_str().to_os_string();
    name.push(".tar.gz");
    PathBuf::from(name)
}

fn archive_blocking(source_dir: &Path) -> BackupResult<PathBuf> {
    let archive_path = archive_path_for(source_dir);
    let mut partial_path = archive_path.clone().into_os_string();
    partial_path.push(PARTIAL_SUFFIX);
    let partial_path = PathBuf::from(partial_path);

    info!("Archiving {} -> {}", source_dir.display(), archive_path.display());

    if let Err(e) = write_tarball(source_dir, &partial_path) {
        let _ = fs::remove_file(&partial_path);
        return Err(BackupError::archive(source_dir, e));
    }

    fs::rename(&partial_path, &archive_path)
        .map_err(|e| BackupError::archive(&archive_path, e))?;

    force_remove_dir_all(source_dir).map_err(|e| BackupError::archive(source_dir, e))?;

    debug!("Archive complete: {}", archive_path.display());
    Ok(archive_path)
}

fn write_tarball(source_dir: &Path, dest: &Path) -> std::io::Result<()> {
    if !fs::metadata(source_dir)?.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "mirror source is not a directory",
        ));
    }

    let file = File::create(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut tar = Builder::new(encoder);
    tar.follow_symlinks(false);

    for entry in WalkDir::new(source_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let name = portable_entry_name(relative);

        if entry.file_type().is_dir() {
            tar.append_dir(&name, entry.path())?;
        } else {
            tar.append_path_with_name(entry.path(), &name)?;
        }
    }

    let encoder = tar.into_inner()?;
    let writer = encoder.finish()?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;
    Ok(())
}

/// Relative path joined with `/` regardless of host platform
fn portable_entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Remove a directory tree even if it contains read-only entries.
///
/// git marks pack files read-only, which blocks deletion on Windows.
pub fn force_remove_dir_all(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            warn!(
                "Permission denied removing {}, forcing entries writable",
                path.display()
            );
            make_tree_writable(path)?;
            fs::remove_dir_all(path)
        }
        Err(e) => Err(e),
    }
}

fn make_tree_writable(path: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(path).contents_first(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.path_is_symlink() {
            continue;
        }
        let mut perms = entry.metadata().map_err(std::io::Error::from)?.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o777);
        }
        #[cfg(not(unix))]
        {
            perms.set_readonly(false);
        }
        fs::set_permissions(entry.path(), perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Write;
    use tempfile::TempDir;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_name_format() {
        let name = ArchiveName::new("acme", "lib", ts("2024-03-05T07:08:09Z"), Some("abc123def456"));
        assert_eq!(name.file_name(), "acme@lib@20240305T070809Z@abc123d.git.tar.gz");
        assert_eq!(name.mirror_dir_name(), "acme@lib@20240305T070809Z@abc123d.git");
    }

    #[test]
    fn test_name_parse() {
        let parsed = ArchiveName::parse("acme@my-lib.rs@20240305T070809Z@none.git.tar.gz").unwrap();
        assert_eq!(parsed.account, "acme");
        assert_eq!(parsed.repository, "my-lib.rs");
        assert_eq!(parsed.created_at, ts("2024-03-05T07:08:09Z"));
        assert_eq!(parsed.commit, None);
        assert_eq!(parsed.repository_key(), "acme/my-lib.rs");
    }

    #[test]
    fn test_name_with_delimiter_characters() {
        let name = ArchiveName::new("we@ird", "100%/lib", ts("2024-01-01T00:00:00Z"), None);
        let file_name = name.file_name();
        assert_eq!(file_name.matches('@').count(), 3);
        assert!(!file_name.contains('/'));
        assert_eq!(ArchiveName::parse(&file_name), Some(name));
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert!(ArchiveName::parse("notes.txt").is_none());
        assert!(ArchiveName::parse("acme@lib@20240305T070809Z@none.git").is_none());
        assert!(ArchiveName::parse("acme@lib@yesterday@none.git.tar.gz").is_none());
        assert!(ArchiveName::parse("acme@lib@20240305T070809Z.git.tar.gz").is_none());
        assert!(ArchiveName::parse("acme@lib%4@20240305T070809Z@none.git.tar.gz").is_none());
        // legacy dash-separated names are left alone
        assert!(ArchiveName::parse("acme-lib-abc1234-1700000000.git.zip").is_none());
    }

    #[test]
    fn test_parse_accepts_only_canonical_escapes() {
        let canonical = "acme@100%25%2Flib@20240101T000000Z@none.git.tar.gz";
        let parsed = ArchiveName::parse(canonical).unwrap();
        assert_eq!(parsed.repository, "100%/lib");
        assert_eq!(parsed.file_name(), canonical);

        // lowercase hex
        assert!(ArchiveName::parse("acme@100%25%2flib@20240101T000000Z@none.git.tar.gz").is_none());
        // escaped character that never needs escaping
        assert!(ArchiveName::parse("acme@%6Cib@20240101T000000Z@none.git.tar.gz").is_none());
        // raw character that always needs escaping
        assert!(ArchiveName::parse("acme@li\\b@20240101T000000Z@none.git.tar.gz").is_none());
        assert!(ArchiveName::parse("acme@li%b@20240101T000000Z@none.git.tar.gz").is_none());
    }

    #[test]
    fn test_subsecond_timestamps_are_truncated() {
        let precise = ts("2024-03-05T07:08:09.987Z");
        let name = ArchiveName::new("acme", "lib", precise, None);
        assert_eq!(name.created_at, ts("2024-03-05T07:08:09Z"));
    }

    #[tokio::test]
    async fn test_archive_packs_relative_entries_and_removes_source() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("acme@lib@20240305T070809Z@none.git");
        fs::create_dir_all(source.join("refs/heads")).unwrap();
        fs::write(source.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        let mut packed = File::create(source.join("refs/heads/main")).unwrap();
        writeln!(packed, "abc123").unwrap();

        let archive_path = archive(&source).await.unwrap();

        assert_eq!(
            archive_path,
            temp.path().join("acme@lib@20240305T070809Z@none.git.tar.gz")
        );
        assert!(!source.exists());
        assert!(!temp
            .path()
            .join("acme@lib@20240305T070809Z@none.git.tar.gz.partial")
            .exists());

        let mut reader = tar::Archive::new(GzDecoder::new(File::open(&archive_path).unwrap()));
        let mut names: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| {
                let entry = e.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                path.trim_end_matches('/').to_string()
            })
            .collect();
        names.sort();
        assert_eq!(names, vec!["HEAD", "refs", "refs/heads", "refs/heads/main"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_archive_removes_read_only_tree() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let source = temp.path().join("acme@ro@20240305T070809Z@none.git");
        let objects = source.join("objects/pack");
        fs::create_dir_all(&objects).unwrap();
        fs::write(objects.join("pack-1.pack"), b"PACK").unwrap();
        fs::set_permissions(objects.join("pack-1.pack"), fs::Permissions::from_mode(0o444))
            .unwrap();
        fs::set_permissions(&objects, fs::Permissions::from_mode(0o555)).unwrap();

        let archive_path = archive(&source).await.unwrap();
        assert!(archive_path.exists());
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_archive_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let result = archive(&temp.path().join("missing.git")).await;
        assert!(matches!(result, Err(BackupError::Archive { .. })));
        assert!(!temp.path().join("missing.git.tar.gz").exists());
    }
}
