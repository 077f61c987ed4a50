//! Common test utilities and helpers for github-backup tests
#![allow(dead_code)]

use async_trait::async_trait;
use github_backup::backup::{ProgressEvent, ProgressSink};
use github_backup::catalog::Credentials;
use github_backup::error::{BackupError, BackupResult};
use github_backup::transfer::{Mirror, TransferStatus};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Scratch directories for one test
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub output_dir: PathBuf,
    pub state_file: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let output_dir = temp_dir.path().join("backups");
        let state_file = temp_dir.path().join("state").join("state.db");

        Self {
            temp_dir,
            output_dir,
            state_file,
        }
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.temp_dir.path().join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    /// Organization config pointing at `api_url`, writing into this environment
    pub fn create_org_config(&self, org: &str, api_url: &str) -> PathBuf {
        let content = format!(
            r#"
output_directory: "{}"
account:
  organization: "{}"
api_url: "{}"
state_file: "{}"
retention: "30d"
"#,
            self.output_dir.display(),
            org,
            api_url,
            self.state_file.display()
        );
        self.create_test_config(&content)
    }

    /// Write an empty file at `output_dir/name`
    pub fn touch_archive(&self, name: &str) -> PathBuf {
        std::fs::create_dir_all(&self.output_dir).expect("Failed to create output dir");
        let path = self.output_dir.join(name);
        std::fs::write(&path, b"archive").expect("Failed to write archive");
        path
    }

    pub fn output_entries(&self) -> Vec<String> {
        list_names(&self.output_dir)
    }
}

pub fn list_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

/// Repository payload as returned by the GitHub list endpoints
pub fn repo_json(owner: &str, name: &str) -> Value {
    json!({
        "name": name,
        "full_name": format!("{}/{}", owner, name),
        "clone_url": format!("https://github.com/{}/{}.git", owner, name),
        "default_branch": "main",
        "fork": false,
        "private": false
    })
}

/// Branch payload as returned by `/repos/{owner}/{repo}/branches`
pub fn branch_json(name: &str, sha: &str) -> Value {
    json!({
        "name": name,
        "commit": {
            "sha": sha,
            "url": format!("https://api.github.com/repos/acme/lib/commits/{}", sha)
        },
        "protected": false
    })
}

/// How [`FakeMirror`] behaves for a repository
#[derive(Debug, Clone, Copy)]
pub enum MirrorBehavior {
    Succeed,
    Exit(u32),
    Timeout,
    /// Exit 0 without writing the destination
    Empty,
}

/// Mirror double that fakes a bare repository on disk
#[derive(Default)]
pub struct FakeMirror {
    behaviors: HashMap<String, MirrorBehavior>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeMirror {
    pub fn with(mut self, repo: &str, behavior: MirrorBehavior) -> Self {
        self.behaviors.insert(repo.to_string(), behavior);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Mirror for FakeMirror {
    async fn mirror(
        &self,
        url: &str,
        destination: &Path,
        _credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> BackupResult<TransferStatus> {
        self.calls.lock().unwrap().push(url.to_string());

        let behavior = self
            .behaviors
            .iter()
            .find(|(repo, _)| url.ends_with(&format!("/{}.git", repo)))
            .map(|(_, b)| *b)
            .unwrap_or(MirrorBehavior::Succeed);

        if let MirrorBehavior::Empty = behavior {
            return Ok(TransferStatus { exit_code: 0 });
        }

        std::fs::create_dir_all(destination.join("refs").join("heads"))?;
        std::fs::write(destination.join("HEAD"), "ref: refs/heads/main\n")?;

        match behavior {
            MirrorBehavior::Succeed | MirrorBehavior::Empty => Ok(TransferStatus { exit_code: 0 }),
            MirrorBehavior::Exit(code) => Ok(TransferStatus { exit_code: code }),
            MirrorBehavior::Timeout => Err(BackupError::TransferTimeout {
                url: url.to_string(),
                timeout,
            }),
        }
    }
}

/// Progress sink that keeps the printed lines
#[derive(Default)]
pub struct RecordingProgress {
    pub lines: Mutex<Vec<String>>,
}

impl RecordingProgress {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, event: ProgressEvent<'_>) {
        let line = match event {
            ProgressEvent::Started { repo } => format!("Backing up {}..", repo),
            ProgressEvent::Succeeded { repo, .. } => format!("{}: OK", repo),
            ProgressEvent::Skipped { repo } => format!("{}: SKIPPING", repo),
            ProgressEvent::Failed { repo, error } => format!("{}: ERROR ({})", repo, error.kind()),
        };
        self.lines.lock().unwrap().push(line);
    }
}
