//! Mirror transfer - runs `git clone --mirror` under a pseudo-terminal
//!
//! git asks for credentials on the terminal rather than reading them from the URL or
//! a header, so the clone runs attached to a PTY. Output is read on a dedicated thread
//! and forwarded over a channel; the async side drives a small handshake state machine
//! over that stream:
//!
//! ```text
//! AwaitPromptOrEof -> SendUsername -> AwaitPasswordPrompt -> SendPassword -> AwaitEof
//! ```
//!
//! Each waiting phase has its own timeout budget. When a budget runs out the child is
//! killed and the transfer fails with [`BackupError::TransferTimeout`].

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::catalog::Credentials;
use crate::error::{BackupError, BackupResult};

/// Ceiling for each waiting phase of a transfer
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

const USERNAME_PROMPT: &str = "Username for";
const PASSWORD_PROMPT: &str = "Password for";
const READ_BUFFER_SIZE: usize = 8192;

/// Exit status of a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatus {
    pub exit_code: u32,
}

impl TransferStatus {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Anything that can produce a full mirror of a remote repository in a directory
#[async_trait]
pub trait Mirror: Send + Sync {
    async fn mirror(
        &self,
        url: &str,
        destination: &Path,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> BackupResult<TransferStatus>;
}

/// Credential handshake states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitPromptOrEof,
    SendUsername,
    AwaitPasswordPrompt,
    SendPassword,
    AwaitEof,
}

/// Why the handshake cannot continue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    /// The remote prompted but there is nothing to answer with
    CredentialsRequired,
    /// The remote prompted again after credentials were sent
    CredentialsRejected,
}

/// Prompt matcher over the child's output
#[derive(Debug)]
pub struct Handshake<'a> {
    state: HandshakeState,
    credentials: Option<&'a Credentials>,
}

impl<'a> Handshake<'a> {
    pub fn new(credentials: Option<&'a Credentials>) -> Self {
        Self {
            state: HandshakeState::AwaitPromptOrEof,
            credentials,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Feed the output seen since the last transition. Returns true when the state
    /// changed, in which case the caller discards that output.
    pub fn observe(&mut self, output: &str) -> Result<bool, HandshakeError> {
        let next = match self.state {
            HandshakeState::AwaitPromptOrEof => {
                if output.contains(USERNAME_PROMPT) {
                    self.require_credentials()?;
                    HandshakeState::SendUsername
                } else if output.contains(PASSWORD_PROMPT) {
                    // username already embedded in the URL
                    self.require_credentials()?;
                    HandshakeState::SendPassword
                } else {
                    return Ok(false);
                }
            }
            HandshakeState::AwaitPasswordPrompt => {
                if output.contains(PASSWORD_PROMPT) {
                    HandshakeState::SendPassword
                } else {
                    return Ok(false);
                }
            }
            HandshakeState::AwaitEof => {
                if output.contains(USERNAME_PROMPT) || output.contains(PASSWORD_PROMPT) {
                    return Err(HandshakeError::CredentialsRejected);
                }
                return Ok(false);
            }
            HandshakeState::SendUsername | HandshakeState::SendPassword => return Ok(false),
        };

        self.state = next;
        Ok(true)
    }

    /// Line to write for a `Send*` state, advancing to the following wait state
    pub fn take_reply(&mut self) -> Option<String> {
        let credentials = self.credentials?;
        match self.state {
            HandshakeState::SendUsername => {
                self.state = HandshakeState::AwaitPasswordPrompt;
                Some(format!("{}\n", credentials.username))
            }
            HandshakeState::SendPassword => {
                self.state = HandshakeState::AwaitEof;
                Some(format!("{}\n", credentials.password))
            }
            _ => None,
        }
    }

    fn require_credentials(&self) -> Result<(), HandshakeError> {
        match self.credentials {
            Some(_) => Ok(()),
            None => Err(HandshakeError::CredentialsRequired),
        }
    }
}

/// Output of the PTY reader thread
#[derive(Debug)]
enum PtyEvent {
    Data(Vec<u8>),
    Eof,
}

/// `git clone --mirror` driven over a pseudo-terminal
#[derive(Debug, Clone)]
pub struct MirrorTransfer {
    git_program: String,
}

impl Default for MirrorTransfer {
    fn default() -> Self {
        Self::new("git")
    }
}

impl MirrorTransfer {
    pub fn new(git_program: impl Into<String>) -> Self {
        Self {
            git_program: git_program.into(),
        }
    }

    fn clone_command(&self, url: &str, destination: &Path) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.git_program);
        cmd.args(["clone", "--quiet", "--mirror", url]);
        cmd.arg(destination.as_os_str());
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd
    }

    /// Run an arbitrary command through the credential handshake.
    ///
    /// `label` names the transfer in errors and logs (normally the clone URL).
    pub async fn run(
        &self,
        cmd: CommandBuilder,
        label: &str,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> BackupResult<TransferStatus> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BackupError::Spawn(format!("Failed to create PTY: {}", e)))?;

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BackupError::Spawn(format!("Failed to spawn transfer: {}", e)))?;

        // Our copy of the slave side must go, otherwise the reader never sees EOF
        drop(pair.slave);

        let master = pair.master;
        let reader = master
            .try_clone_reader()
            .map_err(|e| BackupError::Spawn(format!("Failed to open PTY reader: {}", e)))?;
        let mut writer = master
            .take_writer()
            .map_err(|e| BackupError::Spawn(format!("Failed to open PTY writer: {}", e)))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        thread::spawn(move || pump_output(reader, tx));

        debug!("Transfer started: {}", label);

        let mut handshake = Handshake::new(credentials);
        let mut transcript = String::new();
        let mut deadline = Instant::now() + timeout;

        loop {
            if let Some(reply) = handshake.take_reply() {
                debug!("Answering credential prompt for {}", label);
                let written = writer
                    .write_all(reply.as_bytes())
                    .and_then(|_| writer.flush());
                if let Err(e) = written {
                    terminate(child).await;
                    return Err(BackupError::Io(e));
                }
                deadline = Instant::now() + timeout;
                continue;
            }

            let event = match timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => PtyEvent::Eof,
                Err(_) => {
                    warn!(
                        "Transfer of {} timed out in state {:?}, terminating",
                        label,
                        handshake.state()
                    );
                    terminate(child).await;
                    return Err(BackupError::TransferTimeout {
                        url: label.to_string(),
                        timeout,
                    });
                }
            };

            match event {
                PtyEvent::Data(bytes) => {
                    transcript.push_str(&String::from_utf8_lossy(&bytes));
                    match handshake.observe(&transcript) {
                        Ok(true) => transcript.clear(),
                        Ok(false) => {}
                        Err(HandshakeError::CredentialsRequired) => {
                            terminate(child).await;
                            return Err(BackupError::CredentialsRequired {
                                url: label.to_string(),
                            });
                        }
                        Err(HandshakeError::CredentialsRejected) => {
                            terminate(child).await;
                            return Err(BackupError::Auth(format!(
                                "Credentials rejected while mirroring {}",
                                label
                            )));
                        }
                    }
                }
                PtyEvent::Eof => break,
            }
        }

        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .map_err(|e| BackupError::Spawn(format!("Transfer wait task failed: {}", e)))??;

        drop(master);

        let status = TransferStatus {
            exit_code: status.exit_code(),
        };
        debug!("Transfer of {} exited with {}", label, status.exit_code);
        Ok(status)
    }
}

#[async_trait]
impl Mirror for MirrorTransfer {
    async fn mirror(
        &self,
        url: &str,
        destination: &Path,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> BackupResult<TransferStatus> {
        info!("Mirroring {} -> {}", url, destination.display());
        let cmd = self.clone_command(url, destination);
        self.run(cmd, url, credentials, timeout).await
    }
}

/// Forward PTY output until EOF. Linux reports a closed slave as EIO, which is
/// treated the same as EOF.
fn pump_output(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<PtyEvent>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                trace!(bytes = n, "Read transfer output");
                if tx.send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("PTY read ended: {}", e);
                break;
            }
        }
    }

    let _ = tx.send(PtyEvent::Eof);
}

/// Kill and reap the child
async fn terminate(mut child: Box<dyn Child + Send + Sync>) {
    if let Err(e) = child.kill() {
        debug!("Failed to kill transfer process: {}", e);
    }
    let _ = tokio::task::spawn_blocking(move || child.wait()).await;
}
