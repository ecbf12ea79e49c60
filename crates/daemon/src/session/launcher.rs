//! User-server launcher.
//!
//! Starts a user's dedicated backend by typing a command into the user's
//! terminal, then watches the terminal output for the startup markers
//! defined in [`termshare_protocol::flags`].

use std::path::PathBuf;
use std::time::Duration;

use termshare_protocol::{StartupSignal, UserServerFlags};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

use super::pty::{PtyError, PtyHandle};

/// Environment variable carrying the deployment mode.
pub const ENV_KEY: &str = "TERMSHARE_ENV";

/// Environment variable carrying the session id hash.
pub const SID_HASH_KEY: &str = "TERMSHARE_SID_HASH";

/// Default time the user server has to report startup.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on buffered output while waiting for a marker.
const MAX_SCAN_BUFFER: usize = 64 * 1024;

/// Errors returned by [`UserServerLauncher::launch`].
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The user server printed an error payload, or the terminal closed.
    #[error("user server failed to start: {0}")]
    Failure(String),

    /// No marker appeared before the deadline.
    #[error("user server did not report startup within {0:?}")]
    Timeout(Duration),

    /// The startup command could not be written.
    #[error("failed to write startup command: {0}")]
    Write(#[from] PtyError),
}

/// How to start a user server.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Deployment mode exported as [`ENV_KEY`].
    pub mode: String,
    /// Interpreter or binary that runs the user server.
    pub program: PathBuf,
    /// Entry point passed to `program`.
    pub user_server_path: PathBuf,
    /// Deadline for a startup marker.
    pub startup_timeout: Duration,
    /// Markers to look for.
    pub flags: UserServerFlags,
}

impl LaunchConfig {
    pub fn new(program: impl Into<PathBuf>, user_server_path: impl Into<PathBuf>) -> Self {
        Self {
            mode: "development".to_string(),
            program: program.into(),
            user_server_path: user_server_path.into(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            flags: UserServerFlags::default(),
        }
    }
}

/// Launches user servers inside existing terminals.
#[derive(Debug, Clone)]
pub struct UserServerLauncher {
    config: LaunchConfig,
}

impl UserServerLauncher {
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Builds the command line typed into the terminal.
    ///
    /// The subshell keeps the variables out of the user's shell, and the
    /// trailing `exit` closes the terminal once the user server stops.
    pub fn build_command(&self, sid_hash: &str) -> String {
        format!(
            "({}={} {}={} {} {});exit\n",
            ENV_KEY,
            shell_quote(&self.config.mode),
            SID_HASH_KEY,
            shell_quote(sid_hash),
            shell_quote(&self.config.program.to_string_lossy()),
            shell_quote(&self.config.user_server_path.to_string_lossy()),
        )
    }

    /// Starts the user server in `pty` and waits for it to report.
    ///
    /// Any outcome other than success terminates `pty`. Output dropped
    /// because this subscriber lagged is lost; a marker inside the dropped
    /// chunks is not seen and the launch ends in [`LaunchError::Timeout`].
    pub async fn launch(&self, pty: &PtyHandle, sid_hash: &str) -> Result<(), LaunchError> {
        let mut output = pty.subscribe();
        let command = self.build_command(sid_hash);

        let result = match pty.write(command.as_bytes()) {
            Ok(()) => {
                match tokio::time::timeout(
                    self.config.startup_timeout,
                    scan_output(&mut output, &self.config.flags),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(LaunchError::Timeout(self.config.startup_timeout)),
                }
            }
            Err(e) => Err(LaunchError::Write(e)),
        };
        drop(output);

        match &result {
            Ok(()) => tracing::info!(pid = ?pty.pid(), "User server started"),
            Err(e) => {
                tracing::warn!(pid = ?pty.pid(), error = %e, "User server launch failed");
                if let Err(e) = pty.terminate_if_running() {
                    tracing::warn!(error = %e, "Failed to terminate terminal after launch failure");
                }
            }
        }

        result
    }
}

/// Accumulates output until a marker shows up.
///
/// After a lag the buffer is restarted so text on both sides of the gap is
/// never joined into a marker.
async fn scan_output(
    output: &mut Receiver<Vec<u8>>,
    flags: &UserServerFlags,
) -> Result<(), LaunchError> {
    let mut buffer = String::new();
    loop {
        match output.recv().await {
            Ok(chunk) => {
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                match flags.scan(&buffer) {
                    Some(StartupSignal::Started) => return Ok(()),
                    Some(StartupSignal::Failed(reason)) => {
                        return Err(LaunchError::Failure(reason))
                    }
                    None => trim_front(&mut buffer, MAX_SCAN_BUFFER),
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Launcher lagged behind terminal output");
                buffer.clear();
            }
            Err(RecvError::Closed) => {
                return Err(LaunchError::Failure(
                    "output closed before the user server reported".to_string(),
                ))
            }
        }
    }
}

fn trim_front(buffer: &mut String, max: usize) {
    if buffer.len() <= max {
        return;
    }
    let mut cut = buffer.len() - max;
    while !buffer.is_char_boundary(cut) {
        cut += 1;
    }
    buffer.drain(..cut);
}

fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '+' | ','));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}
