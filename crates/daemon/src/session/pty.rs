//! Process handles backing session users.
//!
//! [`PtyProcess`] is the capability the registry and the launcher consume:
//! write input, observe output, observe exit, terminate. [`PtyHandle`] wraps a
//! process together with the "already exited" guard that keeps a dead process
//! from being killed twice. [`LocalPty`] is the production implementation on
//! top of `portable-pty`.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// Errors that can occur while driving a process handle.
#[derive(Error, Debug)]
pub enum PtyError {
    /// The process has already terminated.
    #[error("process already terminated")]
    AlreadyTerminated,

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the process.
    #[error("failed to kill process: {0}")]
    KillFailed(String),

    /// A lock guarding PTY state was poisoned by a panicking thread.
    #[error("PTY state lock poisoned")]
    LockPoisoned,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyStatus {
    /// The process exited with a code.
    Exited(i32),
    /// The process ended without a usable exit code.
    Terminated,
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Channel capacity for broadcast output.
const BROADCAST_CAPACITY: usize = 256;

/// A controllable process with an output stream and an exit notification.
///
/// Exit is published through a `watch` channel whose value turns from `None`
/// to `Some(status)` exactly once.
pub trait PtyProcess: Send + Sync {
    /// Writes bytes to the process input.
    fn write(&self, data: &[u8]) -> Result<(), PtyError>;

    /// Subscribes to the process output.
    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;

    /// Returns a receiver for the exit notification.
    fn exit_watch(&self) -> watch::Receiver<Option<PtyStatus>>;

    /// Asks the process to terminate.
    fn terminate(&self) -> Result<(), PtyError>;

    /// Process ID, if known.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// The handle stored on a session user.
///
/// Holds the process and the explicit `exited` guard set by the lifecycle
/// watcher on the first exit event.
pub struct PtyHandle {
    process: Arc<dyn PtyProcess>,
    exited: AtomicBool,
}

impl PtyHandle {
    /// Wraps a process in a shareable handle.
    pub fn new(process: Arc<dyn PtyProcess>) -> Arc<Self> {
        Arc::new(Self {
            process,
            exited: AtomicBool::new(false),
        })
    }

    /// Returns the underlying process.
    pub fn process(&self) -> &Arc<dyn PtyProcess> {
        &self.process
    }

    /// Returns the process ID, if known.
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Writes bytes to the process input.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.process.write(data)
    }

    /// Subscribes to the process output.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.process.subscribe()
    }

    /// Returns a receiver for the exit notification.
    pub fn exit_watch(&self) -> watch::Receiver<Option<PtyStatus>> {
        self.process.exit_watch()
    }

    /// Terminates the process unconditionally.
    pub fn terminate(&self) -> Result<(), PtyError> {
        self.process.terminate()
    }

    /// Terminates the process unless it is already known to have exited.
    ///
    /// Returns whether a termination was requested.
    pub fn terminate_if_running(&self) -> Result<bool, PtyError> {
        if self.is_exited() {
            return Ok(false);
        }
        self.process.terminate()?;
        Ok(true)
    }

    /// Records that the process exited.
    ///
    /// Returns `true` only for the first call.
    pub fn mark_exited(&self) -> bool {
        !self.exited.swap(true, Ordering::SeqCst)
    }

    /// Returns whether the process is known to have exited.
    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("pid", &self.pid())
            .field("exited", &self.is_exited())
            .finish()
    }
}

/// A shell running in a local pseudo-terminal.
pub struct LocalPty {
    /// The PTY master handle.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// The writer for the PTY.
    writer: Mutex<Box<dyn Write + Send>>,

    /// Kills the child; the child itself is owned by the wait task.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Broadcast sender for output data.
    output_tx: broadcast::Sender<Vec<u8>>,

    /// Exit notification, set once by the wait task.
    exit_rx: watch::Receiver<Option<PtyStatus>>,

    /// Flag indicating if the process is still running.
    running: Arc<AtomicBool>,

    /// Current terminal size.
    size: Mutex<(u16, u16)>,

    /// Process ID.
    pid: Option<u32>,
}

impl LocalPty {
    /// Spawns a shell in a new PTY and starts its read and wait tasks.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Arguments
    /// * `shell` - Optional shell command. If None, uses $SHELL or /bin/sh.
    /// * `cols` - Terminal width in columns.
    /// * `rows` - Terminal height in rows.
    /// * `env` - Additional environment variables to set.
    /// * `cwd` - Working directory for the process.
    pub fn spawn(
        shell: Option<String>,
        cols: u16,
        rows: u16,
        env: Vec<(String, String)>,
        cwd: Option<String>,
    ) -> Result<Arc<Self>, PtyError> {
        let shell_cmd = detect_shell(shell);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell_cmd);
        if let Some(ref dir) = cwd {
            cmd.cwd(dir);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let pid = child.process_id();
        let killer = child.clone_killer();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let (output_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let running = Arc::new(AtomicBool::new(true));

        let pty = Arc::new(LocalPty {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            output_tx: output_tx.clone(),
            exit_rx,
            running: Arc::clone(&running),
            size: Mutex::new((cols, rows)),
            pid,
        });

        start_read_loop(reader, output_tx, pid);

        let wait_running = Arc::clone(&running);
        tokio::task::spawn_blocking(move || {
            let status = match child.wait() {
                Ok(status) => PtyStatus::Exited(status.exit_code() as i32),
                Err(e) => {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to wait for PTY child");
                    PtyStatus::Terminated
                }
            };
            wait_running.store(false, Ordering::SeqCst);
            tracing::info!(pid = ?pid, status = ?status, "PTY process exited");
            exit_tx.send_replace(Some(status));
        });

        tracing::debug!(pid = ?pid, shell = %shell_cmd, cols, rows, "Spawned PTY");

        Ok(pty)
    }

    /// Returns whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        self.size.lock().map(|size| *size).unwrap_or((0, 0))
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if !self.is_running() {
            return Err(PtyError::AlreadyTerminated);
        }

        let master = self.master.lock().map_err(|_| PtyError::LockPoisoned)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;

        *self.size.lock().map_err(|_| PtyError::LockPoisoned)? = (cols, rows);

        tracing::debug!(pid = ?self.pid, cols, rows, "Resized PTY");
        Ok(())
    }

    /// Returns the number of active output subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.output_tx.receiver_count()
    }
}

impl PtyProcess for LocalPty {
    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if !self.is_running() {
            return Err(PtyError::AlreadyTerminated);
        }

        let mut writer = self.writer.lock().map_err(|_| PtyError::LockPoisoned)?;
        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output_tx.subscribe()
    }

    fn exit_watch(&self) -> watch::Receiver<Option<PtyStatus>> {
        self.exit_rx.clone()
    }

    fn terminate(&self) -> Result<(), PtyError> {
        if !self.is_running() {
            return Err(PtyError::AlreadyTerminated);
        }

        let mut killer = self.killer.lock().map_err(|_| PtyError::LockPoisoned)?;
        killer
            .kill()
            .map_err(|e| PtyError::KillFailed(e.to_string()))?;

        tracing::info!(pid = ?self.pid, "Terminated PTY process");
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Reads PTY output on a blocking thread and fans it out to subscribers.
///
/// The loop ends on EOF or on the first read error, which is what happens
/// once the child exits and the slave side closes.
fn start_read_loop(
    mut reader: Box<dyn Read + Send>,
    output_tx: broadcast::Sender<Vec<u8>>,
    pid: Option<u32>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    tracing::debug!(pid = ?pid, "PTY EOF");
                    break;
                }
                Ok(n) => {
                    if output_tx.send(buffer[..n].to_vec()).is_err() {
                        // No receivers right now; output is dropped
                        tracing::trace!(pid = ?pid, "No receivers for output");
                    }
                }
                Err(e) => {
                    tracing::debug!(pid = ?pid, error = %e, "PTY read ended");
                    break;
                }
            }
        }
    });
}

/// Returns `shell`, else `$SHELL`, else `/bin/sh`.
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell {
        return s;
    }

    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::FakePty;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn wait_for_output(rx: &mut broadcast::Receiver<Vec<u8>>, needle: &str) -> bool {
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Ok(data)) => {
                    if String::from_utf8_lossy(&data).contains(needle) {
                        return true;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) => return false,
                Err(_) => {}
            }
        }
        false
    }

    async fn wait_for_exit(pty: &LocalPty) -> Option<PtyStatus> {
        let mut rx = pty.exit_watch();
        let status = timeout(Duration::from_secs(5), async {
            loop {
                if let Some(status) = *rx.borrow_and_update() {
                    return Some(status);
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow();
                }
            }
        })
        .await;
        status.ok().flatten()
    }

    #[test]
    fn test_detect_shell_with_provided() {
        let shell = detect_shell(Some("/bin/bash".to_string()));
        assert_eq!(shell, "/bin/bash");
    }

    #[test]
    fn test_detect_shell_from_env() {
        let shell = detect_shell(None);
        assert!(!shell.is_empty());
    }

    #[test]
    fn test_handle_mark_exited_once() {
        let handle = PtyHandle::new(Arc::new(FakePty::new()));
        assert!(!handle.is_exited());
        assert!(handle.mark_exited());
        assert!(!handle.mark_exited());
        assert!(handle.is_exited());
    }

    #[test]
    fn test_terminate_if_running_skips_exited() {
        let fake = Arc::new(FakePty::new());
        let handle = PtyHandle::new(fake.clone());

        handle.mark_exited();
        assert!(!handle.terminate_if_running().unwrap());
        assert_eq!(fake.terminate_count(), 0);
    }

    #[test]
    fn test_terminate_if_running() {
        let fake = Arc::new(FakePty::new());
        let handle = PtyHandle::new(fake.clone());

        assert!(handle.terminate_if_running().unwrap());
        assert_eq!(fake.terminate_count(), 1);
    }

    #[tokio::test]
    async fn test_local_pty_spawn() {
        let pty = LocalPty::spawn(Some("/bin/sh".to_string()), 80, 24, vec![], None)
            .expect("spawn /bin/sh");

        assert!(pty.is_running());
        assert_eq!(pty.size(), (80, 24));
        assert!(pty.pid().is_some());

        let _ = pty.terminate();
    }

    #[tokio::test]
    async fn test_local_pty_output_broadcast() {
        let pty = LocalPty::spawn(Some("/bin/sh".to_string()), 80, 24, vec![], None).unwrap();
        let mut rx = pty.subscribe();

        pty.write(b"echo test_output_marker\n").unwrap();

        assert!(
            wait_for_output(&mut rx, "test_output_marker").await,
            "Did not receive expected output"
        );

        let _ = pty.terminate();
    }

    #[tokio::test]
    async fn test_local_pty_env_vars() {
        let env = vec![("TEST_VAR".to_string(), "test_value".to_string())];
        let pty = LocalPty::spawn(Some("/bin/sh".to_string()), 80, 24, env, None).unwrap();
        let mut rx = pty.subscribe();

        pty.write(b"echo $TEST_VAR\n").unwrap();

        assert!(
            wait_for_output(&mut rx, "test_value").await,
            "Did not receive expected environment variable value"
        );

        let _ = pty.terminate();
    }

    #[tokio::test]
    async fn test_local_pty_resize() {
        let pty = LocalPty::spawn(Some("/bin/sh".to_string()), 80, 24, vec![], None).unwrap();

        pty.resize(120, 40).unwrap();
        assert_eq!(pty.size(), (120, 40));

        let _ = pty.terminate();
    }

    #[tokio::test]
    async fn test_local_pty_exit_notification() {
        let pty = LocalPty::spawn(Some("/bin/sh".to_string()), 80, 24, vec![], None).unwrap();

        pty.write(b"exit 42\n").unwrap();

        let status = wait_for_exit(&pty).await;
        assert_eq!(status, Some(PtyStatus::Exited(42)));
        assert!(!pty.is_running());
    }

    #[tokio::test]
    async fn test_local_pty_terminate_fires_exit() {
        let pty = LocalPty::spawn(Some("/bin/sh".to_string()), 80, 24, vec![], None).unwrap();

        pty.terminate().unwrap();

        assert!(wait_for_exit(&pty).await.is_some());
        assert!(!pty.is_running());
    }

    #[tokio::test]
    async fn test_local_pty_write_after_exit() {
        let pty = LocalPty::spawn(Some("/bin/sh".to_string()), 80, 24, vec![], None).unwrap();

        pty.terminate().unwrap();
        wait_for_exit(&pty).await;

        let result = pty.write(b"hello\n");
        assert!(matches!(result, Err(PtyError::AlreadyTerminated)));
        assert!(matches!(pty.terminate(), Err(PtyError::AlreadyTerminated)));
    }
}
