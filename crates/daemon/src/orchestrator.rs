//! Daemon orchestrator for wiring together all components.
//!
//! The `DaemonOrchestrator` owns the session registry, the claim-token broker,
//! the optional user-server launcher and the session id generator. It serves
//! the IPC control socket and forwards user removals to the supervisor.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use termshare_protocol::{Metadata, RegistrySnapshot, SessionView, SupervisorEvent, UserView};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ipc::{self, pidfile, IpcRequest, IpcResponse, IpcServer};
use crate::session::{
    random_token, sid_hash, ClaimedBinding, LocalPty, PtyHandle, RegistryError, SessionId,
    SessionIdGenerator, SessionRegistry, TokenBroker, TokenError, UserServerLauncher,
};

/// How long `stop` waits for background tasks.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting requests.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A session was created.
    SessionOpened { sid: SessionId },
    /// A user left a session.
    UserRemoved { sid: SessionId, username: String },
}

/// Point-in-time daemon counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub session_count: usize,
    pub user_count: usize,
    pub pending_tokens: usize,
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Sessions and their users.
    registry: Arc<SessionRegistry>,
    /// Pending claim tokens.
    tokens: Arc<TokenBroker>,
    /// Starts user servers; absent when none is configured.
    launcher: Option<UserServerLauncher>,
    /// Session id source for this daemon run.
    ids: SessionIdGenerator,
    /// Control socket location.
    socket_path: PathBuf,
    /// PID file location.
    pid_path: PathBuf,
    /// Construction time, for uptime.
    started_at: Instant,
    /// Background tasks started by `start`.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cancelled by `stop`, after every user has been removed.
    shutdown_token: CancellationToken,
    /// Cancelled by an IPC `Stop`; the owner then calls `stop`.
    stop_requested: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        let launcher = config
            .launcher
            .launch_config()?
            .map(UserServerLauncher::new);
        match &launcher {
            Some(launcher) => info!(
                user_server = %launcher.config().user_server_path.display(),
                mode = %launcher.config().mode,
                "User-server launching enabled"
            ),
            None => info!("No user server configured; sessions run plain shells"),
        }

        let tokens = Arc::new(TokenBroker::new(config.token.deadline()));
        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry: Arc::new(SessionRegistry::new()),
            tokens,
            launcher,
            ids: SessionIdGenerator::new(),
            socket_path: ipc::get_socket_path(),
            pid_path: pidfile::get_pid_file_path(),
            started_at: Instant::now(),
            tasks: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            event_tx,
        })
    }

    /// Overrides the control socket path.
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Overrides the PID file path.
    pub fn with_pid_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_path = path.into();
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the token broker.
    pub fn tokens(&self) -> &Arc<TokenBroker> {
        &self.tokens
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Starts the supervisor forwarder and the IPC server, and writes the
    /// PID file.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Orchestrator cannot be restarted after shutdown");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        if let Err(e) = self.start_tasks().await {
            *self.state.write().await = OrchestratorState::Stopped;
            self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    async fn start_tasks(self: &Arc<Self>) -> Result<()> {
        if let Some(pid) = pidfile::read_pid(&self.pid_path) {
            if pid != std::process::id() {
                anyhow::bail!("Daemon is already running with PID {}", pid);
            }
        }

        let server = IpcServer::bind(&self.socket_path)
            .await
            .with_context(|| format!("Failed to bind IPC socket: {}", self.socket_path.display()))?;
        info!("Listening on {:?}", self.socket_path);

        pidfile::write_pid_file(&self.pid_path)
            .with_context(|| format!("Failed to write PID file: {}", self.pid_path.display()))?;

        let forwarder = tokio::spawn(Self::forward_supervisor_events(
            self.registry.subscribe(),
            self.event_tx.clone(),
            self.config.supervisor.notify_stdout,
            self.shutdown_token.clone(),
        ));
        debug!("Started supervisor forwarder");

        let this = Arc::clone(self);
        let handler = move |request: IpcRequest| {
            let this = Arc::clone(&this);
            async move { this.handle_request(request).await }
        };
        let ipc_task = tokio::spawn(server.serve(handler, self.shutdown_token.clone()));

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(forwarder);
            tasks.push(ipc_task);
        }
        Ok(())
    }

    /// Relays registry removals as orchestrator events and, optionally, as
    /// JSON lines on stdout.
    async fn forward_supervisor_events(
        mut events: broadcast::Receiver<SupervisorEvent>,
        event_tx: broadcast::Sender<OrchestratorEvent>,
        notify_stdout: bool,
        shutdown_token: CancellationToken,
    ) {
        let relay = |event: SupervisorEvent| {
            if notify_stdout {
                match event.to_json_line() {
                    Ok(line) => {
                        use std::io::Write;
                        let mut stdout = std::io::stdout().lock();
                        let _ = stdout.write_all(line.as_bytes());
                        let _ = stdout.flush();
                    }
                    Err(e) => warn!("Failed to encode supervisor event: {}", e),
                }
            }
            let SupervisorEvent::RemoveUser { sid, username } = event;
            let _ = event_tx.send(OrchestratorEvent::UserRemoved { sid, username });
        };

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    while let Ok(event) = events.try_recv() {
                        relay(event);
                    }
                    debug!("Supervisor forwarder received shutdown signal");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => relay(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Supervisor forwarder lagged; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Removes every user (terminating their terminals), stops background
    /// tasks and removes the PID file and socket.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        let removed = self.registry.clear();
        debug!(removed, "Removed all users");

        self.shutdown_token.cancel();

        let tasks = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        for task in tasks {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }

        pidfile::remove_pid_file(&self.pid_path);
        let _ = std::fs::remove_file(&self.socket_path);

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Waits until a stop is requested over IPC or `stop` has run.
    ///
    /// Background tasks keep running; the caller is expected to call `stop`.
    pub async fn wait_for_shutdown(&self) {
        tokio::select! {
            _ = self.stop_requested.cancelled() => {}
            _ = self.shutdown_token.cancelled() => {}
        }
    }

    /// Creates a session whose first user runs in a new terminal.
    ///
    /// When a user server is configured it is started in that terminal; a
    /// launch failure is returned and the terminal's exit removes the user.
    pub async fn open_session(
        &self,
        username: &str,
        metadata: Option<Metadata>,
    ) -> Result<(SessionId, SessionView)> {
        let sid = self.ids.generate();
        let pty = self.spawn_terminal()?;

        let view = match self
            .registry
            .create_session(&sid, metadata, username, None, Arc::clone(&pty))
        {
            Ok(view) => view,
            Err(e) => {
                terminate_rejected(&pty);
                return Err(e.into());
            }
        };
        self.emit_event(OrchestratorEvent::SessionOpened { sid: sid.clone() });

        self.launch_user_server(&sid, username, &pty).await?;
        Ok((sid, view))
    }

    /// Attaches a user with a new terminal to an existing session.
    pub async fn join_session(
        &self,
        sid: &str,
        username: &str,
        metadata: Option<Metadata>,
    ) -> Result<UserView> {
        if !self.registry.contains_session(sid) {
            return Err(RegistryError::SessionNotFound(sid.to_string()).into());
        }
        let pty = self.spawn_terminal()?;

        let view = match self
            .registry
            .add_user(sid, username, metadata, Arc::clone(&pty))
        {
            Ok(view) => view,
            Err(e) => {
                terminate_rejected(&pty);
                return Err(e.into());
            }
        };

        self.launch_user_server(sid, username, &pty).await?;
        Ok(view)
    }

    /// Removes a user; returns whether it existed.
    pub fn remove_user(&self, sid: &str, username: &str) -> bool {
        self.registry.remove_user(sid, username)
    }

    /// Issues a claim token for `(sid, username)`.
    pub fn invite(&self, sid: &str, username: &str) -> Result<String> {
        if !self.registry.contains_session(sid) {
            return Err(RegistryError::SessionNotFound(sid.to_string()).into());
        }

        let token = random_token();
        let waiter = self.tokens.issue(sid, username, token.clone())?;

        let sid = sid.to_string();
        let username = username.to_string();
        tokio::spawn(async move {
            match waiter.wait().await {
                Ok(()) => info!(sid = %sid, username = %username, "Invitation claimed"),
                Err(e) => info!(sid = %sid, username = %username, reason = %e, "Invitation lapsed"),
            }
        });

        Ok(token)
    }

    /// Redeems a claim token.
    pub fn claim(&self, token: &str) -> Result<ClaimedBinding, TokenError> {
        self.tokens.claim(token)
    }

    /// Returns current counters.
    pub async fn status(&self) -> DaemonStatus {
        DaemonStatus {
            running: self.state().await == OrchestratorState::Running,
            uptime_secs: self.started_at.elapsed().as_secs(),
            session_count: self.registry.session_count(),
            user_count: self.registry.total_users(),
            pending_tokens: self.tokens.pending_count(),
        }
    }

    /// Returns a snapshot of every session.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot_all()
    }

    /// Answers one control request.
    pub async fn handle_request(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => {
                let status = self.status().await;
                IpcResponse::Status {
                    running: status.running,
                    uptime_secs: status.uptime_secs,
                    session_count: status.session_count,
                    user_count: status.user_count,
                    pending_tokens: status.pending_tokens,
                }
            }
            IpcRequest::Stop => {
                info!("Stop requested over IPC");
                self.stop_requested.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.snapshot(),
            },
            IpcRequest::OpenSession { username, metadata } => {
                match self.open_session(&username, metadata).await {
                    Ok((sid, session)) => IpcResponse::SessionOpened { sid, session },
                    Err(e) => IpcResponse::error(format!("{:#}", e)),
                }
            }
            IpcRequest::JoinSession {
                sid,
                username,
                metadata,
            } => match self.join_session(&sid, &username, metadata).await {
                Ok(user) => IpcResponse::UserJoined {
                    sid,
                    username,
                    user,
                },
                Err(e) => IpcResponse::error(format!("{:#}", e)),
            },
            IpcRequest::RemoveUser { sid, username } => {
                let removed = self.remove_user(&sid, &username);
                IpcResponse::UserRemoved {
                    sid,
                    username,
                    removed,
                }
            }
            IpcRequest::Invite { sid, username } => match self.invite(&sid, &username) {
                Ok(token) => IpcResponse::Invited {
                    token,
                    expires_in_secs: self.tokens.deadline().as_secs(),
                },
                Err(e) => IpcResponse::error(format!("{:#}", e)),
            },
            IpcRequest::Claim { token } => match self.claim(&token) {
                Ok(binding) => IpcResponse::Claimed {
                    sid: binding.sid,
                    username: binding.username,
                },
                Err(e) => IpcResponse::error(e),
            },
        }
    }

    fn spawn_terminal(&self) -> Result<Arc<PtyHandle>> {
        let local = LocalPty::spawn(
            Some(self.config.session.default_shell.clone()),
            self.config.session.cols,
            self.config.session.rows,
            Vec::new(),
            None,
        )
        .context("Failed to spawn terminal")?;
        Ok(PtyHandle::new(local))
    }

    async fn launch_user_server(
        &self,
        sid: &str,
        username: &str,
        pty: &PtyHandle,
    ) -> Result<()> {
        let Some(launcher) = &self.launcher else {
            return Ok(());
        };
        launcher
            .launch(pty, &sid_hash(sid))
            .await
            .with_context(|| format!("Failed to start user server for {} in {}", username, sid))
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Terminates a terminal the registry refused to take.
fn terminate_rejected(pty: &PtyHandle) {
    if let Err(e) = pty.terminate() {
        warn!(pid = ?pty.pid(), error = %e, "Failed to terminate rejected terminal");
    }
}
