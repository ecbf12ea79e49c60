//! Termshare Daemon
//!
//! Session and process-lifecycle registry for shared terminals.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use termshare_daemon::config::Config;
use termshare_daemon::ipc::{
    get_daemon_pid, get_pid_file_path, get_socket_path, is_daemon_running, IpcClient, IpcResponse,
};
use termshare_daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use termshare_protocol::{Metadata, RegistrySnapshot};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Termshare Daemon - session registry for shared terminals.
#[derive(Parser, Debug)]
#[command(name = "termshare-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the termshare daemon
    Start,

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Issue a single-use claim token for a user of a session
    Invite {
        /// Session ID
        sid: String,
        /// Username the claimer acts as
        username: String,
    },

    /// Redeem a claim token
    Claim {
        /// Token printed by `invite`
        token: String,
    },
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Open a new session with its first user
    Open {
        /// Username of the first user
        username: String,

        /// Session metadata as KEY=VALUE (VALUE may be JSON)
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        meta: Vec<String>,
    },

    /// Add a user to an existing session
    Join {
        /// Session ID
        sid: String,

        /// Username to add
        username: String,

        /// User metadata as KEY=VALUE (VALUE may be JSON)
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        meta: Vec<String>,
    },

    /// Remove a user from a session and terminate its terminal
    Remove {
        /// Session ID
        sid: String,

        /// Username to remove
        username: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = init_tracing(&config, cli.verbose)?;
    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Start => {
            if is_daemon_running() {
                let pid = get_daemon_pid().unwrap_or(0);
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  termshare-daemon stop");
                std::process::exit(1);
            }

            let orchestrator = Arc::new(DaemonOrchestrator::new(config)?);
            run_headless(&orchestrator).await?;
        }
        Commands::Stop { force, timeout } => {
            tracing::info!("Stopping daemon (force: {})", force);

            let result = if force {
                force_stop_daemon()
            } else {
                graceful_stop_daemon(timeout).await
            };
            match result {
                Ok(()) => println!("Daemon stopped successfully"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {:#}", e);
                    if !force {
                        eprintln!("Try: termshare-daemon stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match connect().await?.status().await? {
            IpcResponse::Status {
                running,
                uptime_secs,
                session_count,
                user_count,
                pending_tokens,
            } => {
                println!(
                    "Daemon Status: {}",
                    if running { "running" } else { "stopped" }
                );
                println!("  Uptime:   {}", format_duration(uptime_secs));
                println!("  Sessions: {}", session_count);
                println!("  Users:    {}", user_count);
                println!("  Tokens:   {}", pending_tokens);
            }
            other => fail(other),
        },
        Commands::Sessions(cmd) => match cmd {
            SessionsCommands::List { json } => {
                let sessions = connect().await?.list_sessions().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&sessions)?);
                } else {
                    print_sessions_table(&sessions);
                }
            }
            SessionsCommands::Open { username, meta } => {
                let metadata = parse_metadata(&meta)?;
                match connect().await?.open_session(&username, metadata).await? {
                    IpcResponse::SessionOpened { sid, .. } => println!("{}", sid),
                    other => fail(other),
                }
            }
            SessionsCommands::Join {
                sid,
                username,
                meta,
            } => {
                let metadata = parse_metadata(&meta)?;
                match connect().await?.join_session(&sid, &username, metadata).await? {
                    IpcResponse::UserJoined { sid, username, .. } => {
                        println!("{} joined {}", username, sid)
                    }
                    other => fail(other),
                }
            }
            SessionsCommands::Remove { sid, username } => {
                match connect().await?.remove_user(&sid, &username).await? {
                    IpcResponse::UserRemoved { removed: true, .. } => {
                        println!("Removed {} from {}", username, sid)
                    }
                    IpcResponse::UserRemoved { removed: false, .. } => {
                        eprintln!("No user {} in session {}", username, sid);
                        std::process::exit(1);
                    }
                    other => fail(other),
                }
            }
        },
        Commands::Invite { sid, username } => {
            match connect().await?.invite(&sid, &username).await? {
                IpcResponse::Invited {
                    token,
                    expires_in_secs,
                } => {
                    println!("{}", token);
                    eprintln!("Expires in {} seconds", expires_in_secs);
                }
                other => fail(other),
            }
        }
        Commands::Claim { token } => match connect().await?.claim(&token).await? {
            IpcResponse::Claimed { sid, username } => println!("{} {}", sid, username),
            other => fail(other),
        },
    }

    Ok(())
}

/// Initializes logging to stderr and, when configured, to a log file.
///
/// Stdout is left free for supervisor notifications.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let (file_layer, guard) = match config.daemon.log_path() {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Parses `KEY=VALUE` pairs; values that are not valid JSON become strings.
fn parse_metadata(pairs: &[String]) -> anyhow::Result<Option<Metadata>> {
    if pairs.is_empty() {
        return Ok(None);
    }

    let mut metadata = Metadata::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected KEY=VALUE, got {:?}", pair))?;
        if key.is_empty() {
            anyhow::bail!("Metadata key must not be empty: {:?}", pair);
        }
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        metadata.insert(key.to_string(), value);
    }
    Ok(Some(metadata))
}

async fn connect() -> anyhow::Result<IpcClient> {
    IpcClient::connect(&get_socket_path())
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Reports an error or unexpected response and exits.
fn fail(response: IpcResponse) -> ! {
    match response {
        IpcResponse::Error { message } => eprintln!("Error: {}", message),
        other => eprintln!("Unexpected response from daemon: {:?}", other),
    }
    std::process::exit(1);
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &RegistrySnapshot) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_width = sessions.keys().map(|id| id.len()).max().unwrap_or(8).max(8);

    println!("{:<id_width$}  {:>5}  USERS", "ID", "COUNT", id_width = id_width);
    println!("{}", "-".repeat(id_width + 20));

    for (sid, session) in sessions {
        let users: Vec<&str> = session.user_map.keys().map(String::as_str).collect();
        println!(
            "{:<id_width$}  {:>5}  {}",
            sid,
            users.len(),
            truncate_str(&users.join(", "), 48),
            id_width = id_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Gracefully stop the daemon via IPC and wait for it to exit.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = connect().await?;

    println!("Sending shutdown request...");

    client.set_timeout(Duration::from_secs(timeout_secs));
    match client.stop().await.context("Failed to send stop request")? {
        IpcResponse::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists()
            || IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
                .await
                .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Force stop the daemon using SIGKILL.
fn force_stop_daemon() -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = get_daemon_pid().context("No running daemon found")?;
    let raw = i32::try_from(pid).with_context(|| format!("Invalid PID {}", pid))?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;

    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(get_pid_file_path());
    let _ = std::fs::remove_file(get_socket_path());

    Ok(())
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Run the daemon until a signal or an IPC stop request.
async fn run_headless(orchestrator: &Arc<DaemonOrchestrator>) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::SessionOpened { sid } => {
                    tracing::debug!(sid = %sid, "Session opened");
                }
                OrchestratorEvent::UserRemoved { sid, username } => {
                    tracing::debug!(sid = %sid, username = %username, "User removed");
                }
            }
        }
    });

    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        _ = orchestrator.wait_for_shutdown() => {}
    }

    orchestrator.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}
