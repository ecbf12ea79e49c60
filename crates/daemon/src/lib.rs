//! # Termshare Daemon Library
//!
//! Session and process-lifecycle registry for a terminal-sharing service.
//!
//! ## Overview
//!
//! The daemon keeps track of shared terminal sessions, the users attached to
//! each of them and the pseudo-terminal process that backs every user. It
//! provides:
//!
//! - **Session Registry**: sessions keyed by sortable random ids, per-user
//!   records and free-form metadata ([`session::SessionRegistry`])
//! - **Lifecycle Watching**: a user is removed as soon as its terminal exits
//! - **Claim Tokens**: single-use tokens that resolve to a `(sid, username)`
//!   binding or expire ([`session::TokenBroker`])
//! - **User Server Launching**: starts the per-user backend inside a terminal
//!   and waits for its start or error marker ([`session::UserServerLauncher`])
//! - **Control Socket**: newline-delimited JSON over a Unix socket ([`ipc`])
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Daemon Orchestrator                    │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │   Session    │  │    Token     │  │  User Server   │  │
//! │  │   Registry   │  │    Broker    │  │    Launcher    │  │
//! │  └──────┬───────┘  └──────────────┘  └────────────────┘  │
//! │         │ exit watchers                                   │
//! │  ┌──────┴───────────────────────────────────────────────┐ │
//! │  │                 PTY handles                          │ │
//! │  └──────────────────────────────────────────────────────┘ │
//! │  ┌───────────────────┐  ┌──────────────────────────────┐  │
//! │  │    IPC server     │  │   Supervisor notifications   │  │
//! │  └───────────────────┘  └──────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use termshare_daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let orchestrator = Arc::new(DaemonOrchestrator::new(config)?);
//!     orchestrator.start().await?;
//!
//!     let (sid, _view) = orchestrator.open_session("alice", None).await?;
//!     println!("opened {sid}");
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, env overrides and validation
//! - [`session`]: Ids, registry, exit watching, tokens, launcher and PTYs
//! - [`ipc`]: Control socket, client and pid file
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod ipc;
pub mod orchestrator;
pub mod session;

// Re-export protocol for convenience
pub use termshare_protocol;

pub use config::Config;

pub use session::{
    ClaimedBinding, LaunchConfig, LaunchError, PtyHandle, RegistryError, SessionId,
    SessionIdGenerator, SessionRegistry, TokenBroker, TokenError, UserServerLauncher,
};

pub use orchestrator::{DaemonOrchestrator, DaemonStatus, OrchestratorEvent, OrchestratorState};
