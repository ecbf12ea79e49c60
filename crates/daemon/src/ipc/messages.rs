//! IPC message types for CLI-daemon communication.
//!
//! This module defines the request and response types used for communication
//! between the CLI and the daemon over Unix Domain Sockets.

use serde::{Deserialize, Serialize};
use termshare_protocol::{Metadata, RegistrySnapshot, SessionView, UserView};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// Snapshot every session.
    ListSessions,
    /// Create a session whose first user is `username`.
    OpenSession {
        username: String,
        #[serde(default)]
        metadata: Option<Metadata>,
    },
    /// Attach `username` to an existing session.
    JoinSession {
        sid: String,
        username: String,
        #[serde(default)]
        metadata: Option<Metadata>,
    },
    /// Remove a user and terminate its terminal.
    RemoveUser { sid: String, username: String },
    /// Issue a claim token for `(sid, username)`.
    Invite { sid: String, username: String },
    /// Redeem a claim token.
    Claim { token: String },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of live sessions.
        session_count: usize,
        /// Number of users across all sessions.
        user_count: usize,
        /// Number of unclaimed tokens.
        pending_tokens: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// Snapshot of every session keyed by id.
    Sessions { sessions: RegistrySnapshot },
    /// A session was created.
    SessionOpened { sid: String, session: SessionView },
    /// A user joined a session.
    UserJoined {
        sid: String,
        username: String,
        user: UserView,
    },
    /// Outcome of a removal request.
    UserRemoved {
        sid: String,
        username: String,
        /// Whether the user existed.
        removed: bool,
    },
    /// A claim token was issued.
    Invited {
        token: String,
        /// Seconds until the token expires.
        expires_in_secs: u64,
    },
    /// A token was claimed.
    Claimed { sid: String, username: String },
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

impl IpcResponse {
    /// Builds an error response from anything printable.
    pub fn error(message: impl std::fmt::Display) -> Self {
        IpcResponse::Error {
            message: message.to_string(),
        }
    }
}
