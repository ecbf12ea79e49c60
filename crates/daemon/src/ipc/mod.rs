//! Unix Domain Socket IPC module for CLI-daemon communication.
//!
//! The daemon exposes its registry operations over a local socket so the CLI
//! (and a supervising process) can open sessions, attach users, issue and
//! claim tokens, and list sessions.
//!
//! ## Overview
//!
//! The IPC system uses a JSON newline-delimited protocol. Each message is a
//! single JSON object followed by a newline.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/termshare/daemon.sock`
//! - Fallback: `/tmp/termshare-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use termshare_daemon::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/termshare/daemon.sock`
/// 2. Otherwise: `/tmp/termshare-$UID/daemon.sock`
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("termshare")
            .join("daemon.sock")
    } else {
        // Owner of /proc/self is the current user
        let uid = std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0);

        PathBuf::from(format!("/tmp/termshare-{}", uid)).join("daemon.sock")
    }
}
