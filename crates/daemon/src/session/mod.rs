//! Session management module.
//!
//! This module provides the session registry and the pieces around it:
//! terminal processes, exit watching, claim tokens, session identifiers and
//! the user-server launcher.

pub mod id;
pub mod launcher;
pub mod pty;
pub mod registry;
pub mod token;
mod watcher;

#[cfg(test)]
pub(crate) mod fake;

pub use id::{random_token, sid_hash, SessionId, SessionIdGenerator, SORT_TIME_EPOCH_MS};
pub use launcher::{LaunchConfig, LaunchError, UserServerLauncher, ENV_KEY, SID_HASH_KEY};
pub use pty::{detect_shell, LocalPty, PtyError, PtyHandle, PtyProcess, PtyStatus};
pub use registry::{RegistryError, SessionRecord, SessionRegistry, UserRecord};
pub use token::{ClaimedBinding, TokenBroker, TokenError, TokenWaiter, DEFAULT_TOKEN_DEADLINE};
