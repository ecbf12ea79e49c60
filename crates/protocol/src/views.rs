//! Public, detached views of registry state.
//!
//! Views are plain owned data: they carry metadata and the per-session user
//! map but never a process handle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form metadata attached to sessions and users.
pub type Metadata = serde_json::Map<String, Value>;

/// Reserved session key under which the user map is exposed.
pub const USER_MAP_KEY: &str = "userMap";

/// Reserved user key of the backing process handle.
pub const PTY_KEY: &str = "pty";

/// Public view of one user inside a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserView {
    /// Metadata fields of the user.
    #[serde(flatten)]
    pub metadata: Metadata,
}

/// Public view of one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    /// Metadata fields of the session.
    #[serde(flatten)]
    pub metadata: Metadata,

    /// Users attached to the session, keyed by username.
    #[serde(rename = "userMap", default)]
    pub user_map: BTreeMap<String, UserView>,
}

impl SessionView {
    /// Returns the number of users in the view.
    pub fn user_count(&self) -> usize {
        self.user_map.len()
    }

    /// Returns the view of a single user.
    pub fn user(&self, username: &str) -> Option<&UserView> {
        self.user_map.get(username)
    }
}

/// Snapshot of the whole registry keyed by session id.
pub type RegistrySnapshot = BTreeMap<String, SessionView>;
