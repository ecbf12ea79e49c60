//! Notifications sent to the supervising process.
//!
//! The supervisor reads one JSON object per line:
//!
//! ```text
//! {"event":"removeUser","data":{"sid":"...","username":"..."}}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Fire-and-forget events emitted by the session registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum SupervisorEvent {
    /// A user was removed from a session, either explicitly or because its
    /// backing process exited.
    RemoveUser {
        /// Session the user belonged to.
        sid: String,
        /// Name of the removed user.
        username: String,
    },
}

impl SupervisorEvent {
    /// Encodes the event as a single newline-terminated JSON line.
    pub fn to_json_line(&self) -> Result<String> {
        let mut line =
            serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Decodes an event from one line of input.
    pub fn from_json_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ProtocolError::EmptyLine);
        }
        Ok(serde_json::from_str(line)?)
    }
}
