//! Sentinel markers exchanged between the daemon and the user server.
//!
//! The daemon starts the user server by typing a command into an existing
//! terminal, so the only channel back is the terminal's output stream. The
//! user server announces its state by printing one of these markers:
//!
//! ```text
//! success:  <START_FLAG>
//! failure:  <ERR_FLAG_START>reason text<ERR_FLAG_END>
//! ```
//!
//! Matching is a plain substring search. Both sides must agree on the exact
//! bytes, which is why the markers live in this crate.

use serde::{Deserialize, Serialize};

/// Printed by the user server once it is ready to accept traffic.
pub const START_FLAG: &str = "[termshare:user-server]START_FLAG";

/// Opens an error payload.
pub const ERR_FLAG_START: &str = "[termshare:user-server]ERR_FLAG_START:";

/// Closes an error payload.
pub const ERR_FLAG_END: &str = "[termshare:user-server]ERR_FLAG_END";

/// Outcome recognised in user-server output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupSignal {
    /// The success marker was seen.
    Started,
    /// A complete error payload was seen; carries the extracted reason.
    Failed(String),
}

/// The set of markers a launcher scans for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserServerFlags {
    /// Success marker.
    pub start: String,
    /// Error payload opening marker.
    pub err_start: String,
    /// Error payload closing marker.
    pub err_end: String,
}

impl Default for UserServerFlags {
    fn default() -> Self {
        Self {
            start: START_FLAG.to_string(),
            err_start: ERR_FLAG_START.to_string(),
            err_end: ERR_FLAG_END.to_string(),
        }
    }
}

impl UserServerFlags {
    /// Creates a custom marker set.
    pub fn new(
        start: impl Into<String>,
        err_start: impl Into<String>,
        err_end: impl Into<String>,
    ) -> Self {
        Self {
            start: start.into(),
            err_start: err_start.into(),
            err_end: err_end.into(),
        }
    }

    /// Line the user server prints on success.
    pub fn success_line(&self) -> String {
        format!("{}\n", self.start)
    }

    /// Line the user server prints when it fails to come up.
    pub fn error_line(&self, reason: &str) -> String {
        format!("{}{}{}\n", self.err_start, reason, self.err_end)
    }

    /// Scans accumulated output for a terminal startup signal.
    ///
    /// The success marker takes precedence when both appear in the same
    /// output. An error payload only counts once its closing marker arrived.
    pub fn scan(&self, output: &str) -> Option<StartupSignal> {
        if output.contains(self.start.as_str()) {
            return Some(StartupSignal::Started);
        }
        if output.contains(self.err_end.as_str()) {
            return Some(StartupSignal::Failed(self.extract_error_message(output)));
        }
        None
    }

    /// Extracts the human-readable reason from an error payload.
    ///
    /// Output is cut at the first closing marker; the reason is whatever
    /// follows the opening marker in the remaining text, or the whole
    /// remaining text when no opening marker is present.
    pub fn extract_error_message(&self, output: &str) -> String {
        let truncated = match output.find(self.err_end.as_str()) {
            Some(end) => &output[..end],
            None => output,
        };
        match truncated.find(self.err_start.as_str()) {
            Some(start) => truncated[start + self.err_start.len()..].to_string(),
            None => truncated.to_string(),
        }
    }
}
