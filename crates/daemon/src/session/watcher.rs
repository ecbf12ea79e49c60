//! Process exit watching.

use std::sync::{Arc, Weak};

use super::pty::PtyHandle;
use super::registry::SessionRegistry;

/// Spawns a task that removes the user when its process exits.
///
/// The task holds only a weak reference to the registry. The first exit
/// event marks the handle as exited; later events and events for a handle
/// that no longer backs the user are ignored.
pub(crate) fn watch_exit(
    registry: &Arc<SessionRegistry>,
    sid: &str,
    username: &str,
    pty: Arc<PtyHandle>,
) {
    let registry: Weak<SessionRegistry> = Arc::downgrade(registry);
    let sid = sid.to_string();
    let username = username.to_string();
    let mut exit_rx = pty.exit_watch();

    tokio::spawn(async move {
        let status = loop {
            if let Some(status) = *exit_rx.borrow_and_update() {
                break Some(status);
            }
            if exit_rx.changed().await.is_err() {
                break None;
            }
        };

        // A closed channel without a status means the process object was
        // dropped; treat it as an exit.
        if !pty.mark_exited() {
            return;
        }

        tracing::debug!(sid = %sid, username = %username, ?status, "User process exited");

        let Some(registry) = registry.upgrade() else {
            return;
        };
        registry.remove_user_bound_to(&sid, &username, &pty);
    });
}
