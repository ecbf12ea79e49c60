//! Session and user registry.
//!
//! The registry maps session ids to sessions and, per session, usernames to
//! users. Every user is backed by a [`PtyHandle`]; when that process exits
//! the user is removed, and a session that loses its last user is removed
//! with it. Removals are reported to the supervisor as
//! [`SupervisorEvent::RemoveUser`].
//!
//! The process handle and the user map are typed fields, not metadata. The
//! metadata API still refuses the reserved keys `userMap` and `pty` so the
//! public views can never be ambiguous.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use termshare_protocol::{
    Metadata, RegistrySnapshot, SessionView, SupervisorEvent, UserView, PTY_KEY, USER_MAP_KEY,
};
use thiserror::Error;
use tokio::sync::broadcast;

use super::id::SessionId;
use super::pty::PtyHandle;
use super::watcher;

/// Channel capacity for supervisor events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors returned by registry mutations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A metadata patch or removal touched a reserved field.
    #[error("cannot modify reserved field \"{field}\"")]
    InvalidFieldMutation {
        /// The reserved field name.
        field: &'static str,
    },

    /// The session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
}

/// A user attached to a session.
#[derive(Debug)]
pub struct UserRecord {
    username: String,
    pty: Arc<PtyHandle>,
    metadata: Metadata,
}

impl UserRecord {
    fn new(username: &str, pty: Arc<PtyHandle>, metadata: Option<Metadata>) -> Self {
        Self {
            username: username.to_string(),
            pty,
            metadata: metadata.unwrap_or_default(),
        }
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the backing process handle.
    pub fn pty(&self) -> &Arc<PtyHandle> {
        &self.pty
    }

    /// Returns the user's metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn view(&self) -> UserView {
        UserView {
            metadata: self.metadata.clone(),
        }
    }
}

/// A logical sharing session.
#[derive(Debug)]
pub struct SessionRecord {
    id: SessionId,
    metadata: Metadata,
    users: BTreeMap<String, UserRecord>,
}

impl SessionRecord {
    /// Returns the session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the session's metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Returns the attached users keyed by username.
    pub fn users(&self) -> &BTreeMap<String, UserRecord> {
        &self.users
    }

    fn view(&self) -> SessionView {
        SessionView {
            metadata: self.metadata.clone(),
            user_map: self
                .users
                .iter()
                .map(|(name, user)| (name.clone(), user.view()))
                .collect(),
        }
    }
}

/// Process-wide registry of sessions and their users.
///
/// Construct one per daemon and share it as `Arc<SessionRegistry>`. Methods
/// that attach users spawn exit watchers and must run inside a tokio runtime.
pub struct SessionRegistry {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, SessionRecord>,

    /// Removal notifications for the supervisor.
    event_tx: broadcast::Sender<SupervisorEvent>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: DashMap::new(),
            event_tx,
        }
    }

    /// Subscribes to supervisor events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.event_tx.subscribe()
    }

    /// Creates a session with its first user.
    ///
    /// An existing session with the same id is replaced and the processes of
    /// its users are terminated. Both metadata patches are validated before
    /// anything is inserted.
    pub fn create_session(
        self: &Arc<Self>,
        sid: &str,
        session_metadata: Option<Metadata>,
        username: &str,
        user_metadata: Option<Metadata>,
        pty: Arc<PtyHandle>,
    ) -> Result<SessionView, RegistryError> {
        validate_patch(session_metadata.as_ref(), USER_MAP_KEY)?;
        validate_patch(user_metadata.as_ref(), PTY_KEY)?;

        let mut users = BTreeMap::new();
        users.insert(
            username.to_string(),
            UserRecord::new(username, Arc::clone(&pty), user_metadata),
        );
        let session = SessionRecord {
            id: sid.to_string(),
            metadata: session_metadata.unwrap_or_default(),
            users,
        };
        let view = session.view();

        if let Some(replaced) = self.sessions.insert(sid.to_string(), session) {
            tracing::warn!(
                sid = %sid,
                users = replaced.users.len(),
                "Replaced existing session; terminating its users"
            );
            for user in replaced.users.into_values() {
                if !Arc::ptr_eq(&user.pty, &pty) {
                    terminate_quietly(sid, &user);
                }
            }
        }

        watcher::watch_exit(self, sid, username, pty);

        tracing::info!(sid = %sid, username = %username, "Created session");
        Ok(view)
    }

    /// Attaches a user to an existing session.
    ///
    /// A user already registered under `username` is replaced; its process is
    /// terminated unless it is the same handle or has already exited.
    pub fn add_user(
        self: &Arc<Self>,
        sid: &str,
        username: &str,
        user_metadata: Option<Metadata>,
        pty: Arc<PtyHandle>,
    ) -> Result<UserView, RegistryError> {
        validate_patch(user_metadata.as_ref(), PTY_KEY)?;

        let (view, displaced) = {
            let mut session = self
                .sessions
                .get_mut(sid)
                .ok_or_else(|| RegistryError::SessionNotFound(sid.to_string()))?;
            let record = UserRecord::new(username, Arc::clone(&pty), user_metadata);
            let view = record.view();
            let displaced = session.users.insert(username.to_string(), record);
            (view, displaced)
        };

        if let Some(displaced) = displaced {
            if !Arc::ptr_eq(&displaced.pty, &pty) {
                tracing::warn!(sid = %sid, username = %username, "Replacing existing user");
                terminate_quietly(sid, &displaced);
            }
        }

        watcher::watch_exit(self, sid, username, pty);

        tracing::info!(sid = %sid, username = %username, "Added user");
        Ok(view)
    }

    /// Shallow-merges `patch` into the session's metadata.
    ///
    /// Fails if the patch contains `userMap`. A missing session or an empty
    /// patch is a no-op.
    pub fn set_session_metadata(
        &self,
        sid: &str,
        patch: Option<Metadata>,
    ) -> Result<(), RegistryError> {
        validate_patch(patch.as_ref(), USER_MAP_KEY)?;
        let Some(patch) = patch.filter(|p| !p.is_empty()) else {
            return Ok(());
        };
        if let Some(mut session) = self.sessions.get_mut(sid) {
            session.metadata.extend(patch);
        }
        Ok(())
    }

    /// Shallow-merges `patch` into a user's metadata.
    ///
    /// Fails if the patch contains `pty`. A missing user or an empty patch is
    /// a no-op.
    pub fn set_user_metadata(
        &self,
        sid: &str,
        username: &str,
        patch: Option<Metadata>,
    ) -> Result<(), RegistryError> {
        validate_patch(patch.as_ref(), PTY_KEY)?;
        let Some(patch) = patch.filter(|p| !p.is_empty()) else {
            return Ok(());
        };
        if let Some(mut session) = self.sessions.get_mut(sid) {
            if let Some(user) = session.users.get_mut(username) {
                user.metadata.extend(patch);
            }
        }
        Ok(())
    }

    /// Deletes one metadata field from a session.
    pub fn remove_session_field(&self, sid: &str, key: &str) -> Result<(), RegistryError> {
        if key == USER_MAP_KEY {
            return Err(RegistryError::InvalidFieldMutation {
                field: USER_MAP_KEY,
            });
        }
        if let Some(mut session) = self.sessions.get_mut(sid) {
            session.metadata.remove(key);
        }
        Ok(())
    }

    /// Deletes one metadata field from a user.
    pub fn remove_user_field(
        &self,
        sid: &str,
        username: &str,
        key: &str,
    ) -> Result<(), RegistryError> {
        if key == PTY_KEY {
            return Err(RegistryError::InvalidFieldMutation { field: PTY_KEY });
        }
        if let Some(mut session) = self.sessions.get_mut(sid) {
            if let Some(user) = session.users.get_mut(username) {
                user.metadata.remove(key);
            }
        }
        Ok(())
    }

    /// Returns a detached copy of every session, without process handles.
    pub fn snapshot_all(&self) -> RegistrySnapshot {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().view()))
            .collect()
    }

    /// Returns a detached copy of one session.
    pub fn session(&self, sid: &str) -> Option<SessionView> {
        self.sessions.get(sid).map(|session| session.view())
    }

    /// Returns whether a session exists.
    pub fn contains_session(&self, sid: &str) -> bool {
        self.sessions.contains_key(sid)
    }

    /// Returns the number of sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Returns the number of users in a session, 0 if it does not exist.
    pub fn user_count(&self, sid: &str) -> usize {
        self.sessions
            .get(sid)
            .map(|session| session.users.len())
            .unwrap_or(0)
    }

    /// Returns the number of users across all sessions.
    pub fn total_users(&self) -> usize {
        self.sessions
            .iter()
            .map(|session| session.users.len())
            .sum()
    }

    /// Returns the process handle backing a user.
    pub fn user_pty(&self, sid: &str, username: &str) -> Option<Arc<PtyHandle>> {
        self.sessions
            .get(sid)
            .and_then(|session| session.users.get(username).map(|u| Arc::clone(&u.pty)))
    }

    /// Removes a user, terminating its process unless it already exited.
    ///
    /// Drops the session if it became empty and notifies the supervisor.
    /// Returns whether a user was removed.
    pub fn remove_user(&self, sid: &str, username: &str) -> bool {
        self.take_user(sid, username, |_| true)
    }

    /// Removes a user only while it is still backed by `pty`.
    ///
    /// Used by exit watchers so a replaced handle cannot remove its
    /// successor.
    pub(crate) fn remove_user_bound_to(
        &self,
        sid: &str,
        username: &str,
        pty: &Arc<PtyHandle>,
    ) -> bool {
        self.take_user(sid, username, |user| Arc::ptr_eq(&user.pty, pty))
    }

    /// Removes every user of every session.
    pub fn clear(&self) -> usize {
        let targets: Vec<(SessionId, String)> = self
            .sessions
            .iter()
            .flat_map(|session| {
                let sid = session.key().clone();
                session
                    .users
                    .keys()
                    .map(move |name| (sid.clone(), name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        targets
            .iter()
            .filter(|(sid, username)| self.remove_user(sid, username))
            .count()
    }

    fn take_user<F>(&self, sid: &str, username: &str, predicate: F) -> bool
    where
        F: FnOnce(&UserRecord) -> bool,
    {
        let (user, session_removed) = match self.sessions.entry(sid.to_string()) {
            Entry::Occupied(mut entry) => {
                let matches = entry
                    .get()
                    .users
                    .get(username)
                    .map(predicate)
                    .unwrap_or(false);
                if !matches {
                    return false;
                }
                let user = entry.get_mut().users.remove(username);
                let empty = entry.get().users.is_empty();
                if empty {
                    entry.remove();
                }
                (user, empty)
            }
            Entry::Vacant(_) => return false,
        };

        let Some(user) = user else {
            return false;
        };

        terminate_quietly(sid, &user);

        tracing::info!(
            sid = %sid,
            username = %username,
            session_removed,
            "Removed user"
        );

        let _ = self.event_tx.send(SupervisorEvent::RemoveUser {
            sid: sid.to_string(),
            username: username.to_string(),
        });

        true
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_patch(patch: Option<&Metadata>, reserved: &'static str) -> Result<(), RegistryError> {
    match patch {
        Some(patch) if patch.contains_key(reserved) => {
            Err(RegistryError::InvalidFieldMutation { field: reserved })
        }
        _ => Ok(()),
    }
}

fn terminate_quietly(sid: &str, user: &UserRecord) {
    if let Err(e) = user.pty.terminate_if_running() {
        tracing::warn!(
            sid = %sid,
            username = %user.username,
            error = %e,
            "Failed to terminate user process"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::FakePty;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn meta(value: serde_json::Value) -> Metadata {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("metadata must be an object"),
        }
    }

    fn fake_handle() -> (Arc<FakePty>, Arc<PtyHandle>) {
        let fake = Arc::new(FakePty::new());
        let handle = PtyHandle::new(fake.clone());
        (fake, handle)
    }

    fn registry_with_session(sid: &str, username: &str) -> (Arc<SessionRegistry>, Arc<FakePty>) {
        let registry = Arc::new(SessionRegistry::new());
        let (fake, handle) = fake_handle();
        registry
            .create_session(sid, Some(meta(json!({"title": "demo"}))), username, None, handle)
            .unwrap();
        (registry, fake)
    }

    async fn next_event(rx: &mut broadcast::Receiver<SupervisorEvent>) -> Option<SupervisorEvent> {
        timeout(Duration::from_secs(1), rx.recv()).await.ok()?.ok()
    }

    #[tokio::test]
    async fn test_create_session() {
        let (registry, _fake) = registry_with_session("s1", "alice");

        assert!(registry.contains_session("s1"));
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.user_count("s1"), 1);

        let view = registry.session("s1").unwrap();
        assert_eq!(view.metadata.get("title"), Some(&json!("demo")));
        assert!(view.user("alice").is_some());
    }

    #[tokio::test]
    async fn test_create_session_rejects_reserved_keys_before_inserting() {
        let registry = Arc::new(SessionRegistry::new());
        let (_, handle) = fake_handle();

        let result = registry.create_session(
            "s1",
            Some(meta(json!({"userMap": {}}))),
            "alice",
            None,
            Arc::clone(&handle),
        );
        assert_eq!(
            result,
            Err(RegistryError::InvalidFieldMutation { field: "userMap" })
        );

        let result =
            registry.create_session("s1", None, "alice", Some(meta(json!({"pty": 1}))), handle);
        assert_eq!(result, Err(RegistryError::InvalidFieldMutation { field: "pty" }));

        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_create_session_replaces_existing() {
        let (registry, old_fake) = registry_with_session("s1", "alice");
        let (_, handle) = fake_handle();

        registry
            .create_session("s1", None, "bob", None, handle)
            .unwrap();

        assert_eq!(old_fake.terminate_count(), 1);
        let view = registry.session("s1").unwrap();
        assert!(view.user("alice").is_none());
        assert!(view.user("bob").is_some());
        assert!(view.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_create_session_again_with_same_handle_keeps_it_alive() {
        let registry = Arc::new(SessionRegistry::new());
        let (fake, handle) = fake_handle();

        registry
            .create_session("s1", None, "alice", None, Arc::clone(&handle))
            .unwrap();
        registry
            .create_session("s1", None, "alice", None, Arc::clone(&handle))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fake.terminate_count(), 0);
        assert!(!handle.is_exited());
        assert_eq!(registry.user_count("s1"), 1);
    }

    #[tokio::test]
    async fn test_add_user_requires_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (_, handle) = fake_handle();

        let result = registry.add_user("missing", "alice", None, handle);
        assert_eq!(
            result,
            Err(RegistryError::SessionNotFound("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn test_user_count_tracks_distinct_names_and_session_is_pruned() {
        let (registry, _fake) = registry_with_session("s1", "user0");
        let names: Vec<String> = (1..5).map(|i| format!("user{i}")).collect();

        for name in &names {
            let (_, handle) = fake_handle();
            registry.add_user("s1", name, None, handle).unwrap();
        }
        assert_eq!(registry.user_count("s1"), 5);

        assert!(registry.remove_user("s1", "user0"));
        for name in &names {
            assert!(registry.contains_session("s1"));
            assert!(registry.remove_user("s1", name));
        }

        assert!(!registry.contains_session("s1"));
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_add_user_replaces_and_terminates_displaced() {
        let (registry, first) = registry_with_session("s1", "alice");
        let (second, handle) = fake_handle();

        registry
            .add_user("s1", "alice", Some(meta(json!({"seat": 2}))), handle)
            .unwrap();

        assert_eq!(first.terminate_count(), 1);
        assert_eq!(second.terminate_count(), 0);
        assert_eq!(registry.user_count("s1"), 1);

        // The displaced process exiting must not remove its replacement.
        first.exit(0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let view = registry.session("s1").unwrap();
        assert_eq!(view.user("alice").unwrap().metadata.get("seat"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_add_user_same_handle_is_not_terminated() {
        let registry = Arc::new(SessionRegistry::new());
        let (fake, handle) = fake_handle();
        registry
            .create_session("s1", None, "alice", None, Arc::clone(&handle))
            .unwrap();

        registry.add_user("s1", "alice", None, handle).unwrap();

        assert_eq!(fake.terminate_count(), 0);
    }

    #[tokio::test]
    async fn test_set_session_metadata_merges() {
        let (registry, _fake) = registry_with_session("s1", "alice");

        registry
            .set_session_metadata("s1", Some(meta(json!({"title": "new", "mode": "rw"}))))
            .unwrap();

        let view = registry.session("s1").unwrap();
        assert_eq!(view.metadata.get("title"), Some(&json!("new")));
        assert_eq!(view.metadata.get("mode"), Some(&json!("rw")));
    }

    #[tokio::test]
    async fn test_set_session_metadata_reserved_key_mutates_nothing() {
        let (registry, _fake) = registry_with_session("s1", "alice");
        let before = registry.session("s1").unwrap();

        let result = registry.set_session_metadata(
            "s1",
            Some(meta(json!({"title": "changed", "userMap": {}}))),
        );

        assert_eq!(
            result,
            Err(RegistryError::InvalidFieldMutation { field: "userMap" })
        );
        assert_eq!(registry.session("s1").unwrap(), before);
    }

    #[tokio::test]
    async fn test_set_metadata_noops() {
        let (registry, _fake) = registry_with_session("s1", "alice");
        let before = registry.snapshot_all();

        registry.set_session_metadata("s1", None).unwrap();
        registry.set_session_metadata("s1", Some(Metadata::new())).unwrap();
        registry
            .set_session_metadata("missing", Some(meta(json!({"a": 1}))))
            .unwrap();
        registry
            .set_user_metadata("s1", "nobody", Some(meta(json!({"a": 1}))))
            .unwrap();
        registry.set_user_metadata("s1", "alice", None).unwrap();

        assert_eq!(registry.snapshot_all(), before);
    }

    #[tokio::test]
    async fn test_set_user_metadata() {
        let (registry, _fake) = registry_with_session("s1", "alice");

        registry
            .set_user_metadata("s1", "alice", Some(meta(json!({"role": "owner"}))))
            .unwrap();

        let view = registry.session("s1").unwrap();
        assert_eq!(
            view.user("alice").unwrap().metadata.get("role"),
            Some(&json!("owner"))
        );
    }

    #[tokio::test]
    async fn test_set_user_metadata_reserved_key_mutates_nothing() {
        let (registry, _fake) = registry_with_session("s1", "alice");
        let before = registry.session("s1").unwrap();

        let result = registry.set_user_metadata(
            "s1",
            "alice",
            Some(meta(json!({"role": "owner", "pty": null}))),
        );

        assert_eq!(result, Err(RegistryError::InvalidFieldMutation { field: "pty" }));
        assert_eq!(registry.session("s1").unwrap(), before);
    }

    #[tokio::test]
    async fn test_remove_session_field() {
        let (registry, _fake) = registry_with_session("s1", "alice");
        registry
            .set_session_metadata("s1", Some(meta(json!({"mode": "rw"}))))
            .unwrap();

        registry.remove_session_field("s1", "mode").unwrap();

        let view = registry.session("s1").unwrap();
        assert!(!view.metadata.contains_key("mode"));
        assert_eq!(view.metadata.get("title"), Some(&json!("demo")));
        assert_eq!(view.user_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_reserved_fields_fails() {
        let (registry, _fake) = registry_with_session("s1", "alice");
        let before = registry.session("s1").unwrap();

        assert_eq!(
            registry.remove_session_field("s1", "userMap"),
            Err(RegistryError::InvalidFieldMutation { field: "userMap" })
        );
        assert_eq!(
            registry.remove_user_field("s1", "alice", "pty"),
            Err(RegistryError::InvalidFieldMutation { field: "pty" })
        );
        assert_eq!(registry.session("s1").unwrap(), before);
        assert!(registry.user_pty("s1", "alice").is_some());
    }

    #[tokio::test]
    async fn test_remove_user_field() {
        let (registry, _fake) = registry_with_session("s1", "alice");
        registry
            .set_user_metadata("s1", "alice", Some(meta(json!({"a": 1, "b": 2}))))
            .unwrap();

        registry.remove_user_field("s1", "alice", "a").unwrap();
        registry.remove_user_field("s1", "nobody", "b").unwrap();

        let view = registry.session("s1").unwrap();
        let user = view.user("alice").unwrap();
        assert!(!user.metadata.contains_key("a"));
        assert_eq!(user.metadata.get("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_snapshot_is_detached_and_has_no_pty() {
        let (registry, _fake) = registry_with_session("s1", "alice");
        registry
            .set_user_metadata("s1", "alice", Some(meta(json!({"role": "owner"}))))
            .unwrap();

        let mut snapshot = registry.snapshot_all();
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(
            value,
            json!({"s1": {"title": "demo", "userMap": {"alice": {"role": "owner"}}}})
        );

        let session = snapshot.get_mut("s1").unwrap();
        session.metadata.insert("title".to_string(), json!("hacked"));
        session.user_map.clear();

        let live = registry.session("s1").unwrap();
        assert_eq!(live.metadata.get("title"), Some(&json!("demo")));
        assert_eq!(live.user_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_user_terminates_and_notifies() {
        let (registry, fake) = registry_with_session("s1", "alice");
        let mut events = registry.subscribe();

        assert!(registry.remove_user("s1", "alice"));

        assert_eq!(fake.terminate_count(), 1);
        assert!(!registry.contains_session("s1"));
        assert_eq!(
            next_event(&mut events).await,
            Some(SupervisorEvent::RemoveUser {
                sid: "s1".to_string(),
                username: "alice".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_remove_user_absent_is_noop() {
        let (registry, _fake) = registry_with_session("s1", "alice");
        let mut events = registry.subscribe();

        assert!(!registry.remove_user("s1", "bob"));
        assert!(!registry.remove_user("missing", "alice"));

        assert_eq!(registry.user_count("s1"), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_process_exit_removes_user_once() {
        let registry = Arc::new(SessionRegistry::new());
        let (alice, alice_pty) = fake_handle();
        let (_bob, bob_pty) = fake_handle();
        registry
            .create_session("s1", None, "alice", None, Arc::clone(&alice_pty))
            .unwrap();
        registry.add_user("s1", "bob", None, bob_pty).unwrap();
        let mut events = registry.subscribe();

        alice.exit(1);
        alice.exit(1);

        assert_eq!(
            next_event(&mut events).await,
            Some(SupervisorEvent::RemoveUser {
                sid: "s1".to_string(),
                username: "alice".to_string()
            })
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());

        assert!(alice_pty.is_exited());
        assert_eq!(alice.terminate_count(), 0);
        assert_eq!(registry.user_count("s1"), 1);
        assert!(registry.user_pty("s1", "bob").is_some());
    }

    #[tokio::test]
    async fn test_last_process_exit_removes_session() {
        let (registry, fake) = registry_with_session("s1", "alice");
        let mut events = registry.subscribe();

        fake.exit(0);

        assert!(next_event(&mut events).await.is_some());
        assert!(!registry.contains_session("s1"));
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let (registry, fake) = registry_with_session("s1", "alice");
        let (_, handle) = fake_handle();
        registry.create_session("s2", None, "bob", None, handle).unwrap();

        assert_eq!(registry.total_users(), 2);
        assert_eq!(registry.clear(), 2);
        assert_eq!(registry.session_count(), 0);
        assert_eq!(fake.terminate_count(), 1);
    }
}
