//! Single-use, time-bounded claim tokens.
//!
//! A token binds a `(sid, username)` pair for a party that has not connected
//! yet. The party later presents the token to [`TokenBroker::claim`] and
//! receives the binding; if nobody claims it before the deadline it expires.
//! Either way the issuer's [`TokenWaiter`] settles exactly once.
//!
//! Removal from the pending map is the only way to settle a token, so a
//! racing claim and expiry cannot both win.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::id::SessionId;

/// Default time a token stays claimable.
pub const DEFAULT_TOKEN_DEADLINE: Duration = Duration::from_secs(5);

/// Errors from issuing, claiming, or waiting on a token.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// The token is unknown, already claimed, or expired.
    #[error("token not found")]
    NotFound,

    /// Nobody claimed the token before its deadline.
    #[error("token expired before it was claimed")]
    Timeout,

    /// A token with the same value is still pending.
    #[error("token is already pending")]
    AlreadyPending,

    /// The broker was dropped while the token was pending.
    #[error("token broker closed")]
    BrokerClosed,
}

/// The pairing delivered to whoever claims a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedBinding {
    /// Session the claimer joins.
    pub sid: SessionId,
    /// User the claimer acts as.
    pub username: String,
}

struct PendingClaim {
    issue_id: u64,
    binding: ClaimedBinding,
    settle: oneshot::Sender<Result<(), TokenError>>,
    timer: JoinHandle<()>,
}

/// Completion side of an issued token.
#[derive(Debug)]
pub struct TokenWaiter {
    token: String,
    rx: oneshot::Receiver<Result<(), TokenError>>,
}

impl TokenWaiter {
    /// Returns the token value.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Waits until the token is claimed (`Ok`) or expires (`Timeout`).
    pub async fn wait(self) -> Result<(), TokenError> {
        self.rx.await.unwrap_or(Err(TokenError::BrokerClosed))
    }
}

/// Issues and settles claim tokens.
pub struct TokenBroker {
    pending: DashMap<String, PendingClaim>,
    deadline: Duration,
    next_issue: AtomicU64,
}

impl TokenBroker {
    /// Creates a broker whose tokens expire after `deadline`.
    pub fn new(deadline: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            deadline,
            next_issue: AtomicU64::new(0),
        }
    }

    /// Returns the claim deadline.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Returns the number of tokens still pending.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns whether `token` is pending.
    pub fn is_pending(&self, token: &str) -> bool {
        self.pending.contains_key(token)
    }

    /// Makes `token` claimable for `(sid, username)` until the deadline.
    ///
    /// Must be called inside a tokio runtime; the deadline runs as a task.
    pub fn issue(
        self: &Arc<Self>,
        sid: &str,
        username: &str,
        token: impl Into<String>,
    ) -> Result<TokenWaiter, TokenError> {
        let token = token.into();
        let (settle, rx) = oneshot::channel();
        let issue_id = self.next_issue.fetch_add(1, Ordering::Relaxed);

        match self.pending.entry(token.clone()) {
            Entry::Occupied(_) => return Err(TokenError::AlreadyPending),
            Entry::Vacant(slot) => {
                let timer = tokio::spawn(expire(
                    Arc::downgrade(self),
                    token.clone(),
                    issue_id,
                    self.deadline,
                ));
                slot.insert(PendingClaim {
                    issue_id,
                    binding: ClaimedBinding {
                        sid: sid.to_string(),
                        username: username.to_string(),
                    },
                    settle,
                    timer,
                });
            }
        }

        tracing::debug!(sid = %sid, username = %username, "Issued token");
        Ok(TokenWaiter { token, rx })
    }

    /// Claims a pending token, returning its binding.
    pub fn claim(&self, token: &str) -> Result<ClaimedBinding, TokenError> {
        let (_, claim) = self.pending.remove(token).ok_or(TokenError::NotFound)?;
        claim.timer.abort();
        let _ = claim.settle.send(Ok(()));

        tracing::debug!(
            sid = %claim.binding.sid,
            username = %claim.binding.username,
            "Token claimed"
        );
        Ok(claim.binding)
    }
}

impl Default for TokenBroker {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_DEADLINE)
    }
}

async fn expire(broker: Weak<TokenBroker>, token: String, issue_id: u64, deadline: Duration) {
    tokio::time::sleep(deadline).await;

    let Some(broker) = broker.upgrade() else {
        return;
    };
    if let Some((_, claim)) = broker
        .pending
        .remove_if(&token, |_, claim| claim.issue_id == issue_id)
    {
        tracing::debug!(
            sid = %claim.binding.sid,
            username = %claim.binding.username,
            "Token expired"
        );
        let _ = claim.settle.send(Err(TokenError::Timeout));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Instant};

    fn broker() -> Arc<TokenBroker> {
        Arc::new(TokenBroker::new(Duration::from_secs(5)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_before_deadline() {
        let broker = broker();
        let waiter = broker.issue("s1", "alice", "tok").unwrap();
        assert_eq!(waiter.token(), "tok");

        sleep(Duration::from_secs(4)).await;
        let binding = broker.claim("tok").unwrap();

        assert_eq!(
            binding,
            ClaimedBinding {
                sid: "s1".to_string(),
                username: "alice".to_string()
            }
        );
        assert_eq!(waiter.wait().await, Ok(()));
        assert_eq!(broker.claim("tok"), Err(TokenError::NotFound));
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimed_token_does_not_expire_later() {
        let broker = broker();
        let waiter = broker.issue("s1", "alice", "tok").unwrap();
        broker.claim("tok").unwrap();

        sleep(Duration::from_secs(10)).await;

        assert_eq!(waiter.wait().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_token_expires_once() {
        let broker = broker();
        let start = Instant::now();
        let waiter = broker.issue("s1", "alice", "tok").unwrap();

        assert_eq!(waiter.wait().await, Err(TokenError::Timeout));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(!broker.is_pending("tok"));
        assert_eq!(broker.claim("tok"), Err(TokenError::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_after_deadline_fails() {
        let broker = broker();
        let _waiter = broker.issue("s1", "alice", "tok").unwrap();

        sleep(Duration::from_secs(6)).await;

        assert_eq!(broker.claim("tok"), Err(TokenError::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_issue_rejected() {
        let broker = broker();
        let waiter = broker.issue("s1", "alice", "tok").unwrap();

        let duplicate = broker.issue("s2", "bob", "tok");
        assert!(matches!(duplicate, Err(TokenError::AlreadyPending)));

        let binding = broker.claim("tok").unwrap();
        assert_eq!(binding.sid, "s1");
        assert_eq!(waiter.wait().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reissue_after_claim() {
        let broker = broker();
        let first = broker.issue("s1", "alice", "tok").unwrap();
        broker.claim("tok").unwrap();
        assert_eq!(first.wait().await, Ok(()));

        let second = broker.issue("s1", "bob", "tok").unwrap();
        assert_eq!(second.wait().await, Err(TokenError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_are_independent() {
        let broker = broker();
        let a = broker.issue("s1", "alice", "a").unwrap();
        let b = broker.issue("s1", "bob", "b").unwrap();
        assert_eq!(broker.pending_count(), 2);

        broker.claim("b").unwrap();

        assert_eq!(b.wait().await, Ok(()));
        assert_eq!(a.wait().await, Err(TokenError::Timeout));
    }

    #[tokio::test]
    async fn test_dropped_broker_closes_waiters() {
        let broker = broker();
        let waiter = broker.issue("s1", "alice", "tok").unwrap();

        drop(broker);

        assert_eq!(waiter.wait().await, Err(TokenError::BrokerClosed));
    }
}
