//! Session identifier generation.
//!
//! An identifier is `<time><random><seq>`:
//!
//! - `time`: milliseconds between [`SORT_TIME_EPOCH_MS`] and the moment the
//!   generator was created, so ids from one daemon run share a prefix
//! - `random`: 24 bytes from the OS RNG, URL-safe base64 without padding
//! - `seq`: per-generator counter starting at 1
//!
//! The counter alone makes ids unique within a run. The random part is the
//! only unguessable component.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Unique identifier for a session.
pub type SessionId = String;

/// Reference point for the time prefix (2020-01-22).
pub const SORT_TIME_EPOCH_MS: u64 = 1_579_660_004_551;

/// Number of random bytes in an identifier.
const RANDOM_BYTES: usize = 24;

/// Generates session identifiers.
#[derive(Debug)]
pub struct SessionIdGenerator {
    sort_time: u64,
    next: AtomicU64,
}

impl SessionIdGenerator {
    /// Creates a generator anchored at the current time.
    pub fn new() -> Self {
        Self::with_sort_time(now_millis().saturating_sub(SORT_TIME_EPOCH_MS))
    }

    /// Creates a generator with a fixed time prefix.
    pub fn with_sort_time(sort_time: u64) -> Self {
        Self {
            sort_time,
            next: AtomicU64::new(1),
        }
    }

    /// Returns the time prefix used by this generator.
    pub fn sort_time(&self) -> u64 {
        self.sort_time
    }

    /// Generates a new identifier.
    pub fn generate(&self) -> SessionId {
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{}{}{}", self.sort_time, random_token(), seq)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns 24 random bytes as URL-safe base64 (32 characters).
///
/// Also used for once-tokens.
pub fn random_token() -> String {
    let mut bytes = [0u8; RANDOM_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hash of a session id handed to the user server instead of the id itself.
pub fn sid_hash(sid: &str) -> String {
    hex::encode(Sha256::digest(sid.as_bytes()))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
