//! Error taxonomy (§7 ERROR HANDLING DESIGN).
//!
//! Transient network errors and protocol violations never reach this
//! module's types — they are logged (via [`crate::error::Suppressor`]) and
//! handled internally by the member/peer loops. These types are the
//! synchronous, typed errors surfaced to callers of the public API.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;

use crate::MemberId;

/// Fatal, crate-internal error. Observing one of these on the storage path
/// forces the owning member to step down rather than falsely advance
/// `commitIndex` (§7, *Storage I/O*).
#[derive(thiserror::Error, Debug)]
pub enum RaftError {
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
    #[error("engine is shutting down")]
    Shutdown,
}

pub type RaftResult<T> = Result<T, RaftError>;

/// Returned by [`crate::shard::Shard::commit`] / `Command::commit` (§6).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error("not leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<MemberId> },
    #[error("commit timed out")]
    Timeout,
    #[error("engine is shutting down")]
    Shutdown,
    #[error("payload of {got} bytes exceeds command_max_size of {max} bytes")]
    PayloadTooLarge { max: usize, got: usize },
    #[error("member is in slave mode")]
    SlaveMode,
}

/// Returned by [`crate::shard::Shard::get_committed_command`] (§6).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("index 0 is invalid")]
    InvalidIndex,
    #[error("member is in slave mode")]
    SlaveMode,
    #[error("read timed out")]
    Timeout,
    #[error("engine is shutting down")]
    Shutdown,
}

/// Returned by [`crate::shard::Shard::set_slave`] (§4.3 Slave mode).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SlaveError {
    #[error("cannot slave to a member of the same shard")]
    SameShard,
    #[error("engine is shutting down")]
    Shutdown,
}

/// Deduplicates known-noisy log lines to once per minute per tag, appending
/// a suppressed-count suffix on subsequent emissions (§7 "Log-noise
/// suppression").
pub struct Suppressor {
    window: Duration,
    state: Mutex<HashMap<&'static str, (Instant, u64)>>,
}

impl Suppressor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    /// Returns `Some(suppressed_count)` the first time `tag` is seen in a
    /// window, or on the window's expiry; `None` while still suppressed.
    pub fn gate(&self, tag: &'static str) -> Option<u64> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.get_mut(tag) {
            Some((since, count)) if now.duration_since(*since) < self.window => {
                *count += 1;
                None
            }
            Some((since, count)) => {
                let suppressed = *count;
                *since = now;
                *count = 0;
                Some(suppressed)
            }
            None => {
                state.insert(tag, (now, 0));
                Some(0)
            }
        }
    }
}

impl Default for Suppressor {
    fn default() -> Self {
        Self::per_minute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppressor_gates_repeat_within_window() {
        let s = Suppressor::new(Duration::from_secs(300));
        assert_eq!(s.gate("x"), Some(0));
        assert_eq!(s.gate("x"), None);
        assert_eq!(s.gate("x"), None);
        assert_eq!(s.gate("y"), Some(0));
    }
}
