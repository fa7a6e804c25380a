//! Pooled, reference-counted wire messages (§3 DATA MODEL "Message", §4
//! MessagePool row).
//!
//! A production [`crate::network::Network`] implementation (TCP sockets,
//! say) would frame a [`Message`] to bytes before handing it to its
//! `Channel`, and frame bytes back into one on receive; that encode/decode
//! step is part of the transport implementation, which §1 explicitly
//! excludes from this crate's scope. What *is* in scope, and implemented
//! here, is the pooling: messages are reference-counted (cheaply cloned
//! `Arc`s) and the allocation-heavy parts — the `Vec<LogEntry>` batch
//! inside an `AppendEntries` — are recycled through a free-list instead of
//! being reallocated on every heartbeat, which is what makes this the hot
//! path it's described as in §1.

use std::sync::Arc;
use std::sync::Mutex;

use crate::log::LogEntry;
use crate::MemberId;

/// The four RPC shapes exchanged between members (§4.3, §4.4).
#[derive(Clone, Debug)]
pub enum MessageBody {
    RequestVote {
        term: u64,
        candidate_id: MemberId,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteReply {
        term: u64,
        vote_granted: bool,
    },
    AppendEntries {
        term: u64,
        leader_id: MemberId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesReply {
        term: u64,
        success: bool,
        /// The responder's own `lastIndex` after handling this request: on
        /// success this is the new `matchIndex` for this peer; on failure
        /// it lets the leader rewind `nextIndex` in one round trip rather
        /// than decrementing by one per retry (§4.3 point 2).
        last_index: u64,
    },
}

impl MessageBody {
    pub fn term(&self) -> u64 {
        match self {
            MessageBody::RequestVote { term, .. }
            | MessageBody::RequestVoteReply { term, .. }
            | MessageBody::AppendEntries { term, .. }
            | MessageBody::AppendEntriesReply { term, .. } => *term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::RequestVote { .. } => "RequestVote",
            MessageBody::RequestVoteReply { .. } => "RequestVoteReply",
            MessageBody::AppendEntries { .. } => "AppendEntries",
            MessageBody::AppendEntriesReply { .. } => "AppendEntriesReply",
        }
    }
}

struct Inner {
    from: MemberId,
    body: MessageBody,
    pool: Option<MessagePool>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let (Some(pool), MessageBody::AppendEntries { entries, .. }) = (self.pool.take(), &mut self.body) {
            let mut reclaimed = std::mem::take(entries);
            reclaimed.clear();
            pool.reclaim(reclaimed);
        }
    }
}

/// A pooled, reference-counted message. Cloning increments the refcount
/// (§3: "refcount-incremented K times" when fanned out to K peers);
/// dropping the last clone returns its reusable allocations to the pool
/// that produced it.
#[derive(Clone)]
pub struct Message(Arc<Inner>);

impl Message {
    pub fn from(&self) -> MemberId {
        self.0.from
    }

    pub fn body(&self) -> &MessageBody {
        &self.0.body
    }

    pub fn term(&self) -> u64 {
        self.0.body.term()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message").field("from", &self.0.from).field("body", &self.0.body).finish()
    }
}

/// A lock-free-in-spirit free-list of recycled `AppendEntries` entry
/// buffers, shared by every [`crate::shard::Shard`] hosted by one
/// [`crate::engine::Engine`] (§5 "MessagePool is lock-free
/// (refcounted, free-list)").
#[derive(Clone)]
pub struct MessagePool {
    free: Arc<Mutex<Vec<Vec<LogEntry>>>>,
}

impl MessagePool {
    pub fn new() -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn checkout_entries(&self) -> Vec<LogEntry> {
        self.free.lock().unwrap().pop().unwrap_or_default()
    }

    fn reclaim(&self, buf: Vec<LogEntry>) {
        let mut free = self.free.lock().unwrap();
        if free.len() < 256 {
            free.push(buf);
        }
    }

    pub fn checkout(&self, from: MemberId, body: MessageBody) -> Message {
        Message(Arc::new(Inner {
            from,
            body,
            pool: Some(self.clone()),
        }))
    }

    /// Build an `AppendEntries` message reusing a recycled entry buffer.
    pub fn checkout_append_entries(
        &self,
        from: MemberId,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: impl IntoIterator<Item = LogEntry>,
        leader_commit: u64,
    ) -> Message {
        let mut buf = self.checkout_entries();
        buf.extend(entries);
        self.checkout(
            from,
            MessageBody::AppendEntries {
                term,
                leader_id: from,
                prev_log_index,
                prev_log_term,
                entries: buf,
                leader_commit,
            },
        )
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_entries_buffer_is_recycled_after_drop() {
        let pool = MessagePool::new();
        let m = pool.checkout_append_entries(MemberId(1), 1, 0, 0, vec![LogEntry::noop(1, 1)], 0);
        drop(m);
        assert_eq!(pool.free.lock().unwrap().len(), 1);
        let reused = pool.checkout_entries();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), 1);
    }

    #[test]
    fn clone_keeps_message_alive_until_last_drop() {
        let pool = MessagePool::new();
        let m1 = pool.checkout_append_entries(MemberId(1), 1, 0, 0, vec![], 0);
        let m2 = m1.clone();
        drop(m1);
        assert_eq!(m2.term(), 1);
    }
}
