//! The durable storage interface (§4.1 Storage, §6 Storage interface).
//!
//! Implementations must tolerate concurrent [`Storage::append_log_entry`]
//! calls from multiple [`crate::save_queue::SaveQueue`] workers, provided
//! they target strictly increasing indices per member — ordering across
//! those calls is enforced by the `SaveQueue`, not by `Storage` itself.
//! A reference implementation lives in the sibling `raft-memstore` crate.

use bytes::Bytes;

use crate::log::LogEntry;
use crate::MemberId;

/// A member's persisted `(currentTerm, votedFor)` pair (§3 Invariants:
/// "One vote per term").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PersistedVote {
    pub term: u64,
    pub voted_for: Option<MemberId>,
}

/// Durable, per-member, append-mostly log storage.
///
/// All methods are blocking — implementations run on whichever thread
/// calls them (a `SaveQueue` worker, or the owning `CoreMember` thread for
/// reads) rather than being driven by an async runtime, per this crate's
/// OS-thread concurrency model (§5).
pub trait Storage: Send + Sync {
    /// Atomically persist a vote. Must be durable before this returns —
    /// callers rely on this to uphold "one vote per term" (§3).
    fn save_vote(&self, member: MemberId, term: u64, voted_for: Option<MemberId>) -> anyhow::Result<()>;

    fn get_vote(&self, member: MemberId) -> anyhow::Result<PersistedVote>;

    /// True iff an entry with exactly this `(index, term)` exists.
    fn has_log_entry(&self, member: MemberId, index: u64, term: u64) -> anyhow::Result<bool>;

    fn get_log_entry(&self, member: MemberId, index: u64) -> anyhow::Result<Option<LogEntry>>;

    /// Fetch a contiguous range of entries `[from, to]` inclusive, used by
    /// the `SaveQueue` backlog scan and by `Peer` backfill streaming.
    fn get_log_entries(&self, member: MemberId, from: u64, to: u64) -> anyhow::Result<Vec<LogEntry>>;

    fn get_last_log_term(&self, member: MemberId) -> anyhow::Result<u64>;

    fn get_last_log_index(&self, member: MemberId) -> anyhow::Result<u64>;

    /// Append one entry. Must reject an append whose index is not exactly
    /// `lastSavedIndex + 1` unless the caller has already truncated via
    /// [`Storage::delete`] (§4.1).
    fn append_log_entry(&self, member: MemberId, entry: &LogEntry) -> anyhow::Result<()>;

    /// Truncate the suffix `>= from_index`. Required before appending a
    /// conflicting entry.
    fn delete(&self, member: MemberId, from_index: u64) -> anyhow::Result<()>;

    /// Delete the member's entire log (used when entering slave mode,
    /// §4.3 "a slave ... deletes its own log").
    fn delete_all(&self, member: MemberId) -> anyhow::Result<()> {
        self.delete(member, 1)
    }

    fn set_max_gap(&self, member: MemberId, gap: u64) -> anyhow::Result<()>;

    fn get_max_gap(&self, member: MemberId) -> anyhow::Result<u64>;
}

/// Convenience extension used by commit readers: fetch an entry's payload
/// bytes directly, used by `Shard::get_committed_command`.
pub trait StoragePayloadExt {
    fn get_payload(&self, member: MemberId, index: u64) -> anyhow::Result<Option<Bytes>>;
}

impl<T: Storage + ?Sized> StoragePayloadExt for T {
    fn get_payload(&self, member: MemberId, index: u64) -> anyhow::Result<Option<Bytes>> {
        Ok(self.get_log_entry(member, index)?.map(|e| e.payload))
    }
}
