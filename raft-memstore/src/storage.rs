//! An in-memory [`Storage`](raft_core::storage::Storage) implementation.
//!
//! Each member's log lives behind its own lock so that concurrent
//! `SaveQueue` workers writing to different members never contend with one
//! another (§4.1 of the engine this backs: "implementations must tolerate
//! concurrent `append_log_entry` calls ... provided they target strictly
//! increasing indices per member").

use std::collections::HashMap;

use parking_lot::Mutex;

use raft_core::log::LogEntry;
use raft_core::storage::PersistedVote;
use raft_core::storage::Storage;
use raft_core::MemberId;

#[derive(Default)]
struct MemberLog {
    vote: PersistedVote,
    // entries[i] holds the entry at index i + 1; never stores the index-0 sentinel.
    entries: Vec<LogEntry>,
    max_gap: u64,
}

impl MemberLog {
    fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }
}

/// An in-memory, per-member log store. Cheap to construct; data does not
/// survive process restart, which is the point for tests.
#[derive(Default)]
pub struct MemStorage {
    members: Mutex<HashMap<MemberId, MemberLog>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn save_vote(&self, member: MemberId, term: u64, voted_for: Option<MemberId>) -> anyhow::Result<()> {
        let mut members = self.members.lock();
        let log = members.entry(member).or_default();
        log.vote = PersistedVote { term, voted_for };
        Ok(())
    }

    fn get_vote(&self, member: MemberId) -> anyhow::Result<PersistedVote> {
        Ok(self.members.lock().entry(member).or_default().vote)
    }

    fn has_log_entry(&self, member: MemberId, index: u64, term: u64) -> anyhow::Result<bool> {
        if index == 0 {
            return Ok(term == 0);
        }
        Ok(self
            .members
            .lock()
            .get(&member)
            .and_then(|log| log.entry_at(index))
            .map(|e| e.term == term)
            .unwrap_or(false))
    }

    fn get_log_entry(&self, member: MemberId, index: u64) -> anyhow::Result<Option<LogEntry>> {
        Ok(self.members.lock().get(&member).and_then(|log| log.entry_at(index)).cloned())
    }

    fn get_log_entries(&self, member: MemberId, from: u64, to: u64) -> anyhow::Result<Vec<LogEntry>> {
        if from > to {
            return Ok(Vec::new());
        }
        let members = self.members.lock();
        let Some(log) = members.get(&member) else {
            return Ok(Vec::new());
        };
        let last = log.last_index();
        let to = to.min(last);
        if from > to {
            return Ok(Vec::new());
        }
        Ok(log.entries[(from - 1) as usize..to as usize].to_vec())
    }

    fn get_last_log_term(&self, member: MemberId) -> anyhow::Result<u64> {
        Ok(self.members.lock().get(&member).map(MemberLog::last_term).unwrap_or(0))
    }

    fn get_last_log_index(&self, member: MemberId) -> anyhow::Result<u64> {
        Ok(self.members.lock().get(&member).map(MemberLog::last_index).unwrap_or(0))
    }

    fn append_log_entry(&self, member: MemberId, entry: &LogEntry) -> anyhow::Result<()> {
        let mut members = self.members.lock();
        let log = members.entry(member).or_default();
        let expected = log.last_index() + 1;
        anyhow::ensure!(
            entry.index == expected,
            "out-of-order append for {member}: expected index {expected}, got {}",
            entry.index
        );
        log.entries.push(entry.clone());
        Ok(())
    }

    fn delete(&self, member: MemberId, from_index: u64) -> anyhow::Result<()> {
        let mut members = self.members.lock();
        let log = members.entry(member).or_default();
        if from_index == 0 {
            log.entries.clear();
        } else {
            log.entries.truncate((from_index - 1) as usize);
        }
        Ok(())
    }

    fn set_max_gap(&self, member: MemberId, gap: u64) -> anyhow::Result<()> {
        self.members.lock().entry(member).or_default().max_gap = gap;
        Ok(())
    }

    fn get_max_gap(&self, member: MemberId) -> anyhow::Result<u64> {
        Ok(self.members.lock().get(&member).map(|log| log.max_gap).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::new(index, term, Bytes::from_static(b"x"))
    }

    #[test]
    fn append_rejects_non_contiguous_index() {
        let storage = MemStorage::new();
        let m = MemberId(1);
        storage.append_log_entry(m, &entry(1, 1)).unwrap();
        assert!(storage.append_log_entry(m, &entry(3, 1)).is_err());
    }

    #[test]
    fn delete_truncates_suffix_then_allows_reappend() {
        let storage = MemStorage::new();
        let m = MemberId(1);
        storage.append_log_entry(m, &entry(1, 1)).unwrap();
        storage.append_log_entry(m, &entry(2, 1)).unwrap();
        storage.delete(m, 2).unwrap();
        assert_eq!(storage.get_last_log_index(m).unwrap(), 1);
        storage.append_log_entry(m, &entry(2, 2)).unwrap();
        assert_eq!(storage.get_last_log_term(m).unwrap(), 2);
    }

    #[test]
    fn delete_all_wipes_the_log() {
        let storage = MemStorage::new();
        let m = MemberId(1);
        storage.append_log_entry(m, &entry(1, 1)).unwrap();
        storage.delete_all(m).unwrap();
        assert_eq!(storage.get_last_log_index(m).unwrap(), 0);
    }

    #[test]
    fn get_log_entries_clamps_to_available_range() {
        let storage = MemStorage::new();
        let m = MemberId(1);
        for i in 1..=5 {
            storage.append_log_entry(m, &entry(i, 1)).unwrap();
        }
        let got = storage.get_log_entries(m, 3, 100).unwrap();
        assert_eq!(got.iter().map(|e| e.index).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn has_log_entry_matches_index_0_sentinel_only_at_term_0() {
        let storage = MemStorage::new();
        let m = MemberId(1);
        assert!(storage.has_log_entry(m, 0, 0).unwrap());
        assert!(!storage.has_log_entry(m, 0, 1).unwrap());
    }
}
