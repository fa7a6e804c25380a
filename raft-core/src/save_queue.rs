//! Durable log writing with concurrent workers and in-order commit of the
//! `savedIndex` watermark (§4.2 SaveQueue).

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::bounded;
use crossbeam_channel::Sender;

use crate::log::LogEntry;
use crate::storage::Storage;
use crate::MemberId;

/// One unit of work: durably write `entry`, first truncating the log from
/// `conflict_from` if this entry supersedes a previously-saved but
/// conflicting suffix (§4.2: "On a conflicting-term append, the SaveQueue
/// first invokes `Storage.delete(fromIndex)`").
struct SaveTask {
    entry: LogEntry,
    conflict_from: Option<u64>,
}

struct Shared {
    saved_index: Mutex<u64>,
    cond: Condvar,
    max_observed_gap: AtomicU64,
    stopped: AtomicBool,
}

impl Shared {
    /// Park until `saved_index == want - 1`, then advance to `want` and
    /// wake every other worker waiting on its own predecessor.
    fn advance_to(&self, want: u64) {
        let mut saved = self.saved_index.lock().unwrap();
        while *saved != want - 1 && !self.stopped.load(Ordering::Acquire) {
            let gap = want.saturating_sub(*saved);
            self.max_observed_gap.fetch_max(gap, Ordering::Relaxed);
            let (guard, _timeout) = self.cond.wait_timeout(saved, Duration::from_millis(200)).unwrap();
            saved = guard;
        }
        if *saved < want {
            *saved = want;
        }
        self.cond.notify_all();
    }
}

/// A bounded queue of pending durable writes for one member's log, drained
/// by a fixed worker pool (§4.2). `SaveQueue::new` wires the worker count
/// from `Config::save_queue_workers` (default 5).
pub struct SaveQueue {
    tx: Mutex<Option<Sender<SaveTask>>>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    member: MemberId,
    storage: Arc<dyn Storage>,
}

impl SaveQueue {
    /// `test_max_gap` is `Config::test_max_gap` — nonzero only in tests that
    /// drive the "missing-entry repair" scenario directly; in production
    /// the gap is whatever `Storage::get_max_gap` persisted at the last
    /// clean shutdown.
    pub fn start(
        member: MemberId,
        storage: Arc<dyn Storage>,
        worker_count: usize,
        queue_capacity: usize,
        test_max_gap: u64,
    ) -> anyhow::Result<Self> {
        let mut initial_saved = storage.get_last_log_index(member)?;
        let persisted_gap = storage.get_max_gap(member)?;
        let max_gap = if test_max_gap != 0 { test_max_gap } else { persisted_gap };

        // §4.2: on startup, a nonzero maxGap means the durable tail may not
        // reflect what was actually acknowledged before the last unclean
        // shutdown. Treat the trailing `max_gap` entries as conflicting:
        // discard them and lower the reported savedIndex so the leader's
        // next AppendEntries prefix check fails and re-streams them.
        if max_gap != 0 && initial_saved > 0 {
            let from_index = initial_saved.saturating_sub(max_gap - 1).max(1);
            tracing::warn!(%member, from_index, max_gap, "save queue: marking trailing entries conflicting after restart");
            storage.delete(member, from_index)?;
            storage.set_max_gap(member, 0)?;
            initial_saved = from_index - 1;
        }

        let shared = Arc::new(Shared {
            saved_index: Mutex::new(initial_saved),
            cond: Condvar::new(),
            max_observed_gap: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        });

        let (tx, rx) = bounded::<SaveTask>(queue_capacity);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count.max(1) {
            let rx = rx.clone();
            let storage = storage.clone();
            let shared = shared.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("save-queue-{}-{}", member, worker_id))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            if let Some(from) = task.conflict_from {
                                if let Err(err) = storage.delete(member, from) {
                                    tracing::error!(%member, error=%err, "save queue: delete before conflicting append failed");
                                    continue;
                                }
                            }
                            if let Err(err) = storage.append_log_entry(member, &task.entry) {
                                tracing::error!(%member, index = task.entry.index, error=%err, "save queue: append failed");
                                continue;
                            }
                            shared.advance_to(task.entry.index);
                        }
                    })?,
            );
        }

        Ok(Self { tx: Mutex::new(Some(tx)), shared, workers: Mutex::new(workers), member, storage })
    }

    /// Enqueue `entry` for durable writing, truncating the log from
    /// `conflict_from` first if this entry overwrites a previously-saved,
    /// now-stale suffix.
    pub fn enqueue(&self, entry: LogEntry, conflict_from: Option<u64>) -> anyhow::Result<()> {
        let guard = self.tx.lock().unwrap();
        let tx = guard.as_ref().ok_or_else(|| anyhow::anyhow!("save queue is shut down"))?;
        tx.send(SaveTask { entry, conflict_from }).map_err(|_| anyhow::anyhow!("save queue is shut down"))
    }

    pub fn saved_index(&self) -> u64 {
        *self.shared.saved_index.lock().unwrap()
    }

    /// Block until `saved_index() >= index` or `timeout` elapses. Used by a
    /// follower before it acknowledges an AppendEntries batch, so that
    /// `matchIndex` on the leader never outruns durability (§3 invariant:
    /// `commitIndex <= savedIndex <= lastIndex`).
    pub fn wait_for_saved(&self, index: u64, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut saved = self.shared.saved_index.lock().unwrap();
        while *saved < index {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return *saved >= index;
            }
            let (guard, timed_out) = self.shared.cond.wait_timeout(saved, remaining).unwrap();
            saved = guard;
            if timed_out.timed_out() && *saved < index {
                return false;
            }
        }
        true
    }

    /// The largest in-flight gap observed between the highest dispatched
    /// index and `saved_index` over this queue's lifetime; persisted as
    /// `maxGap` at clean shutdown (§4.2, §9 design note).
    pub fn max_observed_gap(&self) -> u64 {
        self.shared.max_observed_gap.load(Ordering::Relaxed)
    }

    /// Stop accepting work, join every worker, then persist the largest
    /// in-flight gap observed this run as the `maxGap` hint consulted by
    /// the next [`SaveQueue::start`] (§4.2, §9).
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.cond.notify_all();
        self.tx.lock().unwrap().take();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for w in workers {
            let _ = w.join();
        }
        if let Err(err) = self.storage.set_max_gap(self.member, self.max_observed_gap()) {
            tracing::error!(member = %self.member, error = %err, "save queue: persisting maxGap failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct Mem {
        entries: Mutex<Vec<LogEntry>>,
        max_gap: Mutex<u64>,
    }

    impl Storage for Mem {
        fn save_vote(&self, _m: MemberId, _t: u64, _v: Option<MemberId>) -> anyhow::Result<()> {
            Ok(())
        }
        fn get_vote(&self, _m: MemberId) -> anyhow::Result<crate::storage::PersistedVote> {
            Ok(Default::default())
        }
        fn has_log_entry(&self, _m: MemberId, index: u64, term: u64) -> anyhow::Result<bool> {
            Ok(self.entries.lock().unwrap().iter().any(|e| e.index == index && e.term == term))
        }
        fn get_log_entry(&self, _m: MemberId, index: u64) -> anyhow::Result<Option<LogEntry>> {
            Ok(self.entries.lock().unwrap().iter().find(|e| e.index == index).cloned())
        }
        fn get_log_entries(&self, _m: MemberId, from: u64, to: u64) -> anyhow::Result<Vec<LogEntry>> {
            Ok(self.entries.lock().unwrap().iter().filter(|e| e.index >= from && e.index <= to).cloned().collect())
        }
        fn get_last_log_term(&self, _m: MemberId) -> anyhow::Result<u64> {
            Ok(self.entries.lock().unwrap().last().map(|e| e.term).unwrap_or(0))
        }
        fn get_last_log_index(&self, _m: MemberId) -> anyhow::Result<u64> {
            Ok(self.entries.lock().unwrap().last().map(|e| e.index).unwrap_or(0))
        }
        fn append_log_entry(&self, _m: MemberId, entry: &LogEntry) -> anyhow::Result<()> {
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }
        fn delete(&self, _m: MemberId, from_index: u64) -> anyhow::Result<()> {
            self.entries.lock().unwrap().retain(|e| e.index < from_index);
            Ok(())
        }
        fn set_max_gap(&self, _m: MemberId, gap: u64) -> anyhow::Result<()> {
            *self.max_gap.lock().unwrap() = gap;
            Ok(())
        }
        fn get_max_gap(&self, _m: MemberId) -> anyhow::Result<u64> {
            Ok(*self.max_gap.lock().unwrap())
        }
    }

    fn storage() -> Arc<Mem> {
        Arc::new(Mem { entries: Mutex::new(Vec::new()), max_gap: Mutex::new(0) })
    }

    #[test]
    fn advances_contiguously_even_when_completed_out_of_order() {
        let storage = storage() as Arc<dyn Storage>;
        let q = SaveQueue::start(MemberId(1), storage, 4, 16, 0).unwrap();
        // Enqueue out of natural worker-completion order by racing many tasks.
        for i in 1..=20u64 {
            q.enqueue(LogEntry::new(i, 1, Bytes::from(format!("cmd{}", i))), None).unwrap();
        }
        assert!(q.wait_for_saved(20, Duration::from_secs(5)));
        assert_eq!(q.saved_index(), 20);
        q.shutdown();
    }

    #[test]
    fn wait_for_saved_times_out_below_target() {
        let storage = storage() as Arc<dyn Storage>;
        let q = SaveQueue::start(MemberId(1), storage, 1, 4, 0).unwrap();
        assert!(!q.wait_for_saved(5, Duration::from_millis(50)));
        q.shutdown();
    }

    #[test]
    fn restart_with_nonzero_max_gap_marks_trailing_entries_conflicting() {
        let storage = storage();
        for i in 1..=10u64 {
            storage.append_log_entry(MemberId(1), &LogEntry::new(i, 1, Bytes::from(format!("cmd{}", i)))).unwrap();
        }
        storage.set_max_gap(MemberId(1), 3).unwrap();

        let q = SaveQueue::start(MemberId(1), storage.clone() as Arc<dyn Storage>, 2, 8, 0).unwrap();
        // The last 3 entries (8, 9, 10) are discarded as potentially
        // conflicting, so savedIndex drops to 7 until the leader re-sends them.
        assert_eq!(q.saved_index(), 7);
        assert_eq!(storage.get_last_log_index(MemberId(1)).unwrap(), 7);
        assert_eq!(storage.get_max_gap(MemberId(1)).unwrap(), 0);
        q.shutdown();
    }

    #[test]
    fn clean_shutdown_persists_the_largest_observed_gap() {
        let storage = storage();
        let q = SaveQueue::start(MemberId(1), storage.clone() as Arc<dyn Storage>, 1, 8, 0).unwrap();
        for i in 1..=5u64 {
            q.enqueue(LogEntry::new(i, 1, Bytes::from(format!("cmd{}", i))), None).unwrap();
        }
        assert!(q.wait_for_saved(5, Duration::from_secs(5)));
        q.shutdown();
        // A single worker draining a small backlog in order observes no
        // meaningful gap; the persisted value should not exceed what ran.
        assert!(storage.get_max_gap(MemberId(1)).unwrap() <= 5);
    }
}
