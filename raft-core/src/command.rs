//! Pooled command objects and the wait-map (§3 DATA MODEL "Command", §4.5).

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex as PLMutex;

use crate::clock::WaitGate;
use crate::error::CommitError;
use crate::error::ReadError;

/// A command's lifecycle state (§3 DATA MODEL "Command").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    Free,
    Waiting,
    Committed,
    Timeout,
    Error,
}

struct CommandState {
    status: CommandStatus,
    /// On write: the submitter's payload, queued but not yet assigned an
    /// index. On read: the fetched bytes for a committed entry.
    payload: Option<Bytes>,
    index: u64,
    term: u64,
}

/// A pooled, reusable command slot. Returned in `FREE` state by
/// [`CommandPool::checkout`], driven through `WAITING` by `commit`, and
/// resolved to `COMMITTED`/`TIMEOUT`/`ERROR` by the owning `CoreMember`
/// when it observes the command's assigned index pass `commitIndex`.
pub struct Command {
    slot: usize,
    state: Mutex<CommandState>,
    gate: WaitGate,
    free_list: Arc<PLMutex<Vec<usize>>>,
}

impl Command {
    fn new(slot: usize, free_list: Arc<PLMutex<Vec<usize>>>) -> Self {
        Self {
            slot,
            state: Mutex::new(CommandState {
                status: CommandStatus::Free,
                payload: None,
                index: 0,
                term: 0,
            }),
            gate: WaitGate::new(),
            free_list,
        }
    }

    pub fn status(&self) -> CommandStatus {
        self.state.lock().unwrap().status
    }

    pub fn index(&self) -> u64 {
        self.state.lock().unwrap().index
    }

    pub fn term(&self) -> u64 {
        self.state.lock().unwrap().term
    }

    /// The bytes held by this command: the submitted payload while
    /// `WAITING`, or the fetched entry's bytes once resolved by a read.
    pub fn bytes(&self) -> Option<Bytes> {
        self.state.lock().unwrap().payload.clone()
    }

    pub fn string(&self) -> Option<String> {
        self.bytes().and_then(|b| String::from_utf8(b.to_vec()).ok())
    }

    /// Called by `CoreMember` once this command's entry has been assigned
    /// a log index and handed to the `SaveQueue`/peers.
    pub(crate) fn mark_waiting(&self, index: u64, term: u64) {
        let mut state = self.state.lock().unwrap();
        state.status = CommandStatus::Waiting;
        state.index = index;
        state.term = term;
    }

    pub(crate) fn resolve(&self, status: CommandStatus) {
        let mut state = self.state.lock().unwrap();
        // A TIMEOUT is not rollback (§4.5): a later COMMITTED must still be
        // observable by whoever calls `status()` after the fact is not
        // required here, but we must not let a stale COMMITTED regress a
        // later ERROR or vice versa after the caller already moved on. We
        // only ever transition WAITING -> {COMMITTED, TIMEOUT, ERROR}, and
        // the transition is sticky: further commit-index advances after a
        // TIMEOUT still flip status to COMMITTED if observed in time.
        if state.status == CommandStatus::Waiting || status == CommandStatus::Committed {
            state.status = status;
        }
        drop(state);
        self.gate.notify_all();
    }

    pub(crate) fn set_read_result(&self, index: u64, term: u64, payload: Bytes) {
        let mut state = self.state.lock().unwrap();
        state.index = index;
        state.term = term;
        state.payload = Some(payload);
        state.status = CommandStatus::Committed;
        drop(state);
        self.gate.notify_all();
    }

    pub(crate) fn wait_gate(&self) -> WaitGate {
        self.gate.clone()
    }

    /// Stage `payload` so it's visible to `bytes()` before this command is
    /// handed to the `CoreMember` thread — called ahead of enqueuing so
    /// `handle_command` never races a not-yet-written payload (§4.5).
    pub(crate) fn stage_payload(&self, payload: Bytes) {
        self.state.lock().unwrap().payload = Some(payload);
    }

    /// Block the caller until this command resolves to `COMMITTED` or the
    /// timeout elapses, in which case the status becomes `TIMEOUT` (§4.5).
    pub fn commit_blocking(&self, payload: Bytes, timeout: Duration) -> Result<(), CommitError> {
        self.stage_payload(payload);
        let ok = self.gate.wait_while(timeout, || {
            matches!(self.state.lock().unwrap().status, CommandStatus::Free | CommandStatus::Waiting)
        });
        if !ok {
            let mut state = self.state.lock().unwrap();
            if state.status == CommandStatus::Waiting {
                state.status = CommandStatus::Timeout;
            }
        }
        match self.status() {
            CommandStatus::Committed => Ok(()),
            CommandStatus::Timeout => Err(CommitError::Timeout),
            CommandStatus::Error => Err(CommitError::Shutdown),
            _ => Err(CommitError::Shutdown),
        }
    }

    /// Release this command back to its pool's free-list, resetting it to
    /// `FREE`.
    pub fn release(self: &Arc<Self>) {
        self.free_list.lock().push(self.slot);
        let mut state = self.state.lock().unwrap();
        *state = CommandState {
            status: CommandStatus::Free,
            payload: None,
            index: 0,
            term: 0,
        };
    }
}

/// Blocks until `predicate` observes `commit_index >= index`, per
/// `getCommittedCommand`'s contract (§4.5).
pub fn wait_for_index(gate: &WaitGate, timeout: Duration, index: u64, current: impl Fn() -> u64) -> Result<(), ReadError> {
    if index == 0 {
        return Err(ReadError::InvalidIndex);
    }
    let ok = gate.wait_while(timeout, || current() < index);
    if ok || current() >= index {
        Ok(())
    } else {
        Err(ReadError::Timeout)
    }
}

/// A fixed-capacity free-list of pooled [`Command`] slots.
#[derive(Clone)]
pub struct CommandPool {
    slots: Arc<Vec<Arc<Command>>>,
    free: Arc<PLMutex<Vec<usize>>>,
}

impl CommandPool {
    pub fn new(capacity: usize) -> Self {
        let free = Arc::new(PLMutex::new((0..capacity).rev().collect::<Vec<_>>()));
        let slots: Vec<Arc<Command>> =
            (0..capacity).map(|slot| Arc::new(Command::new(slot, free.clone()))).collect();
        Self {
            slots: Arc::new(slots),
            free,
        }
    }

    /// Returns a `FREE` command, or `None` if the pool is exhausted.
    pub fn checkout(&self) -> Option<Arc<Command>> {
        let slot = self.free.lock().pop()?;
        Some(self.slots[slot].clone())
    }
}
