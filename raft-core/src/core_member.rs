//! The per-member Raft state machine (§4.3 CoreMember).
//!
//! One `std::thread` per `CoreMember` runs [`CoreMember::run`], racing the
//! incoming-message channel against the command channel with a
//! `Clock`-driven deadline, exactly the "multi-way wait with a
//! Clock-driven wakeup" described in §5.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::bounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Select;
use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::clock::WaitGate;
use crate::command::wait_for_index;
use crate::command::Command;
use crate::command::CommandPool;
use crate::command::CommandStatus;
use crate::config::Config;
use crate::error::CommitError;
use crate::error::ReadError;
use crate::error::SlaveError;
use crate::error::Suppressor;
use crate::log::LogEntry;
use crate::log::LogPosition;
use crate::message::Message;
use crate::message::MessageBody;
use crate::message::MessagePool;
use crate::metrics::MetricsSink;
use crate::network::Network;
use crate::peer::Peer;
use crate::peer::PeerThreads;
use crate::peer::ReplicationWindow;
use crate::quorum;
use crate::save_queue::SaveQueue;
use crate::storage::Storage;
use crate::storage::StoragePayloadExt;
use crate::MemberId;
use crate::Role;
use crate::RoleChangeEvent;
use crate::ShardId;

struct CandidateState {
    votes: HashMap<MemberId, bool>,
    next_retry: Instant,
}

/// Per-peer replication bookkeeping kept only while this member is leader
/// (§4.3 `LeaderState`).
struct LeaderState {
    last_heard_from: HashMap<MemberId, Instant>,
}

enum RoleState {
    Follower,
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl RoleState {
    fn public(&self) -> Role {
        match self {
            RoleState::Follower => Role::Follower,
            RoleState::Candidate(_) => Role::Candidate,
            RoleState::Leader(_) => Role::Leader,
        }
    }
}

/// Snapshot returned by [`CoreMember::slave_status`] (§4.3 Slave mode).
#[derive(Clone, Debug, Default)]
pub struct SlaveStatus {
    pub running: bool,
    pub master: Option<MemberId>,
}

struct PeerEntry {
    peer: Arc<Peer>,
    threads: PeerThreads,
    window: Arc<ReplicationWindow>,
}

/// The Raft state machine for one member of one shard.
pub struct CoreMember {
    member: MemberId,
    shard: ShardId,
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    network: Arc<dyn Network>,
    pool: MessagePool,
    metrics: Arc<dyn MetricsSink>,

    peers: Mutex<HashMap<MemberId, PeerEntry>>,
    member_count: usize,

    /// Cross-shard slaves mirroring this member while it is leader (§4.3).
    /// Never counted toward quorum; populated as other members dial in via
    /// [`Network::accept`] and drained on step-down.
    slaves: Mutex<HashMap<MemberId, PeerEntry>>,
    acceptor_thread: Mutex<Option<JoinHandle<()>>>,

    command_pool: CommandPool,
    command_tx: Sender<Arc<Command>>,
    command_rx: Receiver<Arc<Command>>,
    incoming_tx: Sender<Message>,
    incoming_rx: Receiver<Message>,

    current_term: AtomicU64,
    voted_for: Mutex<Option<MemberId>>,
    commit_index: AtomicU64,
    commit_gate: WaitGate,
    is_leader: AtomicBool,
    leader_hint: Mutex<Option<MemberId>>,
    role: Mutex<RoleState>,
    election_deadline: Mutex<Instant>,

    wait_map: Mutex<BTreeMap<u64, Arc<Command>>>,
    waiting_count: AtomicU64,

    save_queue: SaveQueue,

    slave_master: Mutex<Option<MemberId>>,
    slave_peer: Mutex<Option<(Arc<Peer>, PeerThreads)>>,

    enabled: AtomicBool,
    stop: Arc<AtomicBool>,
    /// Role-change events are handed off here rather than fired inline, so
    /// listener callbacks never run on the Raft hot path (§4.6).
    events_tx: Sender<RoleChangeEvent>,
    suppressor: Suppressor,
}

impl CoreMember {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        member: MemberId,
        shard: ShardId,
        peer_members: Vec<MemberId>,
        config: Arc<Config>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        network: Arc<dyn Network>,
        pool: MessagePool,
        metrics: Arc<dyn MetricsSink>,
        events_tx: Sender<RoleChangeEvent>,
    ) -> (Arc<CoreMember>, JoinHandle<()>) {
        let (command_tx, command_rx) = bounded(config.command_queue_size);
        let (incoming_tx, incoming_rx) = bounded(config.incoming_queue_size);

        let persisted = storage.get_vote(member).unwrap_or_default();
        let save_queue = SaveQueue::start(
            member,
            storage.clone(),
            config.save_queue_workers,
            config.command_queue_size,
            config.test_max_gap(),
        )
        .expect("start save queue");

        let this = Arc::new(CoreMember {
            member,
            shard,
            config: config.clone(),
            storage: storage.clone(),
            clock: clock.clone(),
            network: network.clone(),
            pool: pool.clone(),
            metrics,
            peers: Mutex::new(HashMap::new()),
            member_count: peer_members.len() + 1,
            slaves: Mutex::new(HashMap::new()),
            acceptor_thread: Mutex::new(None),
            command_pool: CommandPool::new(config.command_queue_size),
            command_tx,
            command_rx,
            incoming_tx: incoming_tx.clone(),
            incoming_rx,
            current_term: AtomicU64::new(persisted.term),
            voted_for: Mutex::new(persisted.voted_for),
            commit_index: AtomicU64::new(0),
            commit_gate: WaitGate::new(),
            is_leader: AtomicBool::new(false),
            leader_hint: Mutex::new(None),
            role: Mutex::new(RoleState::Follower),
            election_deadline: Mutex::new(clock.now() + Duration::from_millis(config.new_rand_election_timeout())),
            wait_map: Mutex::new(BTreeMap::new()),
            waiting_count: AtomicU64::new(0),
            save_queue,
            slave_master: Mutex::new(None),
            slave_peer: Mutex::new(None),
            enabled: AtomicBool::new(true),
            stop: Arc::new(AtomicBool::new(false)),
            events_tx,
            suppressor: Suppressor::per_minute(),
        });

        {
            let mut peers = this.peers.lock();
            for remote in peer_members {
                let window = Arc::new(ReplicationWindow::default());
                let (peer, threads) = Peer::spawn(
                    member,
                    remote,
                    shard,
                    network.clone(),
                    storage.clone(),
                    pool.clone(),
                    config.clone(),
                    clock.clone(),
                    window.clone(),
                    incoming_tx.clone(),
                );
                peers.insert(remote, PeerEntry { peer, threads, window });
            }
        }

        {
            let this = this.clone();
            let network = network.clone();
            let acceptor = std::thread::Builder::new()
                .name(format!("core-member-acceptor-{}", member))
                .spawn(move || this.run_acceptor(network))
                .expect("spawn core member acceptor thread");
            *this.acceptor_thread.lock() = Some(acceptor);
        }

        let handle = {
            let this = this.clone();
            std::thread::Builder::new()
                .name(format!("core-member-{}", member))
                .spawn(move || this.run())
                .expect("spawn core member thread")
        };

        (this, handle)
    }

    /// Drains unsolicited dials (cross-shard slaves attaching to us while we
    /// lead) and wires each into a replication [`Peer`] alongside the
    /// configured ones, excluded from quorum (§4.3 Slave mode).
    fn run_acceptor(&self, network: Arc<dyn Network>) {
        while !self.stop.load(Ordering::Acquire) {
            match network.accept(self.member) {
                Ok(Some((remote, _channel))) => {
                    if self.peers.lock().contains_key(&remote) || self.slaves.lock().contains_key(&remote) {
                        continue;
                    }
                    if !self.is_leader() {
                        tracing::debug!(remote = %remote, "core member: dropping slave dial, not a leader");
                        continue;
                    }
                    let window = Arc::new(ReplicationWindow::default());
                    window.term.store(self.current_term(), Ordering::Release);
                    window.commit_index.store(self.commit_index(), Ordering::Release);
                    let (last_index, _) = self.last_log_position();
                    window.last_index.store(last_index, Ordering::Release);
                    let (peer, threads) = Peer::spawn(
                        self.member,
                        remote,
                        self.shard,
                        network.clone(),
                        self.storage.clone(),
                        self.pool.clone(),
                        self.config.clone(),
                        self.clock.clone(),
                        window.clone(),
                        self.incoming_tx.clone(),
                    );
                    self.slaves.lock().insert(remote, PeerEntry { peer, threads, window });
                }
                Ok(None) => {}
                Err(err) => {
                    if let Some(suppressed) = self.suppressor.gate("acceptor") {
                        tracing::warn!(error = %err, suppressed, "core member: accept failed");
                    }
                }
            }
        }
    }

    /// Tears down every attached slave, e.g. on step-down (§4.3 "the safe
    /// choice is to stop the slave").
    fn drop_slaves(&self) {
        for entry in self.slaves.lock().drain().map(|(_, v)| v) {
            entry.peer.shutdown();
            let _ = entry.threads.send.join();
            let _ = entry.threads.receive.join();
        }
    }

    pub fn member(&self) -> MemberId {
        self.member
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn leader_hint(&self) -> Option<MemberId> {
        *self.leader_hint.lock()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }

    pub fn checkout_command(&self) -> Option<Arc<Command>> {
        self.command_pool.checkout()
    }

    pub fn enable(&self, on: bool) {
        self.enabled.store(on, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn slave_status(&self) -> SlaveStatus {
        let master = *self.slave_master.lock();
        let running = master.is_some()
            && self.slave_peer.lock().as_ref().map(|(peer, _)| peer.is_slave_operational()).unwrap_or(false);
        SlaveStatus { running, master }
    }

    /// Submit a checked-out command for replication, then block until it
    /// commits or times out (§6 `Command.commit`).
    pub fn submit(&self, command: &Arc<Command>, payload: Bytes, timeout: Duration) -> Result<(), CommitError> {
        if payload.len() > self.config.command_max_size {
            return Err(CommitError::PayloadTooLarge { max: self.config.command_max_size, got: payload.len() });
        }
        if self.slave_master.lock().is_some() {
            return Err(CommitError::SlaveMode);
        }
        if !self.is_leader() {
            return Err(CommitError::NotLeader { leader_hint: self.leader_hint() });
        }
        command.stage_payload(payload.clone());
        self.command_tx.send(command.clone()).map_err(|_| CommitError::Shutdown)?;
        command.commit_blocking(payload, timeout)
    }

    /// Block until `commitIndex >= index`, then return the entry's bytes
    /// (§6 `Shard.getCommittedCommand`).
    pub fn read_committed(&self, index: u64, timeout: Duration) -> Result<Bytes, ReadError> {
        if index == 0 {
            return Err(ReadError::InvalidIndex);
        }
        if self.slave_master.lock().is_some() && index != 1 {
            return Err(ReadError::SlaveMode);
        }
        wait_for_index(&self.commit_gate, timeout, index, || self.commit_index())?;
        self.storage
            .get_payload(self.member, index)
            .map_err(|_| ReadError::Timeout)?
            .ok_or(ReadError::Timeout)
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(acceptor) = self.acceptor_thread.lock().take() {
            let _ = acceptor.join();
        }
        for entry in self.peers.lock().drain().map(|(_, v)| v) {
            entry.peer.shutdown();
            let _ = entry.threads.send.join();
            let _ = entry.threads.receive.join();
        }
        self.drop_slaves();
        if let Some((peer, threads)) = self.slave_peer.lock().take() {
            peer.shutdown();
            let _ = threads.send.join();
            let _ = threads.receive.join();
        }
        self.save_queue.shutdown();
    }

    /// Place this member into slave mode against `master`, a member of a
    /// different shard (§4.3 Slave mode). Wipes the local log and begins
    /// mirroring `master`'s log as a passive, non-voting observer.
    pub fn set_slave(&self, master: Option<MemberId>) -> Result<(), SlaveError> {
        if let Some(master) = master {
            if self.peers.lock().contains_key(&master) || master == self.member {
                return Err(SlaveError::SameShard);
            }
            self.storage.delete_all(self.member).map_err(|_| SlaveError::Shutdown)?;
            *self.role.lock() = RoleState::Follower;
            self.is_leader.store(false, Ordering::Release);

            let mut slot = self.slave_peer.lock();
            if let Some((old, _)) = slot.take() {
                old.shutdown();
            }
            let window = Arc::new(ReplicationWindow::default());
            let (peer, threads) = Peer::spawn(
                self.member,
                master,
                self.shard,
                self.network.clone(),
                self.storage.clone(),
                self.pool.clone(),
                self.config.clone(),
                self.clock.clone(),
                window,
                self.incoming_tx.clone(),
            );
            *slot = Some((peer, threads));
            *self.slave_master.lock() = Some(master);
        } else {
            let mut slot = self.slave_peer.lock();
            if let Some((peer, _)) = slot.take() {
                peer.shutdown();
            }
            *self.slave_master.lock() = None;
        }
        Ok(())
    }

    fn run(&self) {
        while !self.stop.load(Ordering::Acquire) {
            let wait = self.next_wait();
            let mut sel = Select::new();
            let inc_idx = sel.recv(&self.incoming_rx);
            let allow_commands = self.is_leader() && self.waiting_count.load(Ordering::Acquire) < self.config.wait_queue_throttle_size as u64;
            let cmd_idx = if allow_commands { Some(sel.recv(&self.command_rx)) } else { None };

            match sel.select_timeout(wait) {
                Ok(op) => {
                    let idx = op.index();
                    if idx == inc_idx {
                        if let Ok(message) = op.recv(&self.incoming_rx) {
                            self.handle_message(message);
                        }
                    } else if Some(idx) == cmd_idx {
                        if let Ok(command) = op.recv(&self.command_rx) {
                            self.handle_command(command);
                        }
                    }
                }
                Err(_) => self.on_timer(),
            }
        }
    }

    fn next_wait(&self) -> Duration {
        let now = self.clock.now();
        match &*self.role.lock() {
            RoleState::Follower => self.election_deadline.lock().saturating_duration_since(now).max(Duration::from_millis(1)),
            RoleState::Candidate(c) => c.next_retry.saturating_duration_since(now).max(Duration::from_millis(1)),
            RoleState::Leader(_) => Duration::from_millis(self.config.heartbeat_period_ms),
        }
    }

    fn on_timer(&self) {
        let now = self.clock.now();
        enum Action {
            None,
            StartElection,
            RetryVoteBroadcast,
            CheckLeaderTimeout,
        }
        let action = {
            let mut role = self.role.lock();
            let deadline = *self.election_deadline.lock();
            match &mut *role {
                RoleState::Follower => {
                    if now >= deadline {
                        Action::StartElection
                    } else {
                        Action::None
                    }
                }
                RoleState::Candidate(c) => {
                    if now >= deadline {
                        Action::StartElection
                    } else if now >= c.next_retry {
                        c.next_retry = now + Duration::from_millis(self.config.new_rand_request_vote_period());
                        Action::RetryVoteBroadcast
                    } else {
                        Action::None
                    }
                }
                RoleState::Leader(_) => Action::CheckLeaderTimeout,
            }
        };
        match action {
            Action::StartElection => self.start_election(),
            Action::RetryVoteBroadcast => self.broadcast_request_vote(),
            Action::CheckLeaderTimeout => self.check_leader_timeout(now),
            Action::None => {}
        }
    }

    fn check_leader_timeout(&self, now: Instant) {
        let responsive = {
            let role = self.role.lock();
            match &*role {
                RoleState::Leader(state) => {
                    1 + state
                        .last_heard_from
                        .values()
                        .filter(|t| now.saturating_duration_since(**t) < Duration::from_millis(self.config.leader_timeout_ms))
                        .count()
                }
                _ => return,
            }
        };
        if responsive < quorum::majority(self.member_count) {
            if let Some(suppressed) = self.suppressor.gate("leader-timeout") {
                tracing::warn!(member = %self.member, responsive, suppressed, "core member: insufficient responsive followers, stepping down");
            }
            self.become_follower(self.current_term());
        }
    }

    fn current_term(&self) -> u64 {
        self.current_term.load(Ordering::Acquire)
    }

    fn start_election(&self) {
        if self.slave_master.lock().is_some() {
            // A passive, non-voting mirror never contests its own shard.
            return;
        }
        if !self.is_enabled() {
            // A disabled member still votes and follows, but never
            // campaigns for candidate or leader (§4.3 enable/disable).
            return;
        }
        let term = self.current_term() + 1;
        self.current_term.store(term, Ordering::Release);
        *self.voted_for.lock() = Some(self.member);
        let _ = self.storage.save_vote(self.member, term, Some(self.member));

        let mut votes = HashMap::new();
        votes.insert(self.member, true);
        let next_retry = self.clock.now() + Duration::from_millis(self.config.new_rand_request_vote_period());
        *self.role.lock() = RoleState::Candidate(CandidateState { votes, next_retry });
        *self.election_deadline.lock() = self.clock.now() + Duration::from_millis(self.config.new_rand_election_timeout());
        self.is_leader.store(false, Ordering::Release);
        self.metrics.election_started(self.shard, self.member, term);
        self.fire_role_change(Role::Follower, Role::Candidate, None);
        self.broadcast_request_vote();

        if quorum::majority(self.member_count) == 1 {
            self.become_leader();
        }
    }

    fn broadcast_request_vote(&self) {
        let (last_index, last_term) = self.last_log_position();
        let term = self.current_term();
        for entry in self.peers.lock().values() {
            let msg = self.pool.checkout(
                self.member,
                MessageBody::RequestVote {
                    term,
                    candidate_id: self.member,
                    last_log_index: last_index,
                    last_log_term: last_term,
                },
            );
            let _ = entry.peer.enqueue(msg);
        }
    }

    fn last_log_position(&self) -> (u64, u64) {
        let index = self.storage.get_last_log_index(self.member).unwrap_or(0);
        let term = self.storage.get_last_log_term(self.member).unwrap_or(0);
        (index, term)
    }

    fn become_follower(&self, term: u64) {
        let old = self.role.lock().public();
        self.current_term.store(term, Ordering::Release);
        *self.role.lock() = RoleState::Follower;
        self.is_leader.store(false, Ordering::Release);
        *self.election_deadline.lock() = self.clock.now() + Duration::from_millis(self.config.new_rand_election_timeout());
        self.fire_role_change(old, Role::Follower, self.leader_hint());
        self.fail_outstanding(CommandStatus::Error);
        self.drop_slaves();
    }

    fn become_leader(&self) {
        let old = self.role.lock().public();
        *self.role.lock() = RoleState::Leader(LeaderState { last_heard_from: HashMap::new() });
        self.is_leader.store(true, Ordering::Release);
        *self.leader_hint.lock() = Some(self.member);
        let term = self.current_term();

        let last_index = self.storage.get_last_log_index(self.member).unwrap_or(0);
        for entry in self.peers.lock().values().chain(self.slaves.lock().values()) {
            entry.peer.set_next_index(last_index + 1);
            entry.peer.set_match_index(0);
            entry.window.term.store(term, Ordering::Release);
            entry.window.commit_index.store(self.commit_index(), Ordering::Release);
            entry.window.last_index.store(last_index, Ordering::Release);
        }

        self.fire_role_change(old, Role::Leader, Some(self.member));

        if self.config.write_empty_command_after_election() {
            let (last_index, _) = self.last_log_position();
            let entry = LogEntry::noop(last_index + 1, term);
            self.append_and_dispatch(vec![entry]);
        }
    }

    fn fire_role_change(&self, old: Role, new: Role, leader: Option<MemberId>) {
        self.metrics.role_changed(self.shard, self.member, new);
        let event = RoleChangeEvent { member: self.member, shard: self.shard, old_role: old, new_role: new, leader };
        let _ = self.events_tx.send(event);
    }

    /// Build one `AppendEntries` batch from `command` and, when
    /// `gondola.batching` is enabled, every other command already sitting
    /// in the queue (§4.3 batching, §6 `gondola.batching`).
    fn handle_command(&self, command: Arc<Command>) {
        let mut commands = vec![command];
        if self.config.batching() {
            while let Ok(next) = self.command_rx.try_recv() {
                commands.push(next);
            }
        }

        let term = self.current_term();
        let (mut index, _) = self.last_log_position();
        let mut entries = Vec::with_capacity(commands.len());
        for command in commands {
            index += 1;
            let payload = command.bytes().unwrap_or_default();
            command.mark_waiting(index, term);
            self.wait_map.lock().insert(index, command);
            self.waiting_count.fetch_add(1, Ordering::AcqRel);
            entries.push(LogEntry::new(index, term, payload));
        }
        self.append_and_dispatch(entries);
    }

    fn append_and_dispatch(&self, entries: Vec<LogEntry>) {
        let term = self.current_term();
        let commit_index = self.commit_index();
        for entry in &entries {
            let _ = self.save_queue.enqueue(entry.clone(), None);
        }
        let last_index = entries.last().map(|e| e.index).unwrap_or(0);
        let prev_index = entries.first().map(|e| e.index - 1).unwrap_or(0);
        let prev_term = if prev_index == 0 {
            0
        } else {
            self.storage.get_log_entry(self.member, prev_index).ok().flatten().map(|e| e.term).unwrap_or(0)
        };
        self.metrics.append_entries_sent(self.shard, self.member, entries.len());
        for entry in self.peers.lock().values().chain(self.slaves.lock().values()) {
            entry.window.term.store(term, Ordering::Release);
            entry.window.commit_index.store(commit_index, Ordering::Release);
            entry.window.last_index.store(last_index, Ordering::Release);
            let msg = self.pool.checkout_append_entries(self.member, term, prev_index, prev_term, entries.clone(), commit_index);
            let _ = entry.peer.enqueue(msg);
        }
        self.maybe_advance_commit();
    }

    fn handle_message(&self, message: Message) {
        let sender = message.from();
        match message.body() {
            MessageBody::RequestVote { term, candidate_id, last_log_index, last_log_term } => {
                self.handle_request_vote(*term, *candidate_id, *last_log_index, *last_log_term);
            }
            MessageBody::RequestVoteReply { term, vote_granted } => {
                self.handle_request_vote_reply(sender, *term, *vote_granted);
            }
            MessageBody::AppendEntries { term, leader_id, prev_log_index, prev_log_term, entries, leader_commit } => {
                self.handle_append_entries(*term, *leader_id, *prev_log_index, *prev_log_term, entries, *leader_commit);
            }
            MessageBody::AppendEntriesReply { term, success, last_index } => {
                self.handle_append_entries_reply(sender, *term, *success, *last_index);
            }
        }
    }

    fn handle_request_vote(&self, term: u64, candidate_id: MemberId, last_log_index: u64, last_log_term: u64) {
        if term > self.current_term() {
            self.become_follower(term);
            *self.voted_for.lock() = None;
        }
        let current_term = self.current_term();
        let mut granted = false;
        if term == current_term {
            let mut voted_for = self.voted_for.lock();
            let can_vote = voted_for.is_none() || *voted_for == Some(candidate_id);
            let (our_index, our_term) = self.last_log_position();
            let candidate_up_to_date = LogPosition { term: last_log_term, index: last_log_index } >= LogPosition { term: our_term, index: our_index };
            if can_vote && candidate_up_to_date {
                *voted_for = Some(candidate_id);
                drop(voted_for);
                let _ = self.storage.save_vote(self.member, term, Some(candidate_id));
                *self.election_deadline.lock() = self.clock.now() + Duration::from_millis(self.config.new_rand_election_timeout());
                granted = true;
            }
        }
        if let Some(entry) = self.peers.lock().get(&candidate_id) {
            let msg = self.pool.checkout(self.member, MessageBody::RequestVoteReply { term: self.current_term(), vote_granted: granted });
            let _ = entry.peer.enqueue(msg);
        }
    }

    fn handle_request_vote_reply(&self, sender: MemberId, term: u64, vote_granted: bool) {
        if term > self.current_term() {
            self.become_follower(term);
            return;
        }
        let mut become_leader = false;
        {
            let mut role = self.role.lock();
            if let RoleState::Candidate(state) = &mut *role {
                if term == self.current_term() {
                    state.votes.insert(sender, vote_granted);
                    let granted = 1 + state.votes.values().filter(|v| **v).count();
                    if granted >= quorum::majority(self.member_count) {
                        become_leader = true;
                    }
                }
            }
        }
        if become_leader {
            self.become_leader();
        }
    }

    fn handle_append_entries(&self, term: u64, leader_id: MemberId, prev_log_index: u64, prev_log_term: u64, entries: &[LogEntry], leader_commit: u64) {
        if term < self.current_term() {
            self.reply_append_entries(leader_id, false, self.storage.get_last_log_index(self.member).unwrap_or(0));
            return;
        }
        let currently_follower = matches!(&*self.role.lock(), RoleState::Follower);
        if term > self.current_term() || !currently_follower {
            self.become_follower(term);
        }
        *self.leader_hint.lock() = Some(leader_id);
        *self.election_deadline.lock() = self.clock.now() + Duration::from_millis(self.config.new_rand_election_timeout());

        let matches_prefix = prev_log_index == 0 || self.storage.has_log_entry(self.member, prev_log_index, prev_log_term).unwrap_or(false);
        if !matches_prefix {
            self.reply_append_entries(leader_id, false, self.storage.get_last_log_index(self.member).unwrap_or(0));
            return;
        }

        let mut highest_new = prev_log_index;
        for entry in entries {
            match self.storage.get_log_entry(self.member, entry.index).ok().flatten() {
                Some(existing) if existing.term == entry.term => {
                    highest_new = entry.index;
                    continue;
                }
                Some(_) => {
                    let _ = self.save_queue.enqueue(entry.clone(), Some(entry.index));
                }
                None => {
                    let _ = self.save_queue.enqueue(entry.clone(), None);
                }
            }
            highest_new = entry.index;
        }

        if highest_new > prev_log_index {
            self.save_queue.wait_for_saved(highest_new, Duration::from_millis(self.config.leader_timeout_ms));
        }

        if leader_commit > self.commit_index() {
            let new_commit = leader_commit.min(highest_new);
            self.advance_commit_to(new_commit);
        }

        self.reply_append_entries(leader_id, true, highest_new);
    }

    fn reply_append_entries(&self, to: MemberId, success: bool, last_index: u64) {
        let term = self.current_term();
        if let Some(entry) = self.peers.lock().get(&to) {
            let msg = self.pool.checkout(self.member, MessageBody::AppendEntriesReply { term, success, last_index });
            let _ = entry.peer.enqueue(msg);
        } else if let Some((peer, _)) = self.slave_peer.lock().as_ref() {
            if peer.remote() == to {
                let msg = self.pool.checkout(self.member, MessageBody::AppendEntriesReply { term, success, last_index });
                let _ = peer.enqueue(msg);
            }
        }
    }

    fn handle_append_entries_reply(&self, sender: MemberId, term: u64, success: bool, last_index: u64) {
        if term > self.current_term() {
            self.become_follower(term);
            return;
        }
        let mut role = self.role.lock();
        if let RoleState::Leader(state) = &mut *role {
            state.last_heard_from.insert(sender, self.clock.now());
        }
        drop(role);

        let peer = self
            .peers
            .lock()
            .get(&sender)
            .map(|e| e.peer.clone())
            .or_else(|| self.slaves.lock().get(&sender).map(|e| e.peer.clone()));
        if let Some(peer) = peer {
            if success {
                peer.set_match_index(last_index);
                peer.set_next_index(last_index + 1);
            } else {
                peer.set_next_index(last_index + 1);
            }
        }
        self.maybe_advance_commit();
    }

    fn maybe_advance_commit(&self) {
        if !self.is_leader() {
            return;
        }
        let mut indices = vec![self.save_queue.saved_index()];
        for entry in self.peers.lock().values() {
            indices.push(entry.peer.match_index());
        }
        let candidate = quorum::majority_index(indices);
        let candidate_term = self.storage.get_log_entry(self.member, candidate).ok().flatten().map(|e| e.term);
        // Raft safety: a leader may only commit entries from its own term
        // directly; older-term entries commit as a side effect once a
        // same-term entry at a higher index has committed.
        if candidate > self.commit_index() && candidate_term == Some(self.current_term()) {
            self.advance_commit_to(candidate);
        }
    }

    fn advance_commit_to(&self, new_commit: u64) {
        let old = self.commit_index.fetch_max(new_commit, Ordering::AcqRel);
        if new_commit <= old {
            return;
        }
        self.commit_gate.notify_all();
        self.metrics.command_committed(self.shard, new_commit);

        let mut wait_map = self.wait_map.lock();
        let resolved: Vec<_> = wait_map.range(..=new_commit).map(|(i, c)| (*i, c.clone())).collect();
        for (index, _) in &resolved {
            wait_map.remove(index);
        }
        drop(wait_map);
        for (_, command) in resolved {
            command.resolve(CommandStatus::Committed);
            self.waiting_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn fail_outstanding(&self, status: CommandStatus) {
        let mut wait_map = self.wait_map.lock();
        let drained: Vec<_> = std::mem::take(&mut *wait_map).into_values().collect();
        drop(wait_map);
        for command in drained {
            command.resolve(status);
            self.waiting_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::metrics::test_support::RecordingMetricsSink;
    use crate::metrics::NoopMetricsSink;
    use bytes::Bytes;
    use crossbeam_channel::unbounded;
    use raft_memstore::LoopbackHub;
    use raft_memstore::MemStorage;

    /// A single-member "shard": `member_count == 1`, so the `quorum::majority
    /// == 1` fast path in `start_election` lets it self-elect without a
    /// real vote exchange.
    fn lone_member(config: Config, metrics: Arc<dyn MetricsSink>) -> (Arc<CoreMember>, JoinHandle<()>) {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let network: Arc<dyn Network> = Arc::new(LoopbackHub::new());
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let (events_tx, _events_rx) = unbounded();
        CoreMember::spawn(MemberId(1), ShardId(1), Vec::new(), Arc::new(config), storage, clock, network, MessagePool::new(), metrics, events_tx)
    }

    #[test]
    fn disabled_member_never_becomes_candidate_or_leader() {
        let config = ConfigBuilder::new("t").heartbeat_period_ms(10).election_timeout_ms(30).build();
        let (this, handle) = lone_member(config, Arc::new(NoopMetricsSink));
        this.enable(false);

        std::thread::sleep(Duration::from_millis(150));
        assert!(!this.is_leader(), "a disabled member must not self-elect, even as the only member of its shard");
        assert!(matches!(&*this.role.lock(), RoleState::Follower), "a disabled member stays a follower");

        this.shutdown();
        let _ = handle.join();
    }

    #[test]
    fn a_disabled_member_still_votes_and_follows() {
        let config = ConfigBuilder::new("t").heartbeat_period_ms(10).election_timeout_ms(30_000).build();
        let (this, handle) = lone_member(config, Arc::new(NoopMetricsSink));
        this.enable(false);

        this.handle_request_vote(1, MemberId(2), 0, 0);
        assert_eq!(*this.voted_for.lock(), Some(MemberId(2)), "enable(false) only withholds candidacy, not the ballot");

        this.shutdown();
        let _ = handle.join();
    }

    #[test]
    fn enabled_lone_member_self_elects_via_the_majority_of_one_fast_path() {
        let config = ConfigBuilder::new("t").heartbeat_period_ms(10).election_timeout_ms(30).build();
        let (this, handle) = lone_member(config, Arc::new(NoopMetricsSink));

        std::thread::sleep(Duration::from_millis(150));
        assert!(this.is_leader());

        this.shutdown();
        let _ = handle.join();
    }

    #[test]
    fn shorter_log_candidate_is_not_granted_a_vote() {
        let config = ConfigBuilder::new("t").heartbeat_period_ms(10).election_timeout_ms(30_000).build();
        let (this, handle) = lone_member(config, Arc::new(NoopMetricsSink));
        this.storage.append_log_entry(MemberId(1), &LogEntry::new(1, 1, Bytes::new())).unwrap();
        this.storage.append_log_entry(MemberId(1), &LogEntry::new(2, 1, Bytes::new())).unwrap();

        // A candidate proposing a higher term but an empty log is behind
        // this voter's log and must not win its ballot (§4.3 "at least as
        // up-to-date" rule).
        this.handle_request_vote(5, MemberId(2), 0, 0);
        assert_eq!(*this.voted_for.lock(), None, "a candidate behind our log must not receive a vote");

        this.shutdown();
        let _ = handle.join();
    }

    #[test]
    fn batching_folds_every_already_queued_command_into_one_append() {
        let config = ConfigBuilder::new("t").heartbeat_period_ms(10).election_timeout_ms(50).batching(true).build();
        let metrics = Arc::new(RecordingMetricsSink::default());
        let (this, handle) = lone_member(config, metrics.clone());

        let commands: Vec<_> = (0..3)
            .map(|i| {
                let command = this.checkout_command().unwrap();
                command.stage_payload(Bytes::from(format!("cmd-{i}")));
                this.command_tx.send(command.clone()).unwrap();
                command
            })
            .collect();

        // While still a follower the run loop never selects on command_rx,
        // so the 3 queued commands sit untouched until we flip to leader.
        assert!(!this.is_leader());
        let first = this.command_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        this.start_election();
        assert!(this.is_leader());
        this.handle_command(first);

        for command in &commands {
            assert!(
                command.status() == CommandStatus::Committed || command.status() == CommandStatus::Waiting,
                "every queued command should have been picked up",
            );
        }
        let batched = metrics.appends.lock().iter().any(|(_, _, count)| *count == 3);
        assert!(batched, "handle_command should fold all 3 already-queued commands into one append when batching is enabled");

        this.shutdown();
        let _ = handle.join();
    }

    #[test]
    fn batching_disabled_dispatches_one_command_per_append() {
        let config = ConfigBuilder::new("t").heartbeat_period_ms(10).election_timeout_ms(50).batching(false).build();
        let metrics = Arc::new(RecordingMetricsSink::default());
        let (this, handle) = lone_member(config, metrics.clone());

        let commands: Vec<_> = (0..3)
            .map(|i| {
                let command = this.checkout_command().unwrap();
                command.stage_payload(Bytes::from(format!("cmd-{i}")));
                this.command_tx.send(command.clone()).unwrap();
                command
            })
            .collect();
        drop(commands);

        let first = this.command_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        this.start_election();
        this.handle_command(first);

        let counted = metrics.appends.lock().iter().any(|(_, _, count)| *count == 3);
        assert!(!counted, "disabled batching must not fold the other queued commands into this append");

        this.shutdown();
        let _ = handle.join();
    }
}
