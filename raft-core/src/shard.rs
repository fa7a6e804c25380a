//! One replication group as seen from this host: binds a [`CoreMember`] to
//! its [`Peer`]s and exposes the public command/read/membership API
//! (§4.5, §6 `Shard`/`Member`).

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use bytes::Bytes;
use crossbeam_channel::Sender;

use crate::clock::Clock;
use crate::command::Command;
use crate::config::Config;
use crate::core_member::CoreMember;
use crate::core_member::SlaveStatus;
use crate::error::CommitError;
use crate::error::ReadError;
use crate::error::SlaveError;
use crate::message::MessagePool;
use crate::metrics::MetricsSink;
use crate::network::Network;
use crate::storage::Storage;
use crate::MemberId;
use crate::RoleChangeEvent;
use crate::ShardId;

/// A handle onto this shard's locally-hosted member (§6
/// `Member.isLeader()/setSlave/getSlaveStatus/enable`).
///
/// This engine hosts exactly one [`CoreMember`] per `(host, shard)` pair
/// (§4.6 "constructs each Shard listed for this host"), so `Member` is a
/// thin view over that one `CoreMember` rather than a handle to an
/// arbitrary cluster member.
pub struct Member<'a> {
    core: &'a Arc<CoreMember>,
}

impl<'a> Member<'a> {
    pub fn id(&self) -> MemberId {
        self.core.member()
    }

    pub fn is_leader(&self) -> bool {
        self.core.is_leader()
    }

    pub fn leader_hint(&self) -> Option<MemberId> {
        self.core.leader_hint()
    }

    /// Point this member at `master`, a member of a different shard, as a
    /// passive mirror (§4.3 Slave mode). `None` exits slave mode.
    pub fn set_slave(&self, master: Option<MemberId>) -> Result<(), SlaveError> {
        self.core.set_slave(master)
    }

    pub fn slave_status(&self) -> SlaveStatus {
        self.core.slave_status()
    }

    pub fn enable(&self, on: bool) {
        self.core.enable(on)
    }

    pub fn is_enabled(&self) -> bool {
        self.core.is_enabled()
    }
}

/// One Raft replication group, bound to the member this process hosts for
/// it.
pub struct Shard {
    shard_id: ShardId,
    core: Arc<CoreMember>,
    core_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Shard {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        shard_id: ShardId,
        member: MemberId,
        peer_members: Vec<MemberId>,
        config: Arc<Config>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        network: Arc<dyn Network>,
        pool: MessagePool,
        metrics: Arc<dyn MetricsSink>,
        events_tx: Sender<RoleChangeEvent>,
    ) -> Self {
        let (core, core_thread) =
            CoreMember::spawn(member, shard_id, peer_members, config, storage, clock, network, pool, metrics, events_tx);
        Self { shard_id, core, core_thread: Mutex::new(Some(core_thread)) }
    }

    pub fn id(&self) -> ShardId {
        self.shard_id
    }

    pub fn checkout_command(&self) -> Option<Arc<Command>> {
        self.core.checkout_command()
    }

    /// Submit `command`'s payload for replication, blocking until it
    /// commits, times out, or the engine shuts down (§6 `Command.commit`).
    pub fn commit(&self, command: &Arc<Command>, payload: Bytes, timeout: Duration) -> Result<(), CommitError> {
        self.core.submit(command, payload, timeout)
    }

    /// Block until `commit_index >= index`, then return the entry's bytes
    /// (§6 `Shard.getCommittedCommand`).
    pub fn get_committed_command(&self, index: u64, timeout: Duration) -> Result<Bytes, ReadError> {
        self.core.read_committed(index, timeout)
    }

    pub fn get_member(&self, member_id: MemberId) -> Option<Member<'_>> {
        if member_id == self.core.member() {
            Some(Member { core: &self.core })
        } else {
            None
        }
    }

    pub fn local_member(&self) -> Member<'_> {
        Member { core: &self.core }
    }

    pub(crate) fn stop(&self) {
        self.core.shutdown();
        if let Some(handle) = self.core_thread.lock().take() {
            let _ = handle.join();
        }
    }
}
