//! A replicated-log engine implementing the Raft consensus protocol.
//!
//! One process hosts one [`Engine`](engine::Engine), which owns zero or more
//! [`Shard`](shard::Shard)s. Each shard is an independent Raft group: a
//! [`CoreMember`](core_member::CoreMember) state machine bound to a set of
//! [`Peer`](peer::Peer)s, sharing the engine's [`Storage`](storage::Storage),
//! [`Network`](network::Network), [`Clock`](clock::Clock) and
//! [`MessagePool`](message::MessagePool).
//!
//! Applications check out a [`Command`](command::Command), submit bytes, and
//! block until that slot is committed on a quorum; readers fetch committed
//! entries by index via [`Shard::get_committed_command`](shard::Shard::get_committed_command).
//!
//! The member set is static for the lifetime of a process (no dynamic
//! membership changes) and the log is never compacted by this crate.

pub mod clock;
pub mod command;
pub mod config;
pub mod core_member;
pub mod engine;
pub mod error;
pub mod log;
pub mod message;
pub mod metrics;
pub mod network;
pub mod peer;
pub mod save_queue;
pub mod shard;
pub mod storage;

mod quorum;

pub use clock::Clock;
pub use command::Command;
pub use command::CommandStatus;
pub use config::Config;
pub use engine::Engine;
pub use error::CommitError;
pub use error::ReadError;
pub use error::SlaveError;
pub use log::LogEntry;
pub use network::Network;
pub use shard::Shard;
pub use storage::Storage;

/// A cluster-unique identifier for one Raft member.
///
/// Distinct from [`ShardId`]: many members (one per host) belong to the
/// same shard, and `memberId` is unique across the whole cluster while a
/// shard only ever hosts at most one member per process (§3 Ownership).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct MemberId(pub u64);

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

/// Identifies one replication group (a set of members running one Raft
/// instance together).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ShardId(pub u64);

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// All possible roles of a Raft member (§4.3 Roles and timers).
///
/// Modeled as a plain tagged variant rather than a trait-object hierarchy,
/// per the "inheritance for role behaviors" design note: role-specific
/// state lives on [`core_member::CoreMember`] and is matched in one place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn is_follower(&self) -> bool {
        matches!(self, Role::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }
}

/// `(member, shard, old_role, new_role, leader_member)` fired whenever a
/// member's role changes, delivered off the Raft hot path (§4.6).
#[derive(Clone, Debug)]
pub struct RoleChangeEvent {
    pub member: MemberId,
    pub shard: ShardId,
    pub old_role: Role,
    pub new_role: Role,
    pub leader: Option<MemberId>,
}

/// Registered by [`Engine::register_for_role_changes`](engine::Engine::register_for_role_changes).
pub trait RoleChangeListener: Send + Sync {
    fn on_role_change(&self, event: &RoleChangeEvent);
}
