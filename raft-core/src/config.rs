//! The engine's runtime configuration (§6 EXTERNAL INTERFACES, Configuration).
//!
//! Loading this struct from a HOCON file (or any other format), and hot
//! reloading it, is explicitly out of scope for this crate (§1) — `Config`
//! is a plain, `serde`-(de)serializable struct that an embedding application
//! populates however it likes. Keys marked "Dynamic? yes" are backed by
//! atomics so a call to the matching setter takes effect without
//! restarting the engine; keys marked "no" are fixed at construction time,
//! built once via a builder and handed to `Engine::new`.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;

use crate::MemberId;
use crate::ShardId;

/// One host in the cluster topology.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostConfig {
    pub host_id: u64,
    pub address: String,
    pub store_id: u64,
    pub site_id: u64,
}

/// One member's placement within a shard: which host it runs on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ShardMember {
    pub host_id: u64,
    pub member_id: MemberId,
}

/// One replication group's member list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardConfig {
    pub shard_id: ShardId,
    pub members: Vec<ShardMember>,
}

impl ShardConfig {
    /// The member, if any, that this config places on `host_id`.
    pub fn member_on_host(&self, host_id: u64) -> Option<MemberId> {
        self.members.iter().find(|m| m.host_id == host_id).map(|m| m.member_id)
    }

    pub fn member_ids(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.members.iter().map(|m| m.member_id)
    }
}

/// Verbose-logging toggles, all dynamic (`gondola.tracing.*`).
#[derive(Debug, Default)]
pub struct TracingConfig {
    pub messages: AtomicBool,
    pub elections: AtomicBool,
    pub replication: AtomicBool,
}

impl Clone for TracingConfig {
    fn clone(&self) -> Self {
        Self {
            messages: AtomicBool::new(self.messages.load(Ordering::Relaxed)),
            elections: AtomicBool::new(self.elections.load(Ordering::Relaxed)),
            replication: AtomicBool::new(self.replication.load(Ordering::Relaxed)),
        }
    }
}

/// The engine's runtime configuration.
///
/// Construct via [`ConfigBuilder`]; all `raft.*`/`gondola.*` keys from the
/// spec's table are represented here under their plain-English field names.
#[derive(Debug)]
pub struct Config {
    pub cluster_name: String,
    pub hosts: Vec<HostConfig>,
    pub shards: Vec<ShardConfig>,

    // raft.* — fixed at construction.
    pub heartbeat_period_ms: u64,
    pub election_timeout_ms: u64,
    pub leader_timeout_ms: u64,
    pub request_vote_period_ms: u64,
    pub command_max_size: usize,

    // raft.* — dynamic.
    write_empty_command_after_election: AtomicBool,

    // gondola.* — fixed at construction.
    pub command_queue_size: usize,
    pub incoming_queue_size: usize,
    pub wait_queue_throttle_size: usize,
    pub save_queue_workers: usize,
    pub backfill_window: u64,
    /// How long a Peer channel may sit idle before being torn down (§4.4
    /// "Channel failure"). Not one of the `raft.*`/`gondola.*` table keys;
    /// a fixed implementation constant per the prose default of 10s.
    pub channel_inactivity_timeout_ms: u64,
    /// Retry period for reconnecting a torn-down Peer channel (§4.4).
    pub create_socket_retry_period_ms: u64,

    // gondola.* — dynamic.
    batching: AtomicBool,
    slave_inactivity_timeout_ms: AtomicU64,
    pub tracing: TracingConfig,

    // plugin selectors — fixed at construction.
    pub storage_impl: String,
    pub network_impl: String,
    pub clock_impl: String,

    /// Test-only hook for the "missing-entry repair" scenario (§8 scenario
    /// 2): seeds the SaveQueue's notion of how far the durable tail may
    /// trail the in-memory log on the next startup. Normally this is
    /// persisted by Storage and never set directly (§9 design note on
    /// `maxGap`).
    test_max_gap: AtomicU64,
}

impl Config {
    pub fn write_empty_command_after_election(&self) -> bool {
        self.write_empty_command_after_election.load(Ordering::Acquire)
    }

    pub fn set_write_empty_command_after_election(&self, v: bool) {
        self.write_empty_command_after_election.store(v, Ordering::Release);
    }

    pub fn batching(&self) -> bool {
        self.batching.load(Ordering::Acquire)
    }

    pub fn set_batching(&self, v: bool) {
        self.batching.store(v, Ordering::Release);
    }

    pub fn slave_inactivity_timeout_ms(&self) -> u64 {
        self.slave_inactivity_timeout_ms.load(Ordering::Acquire)
    }

    pub fn set_slave_inactivity_timeout_ms(&self, v: u64) {
        self.slave_inactivity_timeout_ms.store(v, Ordering::Release);
    }

    /// Test-only setter for the persisted `maxGap` hint (§9).
    pub fn set_test_max_gap(&self, v: u64) {
        self.test_max_gap.store(v, Ordering::Release);
    }

    pub fn test_max_gap(&self) -> u64 {
        self.test_max_gap.load(Ordering::Acquire)
    }

    pub fn shard(&self, id: ShardId) -> Option<&ShardConfig> {
        self.shards.iter().find(|s| s.shard_id == id)
    }

    /// A uniformly jittered value in `[0, request_vote_period_ms]`, used by
    /// candidates to retry RequestVote broadcasts (§4.3).
    pub fn new_rand_request_vote_period(&self) -> u64 {
        use rand::Rng;
        rand::thread_rng().gen_range(0..=self.request_vote_period_ms.max(1))
    }

    /// A randomized election timeout so followers don't all fire at once.
    pub fn new_rand_election_timeout(&self) -> u64 {
        use rand::Rng;
        let base = self.election_timeout_ms;
        rand::thread_rng().gen_range(base..=(base + base / 2).max(base + 1))
    }
}

pub struct ConfigBuilder {
    cfg: Config,
}

impl ConfigBuilder {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cfg: Config {
                cluster_name: cluster_name.into(),
                hosts: Vec::new(),
                shards: Vec::new(),
                heartbeat_period_ms: 250,
                election_timeout_ms: 2000,
                leader_timeout_ms: 10_000,
                request_vote_period_ms: 300,
                command_max_size: 1 << 20,
                write_empty_command_after_election: AtomicBool::new(true),
                command_queue_size: 1000,
                incoming_queue_size: 1000,
                wait_queue_throttle_size: 1000,
                save_queue_workers: 5,
                backfill_window: 100,
                channel_inactivity_timeout_ms: 10_000,
                create_socket_retry_period_ms: 1_000,
                batching: AtomicBool::new(true),
                slave_inactivity_timeout_ms: AtomicU64::new(60_000),
                tracing: TracingConfig::default(),
                storage_impl: "memory".to_string(),
                network_impl: "loopback".to_string(),
                clock_impl: "system".to_string(),
                test_max_gap: AtomicU64::new(0),
            },
        }
    }

    pub fn hosts(mut self, hosts: Vec<HostConfig>) -> Self {
        self.cfg.hosts = hosts;
        self
    }

    pub fn shards(mut self, shards: Vec<ShardConfig>) -> Self {
        self.cfg.shards = shards;
        self
    }

    pub fn heartbeat_period_ms(mut self, v: u64) -> Self {
        self.cfg.heartbeat_period_ms = v;
        self
    }

    pub fn election_timeout_ms(mut self, v: u64) -> Self {
        self.cfg.election_timeout_ms = v;
        self
    }

    pub fn leader_timeout_ms(mut self, v: u64) -> Self {
        self.cfg.leader_timeout_ms = v;
        self
    }

    pub fn request_vote_period_ms(mut self, v: u64) -> Self {
        self.cfg.request_vote_period_ms = v;
        self
    }

    pub fn command_max_size(mut self, v: usize) -> Self {
        self.cfg.command_max_size = v;
        self
    }

    pub fn command_queue_size(mut self, v: usize) -> Self {
        self.cfg.command_queue_size = v;
        self
    }

    pub fn incoming_queue_size(mut self, v: usize) -> Self {
        self.cfg.incoming_queue_size = v;
        self
    }

    pub fn wait_queue_throttle_size(mut self, v: usize) -> Self {
        self.cfg.wait_queue_throttle_size = v;
        self
    }

    pub fn save_queue_workers(mut self, v: usize) -> Self {
        self.cfg.save_queue_workers = v;
        self
    }

    pub fn backfill_window(mut self, v: u64) -> Self {
        self.cfg.backfill_window = v;
        self
    }

    pub fn channel_inactivity_timeout_ms(mut self, v: u64) -> Self {
        self.cfg.channel_inactivity_timeout_ms = v;
        self
    }

    pub fn create_socket_retry_period_ms(mut self, v: u64) -> Self {
        self.cfg.create_socket_retry_period_ms = v;
        self
    }

    pub fn batching(mut self, v: bool) -> Self {
        self.cfg.batching = AtomicBool::new(v);
        self
    }

    pub fn write_empty_command_after_election(mut self, v: bool) -> Self {
        self.cfg.write_empty_command_after_election = AtomicBool::new(v);
        self
    }

    pub fn storage_impl(mut self, v: impl Into<String>) -> Self {
        self.cfg.storage_impl = v.into();
        self
    }

    pub fn network_impl(mut self, v: impl Into<String>) -> Self {
        self.cfg.network_impl = v.into();
        self
    }

    pub fn clock_impl(mut self, v: impl Into<String>) -> Self {
        self.cfg.clock_impl = v.into();
        self
    }

    pub fn build(self) -> Config {
        self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_keys_update_without_rebuild() {
        let cfg = ConfigBuilder::new("test").build();
        assert!(cfg.batching());
        cfg.set_batching(false);
        assert!(!cfg.batching());
        assert_eq!(cfg.slave_inactivity_timeout_ms(), 60_000);
        cfg.set_slave_inactivity_timeout_ms(5_000);
        assert_eq!(cfg.slave_inactivity_timeout_ms(), 5_000);
    }

    #[test]
    fn request_vote_period_jitter_is_bounded() {
        let cfg = ConfigBuilder::new("test").request_vote_period_ms(100).build();
        for _ in 0..50 {
            let v = cfg.new_rand_request_vote_period();
            assert!(v <= 100);
        }
    }
}
