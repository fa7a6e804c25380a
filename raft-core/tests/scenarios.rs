//! End-to-end scenarios run against a real `Engine`/`Shard`/`CoreMember`
//! cluster wired up with `raft-memstore`'s `MemStorage` and `LoopbackHub`,
//! driving real OS threads rather than a simulated event loop.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;

use raft_core::config::Config;
use raft_core::config::ConfigBuilder;
use raft_core::config::HostConfig;
use raft_core::config::ShardConfig;
use raft_core::config::ShardMember;
use raft_core::engine::Engine;
use raft_core::engine::Registry;
use raft_core::network::Network;
use raft_core::storage::Storage;
use raft_core::MemberId;
use raft_core::ShardId;

use raft_memstore::LoopbackHub;
use raft_memstore::MemStorage;

const SHARD: ShardId = ShardId(1);

fn topology(member_count: u64) -> (Vec<HostConfig>, Vec<ShardConfig>) {
    let hosts = (1..=member_count)
        .map(|id| HostConfig { host_id: id, address: format!("host-{id}"), store_id: id, site_id: 1 })
        .collect();
    let members = (1..=member_count).map(|id| ShardMember { host_id: id, member_id: MemberId(id) }).collect();
    (hosts, vec![ShardConfig { shard_id: SHARD, members }])
}

fn scenario_config(hosts: Vec<HostConfig>, shards: Vec<ShardConfig>) -> Config {
    ConfigBuilder::new("scenario-test")
        .hosts(hosts)
        .shards(shards)
        .heartbeat_period_ms(25)
        .election_timeout_ms(120)
        .leader_timeout_ms(250)
        .request_vote_period_ms(30)
        .storage_impl("memory")
        .network_impl("loopback")
        .clock_impl("system")
        .build()
}

/// Builds one `Engine` for `host_id`, backed by `storage` (so a caller can
/// keep its own handle to inspect or reuse across a simulated restart) and
/// sharing `hub` as its network.
fn build_engine(host_id: u64, config: Config, storage: Arc<MemStorage>, hub: &LoopbackHub) -> Engine {
    let mut registry = Registry::new();
    registry.register_storage("memory", move |_cfg| Ok(storage.clone() as Arc<dyn Storage>));
    let hub = hub.clone();
    registry.register_network("loopback", move |_cfg| Ok(Arc::new(hub.clone()) as Arc<dyn Network>));
    Engine::new(config, host_id, registry)
}

/// Starts one `Engine` per host, all sharing `hub` as their network, and
/// returns each member's backing `MemStorage` alongside it.
fn start_cluster_with_storage(member_count: u64, hub: &LoopbackHub) -> (Vec<Engine>, Vec<Arc<MemStorage>>) {
    let (hosts, shards) = topology(member_count);
    let storages: Vec<Arc<MemStorage>> = (0..member_count).map(|_| Arc::new(MemStorage::new())).collect();
    let engines = (1..=member_count)
        .map(|host_id| {
            let config = scenario_config(hosts.clone(), shards.clone());
            let engine = build_engine(host_id, config, storages[(host_id - 1) as usize].clone(), hub);
            engine.start().expect("engine starts");
            engine
        })
        .collect();
    (engines, storages)
}

/// Starts one `Engine` per host, all sharing `hub` as their network.
fn start_cluster(member_count: u64, hub: &LoopbackHub) -> Vec<Engine> {
    start_cluster_with_storage(member_count, hub).0
}

fn wait_for_leader(engines: &[Engine], timeout: Duration) -> Option<MemberId> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        for engine in engines {
            if let Some(shard) = engine.get_shard(SHARD) {
                if shard.local_member().is_leader() {
                    return Some(shard.local_member().id());
                }
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    None
}

#[test]
fn election_converges_on_a_single_leader() {
    let hub = LoopbackHub::new();
    let engines = start_cluster(3, &hub);

    let leader = wait_for_leader(&engines, Duration::from_secs(2)).expect("a leader is elected");

    let leader_count = engines
        .iter()
        .filter(|e| e.get_shard(SHARD).unwrap().local_member().is_leader())
        .count();
    assert_eq!(leader_count, 1, "exactly one member should hold leadership");

    for engine in &engines {
        let member = engine.get_shard(SHARD).unwrap().local_member();
        if !member.is_leader() {
            assert_eq!(member.leader_hint(), Some(leader));
        }
    }

    for engine in &engines {
        engine.stop();
    }
}

#[test]
fn committed_command_is_readable_from_every_member() {
    let hub = LoopbackHub::new();
    let engines = start_cluster(3, &hub);
    let leader_id = wait_for_leader(&engines, Duration::from_secs(2)).expect("a leader is elected");

    let leader_engine = engines.iter().find(|e| e.get_shard(SHARD).unwrap().local_member().id() == leader_id).unwrap();
    let leader_shard = leader_engine.get_shard(SHARD).unwrap();

    let command = leader_shard.checkout_command().expect("command pool has room");
    leader_shard
        .commit(&command, Bytes::from_static(b"hello raft"), Duration::from_secs(1))
        .expect("leader commits the payload");
    let index = command.index();

    for engine in &engines {
        let shard = engine.get_shard(SHARD).unwrap();
        let bytes = shard.get_committed_command(index, Duration::from_secs(1)).expect("every member catches up");
        assert_eq!(bytes, Bytes::from_static(b"hello raft"));
    }

    for engine in &engines {
        engine.stop();
    }
}

#[test]
fn backfill_repairs_a_follower_that_missed_entries_while_partitioned() {
    let hub = LoopbackHub::new();
    let engines = start_cluster(3, &hub);
    let leader_id = wait_for_leader(&engines, Duration::from_secs(2)).expect("a leader is elected");

    let follower_id = (1..=3).map(MemberId).find(|id| *id != leader_id).expect("a non-leader member exists");
    let leader_engine = engines.iter().find(|e| e.get_shard(SHARD).unwrap().local_member().id() == leader_id).unwrap();
    let leader_shard = leader_engine.get_shard(SHARD).unwrap();

    hub.isolate(follower_id);

    let mut last_index = 0;
    for i in 0..30u32 {
        let command = leader_shard.checkout_command().expect("command pool has room");
        leader_shard
            .commit(&command, Bytes::from(format!("entry-{i}")), Duration::from_secs(1))
            .expect("the remaining majority still commits");
        last_index = command.index();
    }

    hub.restore(follower_id);

    let follower_engine = engines.iter().find(|e| e.get_shard(SHARD).unwrap().local_member().id() == follower_id).unwrap();
    let follower_shard = follower_engine.get_shard(SHARD).unwrap();
    let bytes = follower_shard
        .get_committed_command(last_index, Duration::from_secs(5))
        .expect("the restored follower backfills the entries it missed");
    assert_eq!(bytes, Bytes::from(format!("entry-{}", 29)));

    for engine in &engines {
        engine.stop();
    }
}

#[test]
fn a_freshly_elected_leader_writes_a_no_op_entry_at_index_one() {
    let hub = LoopbackHub::new();
    let (engines, storages) = start_cluster_with_storage(3, &hub);
    let leader_id = wait_for_leader(&engines, Duration::from_secs(2)).expect("a leader is elected");
    let leader_storage = &storages[(leader_id.0 - 1) as usize];

    let deadline = Instant::now() + Duration::from_secs(2);
    let entry = loop {
        if let Some(entry) = leader_storage.get_log_entry(leader_id, 1).expect("storage is readable") {
            break entry;
        }
        assert!(Instant::now() < deadline, "the new leader never wrote its index-1 entry");
        thread::sleep(Duration::from_millis(10));
    };
    assert!(entry.is_noop(), "a freshly elected leader commits a no-op entry in its own term before serving reads");

    for engine in &engines {
        engine.stop();
    }
}

#[test]
fn a_restarted_follower_with_a_stale_durable_tail_is_repaired_via_backfill() {
    let hub = LoopbackHub::new();
    let (engines, storages) = start_cluster_with_storage(3, &hub);
    let leader_id = wait_for_leader(&engines, Duration::from_secs(2)).expect("a leader is elected");

    let follower_id = (1..=3).map(MemberId).find(|id| *id != leader_id).expect("a non-leader member exists");
    let follower_index = (follower_id.0 - 1) as usize;
    let leader_engine = engines.iter().find(|e| e.get_shard(SHARD).unwrap().local_member().id() == leader_id).unwrap();
    let leader_shard = leader_engine.get_shard(SHARD).unwrap();

    let mut last_index = 0;
    for i in 0..5u32 {
        let command = leader_shard.checkout_command().expect("command pool has room");
        leader_shard
            .commit(&command, Bytes::from(format!("entry-{i}")), Duration::from_secs(1))
            .expect("the cluster commits while fully connected");
        last_index = command.index();
    }

    let follower_engine = engines.iter().find(|e| e.get_shard(SHARD).unwrap().local_member().id() == follower_id).unwrap();
    follower_engine
        .get_shard(SHARD)
        .unwrap()
        .get_committed_command(last_index, Duration::from_secs(5))
        .expect("the follower catches up before we simulate its crash");

    // Simulate the follower crashing and restarting with a durable tail that
    // might not reflect what was actually fsynced: reuse the same backing
    // `MemStorage` (as an unclean restart would) but force `test_max_gap` so
    // `SaveQueue::start` marks the trailing entries conflicting on this boot.
    follower_engine.stop();

    let (hosts, shards) = topology(3);
    let mut restart_config = scenario_config(hosts, shards);
    restart_config.set_test_max_gap(3);
    let restarted = build_engine(follower_id.0, restart_config, storages[follower_index].clone(), &hub);
    restarted.start().expect("the follower restarts");

    let bytes = restarted
        .get_shard(SHARD)
        .unwrap()
        .get_committed_command(last_index, Duration::from_secs(5))
        .expect("the leader's normal AppendEntries backfill re-streams the entries marked conflicting on restart");
    assert_eq!(bytes, Bytes::from(format!("entry-{}", 4)));

    restarted.stop();
    for engine in &engines {
        if engine.get_shard(SHARD).unwrap().local_member().id() != follower_id {
            engine.stop();
        }
    }
}

#[test]
fn slave_mirrors_a_foreign_shards_committed_log() {
    let hub = LoopbackHub::new();

    // Shard 1: a normal three-member Raft group.
    let shard1_engines = start_cluster(3, &hub);
    let leader_id = wait_for_leader(&shard1_engines, Duration::from_secs(2)).expect("shard 1 elects a leader");
    let leader_shard = shard1_engines
        .iter()
        .find(|e| e.get_shard(SHARD).unwrap().local_member().id() == leader_id)
        .unwrap()
        .get_shard(SHARD)
        .unwrap();

    let command = leader_shard.checkout_command().unwrap();
    leader_shard.commit(&command, Bytes::from_static(b"shard-1 payload"), Duration::from_secs(1)).unwrap();

    // Shard 2: a single member (id 10) on its own host, initially idle,
    // then pointed at shard 1's leader as a passive mirror.
    let slave_host = HostConfig { host_id: 10, address: "host-10".to_string(), store_id: 10, site_id: 1 };
    let slave_member = MemberId(10);
    let slave_shard_cfg = ShardConfig { shard_id: ShardId(2), members: vec![ShardMember { host_id: 10, member_id: slave_member }] };
    let config = ConfigBuilder::new("scenario-test")
        .hosts(vec![slave_host])
        .shards(vec![slave_shard_cfg])
        .heartbeat_period_ms(25)
        .election_timeout_ms(120)
        .leader_timeout_ms(250)
        .request_vote_period_ms(30)
        .storage_impl("memory")
        .network_impl("loopback")
        .clock_impl("system")
        .build();
    let mut registry = Registry::new();
    registry.register_storage("memory", |_cfg| Ok(Arc::new(MemStorage::new()) as Arc<dyn Storage>));
    let hub2 = hub.clone();
    registry.register_network("loopback", move |_cfg| Ok(Arc::new(hub2.clone()) as Arc<dyn Network>));
    let slave_engine = Engine::new(config, 10, registry);
    slave_engine.start().expect("slave engine starts");
    let slave_shard = slave_engine.get_shard(ShardId(2)).unwrap();

    slave_shard.local_member().set_slave(Some(leader_id)).expect("cross-shard slaving is allowed");

    let deadline = Instant::now() + Duration::from_secs(5);
    while !slave_shard.local_member().slave_status().running && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(slave_shard.local_member().slave_status().running, "slave attaches to shard 1's leader and starts mirroring");

    let bytes = slave_shard
        .get_committed_command(1, Duration::from_secs(5))
        .expect("the slave mirrors shard 1's committed log");
    assert_eq!(bytes, Bytes::from_static(b"shard-1 payload"));

    slave_engine.stop();
    for engine in &shard1_engines {
        engine.stop();
    }
}
