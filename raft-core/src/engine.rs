//! Process-wide lifecycle owner (§4.6 Engine).
//!
//! `Engine::start` builds dependencies leaves-first — `Clock` → `Network` →
//! `Storage` → `MessagePool` → one [`Shard`] per shard configured for this
//! host — and `Engine::stop` reverses that order. Both are idempotent.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::unbounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::message::MessagePool;
use crate::metrics::MetricsSink;
use crate::metrics::NoopMetricsSink;
use crate::network::Network;
use crate::shard::Shard;
use crate::storage::Storage;
use crate::MemberId;
use crate::RoleChangeEvent;
use crate::RoleChangeListener;
use crate::ShardId;

type StorageFactory = Box<dyn Fn(&Config) -> anyhow::Result<Arc<dyn Storage>> + Send + Sync>;
type NetworkFactory = Box<dyn Fn(&Config) -> anyhow::Result<Arc<dyn Network>> + Send + Sync>;
type ClockFactory = Box<dyn Fn(&Config) -> anyhow::Result<Arc<dyn Clock>> + Send + Sync>;

/// A name-keyed registry of constructors for the pluggable `Storage`,
/// `Network`, and `Clock` substrates, replacing the reflection-based
/// plugin loading named in the design notes. `raft-memstore` registers
/// `"memory"`/`"loopback"`; `"system"` clock ships built in.
#[derive(Default)]
pub struct Registry {
    storage: HashMap<&'static str, StorageFactory>,
    network: HashMap<&'static str, NetworkFactory>,
    clock: HashMap<&'static str, ClockFactory>,
}

impl Registry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register_clock("system", |_cfg| Ok(Arc::new(SystemClock) as Arc<dyn Clock>));
        registry
    }

    pub fn register_storage(&mut self, name: &'static str, factory: impl Fn(&Config) -> anyhow::Result<Arc<dyn Storage>> + Send + Sync + 'static) {
        self.storage.insert(name, Box::new(factory));
    }

    pub fn register_network(&mut self, name: &'static str, factory: impl Fn(&Config) -> anyhow::Result<Arc<dyn Network>> + Send + Sync + 'static) {
        self.network.insert(name, Box::new(factory));
    }

    pub fn register_clock(&mut self, name: &'static str, factory: impl Fn(&Config) -> anyhow::Result<Arc<dyn Clock>> + Send + Sync + 'static) {
        self.clock.insert(name, Box::new(factory));
    }
}

struct Runtime {
    storage: Arc<dyn Storage>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    pool: MessagePool,
    shards: HashMap<ShardId, Arc<Shard>>,
    notifier: JoinHandle<()>,
}

/// Owns process-wide lifecycle: one `Engine` per process, hosting zero or
/// more [`Shard`]s for `host_id` (§4.6).
pub struct Engine {
    config: Arc<Config>,
    host_id: u64,
    registry: Registry,
    metrics: Arc<dyn MetricsSink>,
    listeners: Arc<RwLock<Vec<Arc<dyn RoleChangeListener>>>>,
    events_tx: Sender<RoleChangeEvent>,
    events_rx: Receiver<RoleChangeEvent>,
    runtime: Mutex<Option<Runtime>>,
    stop_notifier: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(config: Config, host_id: u64, registry: Registry) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            config: Arc::new(config),
            host_id,
            registry,
            metrics: Arc::new(NoopMetricsSink),
            listeners: Arc::new(RwLock::new(Vec::new())),
            events_tx,
            events_rx,
            runtime: Mutex::new(None),
            stop_notifier: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Build, leaves-first, every dependency and `Shard` this host needs,
    /// then start a role-change notifier thread (§4.6).
    pub fn start(&self) -> anyhow::Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }

        let clock = self
            .registry
            .clock
            .get(self.config.clock_impl.as_str())
            .ok_or_else(|| anyhow::anyhow!("no clock registered for '{}'", self.config.clock_impl))?(&self.config)?;
        let network = self
            .registry
            .network
            .get(self.config.network_impl.as_str())
            .ok_or_else(|| anyhow::anyhow!("no network registered for '{}'", self.config.network_impl))?(&self.config)?;
        let storage = self
            .registry
            .storage
            .get(self.config.storage_impl.as_str())
            .ok_or_else(|| anyhow::anyhow!("no storage registered for '{}'", self.config.storage_impl))?(&self.config)?;
        let pool = MessagePool::new();

        let mut shards = HashMap::new();
        for shard_cfg in &self.config.shards {
            let Some(local_member) = shard_cfg.member_on_host(self.host_id) else {
                continue;
            };
            let peer_members: Vec<MemberId> = shard_cfg.member_ids().filter(|m| *m != local_member).collect();
            let shard = Shard::start(
                shard_cfg.shard_id,
                local_member,
                peer_members,
                self.config.clone(),
                storage.clone(),
                clock.clone(),
                network.clone(),
                pool.clone(),
                self.metrics.clone(),
                self.events_tx.clone(),
            );
            shards.insert(shard_cfg.shard_id, Arc::new(shard));
        }

        self.stop_notifier.store(false, Ordering::Release);
        let notifier = {
            let listeners = self.listeners.clone();
            let events_rx = self.events_rx.clone();
            let stop = self.stop_notifier.clone();
            std::thread::Builder::new()
                .name("engine-notifier".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        match events_rx.recv_timeout(Duration::from_millis(100)) {
                            Ok(event) => {
                                for listener in listeners.read().iter() {
                                    listener.on_role_change(&event);
                                }
                            }
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })
                .expect("spawn engine notifier thread")
        };

        *runtime = Some(Runtime { storage, network, clock, pool, shards, notifier });
        Ok(())
    }

    /// Reverse `start`'s order: stop every `Shard`, then drop the
    /// substrate handles. Safe to call multiple times or before `start`.
    pub fn stop(&self) {
        let mut runtime = self.runtime.lock();
        if let Some(runtime) = runtime.take() {
            for shard in runtime.shards.values() {
                shard.stop();
            }
            self.stop_notifier.store(true, Ordering::Release);
            let _ = runtime.notifier.join();
            drop(runtime.storage);
            drop(runtime.network);
            drop(runtime.clock);
        }
    }

    pub fn get_shard(&self, shard_id: ShardId) -> Option<Arc<Shard>> {
        self.runtime.lock().as_ref().and_then(|r| r.shards.get(&shard_id).cloned())
    }

    pub fn register_for_role_changes(&self, listener: Arc<dyn RoleChangeListener>) {
        self.listeners.write().push(listener);
    }

    pub fn unregister_for_role_changes(&self, listener: &Arc<dyn RoleChangeListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }
}
