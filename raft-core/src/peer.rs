//! One remote member as seen from a local [`crate::core_member::CoreMember`]
//! (§3 Peer state, §4.4 Peer).

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::bounded;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use parking_lot::Mutex as PLMutex;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::Suppressor;
use crate::log::LogEntry;
use crate::message::Message;
use crate::message::MessageBody;
use crate::message::MessagePool;
use crate::network::Channel;
use crate::network::Network;
use crate::storage::Storage;
use crate::MemberId;
use crate::ShardId;

/// The leader-side bookkeeping a [`Peer`]'s send thread needs to decide
/// whether to backfill, batch, or just heartbeat, kept on the shared side
/// so `CoreMember` can update it without reaching into each `Peer`
/// individually (§4.3 `LeaderState`, §4.4 backfill trigger).
#[derive(Default)]
pub struct ReplicationWindow {
    pub term: AtomicU64,
    pub commit_index: AtomicU64,
    pub last_index: AtomicU64,
}

/// One remote member of this shard, with its own send/receive threads
/// (§4.4, §5 "each Peer runs two threads").
pub struct Peer {
    local: MemberId,
    remote: MemberId,
    shard: ShardId,
    outbound_tx: Sender<Message>,
    match_index: AtomicU64,
    next_index: AtomicU64,
    slave_operational: AtomicBool,
    last_heard: StdMutex<Instant>,
    channel: PLMutex<Option<Arc<dyn Channel>>>,
    stop: Arc<AtomicBool>,
    suppressor: Suppressor,
}

/// Join handles for a spawned `Peer`'s two threads, kept by `Shard` so it
/// can join them on teardown.
pub struct PeerThreads {
    pub send: JoinHandle<()>,
    pub receive: JoinHandle<()>,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        local: MemberId,
        remote: MemberId,
        shard: ShardId,
        network: Arc<dyn Network>,
        storage: Arc<dyn Storage>,
        pool: MessagePool,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        window: Arc<ReplicationWindow>,
        incoming_tx: Sender<Message>,
    ) -> (Arc<Peer>, PeerThreads) {
        let (outbound_tx, outbound_rx) = bounded::<Message>(config.incoming_queue_size);
        let peer = Arc::new(Peer {
            local,
            remote,
            shard,
            outbound_tx,
            match_index: AtomicU64::new(0),
            next_index: AtomicU64::new(1),
            slave_operational: AtomicBool::new(false),
            last_heard: StdMutex::new(Instant::now()),
            channel: PLMutex::new(network.create_channel(local, remote).ok().map(Arc::<dyn Channel>::from)),
            stop: Arc::new(AtomicBool::new(false)),
            suppressor: Suppressor::per_minute(),
        });

        let send = {
            let peer = peer.clone();
            let network = network.clone();
            let storage = storage.clone();
            let pool = pool.clone();
            let config = config.clone();
            let clock = clock.clone();
            let window = window.clone();
            std::thread::Builder::new()
                .name(format!("peer-send-{}-{}", local, remote))
                .spawn(move || peer.run_send(network, storage, pool, config, clock, window, outbound_rx))
                .expect("spawn peer send thread")
        };

        let receive = {
            let peer = peer.clone();
            let clock = clock.clone();
            std::thread::Builder::new()
                .name(format!("peer-recv-{}-{}", local, remote))
                .spawn(move || peer.run_receive(clock, incoming_tx))
                .expect("spawn peer receive thread")
        };

        (peer, PeerThreads { send, receive })
    }

    pub fn remote(&self) -> MemberId {
        self.remote
    }

    /// Enqueue a message for transmission, blocking if the outbound queue
    /// is full (deliberate backpressure, §5).
    pub fn enqueue(&self, message: Message) -> anyhow::Result<()> {
        self.outbound_tx.send(message).map_err(|_| anyhow::anyhow!("peer {} shut down", self.remote))
    }

    pub fn match_index(&self) -> u64 {
        self.match_index.load(Ordering::Acquire)
    }

    pub fn set_match_index(&self, v: u64) {
        self.match_index.fetch_max(v, Ordering::AcqRel);
    }

    pub fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::Acquire)
    }

    pub fn set_next_index(&self, v: u64) {
        self.next_index.store(v.max(1), Ordering::Release);
    }

    pub fn is_slave_operational(&self) -> bool {
        self.slave_operational.load(Ordering::Acquire)
    }

    pub fn set_slave_operational(&self, v: bool) {
        self.slave_operational.store(v, Ordering::Release);
    }

    /// Whether this peer has produced any inbound traffic within
    /// `channel_inactivity_timeout_ms`; used to prune stale slave entries
    /// (§4.4 "Slave inactivity").
    pub fn seconds_since_heard(&self) -> u64 {
        self.last_heard.lock().unwrap().elapsed().as_secs()
    }

    fn mark_heard(&self) {
        *self.last_heard.lock().unwrap() = Instant::now();
    }

    fn teardown(&self) {
        *self.channel.lock() = None;
        self.slave_operational.store(false, Ordering::Release);
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }

    #[allow(clippy::too_many_arguments)]
    fn run_send(
        &self,
        network: Arc<dyn Network>,
        storage: Arc<dyn Storage>,
        pool: MessagePool,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        window: Arc<ReplicationWindow>,
        outbound_rx: crossbeam_channel::Receiver<Message>,
    ) {
        let heartbeat = Duration::from_millis(config.heartbeat_period_ms);
        while !self.stop.load(Ordering::Acquire) {
            let channel = self.channel.lock().clone();
            let channel = match channel {
                Some(c) => c,
                None => {
                    clock.sleep(Duration::from_millis(config.create_socket_retry_period_ms));
                    match network.create_channel(self.local, self.remote) {
                        Ok(c) => {
                            let c: Arc<dyn Channel> = Arc::from(c);
                            *self.channel.lock() = Some(c);
                        }
                        Err(err) => {
                            if let Some(suppressed) = self.suppressor.gate("peer-connect") {
                                tracing::warn!(remote = %self.remote, error = %err, suppressed, "peer: reconnect failed");
                            }
                        }
                    }
                    continue;
                }
            };

            if self.seconds_since_heard() * 1000 > config.channel_inactivity_timeout_ms {
                tracing::debug!(remote = %self.remote, "peer: channel inactive, tearing down");
                self.teardown();
                continue;
            }

            let outgoing = match outbound_rx.recv_timeout(heartbeat) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => self.next_send(&storage, &pool, &config, &window),
                Err(RecvTimeoutError::Disconnected) => break,
            };

            if let Some(message) = outgoing {
                if let Err(err) = channel.send(message) {
                    if let Some(suppressed) = self.suppressor.gate("peer-send") {
                        tracing::warn!(remote = %self.remote, error = %err, suppressed, "peer: send failed");
                    }
                    self.teardown();
                }
            }
        }
    }

    /// Decide the next message to send when the outbound queue is idle:
    /// a backfill batch if this peer is far behind, otherwise a plain
    /// heartbeat (§4.4).
    fn next_send(
        &self,
        storage: &Arc<dyn Storage>,
        pool: &MessagePool,
        config: &Config,
        window: &ReplicationWindow,
    ) -> Option<Message> {
        let term = window.term.load(Ordering::Acquire);
        let commit_index = window.commit_index.load(Ordering::Acquire);
        let last_index = window.last_index.load(Ordering::Acquire);
        let next_index = self.next_index();

        if self.match_index() + config.backfill_window < last_index && next_index <= last_index {
            let to = last_index.min(next_index + config.backfill_window - 1);
            let entries = storage.get_log_entries(self.local, next_index, to).ok()?;
            if entries.is_empty() {
                return None;
            }
            let prev_index = next_index - 1;
            let prev_term = if prev_index == 0 {
                0
            } else {
                storage.get_log_entry(self.local, prev_index).ok().flatten().map(|e| e.term).unwrap_or(0)
            };
            return Some(pool.checkout_append_entries(self.local, term, prev_index, prev_term, entries, commit_index));
        }

        let prev_index = next_index.saturating_sub(1);
        let prev_term = if prev_index == 0 {
            0
        } else {
            storage.get_log_entry(self.local, prev_index).ok().flatten().map(|e| e.term).unwrap_or(0)
        };
        Some(pool.checkout_append_entries(self.local, term, prev_index, prev_term, Vec::<LogEntry>::new(), commit_index))
    }

    fn run_receive(&self, clock: Arc<dyn Clock>, incoming_tx: Sender<Message>) {
        while !self.stop.load(Ordering::Acquire) {
            let channel = self.channel.lock().clone();
            let channel = match channel {
                Some(c) => c,
                None => {
                    clock.sleep(Duration::from_millis(50));
                    continue;
                }
            };
            match channel.receive() {
                Ok(Some(message)) => {
                    self.mark_heard();
                    match message.body() {
                        MessageBody::AppendEntriesReply { .. } => {
                            // matchIndex/nextIndex are reconciled by
                            // CoreMember, which owns the protocol state;
                            // this thread only moves bytes.
                        }
                        MessageBody::AppendEntries { .. } => {
                            // A slave's client-side Peer observes a genuine
                            // push from its master (§4.3 Slave mode).
                            self.set_slave_operational(true);
                        }
                        _ => {}
                    }
                    if incoming_tx.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => self.teardown(),
                Err(err) => {
                    if let Some(suppressed) = self.suppressor.gate("peer-receive") {
                        tracing::warn!(remote = %self.remote, error = %err, suppressed, "peer: receive failed");
                    }
                    self.teardown();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::ConfigBuilder;
    use crossbeam_channel::unbounded;
    use std::sync::Mutex;

    struct LoopbackNetwork {
        tx: Sender<Message>,
    }
    struct LoopbackChannel {
        tx: Sender<Message>,
        rx: Mutex<crossbeam_channel::Receiver<Message>>,
    }
    impl Channel for LoopbackChannel {
        fn send(&self, message: Message) -> anyhow::Result<()> {
            self.tx.send(message).map_err(|e| anyhow::anyhow!(e.to_string()))
        }
        fn receive(&self) -> anyhow::Result<Option<Message>> {
            Ok(self.rx.lock().unwrap().recv_timeout(Duration::from_millis(500)).ok())
        }
    }
    impl Network for LoopbackNetwork {
        fn create_channel(&self, _local: MemberId, _remote: MemberId) -> anyhow::Result<Box<dyn Channel>> {
            let (tx2, rx2) = unbounded();
            let _ = &self.tx;
            Ok(Box::new(LoopbackChannel { tx: tx2, rx: Mutex::new(rx2) }))
        }
    }

    #[test]
    fn heartbeat_sent_when_outbound_queue_idle() {
        let (dummy_tx, _dummy_rx) = unbounded();
        let network: Arc<dyn Network> = Arc::new(LoopbackNetwork { tx: dummy_tx });
        struct NoStorage;
        impl Storage for NoStorage {
            fn save_vote(&self, _: MemberId, _: u64, _: Option<MemberId>) -> anyhow::Result<()> {
                Ok(())
            }
            fn get_vote(&self, _: MemberId) -> anyhow::Result<crate::storage::PersistedVote> {
                Ok(Default::default())
            }
            fn has_log_entry(&self, _: MemberId, _: u64, _: u64) -> anyhow::Result<bool> {
                Ok(false)
            }
            fn get_log_entry(&self, _: MemberId, _: u64) -> anyhow::Result<Option<LogEntry>> {
                Ok(None)
            }
            fn get_log_entries(&self, _: MemberId, _: u64, _: u64) -> anyhow::Result<Vec<LogEntry>> {
                Ok(Vec::new())
            }
            fn get_last_log_term(&self, _: MemberId) -> anyhow::Result<u64> {
                Ok(0)
            }
            fn get_last_log_index(&self, _: MemberId) -> anyhow::Result<u64> {
                Ok(0)
            }
            fn append_log_entry(&self, _: MemberId, _: &LogEntry) -> anyhow::Result<()> {
                Ok(())
            }
            fn delete(&self, _: MemberId, _: u64) -> anyhow::Result<()> {
                Ok(())
            }
            fn set_max_gap(&self, _: MemberId, _: u64) -> anyhow::Result<()> {
                Ok(())
            }
            fn get_max_gap(&self, _: MemberId) -> anyhow::Result<u64> {
                Ok(0)
            }
        }
        let storage: Arc<dyn Storage> = Arc::new(NoStorage);
        let config = Arc::new(ConfigBuilder::new("t").heartbeat_period_ms(10).build());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let window = Arc::new(ReplicationWindow::default());
        let (incoming_tx, incoming_rx) = unbounded();

        let (peer, threads) = Peer::spawn(MemberId(1), MemberId(2), ShardId(1), network, storage, MessagePool::new(), config, clock, window, incoming_tx);

        // The loopback channel we built only pipes one direction; this test
        // just exercises that the send thread doesn't panic when idle and
        // that shutdown joins cleanly.
        std::thread::sleep(Duration::from_millis(60));
        peer.shutdown();
        drop(peer);
        let _ = threads.send.join();
        let _ = threads.receive.join();
        drop(incoming_rx);
    }
}
