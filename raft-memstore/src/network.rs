//! A loopback [`Network`](raft_core::network::Network) connecting members
//! hosted in this same process via in-memory mailboxes, so `raft-core`'s
//! integration tests exercise real `Peer` send/receive threads without a
//! socket.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use parking_lot::Mutex;

use raft_core::message::Message;
use raft_core::network::Channel;
use raft_core::network::Network;
use raft_core::MemberId;

/// One directed mailbox, keyed by `(from, to)`.
type LinkKey = (MemberId, MemberId);

/// A shared registry of directed mailboxes. Clone freely; clones share the
/// same underlying links, so every member that should be able to reach
/// every other member must be handed a clone of the same `LoopbackHub`.
///
/// Test-only: [`LoopbackHub::isolate`]/[`LoopbackHub::restore`] simulate a
/// network partition by failing sends/receives for an isolated member,
/// without tearing down the underlying mailboxes.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    links: Arc<Mutex<HashMap<LinkKey, (Sender<Message>, Receiver<Message>)>>>,
    isolated: Arc<Mutex<HashSet<MemberId>>>,
    /// One queue per potential listener, fed by every `create_channel` dial
    /// addressed to it, drained by its `accept`. Dials between members that
    /// already have a static peer relationship just sit here unread.
    dials: Arc<Mutex<HashMap<MemberId, (Sender<MemberId>, Receiver<MemberId>)>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&self, from: MemberId, to: MemberId) -> (Sender<Message>, Receiver<Message>) {
        self.links
            .lock()
            .entry((from, to))
            .or_insert_with(unbounded)
            .clone()
    }

    fn dial_queue(&self, listener: MemberId) -> (Sender<MemberId>, Receiver<MemberId>) {
        self.dials.lock().entry(listener).or_insert_with(unbounded).clone()
    }

    fn is_isolated(&self, member: MemberId) -> bool {
        self.isolated.lock().contains(&member)
    }

    /// Cut `member` off from every other member until [`LoopbackHub::restore`].
    pub fn isolate(&self, member: MemberId) {
        self.isolated.lock().insert(member);
    }

    pub fn restore(&self, member: MemberId) {
        self.isolated.lock().remove(&member);
    }
}

impl Network for LoopbackHub {
    fn create_channel(&self, local: MemberId, remote: MemberId) -> anyhow::Result<Box<dyn Channel>> {
        let (outbound, _) = self.link(local, remote);
        let (_, inbound) = self.link(remote, local);
        let _ = self.dial_queue(remote).0.send(local);
        Ok(Box::new(LoopbackChannel {
            local,
            remote,
            hub: self.clone(),
            outbound,
            inbound,
        }))
    }

    fn accept(&self, local: MemberId) -> anyhow::Result<Option<(MemberId, Box<dyn Channel>)>> {
        let rx = self.dial_queue(local).1;
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(dialer) => Ok(Some((dialer, self.create_channel(local, dialer)?))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

/// A [`Channel`] backed by two of a [`LoopbackHub`]'s mailboxes: this
/// member's outbound queue to the remote, and the remote's outbound queue
/// back to this member.
///
/// Messages queued before a reconnect are still delivered after one — this
/// hub doesn't model the "fresh stream on reconnect" guarantee exactly,
/// which is harmless for Raft (a stale heartbeat or already-applied
/// `AppendEntries` is a no-op) and simpler for deterministic tests.
pub struct LoopbackChannel {
    local: MemberId,
    remote: MemberId,
    hub: LoopbackHub,
    outbound: Sender<Message>,
    inbound: Receiver<Message>,
}

impl Channel for LoopbackChannel {
    fn send(&self, message: Message) -> anyhow::Result<()> {
        if self.hub.is_isolated(self.local) || self.hub.is_isolated(self.remote) {
            anyhow::bail!("{} is isolated from {}", self.local, self.remote);
        }
        self.outbound.send(message).map_err(|_| anyhow::anyhow!("loopback peer has no registered mailbox"))
    }

    /// Waits up to a few seconds for a message so a `Peer`'s receive thread
    /// re-checks its stop flag promptly on shutdown, then reports a
    /// (harmless, here) teardown so the caller reconnects.
    fn receive(&self) -> anyhow::Result<Option<Message>> {
        if self.hub.is_isolated(self.local) || self.hub.is_isolated(self.remote) {
            anyhow::bail!("{} is isolated from {}", self.local, self.remote);
        }
        match self.inbound.recv_timeout(Duration::from_secs(2)) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_core::message::MessageBody;
    use raft_core::message::MessagePool;

    #[test]
    fn messages_flow_in_the_direction_sent() {
        let hub = LoopbackHub::new();
        let a = MemberId(1);
        let b = MemberId(2);
        let pool = MessagePool::new();
        let a_to_b = hub.create_channel(a, b).unwrap();
        let b_to_a = hub.create_channel(b, a).unwrap();

        let msg = pool.checkout(a, MessageBody::RequestVoteReply { term: 1, vote_granted: true });
        a_to_b.send(msg).unwrap();
        let received = b_to_a.receive().unwrap().expect("message delivered");
        assert_eq!(received.from(), a);
    }

    #[test]
    fn isolated_member_cannot_send_or_receive() {
        let hub = LoopbackHub::new();
        let a = MemberId(1);
        let b = MemberId(2);
        let pool = MessagePool::new();
        let a_to_b = hub.create_channel(a, b).unwrap();

        hub.isolate(b);
        let msg = pool.checkout(a, MessageBody::RequestVoteReply { term: 1, vote_granted: true });
        assert!(a_to_b.send(msg).is_err());

        hub.restore(b);
        let msg = pool.checkout(a, MessageBody::RequestVoteReply { term: 1, vote_granted: true });
        assert!(a_to_b.send(msg).is_ok());
    }
}
