//! The network interface (§6 Network interface).
//!
//! Pluggable transport implementations (TCP sockets, in-memory loopback)
//! are explicitly out of scope for this crate (§1); only the trait
//! boundary is defined here. `raft-memstore` ships a loopback `Channel`
//! for this crate's own tests.

use crate::message::Message;
use crate::MemberId;

/// A reliable, FIFO byte channel between a local member and one remote
/// member.
///
/// Channels must deliver messages in FIFO order while connected; after a
/// reconnect, the other side sees a fresh stream with no guarantee about
/// messages that were in flight during the break (§6).
pub trait Channel: Send + Sync {
    fn send(&self, message: Message) -> anyhow::Result<()>;

    /// Blocks until a message is available or the channel is torn down, in
    /// which case `Ok(None)` is returned.
    fn receive(&self) -> anyhow::Result<Option<Message>>;
}

/// Creates [`Channel`]s between this process's local members and remote
/// members.
pub trait Network: Send + Sync {
    fn create_channel(&self, local: MemberId, remote: MemberId) -> anyhow::Result<Box<dyn Channel>>;

    /// Waits for an unsolicited inbound connection addressed to `local` —
    /// a remote member dialing in without `local` having dialed out first.
    /// Used to attach a cross-shard slave (§4.3) whose member id a leader
    /// has no static configuration for.
    ///
    /// A bounded wait lets the caller recheck its stop flag between polls.
    /// Implementations with no listen side (a plain dialer-only transport)
    /// can leave this at its default, which never reports an acceptance.
    fn accept(&self, local: MemberId) -> anyhow::Result<Option<(MemberId, Box<dyn Channel>)>> {
        let _ = local;
        Ok(None)
    }
}
