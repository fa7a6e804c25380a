//! A metrics sink trait replacing the JMX/MBean surface named in the
//! design notes: the core exports counters and gauges, an embedder routes
//! them wherever it likes. The transport those counters ride on (JMX or
//! otherwise) is out of this crate's scope; only the injection point is.

use crate::MemberId;
use crate::Role;
use crate::ShardId;

/// Counters and gauges a [`crate::core_member::CoreMember`] reports as it
/// runs. All methods have a default no-op body so a `MetricsSink` impl
/// only needs to override what it cares about.
pub trait MetricsSink: Send + Sync {
    fn role_changed(&self, _shard: ShardId, _member: MemberId, _role: Role) {}

    fn commit_index_advanced(&self, _shard: ShardId, _member: MemberId, _commit_index: u64) {}

    fn append_entries_sent(&self, _shard: ShardId, _to: MemberId, _entry_count: usize) {}

    fn election_started(&self, _shard: ShardId, _member: MemberId, _term: u64) {}

    fn command_committed(&self, _shard: ShardId, _index: u64) {}

    fn command_timed_out(&self, _shard: ShardId, _index: u64) {}
}

/// The default sink, installed when an embedder doesn't register one of
/// its own.
#[derive(Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {}

/// An in-memory recorder usable both by this crate's own unit tests and by
/// integration tests in `raft-core/tests/`.
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// An in-memory recorder for assertions in integration tests.
    #[derive(Default)]
    pub struct RecordingMetricsSink {
        pub role_changes: Mutex<Vec<(ShardId, MemberId, Role)>>,
        pub commits: Mutex<Vec<(ShardId, u64)>>,
        pub timeouts: Mutex<Vec<(ShardId, u64)>>,
        /// `(shard, member, entry_count)` for every dispatched append, useful
        /// for asserting that several queued commands were folded into one
        /// batch rather than sent as separate appends.
        pub appends: Mutex<Vec<(ShardId, MemberId, usize)>>,
    }

    impl MetricsSink for RecordingMetricsSink {
        fn role_changed(&self, shard: ShardId, member: MemberId, role: Role) {
            self.role_changes.lock().push((shard, member, role));
        }

        fn append_entries_sent(&self, shard: ShardId, to: MemberId, entry_count: usize) {
            self.appends.lock().push((shard, to, entry_count));
        }

        fn command_committed(&self, shard: ShardId, index: u64) {
            self.commits.lock().push((shard, index));
        }

        fn command_timed_out(&self, shard: ShardId, index: u64) {
            self.timeouts.lock().push((shard, index));
        }
    }

    #[test]
    fn recording_sink_captures_role_changes() {
        let sink = RecordingMetricsSink::default();
        sink.role_changed(ShardId(1), MemberId(1), Role::Leader);
        assert_eq!(sink.role_changes.lock().len(), 1);
    }
}
