//! The log entry type and its invariants (§3 DATA MODEL, Log entry).

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

/// One entry of a member's replicated log.
///
/// `index` starts at 1 and is contiguous per member. Index 0 is a sentinel
/// that is never actually stored — [`LogEntry::sentinel`] constructs the
/// conceptual value so prefix-matching code can treat it uniformly with
/// real entries (§3: "An index-0 sentinel ... matches any leader's
/// prefix").
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    #[serde(with = "serde_bytes_compat")]
    pub payload: Bytes,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, payload: Bytes) -> Self {
        Self { index, term, payload }
    }

    /// The conceptual index-0 entry that matches any leader's prefix.
    pub fn sentinel() -> Self {
        Self {
            index: 0,
            term: 0,
            payload: Bytes::new(),
        }
    }

    /// A no-op (empty payload), appended by a new leader to force commit of
    /// prior-term entries (§4.3 "No-op after election").
    pub fn noop(index: u64, term: u64) -> Self {
        Self {
            index,
            term,
            payload: Bytes::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.payload.is_empty()
    }
}

/// `(term, index)` compared lexicographically, used by the election "at
/// least as up-to-date" rule (§4.3 Election rules) and by commit
/// advancement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPosition {
    pub term: u64,
    pub index: u64,
}

impl LogPosition {
    pub const ZERO: LogPosition = LogPosition { term: 0, index: 0 };

    pub fn of(entry: &LogEntry) -> Self {
        Self {
            term: entry.term,
            index: entry.index,
        }
    }
}

mod serde_bytes_compat {
    use bytes::Bytes;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let v: Vec<u8> = serde::Deserialize::deserialize(d)?;
        Ok(Bytes::from(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_index_zero_term_zero() {
        let s = LogEntry::sentinel();
        assert_eq!(s.index, 0);
        assert_eq!(s.term, 0);
        assert!(s.is_noop());
    }

    #[test]
    fn log_position_orders_lexicographically() {
        let older_term = LogPosition { term: 1, index: 100 };
        let newer_term = LogPosition { term: 2, index: 1 };
        assert!(newer_term > older_term);
    }
}
