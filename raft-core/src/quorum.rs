//! Majority-count arithmetic shared by election and commit-advancement
//! (§4.3 Election rules, Log replication).

/// The number of votes/acks needed for a majority of `member_count`
/// members (the caller's own vote/ack is included in the count it passes
/// in).
pub fn majority(member_count: usize) -> usize {
    member_count / 2 + 1
}

/// Given every member's last-acknowledged index (self included), returns
/// the highest index acknowledged by a majority — the new `commitIndex`
/// candidate (Raft's "N" rule).
pub fn majority_index(mut indices: Vec<u64>) -> u64 {
    if indices.is_empty() {
        return 0;
    }
    indices.sort_unstable_by(|a, b| b.cmp(a));
    let need = majority(indices.len());
    indices[need - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_of_odd_and_even_counts() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn majority_index_picks_the_nth_highest() {
        assert_eq!(majority_index(vec![10, 8, 5]), 8);
        assert_eq!(majority_index(vec![10, 10, 5, 1]), 5);
        assert_eq!(majority_index(vec![]), 0);
    }
}
