//! Weighted committee snapshot.
//!
//! The committee of height `h - 1` validates every message of height `h`.
//! Member indices are the identifiers carried in signer sets, so the order
//! must be identical on every node.

use {
    crate::message::ConsensusMessage,
    solana_pubkey::Pubkey,
    std::collections::{HashMap, HashSet},
};

/// A single committee member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitteeMember {
    /// Validator address, used by the contract and the p2p layer.
    pub address: Pubkey,
    pub voting_power: u64,
    /// Key checked against consensus message signatures.
    pub consensus_key: Pubkey,
    pub index: usize,
}

/// An ordered, weighted committee.
///
/// Members are sorted by (voting power descending, address ascending).
#[derive(Debug, Clone)]
pub struct Committee {
    members: Vec<CommitteeMember>,
    index: HashMap<Pubkey, usize>,
    total_power: u64,
}

impl Committee {
    /// Build a committee from `(address, consensus key, voting power)`
    /// triples. Zero-power entries are dropped.
    pub fn new(members: Vec<(Pubkey, Pubkey, u64)>) -> Self {
        let mut sorted: Vec<(Pubkey, Pubkey, u64)> = members
            .into_iter()
            .filter(|(_, _, power)| *power > 0)
            .collect();
        sorted.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));

        let members: Vec<CommitteeMember> = sorted
            .into_iter()
            .enumerate()
            .map(|(index, (address, consensus_key, voting_power))| CommitteeMember {
                address,
                voting_power,
                consensus_key,
                index,
            })
            .collect();
        let total_power = members
            .iter()
            .fold(0u64, |acc, m| acc.saturating_add(m.voting_power));
        let index = members.iter().map(|m| (m.address, m.index)).collect();

        Self {
            members,
            index,
            total_power,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    /// Returns the member at the given index.
    pub fn member(&self, index: usize) -> Option<&CommitteeMember> {
        self.members.get(index)
    }

    /// Look up a member by address.
    pub fn member_by_address(&self, address: &Pubkey) -> Option<&CommitteeMember> {
        self.index.get(address).and_then(|i| self.members.get(*i))
    }

    pub fn contains(&self, address: &Pubkey) -> bool {
        self.index.contains_key(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommitteeMember> {
        self.members.iter()
    }

    /// Voting power needed for a quorum: `ceil(2 * total / 3)`.
    pub fn quorum(&self) -> u64 {
        quorum(self.total_power)
    }

    /// Maximum faulty power tolerated: `ceil(total / 3) - 1`.
    pub fn f(&self) -> u64 {
        max_faulty(self.total_power)
    }

    /// Sum of voting power of the distinct `indices`. Unknown indices count
    /// for nothing.
    pub fn power_of(&self, indices: &[usize]) -> u64 {
        let mut seen = HashSet::new();
        indices
            .iter()
            .filter(|i| seen.insert(**i))
            .filter_map(|i| self.members.get(*i))
            .fold(0u64, |acc, m| acc.saturating_add(m.voting_power))
    }

    /// Greedily pick votes, in order, whose signers do not overlap with the
    /// ones already picked, until their power reaches quorum.
    ///
    /// Returns `None` when the votes cannot reach quorum.
    pub fn over_quorum_votes(&self, votes: &[ConsensusMessage]) -> Option<Vec<ConsensusMessage>> {
        let quorum = self.quorum();
        let mut signers: HashSet<usize> = HashSet::new();
        let mut power = 0u64;
        let mut picked = Vec::new();
        for vote in votes {
            let indices = vote.signers().flatten_uniq();
            if indices.iter().any(|i| signers.contains(i)) {
                continue;
            }
            for i in indices {
                if let Some(member) = self.members.get(i) {
                    power = power.saturating_add(member.voting_power);
                }
                signers.insert(i);
            }
            picked.push(vote.clone());
            if power >= quorum {
                return Some(picked);
            }
        }
        None
    }

    /// Power of the distinct signers over all `votes`.
    pub fn votes_power(&self, votes: &[ConsensusMessage]) -> u64 {
        let indices: Vec<usize> = votes
            .iter()
            .flat_map(|v| v.signers().flatten_uniq())
            .collect();
        self.power_of(&indices)
    }
}

/// `ceil(2 * total / 3)`.
pub fn quorum(total: u64) -> u64 {
    let total = u128::from(total);
    let q = total.saturating_mul(2).saturating_add(2) / 3;
    u64::try_from(q).unwrap_or(u64::MAX)
}

/// `ceil(total / 3) - 1`, zero for an empty committee.
pub fn max_faulty(total: u64) -> u64 {
    let ceil_third = u128::from(total).saturating_add(2) / 3;
    u64::try_from(ceil_third.saturating_sub(1)).unwrap_or(u64::MAX)
}

/// True when two votes in `votes` share a signer.
pub fn has_equivocated_votes(votes: &[ConsensusMessage]) -> bool {
    let mut seen = HashSet::new();
    votes
        .iter()
        .flat_map(|v| v.signers().flatten_uniq())
        .any(|i| !seen.insert(i))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::test_utils::{random_pubkey, TestCommittee},
        test_case::test_case,
    };

    #[test_case(1, 1, 0; "single member")]
    #[test_case(3, 2, 0; "three members")]
    #[test_case(4, 3, 1; "four members")]
    #[test_case(5, 4, 1; "five members")]
    #[test_case(6, 4, 1; "six members")]
    #[test_case(7, 5, 2; "seven members")]
    #[test_case(100, 67, 33; "hundred")]
    fn test_quorum_and_f(total: u64, expected_quorum: u64, expected_f: u64) {
        assert_eq!(quorum(total), expected_quorum);
        assert_eq!(max_faulty(total), expected_f);
    }

    #[test]
    fn test_quorum_properties_hold_for_all_sizes() {
        for total in 1..=1_000u64 {
            let q = quorum(total);
            let f = max_faulty(total);
            assert_eq!(q, (2 * total).div_ceil(3));
            assert!(q <= total - f, "liveness broken for {total}");
            assert!(2 * q - total > f, "safety broken for {total}");
        }
    }

    #[test]
    fn test_sorted_by_power_desc() {
        let keys: Vec<Pubkey> = (0..3).map(|_| random_pubkey()).collect();
        let committee = Committee::new(vec![
            (keys[0], keys[0], 100),
            (keys[1], keys[1], 300),
            (keys[2], keys[2], 0),
        ]);
        assert_eq!(committee.len(), 2);
        assert_eq!(committee.member(0).unwrap().address, keys[1]);
        assert_eq!(committee.member_by_address(&keys[0]).unwrap().index, 1);
        assert_eq!(committee.total_power(), 400);
        assert!(!committee.contains(&keys[2]));
    }

    #[test]
    fn test_over_quorum_skips_overlapping_signers() {
        let tc = TestCommittee::new(4);
        let v = tc.value(1);
        let votes = vec![
            tc.prevote(1, 0, v, 0),
            tc.aggregated_prevote(1, 0, v, &[0, 1]),
            tc.prevote(1, 0, v, 1),
            tc.prevote(1, 0, v, 2),
        ];
        let quorum = tc.committee.over_quorum_votes(&votes).unwrap();
        assert_eq!(quorum.len(), 3);
        assert!(!has_equivocated_votes(&quorum));
        assert!(tc.committee.over_quorum_votes(&votes[..2]).is_none());
    }

    #[test]
    fn test_has_equivocated_votes() {
        let tc = TestCommittee::new(4);
        let votes = vec![
            tc.prevote(1, 0, tc.value(1), 0),
            tc.prevote(1, 0, tc.value(2), 0),
        ];
        assert!(has_equivocated_votes(&votes));
        assert!(!has_equivocated_votes(&votes[..1]));
    }

    #[test]
    fn test_power_of_counts_distinct() {
        let tc = TestCommittee::new(4);
        assert_eq!(tc.committee.power_of(&[0, 0, 1]), 2);
        assert_eq!(tc.committee.power_of(&[7]), 0);
    }
}
