//! Proofs and the events submitted on-chain.

use {
    crate::message::ConsensusMessage,
    serde::{Deserialize, Serialize},
    solana_pubkey::Pubkey,
};

/// What a proof claims about its offender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProofType {
    /// Self-sufficient proof of a protocol violation.
    Misbehaviour = 0,
    /// Suspicion the accused must answer with an innocence proof.
    Accusation = 1,
    /// Answer to an accusation.
    Innocence = 2,
}

impl ProofType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Misbehaviour),
            1 => Some(Self::Accusation),
            2 => Some(Self::Innocence),
            _ => None,
        }
    }
}

/// Accountability rules. The numeric ids are shared with the on-chain
/// contract and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Rule {
    /// New proposal after a non-nil precommit at an earlier round.
    PN = 0,
    /// Old proposal without justification at its valid round.
    PO = 1,
    /// Prevote for a new proposal against the latest precommit.
    PVN = 2,
    /// Prevote for an old proposal despite a conflicting quorum.
    PVO = 3,
    /// Prevote for an old proposal against the latest precommit.
    PVO12 = 4,
    /// Prevote for an old proposal whose valid round is not in the past.
    PVO3 = 5,
    /// Precommit despite a quorum of prevotes for another value.
    C = 6,
    /// Precommit without a quorum of prevotes.
    C1 = 7,
    InvalidProposal = 8,
    InvalidProposer = 9,
    Equivocation = 10,
    InvalidRound = 11,
    WrongValidRound = 12,
}

impl Rule {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::PN,
            1 => Self::PO,
            2 => Self::PVN,
            3 => Self::PVO,
            4 => Self::PVO12,
            5 => Self::PVO3,
            6 => Self::C,
            7 => Self::C1,
            8 => Self::InvalidProposal,
            9 => Self::InvalidProposer,
            10 => Self::Equivocation,
            11 => Self::InvalidRound,
            12 => Self::WrongValidRound,
            _ => return None,
        })
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A proof about the committee member at `offender_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub proof_type: ProofType,
    pub rule: Rule,
    pub message: ConsensusMessage,
    pub evidences: Vec<ConsensusMessage>,
    pub offender_index: usize,
}

impl Proof {
    pub fn new(
        proof_type: ProofType,
        rule: Rule,
        message: ConsensusMessage,
        evidences: Vec<ConsensusMessage>,
        offender_index: usize,
    ) -> Self {
        Self {
            proof_type,
            rule,
            message,
            evidences,
            offender_index,
        }
    }

    pub fn misbehaviour(
        rule: Rule,
        message: ConsensusMessage,
        evidences: Vec<ConsensusMessage>,
        offender_index: usize,
    ) -> Self {
        Self::new(ProofType::Misbehaviour, rule, message, evidences, offender_index)
    }

    pub fn accusation(
        rule: Rule,
        message: ConsensusMessage,
        evidences: Vec<ConsensusMessage>,
        offender_index: usize,
    ) -> Self {
        Self::new(ProofType::Accusation, rule, message, evidences, offender_index)
    }

    pub fn innocence(
        rule: Rule,
        message: ConsensusMessage,
        evidences: Vec<ConsensusMessage>,
        offender_index: usize,
    ) -> Self {
        Self::new(ProofType::Innocence, rule, message, evidences, offender_index)
    }
}

/// An accountability event as submitted to the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountabilityEvent {
    pub event_type: ProofType,
    pub rule: Rule,
    pub reporter: Pubkey,
    pub offender: Pubkey,
    /// Height of the offending message.
    pub block: u64,
    pub raw_proof: Vec<u8>,
}

/// One slice of an [`AccountabilityEvent`] whose proof did not fit in a
/// single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedEvent {
    pub chunks: u8,
    pub chunk_id: u8,
    pub event_type: ProofType,
    pub rule: Rule,
    pub reporter: Pubkey,
    pub offender: Pubkey,
    pub block: u64,
    pub raw_proof: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_ids_stable() {
        for id in 0..=12u8 {
            assert_eq!(Rule::from_u8(id).unwrap().id(), id);
        }
        assert_eq!(Rule::from_u8(13), None);
        assert_eq!(Rule::C1.id(), 7);
        assert_eq!(Rule::WrongValidRound.id(), 12);
    }

    #[test]
    fn test_proof_type_ids() {
        assert_eq!(ProofType::from_u8(0), Some(ProofType::Misbehaviour));
        assert_eq!(ProofType::from_u8(2), Some(ProofType::Innocence));
        assert_eq!(ProofType::from_u8(3), None);
    }
}
