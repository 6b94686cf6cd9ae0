//! Consensus message model seen by the accountability subsystem.
//!
//! Messages are immutable once built. Votes may be aggregated: a single
//! prevote or precommit can carry the signatures of several committee members
//! for the same `(height, round, value)`, so every vote carries a
//! [`SignerSet`] of committee indices rather than a single sender.

use {
    crate::{
        committee::Committee,
        crypto::SignatureVerifier,
        error::{AccountabilityError, Result},
    },
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
};

/// The nil value. A vote for it carries no block.
pub const NIL_VALUE: Hash = Hash::new_from_array([0u8; 32]);

/// Round value marking a proposal that does not re-propose an older value.
pub const NEW_PROPOSAL_ROUND: i64 = -1;

// ---------------------------------------------------------------------------
// Message codes and signer sets
// ---------------------------------------------------------------------------

/// Message kind, also used as the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageCode {
    Proposal = 0,
    Prevote = 1,
    Precommit = 2,
    LightProposal = 3,
}

impl MessageCode {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Proposal),
            1 => Some(Self::Prevote),
            2 => Some(Self::Precommit),
            3 => Some(Self::LightProposal),
            _ => None,
        }
    }

    /// Proposals and light proposals belong to the same family.
    pub fn same_family(self, other: Self) -> bool {
        self.family() == other.family()
    }

    fn family(self) -> u8 {
        match self {
            Self::Proposal | Self::LightProposal => 0,
            Self::Prevote => 1,
            Self::Precommit => 2,
        }
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageCode::Proposal => write!(f, "Proposal"),
            MessageCode::Prevote => write!(f, "Prevote"),
            MessageCode::Precommit => write!(f, "Precommit"),
            MessageCode::LightProposal => write!(f, "LightProposal"),
        }
    }
}

/// Committee indices of the members who signed a message.
///
/// An aggregated vote may list the same index more than once when
/// overlapping aggregates were merged; use [`SignerSet::flatten_uniq`] to get
/// each signer once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignerSet {
    indices: Vec<usize>,
}

impl SignerSet {
    pub fn single(index: usize) -> Self {
        Self {
            indices: vec![index],
        }
    }

    pub fn from_indices(indices: Vec<usize>) -> Self {
        Self { indices }
    }

    /// Raw indices, duplicates included.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Distinct signer indices in ascending order.
    pub fn flatten_uniq(&self) -> Vec<usize> {
        let mut out = self.indices.clone();
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }
}

// ---------------------------------------------------------------------------
// Message bodies
// ---------------------------------------------------------------------------

/// A prevote or precommit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub height: u64,
    pub round: i64,
    pub value: Hash,
    pub signers: SignerSet,
    pub signature: Signature,
}

/// A proposal stripped of its block payload.
///
/// Carries the proposer's signature over `(height, round, valid_round,
/// value)`, which is exactly what the full proposal signs, so a light
/// proposal verifies without the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightProposal {
    pub height: u64,
    pub round: i64,
    pub valid_round: i64,
    pub value: Hash,
    pub signer: usize,
    pub signature: Signature,
}

/// A block proposal as received from consensus. `value` is the hash of
/// `block`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: i64,
    pub valid_round: i64,
    pub value: Hash,
    pub signer: usize,
    pub signature: Signature,
    pub block: Vec<u8>,
}

impl Proposal {
    /// Build a proposal whose value is derived from the block payload.
    pub fn new(
        height: u64,
        round: i64,
        valid_round: i64,
        signer: usize,
        block: Vec<u8>,
        signature: Signature,
    ) -> Self {
        let value = solana_sha256_hasher::hashv(&[&block]);
        Self {
            height,
            round,
            valid_round,
            value,
            signer,
            signature,
            block,
        }
    }
}

// ---------------------------------------------------------------------------
// ConsensusMessage
// ---------------------------------------------------------------------------

/// A consensus message stored and reasoned about by the fault detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    LightProposal(LightProposal),
    Prevote(Vote),
    Precommit(Vote),
}

impl ConsensusMessage {
    pub fn code(&self) -> MessageCode {
        match self {
            Self::Proposal(_) => MessageCode::Proposal,
            Self::LightProposal(_) => MessageCode::LightProposal,
            Self::Prevote(_) => MessageCode::Prevote,
            Self::Precommit(_) => MessageCode::Precommit,
        }
    }

    pub fn height(&self) -> u64 {
        match self {
            Self::Proposal(p) => p.height,
            Self::LightProposal(p) => p.height,
            Self::Prevote(v) | Self::Precommit(v) => v.height,
        }
    }

    pub fn round(&self) -> i64 {
        match self {
            Self::Proposal(p) => p.round,
            Self::LightProposal(p) => p.round,
            Self::Prevote(v) | Self::Precommit(v) => v.round,
        }
    }

    pub fn value(&self) -> Hash {
        match self {
            Self::Proposal(p) => p.value,
            Self::LightProposal(p) => p.value,
            Self::Prevote(v) | Self::Precommit(v) => v.value,
        }
    }

    /// Valid round of a proposal, `None` for votes.
    pub fn valid_round(&self) -> Option<i64> {
        match self {
            Self::Proposal(p) => Some(p.valid_round),
            Self::LightProposal(p) => Some(p.valid_round),
            Self::Prevote(_) | Self::Precommit(_) => None,
        }
    }

    pub fn signature(&self) -> &Signature {
        match self {
            Self::Proposal(p) => &p.signature,
            Self::LightProposal(p) => &p.signature,
            Self::Prevote(v) | Self::Precommit(v) => &v.signature,
        }
    }

    /// Committee indices that signed this message.
    pub fn signers(&self) -> SignerSet {
        match self {
            Self::Proposal(p) => SignerSet::single(p.signer),
            Self::LightProposal(p) => SignerSet::single(p.signer),
            Self::Prevote(v) | Self::Precommit(v) => v.signers.clone(),
        }
    }

    /// Whether `index` is among the signers, without allocating.
    pub fn is_signed_by(&self, index: usize) -> bool {
        match self {
            Self::Proposal(p) => p.signer == index,
            Self::LightProposal(p) => p.signer == index,
            Self::Prevote(v) | Self::Precommit(v) => v.signers.contains(index),
        }
    }

    pub fn is_proposal(&self) -> bool {
        matches!(self, Self::Proposal(_) | Self::LightProposal(_))
    }

    pub fn is_nil(&self) -> bool {
        self.value() == NIL_VALUE
    }

    /// Bytes covered by the signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        match self {
            Self::Proposal(Proposal {
                height,
                round,
                valid_round,
                value,
                ..
            })
            | Self::LightProposal(LightProposal {
                height,
                round,
                valid_round,
                value,
                ..
            }) => proposal_signing_payload(*height, *round, *valid_round, value),
            Self::Prevote(v) => vote_signing_payload(MessageCode::Prevote, v.height, v.round, &v.value),
            Self::Precommit(v) => {
                vote_signing_payload(MessageCode::Precommit, v.height, v.round, &v.value)
            }
        }
    }

    /// Content hash. Two messages with the same hash are byte-identical.
    pub fn hash(&self) -> Hash {
        let code = [self.code() as u8];
        let height = self.height().to_le_bytes();
        let round = self.round().to_le_bytes();
        let value = self.value();
        let signature = self.signature();
        match self {
            Self::Proposal(p) => {
                let valid_round = p.valid_round.to_le_bytes();
                let signer = (p.signer as u64).to_le_bytes();
                solana_sha256_hasher::hashv(&[
                    &code,
                    &height,
                    &round,
                    &valid_round,
                    value.as_ref(),
                    &signer,
                    signature.as_ref(),
                    &p.block,
                ])
            }
            Self::LightProposal(p) => {
                let valid_round = p.valid_round.to_le_bytes();
                let signer = (p.signer as u64).to_le_bytes();
                solana_sha256_hasher::hashv(&[
                    &code,
                    &height,
                    &round,
                    &valid_round,
                    value.as_ref(),
                    &signer,
                    signature.as_ref(),
                ])
            }
            Self::Prevote(v) | Self::Precommit(v) => {
                let signers: Vec<u8> = v
                    .signers
                    .indices()
                    .iter()
                    .flat_map(|i| (*i as u64).to_le_bytes())
                    .collect();
                solana_sha256_hasher::hashv(&[
                    &code,
                    &height,
                    &round,
                    value.as_ref(),
                    &signers,
                    signature.as_ref(),
                ])
            }
        }
    }

    /// Strip the block payload from a proposal. Other messages are returned
    /// unchanged.
    pub fn to_light(&self) -> ConsensusMessage {
        match self {
            Self::Proposal(p) => Self::LightProposal(LightProposal {
                height: p.height,
                round: p.round,
                valid_round: p.valid_round,
                value: p.value,
                signer: p.signer,
                signature: p.signature,
            }),
            other => other.clone(),
        }
    }

    /// Check that every signer belongs to `committee` and that the signature
    /// verifies against their consensus keys.
    pub fn validate(&self, committee: &Committee, verifier: &dyn SignatureVerifier) -> Result<()> {
        if self.round() < 0 {
            return Err(AccountabilityError::MalformedMessage("negative round"));
        }
        if let Some(valid_round) = self.valid_round() {
            if valid_round < NEW_PROPOSAL_ROUND {
                return Err(AccountabilityError::MalformedMessage("valid round below -1"));
            }
        }
        if let Self::Proposal(p) = self {
            if solana_sha256_hasher::hashv(&[&p.block]) != p.value {
                return Err(AccountabilityError::MalformedMessage(
                    "proposal value does not match block",
                ));
            }
        }
        let signers = self.signers().flatten_uniq();
        if signers.is_empty() {
            return Err(AccountabilityError::MalformedMessage("no signers"));
        }
        let keys = signers
            .iter()
            .map(|index| {
                committee
                    .member(*index)
                    .map(|m| m.consensus_key)
                    .ok_or(AccountabilityError::NotCommitteeMsg)
            })
            .collect::<Result<Vec<Pubkey>>>()?;
        if !verifier.verify(&keys, &self.signing_payload(), self.signature()) {
            return Err(AccountabilityError::InvalidSignature);
        }
        Ok(())
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        format!(
            "{} h={} r={} value={} signers={:?}",
            self.code(),
            self.height(),
            self.round(),
            self.value(),
            self.signers().indices(),
        )
    }
}

fn vote_signing_payload(code: MessageCode, height: u64, round: i64, value: &Hash) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 8 + 32);
    buf.push(code as u8);
    buf.extend_from_slice(&height.to_le_bytes());
    buf.extend_from_slice(&round.to_le_bytes());
    buf.extend_from_slice(value.as_ref());
    buf
}

fn proposal_signing_payload(height: u64, round: i64, valid_round: i64, value: &Hash) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 8 + 8 + 32);
    buf.push(MessageCode::LightProposal as u8);
    buf.extend_from_slice(&height.to_le_bytes());
    buf.extend_from_slice(&round.to_le_bytes());
    buf.extend_from_slice(&valid_round.to_le_bytes());
    buf.extend_from_slice(value.as_ref());
    buf
}
