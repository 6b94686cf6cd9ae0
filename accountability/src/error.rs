//! Error types for the accountability subsystem.

use {solana_pubkey::Pubkey, thiserror::Error};

/// Errors raised while validating consensus messages, handling off-chain
/// accountability traffic, or building proofs.
///
/// Several variants are returned to the p2p layer so the peer that sent the
/// payload can be penalised.
#[derive(Error, Debug)]
pub enum AccountabilityError {
    #[error("duplicated message")]
    DuplicatedMsg,

    #[error("equivocation detected")]
    Equivocation,

    #[error("message signer is not a committee member")]
    NotCommitteeMsg,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    #[error("proposal sent by an unexpected proposer")]
    InvalidProposer,

    #[error("round exceeds the maximum round")]
    InvalidRound,

    #[error("valid round must be lower than the round")]
    WrongValidRound,

    #[error("message from a future height {0}")]
    FutureMsg(u64),

    #[error("offender index {0} out of range")]
    InvalidOffenderIndex(u64),

    #[error("no evidence to prove innocence of PO")]
    NoEvidenceForPO,

    #[error("no evidence to prove innocence of PVN")]
    NoEvidenceForPVN,

    #[error("no evidence to prove innocence of PVO")]
    NoEvidenceForPVO,

    #[error("no evidence to prove innocence of C1")]
    NoEvidenceForC1,

    #[error("rule cannot be answered with an innocence proof")]
    UnprovableRule,

    #[error("parent header of height {0} is not available")]
    NoParentHeader(u64),

    #[error("invalid accusation")]
    InvalidAccusation,

    #[error("accusation already received from peer")]
    PeerDuplicatedAccusation,

    #[error("invalid innocence proof")]
    InvalidInnocenceProof,

    #[error("malicious accusation rate from peer")]
    AccusationRateMalicious,

    #[error("accusation received from non-validator {0}")]
    AccusationFromNonValidator(Pubkey),

    #[error("unexpected proof type")]
    WrongProofType,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Wire encoding failures.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("empty payload")]
    Empty,

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("full proposals cannot be encoded in a proof")]
    FullProposal,

    #[error("unknown proof type {0}")]
    UnknownProofType(u8),

    #[error("unknown rule {0}")]
    UnknownRule(u8),

    #[error("offender index {0} does not fit the platform")]
    OffenderIndexOverflow(u64),
}

/// Failures returned by the on-chain accountability contract binding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    /// The submitted chunk does not fit in a transaction.
    #[error("event chunk too large")]
    Oversize,

    #[error("contract call failed: {0}")]
    Call(String),
}

/// Outcome of a reporting attempt that did not submit an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    /// The event can never be submitted and is dropped.
    #[error("event is not reportable")]
    InvalidReport,

    /// The event must wait for a later reporting slot.
    #[error("event reporting is deferred")]
    PendingReport,

    #[error("reporter channel closed")]
    ChannelClosed,
}

/// Convenience result type for accountability operations.
pub type Result<T> = std::result::Result<T, AccountabilityError>;
