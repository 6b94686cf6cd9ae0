//! Interfaces to the rest of the node: chain state, the on-chain
//! accountability contract and the p2p layer.

use {
    crate::{
        committee::Committee,
        error::ContractError,
        proof::{ChunkedEvent, Rule},
        proposer::proposer_for_round,
    },
    crossbeam_channel::Receiver,
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    std::sync::Arc,
};

/// The parts of a block header the accountability subsystem reads.
#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub number: u64,
    /// Committee that validates messages of height `number + 1`.
    pub committee: Arc<Committee>,
}

/// A newly imported block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEvent {
    pub number: u64,
    pub hash: Hash,
}

/// The chain event subscription failed; the subsystem cannot keep up with
/// the chain any more.
#[derive(Debug, Clone, thiserror::Error)]
#[error("chain subscription failed: {0}")]
pub struct SubscriptionError(pub String);

/// An accusation filed on-chain against a watched validator.
#[derive(Debug, Clone)]
pub struct NewAccusation {
    pub id: u64,
    pub offender: Pubkey,
    pub raw_proof: Vec<u8>,
}

/// Read access to the local chain.
pub trait ChainContext: Send + Sync {
    fn header_by_number(&self, number: u64) -> Option<BlockHeader>;

    fn current_height(&self) -> u64;

    /// Whether `value` is the block committed at `height`.
    fn is_committed(&self, value: &Hash, height: u64) -> bool;

    fn subscribe_chain_events(&self) -> Receiver<Result<ChainEvent, SubscriptionError>>;

    /// Committee validating messages of `height`.
    fn committee_at(&self, height: u64) -> Option<Arc<Committee>> {
        let parent = height.checked_sub(1)?;
        self.header_by_number(parent).map(|h| h.committee)
    }

    /// Address of the proposer of `(height, round)`.
    fn proposer(&self, height: u64, round: i64) -> Option<Pubkey> {
        let committee = self.committee_at(height)?;
        proposer_for_round(&committee, height, round)
    }
}

/// Answer of the contract to "may this node accuse now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccusationStatus {
    pub allowed: bool,
    /// Block until which an accusation cannot be filed, 0 when it never can.
    pub deadline: u64,
}

/// Binding to the on-chain accountability contract.
pub trait AccountabilityContract: Send + Sync {
    fn can_slash(&self, offender: &Pubkey, rule: Rule, block: u64) -> Result<bool, ContractError>;

    fn can_accuse(
        &self,
        offender: &Pubkey,
        rule: Rule,
        block: u64,
    ) -> Result<AccusationStatus, ContractError>;

    /// Dry-run a submission. Returns [`ContractError::Oversize`] when the
    /// chunk does not fit.
    fn estimate_event(&self, _event: &ChunkedEvent) -> Result<(), ContractError> {
        Ok(())
    }

    /// Submit a chunk, returning the transaction id.
    fn handle_event(&self, event: &ChunkedEvent) -> Result<Hash, ContractError>;

    fn tx_confirmed(&self, tx: &Hash) -> Result<bool, ContractError>;

    /// Accusations filed against `offender` from now on.
    fn watch_new_accusation(&self, offender: &Pubkey) -> Receiver<NewAccusation>;
}

/// Direct messaging to committee members.
pub trait PeerNetwork: Send + Sync {
    /// Send `payload` to `peer`. Returns `false` when there is no direct
    /// connection.
    fn send(&self, peer: &Pubkey, payload: Vec<u8>) -> bool;
}
