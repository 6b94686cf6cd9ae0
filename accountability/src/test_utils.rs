//! Fixtures shared by unit and integration tests: a signing committee and
//! in-memory chain, contract and network.

use {
    crate::{
        chain::{
            AccountabilityContract, AccusationStatus, BlockHeader, ChainContext, ChainEvent,
            NewAccusation, PeerNetwork, SubscriptionError,
        },
        committee::Committee,
        crypto::SignatureVerifier,
        error::ContractError,
        message::{ConsensusMessage, Proposal, SignerSet, Vote},
        proof::{ChunkedEvent, Rule},
    },
    crossbeam_channel::{unbounded, Receiver, Sender},
    parking_lot::Mutex,
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    solana_signer::Signer,
    std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    },
};

pub fn random_pubkey() -> Pubkey {
    Keypair::new().pubkey()
}

/// Accepts a signature made by any one of `keys`.
///
/// Ed25519 signatures do not aggregate, so fixtures sign aggregated votes
/// with the first signer's key only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestVerifier;

impl SignatureVerifier for TestVerifier {
    fn verify(&self, keys: &[Pubkey], payload: &[u8], signature: &Signature) -> bool {
        keys.iter().any(|key| signature.verify(key.as_ref(), payload))
    }
}

/// A committee of equally weighted members, each with its signing key.
pub struct TestCommittee {
    pub committee: Committee,
    /// Keypairs by committee index.
    keypairs: Vec<Keypair>,
}

impl TestCommittee {
    pub fn new(size: usize) -> Self {
        let keypairs: Vec<Keypair> = (0..size).map(|_| Keypair::new()).collect();
        let committee = Committee::new(
            keypairs
                .iter()
                .map(|k| (k.pubkey(), k.pubkey(), 1))
                .collect(),
        );
        let mut by_key: HashMap<Pubkey, Keypair> =
            keypairs.into_iter().map(|k| (k.pubkey(), k)).collect();
        let keypairs = committee
            .iter()
            .filter_map(|m| by_key.remove(&m.consensus_key))
            .collect();
        Self {
            committee,
            keypairs,
        }
    }

    pub fn verifier(&self) -> TestVerifier {
        TestVerifier
    }

    /// A distinct non-nil value.
    pub fn value(&self, seed: u8) -> Hash {
        solana_sha256_hasher::hashv(&[b"value", &[seed]])
    }

    pub fn keypair(&self, index: usize) -> &Keypair {
        &self.keypairs[index]
    }

    fn sign(&self, index: usize, msg: &ConsensusMessage) -> Signature {
        self.keypairs[index].sign_message(&msg.signing_payload())
    }

    pub fn proposal(
        &self,
        height: u64,
        round: i64,
        valid_round: i64,
        signer: usize,
        block: &[u8],
    ) -> ConsensusMessage {
        let mut proposal = Proposal::new(
            height,
            round,
            valid_round,
            signer,
            block.to_vec(),
            Signature::default(),
        );
        proposal.signature = self.sign(signer, &ConsensusMessage::Proposal(proposal.clone()));
        ConsensusMessage::Proposal(proposal)
    }

    fn vote(&self, height: u64, round: i64, value: Hash, signers: &[usize]) -> Vote {
        Vote {
            height,
            round,
            value,
            signers: SignerSet::from_indices(signers.to_vec()),
            signature: Signature::default(),
        }
    }

    pub fn prevote(&self, height: u64, round: i64, value: Hash, signer: usize) -> ConsensusMessage {
        self.aggregated_prevote(height, round, value, &[signer])
    }

    pub fn precommit(&self, height: u64, round: i64, value: Hash, signer: usize) -> ConsensusMessage {
        self.aggregated_precommit(height, round, value, &[signer])
    }

    pub fn aggregated_prevote(
        &self,
        height: u64,
        round: i64,
        value: Hash,
        signers: &[usize],
    ) -> ConsensusMessage {
        let mut msg = ConsensusMessage::Prevote(self.vote(height, round, value, signers));
        self.sign_vote(&mut msg, signers);
        msg
    }

    pub fn aggregated_precommit(
        &self,
        height: u64,
        round: i64,
        value: Hash,
        signers: &[usize],
    ) -> ConsensusMessage {
        let mut msg = ConsensusMessage::Precommit(self.vote(height, round, value, signers));
        self.sign_vote(&mut msg, signers);
        msg
    }

    fn sign_vote(&self, msg: &mut ConsensusMessage, signers: &[usize]) {
        let Some(first) = signers.first() else {
            return;
        };
        let signature = self.sign(*first, msg);
        if let ConsensusMessage::Prevote(vote) | ConsensusMessage::Precommit(vote) = msg {
            vote.signature = signature;
        }
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChainState {
    height: u64,
    committed: HashSet<(u64, Hash)>,
    subscribers: Vec<Sender<Result<ChainEvent, SubscriptionError>>>,
}

/// A chain whose every header carries the same committee.
pub struct MockChain {
    committee: Arc<Committee>,
    state: Mutex<ChainState>,
}

impl MockChain {
    /// Chain with headers `0..=height`.
    pub fn new(committee: Committee, height: u64) -> Self {
        Self {
            committee: Arc::new(committee),
            state: Mutex::new(ChainState {
                height,
                ..ChainState::default()
            }),
        }
    }

    /// Import `count` blocks starting at `first` and notify subscribers.
    pub fn import_blocks(&self, first: u64, count: u64) {
        let mut state = self.state.lock();
        for number in first..first.saturating_add(count) {
            state.height = state.height.max(number);
            let event = ChainEvent {
                number,
                hash: solana_sha256_hasher::hash(&number.to_le_bytes()),
            };
            state.subscribers.retain(|s| s.send(Ok(event)).is_ok());
        }
    }

    pub fn commit(&self, height: u64, value: Hash) {
        self.state.lock().committed.insert((height, value));
    }

    /// Push an error to every subscriber.
    pub fn fail_subscriptions(&self, reason: &str) {
        let state = self.state.lock();
        for subscriber in &state.subscribers {
            let _ = subscriber.send(Err(SubscriptionError(reason.to_string())));
        }
    }
}

impl ChainContext for MockChain {
    fn header_by_number(&self, number: u64) -> Option<BlockHeader> {
        (number <= self.state.lock().height).then(|| BlockHeader {
            number,
            committee: self.committee.clone(),
        })
    }

    fn current_height(&self) -> u64 {
        self.state.lock().height
    }

    fn is_committed(&self, value: &Hash, height: u64) -> bool {
        self.state.lock().committed.contains(&(height, *value))
    }

    fn subscribe_chain_events(&self) -> Receiver<Result<ChainEvent, SubscriptionError>> {
        let (sender, receiver) = unbounded();
        self.state.lock().subscribers.push(sender);
        receiver
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

struct ContractState {
    can_slash: bool,
    accusation_status: AccusationStatus,
    max_chunk: usize,
    confirm_after: u32,
    polls: HashMap<Hash, u32>,
    submitted: Vec<ChunkedEvent>,
    watchers: Vec<Sender<NewAccusation>>,
}

impl Default for ContractState {
    fn default() -> Self {
        Self {
            can_slash: true,
            accusation_status: AccusationStatus {
                allowed: true,
                deadline: 0,
            },
            max_chunk: usize::MAX,
            confirm_after: 0,
            polls: HashMap::new(),
            submitted: Vec::new(),
            watchers: Vec::new(),
        }
    }
}

/// Records submitted chunks; answers queries from settable state.
#[derive(Default)]
pub struct MockContract {
    state: Mutex<ContractState>,
}

impl MockContract {
    pub fn set_can_slash(&self, can_slash: bool) {
        self.state.lock().can_slash = can_slash;
    }

    pub fn set_accusation_status(&self, status: AccusationStatus) {
        self.state.lock().accusation_status = status;
    }

    /// Largest chunk accepted by `estimate_event`.
    pub fn set_max_chunk(&self, max_chunk: usize) {
        self.state.lock().max_chunk = max_chunk;
    }

    /// Confirmation polls answered `false` before a transaction is mined.
    pub fn set_confirm_after(&self, polls: u32) {
        self.state.lock().confirm_after = polls;
    }

    pub fn submitted(&self) -> Vec<ChunkedEvent> {
        self.state.lock().submitted.clone()
    }

    /// File an accusation on-chain, notifying the watchers.
    pub fn accuse(&self, accusation: NewAccusation) {
        self.state
            .lock()
            .watchers
            .retain(|w| w.send(accusation.clone()).is_ok());
    }
}

impl AccountabilityContract for MockContract {
    fn can_slash(&self, _offender: &Pubkey, _rule: Rule, _block: u64) -> Result<bool, ContractError> {
        Ok(self.state.lock().can_slash)
    }

    fn can_accuse(
        &self,
        _offender: &Pubkey,
        _rule: Rule,
        _block: u64,
    ) -> Result<AccusationStatus, ContractError> {
        Ok(self.state.lock().accusation_status)
    }

    fn estimate_event(&self, event: &ChunkedEvent) -> Result<(), ContractError> {
        if event.raw_proof.len() > self.state.lock().max_chunk {
            Err(ContractError::Oversize)
        } else {
            Ok(())
        }
    }

    fn handle_event(&self, event: &ChunkedEvent) -> Result<Hash, ContractError> {
        let mut state = self.state.lock();
        state.submitted.push(event.clone());
        let nonce = state.submitted.len() as u64;
        Ok(solana_sha256_hasher::hashv(&[b"tx", &nonce.to_le_bytes()]))
    }

    fn tx_confirmed(&self, tx: &Hash) -> Result<bool, ContractError> {
        let mut state = self.state.lock();
        let confirm_after = state.confirm_after;
        let polls = state.polls.entry(*tx).or_insert(0);
        let confirmed = *polls >= confirm_after;
        *polls = polls.saturating_add(1);
        Ok(confirmed)
    }

    fn watch_new_accusation(&self, _offender: &Pubkey) -> Receiver<NewAccusation> {
        let (sender, receiver) = unbounded();
        self.state.lock().watchers.push(sender);
        receiver
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Records sent payloads.
pub struct MockNetwork {
    connected: Mutex<bool>,
    sent: Mutex<Vec<(Pubkey, Vec<u8>)>>,
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self {
            connected: Mutex::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl MockNetwork {
    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock() = connected;
    }

    pub fn sent(&self) -> Vec<(Pubkey, Vec<u8>)> {
        self.sent.lock().clone()
    }
}

impl PeerNetwork for MockNetwork {
    fn send(&self, peer: &Pubkey, payload: Vec<u8>) -> bool {
        if !*self.connected.lock() {
            return false;
        }
        self.sent.lock().push((*peer, payload));
        true
    }
}
