//! Off-chain accusation protocol.
//!
//! Before escalating an accusation on-chain, the accuser sends it straight
//! to the suspect, who answers with an innocence proof if it has one. The
//! accuser keeps the accusation in an [`AccusationLedger`] until it is
//! answered or its grace window runs out.
//!
//! ```text
//!   accuser                                   suspect
//!   -------                                   -------
//!   rule engine -> ledger.add ---- accusation ----> handle_payload
//!                                                   verify, build proof,
//!                                                   cache
//!   handle_payload <----------- innocence proof --- send
//!   ledger.remove
//!
//!   (no answer after delta + window blocks) -> escalate on-chain
//! ```

use {
    crate::{
        chain::{ChainContext, PeerNetwork},
        codec::{decode_proof, encode_proof},
        committee::Committee,
        config::AccountabilityConfig,
        crypto::SignatureVerifier,
        error::{AccountabilityError, Result},
        innocence::innocence_proof,
        msg_store::MsgStore,
        proof::{Proof, ProofType},
        rate_limiter::AccusationRateLimiter,
        verifier::{verify_accusation, verify_innocence, verify_proof_signatures},
    },
    log::*,
    lru::LruCache,
    parking_lot::{Mutex, RwLock},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    std::{num::NonZeroUsize, sync::Arc},
};

/// Accusations sent to suspects and not yet answered.
#[derive(Debug, Default)]
pub struct AccusationLedger {
    accusations: Vec<Proof>,
}

impl AccusationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, accusation: Proof) {
        self.accusations.push(accusation);
    }

    /// Drop the accusation answered by `innocence`. Returns whether one was
    /// found.
    pub fn remove(&mut self, innocence: &Proof) -> bool {
        let hash = innocence.message.hash();
        let position = self.accusations.iter().position(|a| {
            a.proof_type == ProofType::Accusation
                && a.rule == innocence.rule
                && a.message.hash() == hash
        });
        match position {
            Some(i) => {
                self.accusations.remove(i);
                true
            }
            None => false,
        }
    }

    /// Remove and return the accusations whose message is more than `expiry`
    /// blocks older than `current_height`.
    pub fn take_expired(&mut self, current_height: u64, expiry: u64) -> Vec<Proof> {
        let (expired, kept) = std::mem::take(&mut self.accusations)
            .into_iter()
            .partition(|a| current_height.saturating_sub(a.message.height()) > expiry);
        self.accusations = kept;
        expired
    }

    pub fn len(&self) -> usize {
        self.accusations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accusations.is_empty()
    }
}

/// Encoded innocence proofs keyed by the hash of the accusation payload
/// they answer.
pub struct InnocenceCache {
    proofs: LruCache<Hash, Vec<u8>>,
}

impl InnocenceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            proofs: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, accusation_hash: &Hash) -> Option<Vec<u8>> {
        self.proofs.get(accusation_hash).cloned()
    }

    pub fn put(&mut self, accusation_hash: Hash, raw_proof: Vec<u8>) {
        self.proofs.put(accusation_hash, raw_proof);
    }

    pub fn len(&self) -> usize {
        self.proofs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proofs.is_empty()
    }
}

/// Send `accusation` directly to its suspect. Returns whether it went out.
pub fn send_accusation(
    committee: &Committee,
    network: &dyn PeerNetwork,
    accusation: &Proof,
) -> bool {
    let Some(suspect) = committee.member(accusation.offender_index) else {
        return false;
    };
    let payload = match encode_proof(accusation) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("Accountability: cannot encode accusation: {err}");
            return false;
        }
    };
    if network.send(&suspect.address, payload) {
        info!(
            "Accountability: attempting direct resolution with suspect {} rule {}",
            suspect.address, accusation.rule
        );
        true
    } else {
        debug!("Accountability: no direct connection with suspect {}", suspect.address);
        false
    }
}

/// Handles accusations and innocence proofs received from peers.
///
/// Owned by the consensus-message loop. Errors returned by
/// [`OffchainHandler::handle_payload`] are meant for the p2p layer, which
/// penalises the sending peer.
pub struct OffchainHandler {
    address: Pubkey,
    chain: Arc<dyn ChainContext>,
    signatures: Arc<dyn SignatureVerifier>,
    network: Arc<dyn PeerNetwork>,
    store: Arc<RwLock<MsgStore>>,
    ledger: Arc<Mutex<AccusationLedger>>,
    rate_limiter: AccusationRateLimiter,
    cache: InnocenceCache,
    height_range: u64,
    max_round: i64,
}

impl OffchainHandler {
    pub fn new(
        address: Pubkey,
        chain: Arc<dyn ChainContext>,
        signatures: Arc<dyn SignatureVerifier>,
        network: Arc<dyn PeerNetwork>,
        store: Arc<RwLock<MsgStore>>,
        ledger: Arc<Mutex<AccusationLedger>>,
        config: &AccountabilityConfig,
    ) -> Self {
        Self {
            address,
            chain,
            signatures,
            network,
            store,
            ledger,
            rate_limiter: AccusationRateLimiter::new(config.max_accusations_per_height),
            cache: InnocenceCache::new(config.innocence_cache_size),
            height_range: config.height_range,
            max_round: config.max_round,
        }
    }

    pub fn rate_limiter_mut(&mut self) -> &mut AccusationRateLimiter {
        &mut self.rate_limiter
    }

    /// Process an accountability payload received from `sender`.
    pub fn handle_payload(&mut self, payload: &[u8], sender: &Pubkey) -> Result<()> {
        if let Err(err) = self.rate_limiter.check_rate(sender) {
            error!("Accountability: abuse detected from {sender}: {err}");
            return Err(err);
        }

        let payload_hash = solana_sha256_hasher::hash(payload);
        if let Err(err) = self.rate_limiter.check_duplicated(sender, payload_hash) {
            error!("Accountability: duplicated accusation from {sender}");
            return Err(err);
        }

        if let Some(cached) = self.cache.get(&payload_hash) {
            self.send_innocence_proof(sender, cached);
            return Ok(());
        }

        let proof = decode_proof(payload)?;
        let height = proof.message.height();
        let committee = self
            .chain
            .committee_at(height)
            .ok_or(AccountabilityError::NoParentHeader(height.saturating_sub(1)))?;
        if !committee.contains(sender) {
            return Err(AccountabilityError::AccusationFromNonValidator(*sender));
        }

        if let Err(err) = self.rate_limiter.check_height_rate(sender, height) {
            info!("Accountability: too many accusations from {sender} at height {height}");
            return Err(err);
        }
        verify_proof_signatures(&committee, self.signatures.as_ref(), &proof)?;

        match proof.proof_type {
            ProofType::Accusation => self.handle_accusation(proof, &committee, sender, payload_hash),
            ProofType::Innocence => self.handle_innocence(&proof, &committee, sender),
            ProofType::Misbehaviour => Err(AccountabilityError::WrongProofType),
        }
    }

    fn handle_accusation(
        &mut self,
        accusation: Proof,
        committee: &Committee,
        sender: &Pubkey,
        payload_hash: Hash,
    ) -> Result<()> {
        let targets_us = committee
            .member(accusation.offender_index)
            .is_some_and(|m| m.address == self.address);
        if !targets_us {
            return Err(AccountabilityError::InvalidAccusation);
        }

        // Too old for us to still hold the messages an answer needs.
        let height = accusation.message.height();
        let current = self.chain.current_height();
        if current > height && current.saturating_sub(height) >= self.height_range {
            debug!("Accountability: ignoring expired accusation at height {height}");
            return Ok(());
        }

        if !verify_accusation(
            self.chain.as_ref(),
            self.signatures.as_ref(),
            self.max_round,
            &accusation,
        ) {
            return Err(AccountabilityError::InvalidAccusation);
        }

        let proof = {
            let store = self.store.read();
            innocence_proof(&store, committee, &accusation)
        };
        let proof = match proof {
            Ok(proof) => proof,
            Err(err) => {
                warn!("Accountability: cannot collect innocence evidence for {}: {err}", accusation.rule);
                return Ok(());
            }
        };
        let raw_proof = match encode_proof(&proof) {
            Ok(raw_proof) => raw_proof,
            Err(err) => {
                error!("Accountability: cannot encode innocence proof: {err}");
                return Ok(());
            }
        };

        self.cache.put(payload_hash, raw_proof.clone());
        self.send_innocence_proof(sender, raw_proof);
        Ok(())
    }

    fn handle_innocence(&self, proof: &Proof, committee: &Committee, sender: &Pubkey) -> Result<()> {
        let from_accused = committee
            .member(proof.offender_index)
            .is_some_and(|m| m.address == *sender);
        if !from_accused {
            return Err(AccountabilityError::InvalidInnocenceProof);
        }
        if !verify_innocence(
            self.chain.as_ref(),
            self.signatures.as_ref(),
            self.max_round,
            proof,
        ) {
            return Err(AccountabilityError::InvalidInnocenceProof);
        }
        if self.ledger.lock().remove(proof) {
            info!("Accountability: accusation {} withdrawn, {sender} proved innocence", proof.rule);
        }
        Ok(())
    }

    fn send_innocence_proof(&self, receiver: &Pubkey, raw_proof: Vec<u8>) {
        if self.network.send(receiver, raw_proof) {
            info!("Accountability: sent innocence proof to {receiver}");
        } else {
            debug!("Accountability: no direct connection with {receiver} for innocence proof");
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            proof::Rule,
            test_utils::{random_pubkey, MockChain, MockNetwork, TestCommittee},
        },
    };

    struct Fixture {
        tc: TestCommittee,
        network: Arc<MockNetwork>,
        store: Arc<RwLock<MsgStore>>,
        ledger: Arc<Mutex<AccusationLedger>>,
        handler: OffchainHandler,
    }

    /// Handler running as committee member `me`.
    fn fixture(me: usize) -> Fixture {
        let tc = TestCommittee::new(4);
        let chain = Arc::new(MockChain::new(tc.committee.clone(), 20));
        let network = Arc::new(MockNetwork::default());
        let store = Arc::new(RwLock::new(MsgStore::new()));
        let ledger = Arc::new(Mutex::new(AccusationLedger::new()));
        let address = tc.committee.member(me).unwrap().address;
        let handler = OffchainHandler::new(
            address,
            chain,
            Arc::new(tc.verifier()),
            network.clone(),
            store.clone(),
            ledger.clone(),
            &AccountabilityConfig::dev_default(),
        );
        Fixture {
            tc,
            network,
            store,
            ledger,
            handler,
        }
    }

    fn address(tc: &TestCommittee, index: usize) -> Pubkey {
        tc.committee.member(index).unwrap().address
    }

    #[test]
    fn test_ledger_expiry_and_removal() {
        let tc = TestCommittee::new(4);
        let mut ledger = AccusationLedger::new();
        let old = Proof::accusation(Rule::C1, tc.precommit(10, 0, tc.value(1), 1), vec![], 1);
        let recent = Proof::accusation(Rule::C1, tc.precommit(15, 0, tc.value(1), 2), vec![], 2);
        ledger.add(old.clone());
        ledger.add(recent.clone());

        assert!(ledger.take_expired(30, 20).is_empty());
        let expired = ledger.take_expired(31, 20);
        assert_eq!(expired, vec![old]);
        assert_eq!(ledger.len(), 1);

        let answer = Proof::innocence(Rule::C1, recent.message.clone(), vec![], 2);
        let wrong_rule = Proof::innocence(Rule::PO, recent.message.clone(), vec![], 2);
        assert!(!ledger.remove(&wrong_rule));
        assert!(ledger.remove(&answer));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_innocence_cache_bounded() {
        let mut cache = InnocenceCache::new(2);
        for i in 0..3u8 {
            cache.put(solana_sha256_hasher::hash(&[i]), vec![i]);
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&solana_sha256_hasher::hash(&[0])), None);
        assert_eq!(cache.get(&solana_sha256_hasher::hash(&[2])), Some(vec![2]));
    }

    #[test]
    fn test_accusation_answered_and_cached() {
        let mut f = fixture(1);
        let v = f.tc.value(1);
        {
            let mut store = f.store.write();
            for i in 0..3 {
                store.save(f.tc.prevote(5, 0, v, i));
            }
        }
        let accusation = Proof::accusation(Rule::C1, f.tc.precommit(5, 0, v, 1), vec![], 1);
        let payload = encode_proof(&accusation).unwrap();
        let accuser = address(&f.tc, 2);

        f.handler.handle_payload(&payload, &accuser).unwrap();
        let sent = f.network.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, accuser);
        let answer = decode_proof(&sent[0].1).unwrap();
        assert_eq!(answer.proof_type, ProofType::Innocence);
        assert_eq!(answer.rule, Rule::C1);

        // Another accuser gets the cached answer.
        let other = address(&f.tc, 3);
        f.handler.handle_payload(&payload, &other).unwrap();
        let sent = f.network.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].1, sent[0].1);

        // The same accuser again is abuse.
        assert!(matches!(
            f.handler.handle_payload(&payload, &accuser),
            Err(AccountabilityError::PeerDuplicatedAccusation)
        ));
    }

    #[test]
    fn test_accusation_against_someone_else_rejected() {
        let mut f = fixture(1);
        let accusation = Proof::accusation(Rule::C1, f.tc.precommit(5, 0, f.tc.value(1), 2), vec![], 2);
        let payload = encode_proof(&accusation).unwrap();
        assert!(matches!(
            f.handler.handle_payload(&payload, &address(&f.tc, 3)),
            Err(AccountabilityError::InvalidAccusation)
        ));
    }

    #[test]
    fn test_accusation_from_non_validator() {
        let mut f = fixture(1);
        let accusation = Proof::accusation(Rule::C1, f.tc.precommit(5, 0, f.tc.value(1), 1), vec![], 1);
        let payload = encode_proof(&accusation).unwrap();
        let stranger = random_pubkey();
        assert!(matches!(
            f.handler.handle_payload(&payload, &stranger),
            Err(AccountabilityError::AccusationFromNonValidator(p)) if p == stranger
        ));
    }

    #[test]
    fn test_missing_parent_header() {
        let mut f = fixture(1);
        let accusation = Proof::accusation(Rule::C1, f.tc.precommit(50, 0, f.tc.value(1), 1), vec![], 1);
        let payload = encode_proof(&accusation).unwrap();
        assert!(matches!(
            f.handler.handle_payload(&payload, &address(&f.tc, 2)),
            Err(AccountabilityError::NoParentHeader(49))
        ));
    }

    #[test]
    fn test_no_evidence_is_not_an_error() {
        let mut f = fixture(1);
        let accusation = Proof::accusation(Rule::C1, f.tc.precommit(5, 0, f.tc.value(1), 1), vec![], 1);
        let payload = encode_proof(&accusation).unwrap();
        f.handler.handle_payload(&payload, &address(&f.tc, 2)).unwrap();
        assert!(f.network.sent().is_empty());
    }

    #[test]
    fn test_innocence_withdraws_accusation() {
        let mut f = fixture(2);
        let v = f.tc.value(1);
        let precommit = f.tc.precommit(5, 0, v, 1);
        f.ledger
            .lock()
            .add(Proof::accusation(Rule::C1, precommit.clone(), vec![], 1));
        let quorum = (0..3).map(|i| f.tc.prevote(5, 0, v, i)).collect();
        let innocence = Proof::innocence(Rule::C1, precommit, quorum, 1);
        let payload = encode_proof(&innocence).unwrap();

        // Only the accused may answer.
        assert!(matches!(
            f.handler.handle_payload(&payload, &address(&f.tc, 3)),
            Err(AccountabilityError::InvalidInnocenceProof)
        ));
        assert_eq!(f.ledger.lock().len(), 1);

        f.handler.handle_payload(&payload, &address(&f.tc, 1)).unwrap();
        assert!(f.ledger.lock().is_empty());
    }

    #[test]
    fn test_invalid_innocence_rejected() {
        let mut f = fixture(2);
        let v = f.tc.value(1);
        let precommit = f.tc.precommit(5, 0, v, 1);
        let short = (0..2).map(|i| f.tc.prevote(5, 0, v, i)).collect();
        let innocence = Proof::innocence(Rule::C1, precommit, short, 1);
        let payload = encode_proof(&innocence).unwrap();
        assert!(matches!(
            f.handler.handle_payload(&payload, &address(&f.tc, 1)),
            Err(AccountabilityError::InvalidInnocenceProof)
        ));
    }

    #[test]
    fn test_misbehaviour_payload_rejected() {
        let mut f = fixture(2);
        let proof = Proof::misbehaviour(
            Rule::Equivocation,
            f.tc.prevote(5, 0, f.tc.value(1), 1),
            vec![f.tc.prevote(5, 0, f.tc.value(2), 1)],
            1,
        );
        let payload = encode_proof(&proof).unwrap();
        assert!(matches!(
            f.handler.handle_payload(&payload, &address(&f.tc, 1)),
            Err(AccountabilityError::WrongProofType)
        ));
    }

    #[test]
    fn test_garbage_payload() {
        let mut f = fixture(2);
        assert!(matches!(
            f.handler.handle_payload(&[1, 2, 3], &address(&f.tc, 1)),
            Err(AccountabilityError::Codec(_))
        ));
    }

    #[test]
    fn test_send_accusation_targets_suspect() {
        let tc = TestCommittee::new(4);
        let network = MockNetwork::default();
        let accusation = Proof::accusation(Rule::C1, tc.precommit(5, 0, tc.value(1), 3), vec![], 3);
        assert!(send_accusation(&tc.committee, &network, &accusation));
        let sent = network.sent();
        assert_eq!(sent[0].0, address(&tc, 3));
        assert_eq!(decode_proof(&sent[0].1).unwrap(), accusation);

        network.set_connected(false);
        assert!(!send_accusation(&tc.committee, &network, &accusation));
    }
}
