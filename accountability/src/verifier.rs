//! Stateless proof verification.
//!
//! The three verifiers decide whether an accusation, misbehaviour or
//! innocence proof is well-founded using only the proof and the chain's
//! committee snapshots. They also back the native contracts the execution
//! layer calls to validate proofs on-chain, so they never panic and never
//! depend on local message state.
//!
//! Native contract output on success (160 bytes):
//!
//! ```text
//!  [  0.. 32]  success flag (1), left padded
//!  [ 32.. 64]  offender address
//!  [ 64.. 96]  rule id, left padded
//!  [ 96..128]  height of the offending message, big endian, left padded
//!  [128..160]  hash of the offending message
//! ```
//!
//! Any failure returns 128 zero bytes.

use {
    crate::{
        chain::ChainContext,
        codec::decode_proof,
        committee::{has_equivocated_votes, Committee},
        config::AccountabilityConfig,
        crypto::SignatureVerifier,
        error::AccountabilityError,
        message::{ConsensusMessage, MessageCode, NEW_PROPOSAL_ROUND},
        proof::{Proof, Rule},
        rules::{is_contiguous, last_round_where},
    },
    log::*,
    solana_hash::Hash,
    std::sync::Arc,
};

/// Length of the ABI length word prefixed to native-contract input.
const ABI_LENGTH_WORD: usize = 32;
const KB: usize = 1024;

pub const CHECK_ACCUSATION_ADDRESS: u8 = 0xfc;
pub const CHECK_INNOCENCE_ADDRESS: u8 = 0xfd;
pub const CHECK_MISBEHAVIOUR_ADDRESS: u8 = 0xfe;

/// Success output length.
pub const SUCCESS_RESULT_LEN: usize = 160;
/// Failure output length.
pub const FAILURE_RESULT_LEN: usize = 128;

/// Parameters shared by the verifiers.
#[derive(Debug, Clone, Copy)]
pub struct VerifierParams {
    pub height_range: u64,
    pub max_round: i64,
    pub gas_per_kb: u64,
}

impl From<&AccountabilityConfig> for VerifierParams {
    fn from(config: &AccountabilityConfig) -> Self {
        Self {
            height_range: config.height_range,
            max_round: config.max_round,
            gas_per_kb: config.gas_per_kb,
        }
    }
}

/// Maximum number of evidence messages accepted in a proof.
pub fn max_evidence_messages(committee: &Committee, max_round: i64) -> usize {
    let max_round = usize::try_from(max_round).unwrap_or(0);
    committee.len().max(max_round).saturating_add(1)
}

/// Checks shared by every proof type. Returns the committee that validated
/// the message.
fn check_proof_envelope(
    chain: &dyn ChainContext,
    signatures: &dyn SignatureVerifier,
    max_round: i64,
    proof: &Proof,
) -> Option<Arc<Committee>> {
    let height = proof.message.height();
    let committee = chain.committee_at(height)?;
    proof.message.validate(&committee, signatures).ok()?;
    if proof.evidences.len() > max_evidence_messages(&committee, max_round) {
        return None;
    }
    for evidence in &proof.evidences {
        if evidence.height() != height || evidence.validate(&committee, signatures).is_err() {
            return None;
        }
    }
    if proof.offender_index >= committee.len() || !proof.message.is_signed_by(proof.offender_index) {
        return None;
    }
    Some(committee)
}

/// Validate the message and every evidence of `proof` against `committee`
/// and check the offender index. Unlike the verifiers this reports why a
/// proof was rejected.
pub fn verify_proof_signatures(
    committee: &Committee,
    signatures: &dyn SignatureVerifier,
    proof: &Proof,
) -> Result<(), AccountabilityError> {
    proof.message.validate(committee, signatures)?;
    for evidence in &proof.evidences {
        evidence.validate(committee, signatures)?;
    }
    if proof.offender_index >= committee.len() {
        return Err(AccountabilityError::InvalidOffenderIndex(
            proof.offender_index as u64,
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Accusations
// ---------------------------------------------------------------------------

/// Whether `proof` is a well-formed accusation of a member of the committee.
pub fn verify_accusation(
    chain: &dyn ChainContext,
    signatures: &dyn SignatureVerifier,
    max_round: i64,
    proof: &Proof,
) -> bool {
    let msg = &proof.message;
    let shape_ok = match proof.rule {
        Rule::PO => {
            msg.code() == MessageCode::LightProposal
                && msg.valid_round() != Some(NEW_PROPOSAL_ROUND)
        }
        Rule::PVN | Rule::PVO => msg.code() == MessageCode::Prevote,
        Rule::C1 => msg.code() == MessageCode::Precommit,
        _ => false,
    };
    if !shape_ok || check_proof_envelope(chain, signatures, max_round, proof).is_none() {
        return false;
    }
    if proof.rule == Rule::PVO {
        let [old_proposal] = proof.evidences.as_slice() else {
            return false;
        };
        return old_proposal.code() == MessageCode::LightProposal
            && old_proposal.round() == msg.round()
            && old_proposal.value() == msg.value()
            && old_proposal.valid_round() != Some(NEW_PROPOSAL_ROUND);
    }
    true
}

// ---------------------------------------------------------------------------
// Misbehaviours
// ---------------------------------------------------------------------------

/// Whether `proof` proves a protocol violation by its offender.
pub fn verify_misbehaviour(
    chain: &dyn ChainContext,
    signatures: &dyn SignatureVerifier,
    max_round: i64,
    proof: &Proof,
) -> bool {
    let Some(committee) = check_proof_envelope(chain, signatures, max_round, proof) else {
        return false;
    };
    match proof.rule {
        Rule::PN => valid_pn(proof),
        Rule::PO => valid_po(proof, &committee),
        Rule::PVN => valid_pvn(proof),
        Rule::PVO => valid_pvo(proof, &committee),
        Rule::PVO12 => valid_pvo12(proof),
        Rule::PVO3 => valid_pvo3(proof),
        Rule::C => valid_c(proof, &committee),
        Rule::InvalidRound => proof.message.round() > max_round,
        Rule::WrongValidRound => match &proof.message {
            ConsensusMessage::LightProposal(p) => p.valid_round >= p.round,
            _ => false,
        },
        Rule::InvalidProposer => {
            proof.message.code() == MessageCode::LightProposal
                && committee
                    .member(proof.offender_index)
                    .map(|m| {
                        chain.proposer(proof.message.height(), proof.message.round())
                            != Some(m.address)
                    })
                    .unwrap_or(false)
        }
        Rule::Equivocation => valid_equivocation(proof),
        Rule::C1 | Rule::InvalidProposal => false,
    }
}

fn is_old_light_proposal(msg: &ConsensusMessage) -> bool {
    msg.code() == MessageCode::LightProposal
        && msg.valid_round().is_some_and(|vr| vr != NEW_PROPOSAL_ROUND)
}

/// Light old proposal matching a non-nil prevote.
fn matches_prevote(proposal: &ConsensusMessage, prevote: &ConsensusMessage) -> bool {
    is_old_light_proposal(proposal)
        && proposal.height() == prevote.height()
        && proposal.round() == prevote.round()
        && proposal.value() == prevote.value()
}

fn is_non_nil_prevote(msg: &ConsensusMessage) -> bool {
    msg.code() == MessageCode::Prevote && !msg.is_nil()
}

fn valid_pn(proof: &Proof) -> bool {
    let proposal = &proof.message;
    if proposal.code() != MessageCode::LightProposal
        || proposal.valid_round() != Some(NEW_PROPOSAL_ROUND)
    {
        return false;
    }
    let [precommit] = proof.evidences.as_slice() else {
        return false;
    };
    precommit.code() == MessageCode::Precommit
        && precommit.is_signed_by(proof.offender_index)
        && precommit.round() < proposal.round()
        && !precommit.is_nil()
}

fn valid_po(proof: &Proof, committee: &Committee) -> bool {
    let proposal = &proof.message;
    if !is_old_light_proposal(proposal) {
        return false;
    }
    let Some(valid_round) = proposal.valid_round() else {
        return false;
    };
    if valid_round >= proposal.round() {
        return true;
    }
    let Some(first) = proof.evidences.first() else {
        return false;
    };
    if first.code() == MessageCode::Precommit
        && first.is_signed_by(proof.offender_index)
        && !first.is_nil()
    {
        if first.round() == valid_round && first.value() != proposal.value() {
            return true;
        }
        if first.round() > valid_round && first.round() < proposal.round() {
            return true;
        }
    }
    if first.code() == MessageCode::Prevote {
        return is_quorum_against(&proof.evidences, committee, valid_round, &proposal.value());
    }
    false
}

fn valid_pvn(proof: &Proof) -> bool {
    let prevote = &proof.message;
    if !is_non_nil_prevote(prevote) {
        return false;
    }
    let Some((proposal, precommits)) = proof.evidences.split_first() else {
        return false;
    };
    if proposal.code() != MessageCode::LightProposal
        || proposal.height() != prevote.height()
        || proposal.round() != prevote.round()
        || proposal.value() != prevote.value()
        || proposal.valid_round() != Some(NEW_PROPOSAL_ROUND)
    {
        return false;
    }
    let Some(last) = precommits.last() else {
        return false;
    };
    for (i, pc) in precommits.iter().enumerate() {
        if pc.code() != MessageCode::Precommit
            || !pc.is_signed_by(proof.offender_index)
            || pc.round() >= prevote.round()
        {
            return false;
        }
        if i == 0 {
            if pc.is_nil() || pc.value() == prevote.value() {
                return false;
            }
        } else if !pc.is_nil() {
            return false;
        }
    }
    let gapless = precommits
        .windows(2)
        .all(|w| w[1].round().saturating_sub(w[0].round()) == 1);
    gapless && last.round().saturating_add(1) == prevote.round()
}

fn valid_pvo(proof: &Proof, committee: &Committee) -> bool {
    let prevote = &proof.message;
    if !is_non_nil_prevote(prevote) || proof.evidences.len() < 2 {
        return false;
    }
    let Some((proposal, prevotes)) = proof.evidences.split_first() else {
        return false;
    };
    if !matches_prevote(proposal, prevote) {
        return false;
    }
    let Some(valid_round) = proposal.valid_round() else {
        return false;
    };
    let Some(voted) = prevotes.first().map(|m| m.value()) else {
        return false;
    };
    let consistent = prevotes.iter().all(|m| {
        m.code() == MessageCode::Prevote
            && m.round() == valid_round
            && !m.is_nil()
            && m.value() != proposal.value()
            && m.value() == voted
    });
    consistent
        && !has_equivocated_votes(prevotes)
        && committee.over_quorum_votes(prevotes).is_some()
}

fn valid_pvo12(proof: &Proof) -> bool {
    let prevote = &proof.message;
    if !is_non_nil_prevote(prevote) || proof.evidences.len() < 2 {
        return false;
    }
    let Some((proposal, precommits)) = proof.evidences.split_first() else {
        return false;
    };
    if !matches_prevote(proposal, prevote) {
        return false;
    }
    let Some(valid_round) = proposal.valid_round() else {
        return false;
    };
    let round = proposal.round();
    let in_range = precommits.iter().all(|pc| {
        pc.code() == MessageCode::Precommit
            && pc.round() > valid_round
            && pc.round() < round
            && pc.is_signed_by(proof.offender_index)
            && pc.height() == prevote.height()
    });
    if !in_range {
        return false;
    }
    let mut sorted = precommits.to_vec();
    sorted.sort_by_key(|m| m.round());
    if !is_contiguous(&sorted, valid_round, round) {
        return false;
    }
    let value = prevote.value();
    let last_for_v = last_round_where(&sorted, |m| m.value() == value);
    let last_for_other = last_round_where(&sorted, |m| m.value() != value && !m.is_nil());
    last_for_other > last_for_v
}

fn valid_pvo3(proof: &Proof) -> bool {
    let prevote = &proof.message;
    if !is_non_nil_prevote(prevote) {
        return false;
    }
    let [proposal] = proof.evidences.as_slice() else {
        return false;
    };
    proposal.code() == MessageCode::LightProposal
        && proposal.height() == prevote.height()
        && proposal.round() == prevote.round()
        && proposal.value() == prevote.value()
        && proposal
            .valid_round()
            .is_some_and(|vr| vr >= proposal.round())
}

fn valid_c(proof: &Proof, committee: &Committee) -> bool {
    let precommit = &proof.message;
    if precommit.code() != MessageCode::Precommit || precommit.is_nil() || proof.evidences.is_empty()
    {
        return false;
    }
    is_quorum_against(&proof.evidences, committee, precommit.round(), &precommit.value())
}

/// `votes` are disjoint prevotes at `round` reaching quorum for one single
/// value other than `value`. Nil counts as a value.
fn is_quorum_against(
    votes: &[ConsensusMessage],
    committee: &Committee,
    round: i64,
    value: &Hash,
) -> bool {
    let Some(voted) = votes.first().map(|m| m.value()) else {
        return false;
    };
    voted != *value && quorum_for_value(votes, committee, round, &voted)
}

fn valid_equivocation(proof: &Proof) -> bool {
    let msg = &proof.message;
    let Some(other) = proof.evidences.first() else {
        return false;
    };
    if !other.code().same_family(msg.code())
        || other.height() != msg.height()
        || other.round() != msg.round()
        || !other.is_signed_by(proof.offender_index)
    {
        return false;
    }
    other.value() != msg.value() || other.valid_round() != msg.valid_round()
}

// ---------------------------------------------------------------------------
// Innocence
// ---------------------------------------------------------------------------

/// Whether `proof` answers the accusation it names.
pub fn verify_innocence(
    chain: &dyn ChainContext,
    signatures: &dyn SignatureVerifier,
    max_round: i64,
    proof: &Proof,
) -> bool {
    let Some(committee) = check_proof_envelope(chain, signatures, max_round, proof) else {
        return false;
    };
    match proof.rule {
        Rule::PO => innocent_of_po(proof, &committee),
        Rule::PVN => innocent_of_pvn(proof),
        Rule::PVO => innocent_of_pvo(proof, &committee),
        Rule::C1 => innocent_of_c1(proof, &committee),
        _ => false,
    }
}

fn quorum_for_value(
    votes: &[ConsensusMessage],
    committee: &Committee,
    round: i64,
    value: &Hash,
) -> bool {
    let consistent = votes.iter().all(|m| {
        m.code() == MessageCode::Prevote && m.value() == *value && m.round() == round
    });
    consistent && !has_equivocated_votes(votes) && committee.over_quorum_votes(votes).is_some()
}

fn innocent_of_po(proof: &Proof, committee: &Committee) -> bool {
    let proposal = &proof.message;
    if !is_old_light_proposal(proposal) {
        return false;
    }
    let Some(valid_round) = proposal.valid_round() else {
        return false;
    };
    quorum_for_value(&proof.evidences, committee, valid_round, &proposal.value())
}

fn innocent_of_pvn(proof: &Proof) -> bool {
    let prevote = &proof.message;
    if !is_non_nil_prevote(prevote) {
        return false;
    }
    let [proposal] = proof.evidences.as_slice() else {
        return false;
    };
    proposal.code() == MessageCode::LightProposal
        && proposal.height() == prevote.height()
        && proposal.round() == prevote.round()
        && proposal.valid_round() == Some(NEW_PROPOSAL_ROUND)
        && proposal.value() == prevote.value()
}

fn innocent_of_pvo(proof: &Proof, committee: &Committee) -> bool {
    let prevote = &proof.message;
    if !is_non_nil_prevote(prevote) || proof.evidences.len() < 2 {
        return false;
    }
    let Some((proposal, prevotes)) = proof.evidences.split_first() else {
        return false;
    };
    if !matches_prevote(proposal, prevote) {
        return false;
    }
    let Some(valid_round) = proposal.valid_round() else {
        return false;
    };
    quorum_for_value(prevotes, committee, valid_round, &proposal.value())
}

fn innocent_of_c1(proof: &Proof, committee: &Committee) -> bool {
    let precommit = &proof.message;
    if precommit.code() != MessageCode::Precommit || precommit.is_nil() {
        return false;
    }
    quorum_for_value(&proof.evidences, committee, precommit.round(), &precommit.value())
}

// ---------------------------------------------------------------------------
// Native contracts
// ---------------------------------------------------------------------------

/// A deterministic function callable by the execution layer.
pub trait NativeContract: Send + Sync {
    fn required_gas(&self, input: &[u8]) -> u64;

    /// Never fails: invalid input yields the failure output.
    fn run(&self, input: &[u8], block_number: u64) -> Vec<u8>;
}

fn required_gas(input: &[u8], gas_per_kb: u64) -> u64 {
    let kbs = u64::try_from(input.len().div_ceil(KB)).unwrap_or(u64::MAX);
    kbs.saturating_mul(gas_per_kb)
}

fn failure_result() -> Vec<u8> {
    vec![0u8; FAILURE_RESULT_LEN]
}

fn left_pad_32(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let len = bytes.len().min(32);
    let start = 32usize.saturating_sub(len);
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(len)..]);
    out
}

/// Success output for a verified proof.
pub fn valid_return(proof: &Proof, committee: &Committee) -> Vec<u8> {
    let Some(offender) = committee.member(proof.offender_index) else {
        return failure_result();
    };
    let mut out = Vec::with_capacity(SUCCESS_RESULT_LEN);
    out.extend_from_slice(&left_pad_32(&[1]));
    out.extend_from_slice(offender.address.as_ref());
    out.extend_from_slice(&left_pad_32(&[proof.rule.id()]));
    out.extend_from_slice(&left_pad_32(&proof.message.height().to_be_bytes()));
    out.extend_from_slice(proof.message.hash().as_ref());
    out
}

/// Decode the proof after the ABI length word.
fn decode_input(input: &[u8]) -> Option<Proof> {
    if input.len() <= ABI_LENGTH_WORD {
        return None;
    }
    match decode_proof(&input[ABI_LENGTH_WORD..]) {
        Ok(proof) => Some(proof),
        Err(err) => {
            debug!("native contract: cannot decode proof: {err}");
            None
        }
    }
}

struct VerifierContext {
    chain: Arc<dyn ChainContext>,
    signatures: Arc<dyn SignatureVerifier>,
    params: VerifierParams,
}

impl VerifierContext {
    fn output(&self, proof: &Proof, verified: bool) -> Vec<u8> {
        if !verified {
            return failure_result();
        }
        match self.chain.committee_at(proof.message.height()) {
            Some(committee) => valid_return(proof, &committee),
            None => failure_result(),
        }
    }
}

/// Validates accusations submitted on-chain.
pub struct AccusationVerifier(VerifierContext);

impl NativeContract for AccusationVerifier {
    fn required_gas(&self, input: &[u8]) -> u64 {
        required_gas(input, self.0.params.gas_per_kb)
    }

    fn run(&self, input: &[u8], block_number: u64) -> Vec<u8> {
        let Some(proof) = decode_input(input) else {
            return failure_result();
        };
        let height = proof.message.height();
        if height == 0 {
            return failure_result();
        }
        // The accused only keeps `height_range` heights of messages and
        // could no longer answer an older accusation.
        if block_number > height && block_number.saturating_sub(height) >= self.0.params.height_range {
            return failure_result();
        }
        let ctx = &self.0;
        let verified = verify_accusation(
            ctx.chain.as_ref(),
            ctx.signatures.as_ref(),
            ctx.params.max_round,
            &proof,
        );
        ctx.output(&proof, verified)
    }
}

/// Validates misbehaviour proofs submitted on-chain.
pub struct MisbehaviourVerifier(VerifierContext);

impl NativeContract for MisbehaviourVerifier {
    fn required_gas(&self, input: &[u8]) -> u64 {
        required_gas(input, self.0.params.gas_per_kb)
    }

    fn run(&self, input: &[u8], _block_number: u64) -> Vec<u8> {
        let Some(proof) = decode_input(input) else {
            return failure_result();
        };
        if proof.message.height() == 0 {
            return failure_result();
        }
        let ctx = &self.0;
        let verified = verify_misbehaviour(
            ctx.chain.as_ref(),
            ctx.signatures.as_ref(),
            ctx.params.max_round,
            &proof,
        );
        ctx.output(&proof, verified)
    }
}

/// Validates innocence proofs submitted on-chain.
pub struct InnocenceVerifier(VerifierContext);

impl NativeContract for InnocenceVerifier {
    fn required_gas(&self, input: &[u8]) -> u64 {
        required_gas(input, self.0.params.gas_per_kb)
    }

    fn run(&self, input: &[u8], block_number: u64) -> Vec<u8> {
        if block_number == 0 {
            return failure_result();
        }
        let Some(proof) = decode_input(input) else {
            return failure_result();
        };
        let ctx = &self.0;
        let verified = verify_innocence(
            ctx.chain.as_ref(),
            ctx.signatures.as_ref(),
            ctx.params.max_round,
            &proof,
        );
        ctx.output(&proof, verified)
    }
}

/// The three verification contracts, handed to the execution layer.
pub struct AccountabilityPrecompiles {
    pub accusation: AccusationVerifier,
    pub innocence: InnocenceVerifier,
    pub misbehaviour: MisbehaviourVerifier,
}

impl AccountabilityPrecompiles {
    pub fn new(
        chain: Arc<dyn ChainContext>,
        signatures: Arc<dyn SignatureVerifier>,
        params: VerifierParams,
    ) -> Self {
        let ctx = || VerifierContext {
            chain: chain.clone(),
            signatures: signatures.clone(),
            params,
        };
        Self {
            accusation: AccusationVerifier(ctx()),
            innocence: InnocenceVerifier(ctx()),
            misbehaviour: MisbehaviourVerifier(ctx()),
        }
    }

    /// Contract registered at `address`.
    pub fn by_address(&self, address: u8) -> Option<&dyn NativeContract> {
        match address {
            CHECK_ACCUSATION_ADDRESS => Some(&self.accusation),
            CHECK_INNOCENCE_ADDRESS => Some(&self.innocence),
            CHECK_MISBEHAVIOUR_ADDRESS => Some(&self.misbehaviour),
            _ => None,
        }
    }

    pub fn addresses() -> [u8; 3] {
        [
            CHECK_ACCUSATION_ADDRESS,
            CHECK_INNOCENCE_ADDRESS,
            CHECK_MISBEHAVIOUR_ADDRESS,
        ]
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            codec::encode_proof,
            message::NIL_VALUE,
            proof::ProofType,
            test_utils::{MockChain, TestCommittee},
        },
    };

    const MAX_ROUND: i64 = crate::config::MAX_ROUND;

    fn setup() -> (TestCommittee, MockChain) {
        let tc = TestCommittee::new(4);
        let chain = MockChain::new(tc.committee.clone(), 20);
        (tc, chain)
    }

    fn input_of(proof: &Proof) -> Vec<u8> {
        let mut input = vec![0u8; 32];
        input.extend(encode_proof(proof).unwrap());
        input
    }

    #[test]
    fn test_accusation_shapes() {
        let (tc, chain) = setup();
        let v = tc.value(1);
        let sig = tc.verifier();
        let c1 = Proof::accusation(Rule::C1, tc.precommit(5, 0, v, 1), vec![], 1);
        assert!(verify_accusation(&chain, &sig, MAX_ROUND, &c1));

        let wrong_kind = Proof::accusation(Rule::C1, tc.prevote(5, 0, v, 1), vec![], 1);
        assert!(!verify_accusation(&chain, &sig, MAX_ROUND, &wrong_kind));

        let wrong_offender = Proof::accusation(Rule::C1, tc.precommit(5, 0, v, 1), vec![], 2);
        assert!(!verify_accusation(&chain, &sig, MAX_ROUND, &wrong_offender));

        let out_of_range = Proof::accusation(Rule::C1, tc.precommit(5, 0, v, 1), vec![], 9);
        assert!(!verify_accusation(&chain, &sig, MAX_ROUND, &out_of_range));

        let not_accusable = Proof::accusation(Rule::C, tc.precommit(5, 0, v, 1), vec![], 1);
        assert!(!verify_accusation(&chain, &sig, MAX_ROUND, &not_accusable));
    }

    #[test]
    fn test_pvo_accusation_needs_matching_old_proposal() {
        let (tc, chain) = setup();
        let sig = tc.verifier();
        let old = tc.proposal(5, 2, 0, 1, b"block").to_light();
        let prevote = tc.prevote(5, 2, old.value(), 3);
        let ok = Proof::accusation(Rule::PVO, prevote.clone(), vec![old], 3);
        assert!(verify_accusation(&chain, &sig, MAX_ROUND, &ok));

        let new = tc.proposal(5, 2, -1, 1, b"block").to_light();
        let bad = Proof::accusation(Rule::PVO, prevote.clone(), vec![new], 3);
        assert!(!verify_accusation(&chain, &sig, MAX_ROUND, &bad));

        let missing = Proof::accusation(Rule::PVO, prevote, vec![], 3);
        assert!(!verify_accusation(&chain, &sig, MAX_ROUND, &missing));
    }

    #[test]
    fn test_evidence_height_must_match() {
        let (tc, chain) = setup();
        let sig = tc.verifier();
        let proof = Proof::misbehaviour(
            Rule::PN,
            tc.proposal(5, 2, -1, 1, b"b").to_light(),
            vec![tc.precommit(4, 0, tc.value(3), 1)],
            1,
        );
        assert!(!verify_misbehaviour(&chain, &sig, MAX_ROUND, &proof));
    }

    #[test]
    fn test_pn_misbehaviour() {
        let (tc, chain) = setup();
        let sig = tc.verifier();
        let light = tc.proposal(5, 2, -1, 1, b"b").to_light();
        let ok = Proof::misbehaviour(Rule::PN, light.clone(), vec![tc.precommit(5, 0, tc.value(3), 1)], 1);
        assert!(verify_misbehaviour(&chain, &sig, MAX_ROUND, &ok));

        let nil = Proof::misbehaviour(Rule::PN, light.clone(), vec![tc.precommit(5, 0, NIL_VALUE, 1)], 1);
        assert!(!verify_misbehaviour(&chain, &sig, MAX_ROUND, &nil));

        let other_signer =
            Proof::misbehaviour(Rule::PN, light, vec![tc.precommit(5, 0, tc.value(3), 2)], 1);
        assert!(!verify_misbehaviour(&chain, &sig, MAX_ROUND, &other_signer));
    }

    #[test]
    fn test_c_misbehaviour_requires_disjoint_quorum() {
        let (tc, chain) = setup();
        let sig = tc.verifier();
        let other = tc.value(9);
        let precommit = tc.precommit(5, 0, tc.value(1), 3);
        let quorum: Vec<ConsensusMessage> = (0..3).map(|i| tc.prevote(5, 0, other, i)).collect();
        let ok = Proof::misbehaviour(Rule::C, precommit.clone(), quorum, 3);
        assert!(verify_misbehaviour(&chain, &sig, MAX_ROUND, &ok));

        let duplicated = vec![
            tc.prevote(5, 0, other, 0),
            tc.aggregated_prevote(5, 0, other, &[0, 1]),
            tc.prevote(5, 0, other, 2),
        ];
        let bad = Proof::misbehaviour(Rule::C, precommit.clone(), duplicated, 3);
        assert!(!verify_misbehaviour(&chain, &sig, MAX_ROUND, &bad));

        let short: Vec<ConsensusMessage> = (0..2).map(|i| tc.prevote(5, 0, other, i)).collect();
        let bad = Proof::misbehaviour(Rule::C, precommit, short, 3);
        assert!(!verify_misbehaviour(&chain, &sig, MAX_ROUND, &bad));
    }

    /// Two nil and two V' prevotes: four distinct signers, but no value
    /// reached quorum.
    fn split_prevotes(tc: &TestCommittee, round: i64, other: Hash) -> Vec<ConsensusMessage> {
        vec![
            tc.prevote(5, round, NIL_VALUE, 0),
            tc.prevote(5, round, NIL_VALUE, 1),
            tc.prevote(5, round, other, 2),
            tc.prevote(5, round, other, 3),
        ]
    }

    #[test]
    fn test_c_rejects_quorum_split_across_values() {
        let tc = TestCommittee::new(5);
        let chain = MockChain::new(tc.committee.clone(), 20);
        let sig = tc.verifier();
        let other = tc.value(9);
        let precommit = tc.precommit(5, 1, tc.value(1), 4);

        let split = Proof::misbehaviour(Rule::C, precommit.clone(), split_prevotes(&tc, 1, other), 4);
        assert!(!verify_misbehaviour(&chain, &sig, MAX_ROUND, &split));

        let nil_quorum: Vec<ConsensusMessage> =
            (0..4).map(|i| tc.prevote(5, 1, NIL_VALUE, i)).collect();
        let ok = Proof::misbehaviour(Rule::C, precommit.clone(), nil_quorum, 4);
        assert!(verify_misbehaviour(&chain, &sig, MAX_ROUND, &ok));

        let for_value: Vec<ConsensusMessage> =
            (0..4).map(|i| tc.prevote(5, 1, tc.value(1), i)).collect();
        let bad = Proof::misbehaviour(Rule::C, precommit, for_value, 4);
        assert!(!verify_misbehaviour(&chain, &sig, MAX_ROUND, &bad));
    }

    #[test]
    fn test_po_rejects_quorum_split_across_values() {
        let tc = TestCommittee::new(5);
        let chain = MockChain::new(tc.committee.clone(), 20);
        let sig = tc.verifier();
        let other = tc.value(9);
        let light = tc.proposal(5, 3, 1, 4, b"block").to_light();

        let split = Proof::misbehaviour(Rule::PO, light.clone(), split_prevotes(&tc, 1, other), 4);
        assert!(!verify_misbehaviour(&chain, &sig, MAX_ROUND, &split));

        let quorum: Vec<ConsensusMessage> = (0..4).map(|i| tc.prevote(5, 1, other, i)).collect();
        let ok = Proof::misbehaviour(Rule::PO, light, quorum, 4);
        assert!(verify_misbehaviour(&chain, &sig, MAX_ROUND, &ok));
    }

    #[test]
    fn test_pvn_misbehaviour() {
        let (tc, chain) = setup();
        let sig = tc.verifier();
        let proposal = tc.proposal(5, 2, -1, 0, b"b");
        let prevote = tc.prevote(5, 2, proposal.value(), 3);
        let evidences = vec![
            proposal.to_light(),
            tc.precommit(5, 0, tc.value(9), 3),
            tc.precommit(5, 1, NIL_VALUE, 3),
        ];
        let ok = Proof::misbehaviour(Rule::PVN, prevote.clone(), evidences.clone(), 3);
        assert!(verify_misbehaviour(&chain, &sig, MAX_ROUND, &ok));

        let gap = vec![evidences[0].clone(), evidences[1].clone()];
        let bad = Proof::misbehaviour(Rule::PVN, prevote, gap, 3);
        assert!(!verify_misbehaviour(&chain, &sig, MAX_ROUND, &bad));
    }

    #[test]
    fn test_pvo12_and_pvo3() {
        let (tc, chain) = setup();
        let sig = tc.verifier();
        let proposal = tc.proposal(5, 3, 0, 1, b"b");
        let v = proposal.value();
        let prevote = tc.prevote(5, 3, v, 2);
        let pvo12 = Proof::misbehaviour(
            Rule::PVO12,
            prevote.clone(),
            vec![
                proposal.to_light(),
                tc.precommit(5, 2, tc.value(9), 2),
                tc.precommit(5, 1, v, 2),
            ],
            2,
        );
        assert!(verify_misbehaviour(&chain, &sig, MAX_ROUND, &pvo12));

        let missing_round = Proof::misbehaviour(
            Rule::PVO12,
            prevote,
            vec![proposal.to_light(), tc.precommit(5, 2, tc.value(9), 2)],
            2,
        );
        assert!(!verify_misbehaviour(&chain, &sig, MAX_ROUND, &missing_round));

        let bad_vr = tc.proposal(5, 1, 1, 0, b"c");
        let pvo3 = Proof::misbehaviour(
            Rule::PVO3,
            tc.prevote(5, 1, bad_vr.value(), 3),
            vec![bad_vr.to_light()],
            3,
        );
        assert!(verify_misbehaviour(&chain, &sig, MAX_ROUND, &pvo3));
    }

    #[test]
    fn test_self_incriminating_rules() {
        let (tc, chain) = setup();
        let sig = tc.verifier();
        let light = tc.proposal(5, 2, 2, 1, b"b").to_light();
        let wrong_vr = Proof::misbehaviour(Rule::WrongValidRound, light, vec![], 1);
        assert!(verify_misbehaviour(&chain, &sig, MAX_ROUND, &wrong_vr));

        let in_range = Proof::misbehaviour(Rule::InvalidRound, tc.prevote(5, 3, tc.value(1), 1), vec![], 1);
        assert!(!verify_misbehaviour(&chain, &sig, MAX_ROUND, &in_range));
        let too_high = Proof::misbehaviour(Rule::InvalidRound, tc.prevote(5, 100, tc.value(1), 1), vec![], 1);
        assert!(verify_misbehaviour(&chain, &sig, MAX_ROUND, &too_high));

        let a = tc.prevote(5, 0, tc.value(1), 2);
        let b = tc.prevote(5, 0, tc.value(2), 2);
        let eq = Proof::misbehaviour(Rule::Equivocation, a.clone(), vec![b], 2);
        assert!(verify_misbehaviour(&chain, &sig, MAX_ROUND, &eq));
        let same = Proof::misbehaviour(Rule::Equivocation, a.clone(), vec![a], 2);
        assert!(!verify_misbehaviour(&chain, &sig, MAX_ROUND, &same));

        let proposer = chain.proposer(5, 0).unwrap();
        let imposter = tc.committee.iter().find(|m| m.address != proposer).unwrap().index;
        let p = tc.proposal(5, 0, -1, imposter, b"x").to_light();
        let invalid_proposer = Proof::misbehaviour(Rule::InvalidProposer, p, vec![], imposter);
        assert!(verify_misbehaviour(&chain, &sig, MAX_ROUND, &invalid_proposer));
    }

    #[test]
    fn test_innocence_of_c1() {
        let (tc, chain) = setup();
        let sig = tc.verifier();
        let v = tc.value(1);
        let precommit = tc.precommit(5, 0, v, 1);
        let quorum: Vec<ConsensusMessage> = (0..3).map(|i| tc.prevote(5, 0, v, i)).collect();
        let ok = Proof::innocence(Rule::C1, precommit.clone(), quorum.clone(), 1);
        assert!(verify_innocence(&chain, &sig, MAX_ROUND, &ok));
        let short = Proof::innocence(Rule::C1, precommit, quorum[..2].to_vec(), 1);
        assert!(!verify_innocence(&chain, &sig, MAX_ROUND, &short));
    }

    #[test]
    fn test_native_contract_outputs() {
        let (tc, chain) = setup();
        let precompiles = AccountabilityPrecompiles::new(
            Arc::new(chain),
            Arc::new(tc.verifier()),
            VerifierParams::from(&AccountabilityConfig::default()),
        );
        let precommit = tc.precommit(5, 0, tc.value(1), 1);
        let proof = Proof::accusation(Rule::C1, precommit.clone(), vec![], 1);
        let input = input_of(&proof);

        let contract = precompiles.by_address(CHECK_ACCUSATION_ADDRESS).unwrap();
        let out = contract.run(&input, 10);
        assert_eq!(out.len(), SUCCESS_RESULT_LEN);
        assert_eq!(out[31], 1);
        assert_eq!(&out[32..64], &tc.committee.member(1).unwrap().address.to_bytes()[..]);
        assert_eq!(out[95], Rule::C1.id());
        assert_eq!(&out[120..128], &5u64.to_be_bytes());
        assert_eq!(&out[128..160], &precommit.hash().to_bytes()[..]);

        // Too old for the accused to answer.
        assert_eq!(contract.run(&input, 5 + 256), vec![0u8; FAILURE_RESULT_LEN]);
        // Input must be longer than the length word.
        assert_eq!(contract.run(&[0u8; 32], 10), vec![0u8; FAILURE_RESULT_LEN]);
        // Garbage.
        assert_eq!(contract.run(&[7u8; 64], 10), vec![0u8; FAILURE_RESULT_LEN]);

        let innocence = precompiles.by_address(CHECK_INNOCENCE_ADDRESS).unwrap();
        assert_eq!(innocence.run(&input, 0), vec![0u8; FAILURE_RESULT_LEN]);
        assert!(precompiles.by_address(0x01).is_none());
    }

    #[test]
    fn test_required_gas() {
        let gas = |len: usize| required_gas(&vec![0u8; len], 1000);
        assert_eq!(gas(0), 0);
        assert_eq!(gas(1), 1000);
        assert_eq!(gas(1024), 1000);
        assert_eq!(gas(1025), 2000);
    }

    #[test]
    fn test_misbehaviour_contract_rejects_accusation_proof_shape() {
        let (tc, chain) = setup();
        let precompiles = AccountabilityPrecompiles::new(
            Arc::new(chain),
            Arc::new(tc.verifier()),
            VerifierParams::from(&AccountabilityConfig::default()),
        );
        let proof = Proof::new(
            ProofType::Misbehaviour,
            Rule::C1,
            tc.precommit(5, 0, tc.value(1), 1),
            vec![],
            1,
        );
        let out = precompiles.misbehaviour.run(&input_of(&proof), 10);
        assert_eq!(out, vec![0u8; FAILURE_RESULT_LEN]);
    }
}
