//! Innocence proofs answering accusations against the local node.

use {
    crate::{
        committee::Committee,
        error::{AccountabilityError, Result},
        message::{ConsensusMessage, MessageCode, NEW_PROPOSAL_ROUND},
        msg_store::MsgStore,
        proof::{Proof, Rule},
    },
    solana_hash::Hash,
};

/// Build an innocence proof for `accusation` from the local store.
///
/// `committee` is the committee that validated the accused message (the
/// snapshot at `height - 1`).
pub fn innocence_proof(store: &MsgStore, committee: &Committee, accusation: &Proof) -> Result<Proof> {
    match accusation.rule {
        Rule::PO => innocence_proof_po(store, committee, accusation),
        Rule::PVN => innocence_proof_pvn(store, accusation),
        Rule::PVO => innocence_proof_pvo(store, committee, accusation),
        Rule::C1 => innocence_proof_c1(store, committee, accusation),
        _ => Err(AccountabilityError::UnprovableRule),
    }
}

fn quorum_of_prevotes(
    store: &MsgStore,
    committee: &Committee,
    height: u64,
    round: i64,
    value: &Hash,
) -> Option<Vec<ConsensusMessage>> {
    let prevotes: Vec<ConsensusMessage> = store
        .get_round(height, round, MessageCode::Prevote)
        .into_iter()
        .filter(|m| m.value() == *value)
        .collect();
    committee.over_quorum_votes(&prevotes)
}

/// PO: a quorum of prevotes for the proposed value at its valid round.
fn innocence_proof_po(store: &MsgStore, committee: &Committee, accusation: &Proof) -> Result<Proof> {
    let proposal = &accusation.message;
    let valid_round = proposal
        .valid_round()
        .ok_or(AccountabilityError::NoEvidenceForPO)?;
    let quorum = quorum_of_prevotes(
        store,
        committee,
        proposal.height(),
        valid_round,
        &proposal.value(),
    )
    .ok_or(AccountabilityError::NoEvidenceForPO)?;
    Ok(Proof::innocence(
        accusation.rule,
        proposal.clone(),
        quorum,
        accusation.offender_index,
    ))
}

/// PVN: the new proposal the prevote was cast for.
fn innocence_proof_pvn(store: &MsgStore, accusation: &Proof) -> Result<Proof> {
    let prevote = &accusation.message;
    let round = prevote.round();
    let value = prevote.value();
    let proposal = store
        .get(prevote.height(), |m| {
            m.is_proposal()
                && m.round() == round
                && m.value() == value
                && m.valid_round() == Some(NEW_PROPOSAL_ROUND)
        })
        .into_iter()
        .next()
        .ok_or(AccountabilityError::NoEvidenceForPVN)?;
    Ok(Proof::innocence(
        accusation.rule,
        prevote.clone(),
        vec![proposal.to_light()],
        accusation.offender_index,
    ))
}

/// PVO: the old proposal plus a quorum of prevotes for its value at its
/// valid round.
fn innocence_proof_pvo(store: &MsgStore, committee: &Committee, accusation: &Proof) -> Result<Proof> {
    let old_proposal = accusation
        .evidences
        .first()
        .ok_or(AccountabilityError::NoEvidenceForPVO)?;
    let valid_round = old_proposal
        .valid_round()
        .ok_or(AccountabilityError::NoEvidenceForPVO)?;
    let quorum = quorum_of_prevotes(
        store,
        committee,
        old_proposal.height(),
        valid_round,
        &old_proposal.value(),
    )
    .ok_or(AccountabilityError::NoEvidenceForPVO)?;
    let mut evidences = accusation.evidences.clone();
    evidences.extend(quorum);
    Ok(Proof::innocence(
        accusation.rule,
        accusation.message.clone(),
        evidences,
        accusation.offender_index,
    ))
}

/// C1: a quorum of prevotes for the precommitted value at the same round.
fn innocence_proof_c1(store: &MsgStore, committee: &Committee, accusation: &Proof) -> Result<Proof> {
    let precommit = &accusation.message;
    let quorum = quorum_of_prevotes(
        store,
        committee,
        precommit.height(),
        precommit.round(),
        &precommit.value(),
    )
    .ok_or(AccountabilityError::NoEvidenceForC1)?;
    Ok(Proof::innocence(
        accusation.rule,
        precommit.clone(),
        quorum,
        accusation.offender_index,
    ))
}
