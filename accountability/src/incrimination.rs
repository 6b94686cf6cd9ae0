//! Checks run on every consensus message before it is stored.
//!
//! Some faults are visible from a single message plus what is already in
//! the store: a round above the maximum, a proposal whose valid round is not
//! in the past, a proposal from someone other than the round's proposer, or a
//! second message for the same slot with a different value. These produce a
//! misbehaviour proof immediately, without waiting for the rule engine.

use {
    crate::{
        committee::Committee,
        error::{AccountabilityError, Result},
        message::ConsensusMessage,
        msg_store::MsgStore,
        proof::{Proof, Rule},
    },
    solana_pubkey::Pubkey,
};

/// Outcome of a message that was not a duplicate.
#[derive(Debug, PartialEq, Eq)]
pub enum Incrimination {
    /// Nothing wrong; the message was stored.
    Clean,
    /// The message proves its signers faulty. Equivocating messages are
    /// stored anyway; malformed ones are not.
    Faulty(Vec<Proof>),
}

impl Incrimination {
    pub fn proofs(&self) -> &[Proof] {
        match self {
            Self::Clean => &[],
            Self::Faulty(proofs) => proofs,
        }
    }
}

/// Run the receive-time checks on a validated `msg` and store it.
///
/// `proposer` is the expected proposer of `(msg.height(), msg.round())`, if
/// known. Returns [`AccountabilityError::DuplicatedMsg`] when the message was
/// already stored.
pub fn check_self_incrimination(
    store: &mut MsgStore,
    committee: &Committee,
    proposer: Option<Pubkey>,
    msg: ConsensusMessage,
    max_round: i64,
) -> Result<Incrimination> {
    if msg.is_proposal() {
        check_proposal(store, committee, proposer, msg, max_round)
    } else {
        check_vote(store, msg, max_round)
    }
}

fn misbehaviours(rule: Rule, msg: &ConsensusMessage, evidences: Vec<ConsensusMessage>) -> Vec<Proof> {
    msg.signers()
        .flatten_uniq()
        .into_iter()
        .map(|signer| Proof::misbehaviour(rule, msg.to_light(), evidences.clone(), signer))
        .collect()
}

fn check_proposal(
    store: &mut MsgStore,
    committee: &Committee,
    proposer: Option<Pubkey>,
    msg: ConsensusMessage,
    max_round: i64,
) -> Result<Incrimination> {
    let height = msg.height();
    let round = msg.round();
    let value = msg.value();
    let valid_round = msg.valid_round();
    let Some(signer) = msg.signers().indices().first().copied() else {
        return Err(AccountabilityError::MalformedMessage("no signers"));
    };

    // The same proposal in either form.
    let duplicated = !store
        .get_from(height, signer, |m| {
            m.is_proposal()
                && m.round() == round
                && m.value() == value
                && m.valid_round() == valid_round
        })
        .is_empty();
    if duplicated {
        return Err(AccountabilityError::DuplicatedMsg);
    }

    if round > max_round {
        return Ok(Incrimination::Faulty(misbehaviours(Rule::InvalidRound, &msg, vec![])));
    }
    if valid_round.is_some_and(|vr| vr >= round) {
        return Ok(Incrimination::Faulty(misbehaviours(
            Rule::WrongValidRound,
            &msg,
            vec![],
        )));
    }

    let signer_address = committee.member(signer).map(|m| m.address);
    if proposer.is_none() || proposer != signer_address {
        return Ok(Incrimination::Faulty(misbehaviours(
            Rule::InvalidProposer,
            &msg,
            vec![],
        )));
    }

    let equivocated = store
        .get_from(height, signer, |m| {
            m.is_proposal()
                && m.round() == round
                && (m.value() != value || m.valid_round() != valid_round)
        })
        .into_iter()
        .next();
    let proofs = match equivocated {
        Some(other) => misbehaviours(Rule::Equivocation, &msg, vec![other.to_light()]),
        None => Vec::new(),
    };
    store.save(msg);
    Ok(if proofs.is_empty() {
        Incrimination::Clean
    } else {
        Incrimination::Faulty(proofs)
    })
}

fn check_vote(store: &mut MsgStore, msg: ConsensusMessage, max_round: i64) -> Result<Incrimination> {
    if store.contains(msg.height(), &msg.hash()) {
        return Err(AccountabilityError::DuplicatedMsg);
    }
    if msg.round() > max_round {
        return Ok(Incrimination::Faulty(misbehaviours(Rule::InvalidRound, &msg, vec![])));
    }

    let mut proofs = Vec::new();
    for signer in msg.signers().flatten_uniq() {
        let equivocated =
            store.equivocated_votes(msg.height(), msg.round(), msg.code(), signer, &msg.value());
        if let Some(other) = equivocated.into_iter().next() {
            proofs.push(Proof::misbehaviour(
                Rule::Equivocation,
                msg.clone(),
                vec![other],
                signer,
            ));
        }
    }
    store.save(msg);
    Ok(if proofs.is_empty() {
        Incrimination::Clean
    } else {
        Incrimination::Faulty(proofs)
    })
}
