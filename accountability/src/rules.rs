//! Rule engine.
//!
//! Replays the BFT voting rules over every message stored for one height and
//! returns the proofs it can build. The engine is pure: the same store,
//! committee and height always give the same proofs in the same order.
//!
//! Rule families, checked in this order:
//!
//! ```text
//!  PN     new proposal after a non-nil precommit of the proposer
//!  PO     old proposal not backed by a quorum at its valid round
//!  PVN    prevote for a new proposal against the signer's last precommit
//!  PVO*   prevote for an old proposal (PVO, PVO12, PVO3)
//!  C/C1   precommit without a quorum of prevotes for its value
//! ```

use {
    crate::{
        committee::Committee,
        message::{ConsensusMessage, MessageCode, NEW_PROPOSAL_ROUND, NIL_VALUE},
        msg_store::MsgStore,
        proof::{Proof, ProofType, Rule},
    },
    log::*,
    solana_hash::Hash,
};

/// Answers whether `value` is the block committed at `height`.
pub type CommitOracle<'a> = &'a dyn Fn(&Hash, u64) -> bool;

/// Run every rule over `height`, treating no value as committed.
pub fn run_rules(store: &MsgStore, committee: &Committee, height: u64) -> Vec<Proof> {
    run_rules_with(store, committee, height, &|_, _| false)
}

/// Run every rule over `height`. Accusations against a value `is_committed`
/// reports as committed at `height` are not raised.
pub fn run_rules_with(
    store: &MsgStore,
    committee: &Committee,
    height: u64,
    is_committed: CommitOracle<'_>,
) -> Vec<Proof> {
    let engine = RuleEngine {
        store,
        committee,
        height,
        is_committed,
    };
    let mut proofs = engine.new_proposals_check();
    proofs.extend(engine.old_proposals_check());
    proofs.extend(engine.prevotes_check());
    proofs.extend(engine.precommits_check());
    proofs
}

struct RuleEngine<'a> {
    store: &'a MsgStore,
    committee: &'a Committee,
    height: u64,
    is_committed: CommitOracle<'a>,
}

impl RuleEngine<'_> {
    fn committed(&self, value: &Hash) -> bool {
        (self.is_committed)(value, self.height)
    }

    fn prevotes_at(&self, round: i64) -> Vec<ConsensusMessage> {
        self.store.get_round(self.height, round, MessageCode::Prevote)
    }

    /// Quorum of prevotes at `round` for `value`.
    fn quorum_for(&self, round: i64, value: &Hash) -> Option<Vec<ConsensusMessage>> {
        let votes: Vec<ConsensusMessage> = self
            .prevotes_at(round)
            .into_iter()
            .filter(|m| m.value() == *value)
            .collect();
        self.committee.over_quorum_votes(&votes)
    }

    /// Quorum of prevotes at `round` for a single value other than `value`.
    /// Values are tried in the order they were first seen.
    fn quorum_against(
        &self,
        round: i64,
        value: &Hash,
        include_nil: bool,
    ) -> Option<Vec<ConsensusMessage>> {
        let mut groups: Vec<(Hash, Vec<ConsensusMessage>)> = Vec::new();
        for vote in self.prevotes_at(round) {
            let v = vote.value();
            if v == *value || (!include_nil && v == NIL_VALUE) {
                continue;
            }
            match groups.iter_mut().find(|(g, _)| *g == v) {
                Some((_, votes)) => votes.push(vote),
                None => groups.push((v, vec![vote])),
            }
        }
        groups
            .iter()
            .find_map(|(_, votes)| self.committee.over_quorum_votes(votes))
    }

    fn proposals_of(&self, signer: usize, round: i64) -> Vec<ConsensusMessage> {
        self.store
            .get_from(self.height, signer, |m| m.is_proposal() && m.round() == round)
    }

    fn precommits_of<F>(&self, signer: usize, pred: F) -> Vec<ConsensusMessage>
    where
        F: Fn(&ConsensusMessage) -> bool,
    {
        self.store.get_from(self.height, signer, |m| {
            m.code() == MessageCode::Precommit && pred(m)
        })
    }

    fn is_equivocated(&self, msg: &ConsensusMessage, signer: usize) -> bool {
        !self
            .store
            .equivocated_votes(self.height, msg.round(), msg.code(), signer, &msg.value())
            .is_empty()
    }

    // ── PN ──────────────────────────────────────────────────────────────

    fn new_proposals_check(&self) -> Vec<Proof> {
        let mut proofs = Vec::new();
        let proposals = self.store.get(self.height, |m| {
            m.is_proposal() && m.valid_round() == Some(NEW_PROPOSAL_ROUND)
        });
        for proposal in proposals {
            let Some(signer) = proposal.signers().indices().first().copied() else {
                continue;
            };
            if self.proposals_of(signer, proposal.round()).len() > 1 {
                continue;
            }
            let precommits =
                self.precommits_of(signer, |m| m.round() < proposal.round() && !m.is_nil());
            if let Some(precommit) = precommits.into_iter().next() {
                info!("Misbehaviour detected, rule PN, offender {signer} h={}", self.height);
                proofs.push(Proof::misbehaviour(
                    Rule::PN,
                    proposal.to_light(),
                    vec![precommit],
                    signer,
                ));
            }
        }
        proofs
    }

    // ── PO ──────────────────────────────────────────────────────────────

    fn old_proposals_check(&self) -> Vec<Proof> {
        let mut proofs = Vec::new();
        let proposals = self.store.get(self.height, |m| {
            m.is_proposal() && m.valid_round().is_some_and(|vr| vr > NEW_PROPOSAL_ROUND)
        });
        for proposal in proposals {
            let Some(signer) = proposal.signers().indices().first().copied() else {
                continue;
            };
            if self.proposals_of(signer, proposal.round()).len() > 1 {
                continue;
            }
            if let Some(proof) = self.old_proposal_check(&proposal, signer) {
                proofs.push(proof);
            }
        }
        proofs
    }

    fn old_proposal_check(&self, proposal: &ConsensusMessage, signer: usize) -> Option<Proof> {
        let round = proposal.round();
        let value = proposal.value();
        let valid_round = proposal.valid_round()?;
        let light = proposal.to_light();

        // Locked on something else at the valid round.
        let locked_elsewhere = self.precommits_of(signer, |m| {
            m.round() == valid_round && !m.is_nil() && m.value() != value
        });
        if let Some(precommit) = locked_elsewhere.into_iter().next() {
            info!("Misbehaviour detected, rule PO, offender {signer} h={}", self.height);
            return Some(Proof::misbehaviour(Rule::PO, light, vec![precommit], signer));
        }

        // A later lock should have moved the valid round.
        let later_lock = self.precommits_of(signer, |m| {
            m.round() > valid_round && m.round() < round && !m.is_nil()
        });
        if let Some(precommit) = later_lock.into_iter().next() {
            info!("Misbehaviour detected, rule PO, offender {signer} h={}", self.height);
            return Some(Proof::misbehaviour(Rule::PO, light, vec![precommit], signer));
        }

        if let Some(quorum) = self.quorum_against(valid_round, &value, true) {
            info!("Misbehaviour detected, rule PO, offender {signer} h={}", self.height);
            return Some(Proof::misbehaviour(Rule::PO, light, quorum, signer));
        }

        if self.quorum_for(valid_round, &value).is_none() && !self.committed(&value) {
            info!("Suspicious behaviour detected, rule PO, suspect {signer} h={}", self.height);
            return Some(Proof::accusation(Rule::PO, light, vec![], signer));
        }
        None
    }

    // ── Prevotes ────────────────────────────────────────────────────────

    fn prevotes_check(&self) -> Vec<Proof> {
        let mut proofs = Vec::new();
        let prevotes = self
            .store
            .get(self.height, |m| m.code() == MessageCode::Prevote && !m.is_nil());
        for prevote in prevotes {
            let round = prevote.round();
            let value = prevote.value();
            for signer in prevote.signers().flatten_uniq() {
                if self.is_equivocated(&prevote, signer) {
                    continue;
                }

                let proposals = self.store.get(self.height, |m| {
                    m.is_proposal() && m.round() == round && m.value() == value
                });
                if proposals.is_empty() {
                    // A quorum for the value means this node merely missed
                    // the proposal.
                    if self.quorum_for(round, &value).is_none() && !self.committed(&value) {
                        info!(
                            "Suspicious behaviour detected, rule PVN, suspect {signer} h={}",
                            self.height
                        );
                        proofs.push(Proof::accusation(Rule::PVN, prevote.clone(), vec![], signer));
                    }
                    continue;
                }

                let mut candidates = Vec::with_capacity(proposals.len());
                let mut justified = false;
                for proposal in &proposals {
                    let proof = if proposal.valid_round() == Some(NEW_PROPOSAL_ROUND) {
                        self.new_prevote_check(&prevote, proposal, signer)
                    } else {
                        self.old_prevote_check(&prevote, proposal, signer)
                    };
                    match proof {
                        Some(proof) => candidates.push(proof),
                        None => {
                            justified = true;
                            break;
                        }
                    }
                }
                if justified {
                    continue;
                }
                let misbehaviour = candidates
                    .iter()
                    .position(|p| p.proof_type == ProofType::Misbehaviour);
                let chosen = match misbehaviour {
                    Some(i) => Some(candidates.swap_remove(i)),
                    None => candidates.into_iter().next(),
                };
                if let Some(proof) = chosen {
                    info!(
                        "{:?} raised, rule {}, offender {signer} h={}",
                        proof.proof_type, proof.rule, self.height
                    );
                    proofs.push(proof);
                }
            }
        }
        proofs
    }

    /// PVN: walk the signer's precommits backwards from the prevote round
    /// while they stay contiguous; the latest non-nil one must be for the
    /// prevoted value.
    fn new_prevote_check(
        &self,
        prevote: &ConsensusMessage,
        proposal: &ConsensusMessage,
        signer: usize,
    ) -> Option<Proof> {
        let mut precommits = self.precommits_of(signer, |m| m.round() < prevote.round());
        if precommits.is_empty() {
            return None;
        }
        precommits.sort_by_key(|m| m.round());

        let mut r = prevote.round();
        let mut i = precommits.len();
        while i > 0 {
            let idx = i.saturating_sub(1);
            let pc = &precommits[idx];
            if r.saturating_sub(pc.round()) > 1 {
                return None;
            }
            if !pc.is_nil() {
                if self.is_equivocated(pc, signer) || pc.value() == prevote.value() {
                    return None;
                }
                let mut evidences = vec![proposal.to_light()];
                evidences.extend(precommits[idx..].iter().cloned());
                return Some(Proof::misbehaviour(
                    Rule::PVN,
                    prevote.clone(),
                    evidences,
                    signer,
                ));
            }
            r = pc.round();
            i = idx;
        }
        None
    }

    fn old_prevote_check(
        &self,
        prevote: &ConsensusMessage,
        proposal: &ConsensusMessage,
        signer: usize,
    ) -> Option<Proof> {
        let round = proposal.round();
        let value = proposal.value();
        let valid_round = proposal.valid_round()?;
        let light = proposal.to_light();

        if valid_round >= round {
            return Some(Proof::misbehaviour(
                Rule::PVO3,
                prevote.clone(),
                vec![light],
                signer,
            ));
        }

        if let Some(quorum) = self.quorum_against(valid_round, &value, false) {
            let mut evidences = vec![light];
            evidences.extend(quorum);
            return Some(Proof::misbehaviour(Rule::PVO, prevote.clone(), evidences, signer));
        }

        let mut precommits =
            self.precommits_of(signer, |m| m.round() > valid_round && m.round() < round);
        if !precommits.is_empty() {
            precommits.sort_by_key(|m| m.round());
            if is_contiguous(&precommits, valid_round, round) {
                let last_for_v = last_round_where(&precommits, |m| m.value() == value);
                let last_for_other =
                    last_round_where(&precommits, |m| m.value() != value && !m.is_nil());
                if last_for_other > last_for_v {
                    let mut evidences = vec![light.clone()];
                    evidences.extend(precommits);
                    return Some(Proof::misbehaviour(
                        Rule::PVO12,
                        prevote.clone(),
                        evidences,
                        signer,
                    ));
                }
            }
        }

        if self.quorum_for(valid_round, &value).is_none() && !self.committed(&value) {
            return Some(Proof::accusation(
                Rule::PVO,
                prevote.clone(),
                vec![light],
                signer,
            ));
        }
        None
    }

    // ── Precommits ──────────────────────────────────────────────────────

    fn precommits_check(&self) -> Vec<Proof> {
        let mut proofs = Vec::new();
        let precommits = self
            .store
            .get(self.height, |m| m.code() == MessageCode::Precommit && !m.is_nil());
        for precommit in precommits {
            let round = precommit.round();
            let value = precommit.value();
            for signer in precommit.signers().flatten_uniq() {
                if self.is_equivocated(&precommit, signer) {
                    continue;
                }
                if let Some(quorum) = self.quorum_against(round, &value, true) {
                    info!("Misbehaviour detected, rule C, offender {signer} h={}", self.height);
                    proofs.push(Proof::misbehaviour(Rule::C, precommit.clone(), quorum, signer));
                    continue;
                }
                if self.quorum_for(round, &value).is_none() && !self.committed(&value) {
                    info!(
                        "Suspicious behaviour detected, rule C1, suspect {signer} h={}",
                        self.height
                    );
                    proofs.push(Proof::accusation(Rule::C1, precommit.clone(), vec![], signer));
                }
            }
        }
        proofs
    }
}

/// Sorted `precommits` hold exactly one message per round of
/// `(valid_round, round)`.
pub(crate) fn is_contiguous(precommits: &[ConsensusMessage], valid_round: i64, round: i64) -> bool {
    let (Some(first), Some(last)) = (precommits.first(), precommits.last()) else {
        return false;
    };
    if first.round() != valid_round.saturating_add(1) || last.round() != round.saturating_sub(1) {
        return false;
    }
    precommits
        .windows(2)
        .all(|w| w[1].round().saturating_sub(w[0].round()) == 1)
}

/// Highest round among `precommits` matching `pred`, or -1.
pub(crate) fn last_round_where<F>(precommits: &[ConsensusMessage], pred: F) -> i64
where
    F: Fn(&ConsensusMessage) -> bool,
{
    precommits
        .iter()
        .filter(|m| pred(m))
        .map(|m| m.round())
        .max()
        .unwrap_or(-1)
}
