//! Proposer election used to check the sender of a proposal.
//!
//! Every node must agree on who proposes at `(height, round)`; a proposal
//! signed by anybody else is provable misbehaviour.

use {crate::committee::Committee, solana_pubkey::Pubkey};

/// Deterministic proposer selection weighted by voting power.
///
/// # Algorithm
///
/// 1. `seed = height + round`.
/// 2. `target = seed % total_power`.
/// 3. Walk the committee in canonical order accumulating power; the first
///    member whose cumulative power exceeds `target` proposes.
pub fn proposer_for_round(committee: &Committee, height: u64, round: i64) -> Option<Pubkey> {
    let total_power = committee.total_power();
    if committee.is_empty() || total_power == 0 || round < 0 {
        return None;
    }

    let seed = height.wrapping_add(round.unsigned_abs());
    let target = seed.checked_rem(total_power)?;

    let mut accumulated: u64 = 0;
    for member in committee.iter() {
        accumulated = accumulated.saturating_add(member.voting_power);
        if accumulated > target {
            return Some(member.address);
        }
    }

    committee.member(0).map(|m| m.address)
}
