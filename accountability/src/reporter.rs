//! On-chain reporting of accountability events.
//!
//! Reporting is rotated across the committee in slots of
//! `reporting_slot_period` blocks so that one event is not submitted by every
//! node. Events that cannot be submitted yet stay pending for the next slot.
//!
//! Submission itself happens on a dedicated worker ([`Submitter`]): a proof
//! larger than one transaction is split into chunks, and each chunk is
//! confirmed before the next one goes out.

use {
    crate::{
        chain::{AccountabilityContract, ChainContext},
        codec::encode_proof,
        committee::Committee,
        config::AccountabilityConfig,
        error::{CodecError, ContractError, ReportError},
        proof::{AccountabilityEvent, ChunkedEvent, Proof, ProofType},
    },
    crossbeam_channel::Sender,
    log::*,
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::sleep,
    },
};

const CHUNK_SHRINK_STEP: usize = 1024;

/// Encode `proof` into the event submitted on-chain.
pub fn event_from_proof(
    proof: &Proof,
    committee: &Committee,
    reporter: Pubkey,
) -> Result<AccountabilityEvent, CodecError> {
    let offender = committee
        .member(proof.offender_index)
        .map(|m| m.address)
        .ok_or(CodecError::OffenderIndexOverflow(proof.offender_index as u64))?;
    Ok(AccountabilityEvent {
        event_type: proof.proof_type,
        rule: proof.rule,
        reporter,
        offender,
        block: proof.message.height(),
        raw_proof: encode_proof(proof)?,
    })
}

/// Whether `address` reports in the slot ending at `height`.
pub fn is_reporter(committee: &Committee, address: &Pubkey, height: u64, slot_period: u64) -> bool {
    if slot_period == 0 || committee.is_empty() || height % slot_period != 0 {
        return false;
    }
    let slot = height / slot_period;
    let Ok(len) = u64::try_from(committee.len()) else {
        return false;
    };
    usize::try_from(slot % len)
        .ok()
        .and_then(|index| committee.member(index))
        .is_some_and(|m| m.address == *address)
}

/// Split `event` into chunks of at most `chunk_size` bytes of proof.
///
/// Returns `None` when more than `u8::MAX` chunks would be needed.
pub fn chunk_event(event: &AccountabilityEvent, chunk_size: usize) -> Option<Vec<ChunkedEvent>> {
    let chunk_size = chunk_size.max(1);
    let slices: Vec<&[u8]> = if event.raw_proof.is_empty() {
        vec![&[][..]]
    } else {
        event.raw_proof.chunks(chunk_size).collect()
    };
    let chunks = u8::try_from(slices.len()).ok()?;
    Some(
        slices
            .into_iter()
            .enumerate()
            .map(|(i, slice)| ChunkedEvent {
                chunks,
                // `i < chunks <= u8::MAX`
                chunk_id: i as u8,
                event_type: event.event_type,
                rule: event.rule,
                reporter: event.reporter,
                offender: event.offender,
                block: event.block,
                raw_proof: slice.to_vec(),
            })
            .collect(),
    )
}

/// Decides which pending events go out and hands them to the submitter.
pub struct EventReporter {
    address: Pubkey,
    chain: Arc<dyn ChainContext>,
    contract: Arc<dyn AccountabilityContract>,
    slot_period: u64,
    submissions: Sender<AccountabilityEvent>,
}

impl EventReporter {
    pub fn new(
        address: Pubkey,
        chain: Arc<dyn ChainContext>,
        contract: Arc<dyn AccountabilityContract>,
        config: &AccountabilityConfig,
        submissions: Sender<AccountabilityEvent>,
    ) -> Self {
        Self {
            address,
            chain,
            contract,
            slot_period: config.reporting_slot_period,
            submissions,
        }
    }

    /// Whether this node reports in the slot ending at `height`.
    pub fn can_report(&self, height: u64) -> bool {
        self.chain
            .committee_at(height)
            .is_some_and(|c| is_reporter(&c, &self.address, height, self.slot_period))
    }

    /// Submit at most one pending event. Returns the events left pending:
    /// those after the submitted one and those deferred to a later slot.
    pub fn report_events(&self, events: Vec<AccountabilityEvent>) -> Vec<AccountabilityEvent> {
        let mut pending = Vec::with_capacity(events.len());
        let mut events = events.into_iter();
        while let Some(event) = events.next() {
            match self.try_report(&event) {
                Ok(()) => {
                    pending.extend(events);
                    break;
                }
                Err(ReportError::InvalidReport) => {}
                Err(ReportError::PendingReport) => pending.push(event),
                Err(ReportError::ChannelClosed) => {
                    pending.push(event);
                    pending.extend(events);
                    break;
                }
            }
        }
        pending
    }

    /// Check with the contract that `event` can be submitted now, and queue
    /// it for submission.
    pub fn try_report(&self, event: &AccountabilityEvent) -> Result<(), ReportError> {
        match event.event_type {
            ProofType::Misbehaviour => {
                match self.contract.can_slash(&event.offender, event.rule, event.block) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("Accountability: reporting cancelled, {} already slashed", event.offender);
                        return Err(ReportError::InvalidReport);
                    }
                    Err(err) => {
                        debug!("Accountability: can_slash failed: {err}");
                        return Err(ReportError::InvalidReport);
                    }
                }
            }
            ProofType::Accusation => {
                let status = match self.contract.can_accuse(&event.offender, event.rule, event.block)
                {
                    Ok(status) => status,
                    Err(err) => {
                        debug!("Accountability: can_accuse failed: {err}");
                        return Err(ReportError::InvalidReport);
                    }
                };
                if !status.allowed {
                    if status.deadline == 0 {
                        info!("Accountability: accusation cancelled, {} already slashed", event.offender);
                        return Err(ReportError::InvalidReport);
                    }
                    let current = self.chain.current_height();
                    if status.deadline <= current {
                        info!("Accountability: accusation cancelled, deadline in the past");
                        return Err(ReportError::InvalidReport);
                    }
                    info!(
                        "Accountability: accusation delayed by {} blocks",
                        status.deadline.saturating_sub(current)
                    );
                    return Err(ReportError::PendingReport);
                }
            }
            ProofType::Innocence => {}
        }
        warn!(
            "Accountability: reporting faulty validator {} rule {} block {}",
            event.offender, event.rule, event.block
        );
        self.submissions
            .send(event.clone())
            .map_err(|_| ReportError::ChannelClosed)
    }
}

/// Sends events to the contract chunk by chunk and waits for each chunk to
/// be confirmed.
pub struct Submitter {
    contract: Arc<dyn AccountabilityContract>,
    config: AccountabilityConfig,
    exit: Arc<AtomicBool>,
}

impl Submitter {
    pub fn new(
        contract: Arc<dyn AccountabilityContract>,
        config: AccountabilityConfig,
        exit: Arc<AtomicBool>,
    ) -> Self {
        Self {
            contract,
            config,
            exit,
        }
    }

    /// Submit `event`. Returns whether every chunk was confirmed.
    pub fn submit(&self, event: &AccountabilityEvent) -> bool {
        let Some(chunks) = self.fit_chunks(event) else {
            return false;
        };
        for chunk in &chunks {
            let tx = match self.contract.handle_event(chunk) {
                Ok(tx) => tx,
                Err(err) => {
                    error!("Accountability: cannot submit event chunk: {err}");
                    return false;
                }
            };
            info!(
                "Accountability: transaction {tx} sent, chunk {}/{} size {}",
                u16::from(chunk.chunk_id).saturating_add(1),
                chunk.chunks,
                chunk.raw_proof.len()
            );
            if !self.wait_confirmation(&tx) {
                return false;
            }
        }
        true
    }

    /// Shrink the chunk size until the contract accepts a chunk.
    fn fit_chunks(&self, event: &AccountabilityEvent) -> Option<Vec<ChunkedEvent>> {
        let mut chunk_size = self.config.chunk_size;
        loop {
            let Some(chunks) = chunk_event(event, chunk_size) else {
                error!(
                    "Accountability: proof of {} bytes needs more than {} chunks, dropping",
                    event.raw_proof.len(),
                    u8::MAX
                );
                return None;
            };
            let first = chunks.first()?;
            match self.contract.estimate_event(first) {
                Ok(()) => return Some(chunks),
                Err(ContractError::Oversize) => {
                    chunk_size = chunk_size.saturating_sub(CHUNK_SHRINK_STEP);
                    if chunk_size < self.config.min_chunk_size || chunk_size == 0 {
                        error!("Accountability: event does not fit even in the smallest chunk");
                        return None;
                    }
                    debug!("Accountability: retrying with chunk size {chunk_size}");
                }
                Err(err) => {
                    error!("Accountability: cannot estimate event: {err}");
                    return None;
                }
            }
        }
    }

    fn wait_confirmation(&self, tx: &Hash) -> bool {
        for _ in 0..self.config.max_submission_attempts {
            if self.exit.load(Ordering::Relaxed) {
                return false;
            }
            sleep(self.config.submission_delay);
            match self.contract.tx_confirmed(tx) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => debug!("Accountability: cannot query transaction {tx}: {err}"),
            }
        }
        error!("Accountability: transaction {tx} not mined, cancelling");
        false
    }
}
