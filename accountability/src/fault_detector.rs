//! The fault detector service.
//!
//! ```text
//!   consensus msgs ─┐                                   ┌─> peers (accusations)
//!   peer payloads ──┼─> [message loop] ──misbehaviour──>│
//!   chain events ───┘     │  validate, incriminate,     │
//!                         │  store, off-chain handler   │
//!                         ▼                             │
//!                     MsgStore <──── [block loop] ──────┤
//!                                     rule engine,      │
//!   chain events ───────────────────> escalation, gc,   └─> [reporter] ─> contract
//!   accusations against us ─────────> innocence proofs
//! ```
//!
//! The message loop is the only thread that inserts into the store; the
//! block loop reads it and garbage-collects old heights.

use {
    crate::{
        chain::{AccountabilityContract, ChainContext, ChainEvent, NewAccusation, PeerNetwork},
        codec::decode_proof,
        config::{AccountabilityConfig, ConfigError},
        crypto::SignatureVerifier,
        error::AccountabilityError,
        incrimination::{check_self_incrimination, Incrimination},
        innocence::innocence_proof,
        message::ConsensusMessage,
        msg_store::MsgStore,
        offchain::{send_accusation, AccusationLedger, OffchainHandler},
        proof::{AccountabilityEvent, Proof, ProofType},
        reporter::{event_from_proof, EventReporter, Submitter},
        rules::run_rules_with,
        verifier::verify_proof_signatures,
    },
    crossbeam_channel::{bounded, never, select, Receiver, RecvTimeoutError, Sender},
    log::*,
    parking_lot::{Mutex, RwLock},
    solana_pubkey::Pubkey,
    std::{
        collections::{BTreeMap, HashMap},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{Builder, JoinHandle},
        time::Instant,
    },
    thiserror::Error,
};

const MISBEHAVIOUR_CHANNEL_CAPACITY: usize = 100;
const SUBMISSION_CHANNEL_CAPACITY: usize = 10;

/// Input of the message loop.
#[derive(Debug)]
pub enum FaultDetectorEvent {
    /// A consensus message observed by the local node.
    Consensus(ConsensusMessage),
    /// An off-chain accountability payload received from a peer.
    Accountability {
        payload: Vec<u8>,
        sender: Pubkey,
        /// Where to report why the payload was rejected, so the p2p layer
        /// can penalise the peer.
        err_tx: Option<Sender<AccountabilityError>>,
    },
}

/// The node's view of its collaborators.
#[derive(Clone)]
pub struct AccountabilityContext {
    /// Address of the local node.
    pub address: Pubkey,
    pub chain: Arc<dyn ChainContext>,
    pub contract: Arc<dyn AccountabilityContract>,
    pub network: Arc<dyn PeerNetwork>,
    pub signatures: Arc<dyn SignatureVerifier>,
}

#[derive(Error, Debug)]
pub enum FaultDetectorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn fault detector thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Running fault detector. Dropping it without [`FaultDetector::stop`]
/// leaves the worker threads running until the exit flag is raised.
pub struct FaultDetector {
    exit: Arc<AtomicBool>,
    store: Arc<RwLock<MsgStore>>,
    ledger: Arc<Mutex<AccusationLedger>>,
    threads: Vec<JoinHandle<()>>,
}

impl FaultDetector {
    /// Spawn the message, block and reporter loops.
    pub fn start(
        ctx: AccountabilityContext,
        config: AccountabilityConfig,
        events: Receiver<FaultDetectorEvent>,
        exit: Arc<AtomicBool>,
    ) -> Result<Self, FaultDetectorError> {
        config.validate()?;
        let store = Arc::new(RwLock::new(MsgStore::new()));
        let ledger = Arc::new(Mutex::new(AccusationLedger::new()));
        let (misbehaviour_tx, misbehaviour_rx) = bounded(MISBEHAVIOUR_CHANNEL_CAPACITY);
        let (submission_tx, submission_rx) = bounded(SUBMISSION_CHANNEL_CAPACITY);

        info!("FaultDetector: starting for {}", ctx.address);

        let reporter = {
            let submitter = Submitter::new(ctx.contract.clone(), config.clone(), exit.clone());
            let exit = exit.clone();
            let poll_interval = config.poll_interval;
            Builder::new()
                .name("trv1AccReport".to_string())
                .spawn(move || run_reporter_loop(&submitter, &submission_rx, poll_interval, &exit))?
        };

        let block_loop = BlockLoop {
            reporter: EventReporter::new(
                ctx.address,
                ctx.chain.clone(),
                ctx.contract.clone(),
                &config,
                submission_tx.clone(),
            ),
            submissions: submission_tx,
            ctx: ctx.clone(),
            config: config.clone(),
            store: store.clone(),
            ledger: ledger.clone(),
            pending: Vec::new(),
        };
        let rules = {
            let exit = exit.clone();
            Builder::new()
                .name("trv1AccRules".to_string())
                .spawn(move || block_loop.run(misbehaviour_rx, &exit))?
        };

        let message_loop = MessageLoop {
            offchain: OffchainHandler::new(
                ctx.address,
                ctx.chain.clone(),
                ctx.signatures.clone(),
                ctx.network.clone(),
                store.clone(),
                ledger.clone(),
                &config,
            ),
            future: FutureBuffer::new(config.future_msg_buffer),
            ctx,
            config,
            store: store.clone(),
            misbehaviours: misbehaviour_tx,
        };
        let messages = {
            let exit = exit.clone();
            Builder::new()
                .name("trv1AccMsgs".to_string())
                .spawn(move || message_loop.run(events, &exit))?
        };

        Ok(Self {
            exit,
            store,
            ledger,
            threads: vec![messages, rules, reporter],
        })
    }

    pub fn msg_store(&self) -> Arc<RwLock<MsgStore>> {
        self.store.clone()
    }

    pub fn ledger(&self) -> Arc<Mutex<AccusationLedger>> {
        self.ledger.clone()
    }

    /// Raise the exit flag and wait for every worker.
    pub fn stop(self) {
        self.exit.store(true, Ordering::Relaxed);
        for thread in self.threads {
            if thread.join().is_err() {
                error!("FaultDetector: worker thread panicked");
            }
        }
        info!("FaultDetector: stopped");
    }
}

// ---------------------------------------------------------------------------
// Future-height buffer
// ---------------------------------------------------------------------------

/// Messages whose committee is not known yet, replayed once their parent
/// block is imported. When full, the lowest height is evicted first.
#[derive(Debug)]
struct FutureBuffer {
    capacity: usize,
    len: usize,
    heights: BTreeMap<u64, Vec<ConsensusMessage>>,
}

impl FutureBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            len: 0,
            heights: BTreeMap::new(),
        }
    }

    fn push(&mut self, msg: ConsensusMessage) {
        if self.capacity == 0 {
            return;
        }
        while self.len >= self.capacity {
            let Some(mut oldest) = self.heights.first_entry() else {
                break;
            };
            oldest.get_mut().remove(0);
            self.len = self.len.saturating_sub(1);
            if oldest.get().is_empty() {
                oldest.remove();
            }
        }
        self.heights.entry(msg.height()).or_default().push(msg);
        self.len = self.len.saturating_add(1);
    }

    /// Take every message of height `<= height`.
    fn take_up_to(&mut self, height: u64) -> Vec<ConsensusMessage> {
        let later = self.heights.split_off(&height.saturating_add(1));
        let ready: Vec<ConsensusMessage> = std::mem::replace(&mut self.heights, later)
            .into_values()
            .flatten()
            .collect();
        self.len = self.len.saturating_sub(ready.len());
        ready
    }

    fn len(&self) -> usize {
        self.len
    }
}

// ---------------------------------------------------------------------------
// Message loop
// ---------------------------------------------------------------------------

struct MessageLoop {
    ctx: AccountabilityContext,
    config: AccountabilityConfig,
    store: Arc<RwLock<MsgStore>>,
    offchain: OffchainHandler,
    future: FutureBuffer,
    misbehaviours: Sender<AccountabilityEvent>,
}

impl MessageLoop {
    fn run(mut self, events: Receiver<FaultDetectorEvent>, exit: &AtomicBool) {
        let chain_events = self.ctx.chain.subscribe_chain_events();
        let mut last_rate_reset = Instant::now();
        loop {
            if exit.load(Ordering::Relaxed) {
                break;
            }
            if last_rate_reset.elapsed() >= self.config.rate_reset_interval {
                self.offchain.rate_limiter_mut().reset_rate_limiter();
                last_rate_reset = Instant::now();
            }
            select! {
                recv(events) -> event => match event {
                    Ok(event) => self.on_event(event),
                    Err(_) => break,
                },
                recv(chain_events) -> event => match event {
                    Ok(Ok(event)) => self.on_block(event),
                    Ok(Err(err)) => {
                        error!("FaultDetector: message loop {err}");
                        break;
                    }
                    Err(_) => break,
                },
                default(self.config.poll_interval) => {}
            }
        }
        info!("FaultDetector: message loop exiting");
    }

    fn on_event(&mut self, event: FaultDetectorEvent) {
        match event {
            FaultDetectorEvent::Consensus(msg) => self.on_consensus_message(msg),
            FaultDetectorEvent::Accountability {
                payload,
                sender,
                err_tx,
            } => {
                if let Err(err) = self.offchain.handle_payload(&payload, &sender) {
                    info!("FaultDetector: dropping peer {sender}: {err}");
                    if let Some(err_tx) = err_tx {
                        let _ = err_tx.try_send(err);
                    }
                }
            }
        }
    }

    fn on_block(&mut self, event: ChainEvent) {
        for msg in self.future.take_up_to(event.number.saturating_add(1)) {
            self.on_consensus_message(msg);
        }
        if event.number % self.config.msg_gc_interval == 0 {
            let limiter = self.offchain.rate_limiter_mut();
            limiter.reset_height_rate_limiter();
            limiter.reset_peer_justified_accusations();
        }
    }

    fn on_consensus_message(&mut self, msg: ConsensusMessage) {
        let chain = &self.ctx.chain;
        let height = msg.height();
        let current = chain.current_height();
        if current > self.config.height_range
            && height < current.saturating_sub(self.config.height_range)
        {
            debug!("FaultDetector: discarding old message at height {height}");
            return;
        }

        let Some(committee) = chain.committee_at(height) else {
            if height > current {
                trace!("FaultDetector: buffering future message at height {height}");
                self.future.push(msg);
            }
            return;
        };
        if let Err(err) = msg.validate(&committee, self.ctx.signatures.as_ref()) {
            debug!("FaultDetector: invalid message {}: {err}", msg.describe());
            return;
        }

        let proposer = if msg.is_proposal() {
            chain.proposer(height, msg.round())
        } else {
            None
        };
        let outcome = {
            let mut store = self.store.write();
            check_self_incrimination(&mut store, &committee, proposer, msg, self.config.max_round)
        };
        let proofs = match outcome {
            Ok(Incrimination::Clean) => return,
            Ok(Incrimination::Faulty(proofs)) => proofs,
            Err(err) => {
                trace!("FaultDetector: {err}");
                return;
            }
        };
        for proof in proofs {
            warn!(
                "FaultDetector: detected faulty message, rule {} offender index {}",
                proof.rule, proof.offender_index
            );
            let event = match event_from_proof(&proof, &committee, self.ctx.address) {
                Ok(event) => event,
                Err(err) => {
                    error!("FaultDetector: cannot encode proof: {err}");
                    continue;
                }
            };
            if event.offender == self.ctx.address {
                warn!("FaultDetector: found misbehaviour of the local node, check your setup");
                continue;
            }
            if self.misbehaviours.send(event).is_err() {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Block loop
// ---------------------------------------------------------------------------

struct BlockLoop {
    ctx: AccountabilityContext,
    config: AccountabilityConfig,
    store: Arc<RwLock<MsgStore>>,
    ledger: Arc<Mutex<AccusationLedger>>,
    reporter: EventReporter,
    submissions: Sender<AccountabilityEvent>,
    pending: Vec<AccountabilityEvent>,
}

impl BlockLoop {
    fn run(mut self, misbehaviours: Receiver<AccountabilityEvent>, exit: &AtomicBool) {
        let chain_events = self.ctx.chain.subscribe_chain_events();
        let mut accusations = self.ctx.contract.watch_new_accusation(&self.ctx.address);
        loop {
            if exit.load(Ordering::Relaxed) {
                break;
            }
            select! {
                recv(chain_events) -> event => match event {
                    Ok(Ok(event)) => self.on_block(event.number),
                    Ok(Err(err)) => {
                        error!("FaultDetector: block loop {err}");
                        break;
                    }
                    Err(_) => break,
                },
                recv(misbehaviours) -> event => match event {
                    Ok(event) => self.pending.push(event),
                    Err(_) => break,
                },
                recv(accusations) -> accusation => match accusation {
                    Ok(accusation) => self.on_accusation(accusation),
                    Err(_) => accusations = never(),
                },
                default(self.config.poll_interval) => {}
            }
        }
        info!("FaultDetector: block loop exiting, {} events pending", self.pending.len());
    }

    fn on_block(&mut self, number: u64) {
        self.escalate_expired_accusations(number);

        if number > self.config.delta_blocks {
            let checkpoint = number.saturating_sub(self.config.delta_blocks);
            let events = self.run_rule_engine(checkpoint);
            self.pending.extend(events);
            if !self.pending.is_empty() && self.reporter.can_report(checkpoint) {
                let pending = std::mem::take(&mut self.pending);
                self.pending = self.reporter.report_events(pending);
            }
        }

        if number > self.config.height_range && number % self.config.msg_gc_interval == 0 {
            let threshold = number.saturating_sub(self.config.height_range);
            self.store.write().delete_olds(threshold);
            debug!("FaultDetector: message store pruned below height {threshold}");
        }
    }

    fn escalate_expired_accusations(&mut self, number: u64) {
        let expired = self
            .ledger
            .lock()
            .take_expired(number, self.config.accusation_expiry());
        for accusation in expired {
            let height = accusation.message.height();
            let Some(committee) = self.ctx.chain.committee_at(height) else {
                continue;
            };
            match event_from_proof(&accusation, &committee, self.ctx.address) {
                Ok(event) => {
                    info!(
                        "FaultDetector: escalating unanswered accusation {} against {}",
                        event.rule, event.offender
                    );
                    self.pending.push(event);
                }
                Err(err) => error!("FaultDetector: cannot encode accusation: {err}"),
            }
        }
    }

    fn run_rule_engine(&self, height: u64) -> Vec<AccountabilityEvent> {
        let store = self.store.read();
        // Heights before the first buffered one were only partially observed
        // and would raise spurious accusations.
        if store
            .first_height_buffered()
            .map_or(true, |first| height <= first)
        {
            return Vec::new();
        }
        let Some(committee) = self.ctx.chain.committee_at(height) else {
            return Vec::new();
        };
        let chain = &self.ctx.chain;
        let proofs = run_rules_with(&store, &committee, height, &|value, h| {
            chain.is_committed(value, h)
        });
        drop(store);

        let mut events = Vec::with_capacity(proofs.len());
        let mut accused: HashMap<usize, u64> = HashMap::new();
        for proof in proofs {
            let offender = committee.member(proof.offender_index).map(|m| m.address);
            if offender == Some(self.ctx.address) {
                warn!(
                    "FaultDetector: found {} proof against the local node, check your setup",
                    proof.rule
                );
                continue;
            }
            if proof.proof_type == ProofType::Accusation {
                let count = accused.entry(proof.offender_index).or_insert(0);
                if *count < self.config.max_accusations_per_height {
                    send_accusation(&committee, self.ctx.network.as_ref(), &proof);
                    self.ledger.lock().add(proof);
                    *count = count.saturating_add(1);
                } else {
                    debug!(
                        "FaultDetector: discarding accusation, maximum reached for offender index {} at height {height}",
                        proof.offender_index
                    );
                }
                continue;
            }
            info!(
                "FaultDetector: misbehaviour {} at height {height} by offender index {}",
                proof.rule, proof.offender_index
            );
            match event_from_proof(&proof, &committee, self.ctx.address) {
                Ok(event) => events.push(event),
                Err(err) => error!("FaultDetector: cannot encode proof: {err}"),
            }
        }
        events
    }

    fn on_accusation(&mut self, accusation: NewAccusation) {
        warn!("FaultDetector: local node accused on-chain, accusation id {}", accusation.id);
        let proof = match decode_proof(&accusation.raw_proof) {
            Ok(proof) => proof,
            Err(err) => {
                error!("FaultDetector: cannot decode accusation: {err}");
                return;
            }
        };
        let height = proof.message.height();
        let Some(committee) = self.ctx.chain.committee_at(height) else {
            error!("FaultDetector: no committee for accused height {height}");
            return;
        };
        if let Err(err) = verify_proof_signatures(&committee, self.ctx.signatures.as_ref(), &proof) {
            error!("FaultDetector: cannot verify accusation signatures: {err}");
            return;
        }
        let answer = {
            let store = self.store.read();
            innocence_proof(&store, &committee, &proof)
        };
        let event = answer.and_then(|p| {
            event_from_proof(&p, &committee, self.ctx.address).map_err(AccountabilityError::from)
        });
        match event {
            Ok(event) => {
                warn!("FaultDetector: innocence proof found, reporting");
                if self.submissions.send(event).is_err() {
                    error!("FaultDetector: reporter stopped, innocence proof not submitted");
                }
            }
            Err(err) => {
                warn!("************************** SLASHING EVENT **************************");
                warn!("Your local node has been accused of malicious behaviour ({}).", proof.rule);
                warn!("No innocence proof was found: the local node is at high risk of slashing.");
                warn!("********************************************************************");
                error!("FaultDetector: could not answer accusation: {err}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reporter loop
// ---------------------------------------------------------------------------

fn run_reporter_loop(
    submitter: &Submitter,
    submissions: &Receiver<AccountabilityEvent>,
    poll_interval: std::time::Duration,
    exit: &AtomicBool,
) {
    loop {
        if exit.load(Ordering::Relaxed) {
            break;
        }
        match submissions.recv_timeout(poll_interval) {
            Ok(event) => {
                if !submitter.submit(&event) {
                    warn!(
                        "FaultDetector: {:?} event {} against {} was not submitted",
                        event.event_type, event.rule, event.offender
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("FaultDetector: reporter exiting");
}

/// Proofs the block loop would produce for `height` right now. Exposed for
/// diagnostics and tests.
pub fn detect_at_height(
    store: &MsgStore,
    chain: &dyn ChainContext,
    height: u64,
) -> Vec<Proof> {
    match chain.committee_at(height) {
        Some(committee) => {
            run_rules_with(store, &committee, height, &|value, h| chain.is_committed(value, h))
        }
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            codec::encode_proof,
            proof::Rule,
            test_utils::{MockChain, MockContract, MockNetwork, TestCommittee},
        },
        crossbeam_channel::unbounded,
        std::time::Duration,
    };

    #[test]
    fn test_future_buffer_evicts_lowest_height() {
        let tc = TestCommittee::new(4);
        let mut buffer = FutureBuffer::new(3);
        buffer.push(tc.prevote(12, 0, tc.value(1), 0));
        buffer.push(tc.prevote(10, 0, tc.value(1), 0));
        buffer.push(tc.prevote(11, 0, tc.value(1), 0));
        buffer.push(tc.prevote(13, 0, tc.value(1), 0));
        assert_eq!(buffer.len(), 3);

        let ready = buffer.take_up_to(11);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].height(), 11);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.take_up_to(100).len(), 2);
        assert_eq!(buffer.len(), 0);
    }

    struct Harness {
        tc: TestCommittee,
        chain: Arc<MockChain>,
        contract: Arc<MockContract>,
        network: Arc<MockNetwork>,
        events: Sender<FaultDetectorEvent>,
        detector: FaultDetector,
    }

    fn start(me: usize, height: u64) -> Harness {
        let tc = TestCommittee::new(4);
        let chain = Arc::new(MockChain::new(tc.committee.clone(), height));
        let contract = Arc::new(MockContract::default());
        let network = Arc::new(MockNetwork::default());
        let (events, receiver) = unbounded();
        let ctx = AccountabilityContext {
            address: tc.committee.member(me).unwrap().address,
            chain: chain.clone(),
            contract: contract.clone(),
            network: network.clone(),
            signatures: Arc::new(tc.verifier()),
        };
        let detector = FaultDetector::start(
            ctx,
            AccountabilityConfig::dev_default(),
            receiver,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        Harness {
            tc,
            chain,
            contract,
            network,
            events,
            detector,
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_invalid_config_rejected() {
        let tc = TestCommittee::new(4);
        let (_events, receiver) = unbounded();
        let ctx = AccountabilityContext {
            address: tc.committee.member(0).unwrap().address,
            chain: Arc::new(MockChain::new(tc.committee.clone(), 1)),
            contract: Arc::new(MockContract::default()),
            network: Arc::new(MockNetwork::default()),
            signatures: Arc::new(tc.verifier()),
        };
        let config = AccountabilityConfig {
            msg_gc_interval: 0,
            ..AccountabilityConfig::dev_default()
        };
        assert!(matches!(
            FaultDetector::start(ctx, config, receiver, Arc::new(AtomicBool::new(false))),
            Err(FaultDetectorError::Config(_))
        ));
    }

    #[test]
    fn test_messages_stored_and_future_replayed() {
        let h = start(0, 10);
        let v = h.tc.value(1);
        h.events
            .send(FaultDetectorEvent::Consensus(h.tc.prevote(5, 0, v, 1)))
            .unwrap();
        // Parent header 11 unknown yet.
        h.events
            .send(FaultDetectorEvent::Consensus(h.tc.prevote(12, 0, v, 1)))
            .unwrap();
        let store = h.detector.msg_store();
        assert!(wait_for(|| store.read().len() == 1));

        h.chain.import_blocks(11, 1);
        assert!(wait_for(|| store.read().len() == 2));
        h.detector.stop();
    }

    #[test]
    fn test_equivocation_reported_by_slot_reporter() {
        let h = start(0, 86);
        h.events
            .send(FaultDetectorEvent::Consensus(h.tc.prevote(85, 0, h.tc.value(1), 2)))
            .unwrap();
        h.events
            .send(FaultDetectorEvent::Consensus(h.tc.prevote(85, 0, h.tc.value(2), 2)))
            .unwrap();
        let store = h.detector.msg_store();
        assert!(wait_for(|| store.read().len() == 2));
        std::thread::sleep(Duration::from_millis(50));

        // Block 90 runs checkpoint 80, a reporting slot of member 0.
        h.chain.import_blocks(87, 4);
        let contract = h.contract.clone();
        assert!(wait_for(|| !contract.submitted().is_empty()));
        let chunk = &contract.submitted()[0];
        assert_eq!(chunk.event_type, ProofType::Misbehaviour);
        assert_eq!(chunk.rule, Rule::Equivocation);
        assert_eq!(chunk.offender, h.tc.committee.member(2).unwrap().address);
        h.detector.stop();
    }

    #[test]
    fn test_offchain_error_reported_to_p2p_layer() {
        let h = start(0, 10);
        let (err_tx, err_rx) = unbounded();
        h.events
            .send(FaultDetectorEvent::Accountability {
                payload: vec![1, 2, 3],
                sender: h.tc.committee.member(1).unwrap().address,
                err_tx: Some(err_tx),
            })
            .unwrap();
        let err = err_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(err, AccountabilityError::Codec(_)));
        h.detector.stop();
    }

    #[test]
    fn test_onchain_accusation_answered() {
        let h = start(1, 10);
        let v = h.tc.value(1);
        for i in 0..3 {
            h.events
                .send(FaultDetectorEvent::Consensus(h.tc.prevote(5, 0, v, i)))
                .unwrap();
        }
        let store = h.detector.msg_store();
        assert!(wait_for(|| store.read().len() == 3));

        let accusation = Proof::accusation(Rule::C1, h.tc.precommit(5, 0, v, 1), vec![], 1);
        h.contract.accuse(NewAccusation {
            id: 1,
            offender: h.tc.committee.member(1).unwrap().address,
            raw_proof: encode_proof(&accusation).unwrap(),
        });
        let contract = h.contract.clone();
        assert!(wait_for(|| !contract.submitted().is_empty()));
        assert_eq!(contract.submitted()[0].event_type, ProofType::Innocence);
        h.detector.stop();
    }

    #[test]
    fn test_subscription_error_stops_loops() {
        let h = start(0, 10);
        h.chain.fail_subscriptions("disk failure");
        // Both chain-driven loops exit on their own; stop only joins.
        h.detector.stop();
        assert!(h.network.sent().is_empty());
    }

    #[test]
    fn test_detect_at_height() {
        let tc = TestCommittee::new(4);
        let chain = MockChain::new(tc.committee.clone(), 10);
        let mut store = MsgStore::new();
        let other = tc.value(9);
        for i in 0..3 {
            store.save(tc.prevote(5, 0, other, i));
        }
        store.save(tc.precommit(5, 0, tc.value(1), 3));
        let proofs = detect_at_height(&store, &chain, 5);
        assert!(proofs.iter().any(|p| p.rule == Rule::C && p.offender_index == 3));
        assert!(detect_at_height(&store, &chain, 50).is_empty());
    }
}
