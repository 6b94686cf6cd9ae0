//! Per-height store of validated consensus messages.
//!
//! Messages live in one bucket per height. Each bucket keeps the messages in
//! insertion order together with a per-round index of slots split by message
//! code, so round/code queries do not scan the whole height. Dropping a
//! height drops its bucket.

use {
    crate::message::{ConsensusMessage, MessageCode},
    solana_hash::Hash,
    std::collections::{BTreeMap, HashSet},
};

#[derive(Debug, Default)]
struct HeightBucket {
    /// Messages in insertion order.
    messages: Vec<ConsensusMessage>,
    hashes: HashSet<Hash>,
    /// round -> per-code slots into `messages`.
    rounds: BTreeMap<i64, [Vec<usize>; MessageCode::COUNT]>,
}

impl HeightBucket {
    fn slots(&self, round: i64, code: MessageCode) -> impl Iterator<Item = &ConsensusMessage> {
        self.rounds
            .get(&round)
            .map(|codes| codes[code.index()].as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(|slot| self.messages.get(*slot))
    }
}

/// Store of consensus messages for the heights under accountability.
///
/// Saving is idempotent per message hash; equivocated variants are distinct
/// messages and are all kept.
#[derive(Debug, Default)]
pub struct MsgStore {
    heights: BTreeMap<u64, HeightBucket>,
    first_height: Option<u64>,
}

impl MsgStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `msg`. Returns `false` if the exact message was already stored.
    pub fn save(&mut self, msg: ConsensusMessage) -> bool {
        let height = msg.height();
        let hash = msg.hash();
        let bucket = self.heights.entry(height).or_default();
        if !bucket.hashes.insert(hash) {
            return false;
        }
        if self.first_height.is_none() {
            self.first_height = Some(height);
        }
        let slot = bucket.messages.len();
        bucket
            .rounds
            .entry(msg.round())
            .or_default()[msg.code().index()]
            .push(slot);
        bucket.messages.push(msg);
        true
    }

    /// Whether a message with this hash is stored at `height`.
    pub fn contains(&self, height: u64, hash: &Hash) -> bool {
        self.heights
            .get(&height)
            .map(|b| b.hashes.contains(hash))
            .unwrap_or(false)
    }

    /// Messages at `height` matching `pred`, in insertion order.
    pub fn get<F>(&self, height: u64, pred: F) -> Vec<ConsensusMessage>
    where
        F: Fn(&ConsensusMessage) -> bool,
    {
        self.heights
            .get(&height)
            .map(|b| b.messages.iter().filter(|m| pred(m)).cloned().collect())
            .unwrap_or_default()
    }

    /// Messages at `height` signed by committee member `signer` and matching
    /// `pred`, in insertion order.
    pub fn get_from<F>(&self, height: u64, signer: usize, pred: F) -> Vec<ConsensusMessage>
    where
        F: Fn(&ConsensusMessage) -> bool,
    {
        self.get(height, |m| m.is_signed_by(signer) && pred(m))
    }

    /// Messages of kind `code` at `(height, round)`, in insertion order.
    pub fn get_round(&self, height: u64, round: i64, code: MessageCode) -> Vec<ConsensusMessage> {
        self.heights
            .get(&height)
            .map(|b| b.slots(round, code).cloned().collect())
            .unwrap_or_default()
    }

    /// Messages from `signer` with the same `(height, round, code)` but a
    /// value other than `value`. Proposals and light proposals are checked
    /// together.
    pub fn equivocated_votes(
        &self,
        height: u64,
        round: i64,
        code: MessageCode,
        signer: usize,
        value: &Hash,
    ) -> Vec<ConsensusMessage> {
        let Some(bucket) = self.heights.get(&height) else {
            return Vec::new();
        };
        let codes: &[MessageCode] = match code {
            MessageCode::Proposal | MessageCode::LightProposal => {
                &[MessageCode::Proposal, MessageCode::LightProposal]
            }
            MessageCode::Prevote => &[MessageCode::Prevote],
            MessageCode::Precommit => &[MessageCode::Precommit],
        };
        codes
            .iter()
            .flat_map(|c| bucket.slots(round, *c))
            .filter(|m| m.is_signed_by(signer) && m.value() != *value)
            .cloned()
            .collect()
    }

    /// Drop every height below `threshold`.
    pub fn delete_olds(&mut self, threshold: u64) {
        self.heights = self.heights.split_off(&threshold);
    }

    /// Height of the first message saved by this process.
    pub fn first_height_buffered(&self) -> Option<u64> {
        self.first_height
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.heights.values().map(|b| b.messages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.heights.is_empty()
    }
}
