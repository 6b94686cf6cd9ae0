//! Flood protection for the off-chain accusation protocol.

use {
    crate::error::{AccountabilityError, Result},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    std::collections::{HashMap, HashSet},
};

/// Per-sender counters guarding the off-chain accusation handler.
///
/// The time-window counter is reset every second by the message loop; the
/// per-height counters and the processed-payload sets every
/// `msg_gc_interval` blocks.
#[derive(Debug)]
pub struct AccusationRateLimiter {
    max_per_height: u64,
    /// Accusations received in the current time window.
    rates: HashMap<Pubkey, u64>,
    accusations_per_height: HashMap<Pubkey, HashMap<u64, u64>>,
    processed: HashMap<Pubkey, HashSet<Hash>>,
}

impl AccusationRateLimiter {
    pub fn new(max_per_height: u64) -> Self {
        Self {
            max_per_height,
            rates: HashMap::new(),
            accusations_per_height: HashMap::new(),
            processed: HashMap::new(),
        }
    }

    /// Count a payload from `sender` in the current window.
    ///
    /// Late deliveries after a reconnect can legitimately exceed one height's
    /// worth of accusations, so the window allows twice the per-height limit.
    pub fn check_rate(&mut self, sender: &Pubkey) -> Result<()> {
        let limit = self.max_per_height.saturating_mul(2);
        let count = self.rates.entry(*sender).or_insert(0);
        if *count >= limit {
            return Err(AccountabilityError::AccusationRateMalicious);
        }
        *count = count.saturating_add(1);
        Ok(())
    }

    /// Reject a payload `sender` already sent since the last reset.
    pub fn check_duplicated(&mut self, sender: &Pubkey, payload_hash: Hash) -> Result<()> {
        if self.processed.entry(*sender).or_default().insert(payload_hash) {
            Ok(())
        } else {
            Err(AccountabilityError::PeerDuplicatedAccusation)
        }
    }

    /// Count an accusation from `sender` about a message at `height`.
    pub fn check_height_rate(&mut self, sender: &Pubkey, height: u64) -> Result<()> {
        let count = self
            .accusations_per_height
            .entry(*sender)
            .or_default()
            .entry(height)
            .or_insert(0);
        *count = count.saturating_add(1);
        if *count > self.max_per_height {
            return Err(AccountabilityError::AccusationRateMalicious);
        }
        Ok(())
    }

    pub fn reset_rate_limiter(&mut self) {
        self.rates.clear();
    }

    pub fn reset_height_rate_limiter(&mut self) {
        self.accusations_per_height.clear();
    }

    pub fn reset_peer_justified_accusations(&mut self) {
        self.processed.clear();
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::test_utils::random_pubkey, test_case::test_case};

    #[test_case(1; "max one")]
    #[test_case(4; "default max")]
    fn test_window_rate_errors_on_call_after_twice_max(max: u64) {
        let mut limiter = AccusationRateLimiter::new(max);
        let peer = random_pubkey();
        for _ in 0..max * 2 {
            assert!(limiter.check_rate(&peer).is_ok());
        }
        assert!(matches!(
            limiter.check_rate(&peer),
            Err(AccountabilityError::AccusationRateMalicious)
        ));
        // Other peers are counted separately.
        assert!(limiter.check_rate(&random_pubkey()).is_ok());

        limiter.reset_rate_limiter();
        assert!(limiter.check_rate(&peer).is_ok());
    }

    #[test]
    fn test_height_rate() {
        let mut limiter = AccusationRateLimiter::new(4);
        let peer = random_pubkey();
        for _ in 0..4 {
            assert!(limiter.check_height_rate(&peer, 10).is_ok());
        }
        assert!(limiter.check_height_rate(&peer, 10).is_err());
        assert!(limiter.check_height_rate(&peer, 11).is_ok());
        limiter.reset_height_rate_limiter();
        assert!(limiter.check_height_rate(&peer, 10).is_ok());
    }

    #[test]
    fn test_duplicated_payload() {
        let mut limiter = AccusationRateLimiter::new(4);
        let peer = random_pubkey();
        let hash = solana_sha256_hasher::hash(b"accusation");
        assert!(limiter.check_duplicated(&peer, hash).is_ok());
        assert!(matches!(
            limiter.check_duplicated(&peer, hash),
            Err(AccountabilityError::PeerDuplicatedAccusation)
        ));
        assert!(limiter.check_duplicated(&random_pubkey(), hash).is_ok());
        limiter.reset_peer_justified_accusations();
        assert!(limiter.check_duplicated(&peer, hash).is_ok());
    }
}
