//! Accountability configuration.
//!
//! Protocol constants that every node must agree on (retention window,
//! detection delay, reporting slot period) live here next to local tuning
//! knobs (cache sizes, retry delays).

use std::time::Duration;

/// Maximum round a proposal or vote may carry.
pub const MAX_ROUND: i64 = 99;

/// Configuration for the fault detector and its collaborators.
#[derive(Debug, Clone)]
pub struct AccountabilityConfig {
    /// Number of heights of consensus messages kept in the store.
    /// Proofs older than this cannot be verified on-chain.
    /// Default: 256.
    pub height_range: u64,

    /// Blocks to wait before running the rule engine over a height, giving
    /// late messages time to arrive.
    /// Default: 10.
    pub delta_blocks: u64,

    /// Period, in blocks, for garbage-collecting the store and resetting the
    /// per-height rate limiter.
    /// Default: 60.
    pub msg_gc_interval: u64,

    /// Blocks an off-chain accusation is given to be answered before it is
    /// escalated on-chain (counted on top of `delta_blocks`).
    /// Default: 10.
    pub offchain_accusation_window: u64,

    /// Maximum accusations raised against, or accepted from, a single peer
    /// per height.
    /// Default: 4.
    pub max_accusations_per_height: u64,

    /// Capacity of the innocence-proof cache.
    /// Default: 480.
    pub innocence_cache_size: usize,

    /// Length in blocks of a reporting slot.
    /// Default: 20.
    pub reporting_slot_period: u64,

    /// Confirmation polls per submitted chunk before giving up.
    /// Default: 100.
    pub max_submission_attempts: u32,

    /// Delay between confirmation polls.
    /// Default: 1s.
    pub submission_delay: Duration,

    /// Initial chunk size for on-chain submission, in bytes.
    /// Default: 32 KiB.
    pub chunk_size: usize,

    /// Smallest chunk size tried when the contract rejects a chunk.
    /// Default: 16 KiB.
    pub min_chunk_size: usize,

    /// Highest valid consensus round.
    /// Default: 99.
    pub max_round: i64,

    /// Capacity of the buffer holding messages whose parent header is not
    /// yet known.
    /// Default: 1000.
    pub future_msg_buffer: usize,

    /// Window of the per-peer accusation rate limiter.
    /// Default: 1s.
    pub rate_reset_interval: Duration,

    /// Poll interval used by the worker loops to observe the exit flag.
    /// Default: 50ms.
    pub poll_interval: Duration,

    /// Gas charged per started KiB of proof by the verification contracts.
    /// Default: 1000.
    pub gas_per_kb: u64,
}

impl Default for AccountabilityConfig {
    fn default() -> Self {
        Self {
            height_range: 256,
            delta_blocks: 10,
            msg_gc_interval: 60,
            offchain_accusation_window: 10,
            max_accusations_per_height: 4,
            innocence_cache_size: 120 * 4,
            reporting_slot_period: 20,
            max_submission_attempts: 100,
            submission_delay: Duration::from_secs(1),
            chunk_size: 32 * 1024,
            min_chunk_size: 16 * 1024,
            max_round: MAX_ROUND,
            future_msg_buffer: 1000,
            rate_reset_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            gas_per_kb: 1000,
        }
    }
}

impl AccountabilityConfig {
    /// Short timings for tests and local clusters.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            max_submission_attempts: 5,
            submission_delay: Duration::from_millis(5),
            rate_reset_interval: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            ..Self::default()
        }
    }

    /// Age, in blocks, after which an unanswered accusation is escalated.
    pub fn accusation_expiry(&self) -> u64 {
        self.delta_blocks
            .saturating_add(self.offchain_accusation_window)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.height_range <= self.delta_blocks {
            return Err(ConfigError::InvalidHeightRange {
                height_range: self.height_range,
                delta_blocks: self.delta_blocks,
            });
        }
        if self.msg_gc_interval == 0 {
            return Err(ConfigError::ZeroInterval("msg_gc_interval"));
        }
        if self.reporting_slot_period == 0 {
            return Err(ConfigError::ZeroInterval("reporting_slot_period"));
        }
        if self.max_accusations_per_height == 0 {
            return Err(ConfigError::ZeroInterval("max_accusations_per_height"));
        }
        if self.min_chunk_size == 0 || self.min_chunk_size > self.chunk_size {
            return Err(ConfigError::InvalidChunkSize {
                chunk_size: self.chunk_size,
                min_chunk_size: self.min_chunk_size,
            });
        }
        if self.max_round < 0 {
            return Err(ConfigError::InvalidMaxRound(self.max_round));
        }
        if self.innocence_cache_size == 0 {
            return Err(ConfigError::ZeroInterval("innocence_cache_size"));
        }
        Ok(())
    }
}

/// Errors in accountability configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("height_range ({height_range}) must exceed delta_blocks ({delta_blocks})")]
    InvalidHeightRange { height_range: u64, delta_blocks: u64 },
    #[error("{0} must be > 0")]
    ZeroInterval(&'static str),
    #[error("min_chunk_size ({min_chunk_size}) must be in 1..=chunk_size ({chunk_size})")]
    InvalidChunkSize {
        chunk_size: usize,
        min_chunk_size: usize,
    },
    #[error("max_round must be >= 0, got {0}")]
    InvalidMaxRound(i64),
}
