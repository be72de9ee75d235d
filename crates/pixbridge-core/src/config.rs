//! Runtime configuration for the decode and scale services.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alloc::RetryPolicy;

/// Errors raised by [`BridgeConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric setting that must be positive was zero.
    #[error("Configuration value `{0}` must be greater than zero")]
    Zero(&'static str),
}

/// How source bytes reach the decoding engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Stream through a live pipe. The feeder runs on its own thread so the
    /// caller can start the engine while bytes are still arriving.
    #[default]
    Pipe,
    /// Spool into a per-session staging file first. The feeder runs inline
    /// on the caller's thread and the engine reads the file afterwards.
    Staging,
}

impl TransferMode {
    /// Whether the engine should spool input to a staging file.
    pub fn uses_staging(self) -> bool {
        matches!(self, TransferMode::Staging)
    }
}

/// Settings shared by every decode and scale request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Number of decode sessions the engine may run at once.
    pub max_sessions: usize,
    /// Number of scale sessions the scaling engine may run at once.
    pub scale_sessions: usize,
    /// Transfer mode used for every decode session.
    pub transfer: TransferMode,
    /// Bytes read from the source per feeder iteration.
    pub feed_block_size: usize,
    /// The feeder yields the scheduler after this many blocks.
    pub yield_every_blocks: u32,
    /// Target capacity of one pixel chunk, in pixels.
    pub chunk_memory_limit: usize,
    /// Allocation attempts for a contiguous buffer before giving up.
    pub alloc_attempts: u32,
    /// Upper bound on reclamation passes after one failed allocation.
    pub reclaim_rounds: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            scale_sessions: 10,
            transfer: TransferMode::Pipe,
            feed_block_size: 8192,
            yield_every_blocks: 5,
            chunk_memory_limit: 3_000_000,
            alloc_attempts: 10,
            reclaim_rounds: 20,
        }
    }
}

impl BridgeConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that every sizing value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("max_sessions", self.max_sessions == 0),
            ("scale_sessions", self.scale_sessions == 0),
            ("feed_block_size", self.feed_block_size == 0),
            ("yield_every_blocks", self.yield_every_blocks == 0),
            ("chunk_memory_limit", self.chunk_memory_limit == 0),
            ("alloc_attempts", self.alloc_attempts == 0),
        ];
        match checks.iter().find(|(_, zero)| *zero) {
            Some((name, _)) => Err(ConfigError::Zero(*name)),
            None => Ok(()),
        }
    }

    /// Retry policy for contiguous allocations.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.alloc_attempts,
            reclaim_rounds: self.reclaim_rounds,
        }
    }
}
