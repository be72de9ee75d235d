//! Fallible pixel allocation with bounded reclamation retries.
//!
//! Large decode buffers are allocated with [`Vec::try_reserve_exact`] so that
//! an exhausted heap surfaces as an error instead of aborting the process.
//! Every request is first offered to a [`MemoryProbe`], which lets the host
//! veto allocations (a memory budget, or fault injection in tests) and run a
//! reclamation pass (dropping caches, trimming pools) before a retry.
//!
//! # Retry policy
//!
//! A failed contiguous allocation is retried up to [`RetryPolicy::attempts`]
//! times. Between attempts the probe is asked to reclaim memory repeatedly
//! while each pass reports more free memory than the last, capped at
//! [`RetryPolicy::reclaim_rounds`] passes. Contiguous requests never shrink;
//! the chunk allocator in [`crate::decode::ChunkedPixelBuffer`] shrinks its
//! chunk size instead.

use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised when a pixel buffer cannot be allocated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The allocation still failed after every permitted retry.
    #[error("Out of memory allocating {requested} elements")]
    OutOfMemory { requested: usize },
}

/// A single refused allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocFailure {
    /// Bytes that were requested.
    pub bytes: usize,
}

/// Host hook consulted before every pixel allocation.
pub trait MemoryProbe: Send + Sync {
    /// Decide whether `bytes` may be allocated now.
    fn admit(&self, bytes: usize) -> Result<(), AllocFailure>;

    /// Release whatever memory the host can give back.
    fn reclaim(&self) {}

    /// Free memory in bytes, if the host can measure it.
    fn free_bytes(&self) -> Option<u64> {
        None
    }
}

/// Probe that admits everything; only the global allocator can refuse.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemory;

impl MemoryProbe for SystemMemory {
    fn admit(&self, _bytes: usize) -> Result<(), AllocFailure> {
        Ok(())
    }
}

/// Bounds for retrying a failed contiguous allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total allocation attempts.
    pub attempts: u32,
    /// Maximum reclamation passes after one failure.
    pub reclaim_rounds: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            reclaim_rounds: 20,
        }
    }
}

/// Try once to allocate `len` default-initialised elements.
pub fn try_allocate<T: Copy + Default>(probe: &dyn MemoryProbe, len: usize) -> Result<Vec<T>, AllocFailure> {
    let bytes = len.saturating_mul(std::mem::size_of::<T>());
    probe.admit(bytes)?;

    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| AllocFailure { bytes })?;
    buffer.resize(len, T::default());
    Ok(buffer)
}

/// Allocate a contiguous buffer, retrying after reclamation.
///
/// # Errors
///
/// Returns `AllocError::OutOfMemory` once `policy.attempts` allocations have
/// all been refused.
pub fn allocate_flat<T: Copy + Default>(
    probe: &dyn MemoryProbe,
    len: usize,
    policy: RetryPolicy,
) -> Result<Vec<T>, AllocError> {
    for attempt in 1..=policy.attempts {
        match try_allocate(probe, len) {
            Ok(buffer) => {
                if attempt > 1 {
                    debug!(len, attempt, "Allocation succeeded after retry");
                }
                return Ok(buffer);
            }
            Err(failure) if attempt < policy.attempts => {
                warn!(bytes = failure.bytes, attempt, "Allocation refused, reclaiming memory");
                reclaim_until_stable(probe, policy.reclaim_rounds);
            }
            Err(failure) => {
                warn!(bytes = failure.bytes, attempt, "Allocation refused, no attempts left");
            }
        }
    }
    Err(AllocError::OutOfMemory { requested: len })
}

/// Run reclamation passes while they keep freeing memory.
///
/// Returns the number of passes performed, never more than `max_rounds`.
pub fn reclaim_until_stable(probe: &dyn MemoryProbe, max_rounds: u32) -> u32 {
    let mut free = None;
    let mut rounds = 0;

    while rounds < max_rounds {
        let was_free = free;
        probe.reclaim();
        free = probe.free_bytes();
        rounds += 1;

        let improved = matches!((was_free, free), (Some(before), Some(after)) if after > before);
        if rounds > 1 && !improved {
            break;
        }
    }
    rounds
}
