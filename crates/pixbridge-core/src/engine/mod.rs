//! The synchronous decoding engine boundary.
//!
//! A decoding engine is an opaque, stateful service addressed by a small
//! session id. Callers drive each session through a strict sequence:
//!
//! ```text
//! begin_session -> feed* -> start -> width/height/component_count
//!               -> next_row (height times) -> end_session
//! ```
//!
//! Feeding and row retrieval may overlap in wall-clock time (the feeder runs
//! on its own thread in pipe mode), but rows are only requested after
//! `start` has returned. `end_session` is always called, on success and on
//! failure, and must tolerate sessions that never got past `begin_session`.
//!
//! The boundary is a trait so the orchestration layer can be driven by
//! [`image_backend::ImageCrateEngine`] in production and by scripted fakes
//! in tests.

pub mod image_backend;

use thiserror::Error;

use crate::pool::SessionId;

pub use image_backend::ImageCrateEngine;

/// Faults reported across the engine boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineFault {
    /// A session call arrived before `initialize`.
    #[error("Engine has not been initialised")]
    NotInitialised,

    /// `initialize` was called twice.
    #[error("Engine is already initialised")]
    AlreadyInitialised,

    /// The format tag is not one the engine can decode.
    #[error("Unknown image format: '{0}'")]
    UnknownFormat(String),

    /// The session id is out of range or was never begun.
    #[error("Session {0} is not active")]
    InactiveSession(SessionId),

    /// Session setup failed.
    #[error("Session setup failed: {0}")]
    Init(String),

    /// The image header could not be parsed.
    #[error("Header fault: {0}")]
    Header(String),

    /// A row could not be produced.
    #[error("Row fault: {0}")]
    Row(String),

    /// Input could not be delivered to the session.
    #[error("Transfer fault: {0}")]
    Transfer(String),

    /// The scaling engine failed.
    #[error("Scale fault: {0}")]
    Scale(String),
}

/// One unit of input delivered through [`DecodeEngine::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedBlock<'a> {
    /// Source bytes.
    Data(&'a [u8]),
    /// End of input. Sent exactly once per session.
    End,
}

impl FeedBlock<'_> {
    /// Returns true for the terminal signal.
    pub fn is_end(&self) -> bool {
        matches!(self, FeedBlock::End)
    }
}

/// A synchronous, session-addressed image decoding engine.
///
/// Implementations must be shareable across threads: distinct sessions are
/// driven concurrently, and within one session the feeder thread calls
/// `feed` while the owning thread blocks in `start`.
pub trait DecodeEngine: Send + Sync {
    /// Prepare per-session state for `max_sessions` sessions. Called once.
    fn initialize(&self, max_sessions: usize) -> Result<(), EngineFault>;

    /// Format tags (mime subtypes such as `"png"`) the engine decodes.
    fn supported_formats(&self) -> Vec<String>;

    /// Begin a session for `format`, spooling input to a staging file when
    /// `use_staging` is set instead of streaming through a pipe.
    fn begin_session(&self, session: SessionId, format: &str, use_staging: bool) -> Result<(), EngineFault>;

    /// Deliver input. The session sees exactly one [`FeedBlock::End`].
    fn feed(&self, session: SessionId, block: FeedBlock<'_>) -> Result<(), EngineFault>;

    /// Block until the header is parsed. Dimensions are valid afterwards.
    fn start(&self, session: SessionId) -> Result<(), EngineFault>;

    fn width(&self, session: SessionId) -> Result<u32, EngineFault>;

    fn height(&self, session: SessionId) -> Result<u32, EngineFault>;

    fn component_count(&self, session: SessionId) -> Result<usize, EngineFault>;

    /// Fill `row` with the next row of packed pixels.
    ///
    /// `row` holds at least `width` elements. Fails with
    /// [`EngineFault::Row`] once `height` rows have been returned.
    fn next_row(&self, session: SessionId, row: &mut [u32]) -> Result<(), EngineFault>;

    /// Release all per-session resources. Never fails.
    fn end_session(&self, session: SessionId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_block_end() {
        assert!(FeedBlock::End.is_end());
        assert!(!FeedBlock::Data(&[1, 2]).is_end());
    }

    #[test]
    fn test_fault_display() {
        let fault = EngineFault::UnknownFormat("xcf".to_string());
        assert_eq!(fault.to_string(), "Unknown image format: 'xcf'");

        let fault = EngineFault::InactiveSession(SessionId::new(3));
        assert_eq!(fault.to_string(), "Session #3 is not active");
    }
}
