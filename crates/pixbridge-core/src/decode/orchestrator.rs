//! Decode orchestration: one request from source stream to assembled image.
//!
//! Every request walks the same state machine:
//!
//! ```text
//! Idle -> SessionAcquired -> Feeding -> HeaderReady -> RowsStreaming -> Complete
//!                 \______________\___________\______________\
//!                                                             -> Failed
//! ```
//!
//! Whatever happens after the session is acquired, cleanup runs in this
//! order: cancel the feeder if the request failed, `end_session` on the
//! engine, wait for the feeder to finish, release the session.

use std::collections::BTreeSet;
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::Arc;

use tracing::{debug, error, info};

use super::chunked::ChunkedPixelBuffer;
use super::feeder::{FeederHandle, StreamFeeder};
use super::types::{DecodeError, DecodedImage, OutputShape, PixelData};
use crate::alloc::{allocate_flat, MemoryProbe, SystemMemory};
use crate::config::BridgeConfig;
use crate::engine::DecodeEngine;
use crate::pixels::PixelLayout;
use crate::pool::{SessionId, SessionPool};

/// Progress of one decode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Idle,
    SessionAcquired,
    Feeding,
    HeaderReady,
    RowsStreaming,
    Complete,
    Failed,
}

impl DecodeState {
    /// Returns true for `Complete` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, DecodeState::Complete | DecodeState::Failed)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_advance_to(self, next: DecodeState) -> bool {
        use DecodeState::*;
        match (self, next) {
            (Idle, SessionAcquired)
            | (SessionAcquired, Feeding)
            | (Feeding, HeaderReady)
            | (HeaderReady, RowsStreaming)
            | (RowsStreaming, Complete) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Tracks and logs the state of one request.
struct Progress {
    session: SessionId,
    state: DecodeState,
}

impl Progress {
    fn new(session: SessionId) -> Self {
        let mut progress = Self {
            session,
            state: DecodeState::Idle,
        };
        progress.advance(DecodeState::SessionAcquired);
        progress
    }

    fn advance(&mut self, next: DecodeState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        debug!(session = %self.session, from = ?self.state, to = ?next, "Decode state");
        self.state = next;
    }
}

/// Runs decode requests against a shared engine and session pool.
///
/// Cheap to clone; clones share the engine, pool and configuration.
pub struct DecodeOrchestrator<E: ?Sized> {
    engine: Arc<E>,
    pool: Arc<SessionPool>,
    probe: Arc<dyn MemoryProbe>,
    formats: Arc<BTreeSet<String>>,
    config: Arc<BridgeConfig>,
}

impl<E: ?Sized> Clone for DecodeOrchestrator<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            pool: Arc::clone(&self.pool),
            probe: Arc::clone(&self.probe),
            formats: Arc::clone(&self.formats),
            config: Arc::clone(&self.config),
        }
    }
}

impl<E: DecodeEngine + ?Sized + 'static> DecodeOrchestrator<E> {
    /// Validate `config`, initialise the engine and build the session pool.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::InitFault` if the configuration is invalid or
    /// the engine refuses initialisation (including a second initialisation).
    pub fn new(engine: Arc<E>, config: BridgeConfig) -> Result<Self, DecodeError> {
        config
            .validate()
            .map_err(|e| DecodeError::InitFault(e.to_string()))?;
        engine
            .initialize(config.max_sessions)
            .map_err(|fault| DecodeError::InitFault(fault.to_string()))?;

        let formats: BTreeSet<String> = engine
            .supported_formats()
            .into_iter()
            .map(|f| f.to_ascii_lowercase())
            .collect();

        info!(
            sessions = config.max_sessions,
            transfer = ?config.transfer,
            formats = formats.len(),
            "Decode orchestrator ready"
        );

        Ok(Self {
            engine,
            pool: Arc::new(SessionPool::new("decode", config.max_sessions)),
            probe: Arc::new(SystemMemory),
            formats: Arc::new(formats),
            config: Arc::new(config),
        })
    }

    /// Replace the memory probe consulted for pixel buffers.
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Format tags accepted by [`decode`](Self::decode), lowercased.
    pub fn supported_formats(&self) -> impl Iterator<Item = &str> {
        self.formats.iter().map(String::as_str)
    }

    /// Case-insensitive check of a format tag.
    pub fn supports(&self, format: &str) -> bool {
        self.formats.contains(&format.to_ascii_lowercase())
    }

    /// Decode an in-memory encoded image.
    pub fn decode_bytes(
        &self,
        bytes: Vec<u8>,
        format: &str,
        shape: OutputShape,
    ) -> Result<DecodedImage, DecodeError> {
        self.decode(Cursor::new(bytes), format, shape)
    }

    /// Decode `source` as `format` into the requested shape.
    ///
    /// Blocks until a session is free. The session is released before this
    /// returns, on every path.
    ///
    /// # Errors
    ///
    /// - `DecodeError::UnsupportedFormat` if the engine does not list `format`
    /// - `DecodeError::InitFault` if the engine session cannot be set up
    /// - `DecodeError::DecodeFault` if the engine fails on the header or a row
    /// - `DecodeError::OutOfMemory` if pixel storage cannot be allocated
    /// - `DecodeError::IoFault` if the source fails before yielding any data
    pub fn decode<R: Read + Send + 'static>(
        &self,
        source: R,
        format: &str,
        shape: OutputShape,
    ) -> Result<DecodedImage, DecodeError> {
        let tag = format.to_ascii_lowercase();
        if !self.formats.contains(&tag) {
            return Err(DecodeError::UnsupportedFormat(format.to_string()));
        }

        let lease = self.pool.lease();
        let session = lease.id();
        let mut progress = Progress::new(session);
        let mut feeder = None;

        let result = self.drive(session, source, &tag, shape, &mut progress, &mut feeder);

        if result.is_err() {
            progress.advance(DecodeState::Failed);
            if let Some(handle) = &feeder {
                handle.cancel();
            }
        }
        self.engine.end_session(session);
        let outcome = feeder.map(FeederHandle::wait);
        if let Err(e) = lease.release() {
            error!(session = %session, error = %e, "Failed to release decode session");
        }

        match (result, outcome) {
            (Err(_), Some(outcome)) if outcome.failed_before_data() => Err(DecodeError::IoFault(
                outcome.read_error.unwrap_or_default(),
            )),
            (result, _) => result,
        }
    }

    fn drive<R: Read + Send + 'static>(
        &self,
        session: SessionId,
        source: R,
        tag: &str,
        shape: OutputShape,
        progress: &mut Progress,
        feeder: &mut Option<FeederHandle>,
    ) -> Result<DecodedImage, DecodeError> {
        let staging = self.config.transfer.uses_staging();
        self.engine
            .begin_session(session, tag, staging)
            .map_err(|fault| DecodeError::InitFault(fault.to_string()))?;
        progress.advance(DecodeState::Feeding);

        let stream = StreamFeeder::new(Arc::clone(&self.engine), session, &self.config);
        let handle = if staging {
            stream.run(source)
        } else {
            stream
                .spawn(source)
                .map_err(|e| DecodeError::InitFault(format!("Failed to spawn feeder: {e}")))?
        };
        *feeder = Some(handle);

        self.engine.start(session)?;
        let width = self.engine.width(session)?;
        let height = self.engine.height(session)?;
        let components = self.engine.component_count(session)?;
        let layout = PixelLayout::from_components(components).ok_or_else(|| {
            DecodeError::DecodeFault(format!("Unsupported component count: {components}"))
        })?;
        if width == 0 || height == 0 {
            return Err(DecodeError::DecodeFault(format!(
                "Invalid dimensions {width}x{height}"
            )));
        }
        progress.advance(DecodeState::HeaderReady);
        debug!(session = %session, width, height, ?layout, ?shape, "Header parsed");

        progress.advance(DecodeState::RowsStreaming);
        let pixels = match shape {
            OutputShape::Producer => PixelData::Chunked(self.pull_chunked(session, width, height)?),
            OutputShape::Raster => PixelData::Packed(self.pull_packed(session, width, height)?),
            OutputShape::Bytes => PixelData::Bytes(self.pull_bytes(session, width, height, layout)?),
        };
        progress.advance(DecodeState::Complete);

        Ok(DecodedImage {
            width,
            height,
            layout,
            pixels,
        })
    }

    fn pull_chunked(&self, session: SessionId, width: u32, height: u32) -> Result<ChunkedPixelBuffer, DecodeError> {
        let mut buffer = ChunkedPixelBuffer::allocate(
            width,
            height,
            self.config.chunk_memory_limit,
            self.probe.as_ref(),
            self.config.retry_policy(),
        )?;
        let mut row = vec![0u32; width as usize];
        for y in 0..height {
            self.engine.next_row(session, &mut row)?;
            buffer.set_row(y, &row)?;
        }
        Ok(buffer)
    }

    fn pull_packed(&self, session: SessionId, width: u32, height: u32) -> Result<Vec<u32>, DecodeError> {
        let len = (width as usize)
            .checked_mul(height as usize)
            .ok_or(DecodeError::OutOfMemory)?;
        let mut data: Vec<u32> = allocate_flat(self.probe.as_ref(), len, self.config.retry_policy())?;
        for row in data.chunks_exact_mut(width as usize) {
            self.engine.next_row(session, row)?;
        }
        Ok(data)
    }

    fn pull_bytes(
        &self,
        session: SessionId,
        width: u32,
        height: u32,
        layout: PixelLayout,
    ) -> Result<Vec<u8>, DecodeError> {
        let stride = (width as usize)
            .checked_mul(layout.components())
            .ok_or(DecodeError::OutOfMemory)?;
        let len = stride.checked_mul(height as usize).ok_or(DecodeError::OutOfMemory)?;
        let mut data: Vec<u8> = allocate_flat(self.probe.as_ref(), len, self.config.retry_policy())?;
        let mut row = vec![0u32; width as usize];
        for dst in data.chunks_exact_mut(stride) {
            self.engine.next_row(session, &mut row)?;
            layout.unpack_row(&row, dst);
        }
        Ok(data)
    }
}

impl<E: ?Sized> fmt::Debug for DecodeOrchestrator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeOrchestrator")
            .field("pool", &self.pool)
            .field("formats", &self.formats)
            .field("config", &self.config)
            .finish()
    }
}
