//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::alloc::{AllocFailure, MemoryProbe};
use crate::decode::PixelConsumer;
use crate::engine::{DecodeEngine, EngineFault, FeedBlock};
use crate::pixels::{ByteImage, PixelLayout};
use crate::pool::SessionId;
use crate::scale::ScaleEngine;

// =============================================================================
// Memory
// =============================================================================

/// Memory probe with scripted refusals.
#[derive(Debug, Default)]
pub struct FailingMemory {
    fail_first: u32,
    cap_bytes: Option<usize>,
    growing_free: Option<u32>,
    admissions: AtomicU32,
    reclaims: AtomicU32,
}

impl FailingMemory {
    /// Refuse the first `k` admissions, then admit everything.
    pub fn fail_first(k: u32) -> Self {
        Self {
            fail_first: k,
            ..Self::default()
        }
    }

    /// Refuse any single request larger than `bytes`.
    pub fn cap_bytes(bytes: usize) -> Self {
        Self {
            cap_bytes: Some(bytes),
            ..Self::default()
        }
    }

    /// Report free memory that grows with each reclaim, up to `passes` reclaims.
    pub fn with_growing_free_memory(mut self, passes: u32) -> Self {
        self.growing_free = Some(passes);
        self
    }

    pub fn admissions(&self) -> u32 {
        self.admissions.load(Ordering::SeqCst)
    }

    pub fn reclaims(&self) -> u32 {
        self.reclaims.load(Ordering::SeqCst)
    }
}

impl MemoryProbe for FailingMemory {
    fn admit(&self, bytes: usize) -> Result<(), AllocFailure> {
        let attempt = self.admissions.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(AllocFailure { bytes });
        }
        match self.cap_bytes {
            Some(cap) if bytes > cap => Err(AllocFailure { bytes }),
            _ => Ok(()),
        }
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }

    fn free_bytes(&self) -> Option<u64> {
        let passes = self.growing_free?;
        Some(u64::from(self.reclaims().min(passes)) * 1024 * 1024)
    }
}

// =============================================================================
// Decode engine
// =============================================================================

/// Calls observed by [`ScriptedEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Begin { session: usize, format: String, staging: bool },
    Data { session: usize, len: usize },
    End { session: usize },
    Start { session: usize },
    NextRow { session: usize },
    EndSession { session: usize },
}

#[derive(Debug, Default)]
struct RawSession {
    input: Vec<u8>,
    input_done: bool,
    rows_served: u32,
}

#[derive(Debug, Default)]
struct ScriptState {
    max_sessions: Option<usize>,
    sessions: HashMap<usize, RawSession>,
    bytes_fed: HashMap<usize, usize>,
    end_signals: HashMap<usize, usize>,
    calls: Vec<Call>,
    peak_active: usize,
}

/// Decode engine for an uncompressed "raw" format.
///
/// The input is `width * height * components` interleaved bytes. `start`
/// waits until end of input, so it exercises the concurrent feeder.
#[derive(Debug)]
pub struct ScriptedEngine {
    width: u32,
    height: u32,
    components: usize,
    formats: Vec<String>,
    fail_begin: bool,
    fail_start: bool,
    fail_row_at: Option<u32>,
    start_delay: Duration,
    reported_size: Option<(u32, u32)>,
    state: Mutex<ScriptState>,
    input_ready: Condvar,
}

impl ScriptedEngine {
    pub fn raw(width: u32, height: u32, components: usize) -> Self {
        Self {
            width,
            height,
            components,
            formats: vec!["raw".to_string(), "gray".to_string()],
            fail_begin: false,
            fail_start: false,
            fail_row_at: None,
            start_delay: Duration::ZERO,
            reported_size: None,
            state: Mutex::new(ScriptState::default()),
            input_ready: Condvar::new(),
        }
    }

    /// `begin_session` fails with an init fault.
    pub fn failing_begin(mut self) -> Self {
        self.fail_begin = true;
        self
    }

    /// `start` fails immediately with a header fault.
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// `next_row` fails when asked for row `row`.
    pub fn failing_row_at(mut self, row: u32) -> Self {
        self.fail_row_at = Some(row);
        self
    }

    /// `start` sleeps before parsing, to hold sessions open.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// The header reports `width x height` while the input stays the scripted size.
    pub fn reporting_size(mut self, width: u32, height: u32) -> Self {
        self.reported_size = Some((width, height));
        self
    }

    pub fn layout(&self) -> PixelLayout {
        PixelLayout::from_components(self.components).unwrap()
    }

    /// Interleaved input bytes for an image whose pixel `i` has components `i + c`.
    pub fn sample_input(&self) -> Vec<u8> {
        let pixels = self.width as usize * self.height as usize;
        (0..pixels)
            .flat_map(|i| (0..self.components).map(move |c| (i + c) as u8))
            .collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn bytes_fed(&self, session: SessionId) -> usize {
        self.state.lock().bytes_fed.get(&session.index()).copied().unwrap_or(0)
    }

    pub fn end_signals(&self, session: SessionId) -> usize {
        self.state.lock().end_signals.get(&session.index()).copied().unwrap_or(0)
    }

    pub fn active_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn peak_active(&self) -> usize {
        self.state.lock().peak_active
    }

    fn require_active(state: &ScriptState, session: SessionId) -> Result<(), EngineFault> {
        if state.max_sessions.is_none() {
            return Err(EngineFault::NotInitialised);
        }
        if !state.sessions.contains_key(&session.index()) {
            return Err(EngineFault::InactiveSession(session));
        }
        Ok(())
    }
}

impl DecodeEngine for ScriptedEngine {
    fn initialize(&self, max_sessions: usize) -> Result<(), EngineFault> {
        let mut state = self.state.lock();
        if state.max_sessions.is_some() {
            return Err(EngineFault::AlreadyInitialised);
        }
        state.max_sessions = Some(max_sessions);
        Ok(())
    }

    fn supported_formats(&self) -> Vec<String> {
        self.formats.clone()
    }

    fn begin_session(&self, session: SessionId, format: &str, use_staging: bool) -> Result<(), EngineFault> {
        let mut state = self.state.lock();
        let max = state.max_sessions.ok_or(EngineFault::NotInitialised)?;
        state.calls.push(Call::Begin {
            session: session.index(),
            format: format.to_string(),
            staging: use_staging,
        });
        if session.index() >= max || state.sessions.contains_key(&session.index()) {
            return Err(EngineFault::InactiveSession(session));
        }
        if !self.formats.iter().any(|f| f == format) {
            return Err(EngineFault::UnknownFormat(format.to_string()));
        }
        if self.fail_begin {
            return Err(EngineFault::Init("scripted init fault".to_string()));
        }
        state.sessions.insert(session.index(), RawSession::default());
        state.bytes_fed.insert(session.index(), 0);
        state.end_signals.insert(session.index(), 0);
        state.peak_active = state.peak_active.max(state.sessions.len());
        Ok(())
    }

    fn feed(&self, session: SessionId, block: FeedBlock<'_>) -> Result<(), EngineFault> {
        let mut state = self.state.lock();
        let id = session.index();
        match block {
            FeedBlock::Data(bytes) => {
                state.calls.push(Call::Data { session: id, len: bytes.len() });
                Self::require_active(&state, session)?;
                *state.bytes_fed.entry(id).or_default() += bytes.len();
                if let Some(raw) = state.sessions.get_mut(&id) {
                    raw.input.extend_from_slice(bytes);
                }
            }
            FeedBlock::End => {
                state.calls.push(Call::End { session: id });
                *state.end_signals.entry(id).or_default() += 1;
                Self::require_active(&state, session)?;
                if let Some(raw) = state.sessions.get_mut(&id) {
                    raw.input_done = true;
                }
                self.input_ready.notify_all();
            }
        }
        Ok(())
    }

    fn start(&self, session: SessionId) -> Result<(), EngineFault> {
        {
            let mut state = self.state.lock();
            state.calls.push(Call::Start { session: session.index() });
            Self::require_active(&state, session)?;
        }
        if self.fail_start {
            return Err(EngineFault::Header("scripted header fault".to_string()));
        }
        std::thread::sleep(self.start_delay);

        let needed = self.width as usize * self.height as usize * self.components;
        let mut state = self.state.lock();
        loop {
            let raw = state
                .sessions
                .get(&session.index())
                .ok_or(EngineFault::InactiveSession(session))?;
            if raw.input_done {
                if raw.input.len() < needed {
                    return Err(EngineFault::Header(format!(
                        "truncated input: {} of {needed} bytes",
                        raw.input.len()
                    )));
                }
                return Ok(());
            }
            self.input_ready.wait(&mut state);
        }
    }

    fn width(&self, session: SessionId) -> Result<u32, EngineFault> {
        Self::require_active(&self.state.lock(), session)?;
        Ok(self.reported_size.map_or(self.width, |(w, _)| w))
    }

    fn height(&self, session: SessionId) -> Result<u32, EngineFault> {
        Self::require_active(&self.state.lock(), session)?;
        Ok(self.reported_size.map_or(self.height, |(_, h)| h))
    }

    fn component_count(&self, session: SessionId) -> Result<usize, EngineFault> {
        Self::require_active(&self.state.lock(), session)?;
        Ok(self.components)
    }

    fn next_row(&self, session: SessionId, row: &mut [u32]) -> Result<(), EngineFault> {
        let mut state = self.state.lock();
        state.calls.push(Call::NextRow { session: session.index() });
        Self::require_active(&state, session)?;
        let raw = state
            .sessions
            .get_mut(&session.index())
            .ok_or(EngineFault::InactiveSession(session))?;

        let y = raw.rows_served;
        if self.fail_row_at == Some(y) {
            return Err(EngineFault::Row(format!("scripted fault at row {y}")));
        }
        if y >= self.height {
            return Err(EngineFault::Row(format!("row {y} past height {}", self.height)));
        }
        let stride = self.width as usize * self.components;
        let start = y as usize * stride;
        self.layout().pack_row(&raw.input[start..start + stride], row);
        raw.rows_served += 1;
        Ok(())
    }

    fn end_session(&self, session: SessionId) {
        let mut state = self.state.lock();
        state.calls.push(Call::EndSession { session: session.index() });
        state.sessions.remove(&session.index());
        self.input_ready.notify_all();
    }
}

// =============================================================================
// Scale engine
// =============================================================================

/// Nearest-neighbour scale engine that counts every call.
#[derive(Debug)]
pub struct ScriptedScaler {
    filters: Vec<String>,
    fail_scale: bool,
    initialized: AtomicUsize,
    begins: AtomicUsize,
    scales: AtomicUsize,
    ends: AtomicUsize,
}

impl ScriptedScaler {
    pub fn new(filters: &[&str]) -> Self {
        Self {
            filters: filters.iter().map(|f| f.to_string()).collect(),
            fail_scale: false,
            initialized: AtomicUsize::new(0),
            begins: AtomicUsize::new(0),
            scales: AtomicUsize::new(0),
            ends: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_scale = true;
        self
    }

    /// Every call after initialisation.
    pub fn session_calls(&self) -> usize {
        self.begins() + self.scales() + self.ends()
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn scales(&self) -> usize {
        self.scales.load(Ordering::SeqCst)
    }

    pub fn ends(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }
}

impl ScaleEngine for ScriptedScaler {
    fn initialize(&self, _max_sessions: usize) -> Result<(), EngineFault> {
        if self.initialized.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(EngineFault::AlreadyInitialised);
        }
        Ok(())
    }

    fn supported_filters(&self) -> Vec<String> {
        self.filters.clone()
    }

    fn begin(&self, _session: SessionId, _filter: &str) -> Result<(), EngineFault> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn scale_into(
        &self,
        _session: SessionId,
        src: &ByteImage,
        dst_width: u32,
        dst_height: u32,
        dst: &mut [u8],
    ) -> Result<(), EngineFault> {
        self.scales.fetch_add(1, Ordering::SeqCst);
        if self.fail_scale {
            return Err(EngineFault::Scale("scripted scale fault".to_string()));
        }
        let n = src.components();
        for y in 0..dst_height {
            let sy = y * src.height() / dst_height;
            let row = src.row(sy).ok_or_else(|| EngineFault::Scale("source row".to_string()))?;
            for x in 0..dst_width {
                let sx = (x * src.width() / dst_width) as usize;
                let di = (y as usize * dst_width as usize + x as usize) * n;
                dst[di..di + n].copy_from_slice(&row[sx * n..sx * n + n]);
            }
        }
        Ok(())
    }

    fn end(&self, _session: SessionId) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Readers and consumers
// =============================================================================

/// Reader that never reaches end of input.
#[derive(Debug)]
pub struct EndlessReader {
    byte: u8,
    delay: Duration,
}

impl EndlessReader {
    pub fn new(byte: u8) -> Self {
        Self {
            byte,
            delay: Duration::ZERO,
        }
    }

    /// Sleep before every read.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Read for EndlessReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        std::thread::sleep(self.delay);
        buf.fill(self.byte);
        Ok(buf.len())
    }
}

/// Reader that yields `limit` zero bytes and then fails.
#[derive(Debug)]
pub struct FailingReader {
    remaining: usize,
}

impl FailingReader {
    pub fn after(limit: usize) -> Self {
        Self { remaining: limit }
    }
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "source went away"));
        }
        let n = buf.len().min(self.remaining);
        buf[..n].fill(0);
        self.remaining -= n;
        Ok(n)
    }
}

/// Consumer that records everything it is sent.
#[derive(Debug, Default)]
pub struct RecordingConsumer {
    pub dimensions: Option<(u32, u32)>,
    pub layout: Option<PixelLayout>,
    /// `(y, rows)` of every `set_pixels` call.
    pub blocks: Vec<(u32, u32)>,
    pub pixels: Vec<u32>,
    pub completions: usize,
}

impl PixelConsumer for RecordingConsumer {
    fn set_dimensions(&mut self, width: u32, height: u32) {
        self.dimensions = Some((width, height));
    }

    fn set_layout(&mut self, layout: PixelLayout) {
        self.layout = Some(layout);
    }

    fn set_pixels(&mut self, y: u32, rows: u32, width: u32, pixels: &[u32]) {
        self.blocks.push((y, rows));
        self.pixels.extend_from_slice(&pixels[..(rows * width) as usize]);
    }

    fn image_complete(&mut self) {
        self.completions += 1;
    }
}
