//! Decoding engine backed by the `image` crate.
//!
//! Each session receives its input either through a bounded in-memory pipe
//! (fed concurrently by the feeder thread) or through a staging file in the
//! system temp directory. `start` collects the complete input, parses it
//! with the `image` decoders, and keeps the pixels at their native channel
//! count (1 to 4, 8 bits each) for row-by-row retrieval.
//!
//! # Supported Formats
//!
//! png, bmp, jpeg, gif, targa, x-portable-pixmap, x-portable-graymap, tiff

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{self, Receiver, Sender};
use image::{DynamicImage, ImageFormat};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::{DecodeEngine, EngineFault, FeedBlock};
use crate::pixels::PixelLayout;
use crate::pool::SessionId;

/// Blocks buffered in a session pipe before `feed` blocks.
const DEFAULT_PIPE_CAPACITY: usize = 16;

/// Format tags and the decoder that handles each.
const KNOWN_FORMATS: &[(&str, ImageFormat)] = &[
    ("png", ImageFormat::Png),
    ("bmp", ImageFormat::Bmp),
    ("jpeg", ImageFormat::Jpeg),
    ("gif", ImageFormat::Gif),
    ("targa", ImageFormat::Tga),
    ("x-portable-pixmap", ImageFormat::Pnm),
    ("x-portable-graymap", ImageFormat::Pnm),
    ("tiff", ImageFormat::Tiff),
];

fn format_for_tag(tag: &str) -> Option<ImageFormat> {
    KNOWN_FORMATS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(tag))
        .map(|(_, format)| *format)
}

/// Decoded pixels awaiting row retrieval.
struct Frame {
    width: u32,
    height: u32,
    layout: PixelLayout,
    bytes: Vec<u8>,
    next_row: u32,
}

impl Frame {
    fn from_image(img: DynamicImage) -> Self {
        let (width, height) = (img.width(), img.height());
        let (layout, bytes) = match img.color().channel_count() {
            1 => (PixelLayout::Intensity, img.into_luma8().into_raw()),
            2 => (PixelLayout::IntensityAlpha, img.into_luma_alpha8().into_raw()),
            3 => (PixelLayout::Rgb, img.into_rgb8().into_raw()),
            _ => (PixelLayout::Rgba, img.into_rgba8().into_raw()),
        };
        Self {
            width,
            height,
            layout,
            bytes,
            next_row: 0,
        }
    }
}

struct Staging {
    path: PathBuf,
    /// Open until end of input.
    writer: Option<BufWriter<File>>,
}

/// Per-session state. A slot is active while `format` is set.
#[derive(Default)]
struct Slot {
    format: Option<ImageFormat>,
    pipe_tx: Option<Sender<Vec<u8>>>,
    pipe_rx: Option<Receiver<Vec<u8>>>,
    staging: Option<Staging>,
    frame: Option<Frame>,
}

impl Slot {
    fn ensure_active(&self, session: SessionId) -> Result<ImageFormat, EngineFault> {
        self.format.ok_or(EngineFault::InactiveSession(session))
    }

    fn frame(&self, session: SessionId) -> Result<&Frame, EngineFault> {
        self.ensure_active(session)?;
        self.frame
            .as_ref()
            .ok_or_else(|| EngineFault::Header("header has not been parsed".to_string()))
    }
}

/// [`DecodeEngine`] implementation using the `image` crate's decoders.
pub struct ImageCrateEngine {
    slots: RwLock<Vec<Mutex<Slot>>>,
    pipe_capacity: usize,
    staging_dir: PathBuf,
    staging_seq: AtomicU64,
}

impl Default for ImageCrateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCrateEngine {
    /// Create an uninitialised engine staging into the system temp directory.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            staging_dir: std::env::temp_dir(),
            staging_seq: AtomicU64::new(0),
        }
    }

    /// Number of blocks a session pipe buffers before `feed` blocks.
    pub fn with_pipe_capacity(mut self, blocks: usize) -> Self {
        self.pipe_capacity = blocks.max(1);
        self
    }

    /// Directory that receives staging files.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// Run `f` against the slot for `session` under its lock.
    fn with_slot<T>(
        &self,
        session: SessionId,
        f: impl FnOnce(&mut Slot) -> Result<T, EngineFault>,
    ) -> Result<T, EngineFault> {
        let slots = self.slots.read();
        if slots.is_empty() {
            return Err(EngineFault::NotInitialised);
        }
        let slot = slots
            .get(session.index())
            .ok_or(EngineFault::InactiveSession(session))?;
        let mut slot = slot.lock();
        f(&mut slot)
    }

    fn create_staging(&self, session: SessionId) -> Result<Staging, EngineFault> {
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        let path = self.staging_dir.join(format!(
            "pixbridge-{}-{}-{}.stage",
            std::process::id(),
            session.index(),
            seq
        ));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| EngineFault::Init(format!("cannot create staging file {}: {e}", path.display())))?;
        Ok(Staging {
            path,
            writer: Some(BufWriter::new(file)),
        })
    }

    /// Collect the complete input of a session. Blocks in pipe mode until
    /// end of input has been fed.
    fn collect_input(&self, session: SessionId) -> Result<Vec<u8>, EngineFault> {
        enum Source {
            Pipe(Receiver<Vec<u8>>),
            File(PathBuf),
        }

        let source = self.with_slot(session, |slot| {
            slot.ensure_active(session)?;
            if let Some(staging) = &slot.staging {
                if staging.writer.is_some() {
                    return Err(EngineFault::Header(
                        "staging file incomplete: end of input not received".to_string(),
                    ));
                }
                return Ok(Source::File(staging.path.clone()));
            }
            slot.pipe_rx
                .take()
                .map(Source::Pipe)
                .ok_or_else(|| EngineFault::Header("input already consumed".to_string()))
        })?;

        match source {
            // The slot lock is released here so the feeder can keep sending.
            Source::Pipe(rx) => Ok(rx.iter().flatten().collect()),
            Source::File(path) => {
                fs::read(&path).map_err(|e| EngineFault::Header(format!("cannot read staging file: {e}")))
            }
        }
    }
}

impl DecodeEngine for ImageCrateEngine {
    fn initialize(&self, max_sessions: usize) -> Result<(), EngineFault> {
        let mut slots = self.slots.write();
        if !slots.is_empty() {
            return Err(EngineFault::AlreadyInitialised);
        }
        if max_sessions == 0 {
            return Err(EngineFault::Init("max_sessions must be > 0".to_string()));
        }
        *slots = (0..max_sessions).map(|_| Mutex::new(Slot::default())).collect();
        debug!(max_sessions, "Image engine initialised");
        Ok(())
    }

    fn supported_formats(&self) -> Vec<String> {
        KNOWN_FORMATS.iter().map(|(name, _)| name.to_string()).collect()
    }

    fn begin_session(&self, session: SessionId, format: &str, use_staging: bool) -> Result<(), EngineFault> {
        let image_format = format_for_tag(format).ok_or_else(|| EngineFault::UnknownFormat(format.to_string()))?;

        self.with_slot(session, |slot| {
            if slot.format.is_some() {
                return Err(EngineFault::Init(format!("session {session} is already active")));
            }
            *slot = Slot {
                format: Some(image_format),
                ..Slot::default()
            };
            if use_staging {
                match self.create_staging(session) {
                    Ok(staging) => slot.staging = Some(staging),
                    Err(e) => {
                        slot.format = None;
                        return Err(e);
                    }
                }
            } else {
                let (tx, rx) = channel::bounded(self.pipe_capacity);
                slot.pipe_tx = Some(tx);
                slot.pipe_rx = Some(rx);
            }
            Ok(())
        })?;
        debug!(session = %session, format, use_staging, "Decode session begun");
        Ok(())
    }

    fn feed(&self, session: SessionId, block: FeedBlock<'_>) -> Result<(), EngineFault> {
        let pipe = self.with_slot(session, |slot| {
            slot.ensure_active(session)?;
            if let Some(staging) = slot.staging.as_mut() {
                match block {
                    FeedBlock::Data(bytes) => {
                        let writer = staging
                            .writer
                            .as_mut()
                            .ok_or_else(|| EngineFault::Transfer("data after end of input".to_string()))?;
                        writer
                            .write_all(bytes)
                            .map_err(|e| EngineFault::Transfer(e.to_string()))?;
                    }
                    FeedBlock::End => {
                        if let Some(mut writer) = staging.writer.take() {
                            writer.flush().map_err(|e| EngineFault::Transfer(e.to_string()))?;
                        }
                    }
                }
                return Ok(None);
            }
            match block {
                FeedBlock::Data(_) => slot
                    .pipe_tx
                    .clone()
                    .map(Some)
                    .ok_or_else(|| EngineFault::Transfer("data after end of input".to_string())),
                FeedBlock::End => {
                    // Dropping the sender closes the pipe once in-flight sends finish.
                    slot.pipe_tx = None;
                    Ok(None)
                }
            }
        })?;

        if let (Some(tx), FeedBlock::Data(bytes)) = (pipe, block) {
            // Blocking send outside the slot lock; fails once the session ends.
            tx.send(bytes.to_vec())
                .map_err(|_| EngineFault::Transfer("pipe closed by reader".to_string()))?;
        }
        Ok(())
    }

    fn start(&self, session: SessionId) -> Result<(), EngineFault> {
        let format = self.with_slot(session, |slot| slot.ensure_active(session))?;
        let bytes = self.collect_input(session)?;
        if bytes.is_empty() {
            return Err(EngineFault::Header("no image data received".to_string()));
        }

        let img = image::load_from_memory_with_format(&bytes, format)
            .map_err(|e| EngineFault::Header(e.to_string()))?;
        let frame = Frame::from_image(img);
        debug!(
            session = %session,
            width = frame.width,
            height = frame.height,
            components = frame.layout.components(),
            "Image header parsed"
        );

        self.with_slot(session, |slot| {
            slot.ensure_active(session)?;
            slot.frame = Some(frame);
            Ok(())
        })
    }

    fn width(&self, session: SessionId) -> Result<u32, EngineFault> {
        self.with_slot(session, |slot| Ok(slot.frame(session)?.width))
    }

    fn height(&self, session: SessionId) -> Result<u32, EngineFault> {
        self.with_slot(session, |slot| Ok(slot.frame(session)?.height))
    }

    fn component_count(&self, session: SessionId) -> Result<usize, EngineFault> {
        self.with_slot(session, |slot| Ok(slot.frame(session)?.layout.components()))
    }

    fn next_row(&self, session: SessionId, row: &mut [u32]) -> Result<(), EngineFault> {
        self.with_slot(session, |slot| {
            slot.frame(session)?;
            let frame = slot
                .frame
                .as_mut()
                .ok_or_else(|| EngineFault::Header("header has not been parsed".to_string()))?;
            if frame.next_row >= frame.height {
                return Err(EngineFault::Row(format!(
                    "row {} requested past image height {}",
                    frame.next_row, frame.height
                )));
            }
            let width = frame.width as usize;
            if row.len() < width {
                return Err(EngineFault::Row(format!(
                    "row buffer holds {} pixels, image width is {width}",
                    row.len()
                )));
            }

            let stride = width * frame.layout.components();
            let start = frame.next_row as usize * stride;
            frame
                .layout
                .pack_row(&frame.bytes[start..start + stride], &mut row[..width]);
            frame.next_row += 1;
            Ok(())
        })
    }

    fn end_session(&self, session: SessionId) {
        let staging = self
            .with_slot(session, |slot| Ok(std::mem::take(slot).staging))
            .unwrap_or(None);

        if let Some(Staging { path, writer }) = staging {
            drop(writer);
            if let Err(e) = fs::remove_file(&path) {
                warn!(session = %session, path = %path.display(), "Failed to remove staging file: {e}");
            }
        }
        debug!(session = %session, "Decode session ended");
    }
}
