//! Streamed image decoding for pixbridge.
//!
//! This module provides functionality for:
//! - Feeding a byte stream into a session of a [`DecodeEngine`](crate::engine::DecodeEngine)
//! - Pulling decoded rows into chunked or contiguous pixel storage
//! - Delivering the result to a [`PixelConsumer`] or as raw pixel arrays
//!
//! # Architecture
//!
//! A [`DecodeOrchestrator`] owns a fixed pool of engine sessions. Each
//! request leases one session, starts a [`StreamFeeder`] (on its own thread
//! for pipe transfer, inline for staging transfer), waits for the engine to
//! parse the header and then pulls exactly `height` rows. The session is
//! always ended and released before the request returns.
//!
//! # Examples
//!
//! ```ignore
//! use std::sync::Arc;
//! use pixbridge_core::{BridgeConfig, DecodeOrchestrator, ImageCrateEngine, OutputShape};
//!
//! let orchestrator = DecodeOrchestrator::new(Arc::new(ImageCrateEngine::new()), BridgeConfig::default())?;
//! let file = std::fs::File::open("photo.png")?;
//! let image = orchestrator.decode(file, "png", OutputShape::Raster)?;
//! println!("Decoded {}x{} image", image.width, image.height);
//! ```

mod chunked;
mod feeder;
mod orchestrator;
mod types;

pub use chunked::{BufferError, ChunkedPixelBuffer, PixelChunk, DEFAULT_CHUNK_LIMIT};
pub use feeder::{FeedOutcome, FeederHandle, StreamFeeder};
pub use orchestrator::{DecodeOrchestrator, DecodeState};
pub use types::{DecodeError, DecodedImage, OutputShape, PixelConsumer, PixelData};
