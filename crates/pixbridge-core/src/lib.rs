//! Pixbridge Core - pooled, streaming image decode and rescale services
//!
//! This crate drives synchronous, session-addressed image engines from many
//! threads at once: a bounded session pool, a stream feeder that copies a
//! source into an engine session, chunked pixel storage that survives memory
//! pressure, and a rescaling service with the same pooling contract.

pub mod alloc;
pub mod config;
pub mod decode;
pub mod engine;
pub mod pixels;
pub mod pool;
pub mod scale;

#[cfg(test)]
mod testing;

pub use alloc::{AllocError, MemoryProbe, RetryPolicy, SystemMemory};
pub use config::{BridgeConfig, ConfigError, TransferMode};
pub use decode::{
    BufferError, ChunkedPixelBuffer, DecodeError, DecodeOrchestrator, DecodeState, DecodedImage, OutputShape,
    PixelConsumer, PixelData,
};
pub use engine::{DecodeEngine, EngineFault, FeedBlock, ImageCrateEngine};
pub use pixels::{ByteImage, ImageError, PixelLayout};
pub use pool::{PoolError, PoolStats, SessionId, SessionLease, SessionPool};
pub use scale::{ImageScaler, ResampleEngine, ScaleEngine, ScaleError, ScaleKernel};
