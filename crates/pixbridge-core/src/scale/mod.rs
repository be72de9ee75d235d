//! Image rescaling through a pooled scaling engine.
//!
//! [`ImageScaler`] mirrors the decode side: a fixed pool of engine sessions,
//! one leased per request and always released, with filter names checked
//! against the engine's list before any engine call is made.

mod kernel;
mod resample;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::alloc::{allocate_flat, AllocError, MemoryProbe, RetryPolicy, SystemMemory};
use crate::config::BridgeConfig;
use crate::decode::DecodedImage;
use crate::engine::EngineFault;
use crate::pixels::{byte_len, ByteImage, ImageError};
use crate::pool::{SessionId, SessionPool};

pub use kernel::ScaleKernel;
pub use resample::ResampleEngine;

/// Error types for scale requests.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScaleError {
    /// The filter name is not one the engine reports.
    #[error("Unsupported filter: '{0}'")]
    UnsupportedFilter(String),

    /// Target or source dimensions are unusable.
    #[error("Invalid dimensions: width ({width}) and height ({height}) must be non-zero")]
    InvalidDimensions { width: u32, height: u32 },

    /// The scaling engine failed.
    #[error("Scaling failed: {0}")]
    ScaleFault(String),

    /// The output buffer could not be allocated.
    #[error("Out of memory during scaling")]
    OutOfMemory,
}

impl From<EngineFault> for ScaleError {
    fn from(fault: EngineFault) -> Self {
        ScaleError::ScaleFault(fault.to_string())
    }
}

impl From<AllocError> for ScaleError {
    fn from(_: AllocError) -> Self {
        ScaleError::OutOfMemory
    }
}

impl From<ImageError> for ScaleError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::InvalidDimensions { width, height } => ScaleError::InvalidDimensions { width, height },
            other => ScaleError::ScaleFault(other.to_string()),
        }
    }
}

/// A synchronous, session-addressed rescaling engine.
pub trait ScaleEngine: Send + Sync {
    /// Prepare state for `max_sessions` sessions. Called once.
    fn initialize(&self, max_sessions: usize) -> Result<(), EngineFault>;

    /// Kernel names the engine accepts.
    fn supported_filters(&self) -> Vec<String>;

    /// Bind `filter` to the session.
    fn begin(&self, session: SessionId, filter: &str) -> Result<(), EngineFault>;

    /// Resample `src` into `dst`, which holds
    /// `dst_width * dst_height * src.components()` bytes.
    fn scale_into(
        &self,
        session: SessionId,
        src: &ByteImage,
        dst_width: u32,
        dst_height: u32,
        dst: &mut [u8],
    ) -> Result<(), EngineFault>;

    /// Release per-session state. Never fails.
    fn end(&self, session: SessionId);
}

/// Rescales images with a shared engine and session pool.
pub struct ImageScaler<S: ?Sized> {
    engine: Arc<S>,
    pool: Arc<SessionPool>,
    /// Lowercased name -> name as the engine reports it.
    filters: Arc<BTreeMap<String, String>>,
    probe: Arc<dyn MemoryProbe>,
    policy: RetryPolicy,
}

impl<S: ?Sized> Clone for ImageScaler<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            pool: Arc::clone(&self.pool),
            filters: Arc::clone(&self.filters),
            probe: Arc::clone(&self.probe),
            policy: self.policy,
        }
    }
}

impl<S: ScaleEngine + ?Sized> ImageScaler<S> {
    /// Initialise the engine and build a pool of `config.scale_sessions`.
    ///
    /// # Errors
    ///
    /// Returns `ScaleError::ScaleFault` if the configuration is invalid or
    /// the engine refuses initialisation.
    pub fn new(engine: Arc<S>, config: &BridgeConfig) -> Result<Self, ScaleError> {
        config
            .validate()
            .map_err(|e| ScaleError::ScaleFault(e.to_string()))?;
        engine.initialize(config.scale_sessions)?;

        let filters: BTreeMap<String, String> = engine
            .supported_filters()
            .into_iter()
            .map(|name| (name.to_ascii_lowercase(), name))
            .collect();

        info!(sessions = config.scale_sessions, filters = filters.len(), "Image scaler ready");

        Ok(Self {
            engine,
            pool: Arc::new(SessionPool::new("scale", config.scale_sessions)),
            filters: Arc::new(filters),
            probe: Arc::new(SystemMemory),
            policy: config.retry_policy(),
        })
    }

    /// Replace the memory probe consulted for output buffers.
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn engine(&self) -> &Arc<S> {
        &self.engine
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Filter names as the engine reports them.
    pub fn supported_filters(&self) -> impl Iterator<Item = &str> {
        self.filters.values().map(String::as_str)
    }

    /// Case-insensitive check of a filter name.
    pub fn supports(&self, filter: &str) -> bool {
        self.filters.contains_key(&filter.to_ascii_lowercase())
    }

    /// Rescale `src` to `dst_width x dst_height` with `filter`.
    ///
    /// The result keeps the source layout and grayscale classification.
    ///
    /// # Errors
    ///
    /// - `ScaleError::UnsupportedFilter` if the engine does not list `filter`
    /// - `ScaleError::InvalidDimensions` if a target dimension is zero or the
    ///   output size overflows `usize`
    /// - `ScaleError::OutOfMemory` if the output cannot be allocated
    /// - `ScaleError::ScaleFault` if the engine fails
    pub fn scale(
        &self,
        src: &ByteImage,
        dst_width: u32,
        dst_height: u32,
        filter: &str,
    ) -> Result<ByteImage, ScaleError> {
        let filter = self
            .filters
            .get(&filter.to_ascii_lowercase())
            .ok_or_else(|| ScaleError::UnsupportedFilter(filter.to_string()))?;
        if dst_width == 0 || dst_height == 0 {
            return Err(ScaleError::InvalidDimensions {
                width: dst_width,
                height: dst_height,
            });
        }

        let len = byte_len(dst_width, dst_height, src.layout()).ok_or(ScaleError::InvalidDimensions {
            width: dst_width,
            height: dst_height,
        })?;
        let mut dst: Vec<u8> = allocate_flat(self.probe.as_ref(), len, self.policy)?;

        let lease = self.pool.lease();
        let session = lease.id();
        let result = self
            .engine
            .begin(session, filter)
            .and_then(|()| self.engine.scale_into(session, src, dst_width, dst_height, &mut dst));
        self.engine.end(session);
        if let Err(e) = lease.release() {
            error!(session = %session, error = %e, "Failed to release scale session");
        }
        result?;

        debug!(
            session = %session,
            from = ?(src.width(), src.height()),
            to = ?(dst_width, dst_height),
            filter = %filter,
            "Scaled image"
        );
        Ok(ByteImage::with_grayscale(
            dst_width,
            dst_height,
            src.layout(),
            src.is_grayscale(),
            dst,
        )?)
    }

    /// Rescale a bare interleaved buffer and return the output bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn scale_buffer(
        &self,
        width: u32,
        height: u32,
        components: usize,
        data: &[u8],
        dst_width: u32,
        dst_height: u32,
        filter: &str,
    ) -> Result<Vec<u8>, ScaleError> {
        if !self.supports(filter) {
            return Err(ScaleError::UnsupportedFilter(filter.to_string()));
        }
        let src = ByteImage::from_components(width, height, components, data.to_vec())?;
        Ok(self.scale(&src, dst_width, dst_height, filter)?.into_data())
    }

    /// Rescale a decoded image of any storage shape.
    pub fn scale_decoded(
        &self,
        image: &DecodedImage,
        dst_width: u32,
        dst_height: u32,
        filter: &str,
    ) -> Result<ByteImage, ScaleError> {
        if !self.supports(filter) {
            return Err(ScaleError::UnsupportedFilter(filter.to_string()));
        }
        let src = image.to_byte_image()?;
        self.scale(&src, dst_width, dst_height, filter)
    }

    /// Rescale so the longest edge equals `max_edge`, preserving aspect ratio.
    ///
    /// Images already within `max_edge` are returned unchanged.
    pub fn scale_to_fit(&self, src: &ByteImage, max_edge: u32, filter: &str) -> Result<ByteImage, ScaleError> {
        if !self.supports(filter) {
            return Err(ScaleError::UnsupportedFilter(filter.to_string()));
        }
        if max_edge == 0 {
            return Err(ScaleError::InvalidDimensions {
                width: max_edge,
                height: max_edge,
            });
        }

        let (width, height) = (src.width(), src.height());
        if width <= max_edge && height <= max_edge {
            return Ok(src.clone());
        }

        let (dst_width, dst_height) = if width >= height {
            let h = (height as u64 * max_edge as u64 / width as u64).max(1) as u32;
            (max_edge, h)
        } else {
            let w = (width as u64 * max_edge as u64 / height as u64).max(1) as u32;
            (w, max_edge)
        };
        self.scale(src, dst_width, dst_height, filter)
    }
}

impl<S: ?Sized> fmt::Debug for ImageScaler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageScaler")
            .field("pool", &self.pool)
            .field("filters", &self.filters.values().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixels::PixelLayout;
    use crate::testing::{FailingMemory, ScriptedScaler};

    fn scaler(engine: ScriptedScaler) -> ImageScaler<ScriptedScaler> {
        ImageScaler::new(Arc::new(engine), &BridgeConfig::default()).unwrap()
    }

    fn gradient(width: u32, height: u32, layout: PixelLayout) -> ByteImage {
        let len = byte_len(width, height, layout).unwrap();
        ByteImage::new(width, height, layout, (0..len).map(|i| i as u8).collect()).unwrap()
    }

    #[test]
    fn test_unknown_filter_never_reaches_engine() {
        let scaler = scaler(ScriptedScaler::new(&["AreaAverage"]));
        let src = gradient(4, 4, PixelLayout::Rgb);

        let err = scaler.scale(&src, 2, 2, "Bicubic").unwrap_err();

        assert_eq!(err, ScaleError::UnsupportedFilter("Bicubic".to_string()));
        assert_eq!(scaler.engine().session_calls(), 0);
        assert_eq!(scaler.pool().stats().total_acquired, 0);
    }

    #[test]
    fn test_filter_name_ignores_case() {
        let scaler = scaler(ScriptedScaler::new(&["AreaAverage"]));
        let src = gradient(4, 4, PixelLayout::Intensity);

        let out = scaler.scale(&src, 2, 2, "areaaverage").unwrap();

        assert_eq!((out.width(), out.height()), (2, 2));
        assert_eq!(scaler.engine().begins(), 1);
        assert_eq!(scaler.engine().ends(), 1);
        assert!(scaler.pool().is_idle());
    }

    #[test]
    fn test_output_keeps_layout_and_grayscale() {
        let scaler = scaler(ScriptedScaler::new(&["Nearest"]));
        let src = ByteImage::with_grayscale(2, 2, PixelLayout::Rgb, true, vec![9; 12]).unwrap();

        let out = scaler.scale(&src, 4, 4, "Nearest").unwrap();

        assert_eq!(out.layout(), PixelLayout::Rgb);
        assert!(out.is_grayscale());
        assert_eq!(out.data(), vec![9u8; 48].as_slice());
    }

    #[test]
    fn test_zero_target_rejected() {
        let scaler = scaler(ScriptedScaler::new(&["Nearest"]));
        let src = gradient(2, 2, PixelLayout::Intensity);
        assert_eq!(
            scaler.scale(&src, 0, 3, "Nearest"),
            Err(ScaleError::InvalidDimensions { width: 0, height: 3 })
        );
        assert_eq!(scaler.engine().session_calls(), 0);
    }

    #[test]
    fn test_overflowing_target_rejected() {
        let scaler = scaler(ScriptedScaler::new(&["Nearest"]));
        let src = gradient(2, 2, PixelLayout::Rgba);
        assert_eq!(
            scaler.scale(&src, u32::MAX, u32::MAX, "Nearest"),
            Err(ScaleError::InvalidDimensions {
                width: u32::MAX,
                height: u32::MAX
            })
        );
        assert_eq!(scaler.engine().session_calls(), 0);
        assert_eq!(scaler.pool().stats().total_acquired, 0);
    }

    #[test]
    fn test_engine_fault_releases_session() {
        let scaler = scaler(ScriptedScaler::new(&["Nearest"]).failing());
        let src = gradient(2, 2, PixelLayout::Intensity);

        let err = scaler.scale(&src, 1, 1, "Nearest").unwrap_err();

        assert!(matches!(err, ScaleError::ScaleFault(_)));
        assert_eq!(scaler.engine().ends(), 1);
        assert!(scaler.pool().is_idle());
    }

    #[test]
    fn test_output_allocation_failure() {
        let scaler = scaler(ScriptedScaler::new(&["Nearest"]))
            .with_memory_probe(Arc::new(FailingMemory::fail_first(100)));
        let src = gradient(2, 2, PixelLayout::Intensity);

        assert_eq!(scaler.scale(&src, 8, 8, "Nearest"), Err(ScaleError::OutOfMemory));
        assert_eq!(scaler.engine().session_calls(), 0);
    }

    #[test]
    fn test_scale_buffer() {
        let scaler = scaler(ScriptedScaler::new(&["Nearest"]));
        let out = scaler.scale_buffer(2, 1, 2, &[1, 2, 3, 4], 4, 1, "Nearest").unwrap();
        assert_eq!(out, vec![1, 2, 1, 2, 3, 4, 3, 4]);

        let err = scaler.scale_buffer(2, 1, 5, &[0; 10], 1, 1, "Nearest").unwrap_err();
        assert!(matches!(err, ScaleError::ScaleFault(_)));
    }

    #[test]
    fn test_scale_buffer_checks_filter_first() {
        let scaler = scaler(ScriptedScaler::new(&["Nearest"]));
        let err = scaler.scale_buffer(2, 1, 5, &[0; 10], 1, 1, "Mitchell").unwrap_err();
        assert_eq!(err, ScaleError::UnsupportedFilter("Mitchell".to_string()));
    }

    #[test]
    fn test_scale_to_fit() {
        let scaler = scaler(ScriptedScaler::new(&["Nearest"]));
        let src = gradient(8, 4, PixelLayout::Intensity);

        let out = scaler.scale_to_fit(&src, 4, "Nearest").unwrap();
        assert_eq!((out.width(), out.height()), (4, 2));

        let same = scaler.scale_to_fit(&src, 10, "Nearest").unwrap();
        assert_eq!(same, src);
    }

    #[test]
    fn test_second_scaler_on_same_engine_fails() {
        let engine = Arc::new(ScriptedScaler::new(&["Nearest"]));
        ImageScaler::new(engine.clone(), &BridgeConfig::default()).unwrap();
        assert!(ImageScaler::new(engine, &BridgeConfig::default()).is_err());
    }
}
