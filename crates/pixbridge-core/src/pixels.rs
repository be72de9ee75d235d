//! Pixel layouts and the interleaved byte image shared by decode and scale.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when constructing a [`ByteImage`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    /// Width or height is zero.
    #[error("Invalid dimensions: width ({width}) and height ({height}) must be non-zero")]
    InvalidDimensions { width: u32, height: u32 },

    /// Component count outside 1..=4.
    #[error("Unknown pixel layout with {0} components")]
    UnknownLayout(usize),

    /// Buffer too small for the declared dimensions.
    #[error("Pixel buffer too small: expected at least {expected} bytes, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
}

/// How many components each pixel carries and what they mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PixelLayout {
    /// Single gray channel.
    Intensity = 1,
    /// Gray plus alpha.
    IntensityAlpha = 2,
    /// Red, green, blue.
    Rgb = 3,
    /// Red, green, blue, alpha.
    Rgba = 4,
}

impl PixelLayout {
    /// Map a component count reported by an engine to a layout.
    pub fn from_components(components: usize) -> Option<Self> {
        match components {
            1 => Some(PixelLayout::Intensity),
            2 => Some(PixelLayout::IntensityAlpha),
            3 => Some(PixelLayout::Rgb),
            4 => Some(PixelLayout::Rgba),
            _ => None,
        }
    }

    /// Number of interleaved bytes per pixel.
    #[inline]
    pub fn components(self) -> usize {
        self as usize
    }

    /// Returns true for the gray layouts.
    #[inline]
    pub fn is_grayscale(self) -> bool {
        matches!(self, PixelLayout::Intensity | PixelLayout::IntensityAlpha)
    }

    /// Pack one pixel's interleaved components into a `u32`.
    ///
    /// Packing per layout:
    /// - Intensity: `g`
    /// - IntensityAlpha: `g | a << 8`
    /// - Rgb: `r << 16 | g << 8 | b`
    /// - Rgba: `a << 24 | r << 16 | g << 8 | b`
    #[inline]
    pub fn pack(self, px: &[u8]) -> u32 {
        match self {
            PixelLayout::Intensity => px[0] as u32,
            PixelLayout::IntensityAlpha => px[0] as u32 | (px[1] as u32) << 8,
            PixelLayout::Rgb => (px[0] as u32) << 16 | (px[1] as u32) << 8 | px[2] as u32,
            PixelLayout::Rgba => {
                (px[3] as u32) << 24 | (px[0] as u32) << 16 | (px[1] as u32) << 8 | px[2] as u32
            }
        }
    }

    /// Inverse of [`pack`](Self::pack). `out` must hold `components()` bytes.
    #[inline]
    pub fn unpack(self, value: u32, out: &mut [u8]) {
        match self {
            PixelLayout::Intensity => out[0] = value as u8,
            PixelLayout::IntensityAlpha => {
                out[0] = value as u8;
                out[1] = (value >> 8) as u8;
            }
            PixelLayout::Rgb => {
                out[0] = (value >> 16) as u8;
                out[1] = (value >> 8) as u8;
                out[2] = value as u8;
            }
            PixelLayout::Rgba => {
                out[0] = (value >> 16) as u8;
                out[1] = (value >> 8) as u8;
                out[2] = value as u8;
                out[3] = (value >> 24) as u8;
            }
        }
    }

    /// Pack a whole interleaved row into `dst`, one `u32` per pixel.
    pub fn pack_row(self, src: &[u8], dst: &mut [u32]) {
        for (px, out) in src.chunks_exact(self.components()).zip(dst.iter_mut()) {
            *out = self.pack(px);
        }
    }

    /// Unpack a packed row into interleaved bytes.
    pub fn unpack_row(self, src: &[u32], dst: &mut [u8]) {
        for (value, px) in src.iter().zip(dst.chunks_exact_mut(self.components())) {
            self.unpack(*value, px);
        }
    }
}

/// An image stored as interleaved 8-bit components in row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteImage {
    width: u32,
    height: u32,
    layout: PixelLayout,
    grayscale: bool,
    data: Vec<u8>,
}

impl ByteImage {
    /// Wrap an existing buffer; grayscale classification follows the layout.
    pub fn new(width: u32, height: u32, layout: PixelLayout, data: Vec<u8>) -> Result<Self, ImageError> {
        Self::with_grayscale(width, height, layout, layout.is_grayscale(), data)
    }

    /// Wrap an existing buffer with an explicit grayscale flag.
    pub fn with_grayscale(
        width: u32,
        height: u32,
        layout: PixelLayout,
        grayscale: bool,
        data: Vec<u8>,
    ) -> Result<Self, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::InvalidDimensions { width, height });
        }
        let expected = byte_len(width, height, layout).ok_or(ImageError::InvalidDimensions { width, height })?;
        if data.len() < expected {
            return Err(ImageError::BufferTooSmall {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            layout,
            grayscale,
            data,
        })
    }

    /// Build from a raw component count, as an engine reports it.
    pub fn from_components(
        width: u32,
        height: u32,
        components: usize,
        data: Vec<u8>,
    ) -> Result<Self, ImageError> {
        let layout = PixelLayout::from_components(components).ok_or(ImageError::UnknownLayout(components))?;
        Self::new(width, height, layout, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn components(&self) -> usize {
        self.layout.components()
    }

    pub fn is_grayscale(&self) -> bool {
        self.grayscale
    }

    /// The interleaved pixel bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes of row `y`, or `None` when out of range.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let stride = self.width as usize * self.components();
        let start = y as usize * stride;
        Some(&self.data[start..start + stride])
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Bytes needed for an interleaved image of the given shape, or `None` if
/// that does not fit in `usize`.
pub(crate) fn byte_len(width: u32, height: u32, layout: PixelLayout) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(layout.components())
}
