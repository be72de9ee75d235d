//! Core types for streamed image decoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::chunked::{BufferError, ChunkedPixelBuffer};
use crate::alloc::AllocError;
use crate::engine::EngineFault;
use crate::pixels::{ByteImage, ImageError, PixelLayout};

/// Error types for decode requests.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The format tag is not one the engine reports.
    #[error("Unsupported image format: '{0}'")]
    UnsupportedFormat(String),

    /// The engine session could not be set up.
    #[error("Decoder initialisation failed: {0}")]
    InitFault(String),

    /// The engine failed while parsing the header or producing rows.
    #[error("Decoding failed: {0}")]
    DecodeFault(String),

    /// Pixel storage could not be allocated.
    #[error("Out of memory during decoding")]
    OutOfMemory,

    /// The source stream failed before yielding any data.
    #[error("I/O error: {0}")]
    IoFault(String),
}

impl From<EngineFault> for DecodeError {
    fn from(fault: EngineFault) -> Self {
        match fault {
            EngineFault::NotInitialised | EngineFault::Init(_) | EngineFault::UnknownFormat(_) => {
                DecodeError::InitFault(fault.to_string())
            }
            other => DecodeError::DecodeFault(other.to_string()),
        }
    }
}

impl From<BufferError> for DecodeError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::OutOfMemory { .. } => DecodeError::OutOfMemory,
            other => DecodeError::DecodeFault(other.to_string()),
        }
    }
}

impl From<AllocError> for DecodeError {
    fn from(_: AllocError) -> Self {
        DecodeError::OutOfMemory
    }
}

impl From<ImageError> for DecodeError {
    fn from(err: ImageError) -> Self {
        DecodeError::DecodeFault(err.to_string())
    }
}

/// Representation a caller wants back from a decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// Chunked storage delivered row-block by row-block to a consumer.
    #[default]
    Producer,
    /// One contiguous buffer of packed pixels.
    Raster,
    /// Interleaved 8-bit components.
    Bytes,
}

/// Receives a decoded image top-down.
///
/// Calls arrive in the order `set_dimensions`, `set_layout`, one or more
/// `set_pixels`, then `image_complete`.
pub trait PixelConsumer {
    fn set_dimensions(&mut self, width: u32, height: u32);

    fn set_layout(&mut self, layout: PixelLayout);

    /// `rows` full rows starting at row `y`, `width` packed pixels each.
    fn set_pixels(&mut self, y: u32, rows: u32, width: u32, pixels: &[u32]);

    fn image_complete(&mut self);
}

/// Pixel storage matching the requested [`OutputShape`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    Chunked(ChunkedPixelBuffer),
    Packed(Vec<u32>),
    Bytes(Vec<u8>),
}

/// A fully decoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Meaning of each pixel's components.
    pub layout: PixelLayout,
    /// Pixel storage in row-major order.
    pub pixels: PixelData,
}

impl DecodedImage {
    /// Components per pixel.
    pub fn components(&self) -> usize {
        self.layout.components()
    }

    pub fn is_grayscale(&self) -> bool {
        self.layout.is_grayscale()
    }

    /// The shape this image was assembled as.
    pub fn shape(&self) -> OutputShape {
        match self.pixels {
            PixelData::Chunked(_) => OutputShape::Producer,
            PixelData::Packed(_) => OutputShape::Raster,
            PixelData::Bytes(_) => OutputShape::Bytes,
        }
    }

    /// Get the total number of pixels.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Packed value of the pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = y as usize * self.width as usize + x as usize;
        match &self.pixels {
            PixelData::Chunked(buffer) => buffer.row(y).map(|row| row[x as usize]),
            PixelData::Packed(data) => data.get(index).copied(),
            PixelData::Bytes(data) => {
                let n = self.components();
                data.get(index * n..index * n + n).map(|px| self.layout.pack(px))
            }
        }
    }

    /// Deliver the whole image to `consumer`. Repeatable.
    ///
    /// Chunked storage is sent one block per chunk; flat storage as a single
    /// block.
    pub fn produce(&self, consumer: &mut dyn PixelConsumer) {
        match &self.pixels {
            PixelData::Chunked(buffer) => buffer.produce(self.layout, consumer),
            PixelData::Packed(data) => {
                consumer.set_dimensions(self.width, self.height);
                consumer.set_layout(self.layout);
                consumer.set_pixels(0, self.height, self.width, data);
                consumer.image_complete();
            }
            PixelData::Bytes(data) => {
                let mut packed = vec![0u32; self.pixel_count()];
                self.layout.pack_row(data, &mut packed);
                consumer.set_dimensions(self.width, self.height);
                consumer.set_layout(self.layout);
                consumer.set_pixels(0, self.height, self.width, &packed);
                consumer.image_complete();
            }
        }
    }

    /// Convert to interleaved bytes, the scaler's input type.
    pub fn to_byte_image(&self) -> Result<ByteImage, ImageError> {
        let data = match &self.pixels {
            PixelData::Bytes(data) => data.clone(),
            PixelData::Packed(packed) => {
                let mut bytes = vec![0u8; self.pixel_count() * self.components()];
                self.layout.unpack_row(packed, &mut bytes);
                bytes
            }
            PixelData::Chunked(buffer) => {
                let mut bytes = vec![0u8; self.pixel_count() * self.components()];
                let stride = self.width as usize * self.components();
                for (y, dst) in bytes.chunks_exact_mut(stride).enumerate() {
                    if let Some(row) = buffer.row(y as u32) {
                        self.layout.unpack_row(row, dst);
                    }
                }
                bytes
            }
        };
        ByteImage::new(self.width, self.height, self.layout, data)
    }
}
