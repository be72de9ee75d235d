//! Chunked pixel storage for images too large for one allocation.
//!
//! A `ChunkedPixelBuffer` holds `width * height` packed pixels split into
//! row-aligned chunks, each sized to at most `memory_limit` pixels. The aim
//! is as few chunks as possible while never requesting one huge block. When
//! a chunk allocation is refused, the chunk size drops to two thirds and the
//! allocation is retried. The smaller size carries over to later chunks.
//! A chunk always holds at least one row. A refused one-row chunk is
//! retried after reclamation under the caller's [`RetryPolicy`], and only
//! when every attempt is refused does the buffer fail with `OutOfMemory`.
//!
//! Chunk boundaries are invisible to callers: rows are addressed by their
//! index in the image and resolved to a chunk by a linear scan, which is
//! cheap because images rarely need more than a few dozen chunks.

use thiserror::Error;
use tracing::{debug, warn};

use super::types::PixelConsumer;
use crate::alloc::{allocate_flat, reclaim_until_stable, try_allocate, MemoryProbe, RetryPolicy, SystemMemory};
use crate::pixels::PixelLayout;

/// Default chunk capacity in pixels.
pub const DEFAULT_CHUNK_LIMIT: usize = 3_000_000;

/// Errors raised by [`ChunkedPixelBuffer`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// Width or height is zero.
    #[error("Invalid dimensions: width ({width}) and height ({height}) must be non-zero")]
    InvalidDimensions { width: u32, height: u32 },

    /// The row index lies outside the image.
    #[error("Invalid row {row}: image height is {height}")]
    InvalidRow { row: u32, height: u32 },

    /// The supplied row is narrower than the image.
    #[error("Row too short: expected {expected} pixels, got {actual}")]
    ShortRow { expected: usize, actual: usize },

    /// Not even a single row could be allocated.
    #[error("Out of memory allocating a {width}x{height} pixel buffer")]
    OutOfMemory { width: u32, height: u32 },
}

/// A contiguous block of whole rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelChunk {
    rows: u32,
    width: u32,
    data: Vec<u32>,
}

impl PixelChunk {
    /// Number of rows held.
    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Pixels per row.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Packed pixels, `rows * width` long.
    pub fn data(&self) -> &[u32] {
        &self.data
    }
}

/// Row-addressable pixel storage built from bounded chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedPixelBuffer {
    width: u32,
    height: u32,
    chunks: Vec<PixelChunk>,
}

impl ChunkedPixelBuffer {
    /// Allocate with the default chunk limit against the system allocator.
    pub fn new(width: u32, height: u32) -> Result<Self, BufferError> {
        Self::allocate(width, height, DEFAULT_CHUNK_LIMIT, &SystemMemory, RetryPolicy::default())
    }

    /// Allocate storage for `width * height` pixels in chunks of at most
    /// `memory_limit` pixels, shrinking chunks when the probe refuses.
    ///
    /// # Errors
    ///
    /// - `BufferError::InvalidDimensions` if either dimension is zero
    /// - `BufferError::OutOfMemory` if a single row is refused on every
    ///   attempt `policy` allows
    pub fn allocate(
        width: u32,
        height: u32,
        memory_limit: usize,
        probe: &dyn MemoryProbe,
        policy: RetryPolicy,
    ) -> Result<Self, BufferError> {
        if width == 0 || height == 0 {
            return Err(BufferError::InvalidDimensions { width, height });
        }

        let row_len = width as usize;
        let mut limit = memory_limit.max(1);
        let mut rows_left = height;
        let mut chunks = Vec::new();

        while rows_left > 0 {
            let needed = (rows_left as usize).saturating_mul(row_len);
            let rows = if needed > limit {
                // Fewer than `rows_left` rows, so the cast cannot truncate.
                (limit / row_len).max(1) as u32
            } else {
                rows_left
            };

            match try_allocate::<u32>(probe, rows as usize * row_len) {
                Ok(data) => {
                    chunks.push(PixelChunk { rows, width, data });
                    rows_left -= rows;
                }
                Err(failure) if rows > 1 => {
                    reclaim_until_stable(probe, policy.reclaim_rounds);
                    limit = rows as usize * row_len * 2 / 3;
                    warn!(bytes = failure.bytes, rows, new_limit = limit, "Chunk allocation refused, shrinking");
                }
                Err(failure) => {
                    warn!(bytes = failure.bytes, "Single-row chunk refused, retrying");
                    reclaim_until_stable(probe, policy.reclaim_rounds);
                    let data = allocate_flat::<u32>(probe, row_len, policy)
                        .map_err(|_| BufferError::OutOfMemory { width, height })?;
                    chunks.push(PixelChunk { rows: 1, width, data });
                    rows_left -= 1;
                }
            }
        }

        debug!(width, height, chunks = chunks.len(), "Allocated chunked pixel buffer");
        Ok(Self { width, height, chunks })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// The chunks in top-down order.
    pub fn chunks(&self) -> &[PixelChunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Resolve a row to its chunk index and element offset.
    fn locate(&self, row: u32) -> Option<(usize, usize)> {
        if row >= self.height {
            return None;
        }
        let mut first_row = 0;
        for (index, chunk) in self.chunks.iter().enumerate() {
            if row < first_row + chunk.rows {
                let offset = (row - first_row) as usize * self.width as usize;
                return Some((index, offset));
            }
            first_row += chunk.rows;
        }
        None
    }

    /// Copy `width` pixels from `data` into `row`. Extra pixels are ignored.
    ///
    /// # Errors
    ///
    /// - `BufferError::InvalidRow` if `row` is not below the height
    /// - `BufferError::ShortRow` if `data` is narrower than the image
    pub fn set_row(&mut self, row: u32, data: &[u32]) -> Result<(), BufferError> {
        let width = self.width as usize;
        if data.len() < width {
            return Err(BufferError::ShortRow {
                expected: width,
                actual: data.len(),
            });
        }
        let (index, offset) = self.locate(row).ok_or(BufferError::InvalidRow {
            row,
            height: self.height,
        })?;
        self.chunks[index].data[offset..offset + width].copy_from_slice(&data[..width]);
        Ok(())
    }

    /// Pixels of `row`, or `None` when out of range.
    pub fn row(&self, row: u32) -> Option<&[u32]> {
        let (index, offset) = self.locate(row)?;
        Some(&self.chunks[index].data[offset..offset + self.width as usize])
    }

    /// Copy every row into one contiguous vector.
    pub fn to_packed(&self) -> Vec<u32> {
        self.chunks.iter().flat_map(|chunk| chunk.data.iter().copied()).collect()
    }

    /// Deliver the image to `consumer` top-down, one `set_pixels` per chunk.
    ///
    /// May be called repeatedly; every call resends the whole image.
    pub fn produce(&self, layout: PixelLayout, consumer: &mut dyn PixelConsumer) {
        consumer.set_dimensions(self.width, self.height);
        consumer.set_layout(layout);
        let mut y = 0;
        for chunk in &self.chunks {
            consumer.set_pixels(y, chunk.rows, self.width, &chunk.data);
            y += chunk.rows;
        }
        consumer.image_complete();
    }
}
