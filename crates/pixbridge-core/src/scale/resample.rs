//! Scaling engine built on `image::imageops`.
//!
//! Interpolating kernels go through [`image::imageops::resize`]. The
//! `AreaAverage` kernel is a box filter: every output pixel is the mean of
//! the source pixels it covers, weighted by the covered fraction of each.

use image::{ImageBuffer, Luma, LumaA, Pixel, Rgb, Rgba};
use parking_lot::Mutex;
use tracing::trace;

use super::{ScaleEngine, ScaleKernel};
use crate::engine::EngineFault;
use crate::pixels::{byte_len, ByteImage, PixelLayout};
use crate::pool::SessionId;

/// [`ScaleEngine`] backed by the `image` crate.
#[derive(Debug, Default)]
pub struct ResampleEngine {
    /// `None` until initialised; one kernel slot per session.
    sessions: Mutex<Option<Vec<Option<ScaleKernel>>>>,
}

impl ResampleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn kernel(&self, session: SessionId) -> Result<ScaleKernel, EngineFault> {
        let sessions = self.sessions.lock();
        let slots = sessions.as_ref().ok_or(EngineFault::NotInitialised)?;
        slots
            .get(session.index())
            .copied()
            .flatten()
            .ok_or(EngineFault::InactiveSession(session))
    }
}

impl ScaleEngine for ResampleEngine {
    fn initialize(&self, max_sessions: usize) -> Result<(), EngineFault> {
        let mut sessions = self.sessions.lock();
        if sessions.is_some() {
            return Err(EngineFault::AlreadyInitialised);
        }
        *sessions = Some(vec![None; max_sessions]);
        Ok(())
    }

    fn supported_filters(&self) -> Vec<String> {
        ScaleKernel::ALL.iter().map(|k| k.name().to_string()).collect()
    }

    fn begin(&self, session: SessionId, filter: &str) -> Result<(), EngineFault> {
        let kernel =
            ScaleKernel::from_name(filter).ok_or_else(|| EngineFault::Init(format!("Unknown filter '{filter}'")))?;
        let mut sessions = self.sessions.lock();
        let slots = sessions.as_mut().ok_or(EngineFault::NotInitialised)?;
        let slot = slots
            .get_mut(session.index())
            .ok_or(EngineFault::InactiveSession(session))?;
        if slot.is_some() {
            return Err(EngineFault::Init(format!("Session {session} already begun")));
        }
        *slot = Some(kernel);
        Ok(())
    }

    fn scale_into(
        &self,
        session: SessionId,
        src: &ByteImage,
        dst_width: u32,
        dst_height: u32,
        dst: &mut [u8],
    ) -> Result<(), EngineFault> {
        let kernel = self.kernel(session)?;
        let needed = byte_len(dst_width, dst_height, src.layout())
            .ok_or_else(|| EngineFault::Scale(format!("Output size {dst_width}x{dst_height} overflows")))?;
        if dst.len() < needed {
            return Err(EngineFault::Scale(format!(
                "Output buffer holds {} bytes, {needed} required",
                dst.len()
            )));
        }
        let dst = &mut dst[..needed];
        trace!(session = %session, kernel = %kernel, dst_width, dst_height, "Resampling");

        let Some(filter) = kernel.to_image_filter() else {
            area_average(src, dst_width, dst_height, dst);
            return Ok(());
        };
        match src.layout() {
            PixelLayout::Intensity => resize_as::<Luma<u8>>(src, dst_width, dst_height, filter, dst),
            PixelLayout::IntensityAlpha => resize_as::<LumaA<u8>>(src, dst_width, dst_height, filter, dst),
            PixelLayout::Rgb => resize_as::<Rgb<u8>>(src, dst_width, dst_height, filter, dst),
            PixelLayout::Rgba => resize_as::<Rgba<u8>>(src, dst_width, dst_height, filter, dst),
        }
    }

    fn end(&self, session: SessionId) {
        if let Some(slots) = self.sessions.lock().as_mut() {
            if let Some(slot) = slots.get_mut(session.index()) {
                *slot = None;
            }
        }
    }
}

fn resize_as<P>(
    src: &ByteImage,
    dst_width: u32,
    dst_height: u32,
    filter: image::imageops::FilterType,
    dst: &mut [u8],
) -> Result<(), EngineFault>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let len = byte_len(src.width(), src.height(), src.layout())
        .ok_or_else(|| EngineFault::Scale("Source size overflows".to_string()))?;
    let buffer: ImageBuffer<P, Vec<u8>> = ImageBuffer::from_raw(src.width(), src.height(), src.data()[..len].to_vec())
        .ok_or_else(|| EngineFault::Scale("Source buffer does not match its dimensions".to_string()))?;
    let resized = image::imageops::resize(&buffer, dst_width, dst_height, filter);
    dst.copy_from_slice(resized.as_raw());
    Ok(())
}

/// Length of `[a, b)` that falls inside source pixel `i`.
#[inline]
fn coverage(a: f64, b: f64, i: u32) -> f64 {
    let lo = a.max(i as f64);
    let hi = b.min(i as f64 + 1.0);
    (hi - lo).max(0.0)
}

fn area_average(src: &ByteImage, dst_width: u32, dst_height: u32, dst: &mut [u8]) {
    let n = src.components();
    let x_scale = src.width() as f64 / dst_width as f64;
    let y_scale = src.height() as f64 / dst_height as f64;
    let mut acc = vec![0.0f64; n];

    for (dy, out_row) in dst.chunks_exact_mut(dst_width as usize * n).enumerate() {
        let y0 = dy as f64 * y_scale;
        let y1 = y0 + y_scale;
        let sy_range = (y0.floor() as u32)..(y1.ceil() as u32).min(src.height());

        for (dx, out) in out_row.chunks_exact_mut(n).enumerate() {
            let x0 = dx as f64 * x_scale;
            let x1 = x0 + x_scale;
            let sx_range = (x0.floor() as u32)..(x1.ceil() as u32).min(src.width());

            acc.fill(0.0);
            let mut total = 0.0;
            for sy in sy_range.clone() {
                let wy = coverage(y0, y1, sy);
                let Some(row) = src.row(sy) else { continue };
                for sx in sx_range.clone() {
                    let w = wy * coverage(x0, x1, sx);
                    let px = &row[sx as usize * n..sx as usize * n + n];
                    for (a, &v) in acc.iter_mut().zip(px) {
                        *a += w * v as f64;
                    }
                    total += w;
                }
            }

            if total > 0.0 {
                for (o, a) in out.iter_mut().zip(&acc) {
                    *o = (a / total).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
    }
}
