//! Analysis frames.
//!
//! A `Frame` is the low-resolution, single-channel intensity image the motion
//! model consumes. Capture backends convert whatever the sensor delivers into
//! this layout before handing it to the controller:
//! - packed RGB24: the first channel is kept (the sensor runs with a
//!   monochrome color effect, so all channels carry the same signal)
//! - YUYV 4:2:2: the luma samples are kept
//! - GREY: passed through
//!
//! Frames never reach disk through this type; the encoded stream is written by
//! the capture device itself.

use anyhow::{anyhow, Result};
use std::borrow::Cow;

/// Single-channel 8-bit frame at analysis resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    /// Wrap an 8-bit grayscale buffer. The buffer length must be `width * height`.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = pixel_count(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "gray frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Frame with every pixel set to `value`.
    pub fn filled(width: u32, height: u32, value: u8) -> Result<Self> {
        let len = pixel_count(width, height)?;
        Self::new(width, height, vec![value; len])
    }

    /// Keep the first channel of a packed RGB24 buffer.
    pub fn from_rgb24(width: u32, height: u32, rgb: &[u8]) -> Result<Self> {
        let expected = pixel_count(width, height)?
            .checked_mul(3)
            .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))?;
        if rgb.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                rgb.len()
            ));
        }
        let pixels = rgb.chunks_exact(3).map(|px| px[0]).collect();
        Self::new(width, height, pixels)
    }

    /// Keep the luma samples of a packed YUYV buffer.
    pub fn from_yuyv(width: u32, height: u32, yuyv: &[u8]) -> Result<Self> {
        let expected = pixel_count(width, height)?
            .checked_mul(2)
            .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
        if yuyv.len() < expected {
            return Err(anyhow!(
                "YUYV frame too short: expected {}, got {}",
                expected,
                yuyv.len()
            ));
        }
        let pixels = yuyv[..expected].iter().step_by(2).copied().collect();
        Self::new(width, height, pixels)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn same_dimensions(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}

/// Strip row padding from a driver buffer.
///
/// `stride` is the driver's bytes-per-line (0 means unpadded). Trailing bytes
/// after the last row are ignored. Unpadded buffers are borrowed, not copied.
pub(crate) fn pack_rows(
    buf: &[u8],
    row_bytes: usize,
    stride: usize,
    rows: usize,
) -> Result<Cow<'_, [u8]>> {
    let stride = stride.max(row_bytes);
    let needed = rows
        .checked_sub(1)
        .and_then(|full| full.checked_mul(stride))
        .and_then(|n| n.checked_add(row_bytes))
        .ok_or_else(|| anyhow!("invalid row layout ({} rows of {} bytes)", rows, row_bytes))?;
    if buf.len() < needed {
        return Err(anyhow!(
            "frame buffer too short: expected {} bytes, got {}",
            needed,
            buf.len()
        ));
    }
    if stride == row_bytes {
        return Ok(Cow::Borrowed(&buf[..row_bytes * rows]));
    }
    let mut packed = Vec::with_capacity(row_bytes * rows);
    for row in buf.chunks(stride).take(rows) {
        packed.extend_from_slice(&row[..row_bytes]);
    }
    Ok(Cow::Owned(packed))
}

pub(crate) fn pixel_count(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(anyhow!("frame dimensions must be non-zero"));
    }
    (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
