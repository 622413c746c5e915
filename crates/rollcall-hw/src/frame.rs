//! Frame type and pixel conversion — YUYV/Y16 to grayscale, RGB to luma.

use std::borrow::Cow;
use std::time::Instant;

/// A captured camera frame.
///
/// Frames are published behind an `Arc` and never mutated after capture.
/// Consumers must not assume a frame outlives the next acquisition.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Interleaved pixel data (`width * height * channels` bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// 1 for grayscale, 3 for RGB.
    pub channels: u8,
    /// Monotonic capture time.
    pub timestamp: Instant,
    /// Per-source publish counter, starting at 1.
    pub sequence: u64,
}

impl Frame {
    /// Build a grayscale frame, validating the buffer length.
    pub fn gray(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        Self::with_channels(data, width, height, 1)
    }

    /// Build a frame with the given channel count, validating the buffer length.
    pub fn with_channels(
        data: Vec<u8>,
        width: u32,
        height: u32,
        channels: u8,
    ) -> Result<Self, FrameError> {
        if channels != 1 && channels != 3 {
            return Err(FrameError::UnsupportedChannels(channels));
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
            timestamp: Instant::now(),
            sequence: 0,
        })
    }

    /// Grayscale view of the frame. Borrows when the frame is already single-channel.
    pub fn luma(&self) -> Cow<'_, [u8]> {
        match self.channels {
            1 => Cow::Borrowed(&self.data),
            _ => Cow::Owned(rgb_to_luma(&self.data)),
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
/// Grayscale = every even-indexed byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Downscale 16-bit little-endian grayscale to 8-bit by keeping the high byte.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    let expected = pixels * 2;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(buf[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// ITU-R BT.601 luma from interleaved RGB, integer weights summing to 256.
pub fn rgb_to_luma(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .map(|px| {
            let y = 77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32;
            (y >> 8) as u8
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u8),
}
