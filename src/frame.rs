//! Video frames and frame sampling.
//!
//! - `VideoFrame`: full-resolution RGB8 raster grabbed from a live stream.
//! - `SampledFrame`: downscaled raster the motion detector compares.
//! - `FrameSampler`: block-averaging downsampler with a fixed integer factor.
//!
//! Frames never leave the process except as encoded artifacts (JPEG stills
//! and the MJPEG recording).

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;
use tokio::time::Instant;

/// Default downsample factor between source and sampled frames.
pub const DEFAULT_DOWNSAMPLE: u32 = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame dimensions overflow ({width}x{height})")]
    DimensionsOverflow { width: u32, height: u32 },
    #[error("frame length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("frame {width}x{height} is too small to downsample by {factor}")]
    TooSmall { width: u32, height: u32, factor: u32 },
    #[error("jpeg encoding failed: {0}")]
    Encode(String),
    #[error("jpeg decoding failed: {0}")]
    Decode(String),
}

fn rgb_len(width: u32, height: u32) -> Result<usize, FrameError> {
    width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(3))
        .map(|v| v as usize)
        .ok_or(FrameError::DimensionsOverflow { width, height })
}

// ----------------------------------------------------------------------------
// VideoFrame: full-resolution capture
// ----------------------------------------------------------------------------

/// Full-resolution RGB8 frame (row-major, 3 bytes per pixel).
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

impl VideoFrame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    /// Uniform frame, mostly useful for tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self, FrameError> {
        let len = rgb_len(width, height)?;
        let pixels = rgb.iter().copied().cycle().take(len).collect();
        Self::new(pixels, width, height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// Decode a single JPEG image into an RGB8 frame.
    pub fn from_jpeg(bytes: &[u8]) -> Result<Self, FrameError> {
        let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .to_rgb8();
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height)
    }

    /// Encode as baseline JPEG.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        encode_jpeg(&self.pixels, self.width, self.height, quality)
    }
}

pub(crate) fn encode_jpeg(
    pixels: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(pixels.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(pixels, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// SampledFrame: downscaled snapshot for comparison
// ----------------------------------------------------------------------------

/// Downscaled RGB8 raster with the factor back to source resolution.
#[derive(Clone, Debug)]
pub struct SampledFrame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Source pixels per sampled pixel along each axis.
    pub scale: u32,
    pub captured_at: Instant,
}

impl SampledFrame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, scale: u32) -> Result<Self, FrameError> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            pixels,
            width,
            height,
            scale: scale.max(1),
            captured_at: Instant::now(),
        })
    }

    /// Brightness as the mean of the three channels (0..=255).
    #[inline]
    pub fn brightness(&self, x: u32, y: u32) -> f32 {
        let idx = ((y as usize) * (self.width as usize) + x as usize) * 3;
        let px = &self.pixels[idx..idx + 3];
        (px[0] as f32 + px[1] as f32 + px[2] as f32) / 3.0
    }

    pub fn same_geometry(&self, other: &SampledFrame) -> bool {
        self.width == other.width && self.height == other.height && self.scale == other.scale
    }

    pub fn source_width(&self) -> u32 {
        self.width * self.scale
    }

    pub fn source_height(&self) -> u32 {
        self.height * self.scale
    }
}

// ----------------------------------------------------------------------------
// FrameSampler
// ----------------------------------------------------------------------------

/// Downsamples full-resolution frames by a fixed integer factor.
#[derive(Clone, Copy, Debug)]
pub struct FrameSampler {
    factor: u32,
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self::new(DEFAULT_DOWNSAMPLE)
    }
}

impl FrameSampler {
    pub fn new(factor: u32) -> Self {
        Self {
            factor: factor.max(1),
        }
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    /// Average each `factor x factor` block into one sampled pixel.
    ///
    /// Trailing rows/columns that do not fill a whole block are dropped.
    pub fn sample(&self, frame: &VideoFrame) -> Result<SampledFrame, FrameError> {
        let f = self.factor;
        let sw = frame.width / f;
        let sh = frame.height / f;
        if sw == 0 || sh == 0 {
            return Err(FrameError::TooSmall {
                width: frame.width,
                height: frame.height,
                factor: f,
            });
        }

        let src = frame.pixels();
        let src_stride = frame.width as usize * 3;
        let block = f * f;
        let mut out = Vec::with_capacity(rgb_len(sw, sh)?);
        for sy in 0..sh as usize {
            for sx in 0..sw as usize {
                let mut acc = [0u32; 3];
                for dy in 0..f as usize {
                    let row = (sy * f as usize + dy) * src_stride;
                    for dx in 0..f as usize {
                        let idx = row + (sx * f as usize + dx) * 3;
                        acc[0] += src[idx] as u32;
                        acc[1] += src[idx + 1] as u32;
                        acc[2] += src[idx + 2] as u32;
                    }
                }
                out.push((acc[0] / block) as u8);
                out.push((acc[1] / block) as u8);
                out.push((acc[2] / block) as u8);
            }
        }

        let mut sampled = SampledFrame::new(out, sw, sh, f)?;
        sampled.captured_at = frame.captured_at;
        Ok(sampled)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
