use crate::frame::{FrameError, VideoFrame};

/// Pixel layouts a V4L2 device may hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"NV12" => Some(PixelFormat::Nv12),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

/// Convert one captured buffer into an RGB8 frame.
pub(crate) fn to_video_frame(
    buf: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<VideoFrame, FrameError> {
    match format {
        PixelFormat::Rgb24 => {
            let expected = width
                .checked_mul(height)
                .and_then(|v| v.checked_mul(3))
                .ok_or(FrameError::DimensionsOverflow { width, height })?
                as usize;
            // Drivers may pad the mmap buffer past the image.
            if buf.len() < expected {
                return Err(FrameError::LengthMismatch {
                    expected,
                    actual: buf.len(),
                });
            }
            VideoFrame::new(buf[..expected].to_vec(), width, height)
        }
        PixelFormat::Nv12 => VideoFrame::new(nv12_to_rgb(buf, width, height)?, width, height),
        PixelFormat::Mjpeg => VideoFrame::from_jpeg(buf),
    }
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or(FrameError::DimensionsOverflow { width, height })?;
    let expected = y_plane + y_plane / 2;
    if pixels.len() < expected {
        return Err(FrameError::LengthMismatch {
            expected,
            actual: pixels.len(),
        });
    }

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let offset = (j * w + i) * 3;
            rgb[offset] = clamp_to_u8(y + 1.402 * v);
            rgb[offset + 1] = clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v);
            rgb[offset + 2] = clamp_to_u8(y + 1.772 * u);
        }
    }

    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
