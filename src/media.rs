//! Recording container.
//!
//! Recordings are Motion JPEG: a plain concatenation of baseline JPEG
//! images at a fixed frame rate. Seeking walks the JPEG segment structure
//! to find frame boundaries; entropy-coded data is scanned for the next
//! real marker, so `FF D9` bytes inside segment payloads never split a
//! frame.

use serde::Serialize;
use std::ops::Range;
use std::time::Duration;
use thiserror::Error;

use crate::frame::{FrameError, VideoFrame};

pub const MJPEG_MIME: &str = "video/x-motion-jpeg";

/// Negotiated recording format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub container: &'static str,
    pub codec: &'static str,
    pub mime_type: &'static str,
    pub extension: &'static str,
    pub fps: u32,
}

impl MediaFormat {
    pub fn mjpeg(fps: u32) -> Self {
        Self {
            container: "mjpeg",
            codec: "jpeg",
            mime_type: MJPEG_MIME,
            extension: "mjpeg",
            fps: fps.max(1),
        }
    }

    /// Pick the first preferred mime type this recorder can produce.
    ///
    /// An empty preference list accepts the default format. Parameters such
    /// as `;codecs=` are ignored when matching.
    pub fn negotiate(preferred: &[String], fps: u32) -> Option<Self> {
        if preferred.is_empty() {
            return Some(Self::mjpeg(fps));
        }
        preferred
            .iter()
            .map(|mime| mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .find(|mime| mime == MJPEG_MIME || mime == "video/mjpeg")
            .map(|_| Self::mjpeg(fps))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("recording contains no frames")]
    Empty,
    #[error("truncated jpeg segment at byte {0}")]
    Truncated(usize),
    #[error("unexpected byte 0x{byte:02x} at {offset}; expected a jpeg marker")]
    BadMarker { offset: usize, byte: u8 },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ----------------------------------------------------------------------------
// RecordedMedia
// ----------------------------------------------------------------------------

/// Raw recording bytes plus what is needed to interpret them.
#[derive(Clone, Debug)]
pub struct RecordedMedia {
    pub bytes: Vec<u8>,
    pub format: MediaFormat,
    pub frame_count: u32,
    pub width: u32,
    pub height: u32,
    pub duration: Duration,
    /// The stream ended before the requested duration elapsed.
    pub truncated: bool,
}

impl RecordedMedia {
    pub fn is_empty(&self) -> bool {
        self.frame_count == 0 || self.bytes.is_empty()
    }

    /// Decode the frame shown at `offset`, clamped to the last frame.
    pub fn frame_at(&self, offset: Duration) -> Result<VideoFrame, MediaError> {
        decode_frame_at(&self.bytes, self.format.fps, offset)
    }
}

/// Appends encoded JPEG frames into an MJPEG byte stream.
#[derive(Debug, Default)]
pub struct MjpegWriter {
    bytes: Vec<u8>,
    frames: u32,
}

impl MjpegWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, jpeg: &[u8]) -> Result<(), MediaError> {
        if jpeg.len() < 4 || jpeg[..2] != [0xFF, 0xD8] {
            return Err(MediaError::BadMarker {
                offset: 0,
                byte: jpeg.first().copied().unwrap_or(0),
            });
        }
        self.bytes.extend_from_slice(jpeg);
        self.frames += 1;
        Ok(())
    }

    pub fn frame_count(&self) -> u32 {
        self.frames
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

// ----------------------------------------------------------------------------
// Segment walker
// ----------------------------------------------------------------------------

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;

fn is_standalone(marker: u8) -> bool {
    matches!(marker, 0x01 | 0xD0..=0xD7)
}

/// Byte ranges of each complete JPEG image in an MJPEG stream.
pub fn frame_ranges(bytes: &[u8]) -> Result<Vec<Range<usize>>, MediaError> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let end = walk_image(bytes, pos)?;
        frames.push(pos..end);
        pos = end;
    }
    Ok(frames)
}

/// Walk one image starting at SOI; returns the offset just past its EOI.
fn walk_image(bytes: &[u8], start: usize) -> Result<usize, MediaError> {
    let marker_at = |pos: usize| -> Result<u8, MediaError> {
        match bytes.get(pos..pos + 2) {
            Some([0xFF, m]) => Ok(*m),
            Some([b, _]) => Err(MediaError::BadMarker {
                offset: pos,
                byte: *b,
            }),
            _ => Err(MediaError::Truncated(pos)),
        }
    };

    if marker_at(start)? != SOI {
        return Err(MediaError::BadMarker {
            offset: start + 1,
            byte: bytes[start + 1],
        });
    }
    let mut pos = start + 2;
    loop {
        // Fill bytes before a marker.
        while bytes.get(pos) == Some(&0xFF) && bytes.get(pos + 1) == Some(&0xFF) {
            pos += 1;
        }
        let marker = marker_at(pos)?;
        pos += 2;
        match marker {
            EOI => return Ok(pos),
            m if is_standalone(m) => {}
            m => {
                let len = match bytes.get(pos..pos + 2) {
                    Some(&[hi, lo]) => u16::from_be_bytes([hi, lo]) as usize,
                    _ => return Err(MediaError::Truncated(pos)),
                };
                if len < 2 || pos + len > bytes.len() {
                    return Err(MediaError::Truncated(pos));
                }
                pos += len;
                if m == SOS {
                    pos = skip_entropy_data(bytes, pos)?;
                }
            }
        }
    }
}

/// Advance past entropy-coded data to the next non-restart marker.
fn skip_entropy_data(bytes: &[u8], mut pos: usize) -> Result<usize, MediaError> {
    while pos + 1 < bytes.len() {
        if bytes[pos] == 0xFF {
            let next = bytes[pos + 1];
            if next == 0x00 || (0xD0..=0xD7).contains(&next) || next == 0xFF {
                pos += if next == 0xFF { 1 } else { 2 };
                continue;
            }
            return Ok(pos);
        }
        pos += 1;
    }
    Err(MediaError::Truncated(pos))
}

/// Decode the frame displayed `offset` into an MJPEG recording.
pub fn decode_frame_at(bytes: &[u8], fps: u32, offset: Duration) -> Result<VideoFrame, MediaError> {
    let frames = frame_ranges(bytes)?;
    if frames.is_empty() {
        return Err(MediaError::Empty);
    }
    let wanted = (offset.as_secs_f64() * fps.max(1) as f64).floor() as usize;
    let index = wanted.min(frames.len() - 1);
    let range = frames[index].clone();
    Ok(VideoFrame::from_jpeg(&bytes[range])?)
}
