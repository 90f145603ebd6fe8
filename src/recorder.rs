//! Fixed-duration recorder.
//!
//! Pulls frames from the live stream at its frame rate, JPEG-encodes them
//! off the event loop and appends them to an MJPEG recording. The recording
//! stops at the deadline no matter what else is in flight; if the stream is
//! torn down first, whatever was captured so far is returned as a
//! truncated recording.

use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};

use crate::camera::{CameraError, StreamHandle};
use crate::media::{MediaFormat, MjpegWriter, RecordedMedia};

pub const DEFAULT_RECORD_DURATION: Duration = Duration::from_secs(5);
pub const DEFAULT_RECORD_QUALITY: u8 = 85;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordingError {
    #[error("no live stream to record from")]
    NoStream,
    #[error("no supported recording format among: {0}")]
    UnsupportedFormat(String),
    #[error("recording produced no frames: {reason}")]
    Empty { reason: String },
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

#[derive(Clone, Debug)]
pub struct Recorder {
    duration: Duration,
    format: MediaFormat,
    quality: u8,
}

enum Grabbed {
    Frame { jpeg: Vec<u8>, width: u32, height: u32 },
    /// Grab or encode failure for one frame; recording goes on.
    Dropped(String),
    Ended,
}

impl Recorder {
    pub fn new(duration: Duration, format: MediaFormat) -> Self {
        Self {
            duration,
            format,
            quality: DEFAULT_RECORD_QUALITY,
        }
    }

    /// Build a recorder for the first supported mime type in `preferred`.
    pub fn negotiate(
        duration: Duration,
        preferred: &[String],
        fps: u32,
    ) -> Result<Self, RecordingError> {
        MediaFormat::negotiate(preferred, fps)
            .map(|format| Self::new(duration, format))
            .ok_or_else(|| RecordingError::UnsupportedFormat(preferred.join(", ")))
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn format(&self) -> &MediaFormat {
        &self.format
    }

    pub async fn record(&self, stream: StreamHandle) -> Result<RecordedMedia, RecordingError> {
        if !stream.is_live() {
            return Err(RecordingError::NoStream);
        }

        let fps = self.format.fps.max(1);
        let start = Instant::now();
        let deadline = start + self.duration;
        let mut ticker = tokio::time::interval(Duration::from_secs(1) / fps);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut writer = MjpegWriter::new();
        let mut dims = (0, 0);
        let mut truncated = false;
        let mut dropped = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => break,
                _ = ticker.tick() => {}
            }

            match self.grab_encoded(&stream).await {
                Grabbed::Frame { jpeg, width, height } => match writer.push(&jpeg) {
                    Ok(()) => dims = (width, height),
                    Err(e) => {
                        dropped += 1;
                        log::warn!("Recorder: dropped frame: {}", e);
                    }
                },
                Grabbed::Dropped(reason) => {
                    dropped += 1;
                    log::warn!("Recorder: dropped frame: {}", reason);
                }
                Grabbed::Ended => {
                    truncated = true;
                    log::warn!(
                        "Recorder: stream ended after {:.1}s; keeping partial recording",
                        start.elapsed().as_secs_f32()
                    );
                    break;
                }
            }
        }

        let frame_count = writer.frame_count();
        if frame_count == 0 {
            let reason = if truncated {
                "stream ended before the first frame"
            } else {
                "no frames were delivered"
            };
            return Err(RecordingError::Empty {
                reason: reason.to_string(),
            });
        }

        let duration = start.elapsed().min(self.duration);
        log::info!(
            "Recorder: {} frames ({}x{}, {:.1}s, {} dropped{})",
            frame_count,
            dims.0,
            dims.1,
            duration.as_secs_f32(),
            dropped,
            if truncated { ", truncated" } else { "" }
        );
        Ok(RecordedMedia {
            bytes: writer.into_bytes(),
            format: self.format.clone(),
            frame_count,
            width: dims.0,
            height: dims.1,
            duration,
            truncated,
        })
    }

    async fn grab_encoded(&self, stream: &StreamHandle) -> Grabbed {
        let stream = stream.clone();
        let quality = self.quality;
        let task = tokio::task::spawn_blocking(move || match stream.grab() {
            Ok(frame) => match frame.to_jpeg(quality) {
                Ok(jpeg) => Grabbed::Frame {
                    jpeg,
                    width: frame.width,
                    height: frame.height,
                },
                Err(e) => Grabbed::Dropped(e.to_string()),
            },
            Err(CameraError::StreamEnded) => Grabbed::Ended,
            Err(e) => Grabbed::Dropped(e.to_string()),
        });
        match task.await {
            Ok(grabbed) => grabbed,
            Err(e) => Grabbed::Dropped(format!("encode task failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{
        CameraBackend, DeviceInfo, StreamConstraints, SyntheticBackend, VideoStream,
    };
    use crate::frame::VideoFrame;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Every third frame is too wide for the JPEG encoder.
    struct FlakyEncodeStream {
        device: DeviceInfo,
        grabs: AtomicU32,
    }

    impl VideoStream for FlakyEncodeStream {
        fn grab(&self) -> Result<VideoFrame, CameraError> {
            let n = self.grabs.fetch_add(1, Ordering::SeqCst);
            let (width, height) = if n % 3 == 2 { (70_000, 1) } else { (16, 8) };
            VideoFrame::filled(width, height, [40, 40, 40])
                .map_err(|e| CameraError::Backend(e.to_string()))
        }

        fn fps(&self) -> u32 {
            10
        }

        fn device(&self) -> &DeviceInfo {
            &self.device
        }

        fn stop(&self) {}
    }

    async fn open_stream(backend: &SyntheticBackend) -> StreamHandle {
        let constraints = StreamConstraints {
            ideal_width: 32,
            ideal_height: 24,
            fps: 10,
            ..StreamConstraints::default()
        };
        StreamHandle::new(1, backend.open(&constraints).await.unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn records_for_the_full_duration() {
        let backend = SyntheticBackend::sky();
        let stream = open_stream(&backend).await;
        let recorder = Recorder::new(DEFAULT_RECORD_DURATION, MediaFormat::mjpeg(10));

        let media = recorder.record(stream).await.unwrap();
        assert_eq!(media.frame_count, 50);
        assert_eq!((media.width, media.height), (32, 24));
        assert_eq!(media.duration, DEFAULT_RECORD_DURATION);
        assert!(!media.truncated);
        assert_eq!(crate::media::frame_ranges(&media.bytes).unwrap().len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_truncates_the_recording() {
        let backend = SyntheticBackend::sky();
        let stream = open_stream(&backend).await;
        let recorder = Recorder::new(DEFAULT_RECORD_DURATION, MediaFormat::mjpeg(10));

        let task = tokio::spawn({
            let stream = stream.clone();
            async move { recorder.record(stream).await }
        });
        tokio::time::sleep(Duration::from_millis(1050)).await;
        stream.shutdown();

        let media = task.await.unwrap().unwrap();
        assert!(media.truncated);
        assert!(media.frame_count > 0 && media.frame_count < 50);
        assert!(media.duration < DEFAULT_RECORD_DURATION);
    }

    #[tokio::test(start_paused = true)]
    async fn encode_failures_drop_single_frames() {
        let stream = StreamHandle::new(
            1,
            Box::new(FlakyEncodeStream {
                device: DeviceInfo {
                    id: "flaky".to_string(),
                    label: "flaky".to_string(),
                    facing: None,
                },
                grabs: AtomicU32::new(0),
            }),
        );
        let recorder = Recorder::new(Duration::from_secs(3), MediaFormat::mjpeg(10));

        let media = recorder.record(stream).await.unwrap();
        assert_eq!(media.frame_count, 20);
        assert_eq!((media.width, media.height), (16, 8));
        assert!(!media.truncated);
        assert_eq!(crate::media::frame_ranges(&media.bytes).unwrap().len(), 20);
    }

    #[tokio::test]
    async fn dead_stream_is_rejected() {
        let backend = SyntheticBackend::sky();
        let stream = open_stream(&backend).await;
        stream.shutdown();
        let recorder = Recorder::new(DEFAULT_RECORD_DURATION, MediaFormat::mjpeg(10));
        assert_eq!(recorder.record(stream).await.unwrap_err(), RecordingError::NoStream);
    }

    #[test]
    fn negotiation_failure_names_the_candidates() {
        let err = Recorder::negotiate(
            DEFAULT_RECORD_DURATION,
            &["video/mp4".to_string(), "video/webm".to_string()],
            10,
        )
        .unwrap_err();
        assert_eq!(
            err,
            RecordingError::UnsupportedFormat("video/mp4, video/webm".to_string())
        );
    }
}
