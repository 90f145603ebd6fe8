//! Artifact generation.
//!
//! Turns the outcome of one capture lifecycle into an `EventBundle`:
//! the recorded video, a still photo taken from it, and a plain-text
//! technical report. Missing pieces downgrade the bundle (recorded as
//! `BundleIssue`s); the report is always produced.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

use crate::camera::FacingMode;
use crate::media::RecordedMedia;
use crate::oracle::{AnalysisVerdict, OracleError};
use crate::recorder::RecordingError;
use crate::settings::Settings;
use crate::CaptureEvent;

pub const DEFAULT_PHOTO_OFFSET: Duration = Duration::from_millis(100);
pub const DEFAULT_PHOTO_QUALITY: u8 = 90;

const VIDEO_SUFFIX: &str = "_video_5s";
const PHOTO_SUFFIX: &str = "_photo.jpg";
const REPORT_SUFFIX: &str = "_data.txt";

pub const ANALYSIS_UNAVAILABLE: &str = "ANALYSIS UNAVAILABLE";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Why a bundle is not complete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "camelCase")]
pub enum BundleIssue {
    AnalysisUnavailable(String),
    RecordingFailed(String),
    PhotoOmitted(String),
}

impl std::fmt::Display for BundleIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleIssue::AnalysisUnavailable(r) => write!(f, "analysis unavailable: {}", r),
            BundleIssue::RecordingFailed(r) => write!(f, "recording failed: {}", r),
            BundleIssue::PhotoOmitted(r) => write!(f, "photo omitted: {}", r),
        }
    }
}

/// Technical context captured at trigger time.
#[derive(Clone, Debug)]
pub struct CaptureContext {
    pub event: CaptureEvent,
    pub device_label: String,
    pub facing: Option<FacingMode>,
    pub width: u32,
    pub height: u32,
    pub settings: Settings,
}

#[derive(Clone, Debug)]
pub struct EventBundle {
    pub context: CaptureContext,
    pub verdict: Option<AnalysisVerdict>,
    pub video: Option<Artifact>,
    pub photo: Option<Artifact>,
    pub report: Artifact,
    pub issues: Vec<BundleIssue>,
}

impl EventBundle {
    pub fn event(&self) -> &CaptureEvent {
        &self.context.event
    }

    pub fn is_complete(&self) -> bool {
        self.issues.is_empty()
            && self.verdict.is_some()
            && self.video.is_some()
            && self.photo.is_some()
    }

    /// Present artifacts in upload order: video, photo, report.
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.video
            .iter()
            .chain(self.photo.iter())
            .chain(std::iter::once(&self.report))
    }
}

#[derive(Clone, Debug)]
pub struct ArtifactGenerator {
    photo_offset: Duration,
    photo_quality: u8,
}

impl Default for ArtifactGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_PHOTO_OFFSET)
    }
}

impl ArtifactGenerator {
    pub fn new(photo_offset: Duration) -> Self {
        Self {
            photo_offset,
            photo_quality: DEFAULT_PHOTO_QUALITY,
        }
    }

    pub fn with_photo_quality(mut self, quality: u8) -> Self {
        self.photo_quality = quality.clamp(1, 100);
        self
    }

    pub async fn finalize(
        &self,
        recording: Result<RecordedMedia, RecordingError>,
        analysis: Result<AnalysisVerdict, OracleError>,
        context: CaptureContext,
    ) -> EventBundle {
        let media_name = context.event.media_name.clone();
        let mut issues = Vec::new();

        let verdict = match analysis {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                issues.push(BundleIssue::AnalysisUnavailable(e.to_string()));
                None
            }
        };

        let media = match recording {
            Ok(media) if media.is_empty() => {
                issues.push(BundleIssue::RecordingFailed(
                    "recording contains no frames".to_string(),
                ));
                None
            }
            Ok(media) => Some(media),
            Err(e) => {
                issues.push(BundleIssue::RecordingFailed(e.to_string()));
                None
            }
        };

        let mut photo = None;
        if let Some(media) = &media {
            match self.extract_photo(media).await {
                Ok(bytes) => {
                    photo = Some(Artifact {
                        file_name: format!("{}{}", media_name, PHOTO_SUFFIX),
                        mime_type: "image/jpeg".to_string(),
                        bytes,
                    })
                }
                Err(reason) => {
                    log::warn!("ArtifactGenerator: photo omitted for {}: {}", media_name, reason);
                    issues.push(BundleIssue::PhotoOmitted(reason));
                }
            }
        }

        let report = Artifact {
            file_name: format!("{}{}", media_name, REPORT_SUFFIX),
            mime_type: "text/plain; charset=utf-8".to_string(),
            bytes: render_report(&context, media.as_ref(), verdict.as_ref(), &issues).into_bytes(),
        };

        let video = media.map(|media| Artifact {
            file_name: format!("{}{}.{}", media_name, VIDEO_SUFFIX, media.format.extension),
            mime_type: media.format.mime_type.to_string(),
            bytes: media.bytes,
        });

        log::info!(
            "ArtifactGenerator: bundle {} ready (video: {}, photo: {}, verdict: {}, issues: {})",
            context.event.id,
            video.is_some(),
            photo.is_some(),
            verdict.is_some(),
            issues.len()
        );
        EventBundle {
            context,
            verdict,
            video,
            photo,
            report,
            issues,
        }
    }

    async fn extract_photo(&self, media: &RecordedMedia) -> Result<Vec<u8>, String> {
        let media = media.clone();
        let offset = self.photo_offset;
        let quality = self.photo_quality;
        tokio::task::spawn_blocking(move || {
            let frame = media.frame_at(offset).map_err(|e| e.to_string())?;
            frame.to_jpeg(quality).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| format!("photo task failed: {}", e))?
    }
}

// ----------------------------------------------------------------------------
// Technical report
// ----------------------------------------------------------------------------

fn render_report(
    context: &CaptureContext,
    media: Option<&RecordedMedia>,
    verdict: Option<&AnalysisVerdict>,
    issues: &[BundleIssue],
) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_report(&mut out, context, media, verdict, issues);
    out
}

fn write_report(
    out: &mut String,
    context: &CaptureContext,
    media: Option<&RecordedMedia>,
    verdict: Option<&AnalysisVerdict>,
    issues: &[BundleIssue],
) -> std::fmt::Result {
    let event = &context.event;
    let settings = &context.settings;

    writeln!(out, "SKYWATCH CAPTURE REPORT")?;
    writeln!(out, "=======================")?;
    writeln!(out, "Event ID:     {}", event.id)?;
    writeln!(out, "Media name:   {}", event.media_name)?;
    writeln!(out, "Trigger:      {}", event.source)?;
    writeln!(
        out,
        "Captured at:  {}",
        event
            .captured_at
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    )?;
    writeln!(out, "Camera:       {}", context.device_label)?;
    writeln!(
        out,
        "Facing mode:  {}",
        context.facing.map(|f| f.as_str()).unwrap_or("unknown")
    )?;
    writeln!(out, "Resolution:   {}x{}", context.width, context.height)?;
    writeln!(out)?;

    writeln!(out, "Detection settings")?;
    writeln!(out, "  Motion sensitivity: {}", settings.motion_sensitivity)?;
    writeln!(out, "  Min brightness:     {}", settings.min_brightness)?;
    writeln!(out, "  Min object size:    {}", settings.min_object_size)?;
    writeln!(
        out,
        "  Auto detection:     {}",
        if settings.enable_auto_motion_detection {
            "enabled"
        } else {
            "disabled"
        }
    )?;
    writeln!(out)?;

    writeln!(out, "Recording")?;
    match media {
        Some(media) => {
            writeln!(
                out,
                "  Format:    {} ({}/{} @ {} fps)",
                media.format.mime_type, media.format.container, media.format.codec, media.format.fps
            )?;
            writeln!(out, "  Frames:    {}", media.frame_count)?;
            writeln!(out, "  Size:      {}x{}", media.width, media.height)?;
            writeln!(out, "  Duration:  {:.1}s", media.duration.as_secs_f32())?;
            writeln!(out, "  Truncated: {}", if media.truncated { "yes" } else { "no" })?;
        }
        None => writeln!(out, "  NO RECORDING")?,
    }
    writeln!(out)?;

    writeln!(out, "Analysis")?;
    match verdict {
        Some(v) => {
            writeln!(out, "  Anomaly grade:                {}", v.anomaly_grade)?;
            writeln!(
                out,
                "  Probability of genuine event: {:.2}",
                v.probability_of_genuine_event
            )?;
            writeln!(out, "  Summary:                      {}", v.summary)?;
            writeln!(out, "  Technical details:            {}", v.technical_details)?;
            let comparisons = v.database_comparisons.trim();
            writeln!(
                out,
                "  Database comparisons:         {}",
                if comparisons.is_empty() {
                    "none"
                } else {
                    comparisons
                }
            )?;
        }
        None => writeln!(out, "  {}", ANALYSIS_UNAVAILABLE)?,
    }

    if !issues.is_empty() {
        writeln!(out)?;
        writeln!(out, "Issues")?;
        for issue in issues {
            writeln!(out, "  - {}", issue)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::VideoFrame;
    use crate::media::{MediaFormat, MjpegWriter};
    use crate::TriggerSource;
    use chrono::TimeZone;

    fn context() -> CaptureContext {
        let at = chrono::Utc.with_ymd_and_hms(2026, 8, 12, 2, 30, 0).unwrap();
        CaptureContext {
            event: CaptureEvent::with_suffix(TriggerSource::Auto, at, "q1w2e3"),
            device_label: "Synthetic sky (rear)".to_string(),
            facing: Some(FacingMode::Environment),
            width: 32,
            height: 16,
            settings: Settings::default(),
        }
    }

    fn media(frames: u32) -> RecordedMedia {
        let mut writer = MjpegWriter::new();
        for i in 0..frames {
            let level = (i * 20) as u8;
            let jpeg = VideoFrame::filled(32, 16, [level, level, level])
                .unwrap()
                .to_jpeg(90)
                .unwrap();
            writer.push(&jpeg).unwrap();
        }
        RecordedMedia {
            frame_count: writer.frame_count(),
            bytes: writer.into_bytes(),
            format: MediaFormat::mjpeg(10),
            width: 32,
            height: 16,
            duration: Duration::from_millis(100 * frames as u64),
            truncated: false,
        }
    }

    fn verdict() -> AnalysisVerdict {
        AnalysisVerdict {
            technical_details: "streak, 3 px wide".to_string(),
            anomaly_grade: "C".to_string(),
            database_comparisons: "Starlink train, 12 objects".to_string(),
            probability_of_genuine_event: 0.25,
            summary: "probable satellite".to_string(),
        }
    }

    #[tokio::test]
    async fn complete_bundle_has_named_artifacts() {
        let bundle = ArtifactGenerator::default()
            .finalize(Ok(media(5)), Ok(verdict()), context())
            .await;

        assert!(bundle.is_complete());
        let names: Vec<&str> = bundle.artifacts().map(|a| a.file_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "sky_2026-08-12_02-30-00_video_5s.mjpeg",
                "sky_2026-08-12_02-30-00_photo.jpg",
                "sky_2026-08-12_02-30-00_data.txt",
            ]
        );

        // The photo is frame 1 (0.1s at 10 fps), level 20.
        let photo = VideoFrame::from_jpeg(&bundle.photo.unwrap().bytes).unwrap();
        assert!((photo.pixels()[0] as i32 - 20).abs() < 8);

        let report = String::from_utf8(bundle.report.bytes).unwrap();
        assert!(report.contains("Captured at:  2026-08-12T02:30:00.000Z"));
        assert!(report.contains("probable satellite"));
        assert!(report.contains("Database comparisons:         Starlink train, 12 objects"));
        assert!(report.contains("Frames:    5"));
        assert!(!report.contains(ANALYSIS_UNAVAILABLE));
    }

    #[tokio::test]
    async fn oracle_failure_keeps_video_and_flags_report() {
        let bundle = ArtifactGenerator::default()
            .finalize(
                Ok(media(3)),
                Err(OracleError::Transport("connection refused".to_string())),
                context(),
            )
            .await;

        assert!(!bundle.is_complete());
        assert!(bundle.video.is_some());
        assert!(bundle.verdict.is_none());
        assert!(matches!(bundle.issues[0], BundleIssue::AnalysisUnavailable(_)));
        let report = String::from_utf8(bundle.report.bytes).unwrap();
        assert!(report.contains(ANALYSIS_UNAVAILABLE));
    }

    #[tokio::test]
    async fn single_frame_recording_still_yields_photo() {
        let bundle = ArtifactGenerator::default()
            .finalize(Ok(media(1)), Ok(verdict()), context())
            .await;
        assert!(bundle.photo.is_some());
    }

    #[tokio::test]
    async fn corrupt_recording_omits_photo_only() {
        let mut broken = media(2);
        broken.bytes.truncate(40);
        let bundle = ArtifactGenerator::default()
            .finalize(Ok(broken), Ok(verdict()), context())
            .await;
        assert!(bundle.video.is_some());
        assert!(bundle.photo.is_none());
        assert!(matches!(bundle.issues[..], [BundleIssue::PhotoOmitted(_)]));
    }

    #[tokio::test]
    async fn failed_recording_yields_report_only_bundle() {
        let bundle = ArtifactGenerator::default()
            .finalize(
                Err(RecordingError::NoStream),
                Err(OracleError::NotConfigured),
                context(),
            )
            .await;
        assert_eq!(bundle.artifacts().count(), 1);
        assert_eq!(bundle.issues.len(), 2);
        let report = String::from_utf8(bundle.report.bytes).unwrap();
        assert!(report.contains("NO RECORDING"));
    }
}
