//! Skywatch
//!
//! This crate implements the real-time motion-triggered capture pipeline for
//! sky observation: it samples a live camera stream, detects moving objects
//! by frame differencing, and turns each detection into a bundle of
//! artifacts (video, still photo, technical report, analysis verdict).
//!
//! # Architecture
//!
//! The pipeline runs on a single cooperative event loop:
//!
//! 1. **Camera sessions**: exactly one live stream at a time, torn down before
//!    the next is acquired.
//! 2. **Detection loop**: every 500ms a downsampled frame is compared with the
//!    previous one; a region of change above the configured thresholds
//!    triggers a capture.
//! 3. **Single-flight captures**: one capture lifecycle at a time, no queueing.
//!    Recording and analysis run as independent tasks joined before
//!    finalization.
//! 4. **Cooldown**: automatic captures close a timed gate after they finish.
//! 5. **Degraded bundles, never dropped ones**: oracle, recording and photo
//!    failures downgrade the bundle and are reported as notices.
//!
//! # Module Structure
//!
//! - `camera`: Camera session manager and backends (synthetic, V4L2)
//! - `frame`: Video frames and the frame sampler
//! - `detect`: Motion detector and overlay region
//! - `cooldown`: Capture cooldown gate
//! - `capture`: Recording orchestrator (capture state machine)
//! - `recorder` / `media`: Fixed-duration MJPEG recording and seeking
//! - `oracle`: Analysis oracle interface and HTTP client
//! - `artifact`: Photo/report derivation and event bundles
//! - `storage` / `archive`: Event store, blob store and the persistence handoff
//! - `watch`: Detection loop and the top-level `Skywatch` controller
//! - `command` / `config`: Daemon command channel and configuration loading

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub mod archive;
pub mod artifact;
pub mod camera;
pub mod capture;
pub mod command;
pub mod config;
pub mod cooldown;
pub mod detect;
pub mod frame;
pub mod media;
pub mod notice;
pub mod oracle;
pub mod recorder;
pub mod settings;
pub mod storage;
pub mod watch;

pub use archive::{EventArchive, PersistError};
pub use artifact::{Artifact, ArtifactGenerator, BundleIssue, CaptureContext, EventBundle};
pub use camera::{
    CameraBackend, CameraError, CameraSessionManager, DeviceInfo, FacingMode, StreamConstraints,
    StreamHandle, StreamSession, SwitchOutcome, SyntheticBackend, SyntheticScene,
    TeardownListener, VideoStream,
};
pub use capture::{
    CaptureHandle, CaptureOrchestrator, CaptureOrchestratorBuilder, CaptureOutcome, CaptureState,
    TriggerRejected,
};
pub use command::Command;
pub use config::SkywatchConfig;
pub use cooldown::CooldownGate;
pub use detect::{DetectionRegion, MotionDetector, MotionParams, RegionOverlay, SharedDetector};
pub use frame::{FrameError, FrameSampler, SampledFrame, VideoFrame};
pub use media::{MediaError, MediaFormat, MjpegWriter, RecordedMedia};
pub use notice::{Notice, NoticeCategory, Notifier, Severity};
pub use oracle::{
    AnalysisOracle, AnalysisVerdict, HttpOracle, ImagePayload, OracleError, UnavailableOracle,
};
pub use recorder::{Recorder, RecordingError};
pub use settings::{Settings, SharedSettings};
pub use storage::{
    BlobStore, EventRecord, EventStore, FilesystemBlobStore, InMemoryBlobStore,
    InMemoryEventStore, SettingsStore, SqliteEventStore, StoreError, StoredBlob,
};
pub use watch::{DetectionLoop, SharedOverlay, Skywatch, TickOutcome};

// -------------------- Triggers --------------------

/// What requested a capture lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Auto,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Auto => "auto",
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------------------- Capture Events --------------------

const EVENT_SUFFIX_LEN: usize = 6;

/// The unit of work produced by a trigger.
///
/// The id and media name are derived from the capture instant; the id also
/// carries a random suffix so two captures in the same millisecond differ.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureEvent {
    pub id: String,
    pub source: TriggerSource,
    pub captured_at: DateTime<Utc>,
    pub media_name: String,
}

impl CaptureEvent {
    pub fn new(source: TriggerSource, captured_at: DateTime<Utc>) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(EVENT_SUFFIX_LEN)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        Self::with_suffix(source, captured_at, &suffix)
    }

    pub fn with_suffix(source: TriggerSource, captured_at: DateTime<Utc>, suffix: &str) -> Self {
        Self {
            id: format!("{}-{}", captured_at.timestamp_millis(), suffix),
            source,
            captured_at,
            media_name: media_name_for(captured_at),
        }
    }
}

/// Deterministic media name for a capture instant.
pub fn media_name_for(captured_at: DateTime<Utc>) -> String {
    format!("sky_{}", captured_at.format("%Y-%m-%d_%H-%M-%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_identity_derives_from_instant() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 21, 5, 9).unwrap();
        let ev = CaptureEvent::with_suffix(TriggerSource::Auto, at, "abc123");
        assert_eq!(ev.id, format!("{}-abc123", at.timestamp_millis()));
        assert_eq!(ev.media_name, "sky_2026-03-14_21-05-09");
    }

    #[test]
    fn random_suffixes_keep_ids_unique() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 21, 5, 9).unwrap();
        let a = CaptureEvent::new(TriggerSource::Manual, at);
        let b = CaptureEvent::new(TriggerSource::Manual, at);
        assert_eq!(a.media_name, b.media_name);
        assert_ne!(a.id, b.id);
        assert!(a.id.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
