//! Recording orchestrator.
//!
//! Single-flight capture lifecycle: `Idle -> Recording -> Finalizing -> Idle`.
//! A trigger is accepted only from `Idle` with a live stream; there is no
//! queue. An accepted capture runs recording and analysis as two tasks,
//! joins them, builds the bundle, hands it to the archive and, for
//! automatic triggers, closes the cooldown gate before returning to `Idle`.

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};

use crate::archive::EventArchive;
use crate::artifact::{ArtifactGenerator, BundleIssue, CaptureContext, EventBundle};
use crate::camera::{CameraSessionManager, StreamHandle};
use crate::cooldown::{CooldownGate, DEFAULT_COOLDOWN};
use crate::media::{MediaFormat, RecordedMedia};
use crate::notice::{NoticeCategory, Notifier};
use crate::oracle::{AnalysisOracle, AnalysisVerdict, ImagePayload, OracleError};
use crate::recorder::{Recorder, RecordingError, DEFAULT_RECORD_DURATION};
use crate::settings::SharedSettings;
use crate::storage::EventRecord;
use crate::{CaptureEvent, TriggerSource};

const STILL_QUALITY: u8 = 85;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    /// Recording and analysis in flight.
    Recording,
    Finalizing,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TriggerRejected {
    #[error("a capture is already in progress")]
    Busy,
    #[error("no live camera stream")]
    NoStream,
}

/// Result of one finished capture lifecycle.
#[derive(Debug)]
pub struct CaptureOutcome {
    pub bundle: EventBundle,
    /// Background persistence, when an archive is attached.
    pub persisted: Option<JoinHandle<Option<EventRecord>>>,
}

/// An accepted capture.
#[derive(Debug)]
pub struct CaptureHandle {
    pub event: CaptureEvent,
    join: JoinHandle<CaptureOutcome>,
}

impl CaptureHandle {
    pub async fn wait(self) -> Result<CaptureOutcome, JoinError> {
        self.join.await
    }
}

struct Inner {
    state: Mutex<CaptureState>,
    camera: Arc<CameraSessionManager>,
    oracle: Arc<dyn AnalysisOracle>,
    settings: SharedSettings,
    notifier: Notifier,
    recorder: Recorder,
    artifacts: ArtifactGenerator,
    archive: Option<EventArchive>,
    cooldown: CooldownGate,
    cooldown_duration: Duration,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, CaptureState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: CaptureState) {
        let mut state = self.state();
        log::debug!("CaptureOrchestrator: {:?} -> {:?}", *state, next);
        *state = next;
    }
}

/// Returns the orchestrator to `Idle` however the capture task exits.
struct IdleOnDrop(Arc<Inner>);

impl Drop for IdleOnDrop {
    fn drop(&mut self) {
        self.0.set_state(CaptureState::Idle);
    }
}

pub struct CaptureOrchestratorBuilder {
    camera: Arc<CameraSessionManager>,
    oracle: Arc<dyn AnalysisOracle>,
    settings: SharedSettings,
    notifier: Notifier,
    recorder: Recorder,
    artifacts: ArtifactGenerator,
    archive: Option<EventArchive>,
    cooldown: CooldownGate,
    cooldown_duration: Duration,
}

impl CaptureOrchestratorBuilder {
    pub fn recorder(mut self, recorder: Recorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn artifacts(mut self, artifacts: ArtifactGenerator) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn archive(mut self, archive: EventArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn cooldown(mut self, gate: CooldownGate, duration: Duration) -> Self {
        self.cooldown = gate;
        self.cooldown_duration = duration;
        self
    }

    pub fn build(self) -> CaptureOrchestrator {
        CaptureOrchestrator {
            inner: Arc::new(Inner {
                state: Mutex::new(CaptureState::Idle),
                camera: self.camera,
                oracle: self.oracle,
                settings: self.settings,
                notifier: self.notifier,
                recorder: self.recorder,
                artifacts: self.artifacts,
                archive: self.archive,
                cooldown: self.cooldown,
                cooldown_duration: self.cooldown_duration,
            }),
        }
    }
}

#[derive(Clone)]
pub struct CaptureOrchestrator {
    inner: Arc<Inner>,
}

impl CaptureOrchestrator {
    pub fn builder(
        camera: Arc<CameraSessionManager>,
        oracle: Arc<dyn AnalysisOracle>,
        settings: SharedSettings,
        notifier: Notifier,
    ) -> CaptureOrchestratorBuilder {
        CaptureOrchestratorBuilder {
            camera,
            oracle,
            settings,
            notifier,
            recorder: Recorder::new(
                DEFAULT_RECORD_DURATION,
                MediaFormat::mjpeg(crate::camera::DEFAULT_FPS),
            ),
            artifacts: ArtifactGenerator::default(),
            archive: None,
            cooldown: CooldownGate::new(),
            cooldown_duration: DEFAULT_COOLDOWN,
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.inner.state()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == CaptureState::Idle
    }

    pub fn cooldown(&self) -> &CooldownGate {
        &self.inner.cooldown
    }

    /// Start a capture lifecycle. Must be called from within the runtime.
    ///
    /// Manual rejections are published as notices; automatic ones are only
    /// logged.
    pub fn trigger(&self, source: TriggerSource) -> Result<CaptureHandle, TriggerRejected> {
        let session = {
            let mut state = self.inner.state();
            if *state != CaptureState::Idle {
                drop(state);
                return Err(self.reject(source, TriggerRejected::Busy));
            }
            let Some(session) = self.inner.camera.current().filter(|s| s.is_live()) else {
                drop(state);
                return Err(self.reject(source, TriggerRejected::NoStream));
            };
            *state = CaptureState::Recording;
            session
        };

        let event = CaptureEvent::new(source, Utc::now());
        log::info!(
            "CaptureOrchestrator: {} capture {} accepted ({})",
            source,
            event.id,
            event.media_name
        );
        let context = CaptureContext {
            event: event.clone(),
            device_label: session.device.label.clone(),
            facing: session.facing,
            width: session.width,
            height: session.height,
            settings: self.inner.settings.current(),
        };

        // Dropping the task, polled or not, returns the state to Idle.
        let guard = IdleOnDrop(self.inner.clone());
        let join = tokio::spawn(run_capture(guard, session.handle, context));
        Ok(CaptureHandle { event, join })
    }

    fn reject(&self, source: TriggerSource, reason: TriggerRejected) -> TriggerRejected {
        match source {
            TriggerSource::Manual => self.inner.notifier.warn(
                NoticeCategory::Trigger,
                format!("Capture not started: {}", reason),
            ),
            TriggerSource::Auto => {
                log::debug!("CaptureOrchestrator: auto trigger ignored: {}", reason)
            }
        }
        reason
    }
}

async fn run_capture(
    guard: IdleOnDrop,
    stream: StreamHandle,
    context: CaptureContext,
) -> CaptureOutcome {
    let inner = guard.0.clone();
    let event_id = context.event.id.clone();

    let recording = tokio::spawn({
        let recorder = inner.recorder.clone();
        let stream = stream.clone();
        async move { recorder.record(stream).await }
    });
    let analysis = tokio::spawn(analyze_still(inner.oracle.clone(), stream));
    let (recording, analysis) = tokio::join!(recording, analysis);

    let recording: Result<RecordedMedia, RecordingError> = recording
        .unwrap_or_else(|e| Err(RecordingError::Encode(format!("recording task failed: {}", e))));
    let analysis: Result<AnalysisVerdict, OracleError> = analysis
        .unwrap_or_else(|e| Err(OracleError::Transport(format!("analysis task failed: {}", e))));

    match &recording {
        Ok(media) if media.truncated => inner.notifier.warn(
            NoticeCategory::Recording,
            format!(
                "Recording for {} was cut short ({} frames)",
                event_id, media.frame_count
            ),
        ),
        Ok(_) => {}
        Err(e) => inner
            .notifier
            .error(NoticeCategory::Recording, format!("Recording failed: {}", e)),
    }
    if let Err(e) = &analysis {
        inner.notifier.warn(
            NoticeCategory::Analysis,
            format!("Analysis unavailable for {}: {}", event_id, e),
        );
    }

    inner.set_state(CaptureState::Finalizing);
    let source = context.event.source;
    let bundle = inner.artifacts.finalize(recording, analysis, context).await;
    for issue in &bundle.issues {
        if let BundleIssue::PhotoOmitted(reason) = issue {
            inner.notifier.warn(
                NoticeCategory::Artifact,
                format!("Photo omitted for {}: {}", event_id, reason),
            );
        }
    }

    let persisted = inner
        .archive
        .as_ref()
        .map(|archive| archive.submit(bundle.clone()));

    if source == TriggerSource::Auto {
        inner.cooldown.close_for(inner.cooldown_duration);
    }
    log::info!("CaptureOrchestrator: capture {} finalized", event_id);
    drop(guard);
    CaptureOutcome { bundle, persisted }
}

async fn analyze_still(
    oracle: Arc<dyn AnalysisOracle>,
    stream: StreamHandle,
) -> Result<AnalysisVerdict, OracleError> {
    let still = tokio::task::spawn_blocking(move || {
        let frame = stream.grab().map_err(|e| e.to_string())?;
        frame.to_jpeg(STILL_QUALITY).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| OracleError::InvalidImage(e.to_string()))?
    .map_err(OracleError::InvalidImage)?;

    oracle.analyze(ImagePayload::jpeg(still)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{FacingMode, StreamConstraints, SyntheticBackend, SyntheticScene};
    use crate::notice::Severity;
    use crate::settings::Settings;
    use async_trait::async_trait;

    struct SlowOracle {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl AnalysisOracle for SlowOracle {
        async fn analyze(&self, image: ImagePayload) -> Result<AnalysisVerdict, OracleError> {
            assert_eq!(image.mime_type, "image/jpeg");
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(OracleError::Status {
                    code: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(AnalysisVerdict {
                technical_details: "n/a".to_string(),
                anomaly_grade: "A".to_string(),
                database_comparisons: String::new(),
                probability_of_genuine_event: 0.9,
                summary: "bright bolide".to_string(),
            })
        }
    }

    async fn setup(
        oracle: SlowOracle,
    ) -> (
        CaptureOrchestrator,
        Arc<CameraSessionManager>,
        tokio::sync::mpsc::UnboundedReceiver<crate::notice::Notice>,
    ) {
        let (notifier, rx) = Notifier::channel();
        let backend = SyntheticBackend::sky().with_scene(SyntheticScene::Still);
        let constraints = StreamConstraints {
            ideal_width: 32,
            ideal_height: 24,
            ..StreamConstraints::default()
        };
        let camera = Arc::new(CameraSessionManager::new(
            Arc::new(backend),
            constraints,
            notifier.clone(),
        ));
        camera.acquire(Some(FacingMode::Environment)).await.unwrap();
        let orchestrator = CaptureOrchestrator::builder(
            camera.clone(),
            Arc::new(oracle),
            SharedSettings::new(Settings::default()),
            notifier,
        )
        .build();
        (orchestrator, camera, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_while_recording_is_rejected_with_notice() {
        let (orchestrator, _camera, mut rx) = setup(SlowOracle {
            delay: Duration::from_secs(2),
            fail: false,
        })
        .await;

        let first = orchestrator.trigger(TriggerSource::Manual).unwrap();
        assert_eq!(orchestrator.state(), CaptureState::Recording);
        assert_eq!(
            orchestrator.trigger(TriggerSource::Manual).unwrap_err(),
            TriggerRejected::Busy
        );
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.category, NoticeCategory::Trigger);
        assert_eq!(notice.severity, Severity::Warning);

        let outcome = first.wait().await.unwrap();
        assert!(outcome.bundle.is_complete());
        assert!(orchestrator.is_idle());
        // Manual captures leave the cooldown open.
        assert!(orchestrator.cooldown().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_rejection_is_silent_and_auto_capture_closes_cooldown() {
        let (orchestrator, _camera, mut rx) = setup(SlowOracle {
            delay: Duration::from_millis(10),
            fail: false,
        })
        .await;

        let handle = orchestrator.trigger(TriggerSource::Auto).unwrap();
        assert_eq!(
            orchestrator.trigger(TriggerSource::Auto).unwrap_err(),
            TriggerRejected::Busy
        );
        assert!(rx.try_recv().is_err());

        handle.wait().await.unwrap();
        assert!(orchestrator.is_idle());
        assert!(!orchestrator.cooldown().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn recording_stops_at_deadline_even_when_oracle_is_slow() {
        let (orchestrator, _camera, _rx) = setup(SlowOracle {
            delay: Duration::from_secs(20),
            fail: false,
        })
        .await;
        let started = tokio::time::Instant::now();
        let outcome = orchestrator
            .trigger(TriggerSource::Manual)
            .unwrap()
            .wait()
            .await
            .unwrap();
        let video = outcome.bundle.video.unwrap();
        assert!(!video.bytes.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn oracle_failure_yields_video_and_report_without_verdict() {
        let (orchestrator, _camera, mut rx) = setup(SlowOracle {
            delay: Duration::from_millis(100),
            fail: true,
        })
        .await;
        let outcome = orchestrator
            .trigger(TriggerSource::Manual)
            .unwrap()
            .wait()
            .await
            .unwrap();
        let bundle = outcome.bundle;
        assert!(bundle.video.is_some());
        assert!(bundle.verdict.is_none());
        assert!(String::from_utf8(bundle.report.bytes)
            .unwrap()
            .contains(crate::artifact::ANALYSIS_UNAVAILABLE));

        let mut categories = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            categories.push(notice.category);
        }
        assert!(categories.contains(&NoticeCategory::Analysis));
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_without_stream_is_rejected() {
        let (orchestrator, camera, _rx) = setup(SlowOracle {
            delay: Duration::ZERO,
            fail: false,
        })
        .await;
        camera.release().await;
        assert_eq!(
            orchestrator.trigger(TriggerSource::Auto).unwrap_err(),
            TriggerRejected::NoStream
        );
        assert!(orchestrator.is_idle());
    }
}
