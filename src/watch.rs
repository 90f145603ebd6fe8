//! Detection loop and the top-level controller.
//!
//! `DetectionLoop::tick` is one synchronous detection cycle: cheap
//! precondition checks, then grab, sample, compare, and trigger an automatic
//! capture on detection. `Skywatch` wires the pipeline together and owns the
//! loop task, restarting it around camera switches.

use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::camera::{CameraError, CameraSessionManager, FacingMode, StreamSession, SwitchOutcome};
use crate::capture::{CaptureHandle, CaptureOrchestrator, TriggerRejected};
use crate::detect::{DetectionRegion, RegionOverlay, SharedDetector};
use crate::frame::FrameSampler;
use crate::notice::{NoticeCategory, Notifier};
use crate::settings::{Settings, SharedSettings};
use crate::storage::SettingsStore;
use crate::TriggerSource;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Overlay region shared between the loop and its observers.
pub type SharedOverlay = Arc<Mutex<RegionOverlay>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// What one detection cycle did.
#[derive(Debug)]
pub enum TickOutcome {
    AutoDisabled,
    CaptureInProgress,
    CoolingDown,
    NoStream,
    /// Grab or sampling failed; the cycle was skipped.
    FrameUnavailable,
    /// First frame after a (re)start; nothing to compare against.
    Baseline,
    Quiet,
    Triggered {
        region: DetectionRegion,
        capture: CaptureHandle,
    },
    Rejected {
        region: DetectionRegion,
        reason: TriggerRejected,
    },
}

pub struct DetectionLoop {
    camera: Arc<CameraSessionManager>,
    orchestrator: CaptureOrchestrator,
    detector: SharedDetector,
    settings: SharedSettings,
    sampler: FrameSampler,
    overlay: SharedOverlay,
    last_session: Option<u64>,
}

impl DetectionLoop {
    pub fn new(
        camera: Arc<CameraSessionManager>,
        orchestrator: CaptureOrchestrator,
        detector: SharedDetector,
        settings: SharedSettings,
    ) -> Self {
        Self {
            camera,
            orchestrator,
            detector,
            settings,
            sampler: FrameSampler::default(),
            overlay: Arc::new(Mutex::new(RegionOverlay::default())),
            last_session: None,
        }
    }

    pub fn with_sampler(mut self, sampler: FrameSampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_overlay(mut self, overlay: SharedOverlay) -> Self {
        self.overlay = overlay;
        self
    }

    pub fn overlay(&self) -> SharedOverlay {
        self.overlay.clone()
    }

    pub fn tick(&mut self) -> TickOutcome {
        let now = Instant::now();
        let settings = self.settings.current();

        if !settings.enable_auto_motion_detection {
            lock(&self.overlay).prune(now);
            return TickOutcome::AutoDisabled;
        }
        if !self.orchestrator.is_idle() {
            lock(&self.overlay).prune(now);
            return TickOutcome::CaptureInProgress;
        }
        if !self.orchestrator.cooldown().is_open_at(now) {
            lock(&self.overlay).prune(now);
            return TickOutcome::CoolingDown;
        }
        let Some(session) = self.camera.current().filter(StreamSession::is_live) else {
            lock(&self.overlay).clear();
            return TickOutcome::NoStream;
        };
        if self.last_session != Some(session.id) {
            lock(&self.overlay).clear();
            self.last_session = Some(session.id);
        }

        let sampled = match session
            .handle
            .grab()
            .map_err(|e| e.to_string())
            .and_then(|frame| self.sampler.sample(&frame).map_err(|e| e.to_string()))
        {
            Ok(sampled) => sampled,
            Err(e) => {
                log::warn!("DetectionLoop: frame unavailable, skipping cycle: {}", e);
                return TickOutcome::FrameUnavailable;
            }
        };

        let had_baseline = self.detector.has_baseline();
        let region = self.detector.with(|d| d.evaluate(sampled, &settings));
        lock(&self.overlay).observe(region, now);

        match region {
            None if had_baseline => TickOutcome::Quiet,
            None => TickOutcome::Baseline,
            Some(region) => {
                log::info!(
                    "DetectionLoop: motion at ({}, {}) {}x{} [{} px]",
                    region.x,
                    region.y,
                    region.width,
                    region.height,
                    region.changed_pixels
                );
                match self.orchestrator.trigger(TriggerSource::Auto) {
                    Ok(capture) => TickOutcome::Triggered { region, capture },
                    Err(reason) => TickOutcome::Rejected { region, reason },
                }
            }
        }
    }

    /// Run `tick` every `period` until the task is aborted.
    pub fn spawn(mut self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let outcome = self.tick();
                log::trace!("DetectionLoop: {:?}", outcome);
            }
        })
    }
}

// ----------------------------------------------------------------------------
// Skywatch controller
// ----------------------------------------------------------------------------

/// Top-level pipeline handle used by the daemon.
pub struct Skywatch {
    camera: Arc<CameraSessionManager>,
    orchestrator: CaptureOrchestrator,
    detector: SharedDetector,
    settings: SharedSettings,
    notifier: Notifier,
    sampler: FrameSampler,
    overlay: SharedOverlay,
    sample_interval: Duration,
    settings_store: Option<(Arc<dyn SettingsStore>, String)>,
    loop_task: Option<JoinHandle<()>>,
}

impl Skywatch {
    pub fn new(
        camera: Arc<CameraSessionManager>,
        orchestrator: CaptureOrchestrator,
        detector: SharedDetector,
        settings: SharedSettings,
        notifier: Notifier,
    ) -> Self {
        camera.add_teardown_listener(Arc::new(detector.clone()));
        Self {
            camera,
            orchestrator,
            detector,
            settings,
            notifier,
            sampler: FrameSampler::default(),
            overlay: Arc::new(Mutex::new(RegionOverlay::default())),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            settings_store: None,
            loop_task: None,
        }
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_sampler(mut self, sampler: FrameSampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Persist settings edits for `owner`.
    pub fn with_settings_store(mut self, store: Arc<dyn SettingsStore>, owner: String) -> Self {
        self.settings_store = Some((store, owner));
        self
    }

    pub fn camera(&self) -> &Arc<CameraSessionManager> {
        &self.camera
    }

    pub fn orchestrator(&self) -> &CaptureOrchestrator {
        &self.orchestrator
    }

    pub fn settings(&self) -> Settings {
        self.settings.current()
    }

    pub fn current_region(&self) -> Option<DetectionRegion> {
        lock(&self.overlay).current(Instant::now())
    }

    pub fn is_detecting(&self) -> bool {
        self.loop_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Acquire the camera and start the detection loop.
    pub async fn start(&mut self, facing: Option<FacingMode>) -> Result<StreamSession, CameraError> {
        let session = self.camera.acquire(facing).await?;
        self.start_loop();
        Ok(session)
    }

    /// Abort the loop, switch cameras, restart the loop.
    ///
    /// An in-flight capture is not cancelled; its recorder stops early if
    /// the stream it was recording from is torn down.
    pub async fn switch_camera(
        &mut self,
        target: Option<FacingMode>,
    ) -> Result<SwitchOutcome, CameraError> {
        self.stop_loop();
        let result = self.camera.switch(target).await;
        self.start_loop();
        result
    }

    pub fn manual_capture(&self) -> Result<CaptureHandle, TriggerRejected> {
        self.orchestrator.trigger(TriggerSource::Manual)
    }

    /// Apply one settings edit; takes effect on the next cycle.
    pub async fn update_setting(&self, field: &str, value: &str) -> Result<Settings> {
        let mut next = self.settings.current();
        next.set_field(field, value)?;
        self.settings.replace(next);
        let applied = self.settings.current();
        log::info!("Skywatch: settings updated: {:?}", applied);

        if let Some((store, owner)) = &self.settings_store {
            let store = store.clone();
            let owner = owner.clone();
            let saved = tokio::task::spawn_blocking(move || store.save_settings(&owner, &applied))
                .await
                .map_err(|e| e.to_string())
                .and_then(|r| r.map_err(|e| e.to_string()));
            if let Err(e) = saved {
                self.notifier.error(
                    NoticeCategory::Settings,
                    format!("Settings applied but not saved: {}", e),
                );
            }
        }
        Ok(applied)
    }

    pub async fn shutdown(&mut self) {
        self.stop_loop();
        self.camera.release().await;
        log::info!("Skywatch: stopped");
    }

    fn start_loop(&mut self) {
        self.stop_loop();
        let detection = DetectionLoop::new(
            self.camera.clone(),
            self.orchestrator.clone(),
            self.detector.clone(),
            self.settings.clone(),
        )
        .with_sampler(self.sampler)
        .with_overlay(self.overlay.clone());
        self.loop_task = Some(detection.spawn(self.sample_interval));
    }

    fn stop_loop(&mut self) {
        if let Some(task) = self.loop_task.take() {
            task.abort();
        }
        lock(&self.overlay).clear();
    }
}

impl Drop for Skywatch {
    fn drop(&mut self) {
        if let Some(task) = self.loop_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{StreamConstraints, SyntheticBackend, SyntheticScene};
    use crate::oracle::UnavailableOracle;
    use crate::storage::InMemoryEventStore;

    async fn detection_loop(
        scene: SyntheticScene,
        settings: Settings,
    ) -> (DetectionLoop, Arc<CameraSessionManager>) {
        let camera = Arc::new(CameraSessionManager::new(
            Arc::new(SyntheticBackend::sky().with_scene(scene)),
            StreamConstraints {
                ideal_width: 320,
                ideal_height: 240,
                ..StreamConstraints::default()
            },
            Notifier::disabled(),
        ));
        let detector = SharedDetector::default();
        camera.add_teardown_listener(Arc::new(detector.clone()));
        camera.acquire(None).await.unwrap();
        let settings = SharedSettings::new(settings);
        let orchestrator = CaptureOrchestrator::builder(
            camera.clone(),
            Arc::new(UnavailableOracle),
            settings.clone(),
            Notifier::disabled(),
        )
        .build();
        (
            DetectionLoop::new(camera.clone(), orchestrator, detector, settings),
            camera,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn still_sky_never_triggers() {
        let (mut detection, _camera) =
            detection_loop(SyntheticScene::Still, Settings::default()).await;
        assert!(matches!(detection.tick(), TickOutcome::Baseline));
        for _ in 0..5 {
            assert!(matches!(detection.tick(), TickOutcome::Quiet));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn moving_object_triggers_auto_capture() {
        // The object shows on frames 0 and 1 mod 4. Acquisition took frame 1,
        // so ticks see frames 2 (baseline), 3 (dark) and 4 (object).
        let scene = SyntheticScene::Transit {
            period_frames: 4,
            object_size: 64,
        };
        let (mut detection, _camera) = detection_loop(scene, Settings::default()).await;
        assert!(matches!(detection.tick(), TickOutcome::Baseline));
        assert!(matches!(detection.tick(), TickOutcome::Quiet));
        let outcome = detection.tick();
        let TickOutcome::Triggered { region, capture } = outcome else {
            panic!("expected a trigger, got {:?}", outcome);
        };
        assert!(region.width > 0 && region.height > 0);
        assert!(detection.overlay().lock().unwrap().current(Instant::now()).is_some());

        assert!(matches!(detection.tick(), TickOutcome::CaptureInProgress));
        capture.wait().await.unwrap();
        assert!(matches!(detection.tick(), TickOutcome::CoolingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_auto_detection_skips_cycles() {
        let settings = Settings {
            enable_auto_motion_detection: false,
            ..Settings::default()
        };
        let (mut detection, _camera) = detection_loop(SyntheticScene::default(), settings).await;
        assert!(matches!(detection.tick(), TickOutcome::AutoDisabled));
        assert!(!detection.detector.has_baseline());
    }

    #[tokio::test(start_paused = true)]
    async fn released_camera_reports_no_stream() {
        let (mut detection, camera) =
            detection_loop(SyntheticScene::Still, Settings::default()).await;
        camera.release().await;
        assert!(matches!(detection.tick(), TickOutcome::NoStream));
    }

    #[tokio::test(start_paused = true)]
    async fn settings_edits_are_persisted() {
        let camera = Arc::new(CameraSessionManager::new(
            Arc::new(SyntheticBackend::sky()),
            StreamConstraints::default(),
            Notifier::disabled(),
        ));
        let settings = SharedSettings::new(Settings::default());
        let orchestrator = CaptureOrchestrator::builder(
            camera.clone(),
            Arc::new(UnavailableOracle),
            settings.clone(),
            Notifier::disabled(),
        )
        .build();
        let store = Arc::new(InMemoryEventStore::new());
        let skywatch = Skywatch::new(
            camera,
            orchestrator,
            SharedDetector::default(),
            settings.clone(),
            Notifier::disabled(),
        )
        .with_settings_store(store.clone(), "ana".to_string());

        let applied = skywatch.update_setting("sensitivity", "85").await.unwrap();
        assert_eq!(applied.motion_sensitivity, 85);
        assert_eq!(settings.current().motion_sensitivity, 85);
        assert_eq!(
            store.load_settings("ana").unwrap().map(|s| s.motion_sensitivity),
            Some(85)
        );
        assert!(skywatch.update_setting("zoom", "2").await.is_err());
    }
}
