use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use skywatch::{
    AnalysisOracle, AnalysisVerdict, BundleIssue, CameraBackend, CameraSessionManager,
    CaptureOrchestrator, CaptureState, CooldownGate, EventArchive, EventStore, FacingMode,
    ImagePayload, InMemoryBlobStore, InMemoryEventStore, Notice, NoticeCategory, Notifier,
    OracleError, Settings, SettingsStore, SharedDetector, SharedSettings, Skywatch,
    StreamConstraints, SwitchOutcome, SyntheticBackend, SyntheticScene, TriggerRejected,
    TriggerSource,
};

struct FixedOracle(Result<AnalysisVerdict, OracleError>);

#[async_trait]
impl AnalysisOracle for FixedOracle {
    async fn analyze(&self, image: ImagePayload) -> Result<AnalysisVerdict, OracleError> {
        assert_eq!(image.mime_type, "image/jpeg");
        assert!(!image.bytes.is_empty());
        self.0.clone()
    }
}

fn verdict() -> AnalysisVerdict {
    AnalysisVerdict {
        technical_details: "point source, linear track".to_string(),
        anomaly_grade: "low".to_string(),
        database_comparisons: "satellite pass".to_string(),
        probability_of_genuine_event: 0.2,
        summary: "likely a satellite".to_string(),
    }
}

struct Rig {
    skywatch: Skywatch,
    backend: Arc<SyntheticBackend>,
    events: Arc<InMemoryEventStore>,
    blobs: Arc<InMemoryBlobStore>,
    notices: UnboundedReceiver<Notice>,
}

fn rig(scene: SyntheticScene, oracle: Arc<dyn AnalysisOracle>, settings: Settings) -> Rig {
    let (notifier, notices) = Notifier::channel();
    let backend = Arc::new(SyntheticBackend::sky().with_scene(scene));
    let camera = Arc::new(CameraSessionManager::new(
        backend.clone() as Arc<dyn CameraBackend>,
        StreamConstraints {
            ideal_width: 320,
            ideal_height: 240,
            ..StreamConstraints::default()
        },
        notifier.clone(),
    ));
    let events = Arc::new(InMemoryEventStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());
    let settings = SharedSettings::new(settings);
    let archive = EventArchive::new("ana", events.clone(), blobs.clone(), notifier.clone());
    let orchestrator =
        CaptureOrchestrator::builder(camera.clone(), oracle, settings.clone(), notifier.clone())
            .archive(archive)
            .cooldown(CooldownGate::new(), Duration::from_secs(30))
            .build();
    let skywatch = Skywatch::new(
        camera,
        orchestrator,
        SharedDetector::default(),
        settings,
        notifier,
    )
    .with_settings_store(events.clone(), "ana".to_string());
    Rig {
        skywatch,
        backend,
        events,
        blobs,
        notices,
    }
}

fn drain(notices: &mut UnboundedReceiver<Notice>) -> Vec<Notice> {
    let mut out = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        out.push(notice);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn manual_capture_produces_and_archives_a_full_bundle() {
    let mut rig = rig(
        SyntheticScene::Still,
        Arc::new(FixedOracle(Ok(verdict()))),
        Settings::default(),
    );
    rig.skywatch.start(Some(FacingMode::Environment)).await.unwrap();

    let capture = rig.skywatch.manual_capture().unwrap();
    let media_name = capture.event.media_name.clone();
    let outcome = capture.wait().await.unwrap();

    let bundle = &outcome.bundle;
    assert!(bundle.is_complete(), "issues: {:?}", bundle.issues);
    let names: Vec<&str> = bundle.artifacts().map(|a| a.file_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            format!("{}_video_5s.mjpeg", media_name),
            format!("{}_photo.jpg", media_name),
            format!("{}_data.txt", media_name),
        ]
    );

    let record = outcome.persisted.unwrap().await.unwrap().unwrap();
    assert_eq!(record.source, TriggerSource::Manual);
    assert_eq!(record.verdict, Some(verdict()));
    assert_eq!(rig.blobs.len(), 3);
    assert_eq!(rig.events.list_by_owner("ana").unwrap().len(), 1);

    // Manual captures never close the cooldown gate.
    assert!(rig.skywatch.orchestrator().cooldown().is_open());
    assert_eq!(rig.skywatch.orchestrator().state(), CaptureState::Idle);
    rig.skywatch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn oracle_failure_still_archives_video_and_report() {
    let failure = OracleError::Status {
        code: 503,
        body: "overloaded".to_string(),
    };
    let mut rig = rig(
        SyntheticScene::Still,
        Arc::new(FixedOracle(Err(failure))),
        Settings::default(),
    );
    rig.skywatch.start(None).await.unwrap();

    let outcome = rig.skywatch.manual_capture().unwrap().wait().await.unwrap();
    let bundle = &outcome.bundle;
    assert!(bundle.verdict.is_none());
    assert!(bundle.video.is_some());
    assert!(matches!(
        bundle.issues.as_slice(),
        [BundleIssue::AnalysisUnavailable(_)]
    ));
    let report = String::from_utf8(bundle.report.bytes.clone()).unwrap();
    assert!(report.contains("ANALYSIS UNAVAILABLE"));

    let record = outcome.persisted.unwrap().await.unwrap().unwrap();
    assert!(record.verdict.is_none());
    assert!(record.video.is_some());

    let notices = drain(&mut rig.notices);
    assert!(notices
        .iter()
        .any(|n| n.category == NoticeCategory::Analysis && n.message.contains("503")));
    rig.skywatch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn second_manual_trigger_is_rejected_while_recording() {
    let mut rig = rig(
        SyntheticScene::Still,
        Arc::new(FixedOracle(Ok(verdict()))),
        Settings::default(),
    );
    rig.skywatch.start(None).await.unwrap();

    let first = rig.skywatch.manual_capture().unwrap();
    assert!(matches!(
        rig.skywatch.manual_capture(),
        Err(TriggerRejected::Busy)
    ));
    let notices = drain(&mut rig.notices);
    assert!(notices.iter().any(|n| n.category == NoticeCategory::Trigger));

    let outcome = first.wait().await.unwrap();
    assert!(outcome.bundle.video.is_some());
    rig.skywatch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn motion_in_the_sky_triggers_one_auto_capture_then_cools_down() {
    // Half of every 4-frame period shows a 64px object.
    let scene = SyntheticScene::Transit {
        period_frames: 4,
        object_size: 64,
    };
    let settings = Settings {
        motion_sensitivity: 80,
        min_brightness: 5,
        min_object_size: 1,
        enable_auto_motion_detection: true,
    };
    let mut rig = rig(scene, Arc::new(FixedOracle(Ok(verdict()))), settings);
    rig.skywatch.start(None).await.unwrap();

    let mut stored = Vec::new();
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        stored = rig.events.list_by_owner("ana").unwrap();
        if !stored.is_empty() && rig.skywatch.orchestrator().is_idle() {
            break;
        }
    }
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].source, TriggerSource::Auto);
    assert!(!rig.skywatch.orchestrator().cooldown().is_open());

    // The gate holds for 30s even though the object keeps moving.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(rig.events.list_by_owner("ana").unwrap().len(), 1);
    assert!(rig.skywatch.is_detecting());
    rig.skywatch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn switching_cameras_keeps_a_single_live_stream() {
    let mut rig = rig(
        SyntheticScene::Still,
        Arc::new(FixedOracle(Ok(verdict()))),
        Settings::default(),
    );
    let first = rig.skywatch.start(Some(FacingMode::Environment)).await.unwrap();
    assert_eq!(first.facing, Some(FacingMode::Environment));
    assert_eq!(rig.backend.live_streams(), 1);

    let outcome = rig.skywatch.switch_camera(None).await.unwrap();
    let SwitchOutcome::Switched(session) = outcome else {
        panic!("expected a switch");
    };
    assert_eq!(session.facing, Some(FacingMode::User));
    assert!(!first.is_live());
    assert_eq!(rig.backend.live_streams(), 1);
    assert!(rig.skywatch.is_detecting());

    rig.skywatch.shutdown().await;
    assert_eq!(rig.backend.live_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn switching_cameras_mid_recording_keeps_the_capture() {
    let mut rig = rig(
        SyntheticScene::Still,
        Arc::new(FixedOracle(Ok(verdict()))),
        Settings::default(),
    );
    rig.skywatch.start(Some(FacingMode::Environment)).await.unwrap();

    let capture = rig.skywatch.manual_capture().unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(rig.skywatch.orchestrator().state(), CaptureState::Recording);
    let outcome = rig.skywatch.switch_camera(None).await.unwrap();
    assert!(matches!(outcome, SwitchOutcome::Switched(_)));

    let outcome = capture.wait().await.unwrap();
    let bundle = &outcome.bundle;
    assert!(bundle.video.is_some());
    assert_eq!(bundle.verdict, Some(verdict()));
    let report = String::from_utf8(bundle.report.bytes.clone()).unwrap();
    assert!(report.contains("Truncated: yes"));

    let record = outcome.persisted.unwrap().await.unwrap().unwrap();
    assert!(record.video.is_some());
    assert_eq!(rig.skywatch.orchestrator().state(), CaptureState::Idle);
    assert_eq!(rig.backend.live_streams(), 1);
    assert!(rig.skywatch.is_detecting());

    let notices = drain(&mut rig.notices);
    assert!(notices
        .iter()
        .any(|n| n.category == NoticeCategory::Recording && n.message.contains("cut short")));
    rig.skywatch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn settings_edits_persist_per_owner() {
    let rig = rig(
        SyntheticScene::Still,
        Arc::new(FixedOracle(Ok(verdict()))),
        Settings::default(),
    );
    rig.skywatch.update_setting("auto", "off").await.unwrap();
    rig.skywatch
        .update_setting("minObjectSize", "250")
        .await
        .unwrap();

    let saved = rig.events.load_settings("ana").unwrap().unwrap();
    assert!(!saved.enable_auto_motion_detection);
    assert_eq!(saved.min_object_size, 100);
    assert!(rig.events.load_settings("bob").unwrap().is_none());
}
