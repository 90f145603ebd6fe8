//! skywatchd - motion-triggered sky capture daemon
//!
//! This daemon:
//! 1. Acquires one camera stream (synthetic `stub://` scenes or V4L2)
//! 2. Samples a frame every cycle and runs motion detection on it
//! 3. Records, analyzes and archives every triggered capture
//! 4. Reads line commands from stdin and prints notices to stderr

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use skywatch::command::{Command, HELP};
use skywatch::config::{CameraSettings, SkywatchConfig};
use skywatch::{
    AnalysisOracle, ArtifactGenerator, CameraBackend, CameraSessionManager, CaptureHandle,
    CaptureOrchestrator, CooldownGate, EventArchive, FacingMode, FilesystemBlobStore, HttpOracle,
    MotionDetector, Notifier, Recorder, Settings, SettingsStore, SharedDetector, SharedSettings,
    Skywatch, SqliteEventStore, SwitchOutcome, SyntheticBackend, UnavailableOracle,
};

/// How long shutdown waits for an in-flight capture to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML when the extension is .toml).
    #[arg(long, env = "SKYWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// Camera to open: stub://sky, stub://single, or a V4L2 device path.
    #[arg(long)]
    camera: Option<String>,
    /// Start with automatic motion detection turned off.
    #[arg(long)]
    no_auto: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("SKYWATCH_CONFIG", path);
    }
    let mut cfg = SkywatchConfig::load()?;
    if let Some(camera) = args.camera {
        cfg.camera.url = camera;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(run(cfg, args.no_auto))
}

async fn run(cfg: SkywatchConfig, no_auto: bool) -> Result<()> {
    let (notifier, mut notices) = Notifier::channel();

    let store = Arc::new(
        SqliteEventStore::open(&cfg.db_path)
            .with_context(|| format!("failed to open event store {}", cfg.db_path))?,
    );
    let blobs = Arc::new(
        FilesystemBlobStore::new(cfg.blob_dir.clone())
            .with_context(|| format!("failed to open blob dir {}", cfg.blob_dir.display()))?,
    );

    let mut initial = match store.load_settings(&cfg.owner)? {
        Some(saved) => {
            log::info!("loaded saved settings for {}", cfg.owner);
            saved
        }
        None => cfg.settings,
    };
    if no_auto {
        initial.enable_auto_motion_detection = false;
    }
    let settings = SharedSettings::new(initial);

    let camera = Arc::new(CameraSessionManager::new(
        build_backend(&cfg.camera)?,
        cfg.camera.constraints(),
        notifier.clone(),
    ));

    let oracle: Arc<dyn AnalysisOracle> = match &cfg.oracle.url {
        Some(url) => Arc::new(HttpOracle::new(url, cfg.oracle.token.clone(), cfg.oracle.timeout)?),
        None => {
            log::warn!("no analysis oracle configured; every capture is saved without a verdict");
            Arc::new(UnavailableOracle)
        }
    };

    let recorder = Recorder::negotiate(
        cfg.capture.record_duration,
        &cfg.capture.preferred_mime_types,
        cfg.camera.fps,
    )?;
    let archive = EventArchive::new(cfg.owner.clone(), store.clone(), blobs, notifier.clone());
    let orchestrator =
        CaptureOrchestrator::builder(camera.clone(), oracle, settings.clone(), notifier.clone())
            .recorder(recorder)
            .artifacts(ArtifactGenerator::new(cfg.capture.photo_offset))
            .archive(archive)
            .cooldown(CooldownGate::new(), cfg.capture.cooldown)
            .build();

    let detector = SharedDetector::new(MotionDetector::with_params(cfg.motion));
    let mut skywatch = Skywatch::new(camera, orchestrator, detector, settings, notifier)
        .with_sample_interval(cfg.capture.sample_interval)
        .with_settings_store(store, cfg.owner.clone());

    log::info!(
        "skywatchd running. owner={}, db={}, blobs={}",
        cfg.owner,
        cfg.db_path,
        cfg.blob_dir.display()
    );
    match skywatch.start(Some(cfg.camera.facing_mode)).await {
        Ok(session) => log::info!(
            "streaming from {} ({}x{} @ {} fps)",
            session.device.label,
            session.width,
            session.height,
            session.fps
        ),
        Err(e) => log::warn!("no camera stream ({}); use 'switch' to retry", e),
    }
    eprintln!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            Some(notice) = notices.recv() => eprintln!("{}", notice),
            line = lines.next_line(), if stdin_open => {
                match line.context("failed to read stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match line.parse::<Command>() {
                        Ok(Command::Quit) => break,
                        Ok(command) => execute(&mut skywatch, command, cfg.camera.facing_mode).await,
                        Err(e) => eprintln!("{}", e),
                    },
                    None => {
                        log::info!("stdin closed; running until interrupted");
                        stdin_open = false;
                    }
                }
            }
            _ = &mut interrupt => {
                log::info!("interrupt received");
                break;
            }
        }
    }

    if !skywatch.orchestrator().is_idle() {
        log::info!("waiting for the in-flight capture to finish");
        let orchestrator = skywatch.orchestrator().clone();
        let settled = tokio::time::timeout(SHUTDOWN_GRACE, async move {
            while !orchestrator.is_idle() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if settled.is_err() {
            log::warn!("capture still running after {:?}; abandoning it", SHUTDOWN_GRACE);
        }
    }
    skywatch.shutdown().await;
    while let Ok(notice) = notices.try_recv() {
        eprintln!("{}", notice);
    }
    Ok(())
}

fn build_backend(camera: &CameraSettings) -> Result<Arc<dyn CameraBackend>> {
    if camera.is_synthetic() {
        let backend = SyntheticBackend::from_url(&camera.url)
            .map_err(|e| anyhow!("invalid synthetic camera {}: {}", camera.url, e))?;
        return Ok(Arc::new(backend));
    }
    #[cfg(feature = "camera-v4l2")]
    {
        let device = match camera.url.trim() {
            "" | "auto" | "v4l2://" => None,
            path => Some(path.trim_start_matches("v4l2://").to_string()),
        };
        Ok(Arc::new(skywatch::camera::V4l2Backend::new(device)))
    }
    #[cfg(not(feature = "camera-v4l2"))]
    {
        Err(anyhow!(
            "camera {} requires the camera-v4l2 feature; use stub://sky for the synthetic sky",
            camera.url
        ))
    }
}

async fn execute(skywatch: &mut Skywatch, command: Command, default_facing: FacingMode) {
    match command {
        Command::Capture => match skywatch.manual_capture() {
            Ok(capture) => {
                println!("capture {} started", capture.event.id);
                tokio::spawn(report_capture(capture));
            }
            Err(reason) => log::debug!("manual capture rejected: {}", reason),
        },
        Command::Switch(target) => {
            if skywatch.camera().current().is_none() {
                let facing = target.unwrap_or(default_facing);
                if let Ok(session) = skywatch.start(Some(facing)).await {
                    println!("camera {} acquired", session.device.label);
                }
                return;
            }
            match skywatch.switch_camera(target).await {
                Ok(SwitchOutcome::Switched(session)) => println!(
                    "switched to {} ({})",
                    session.device.label,
                    session.facing.map(|f| f.as_str()).unwrap_or("unknown facing")
                ),
                Ok(SwitchOutcome::Unchanged) => {}
                Err(e) => log::debug!("camera switch failed: {}", e),
            }
        }
        Command::Set { field, value } => match skywatch.update_setting(&field, &value).await {
            Ok(settings) => print_settings(&settings),
            Err(e) => eprintln!("{}", e),
        },
        Command::Settings => print_settings(&skywatch.settings()),
        Command::Status => {
            match skywatch.camera().current() {
                Some(session) => println!(
                    "camera: {} {}x{} @ {} fps",
                    session.device.label, session.width, session.height, session.fps
                ),
                None => println!("camera: no stream"),
            }
            let orchestrator = skywatch.orchestrator();
            println!("capture: {:?}", orchestrator.state());
            println!(
                "cooldown: {}",
                if orchestrator.cooldown().is_open() { "open" } else { "closed" }
            );
            println!("detecting: {}", skywatch.is_detecting());
            if let Some(region) = skywatch.current_region() {
                println!(
                    "last region: {}x{} at ({}, {}), {} changed pixels",
                    region.width, region.height, region.x, region.y, region.changed_pixels
                );
            }
        }
        Command::Help => eprintln!("{}", HELP),
        Command::Quit => {}
    }
}

fn print_settings(settings: &Settings) {
    match serde_json::to_string(settings) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to render settings: {}", e),
    }
}

async fn report_capture(capture: CaptureHandle) {
    let id = capture.event.id.clone();
    let outcome = match capture.wait().await {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("capture {} task failed: {}", id, e);
            return;
        }
    };
    let bundle = &outcome.bundle;
    let verdict = match &bundle.verdict {
        Some(v) => format!(
            "{} ({:.0}% genuine)",
            v.anomaly_grade,
            v.probability_of_genuine_event * 100.0
        ),
        None => "no verdict".to_string(),
    };
    let files: Vec<&str> = bundle.artifacts().map(|a| a.file_name.as_str()).collect();
    println!("capture {} finished: {}; {}", id, verdict, files.join(", "));
    if let Some(persisted) = outcome.persisted {
        if let Ok(Some(record)) = persisted.await {
            println!("capture {} saved under {}/{}", id, record.owner, record.id);
        }
    }
}
