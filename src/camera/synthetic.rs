//! Synthetic sky camera.
//!
//! `stub://` devices render a dark, static star field, optionally crossed by
//! a bright object at a fixed cadence. The backend is always available and
//! deterministic, so it drives tests and demos without hardware.
//!
//! Supported URLs:
//! - `stub://sky`: two cameras (environment + user)
//! - `stub://single`: one camera with unknown facing
//! - `stub://none`: no cameras
//! - `stub://denied` / `stub://busy`: acquisition fails with the matching error

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{
    CameraBackend, CameraError, DeviceInfo, FacingMode, StreamConstraints, VideoStream,
    IDEAL_HEIGHT, IDEAL_WIDTH,
};
use crate::frame::VideoFrame;

const SKY_LEVEL: u8 = 8;
const STAR_LEVEL: u8 = 170;
const OBJECT_LEVEL: u8 = 235;

/// What the synthetic camera sees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyntheticScene {
    /// Star field only; consecutive frames are identical.
    Still,
    /// A square object crosses the frame during the first half of every
    /// `period_frames` frames.
    Transit { period_frames: u64, object_size: u32 },
}

impl Default for SyntheticScene {
    fn default() -> Self {
        SyntheticScene::Transit {
            period_frames: 400,
            object_size: 24,
        }
    }
}

pub struct SyntheticBackend {
    devices: Vec<DeviceInfo>,
    native_width: u32,
    native_height: u32,
    scene: SyntheticScene,
    fault: Option<CameraError>,
    live_streams: Arc<AtomicUsize>,
}

impl SyntheticBackend {
    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            native_width: IDEAL_WIDTH,
            native_height: IDEAL_HEIGHT,
            scene: SyntheticScene::default(),
            fault: None,
            live_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Phone-like pair of cameras.
    pub fn sky() -> Self {
        Self::with_devices(vec![
            DeviceInfo {
                id: "stub://sky/environment".to_string(),
                label: "Synthetic sky (rear)".to_string(),
                facing: Some(FacingMode::Environment),
            },
            DeviceInfo {
                id: "stub://sky/user".to_string(),
                label: "Synthetic sky (front)".to_string(),
                facing: Some(FacingMode::User),
            },
        ])
    }

    /// Desktop-like single camera that reports no facing mode.
    pub fn single() -> Self {
        Self::with_devices(vec![DeviceInfo {
            id: "stub://single".to_string(),
            label: "Synthetic sky".to_string(),
            facing: None,
        }])
    }

    pub fn from_url(url: &str) -> Result<Self, CameraError> {
        let name = url
            .strip_prefix("stub://")
            .ok_or_else(|| CameraError::Unsupported(format!("not a stub url: {}", url)))?;
        let backend = match name.trim_end_matches('/') {
            "sky" | "" => Self::sky(),
            "single" => Self::single(),
            "none" => Self::with_devices(Vec::new()),
            "denied" => Self::sky().with_fault(CameraError::PermissionDenied(
                "user dismissed the permission prompt".to_string(),
            )),
            "busy" => Self::sky().with_fault(CameraError::DeviceUnavailable(
                "device is in use by another application".to_string(),
            )),
            other => {
                return Err(CameraError::Unsupported(format!(
                    "unknown synthetic camera '{}'",
                    other
                )))
            }
        };
        Ok(backend)
    }

    pub fn with_scene(mut self, scene: SyntheticScene) -> Self {
        self.scene = scene;
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.native_width = width;
        self.native_height = height;
        self
    }

    pub fn with_fault(mut self, fault: CameraError) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Streams opened and not yet stopped.
    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }

    fn select_device(&self, constraints: &StreamConstraints) -> Result<DeviceInfo, CameraError> {
        if self.devices.is_empty() {
            return Err(CameraError::NoDevice);
        }
        let candidates: Vec<&DeviceInfo> = match &constraints.device_id {
            Some(id) => self.devices.iter().filter(|d| &d.id == id).collect(),
            None => self.devices.iter().collect(),
        };
        if candidates.is_empty() {
            return Err(CameraError::DeviceUnavailable(format!(
                "device {} not found",
                constraints.device_id.as_deref().unwrap_or("?")
            )));
        }
        match constraints.facing {
            Some(facing) => candidates
                .into_iter()
                .find(|d| d.facing == Some(facing))
                .cloned()
                .ok_or_else(|| {
                    CameraError::Unsupported(format!("no camera facing {}", facing))
                }),
            None => Ok(candidates[0].clone()),
        }
    }
}

#[async_trait]
impl CameraBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, CameraError> {
        Ok(self.devices.clone())
    }

    async fn open(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn VideoStream>, CameraError> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        let device = self.select_device(constraints)?;
        let width = constraints.ideal_width.min(self.native_width).max(1);
        let height = constraints.ideal_height.min(self.native_height).max(1);
        self.live_streams.fetch_add(1, Ordering::SeqCst);
        log::info!(
            "SyntheticBackend: opened {} ({}x{} @ {} fps)",
            device.id,
            width,
            height,
            constraints.fps
        );
        Ok(Box::new(SyntheticStream {
            device,
            width,
            height,
            fps: constraints.fps.max(1),
            scene: self.scene,
            frame_count: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            live_streams: self.live_streams.clone(),
        }))
    }
}

struct SyntheticStream {
    device: DeviceInfo,
    width: u32,
    height: u32,
    fps: u32,
    scene: SyntheticScene,
    frame_count: AtomicU64,
    stopped: AtomicBool,
    live_streams: Arc<AtomicUsize>,
}

impl SyntheticStream {
    fn render(&self, frame_no: u64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![SKY_LEVEL; w * h * 3];

        // Fixed star field: a sparse, position-only hash.
        for i in 0..w * h {
            if (i as u64).wrapping_mul(2_654_435_761) % 1_993 == 0 {
                pixels[i * 3..i * 3 + 3].copy_from_slice(&[STAR_LEVEL, STAR_LEVEL, STAR_LEVEL + 20]);
            }
        }

        if let SyntheticScene::Transit {
            period_frames,
            object_size,
        } = self.scene
        {
            let period = period_frames.max(2);
            let phase = frame_no % period;
            let visible = period / 2;
            if phase < visible {
                let size = object_size.clamp(1, self.width.min(self.height)) as usize;
                let span_x = w.saturating_sub(size).max(1);
                let span_y = (h / 3).max(1);
                let x0 = (phase as usize * span_x) / visible as usize;
                let y0 = h / 4 + (phase as usize * span_y) / visible as usize;
                for y in y0..(y0 + size).min(h) {
                    for x in x0..(x0 + size).min(w) {
                        let idx = (y * w + x) * 3;
                        pixels[idx..idx + 3].copy_from_slice(&[OBJECT_LEVEL, OBJECT_LEVEL, OBJECT_LEVEL]);
                    }
                }
            }
        }

        pixels
    }
}

impl VideoStream for SyntheticStream {
    fn grab(&self) -> Result<VideoFrame, CameraError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CameraError::StreamEnded);
        }
        let frame_no = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
        let pixels = self.render(frame_no);
        VideoFrame::new(pixels, self.width, self.height)
            .map_err(|e| CameraError::Backend(e.to_string()))
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.live_streams.fetch_sub(1, Ordering::SeqCst);
            log::info!("SyntheticBackend: stopped {}", self.device.id);
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> StreamConstraints {
        StreamConstraints {
            ideal_width: 64,
            ideal_height: 48,
            ..StreamConstraints::default()
        }
    }

    #[tokio::test]
    async fn still_scene_frames_are_identical() {
        let backend = SyntheticBackend::sky().with_scene(SyntheticScene::Still);
        let stream = backend.open(&small()).await.unwrap();
        let a = stream.grab().unwrap();
        let b = stream.grab().unwrap();
        assert_eq!((a.width, a.height), (64, 48));
        assert_eq!(a.pixels(), b.pixels());
    }

    #[tokio::test]
    async fn transit_scene_moves_the_object() {
        let backend = SyntheticBackend::sky().with_scene(SyntheticScene::Transit {
            period_frames: 20,
            object_size: 6,
        });
        let stream = backend.open(&small()).await.unwrap();
        let a = stream.grab().unwrap();
        let b = stream.grab().unwrap();
        assert_ne!(a.pixels(), b.pixels());
    }

    #[tokio::test]
    async fn facing_constraint_selects_device() {
        let backend = SyntheticBackend::sky();
        let mut c = small();
        c.facing = Some(FacingMode::User);
        let stream = backend.open(&c).await.unwrap();
        assert_eq!(stream.device().facing, Some(FacingMode::User));
        assert_eq!(backend.live_streams(), 1);
        stream.stop();
        stream.stop();
        assert_eq!(backend.live_streams(), 0);
        assert_eq!(stream.grab().unwrap_err(), CameraError::StreamEnded);
    }

    #[tokio::test]
    async fn single_camera_rejects_facing_constraint() {
        let backend = SyntheticBackend::single();
        let mut c = small();
        c.facing = Some(FacingMode::Environment);
        assert!(matches!(backend.open(&c).await, Err(CameraError::Unsupported(_))));
    }

    #[test]
    fn url_selects_fixture() {
        assert!(SyntheticBackend::from_url("stub://none").is_ok());
        assert!(SyntheticBackend::from_url("stub://quantum").is_err());
        assert!(SyntheticBackend::from_url("/dev/video0").is_err());
    }
}
