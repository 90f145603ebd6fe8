//! V4L2 camera backend.
//!
//! Each open stream gets a dedicated capture thread that owns the device
//! and its mmap buffers. The thread keeps only the most recent frame;
//! `grab()` hands out that frame and never queues.
//!
//! V4L2 cannot tell which way a camera faces, so facing-constrained
//! requests fail with `Unsupported` and the session manager falls back to
//! an unconstrained request.

use async_trait::async_trait;
use ouroboros::self_referencing;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use super::normalize::{to_video_frame, PixelFormat};
use super::{CameraBackend, CameraError, DeviceInfo, StreamConstraints, VideoStream};
use crate::frame::VideoFrame;

const BUFFER_COUNT: u32 = 4;
const FIRST_FRAME_WAIT: Duration = Duration::from_secs(3);

pub struct V4l2Backend {
    /// Restrict enumeration to this node (e.g. `/dev/video0`).
    device: Option<String>,
}

impl V4l2Backend {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }

    fn candidate_paths(&self) -> Vec<String> {
        if let Some(path) = &self.device {
            return vec![path.clone()];
        }
        let mut paths: Vec<String> = std::fs::read_dir("/dev")
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .filter(|name| name.starts_with("video"))
                    .map(|name| format!("/dev/{}", name))
                    .collect()
            })
            .unwrap_or_default();
        paths.sort();
        paths
    }
}

fn map_io(context: &str, err: io::Error) -> CameraError {
    match (err.kind(), err.raw_os_error()) {
        (io::ErrorKind::PermissionDenied, _) => {
            CameraError::PermissionDenied(format!("{}: {}", context, err))
        }
        // EBUSY / ENODEV / ENOENT
        (_, Some(16)) | (_, Some(19)) | (io::ErrorKind::NotFound, _) => {
            CameraError::DeviceUnavailable(format!("{}: {}", context, err))
        }
        _ => CameraError::Backend(format!("{}: {}", context, err)),
    }
}

#[async_trait]
impl CameraBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, CameraError> {
        let paths = self.candidate_paths();
        tokio::task::spawn_blocking(move || {
            paths
                .into_iter()
                .filter_map(|path| {
                    let device = v4l::Device::with_path(&path).ok()?;
                    let caps = device.query_caps().ok()?;
                    if !caps
                        .capabilities
                        .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    {
                        return None;
                    }
                    Some(DeviceInfo {
                        id: path,
                        label: caps.card,
                        facing: None,
                    })
                })
                .collect()
        })
        .await
        .map_err(|e| CameraError::Backend(format!("device enumeration task failed: {}", e)))
    }

    async fn open(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn VideoStream>, CameraError> {
        if let Some(facing) = constraints.facing {
            return Err(CameraError::Unsupported(format!(
                "v4l2 devices do not report facing mode ({})",
                facing
            )));
        }
        let devices = self.enumerate_devices().await?;
        let device = match &constraints.device_id {
            Some(id) => devices.into_iter().find(|d| &d.id == id),
            None => devices.into_iter().next(),
        }
        .ok_or(CameraError::NoDevice)?;

        let constraints = constraints.clone();
        tokio::task::spawn_blocking(move || V4l2Stream::start(device, &constraints))
            .await
            .map_err(|e| CameraError::Backend(format!("stream start task failed: {}", e)))?
            .map(|s| Box::new(s) as Box<dyn VideoStream>)
    }
}

// ----------------------------------------------------------------------------
// Capture thread
// ----------------------------------------------------------------------------

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[derive(Default)]
struct Slot {
    latest: Option<VideoFrame>,
    ended: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
    stop: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct Negotiated {
    width: u32,
    height: u32,
    format: PixelFormat,
}

struct V4l2Stream {
    device: DeviceInfo,
    fps: u32,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl V4l2Stream {
    fn start(device: DeviceInfo, constraints: &StreamConstraints) -> Result<Self, CameraError> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::default()),
            ready: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let (ready_tx, ready_rx) = mpsc::channel();
        let path = device.id.clone();
        let request = constraints.clone();
        let worker_shared = shared.clone();

        let thread = std::thread::Builder::new()
            .name("v4l2-capture".to_string())
            .spawn(move || capture_loop(path, request, worker_shared, ready_tx))
            .map_err(|e| CameraError::Backend(format!("spawn capture thread: {}", e)))?;

        let negotiated = ready_rx
            .recv()
            .map_err(|_| CameraError::Backend("capture thread exited during setup".to_string()))??;
        log::info!(
            "V4l2Backend: streaming {} ({}x{} {:?})",
            device.id,
            negotiated.width,
            negotiated.height,
            negotiated.format
        );

        Ok(Self {
            device,
            fps: constraints.fps.max(1),
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }
}

fn configure(
    path: &str,
    request: &StreamConstraints,
) -> Result<(DeviceState, Negotiated), CameraError> {
    use v4l::buffer::Type;
    use v4l::video::Capture;

    let device = v4l::Device::with_path(path).map_err(|e| map_io("open device", e))?;
    let mut wanted = device.format().map_err(|e| map_io("read format", e))?;
    wanted.width = request.ideal_width;
    wanted.height = request.ideal_height;
    wanted.fourcc = v4l::FourCC::new(b"RGB3");

    let mut format = device.set_format(&wanted).unwrap_or_else(|err| {
        log::warn!("V4l2Backend: RGB3 rejected on {}: {}", path, err);
        wanted
    });
    if PixelFormat::from_fourcc(&format.fourcc.repr).is_none() {
        wanted.fourcc = v4l::FourCC::new(b"MJPG");
        format = device
            .set_format(&wanted)
            .map_err(|e| map_io("set format", e))?;
    }
    let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
        CameraError::Unsupported(format!("pixel format {} not supported", format.fourcc))
    })?;

    if request.fps > 0 {
        let params = v4l::video::capture::Parameters::with_fps(request.fps);
        if let Err(err) = device.set_params(&params) {
            log::warn!("V4l2Backend: failed to set fps on {}: {}", path, err);
        }
    }

    let state = DeviceStateTryBuilder {
        device,
        stream_builder: |device| {
            v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
        },
    }
    .try_build()
    .map_err(|e| map_io("create buffer stream", e))?;

    Ok((
        state,
        Negotiated {
            width: format.width,
            height: format.height,
            format: pixel_format,
        },
    ))
}

fn capture_loop(
    path: String,
    request: StreamConstraints,
    shared: Arc<Shared>,
    ready: mpsc::Sender<Result<Negotiated, CameraError>>,
) {
    use v4l::io::traits::CaptureStream;

    let (mut state, negotiated) = match configure(&path, &request) {
        Ok(ok) => ok,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let (width, height, format) = (negotiated.width, negotiated.height, negotiated.format);
    if ready.send(Ok(negotiated)).is_err() {
        return;
    }

    while !shared.stop.load(Ordering::SeqCst) {
        let frame = state.with_mut(|fields| {
            fields
                .stream
                .next()
                .map_err(|e| map_io("capture frame", e))
                .and_then(|(buf, _meta)| {
                    to_video_frame(buf, width, height, format)
                        .map_err(|e| CameraError::Backend(e.to_string()))
                })
        });
        match frame {
            Ok(frame) => {
                shared.lock().latest = Some(frame);
                shared.ready.notify_all();
            }
            Err(CameraError::Backend(msg)) => {
                log::warn!("V4l2Backend: dropped frame on {}: {}", path, msg);
            }
            Err(e) => {
                log::warn!("V4l2Backend: stream on {} ended: {}", path, e);
                break;
            }
        }
    }

    shared.lock().ended = true;
    shared.ready.notify_all();
}

impl VideoStream for V4l2Stream {
    fn grab(&self) -> Result<VideoFrame, CameraError> {
        let mut slot = self.shared.lock();
        if slot.latest.is_none() && !slot.ended {
            slot = match self
                .shared
                .ready
                .wait_timeout_while(slot, FIRST_FRAME_WAIT, |s| s.latest.is_none() && !s.ended)
            {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        if slot.ended {
            return Err(CameraError::StreamEnded);
        }
        slot.latest
            .clone()
            .ok_or_else(|| CameraError::Backend("no frame delivered yet".to_string()))
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let handle = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("V4l2Backend: capture thread for {} panicked", self.device.id);
            }
            log::info!("V4l2Backend: released {}", self.device.id);
        }
    }
}

impl Drop for V4l2Stream {
    fn drop(&mut self) {
        self.stop();
    }
}
