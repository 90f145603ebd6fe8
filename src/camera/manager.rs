use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use super::{
    CameraBackend, CameraError, FacingMode, StreamConstraints, StreamHandle, StreamSession,
    TeardownListener,
};
use crate::notice::{NoticeCategory, Notifier};

/// Result of a camera switch request.
#[derive(Clone, Debug)]
pub enum SwitchOutcome {
    Switched(StreamSession),
    /// Fewer than two devices; the current stream was left alone.
    Unchanged,
}

/// Owns the physical stream lifecycle.
///
/// Acquire, release and switch are serialized; each acquisition tears the
/// previous stream down first, so at most one stream is live.
pub struct CameraSessionManager {
    backend: Arc<dyn CameraBackend>,
    base: StreamConstraints,
    notifier: Notifier,
    session_tx: watch::Sender<Option<StreamSession>>,
    listeners: Mutex<Vec<Arc<dyn TeardownListener>>>,
    requested: Mutex<Option<FacingMode>>,
    lifecycle: tokio::sync::Mutex<()>,
    next_session: AtomicU64,
    device_count: AtomicUsize,
}

impl CameraSessionManager {
    pub fn new(backend: Arc<dyn CameraBackend>, base: StreamConstraints, notifier: Notifier) -> Self {
        let (session_tx, _) = watch::channel(None);
        Self {
            backend,
            base,
            notifier,
            session_tx,
            listeners: Mutex::new(Vec::new()),
            requested: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            next_session: AtomicU64::new(1),
            device_count: AtomicUsize::new(0),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn add_teardown_listener(&self, listener: Arc<dyn TeardownListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<StreamSession>> {
        self.session_tx.subscribe()
    }

    pub fn current(&self) -> Option<StreamSession> {
        self.session_tx.borrow().clone()
    }

    pub fn handle(&self) -> Option<StreamHandle> {
        self.current().map(|s| s.handle)
    }

    /// Negotiated dimensions of the live stream, once its first frame arrived.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.current()
            .filter(StreamSession::is_live)
            .map(|s| s.dimensions())
    }

    /// Devices seen by the last enumeration.
    pub fn device_count(&self) -> usize {
        self.device_count.load(Ordering::SeqCst)
    }

    /// Tear down any existing stream and acquire a new one.
    ///
    /// Failures are published as camera notices and returned.
    pub async fn acquire(&self, facing: Option<FacingMode>) -> Result<StreamSession, CameraError> {
        let _guard = self.lifecycle.lock().await;
        let result = self.acquire_locked(facing).await;
        if let Err(e) = &result {
            self.notifier.error(NoticeCategory::Camera, describe(e));
        }
        result
    }

    pub async fn release(&self) {
        let _guard = self.lifecycle.lock().await;
        self.teardown_locked();
    }

    /// Switch to `target`, or to the opposite of the current facing mode.
    pub async fn switch(&self, target: Option<FacingMode>) -> Result<SwitchOutcome, CameraError> {
        let _guard = self.lifecycle.lock().await;

        let devices = match self.backend.enumerate_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                self.notifier.error(NoticeCategory::Camera, describe(&e));
                return Err(e);
            }
        };
        self.device_count.store(devices.len(), Ordering::SeqCst);
        if devices.len() < 2 {
            self.notifier.info(
                NoticeCategory::Camera,
                "Only one camera is available; nothing to switch to",
            );
            return Ok(SwitchOutcome::Unchanged);
        }

        let target = target.unwrap_or_else(|| {
            let current = self
                .current()
                .and_then(|s| s.facing)
                .or(*lock(&self.requested))
                .unwrap_or(FacingMode::Environment);
            current.opposite()
        });
        log::info!("CameraSessionManager: switching to {} camera", target);

        match self.acquire_locked(Some(target)).await {
            Ok(session) => Ok(SwitchOutcome::Switched(session)),
            Err(e) => {
                self.notifier.error(NoticeCategory::Camera, describe(&e));
                Err(e)
            }
        }
    }

    async fn acquire_locked(
        &self,
        facing: Option<FacingMode>,
    ) -> Result<StreamSession, CameraError> {
        let devices = self.backend.enumerate_devices().await?;
        self.device_count.store(devices.len(), Ordering::SeqCst);
        if devices.is_empty() {
            self.teardown_locked();
            return Err(CameraError::NoDevice);
        }

        self.teardown_locked();
        *lock(&self.requested) = facing;

        let constraints = StreamConstraints {
            facing,
            ..self.base.clone()
        };
        let (stream, constrained) = match self.backend.open(&constraints).await {
            Ok(stream) => (stream, true),
            Err(CameraError::PermissionDenied(msg)) => {
                return Err(CameraError::PermissionDenied(msg))
            }
            Err(e) if facing.is_some() => {
                log::warn!(
                    "CameraSessionManager: {} facing request failed ({}); retrying unconstrained",
                    constraints.facing.map(|f| f.as_str()).unwrap_or("any"),
                    e
                );
                (self.backend.open(&constraints.unconstrained()).await?, false)
            }
            Err(e) => return Err(e),
        };

        let device = stream.device().clone();
        let granted = match (constrained, device.facing) {
            (_, Some(f)) => Some(f),
            (true, None) => facing,
            (false, None) => None,
        };
        let fps = stream.fps();
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let handle = StreamHandle::new(id, stream);

        // Dimensions come from the first delivered frame, not the request.
        let first_grab = handle.clone();
        let first = tokio::task::spawn_blocking(move || first_grab.grab())
            .await
            .map_err(|e| CameraError::Backend(format!("first frame task failed: {}", e)))
            .and_then(|r| r);
        let frame = match first {
            Ok(frame) => frame,
            Err(e) => {
                handle.shutdown();
                return Err(e);
            }
        };

        let session = StreamSession {
            id,
            device,
            facing: granted,
            width: frame.width,
            height: frame.height,
            fps,
            handle,
        };
        log::info!(
            "CameraSessionManager: session {} live on {} ({}x{} @ {} fps, facing {})",
            session.id,
            session.device.label,
            session.width,
            session.height,
            session.fps,
            session.facing.map(|f| f.as_str()).unwrap_or("unknown")
        );
        self.session_tx.send_replace(Some(session.clone()));
        Ok(session)
    }

    fn teardown_locked(&self) {
        let Some(previous) = self.session_tx.send_replace(None) else {
            return;
        };
        previous.handle.shutdown();
        let listeners: Vec<Arc<dyn TeardownListener>> = lock(&self.listeners).clone();
        for listener in listeners {
            listener.on_teardown(previous.id);
        }
        log::info!("CameraSessionManager: session {} torn down", previous.id);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn describe(e: &CameraError) -> String {
    match e {
        CameraError::NoDevice => "No camera found. Connect a camera and try again.".to_string(),
        CameraError::PermissionDenied(_) => {
            "Camera access was denied. Grant permission and try again.".to_string()
        }
        CameraError::DeviceUnavailable(_) => {
            "The camera is in use by another application or was disconnected.".to_string()
        }
        other => other.to_string(),
    }
}
