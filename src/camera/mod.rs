//! Camera sessions.
//!
//! This module owns the physical stream lifecycle:
//! - Enumerating devices and acquiring a stream (with a facing-mode fallback)
//! - Negotiating dimensions from the first delivered frame
//! - Tearing down before re-acquiring, so at most one stream is ever live
//! - Notifying teardown listeners (the motion detector) on every release
//!
//! Backends:
//! - Synthetic sky (`stub://` devices) for tests and demos
//! - V4L2 devices (feature: camera-v4l2)
//!
//! Dependents never own the stream. They read the current `StreamSession`
//! from a `watch` channel; the session's handle stops delivering frames as
//! soon as it is torn down.

mod manager;
#[cfg(feature = "camera-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "camera-v4l2")]
pub mod v4l2;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::frame::VideoFrame;

pub use manager::{CameraSessionManager, SwitchOutcome};
pub use synthetic::{SyntheticBackend, SyntheticScene};
#[cfg(feature = "camera-v4l2")]
pub use v4l2::V4l2Backend;

/// Preferred stream resolution.
pub const IDEAL_WIDTH: u32 = 1280;
pub const IDEAL_HEIGHT: u32 = 720;
pub const DEFAULT_FPS: u32 = 10;

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Categorized acquisition and stream errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("no camera devices available")]
    NoDevice,
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera unavailable (in use or disconnected): {0}")]
    DeviceUnavailable(String),
    #[error("camera constraints not supported: {0}")]
    Unsupported(String),
    #[error("camera stream has ended")]
    StreamEnded,
    #[error("camera backend error: {0}")]
    Backend(String),
}

// ----------------------------------------------------------------------------
// Devices and constraints
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

impl FacingMode {
    pub fn opposite(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FacingMode::User => "user",
            FacingMode::Environment => "environment",
        }
    }
}

impl std::fmt::Display for FacingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FacingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" | "front" => Ok(FacingMode::User),
            "environment" | "back" | "rear" => Ok(FacingMode::Environment),
            other => Err(anyhow::anyhow!(
                "unknown facing mode '{}'; expected user or environment",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    /// `None` when the platform cannot tell which way the camera faces.
    pub facing: Option<FacingMode>,
}

/// Stream request. `facing: None` is the unconstrained request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConstraints {
    pub device_id: Option<String>,
    pub facing: Option<FacingMode>,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub fps: u32,
}

impl Default for StreamConstraints {
    fn default() -> Self {
        Self {
            device_id: None,
            facing: None,
            ideal_width: IDEAL_WIDTH,
            ideal_height: IDEAL_HEIGHT,
            fps: DEFAULT_FPS,
        }
    }
}

impl StreamConstraints {
    pub fn unconstrained(&self) -> Self {
        Self {
            facing: None,
            ..self.clone()
        }
    }
}

// ----------------------------------------------------------------------------
// Backend traits
// ----------------------------------------------------------------------------

/// An open stream. `grab` returns the most recent frame and must not block
/// for longer than one frame interval.
pub trait VideoStream: Send + Sync {
    fn grab(&self) -> Result<VideoFrame, CameraError>;

    fn fps(&self) -> u32;

    fn device(&self) -> &DeviceInfo;

    /// Release the underlying device. Idempotent.
    fn stop(&self);
}

#[async_trait]
pub trait CameraBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, CameraError>;

    async fn open(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn VideoStream>, CameraError>;
}

/// Notified whenever the active stream is torn down.
pub trait TeardownListener: Send + Sync {
    fn on_teardown(&self, session_id: u64);
}

// ----------------------------------------------------------------------------
// StreamHandle / StreamSession
// ----------------------------------------------------------------------------

struct StreamInner {
    session_id: u64,
    stream: Box<dyn VideoStream>,
    live: AtomicBool,
}

/// Borrowed reference to the live stream, valid until the next teardown.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("session_id", &self.inner.session_id)
            .field("device", &self.inner.stream.device().id)
            .field("live", &self.is_live())
            .finish()
    }
}

impl StreamHandle {
    pub(crate) fn new(session_id: u64, stream: Box<dyn VideoStream>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                session_id,
                stream,
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.inner.session_id
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn fps(&self) -> u32 {
        self.inner.stream.fps()
    }

    pub fn grab(&self) -> Result<VideoFrame, CameraError> {
        if !self.is_live() {
            return Err(CameraError::StreamEnded);
        }
        self.inner.stream.grab()
    }

    pub(crate) fn shutdown(&self) {
        if self.inner.live.swap(false, Ordering::SeqCst) {
            self.inner.stream.stop();
        }
    }
}

/// The active camera acquisition.
#[derive(Clone, Debug)]
pub struct StreamSession {
    pub id: u64,
    pub device: DeviceInfo,
    /// Facing mode that was actually granted (`None` after the fallback).
    pub facing: Option<FacingMode>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub handle: StreamHandle,
}

impl StreamSession {
    pub fn is_live(&self) -> bool {
        self.handle.is_live()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facing_mode_parses_aliases() {
        assert_eq!("back".parse::<FacingMode>().unwrap(), FacingMode::Environment);
        assert_eq!(" User ".parse::<FacingMode>().unwrap(), FacingMode::User);
        assert!("sideways".parse::<FacingMode>().is_err());
        assert_eq!(FacingMode::User.opposite(), FacingMode::Environment);
    }

    #[test]
    fn unconstrained_request_keeps_resolution() {
        let c = StreamConstraints {
            facing: Some(FacingMode::User),
            ..StreamConstraints::default()
        };
        let u = c.unconstrained();
        assert_eq!(u.facing, None);
        assert_eq!((u.ideal_width, u.ideal_height), (IDEAL_WIDTH, IDEAL_HEIGHT));
    }
}
