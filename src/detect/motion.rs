use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::camera::TeardownListener;
use crate::frame::SampledFrame;
use crate::settings::Settings;

/// Tuning constants for frame differencing.
///
/// The defaults are empirically tuned values; they are configuration, not
/// derived quantities.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionParams {
    /// Sampled pixels visited along each axis (every Nth pixel).
    pub pixel_stride: u32,
    /// Threshold span covered by the sensitivity range.
    pub threshold_span: f32,
    /// Threshold at maximum sensitivity.
    pub threshold_floor: f32,
    /// Sampled width at which one unit of object size equals one pixel.
    pub size_reference_width: f32,
    /// Lower bound on the changed-pixel requirement.
    pub min_changed_pixels: f32,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            pixel_stride: 4,
            threshold_span: 70.0,
            threshold_floor: 5.0,
            size_reference_width: 250.0,
            min_changed_pixels: 5.0,
        }
    }
}

impl MotionParams {
    /// Brightness delta a pixel must exceed to count as changed.
    ///
    /// `(100 - sensitivity) / 100 * span + floor`, so with the defaults the
    /// threshold runs from 75 (sensitivity 0) down to 5 (sensitivity 100).
    pub fn delta_threshold(&self, sensitivity: u8) -> f32 {
        let s = sensitivity.min(100) as f32;
        (100.0 - s) / 100.0 * self.threshold_span + self.threshold_floor
    }

    /// Changed-pixel count a detection must exceed.
    pub fn min_pixels(&self, min_object_size: u8, sampled_width: u32) -> f32 {
        let scaled =
            min_object_size as f32 * (sampled_width as f32 / self.size_reference_width);
        scaled.max(self.min_changed_pixels)
    }

    /// `minBrightness` percent on the 0..=255 brightness scale.
    pub fn brightness_floor(min_brightness: u8) -> f32 {
        min_brightness.min(100) as f32 * 2.55
    }
}

/// Bounding box of detected change, in source-resolution pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub changed_pixels: u32,
    pub detected_at: Instant,
}

impl DetectionRegion {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

/// Frame-differencing motion detector.
///
/// The only state is the previous sampled frame. `reset()` drops it; it is
/// invoked on every stream teardown so frames from different sessions are
/// never compared.
#[derive(Debug, Default)]
pub struct MotionDetector {
    params: MotionParams,
    previous: Option<SampledFrame>,
}

impl MotionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: MotionParams) -> Self {
        Self {
            params,
            previous: None,
        }
    }

    pub fn params(&self) -> &MotionParams {
        &self.params
    }

    pub fn has_baseline(&self) -> bool {
        self.previous.is_some()
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Compare `current` against the previous frame, then keep `current` as
    /// the new baseline.
    ///
    /// A frame whose geometry differs from the baseline only becomes the new
    /// baseline.
    pub fn evaluate(
        &mut self,
        current: SampledFrame,
        settings: &Settings,
    ) -> Option<DetectionRegion> {
        let region = match &self.previous {
            Some(previous) if previous.same_geometry(&current) => {
                compare_frames(previous, &current, settings, &self.params)
            }
            Some(_) => {
                log::debug!("MotionDetector: frame geometry changed; rebaselining");
                None
            }
            None => None,
        };
        self.previous = Some(current);
        region
    }
}

/// Pure comparison of two equally sized sampled frames.
pub fn compare_frames(
    previous: &SampledFrame,
    current: &SampledFrame,
    settings: &Settings,
    params: &MotionParams,
) -> Option<DetectionRegion> {
    if !previous.same_geometry(current) {
        return None;
    }

    let stride = params.pixel_stride.max(1);
    let threshold = params.delta_threshold(settings.motion_sensitivity);
    let floor = MotionParams::brightness_floor(settings.min_brightness);

    let mut changed = 0u32;
    let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
    let (mut max_x, mut max_y) = (0u32, 0u32);

    for y in (0..current.height).step_by(stride as usize) {
        for x in (0..current.width).step_by(stride as usize) {
            let brightness = current.brightness(x, y);
            if brightness < floor {
                continue;
            }
            let delta = (brightness - previous.brightness(x, y)).abs();
            if delta > threshold {
                changed += 1;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
    }

    if changed as f32 <= params.min_pixels(settings.min_object_size, current.width) {
        return None;
    }
    if max_x <= min_x && max_y <= min_y {
        return None;
    }

    // Each visited point stands for a stride-wide cell, so the box is never
    // degenerate even when the extent collapses on one axis.
    let scale = current.scale;
    let cell_w = (max_x - min_x + stride).min(current.width - min_x);
    let cell_h = (max_y - min_y + stride).min(current.height - min_y);
    Some(DetectionRegion {
        x: min_x * scale,
        y: min_y * scale,
        width: cell_w * scale,
        height: cell_h * scale,
        changed_pixels: changed,
        detected_at: current.captured_at,
    })
}

/// Detector shared between the detection loop and the camera manager's
/// teardown notifications.
#[derive(Clone, Debug, Default)]
pub struct SharedDetector {
    inner: Arc<Mutex<MotionDetector>>,
}

impl SharedDetector {
    pub fn new(detector: MotionDetector) -> Self {
        Self {
            inner: Arc::new(Mutex::new(detector)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MotionDetector) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn reset(&self) {
        self.with(MotionDetector::reset);
    }

    pub fn has_baseline(&self) -> bool {
        self.with(|d| d.has_baseline())
    }
}

impl TeardownListener for SharedDetector {
    fn on_teardown(&self, session_id: u64) {
        log::debug!("MotionDetector: reset after teardown of session {}", session_id);
        self.reset();
    }
}
