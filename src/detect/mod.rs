mod motion;
mod overlay;

pub use motion::{compare_frames, DetectionRegion, MotionDetector, MotionParams, SharedDetector};
pub use overlay::{RegionOverlay, DEFAULT_OVERLAY_GRACE};
