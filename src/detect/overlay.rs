use std::time::Duration;
use tokio::time::Instant;

use super::motion::DetectionRegion;

/// How long a region stays visible without a fresh detection.
pub const DEFAULT_OVERLAY_GRACE: Duration = Duration::from_secs(1);

/// Last reported region, kept briefly so the visual overlay does not flicker
/// between detection cycles.
#[derive(Clone, Debug)]
pub struct RegionOverlay {
    grace: Duration,
    region: Option<DetectionRegion>,
}

impl Default for RegionOverlay {
    fn default() -> Self {
        Self::new(DEFAULT_OVERLAY_GRACE)
    }
}

impl RegionOverlay {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            region: None,
        }
    }

    /// Record the outcome of one detection cycle.
    pub fn observe(&mut self, detection: Option<DetectionRegion>, now: Instant) {
        match detection {
            Some(region) => self.region = Some(region),
            None => self.prune(now),
        }
    }

    /// Drop the region once its grace period has elapsed.
    pub fn prune(&mut self, now: Instant) {
        if let Some(region) = &self.region {
            if now.saturating_duration_since(region.detected_at) >= self.grace {
                self.region = None;
            }
        }
    }

    pub fn current(&self, now: Instant) -> Option<DetectionRegion> {
        self.region
            .filter(|region| now.saturating_duration_since(region.detected_at) < self.grace)
    }

    pub fn clear(&mut self) {
        self.region = None;
    }
}
