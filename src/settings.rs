//! Process-wide detection tunables.
//!
//! Settings are mutated from outside the pipeline (command channel, config
//! UI) and read fresh by the detection loop on every cycle. There is no
//! snapshotting: a sensitivity change takes effect on the very next tick.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

pub const SENSITIVITY_RANGE: (u8, u8) = (0, 100);
pub const BRIGHTNESS_RANGE: (u8, u8) = (0, 100);
pub const OBJECT_SIZE_RANGE: (u8, u8) = (1, 100);

/// Flat settings record, persisted as
/// `{motionSensitivity, minBrightness, minObjectSize, enableAutoMotionDetection}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// 0..=100, higher means smaller brightness deltas count as change.
    pub motion_sensitivity: u8,
    /// 0..=100, pixels darker than this share of full scale are ignored.
    pub min_brightness: u8,
    /// 1..=100, scales the number of changed pixels required to fire.
    pub min_object_size: u8,
    pub enable_auto_motion_detection: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            motion_sensitivity: 50,
            min_brightness: 20,
            min_object_size: 5,
            enable_auto_motion_detection: true,
        }
    }
}

impl Settings {
    /// Clamp every field into its documented range.
    pub fn clamped(self) -> Self {
        Self {
            motion_sensitivity: self
                .motion_sensitivity
                .clamp(SENSITIVITY_RANGE.0, SENSITIVITY_RANGE.1),
            min_brightness: self
                .min_brightness
                .clamp(BRIGHTNESS_RANGE.0, BRIGHTNESS_RANGE.1),
            min_object_size: self
                .min_object_size
                .clamp(OBJECT_SIZE_RANGE.0, OBJECT_SIZE_RANGE.1),
            enable_auto_motion_detection: self.enable_auto_motion_detection,
        }
    }

    /// Apply a single `field value` edit, accepting both the persisted
    /// camelCase names and short aliases.
    pub fn set_field(&mut self, field: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match field.trim() {
            "motionSensitivity" | "sensitivity" => {
                self.motion_sensitivity = parse_percent(field, value)?;
            }
            "minBrightness" | "brightness" => {
                self.min_brightness = parse_percent(field, value)?;
            }
            "minObjectSize" | "size" => {
                self.min_object_size = parse_percent(field, value)?;
            }
            "enableAutoMotionDetection" | "auto" => {
                self.enable_auto_motion_detection = match value {
                    "true" | "on" | "1" => true,
                    "false" | "off" | "0" => false,
                    other => return Err(anyhow!("expected on/off for {}, got '{}'", field, other)),
                };
            }
            other => return Err(anyhow!("unknown setting '{}'", other)),
        }
        *self = self.clamped();
        Ok(())
    }
}

fn parse_percent(field: &str, value: &str) -> Result<u8> {
    let parsed: i64 = value
        .parse()
        .map_err(|_| anyhow!("{} must be an integer, got '{}'", field, value))?;
    Ok(parsed.clamp(0, 100) as u8)
}

/// Shared, always-current settings handle.
#[derive(Clone, Debug, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<Settings>>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings.clamped())),
        }
    }

    /// Current value. Poisoning is ignored: `Settings` is `Copy` and always valid.
    pub fn current(&self) -> Settings {
        match self.inner.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn replace(&self, settings: Settings) {
        self.update(|current| *current = settings);
    }

    pub fn update<F: FnOnce(&mut Settings)>(&self, f: F) -> Settings {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
        *guard = guard.clamped();
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_flat_record_with_defaults() {
        let s: Settings =
            serde_json::from_str(r#"{"motionSensitivity":80,"enableAutoMotionDetection":false}"#)
                .unwrap();
        assert_eq!(s.motion_sensitivity, 80);
        assert!(!s.enable_auto_motion_detection);
        assert_eq!(s.min_brightness, Settings::default().min_brightness);

        let json = serde_json::to_value(s).unwrap();
        assert!(json.get("minObjectSize").is_some());
    }

    #[test]
    fn clamps_out_of_range_values() {
        let s = Settings {
            motion_sensitivity: 250,
            min_brightness: 101,
            min_object_size: 0,
            enable_auto_motion_detection: true,
        }
        .clamped();
        assert_eq!(s.motion_sensitivity, 100);
        assert_eq!(s.min_brightness, 100);
        assert_eq!(s.min_object_size, 1);
    }

    #[test]
    fn set_field_accepts_aliases() {
        let mut s = Settings::default();
        s.set_field("sensitivity", "90").unwrap();
        s.set_field("auto", "off").unwrap();
        s.set_field("minObjectSize", "0").unwrap();
        assert_eq!(s.motion_sensitivity, 90);
        assert!(!s.enable_auto_motion_detection);
        assert_eq!(s.min_object_size, 1);
        assert!(s.set_field("gain", "3").is_err());
        assert!(s.set_field("brightness", "bright").is_err());
    }

    #[test]
    fn shared_settings_are_always_current() {
        let shared = SharedSettings::new(Settings::default());
        let reader = shared.clone();
        shared.update(|s| s.motion_sensitivity = 77);
        assert_eq!(reader.current().motion_sensitivity, 77);
    }
}
