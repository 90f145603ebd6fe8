use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::{FacingMode, StreamConstraints, DEFAULT_FPS, IDEAL_HEIGHT, IDEAL_WIDTH};
use crate::detect::MotionParams;
use crate::settings::Settings;

const DEFAULT_DB_PATH: &str = "skywatch.db";
const DEFAULT_BLOB_DIR: &str = "skywatch_blobs";
const DEFAULT_CAMERA_URL: &str = "stub://sky";
const DEFAULT_OWNER: &str = "local";
const DEFAULT_RECORD_SECS: u64 = 5;
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 500;
const DEFAULT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_PHOTO_OFFSET_MS: u64 = 100;
const DEFAULT_ORACLE_TIMEOUT_SECS: u64 = 60;
const MAX_RECORD_SECS: u64 = 60;

#[derive(Debug, Deserialize, Default)]
struct SkywatchConfigFile {
    owner: Option<String>,
    store: Option<StoreConfigFile>,
    camera: Option<CameraConfigFile>,
    capture: Option<CaptureConfigFile>,
    oracle: Option<OracleConfigFile>,
    settings: Option<Settings>,
    motion: Option<MotionParams>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreConfigFile {
    db_path: Option<String>,
    blob_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    facing_mode: Option<String>,
    ideal_width: Option<u32>,
    ideal_height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    record_secs: Option<u64>,
    sample_interval_ms: Option<u64>,
    cooldown_secs: Option<u64>,
    photo_offset_ms: Option<u64>,
    preferred_mime_types: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct OracleConfigFile {
    url: Option<String>,
    token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SkywatchConfig {
    pub owner: String,
    pub db_path: String,
    pub blob_dir: PathBuf,
    pub camera: CameraSettings,
    pub capture: CaptureSettings,
    pub oracle: OracleSettings,
    /// Initial detection settings, used until the owner saves their own.
    pub settings: Settings,
    pub motion: MotionParams,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// `stub://...` selects the synthetic backend; anything else names a
    /// V4L2 device path (or empty for auto-detect).
    pub url: String,
    pub facing_mode: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub fps: u32,
}

impl CameraSettings {
    pub fn constraints(&self) -> StreamConstraints {
        StreamConstraints {
            device_id: None,
            facing: Some(self.facing_mode),
            ideal_width: self.ideal_width,
            ideal_height: self.ideal_height,
            fps: self.fps,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.url.starts_with("stub://")
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub record_duration: Duration,
    pub sample_interval: Duration,
    pub cooldown: Duration,
    pub photo_offset: Duration,
    pub preferred_mime_types: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OracleSettings {
    /// `None` runs without analysis; every bundle is marked unavailable.
    pub url: Option<String>,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl SkywatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SKYWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SkywatchConfigFile) -> Result<Self> {
        let store = file.store.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let oracle = file.oracle.unwrap_or_default();

        let facing_mode = match camera.facing_mode.as_deref() {
            Some(raw) => raw.parse()?,
            None => FacingMode::Environment,
        };

        Ok(Self {
            owner: file.owner.unwrap_or_else(|| DEFAULT_OWNER.to_string()),
            db_path: store.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            blob_dir: store
                .blob_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BLOB_DIR)),
            camera: CameraSettings {
                url: camera.url.unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
                facing_mode,
                ideal_width: camera.ideal_width.unwrap_or(IDEAL_WIDTH),
                ideal_height: camera.ideal_height.unwrap_or(IDEAL_HEIGHT),
                fps: camera.fps.unwrap_or(DEFAULT_FPS),
            },
            capture: CaptureSettings {
                record_duration: Duration::from_secs(
                    capture.record_secs.unwrap_or(DEFAULT_RECORD_SECS),
                ),
                sample_interval: Duration::from_millis(
                    capture
                        .sample_interval_ms
                        .unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS),
                ),
                cooldown: Duration::from_secs(
                    capture.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
                ),
                photo_offset: Duration::from_millis(
                    capture.photo_offset_ms.unwrap_or(DEFAULT_PHOTO_OFFSET_MS),
                ),
                preferred_mime_types: capture.preferred_mime_types.unwrap_or_default(),
            },
            oracle: OracleSettings {
                url: oracle.url.filter(|u| !u.trim().is_empty()),
                token: oracle.token.filter(|t| !t.trim().is_empty()),
                timeout: Duration::from_secs(
                    oracle.timeout_secs.unwrap_or(DEFAULT_ORACLE_TIMEOUT_SECS),
                ),
            },
            settings: file.settings.unwrap_or_default(),
            motion: file.motion.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SKYWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("SKYWATCH_BLOB_DIR") {
            if !dir.trim().is_empty() {
                self.blob_dir = PathBuf::from(dir);
            }
        }
        if let Ok(url) = std::env::var("SKYWATCH_CAMERA") {
            if !url.trim().is_empty() {
                self.camera.url = url;
            }
        }
        if let Ok(facing) = std::env::var("SKYWATCH_FACING_MODE") {
            if !facing.trim().is_empty() {
                self.camera.facing_mode = facing
                    .parse()
                    .context("SKYWATCH_FACING_MODE must be user or environment")?;
            }
        }
        if let Ok(url) = std::env::var("SKYWATCH_ORACLE_URL") {
            if !url.trim().is_empty() {
                self.oracle.url = Some(url);
            }
        }
        if let Ok(token) = std::env::var("SKYWATCH_ORACLE_TOKEN") {
            if !token.trim().is_empty() {
                self.oracle.token = Some(token);
            }
        }
        if let Ok(owner) = std::env::var("SKYWATCH_OWNER") {
            if !owner.trim().is_empty() {
                self.owner = owner;
            }
        }
        if let Ok(cooldown) = std::env::var("SKYWATCH_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.trim().parse().map_err(|_| {
                anyhow!("SKYWATCH_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.capture.cooldown = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.owner = self.owner.trim().to_string();
        if self.owner.is_empty() || self.owner.contains(['/', '\\']) || self.owner == ".." {
            return Err(anyhow!("owner must be a non-empty name without path separators"));
        }
        if self.camera.fps == 0 {
            return Err(anyhow!("camera fps must be greater than zero"));
        }
        if self.camera.ideal_width == 0 || self.camera.ideal_height == 0 {
            return Err(anyhow!("camera ideal resolution must be non-zero"));
        }
        let record = self.capture.record_duration.as_secs();
        if record == 0 || record > MAX_RECORD_SECS {
            return Err(anyhow!(
                "record duration must be between 1 and {} seconds",
                MAX_RECORD_SECS
            ));
        }
        if self.capture.sample_interval.is_zero() {
            return Err(anyhow!("sample interval must be greater than zero"));
        }
        if self.capture.photo_offset >= self.capture.record_duration {
            return Err(anyhow!("photo offset must fall inside the recording"));
        }
        if self.oracle.timeout.is_zero() {
            return Err(anyhow!("oracle timeout must be greater than zero"));
        }
        if let Some(url) = &self.oracle.url {
            let parsed = url::Url::parse(url)
                .with_context(|| format!("invalid oracle url {}", url))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(anyhow!("oracle url must be http or https: {}", url));
            }
        }
        if self.motion.pixel_stride == 0 {
            return Err(anyhow!("motion pixel_stride must be greater than zero"));
        }
        if self.motion.size_reference_width <= 0.0 {
            return Err(anyhow!("motion size_reference_width must be positive"));
        }
        self.settings = self.settings.clamped();
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<SkywatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let mut cfg = SkywatchConfig::from_file(SkywatchConfigFile::default()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.db_path, DEFAULT_DB_PATH);
        assert_eq!(cfg.camera.facing_mode, FacingMode::Environment);
        assert!(cfg.camera.is_synthetic());
        assert_eq!(cfg.capture.record_duration, Duration::from_secs(5));
        assert_eq!(cfg.capture.sample_interval, Duration::from_millis(500));
        assert_eq!(cfg.capture.cooldown, Duration::from_secs(30));
        assert!(cfg.oracle.url.is_none());
        assert_eq!(cfg.motion, MotionParams::default());
    }

    #[test]
    fn photo_offset_must_fall_inside_recording() {
        let file = SkywatchConfigFile {
            capture: Some(CaptureConfigFile {
                record_secs: Some(2),
                photo_offset_ms: Some(2_000),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut cfg = SkywatchConfig::from_file(file).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn owner_with_separator_is_rejected() {
        let file = SkywatchConfigFile {
            owner: Some("ana/../bob".to_string()),
            ..Default::default()
        };
        let mut cfg = SkywatchConfig::from_file(file).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_http_oracle_url_is_rejected() {
        let file = SkywatchConfigFile {
            oracle: Some(OracleConfigFile {
                url: Some("ftp://oracle.example".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut cfg = SkywatchConfig::from_file(file).unwrap();
        assert!(cfg.validate().is_err());
    }
}
