use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::color::{ColorRange, TrackedObjectPreset};
use crate::control::{ControllerSettings, PidGains, DEFAULT_COMMAND_DURATION, DEFAULT_COMMAND_SCALE};
use crate::detect::{DetectionMode, DEFAULT_MIN_SIZE_FRACTION, DEFAULT_SAMPLE_RADIUS};
use crate::scheduler::TickPeriods;

const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 360;
const DEFAULT_VIDEO_TICK_MS: u64 = 66;
const DEFAULT_CONTROL_TICK_MS: u64 = 500;
const DEFAULT_SOURCE_FPS: u32 = 15;

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    video: Option<VideoConfigFile>,
    control: Option<ControlConfigFile>,
    detection: Option<DetectionConfigFile>,
    source: Option<SourceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    tick_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ControlConfigFile {
    tick_ms: Option<u64>,
    command_scale: Option<f64>,
    command_duration: Option<u32>,
    gains_x: Option<PidGains>,
    gains_y: Option<PidGains>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    mode: Option<DetectionMode>,
    preset: Option<TrackedObjectPreset>,
    sample_radius: Option<u32>,
    color_range: Option<ColorRange>,
    face_cascade: Option<PathBuf>,
    face_min_size_fraction: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    fps: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub video: VideoSettings,
    pub control: ControlSettings,
    pub detection: DetectionSettings,
    pub source: SourceSettings,
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub tick: Duration,
}

#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub tick: Duration,
    pub settings: ControllerSettings,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub mode: DetectionMode,
    pub preset: TrackedObjectPreset,
    pub sample_radius: u32,
    pub color_range: ColorRange,
    /// OpenCV `haarcascade_*.xml` or a JSON cascade.
    pub face_cascade: Option<PathBuf>,
    pub face_min_size_fraction: f64,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub fps: u32,
}

impl TrackerConfig {
    /// Load from the file named by `TRACKER_CONFIG` (if set), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRACKER_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (or defaults), then apply environment
    /// overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn tick_periods(&self) -> TickPeriods {
        TickPeriods {
            video: self.video.tick,
            control: self.control.tick,
        }
    }

    fn from_file(file: TrackerConfigFile) -> Self {
        let video = file.video.unwrap_or_default();
        let control = file.control.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let source = file.source.unwrap_or_default();

        Self {
            video: VideoSettings {
                width: video.width.unwrap_or(DEFAULT_FRAME_WIDTH),
                height: video.height.unwrap_or(DEFAULT_FRAME_HEIGHT),
                tick: Duration::from_millis(video.tick_ms.unwrap_or(DEFAULT_VIDEO_TICK_MS)),
            },
            control: ControlSettings {
                tick: Duration::from_millis(control.tick_ms.unwrap_or(DEFAULT_CONTROL_TICK_MS)),
                settings: ControllerSettings {
                    gains_x: control.gains_x.unwrap_or_default(),
                    gains_y: control.gains_y.unwrap_or_default(),
                    command_scale: control.command_scale.unwrap_or(DEFAULT_COMMAND_SCALE),
                    command_duration: control
                        .command_duration
                        .unwrap_or(DEFAULT_COMMAND_DURATION),
                },
            },
            detection: DetectionSettings {
                mode: detection.mode.unwrap_or_default(),
                preset: detection.preset.unwrap_or_default(),
                sample_radius: detection.sample_radius.unwrap_or(DEFAULT_SAMPLE_RADIUS),
                color_range: detection.color_range.unwrap_or_default(),
                face_cascade: detection.face_cascade,
                face_min_size_fraction: detection
                    .face_min_size_fraction
                    .unwrap_or(DEFAULT_MIN_SIZE_FRACTION),
            },
            source: SourceSettings {
                fps: source.fps.unwrap_or(DEFAULT_SOURCE_FPS),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var("TRACKER_MODE") {
            if !mode.trim().is_empty() {
                self.detection.mode = mode
                    .parse()
                    .map_err(|e| anyhow!("TRACKER_MODE: {}", e))?;
            }
        }
        if let Ok(preset) = std::env::var("TRACKER_PRESET") {
            if !preset.trim().is_empty() {
                self.detection.preset = preset
                    .parse()
                    .map_err(|e| anyhow!("TRACKER_PRESET: {}", e))?;
            }
        }
        if let Ok(ms) = std::env::var("TRACKER_VIDEO_TICK_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|_| anyhow!("TRACKER_VIDEO_TICK_MS must be an integer number of milliseconds"))?;
            self.video.tick = Duration::from_millis(ms);
        }
        if let Ok(ms) = std::env::var("TRACKER_CONTROL_TICK_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                anyhow!("TRACKER_CONTROL_TICK_MS must be an integer number of milliseconds")
            })?;
            self.control.tick = Duration::from_millis(ms);
        }
        if let Ok(path) = std::env::var("TRACKER_FACE_CASCADE") {
            if !path.trim().is_empty() {
                self.detection.face_cascade = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.video.width == 0 || self.video.height == 0 {
            return Err(anyhow!("video width and height must be greater than zero"));
        }
        if self.video.tick.is_zero() || self.control.tick.is_zero() {
            return Err(anyhow!("tick periods must be greater than zero"));
        }
        if self.video.tick >= self.control.tick {
            return Err(anyhow!(
                "video tick ({} ms) must be shorter than control tick ({} ms)",
                self.video.tick.as_millis(),
                self.control.tick.as_millis()
            ));
        }
        if self.detection.sample_radius == 0 {
            return Err(anyhow!("sample radius must be greater than zero"));
        }
        if !(self.detection.face_min_size_fraction > 0.0 && self.detection.face_min_size_fraction <= 1.0) {
            return Err(anyhow!("face min size fraction must be in (0, 1]"));
        }
        if self.detection.mode == DetectionMode::FaceDetection && self.detection.face_cascade.is_none() {
            return Err(anyhow!("face detection mode requires a face cascade path"));
        }
        if self.source.fps == 0 {
            return Err(anyhow!("source fps must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from_file(TrackerConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<TrackerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
