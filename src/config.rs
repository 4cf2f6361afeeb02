use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::background::BackgroundParams;
use crate::capture::CaptureConfig;
use crate::controller::{ControllerConfig, ShutdownAction};
use crate::retention::StoreConfig;
use crate::segment::{FeederId, SegmentPolicy};
use crate::strategy::StrategyKind;

const DEFAULT_FEEDER_ID: &str = "feeder";
const DEFAULT_ALPHA: f32 = 0.9;
const DEFAULT_DIFF_THRESHOLD: f32 = 30.0;
const DEFAULT_AREA_THRESHOLD: f32 = 0.01;
const DEFAULT_DELAY_SECS: f64 = 5.0;
const DEFAULT_FRAMERATE: u32 = 10;
const DEFAULT_SEGMENT_LENGTH_SECS: u64 = 60;
const DEFAULT_VIDEO_DIR: &str = "videos";
const DEFAULT_EXTENSION: &str = "h264";
const DEFAULT_WARMUP_SECS: u64 = 5;
const DEFAULT_DEVICE: &str = "stub://feeder";
const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_ENCODER_STOP_GRACE_SECS: f64 = 5.0;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct FeederConfigFile {
    general: Option<GeneralConfigFile>,
    background: Option<BackgroundConfigFile>,
    recording: Option<RecordingConfigFile>,
    capture: Option<CaptureConfigFile>,
    status: Option<StatusConfigFile>,
    runtime: Option<RuntimeConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct GeneralConfigFile {
    feeder_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BackgroundConfigFile {
    alpha: Option<f32>,
    diff_threshold: Option<f32>,
    area_threshold: Option<f32>,
    delay_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    framerate: Option<u32>,
    segment_length_secs: Option<u64>,
    length_mode: Option<String>,
    strategy: Option<String>,
    video_dir: Option<PathBuf>,
    staging_dir: Option<PathBuf>,
    extension: Option<String>,
    warmup_secs: Option<u64>,
    on_shutdown: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    encoder_command: Option<Vec<String>>,
    encoder_stop_grace_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct StatusConfigFile {
    liveness_led: Option<PathBuf>,
    activity_led: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RuntimeConfigFile {
    poll_interval_ms: Option<u64>,
    stall_timeout_secs: Option<u64>,
}

/// How the segment target is measured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LengthMode {
    Frames,
    Duration,
}

/// Immutable run configuration.
#[derive(Debug, Clone)]
pub struct FeederConfig {
    pub feeder_id: String,
    pub background: BackgroundSettings,
    pub recording: RecordingSettings,
    pub capture: CaptureSettings,
    pub status: StatusSettings,
    pub runtime: RuntimeSettings,
}

#[derive(Debug, Clone)]
pub struct BackgroundSettings {
    pub alpha: f32,
    pub diff_threshold: f32,
    pub area_threshold: f32,
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub framerate: u32,
    pub segment_length: Duration,
    pub length_mode: LengthMode,
    pub strategy: StrategyKind,
    pub video_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub extension: String,
    pub warmup: Duration,
    pub on_shutdown: ShutdownAction,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub encoder_command: Option<Vec<String>>,
    pub encoder_stop_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct StatusSettings {
    pub liveness_led: Option<PathBuf>,
    pub activity_led: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
}

impl FeederConfig {
    /// Load from `FEEDERCAM_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FEEDERCAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (or defaults), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FeederConfigFile) -> Result<Self> {
        let feeder_id = file
            .general
            .and_then(|general| general.feeder_id)
            .unwrap_or_else(|| DEFAULT_FEEDER_ID.to_string());

        let bg = file.background.unwrap_or_default();
        let delay_secs = bg.delay_secs.unwrap_or(DEFAULT_DELAY_SECS);
        let delay = Duration::try_from_secs_f64(delay_secs)
            .map_err(|_| anyhow!("background.delay_secs must be a non-negative number"))?;
        let background = BackgroundSettings {
            alpha: bg.alpha.unwrap_or(DEFAULT_ALPHA),
            diff_threshold: bg.diff_threshold.unwrap_or(DEFAULT_DIFF_THRESHOLD),
            area_threshold: bg.area_threshold.unwrap_or(DEFAULT_AREA_THRESHOLD),
            delay,
        };

        let rec = file.recording.unwrap_or_default();
        let length_mode = match rec.length_mode.as_deref() {
            None | Some("frames") => LengthMode::Frames,
            Some("duration") => LengthMode::Duration,
            Some(other) => {
                return Err(anyhow!(
                    "recording.length_mode must be 'frames' or 'duration', got '{}'",
                    other
                ))
            }
        };
        let strategy = match rec.strategy.as_deref() {
            None => StrategyKind::Fixed,
            Some(name) => StrategyKind::parse(name).ok_or_else(|| {
                anyhow!(
                    "recording.strategy must be 'fixed' or 'motion-gated', got '{}'",
                    name
                )
            })?,
        };
        let on_shutdown = match rec.on_shutdown.as_deref() {
            None => ShutdownAction::default(),
            Some(action) => ShutdownAction::parse(action).ok_or_else(|| {
                anyhow!(
                    "recording.on_shutdown must be 'discard' or 'retain', got '{}'",
                    action
                )
            })?,
        };
        let video_dir = rec
            .video_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_VIDEO_DIR));
        let recording = RecordingSettings {
            framerate: rec.framerate.unwrap_or(DEFAULT_FRAMERATE),
            segment_length: Duration::from_secs(
                rec.segment_length_secs.unwrap_or(DEFAULT_SEGMENT_LENGTH_SECS),
            ),
            length_mode,
            strategy,
            staging_dir: rec
                .staging_dir
                .unwrap_or_else(|| video_dir.join(".staging")),
            video_dir,
            extension: rec
                .extension
                .unwrap_or_else(|| DEFAULT_EXTENSION.to_string()),
            warmup: Duration::from_secs(rec.warmup_secs.unwrap_or(DEFAULT_WARMUP_SECS)),
            on_shutdown,
        };

        let cap = file.capture.unwrap_or_default();
        let encoder_stop_grace = Duration::try_from_secs_f64(
            cap.encoder_stop_grace_secs
                .unwrap_or(DEFAULT_ENCODER_STOP_GRACE_SECS),
        )
        .map_err(|_| anyhow!("capture.encoder_stop_grace_secs must be a non-negative number"))?;
        let capture = CaptureSettings {
            device: cap.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            width: cap.width.unwrap_or(DEFAULT_WIDTH),
            height: cap.height.unwrap_or(DEFAULT_HEIGHT),
            encoder_command: cap.encoder_command,
            encoder_stop_grace,
        };

        let status = file.status.unwrap_or_default();
        let status = StatusSettings {
            liveness_led: status.liveness_led,
            activity_led: status.activity_led,
        };

        let rt = file.runtime.unwrap_or_default();
        let runtime = RuntimeSettings {
            poll_interval: Duration::from_millis(
                rt.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            stall_timeout: Duration::from_secs(
                rt.stall_timeout_secs.unwrap_or(DEFAULT_STALL_TIMEOUT_SECS),
            ),
        };

        Ok(Self {
            feeder_id,
            background,
            recording,
            capture,
            status,
            runtime,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(feeder_id) = std::env::var("FEEDERCAM_FEEDER_ID") {
            if !feeder_id.trim().is_empty() {
                self.feeder_id = feeder_id;
            }
        }
        if let Ok(dir) = std::env::var("FEEDERCAM_VIDEO_DIR") {
            if !dir.trim().is_empty() {
                let derived = self.recording.video_dir.join(".staging");
                self.recording.video_dir = PathBuf::from(dir);
                if self.recording.staging_dir == derived {
                    self.recording.staging_dir = self.recording.video_dir.join(".staging");
                }
            }
        }
        if let Ok(device) = std::env::var("FEEDERCAM_DEVICE") {
            if !device.trim().is_empty() {
                self.capture.device = device;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.feeder_id = FeederId::new(&self.feeder_id)?.as_str().to_string();
        self.background_params().validate()?;
        if self.recording.framerate == 0 {
            return Err(anyhow!("recording.framerate must be greater than zero"));
        }
        self.segment_policy()?;
        if self.runtime.stall_timeout.is_zero() {
            return Err(anyhow!("runtime.stall_timeout_secs must be greater than zero"));
        }
        if let Some(argv) = &self.capture.encoder_command {
            if argv.is_empty() {
                return Err(anyhow!("capture.encoder_command cannot be empty"));
            }
        }
        Ok(())
    }

    pub fn feeder(&self) -> Result<FeederId> {
        FeederId::new(&self.feeder_id)
    }

    pub fn background_params(&self) -> BackgroundParams {
        BackgroundParams {
            alpha: self.background.alpha,
            diff_threshold: self.background.diff_threshold,
            area_threshold: self.background.area_threshold,
        }
    }

    /// The authoritative segment target for this run.
    pub fn segment_policy(&self) -> Result<SegmentPolicy> {
        let policy = match self.recording.length_mode {
            LengthMode::Frames => SegmentPolicy::from_rate(
                self.recording.framerate,
                self.recording.segment_length.as_secs(),
            )?,
            LengthMode::Duration => SegmentPolicy::Duration(self.recording.segment_length),
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            background: self.background_params(),
            activity_delay: self.background.delay,
            warmup: self.recording.warmup,
            on_shutdown: self.recording.on_shutdown,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            video_dir: self.recording.video_dir.clone(),
            staging_dir: self.recording.staging_dir.clone(),
            extension: self.recording.extension.clone(),
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device: self.capture.device.clone(),
            width: self.capture.width,
            height: self.capture.height,
            framerate: self.recording.framerate,
            encoder_command: self.capture.encoder_command.clone(),
            encoder_stop_grace: self.capture.encoder_stop_grace,
        }
    }
}

fn read_config_file(path: &Path) -> Result<FeederConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
