//! Runtime configuration.
//!
//! Loaded from an optional JSON file, overridden from the command line or
//! environment, then validated once before anything starts. Every section
//! has defaults, so a file only needs the keys it changes:
//!
//! ```json
//! {
//!   "source": { "video_path": "intersection.mp4" },
//!   "detector": { "kind": "http", "endpoint": "http://127.0.0.1:9000/detect" },
//!   "server": { "bind": "127.0.0.1:8080" }
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::congestion::Thresholds;
use crate::detect::{BBox, RawDetection};
use crate::error::ConfigError;
use crate::signal::{PhaseTimings, TierDurations};

const MAX_WIDTH: u32 = 7680;
const MAX_HEIGHT: u32 = 4320;
const MAX_FPS: f64 = 120.0;
const MIN_FRAME_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Decode a video file with ffmpeg.
    Ffmpeg,
    /// Synthetic moving gradient; needs no external tools.
    Pattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Run without detections.
    #[serde(rename = "none")]
    #[value(name = "none")]
    Disabled,
    Http,
    Static,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub video_path: PathBuf,
    pub frame_width: u32,
    pub frame_height: u32,
    pub restart_attempts: u32,
    pub pattern_frames: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Ffmpeg,
            video_path: PathBuf::from("live_cam.mp4"),
            frame_width: 960,
            frame_height: 540,
            restart_attempts: 3,
            pattern_frames: 300,
        }
    }
}

/// A fixed detection, for the `static` detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticDetection {
    pub label: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

impl From<&StaticDetection> for RawDetection {
    fn from(d: &StaticDetection) -> Self {
        let [x, y, w, h] = d.bbox;
        RawDetection {
            label: d.label.clone(),
            confidence: d.confidence,
            bbox: BBox::new(x, y, w, h),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub kind: DetectorKind,
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
    pub confidence_threshold: f32,
    pub detections: Vec<StaticDetection>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Disabled,
            endpoint: None,
            timeout_ms: 2000,
            confidence_threshold: 0.3,
            detections: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionConfig {
    pub window_size: usize,
    pub t_low: u32,
    pub t_high: u32,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        let t = Thresholds::default();
        Self {
            window_size: 30,
            t_low: t.low,
            t_high: t.high,
        }
    }
}

impl CongestionConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            low: self.t_low,
            high: self.t_high,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub target_fps: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { target_fps: 30.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub jpeg_quality: u8,
    pub max_frame_bytes: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            max_frame_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub push_backlog: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { push_backlog: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5001".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub detector: DetectorConfig,
    pub congestion: CongestionConfig,
    pub signal: PhaseTimings,
    pub pipeline: PipelineConfig,
    pub render: RenderConfig,
    pub hub: HubConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Reads a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path` if given, otherwise starts from defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        use ConfigError as E;

        let s = &self.source;
        if s.video_path.as_os_str().is_empty() {
            return Err(E::invalid("source.video_path", "must not be empty"));
        }
        if s.frame_width == 0 || s.frame_width > MAX_WIDTH {
            return Err(E::invalid(
                "source.frame_width",
                format!("must be in 1..={MAX_WIDTH}, got {}", s.frame_width),
            ));
        }
        if s.frame_height == 0 || s.frame_height > MAX_HEIGHT {
            return Err(E::invalid(
                "source.frame_height",
                format!("must be in 1..={MAX_HEIGHT}, got {}", s.frame_height),
            ));
        }
        if s.restart_attempts == 0 {
            return Err(E::invalid("source.restart_attempts", "must be at least 1"));
        }
        if s.pattern_frames == 0 {
            return Err(E::invalid("source.pattern_frames", "must be at least 1"));
        }

        let d = &self.detector;
        if d.kind == DetectorKind::Http && d.endpoint.as_deref().is_none_or(str::is_empty) {
            return Err(E::invalid(
                "detector.endpoint",
                "required when detector.kind is http",
            ));
        }
        if d.timeout_ms == 0 {
            return Err(E::invalid("detector.timeout_ms", "must be positive"));
        }
        if !(0.0..=1.0).contains(&d.confidence_threshold) {
            return Err(E::invalid(
                "detector.confidence_threshold",
                format!("must be within [0, 1], got {}", d.confidence_threshold),
            ));
        }

        let c = &self.congestion;
        if c.window_size == 0 {
            return Err(E::invalid("congestion.window_size", "must be at least 1"));
        }
        if c.t_low >= c.t_high {
            return Err(E::invalid(
                "congestion.t_low",
                format!("must be below t_high ({} >= {})", c.t_low, c.t_high),
            ));
        }

        check_tiers("signal.green", &self.signal.green)?;
        check_tiers("signal.red", &self.signal.red)?;
        if self.signal.yellow_secs == 0 {
            return Err(E::invalid("signal.yellow_secs", "must be positive"));
        }

        let fps = self.pipeline.target_fps;
        if !(fps.is_finite() && fps > 0.0 && fps <= MAX_FPS) {
            return Err(E::invalid(
                "pipeline.target_fps",
                format!("must be in (0, {MAX_FPS}], got {fps}"),
            ));
        }

        if !(1..=100).contains(&self.render.jpeg_quality) {
            return Err(E::invalid(
                "render.jpeg_quality",
                format!("must be in 1..=100, got {}", self.render.jpeg_quality),
            ));
        }
        if self.render.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(E::invalid(
                "render.max_frame_bytes",
                format!("must be at least {MIN_FRAME_BYTES}"),
            ));
        }

        if self.hub.push_backlog == 0 {
            return Err(E::invalid("hub.push_backlog", "must be at least 1"));
        }

        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server.bind.parse().map_err(|err| {
            ConfigError::invalid("server.bind", format!("{:?}: {err}", self.server.bind))
        })
    }

    pub fn cycle_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.pipeline.target_fps)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector.timeout_ms)
    }
}

fn check_tiers(field: &'static str, tiers: &TierDurations) -> Result<(), ConfigError> {
    if tiers.low == 0 || tiers.medium == 0 || tiers.high == 0 {
        return Err(ConfigError::invalid(
            field,
            "every tier duration must be positive",
        ));
    }
    Ok(())
}

/// Command-line and environment overrides applied on top of the file.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigOverrides {
    /// Video file to loop
    #[arg(long, env = "TRAFFIC_VIDEO_PATH")]
    pub video: Option<PathBuf>,

    /// Frame source
    #[arg(long, value_enum, env = "TRAFFIC_SOURCE")]
    pub source: Option<SourceKind>,

    /// Detector backend
    #[arg(long, value_enum, env = "TRAFFIC_DETECTOR")]
    pub detector: Option<DetectorKind>,

    /// Inference endpoint for the http detector
    #[arg(long, env = "TRAFFIC_DETECTOR_ENDPOINT")]
    pub detector_endpoint: Option<String>,

    /// Minimum detection confidence
    #[arg(long)]
    pub confidence: Option<f32>,

    /// Target pipeline rate in cycles per second
    #[arg(long, env = "TRAFFIC_TARGET_FPS")]
    pub fps: Option<f64>,

    /// JPEG quality of streamed frames
    #[arg(long)]
    pub jpeg_quality: Option<u8>,

    /// Listen address
    #[arg(long, env = "TRAFFIC_BIND")]
    pub bind: Option<String>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(video) = &self.video {
            config.source.video_path = video.clone();
        }
        if let Some(kind) = self.source {
            config.source.kind = kind;
        }
        if let Some(kind) = self.detector {
            config.detector.kind = kind;
        }
        if let Some(endpoint) = &self.detector_endpoint {
            config.detector.endpoint = Some(endpoint.clone());
        }
        if let Some(confidence) = self.confidence {
            config.detector.confidence_threshold = confidence;
        }
        if let Some(fps) = self.fps {
            config.pipeline.target_fps = fps;
        }
        if let Some(quality) = self.jpeg_quality {
            config.render.jpeg_quality = quality;
        }
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
    }
}
