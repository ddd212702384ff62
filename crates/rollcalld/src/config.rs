use rollcall_core::model::ModelError;
use rollcall_core::{DecisionConfig, DistanceMetric, GalleryConfig, LocatorConfig, ModelManifest};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which D-Bus bus to serve on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    System,
    Session,
}

impl FromStr for Bus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "session" => Ok(Self::Session),
            other => Err(format!("unknown bus: {other}")),
        }
    }
}

/// Daemon configuration.
///
/// Layered: built-in defaults, then the TOML file named by `ROLLCALL_CONFIG`,
/// then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Replay still images from this directory instead of opening the camera.
    pub replay_dir: Option<PathBuf>,
    /// Spacing between replayed stills.
    pub replay_interval_ms: u64,
    /// Directory containing the ONNX models and `manifest.toml`.
    pub model_dir: PathBuf,
    /// Start without a manifest or without model checksums. Off by default.
    pub allow_unverified_models: bool,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub bus: Bus,
    /// Number of frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    pub decision: DecisionConfig,
    /// Regions must score strictly above this to be embedded.
    pub min_detection_confidence: f32,
    pub nms_threshold: f32,
    pub metric: DistanceMetric,
    pub max_references: usize,
    /// Frames waiting for analysis before the oldest is dropped.
    pub queue_depth: usize,
    /// Analysis threads; each loads its own model sessions.
    pub worker_count: usize,
    /// Consecutive detector failures before the service reports degraded.
    pub degraded_after: u32,
    /// Whether `match_threshold` was set explicitly rather than defaulted.
    pub threshold_configured: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            replay_dir: None,
            replay_interval_ms: 100,
            model_dir: rollcall_core::default_model_dir(),
            allow_unverified_models: false,
            db_path: data_dir().join("rollcall.db"),
            bus: Bus::System,
            warmup_frames: 4,
            decision: DecisionConfig::default(),
            min_detection_confidence: 0.6,
            nms_threshold: 0.4,
            metric: DistanceMetric::Cosine,
            max_references: 10,
            queue_depth: 4,
            worker_count: 1,
            degraded_after: 10,
            threshold_configured: false,
        }
    }
}

/// Shape of the optional TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    capture_width: Option<u32>,
    capture_height: Option<u32>,
    replay_dir: Option<PathBuf>,
    replay_interval_ms: Option<u64>,
    model_dir: Option<PathBuf>,
    allow_unverified_models: Option<bool>,
    db_path: Option<PathBuf>,
    bus: Option<Bus>,
    warmup_frames: Option<usize>,
    match_threshold: Option<f32>,
    confirm_run: Option<u32>,
    holdout_run: Option<u32>,
    track_timeout_ms: Option<u64>,
    max_displacement_px: Option<f32>,
    min_detection_confidence: Option<f32>,
    nms_threshold: Option<f32>,
    metric: Option<DistanceMetric>,
    max_references: Option<usize>,
    queue_depth: Option<usize>,
    worker_count: Option<usize>,
    degraded_after: Option<u32>,
}

macro_rules! layer {
    ($target:expr, $value:expr) => {
        if let Some(v) = $value {
            $target = v;
        }
    };
}

impl Config {
    /// Load defaults, the optional config file, and environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
        let file: FileConfig =
            toml::from_str(&text).map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
        self.apply(file);
        tracing::info!(path = %path.display(), "config file loaded");
        Ok(())
    }

    fn apply(&mut self, file: FileConfig) {
        self.threshold_configured |= file.match_threshold.is_some();

        layer!(self.camera_device, file.camera_device);
        layer!(self.capture_width, file.capture_width);
        layer!(self.capture_height, file.capture_height);
        layer!(self.replay_dir, file.replay_dir.map(Some));
        layer!(self.replay_interval_ms, file.replay_interval_ms);
        layer!(self.model_dir, file.model_dir);
        layer!(self.allow_unverified_models, file.allow_unverified_models);
        layer!(self.db_path, file.db_path);
        layer!(self.bus, file.bus);
        layer!(self.warmup_frames, file.warmup_frames);
        layer!(self.decision.match_threshold, file.match_threshold);
        layer!(self.decision.confirm_run, file.confirm_run);
        layer!(self.decision.holdout_run, file.holdout_run);
        layer!(self.decision.track_timeout_ms, file.track_timeout_ms);
        layer!(self.decision.max_displacement_px, file.max_displacement_px);
        layer!(self.min_detection_confidence, file.min_detection_confidence);
        layer!(self.nms_threshold, file.nms_threshold);
        layer!(self.metric, file.metric);
        layer!(self.max_references, file.max_references);
        layer!(self.queue_depth, file.queue_depth);
        layer!(self.worker_count, file.worker_count);
        layer!(self.degraded_after, file.degraded_after);
    }

    /// Apply `ROLLCALL_*` overrides read through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let file = FileConfig {
            camera_device: lookup("ROLLCALL_CAMERA_DEVICE"),
            capture_width: env_parse(&lookup, "ROLLCALL_CAPTURE_WIDTH"),
            capture_height: env_parse(&lookup, "ROLLCALL_CAPTURE_HEIGHT"),
            replay_dir: lookup("ROLLCALL_REPLAY_DIR").map(PathBuf::from),
            replay_interval_ms: env_parse(&lookup, "ROLLCALL_REPLAY_INTERVAL_MS"),
            model_dir: lookup("ROLLCALL_MODEL_DIR").map(PathBuf::from),
            allow_unverified_models: env_parse(&lookup, "ROLLCALL_ALLOW_UNVERIFIED_MODELS"),
            db_path: lookup("ROLLCALL_DB_PATH").map(PathBuf::from),
            bus: env_parse(&lookup, "ROLLCALL_BUS"),
            warmup_frames: env_parse(&lookup, "ROLLCALL_WARMUP_FRAMES"),
            match_threshold: env_parse(&lookup, "ROLLCALL_MATCH_THRESHOLD"),
            confirm_run: env_parse(&lookup, "ROLLCALL_CONFIRM_RUN"),
            holdout_run: env_parse(&lookup, "ROLLCALL_HOLDOUT_RUN"),
            track_timeout_ms: env_parse(&lookup, "ROLLCALL_TRACK_TIMEOUT_MS"),
            max_displacement_px: env_parse(&lookup, "ROLLCALL_MAX_DISPLACEMENT_PX"),
            min_detection_confidence: env_parse(&lookup, "ROLLCALL_MIN_DETECTION_CONFIDENCE"),
            nms_threshold: env_parse(&lookup, "ROLLCALL_NMS_THRESHOLD"),
            metric: env_parse(&lookup, "ROLLCALL_METRIC"),
            max_references: env_parse(&lookup, "ROLLCALL_MAX_REFERENCES"),
            queue_depth: env_parse(&lookup, "ROLLCALL_QUEUE_DEPTH"),
            worker_count: env_parse(&lookup, "ROLLCALL_WORKER_COUNT"),
            degraded_after: env_parse(&lookup, "ROLLCALL_DEGRADED_AFTER"),
        };
        self.apply(file);
    }

    fn validate(&self) -> anyhow::Result<()> {
        let d = &self.decision;
        anyhow::ensure!(d.match_threshold.is_finite() && d.match_threshold >= 0.0, "match_threshold must be a non-negative number");
        anyhow::ensure!(d.confirm_run >= 1, "confirm_run must be at least 1");
        anyhow::ensure!(d.holdout_run >= 1, "holdout_run must be at least 1");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.min_detection_confidence),
            "min_detection_confidence must be within [0, 1]"
        );
        anyhow::ensure!((0.0..=1.0).contains(&self.nms_threshold), "nms_threshold must be within [0, 1]");
        anyhow::ensure!(self.worker_count >= 1, "worker_count must be at least 1");
        anyhow::ensure!(self.queue_depth >= 1, "queue_depth must be at least 1");
        anyhow::ensure!(self.max_references >= 1, "max_references must be at least 1");
        Ok(())
    }

    pub fn gallery_config(&self) -> GalleryConfig {
        GalleryConfig {
            max_references: self.max_references,
            metric: self.metric,
            dimension: Some(rollcall_core::extractor::ARCFACE_EMBEDDING_DIM),
        }
    }

    /// Read the model manifest, enforcing checksums unless opted out.
    pub fn model_manifest(&self) -> Result<ModelManifest, ModelError> {
        if self.allow_unverified_models {
            ModelManifest::load_unverified(&self.model_dir)
        } else {
            ModelManifest::load(&self.model_dir)
        }
    }

    pub fn locator_config(&self) -> LocatorConfig {
        LocatorConfig {
            nms_threshold: self.nms_threshold,
            ..LocatorConfig::default()
        }
    }

    /// Log the effective thresholds once at startup.
    pub fn log_summary(&self) {
        tracing::info!(
            match_threshold = self.decision.match_threshold,
            confirm_run = self.decision.confirm_run,
            holdout_run = self.decision.holdout_run,
            track_timeout_ms = self.decision.track_timeout_ms,
            metric = %self.metric,
            workers = self.worker_count,
            queue_depth = self.queue_depth,
            "decision thresholds"
        );
        if !self.threshold_configured {
            tracing::warn!(
                "match_threshold not configured; the built-in default is uncalibrated, set ROLLCALL_MATCH_THRESHOLD after testing against real footage"
            );
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
