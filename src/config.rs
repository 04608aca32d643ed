use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("DOORFACE_CONFIG_PATH").unwrap_or("/usr/local/etc/doorface/config.toml"))
});

pub static FACE_STORE_DIR: Lazy<&'static Path> =
    Lazy::new(|| Path::new(option_env!("DOORFACE_FACE_STORE_DIR").unwrap_or("faces")));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_dir: PathBuf,
    pub camera: String,
    pub detector_model: PathBuf,
    pub detector_score_threshold: f32,
    pub nms_threshold: f32,
    /// Classifier distance below which a face counts as a match.
    pub match_threshold: f64,
    pub decision_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub frame_interval_ms: u64,
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    Gpio,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub backend: LockBackend,
    pub pin: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: FACE_STORE_DIR.to_path_buf(),
            camera: "/dev/video0".to_string(),
            detector_model: PathBuf::from(
                "/usr/local/share/doorface/face_detection_yunet_2023mar.onnx",
            ),
            detector_score_threshold: 0.6,
            nms_threshold: 0.3,
            match_threshold: 70.0,
            decision_timeout_ms: 5000,
            grace_period_ms: 5000,
            frame_interval_ms: 30,
            lock: LockConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Simulated,
            pin: 18,
        }
    }
}

impl Config {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
