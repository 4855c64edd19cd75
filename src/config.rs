use anyhow::{Context, Result, anyhow};
use directories::UserDirs;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::keypoint::TrackedRegion;
use crate::transport::TransportConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("remote.host must not be empty")]
    EmptyHost,
    #[error("remote.port must be non-zero")]
    ZeroPort,
    #[error("capture.fps must be positive")]
    ZeroFps,
    #[error("pose.samples must be at least 1")]
    ZeroSamples,
    #[error("pose.input_size must be positive")]
    ZeroInputSize,
    #[error("pose.score_threshold must be in (0, 1), got {0}")]
    ScoreThreshold(f32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub retry_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 12347,
            connect_timeout_ms: 100,
            retry_ms: 100,
        }
    }
}

impl RemoteConfig {
    pub fn transport(&self) -> TransportConfig {
        let mut t = TransportConfig::new(self.host.clone(), self.port);
        t.connect_timeout = Duration::from_millis(self.connect_timeout_ms.max(1));
        t.retry = Duration::from_millis(self.retry_ms);
        t
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub camera: u32,
    /// Camera index `n` replays `recordings[n]`.
    pub recordings: Vec<PathBuf>,
    pub fps: u32,
    pub autostart: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            camera: 0,
            recordings: Vec::new(),
            fps: 30,
            autostart: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseSettings {
    pub samples: usize,
    pub input_size: u32,
    pub score_threshold: f32,
    pub region: Option<TrackedRegion>,
}

impl Default for PoseSettings {
    fn default() -> Self {
        Self {
            samples: 3,
            input_size: 192,
            score_threshold: 0.5,
            region: Some(TrackedRegion::Head),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub capture: CaptureSettings,
    pub pose: PoseSettings,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub camera: Option<u32>,
    pub samples: Option<usize>,
    pub region: Option<TrackedRegion>,
}

impl Overrides {
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(h) = &self.host {
            cfg.remote.host = h.clone();
        }
        if let Some(p) = self.port {
            cfg.remote.port = p;
        }
        if let Some(c) = self.camera {
            cfg.capture.camera = c;
        }
        if let Some(k) = self.samples {
            cfg.pose.samples = k;
        }
        if let Some(r) = self.region {
            cfg.pose.region = Some(r);
        }
    }
}

pub fn config_dir() -> Result<PathBuf> {
    let dirs = UserDirs::new().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(dirs.home_dir().join(".config").join("posectl"))
}

fn default_config_text() -> &'static str {
    include_str!("../config/default.toml")
}

/// Read the config (installing the default on first run), apply `overrides`,
/// and validate the result.
pub fn load(overrides: &Overrides) -> Result<(Config, PathBuf)> {
    let path = match &overrides.config {
        Some(p) => p.clone(),
        None => {
            let dir = config_dir()?;
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            let p = dir.join("config.toml");
            if !p.exists() {
                fs::write(&p, default_config_text())?;
                info!("installed default config at {}", p.display());
            }
            p
        }
    };

    let txt = fs::read_to_string(&path)
        .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
    let mut cfg: Config =
        toml::from_str(&txt).map_err(|e| anyhow!("failed to parse {}: {e}", path.display()))?;
    overrides.apply(&mut cfg);
    if let Some(base) = path.parent() {
        resolve_recordings(&mut cfg, base);
    }
    validate_config(&cfg).with_context(|| format!("invalid config {}", path.display()))?;
    Ok((cfg, path))
}

fn resolve_recordings(cfg: &mut Config, base: &Path) {
    for r in cfg.capture.recordings.iter_mut() {
        if r.is_relative() {
            *r = base.join(&*r);
        }
    }
}

pub fn validate_config(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.remote.host.trim().is_empty() {
        return Err(ConfigError::EmptyHost);
    }
    if cfg.remote.port == 0 {
        return Err(ConfigError::ZeroPort);
    }
    if cfg.capture.fps == 0 {
        return Err(ConfigError::ZeroFps);
    }
    if cfg.pose.samples == 0 {
        return Err(ConfigError::ZeroSamples);
    }
    if cfg.pose.input_size == 0 {
        return Err(ConfigError::ZeroInputSize);
    }
    let t = cfg.pose.score_threshold;
    if !(t > 0.0 && t < 1.0) {
        return Err(ConfigError::ScoreThreshold(t));
    }
    Ok(())
}
