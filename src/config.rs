use anyhow::{Context, Result};
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AuthError;

static PROJECT_DIRS: Lazy<Option<ProjectDirs>> =
    Lazy::new(|| ProjectDirs::from("", "", "facegate"));

pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    if let Some(path) = std::env::var_os("FACEGATE_CONFIG") {
        return PathBuf::from(path);
    }
    match PROJECT_DIRS.as_ref() {
        Some(dirs) => dirs.config_dir().join("config.toml"),
        None => PathBuf::from("facegate.toml"),
    }
});

pub static DATA_DIR: Lazy<PathBuf> = Lazy::new(|| {
    if let Some(path) = std::env::var_os("FACEGATE_DATA_DIR") {
        return PathBuf::from(path);
    }
    match PROJECT_DIRS.as_ref() {
        Some(dirs) => dirs.data_dir().to_path_buf(),
        None => PathBuf::from("."),
    }
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum Euclidean distance accepted as a match
    pub threshold: f32,
    pub liveness_min_confidence: f32,
    pub liveness_timeout_ms: u64,
    pub key_file: PathBuf,
    pub store_file: PathBuf,
    pub audit_log: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            liveness_min_confidence: 0.5,
            liveness_timeout_ms: 2000,
            key_file: DATA_DIR.join("encryption_key.key"),
            store_file: DATA_DIR.join("face_data.enc"),
            audit_log: DATA_DIR.join("face_auth.log"),
        }
    }
}

impl Config {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn validate(&self, path: &Path) -> Result<(), AuthError> {
        let invalid = |message: String| AuthError::Config {
            path: path.to_path_buf(),
            message,
        };
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(invalid(format!(
                "threshold must be a non-negative number, got {}",
                self.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.liveness_min_confidence) {
            return Err(invalid(format!(
                "liveness_min_confidence must be within [0, 1], got {}",
                self.liveness_min_confidence
            )));
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(CONFIG_PATH.as_path());
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate(path)?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(CONFIG_PATH.as_path());
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
