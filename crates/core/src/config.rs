//! TOML configuration and data-directory layout.
//!
//! Everything defaults: a missing or empty `config.toml` behaves exactly
//! like a fully spelled-out default one, and partial files only override
//! the keys they mention.

use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::DEFAULT_ENGINE;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TEMPRA_DATA_DIR";
const DEFAULT_DATA_DIR: &str = "data";

pub const DEFAULT_MODEL: &str = "tempra-tss-fp32";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub upscaler: UpscalerConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpscalerConfig {
    pub enabled: bool,
    /// 0 disables the visualizer; 1 header plus recurrent-state tiles,
    /// 2 full grid, 3+n single tile n.
    pub debug_level: u8,
    pub engine: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub captures_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_files: usize,
}

impl Default for UpscalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug_level: 0,
            engine: DEFAULT_ENGINE.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            captures_dir: PathBuf::from("captures"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_files: crate::logging::DEFAULT_LOG_RETENTION,
        }
    }
}

impl AppConfig {
    /// Reads a config file; absent and blank files both mean defaults, a
    /// present-but-broken file is an error rather than a silent reset.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("read config file {}", path.display()))
            }
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create config directory {}", parent.display()))?;
        }
        let rendered = toml::to_string_pretty(self).context("serialize config")?;
        fs::write(path, rendered)
            .with_context(|| format!("write config file {}", path.display()))
    }
}

/// The data directory, by falling priority: the CLI override, the
/// `TEMPRA_DATA_DIR` environment variable, `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    cli_override
        .map(Path::to_path_buf)
        .or_else(|| env::var_os(ENV_DATA_DIR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// First-run setup: the directory is created and a default `config.toml`
/// written, but a config the operator already edited is left alone.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("create data directory {}", data_dir.display()))?;
    let config_file = config_path(data_dir);
    if !config_file.exists() {
        AppConfig::default().save_to_path(&config_file)?;
    }
    Ok(())
}

/// Absolute paths pass through; relative ones are anchored at `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
