use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::upscale::{ExecutionProvider, RuntimeApi, Upscaler, DEFAULT_TILE_THRESHOLD};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "INKSCALE_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub upscaler: UpscalerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpscalerConfig {
    pub execution_provider: ExecutionProvider,
    pub device_id: i32,
    /// Model file, relative to `paths.models_dir` unless absolute.
    pub model: Option<PathBuf>,
    /// Tile edge in pixels; 0 disables tiling.
    pub tile_size: u32,
    /// Pixel count above which tiling kicks in.
    pub tile_threshold: u64,
    pub crop_padding: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for UpscalerConfig {
    fn default() -> Self {
        Self {
            execution_provider: ExecutionProvider::Cpu,
            device_id: 0,
            model: None,
            tile_size: 0,
            tile_threshold: DEFAULT_TILE_THRESHOLD,
            crop_padding: false,
        }
    }
}

impl UpscalerConfig {
    /// Push these settings into `upscaler`. Values equal to the current ones
    /// leave the live session untouched.
    pub fn apply<R: RuntimeApi>(&self, upscaler: &Upscaler<R>, models_dir: &Path) {
        upscaler.set_execution_provider(self.execution_provider, self.device_id);
        if let Some(model) = &self.model {
            upscaler.set_model_path(resolve_relative_to(models_dir, model));
        }
        upscaler.set_tile_size(self.tile_size);
        upscaler.set_tile_threshold(self.tile_threshold);
        upscaler.set_crop_padding(self.crop_padding);
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn models_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.models_dir)
    }

    pub fn trt_cache_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.trt_cache_dir)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. INKSCALE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` and a default `config.toml` on first run. An existing
/// config file is never overwritten.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` unchanged if absolute, otherwise joined onto `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
