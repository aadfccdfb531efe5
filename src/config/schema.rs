use crate::error::{PresetError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct RegistryConfig {
    /// URL or local path of the registry document
    pub source: Option<String>,
    /// Defaults to `$XDG_CACHE_HOME/preset-fetch/registry.json`
    pub cache_path: Option<PathBuf>,
    #[serde(default = "default_registry_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_hub_endpoint")]
    pub hub_endpoint: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DownloadConfig {
    #[serde(default = "default_target_root")]
    pub target_root: PathBuf,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default)]
    pub verify_existing: bool,
    #[serde(default = "default_lease_wait_secs")]
    pub lease_wait_secs: u64,
    #[serde(default = "default_min_free_mb")]
    pub min_free_mb: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SelectionConfig {
    /// Environment variable holding the comma-separated preset list
    #[serde(default = "default_selection_env")]
    pub env: String,
    #[serde(default)]
    pub presets: Vec<String>,
}

// Default value functions
fn default_registry_timeout_secs() -> u64 {
    30
}
fn default_hub_endpoint() -> String {
    "https://huggingface.co".to_string()
}
fn default_target_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("preset-fetch/models")
}
fn default_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_read_timeout_secs() -> u64 {
    120
}
fn default_lease_wait_secs() -> u64 {
    30
}
fn default_min_free_mb() -> u64 {
    100
}
fn default_selection_env() -> String {
    "PRESET_DOWNLOAD".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            source: None,
            cache_path: None,
            timeout_secs: default_registry_timeout_secs(),
            hub_endpoint: default_hub_endpoint(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            target_root: default_target_root(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            verify_existing: false,
            lease_wait_secs: default_lease_wait_secs(),
            min_free_mb: default_min_free_mb(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            env: default_selection_env(),
            presets: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// Cache path, falling back to the user cache directory
    pub fn resolved_cache_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.cache_path {
            return Ok(path.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| PresetError::Config("Cannot determine cache directory".to_string()))?;
        Ok(cache_dir.join("preset-fetch/registry.json"))
    }
}

impl Config {
    /// Load from the default config path, falling back to defaults
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PresetError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            PresetError::Config(format!("Failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// `PRESET_FETCH_REGISTRY` and `PRESET_FETCH_TARGET` override the file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(source) = std::env::var("PRESET_FETCH_REGISTRY") {
            if !source.trim().is_empty() {
                self.registry.source = Some(source);
            }
        }
        if let Ok(target) = std::env::var("PRESET_FETCH_TARGET") {
            if !target.trim().is_empty() {
                self.download.target_root = PathBuf::from(target);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.download.concurrency == 0 {
            return Err(PresetError::Config(
                "download.concurrency must be at least 1".to_string(),
            ));
        }
        if self.download.max_attempts == 0 {
            return Err(PresetError::Config(
                "download.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.download.backoff_max_ms < self.download.backoff_base_ms {
            return Err(PresetError::Config(
                "download.backoff_max_ms must not be below backoff_base_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Preset ids from the selection variable, else from the config file
    #[must_use]
    pub fn selection(&self) -> Vec<String> {
        match std::env::var(&self.selection.env) {
            Ok(value) if !value.trim().is_empty() => crate::resolver::parse_selection(&value),
            _ => self.selection.presets.clone(),
        }
    }
}

/// Get config path
pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| PresetError::Config("Cannot determine config directory".to_string()))?;
    Ok(config_dir.join("preset-fetch/config.toml"))
}
