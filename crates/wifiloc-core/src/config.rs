//! Application configuration management.
//!
//! This module handles loading and saving the configuration: tuning
//! constants for staleness, batching and pacing, plus where the resolver
//! and the cache live.
//!
//! Configuration is stored at `~/.config/wifiloc/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::estimator::DEFAULT_STALE_DAYS;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "wifiloc";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default number of identifiers per resolver request
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default pause between refresh batches in seconds
pub const DEFAULT_WAIT_INTERVAL_SECS: u64 = 30;

/// Upper bound for the stale window, a century
pub const MAX_STALE_WINDOW_DAYS: i64 = 36_500;

/// Environment override for the resolver endpoint
pub const ENV_RESOLVER_URL: &str = "WIFILOC_RESOLVER_URL";

/// Environment override for the cache directory
pub const ENV_CACHE_DIR: &str = "WIFILOC_CACHE_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stale_window_days: i64,
    pub batch_size: usize,
    pub wait_interval_secs: u64,
    pub resolver_url: Option<String>,
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stale_window_days: DEFAULT_STALE_DAYS,
            batch_size: DEFAULT_BATCH_SIZE,
            wait_interval_secs: DEFAULT_WAIT_INTERVAL_SECS,
            resolver_url: None,
            cache_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_RESOLVER_URL).filter(|v| !v.is_empty()) {
            self.resolver_url = Some(url);
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.stale_window_days <= 0 {
            bail!("stale_window_days must be positive");
        }
        if self.stale_window_days > MAX_STALE_WINDOW_DAYS {
            bail!("stale_window_days must be at most {}", MAX_STALE_WINDOW_DAYS);
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn stale_window(&self) -> chrono::Duration {
        // Clamped so an unvalidated config cannot overflow chrono
        chrono::Duration::days(self.stale_window_days.clamp(1, MAX_STALE_WINDOW_DAYS))
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_interval_secs)
    }
}
