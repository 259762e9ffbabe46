use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ids::Email;

/// Device configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Account email this device belongs to.
    pub account: String,

    /// Base URL of the hosted store (HTTPS).
    pub store_url: String,

    /// The one identity allowed to modify the card whitelist.
    pub operator: String,

    /// Polling intervals.
    #[serde(default)]
    pub poll: PollSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollSettings {
    /// Schedule-poll period in seconds; drives lock transitions.
    #[serde(default = "default_schedule_poll")]
    pub schedule_poll_secs: u64,

    /// Display tick period in seconds; recomputes countdowns only.
    #[serde(default = "default_tick")]
    pub tick_secs: u64,

    /// Extra random jitter added to each poll, in seconds.
    #[serde(default)]
    pub jitter_secs: u64,
}

fn default_schedule_poll() -> u64 {
    5
}

fn default_tick() -> u64 {
    60
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            schedule_poll_secs: default_schedule_poll(),
            tick_secs: default_tick(),
            jitter_secs: 0,
        }
    }
}

/// Get the per-user config file path.
pub fn get_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "taplock", "taplock")
        .context("Failed to determine config directory")?;
    Ok(dirs.config_dir().join("config.yaml"))
}

/// Load configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: AppConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML config file: {}", path.display()))?;

    validate_config(&config)?;

    Ok(config)
}

/// Save configuration to a YAML file.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    validate_config(config)?;

    let content = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    crate::fsutil::atomic_write(path, content.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    Ok(())
}

/// Validate configuration.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    Email::parse(&config.account)
        .with_context(|| format!("Invalid account email: {}", config.account))?;
    Email::parse(&config.operator)
        .with_context(|| format!("Invalid operator email: {}", config.operator))?;

    let url = url::Url::parse(&config.store_url).context("Invalid store URL")?;
    if url.scheme() != "https" {
        anyhow::bail!("Store URL must use HTTPS (got: {})", url.scheme());
    }

    if config.poll.schedule_poll_secs == 0 {
        anyhow::bail!("schedule_poll_secs must be greater than zero");
    }
    if config.poll.tick_secs == 0 {
        anyhow::bail!("tick_secs must be greater than zero");
    }

    Ok(())
}
