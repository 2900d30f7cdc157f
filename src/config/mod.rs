//! Configuration management for yocto-sync
//!
//! Handles loading, parsing, and hot-reloading of YAML configuration files.
//! Every field has a default, so an empty or missing file is a valid config.

pub mod watcher;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

pub use watcher::ConfigWatcher;

use crate::device::DEFAULT_DEVICE_PATTERNS;
use crate::engine::{EngineSettings, LivenessTiming, SyncTiming};

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Port matching
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Case-insensitive substrings identifying the device ports
    #[serde(default = "default_name_patterns")]
    pub name_patterns: Vec<String>,
    /// MIDI client name shown to the OS
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Auxiliary inputs whose name contains one of these start active
    #[serde(default)]
    pub auto_activate: Vec<String>,
}

/// Outgoing delivery timing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,
}

/// Heartbeat and disconnect detection
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LivenessConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_probe_after_ticks")]
    pub probe_after_ticks: u32,
    #[serde(default = "default_disconnect_after_ticks")]
    pub disconnect_after_ticks: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter used when neither RUST_LOG nor --log-level is given
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write a daily rolling log file to the logs directory
    #[serde(default)]
    pub file: bool,
    /// Write the log file as JSON lines
    #[serde(default)]
    pub json: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name_patterns: default_name_patterns(),
            client_name: default_client_name(),
            auto_activate: Vec::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            grace_ms: default_grace_ms(),
            probe_after_ticks: default_probe_after_ticks(),
            disconnect_after_ticks: default_disconnect_after_ticks(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: false,
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    ///
    /// A missing file yields the defaults.
    pub async fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = if contents.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path))?
        };

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file, creating parent directories
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.device.name_patterns.iter().all(|p| p.trim().is_empty()) {
            anyhow::bail!("device.name_patterns must contain at least one non-empty pattern");
        }
        if self.device.client_name.is_empty() {
            anyhow::bail!("device.client_name cannot be empty");
        }

        if self.sync.max_attempts == 0 {
            anyhow::bail!("sync.max_attempts must be at least 1");
        }
        if self.sync.ack_timeout_ms == 0 {
            anyhow::bail!("sync.ack_timeout_ms must be greater than 0");
        }

        if self.liveness.tick_ms == 0 {
            anyhow::bail!("liveness.tick_ms must be greater than 0");
        }
        if self.liveness.probe_after_ticks >= self.liveness.disconnect_after_ticks {
            anyhow::bail!(
                "liveness.probe_after_ticks ({}) must be less than disconnect_after_ticks ({})",
                self.liveness.probe_after_ticks,
                self.liveness.disconnect_after_ticks
            );
        }

        Ok(())
    }

    /// Engine parameters derived from this config
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            sync: SyncTiming {
                debounce: Duration::from_millis(self.sync.debounce_ms),
                ack_timeout: Duration::from_millis(self.sync.ack_timeout_ms),
                max_attempts: self.sync.max_attempts,
            },
            liveness: LivenessTiming {
                tick: Duration::from_millis(self.liveness.tick_ms),
                grace: Duration::from_millis(self.liveness.grace_ms),
                probe_after_ticks: self.liveness.probe_after_ticks,
                disconnect_after_ticks: self.liveness.disconnect_after_ticks,
            },
            device_patterns: self
                .device
                .name_patterns
                .iter()
                .filter(|p| !p.trim().is_empty())
                .cloned()
                .collect(),
            auto_activate: self.device.auto_activate.clone(),
        }
    }
}

// Default value functions
fn default_name_patterns() -> Vec<String> {
    DEFAULT_DEVICE_PATTERNS.iter().map(|s| s.to_string()).collect()
}
fn default_client_name() -> String { "yocto-sync".to_string() }
fn default_debounce_ms() -> u64 { 300 }
fn default_ack_timeout_ms() -> u64 { 200 }
fn default_max_attempts() -> u8 { 3 }
fn default_tick_ms() -> u64 { 317 }
fn default_grace_ms() -> u64 { 2000 }
fn default_probe_after_ticks() -> u32 { 2 }
fn default_disconnect_after_ticks() -> u32 { 4 }
fn default_log_level() -> String { "info".to_string() }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_engine_defaults() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine_settings(), EngineSettings::default());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
device:
  auto_activate: ["keystep"]
sync:
  debounce_ms: 150
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sync.debounce_ms, 150);
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.device.name_patterns.len(), 3);
        assert_eq!(config.liveness.tick_ms, 317);
        assert_eq!(
            config.engine_settings().sync.debounce,
            Duration::from_millis(150)
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.sync.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.liveness.probe_after_ticks = 4;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.device.name_patterns = vec!["  ".to_string()];
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_default() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("absent.yaml");
        let config = AppConfig::load(&path.to_string_lossy()).await?;
        assert_eq!(config, AppConfig::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_save_then_load() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested").join("config.yaml");
        let path = path.to_string_lossy().to_string();

        let mut config = AppConfig::default();
        config.device.auto_activate = vec!["pads".to_string()];
        config.save(&path).await?;

        assert_eq!(AppConfig::load(&path).await?, config);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "liveness:\n  probe_after_ticks: 9\n")?;
        assert!(AppConfig::load(&path.to_string_lossy()).await.is_err());
        Ok(())
    }
}
