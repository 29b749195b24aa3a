//! Analyzer configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalyzerConfig {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Timeout applied to each control transfer, in milliseconds.
    pub transfer_timeout_ms: u64,
    /// Device to use when a command doesn't name one, as "VID:PID" hex.
    #[serde(default)]
    pub default_device: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: 5000,
            default_device: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Interrupt in endpoint address.
    pub endpoint: u8,
    /// Per-read buffer size for the interrupt stream.
    pub buffer_size: usize,
    /// Default capacity for read transfers.
    pub read_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            endpoint: 0x83,
            buffer_size: 256,
            read_capacity: 2024,
        }
    }
}

impl AnalyzerConfig {
    /// Load configuration from the specified path, or the default path.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => {
                let p = Self::default_path();
                if !p.exists() {
                    return Err(anyhow!("no configuration file at {}", p.display()));
                }
                p
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;

        let config: AnalyzerConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::debug!("loaded configuration from {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if no file is found.
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Logging may not be initialized yet.
                eprintln!("config: {e}, using defaults");
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        tracing::info!("saved configuration to {}", path.display());
        Ok(())
    }

    /// Default configuration file path.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-analyzer").join("config.toml")
        } else {
            PathBuf::from(".config/usb-analyzer/config.toml")
        }
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.session.transfer_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log.level.as_str()) {
            return Err(anyhow!(
                "invalid log level '{}', must be one of: {}",
                self.log.level,
                valid_levels.join(", ")
            ));
        }

        if self.session.transfer_timeout_ms == 0 {
            return Err(anyhow!("transfer_timeout_ms must be non-zero"));
        }
        if self.stream.buffer_size == 0 {
            return Err(anyhow!("stream buffer_size must be non-zero"));
        }

        Ok(())
    }
}
