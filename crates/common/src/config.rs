//! USB redirection channel configuration

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application directory under the platform config dir
const APP_DIR: &str = "p2p-usb";

/// Configuration file name
const CONFIG_FILENAME: &str = "usbredir.toml";

/// System-wide configuration fallback
const SYSTEM_CONFIG_PATH: &str = "/etc/p2p-usb/usbredir.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedirConfig {
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default)]
    pub events: EventSettings,
    #[serde(default)]
    pub access: AccessSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Identification string handed to the redirection host
    #[serde(default = "default_host_name")]
    pub host_name: String,
    /// Run the redirection host at debug verbosity instead of warnings only
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// How long one `handle_events` call may block on the pump thread
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessSettings {
    /// Ask the session to release keyboard capture while the OS permission
    /// prompt is up
    #[serde(default = "default_true")]
    pub inhibit_keyboard_grab: bool,
}

fn default_host_name() -> String {
    format!("p2p-usbredir {}", env!("CARGO_PKG_VERSION"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            host_name: default_host_name(),
            debug: false,
            log_level: default_log_level(),
        }
    }
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            inhibit_keyboard_grab: true,
        }
    }
}

impl EventSettings {
    /// Event pump timeout as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl RedirConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path, the per-user file is tried first, then the system one.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from(SYSTEM_CONFIG_PATH)];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: RedirConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "Config: host_name={}, debug={}, poll_interval_ms={}",
            config.channel.host_name,
            config.channel.debug,
            config.events.poll_interval_ms
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Logging is usually not up yet at this point
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join(APP_DIR).join(CONFIG_FILENAME)
        } else {
            PathBuf::from(".config").join(APP_DIR).join(CONFIG_FILENAME)
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.channel.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.channel.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.channel.host_name.trim().is_empty() {
            return Err(anyhow!("channel.host_name must not be empty"));
        }

        if self.events.poll_interval_ms == 0 {
            return Err(anyhow!("events.poll_interval_ms must be greater than zero"));
        }

        Ok(())
    }
}

/// Load a configuration file, expanding a leading `~`
pub fn load_config(path: &str) -> Result<RedirConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    RedirConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RedirConfig::default();
        assert_eq!(config.channel.log_level, "info");
        assert!(config.channel.host_name.starts_with("p2p-usbredir "));
        assert!(!config.channel.debug);
        assert_eq!(config.events.poll_interval(), Duration::from_millis(100));
        assert!(config.access.inhibit_keyboard_grab);
    }

    #[test]
    fn test_config_serialization() {
        let config = RedirConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: RedirConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.channel.host_name, parsed.channel.host_name);
        assert_eq!(config.events.poll_interval_ms, parsed.events.poll_interval_ms);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: RedirConfig = toml::from_str(
            r#"
[channel]
debug = true
"#,
        )
        .unwrap();

        assert!(parsed.channel.debug);
        assert_eq!(parsed.channel.log_level, "info");
        assert_eq!(parsed.events.poll_interval_ms, 100);
        assert!(parsed.access.inhibit_keyboard_grab);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = RedirConfig::default();
        assert!(config.validate().is_ok());

        config.channel.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        config.channel.log_level = "trace".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_poll_interval() {
        let mut config = RedirConfig::default();
        config.events.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[channel]
host_name = "test-host 1.0"
log_level = "debug"

[events]
poll_interval_ms = 25

[access]
inhibit_keyboard_grab = false
"#
        )
        .unwrap();

        let config = RedirConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.channel.host_name, "test-host 1.0");
        assert_eq!(config.channel.log_level, "debug");
        assert_eq!(config.events.poll_interval_ms, 25);
        assert!(!config.access.inhibit_keyboard_grab);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[events]\npoll_interval_ms = 0").unwrap();

        assert!(RedirConfig::load(Some(file.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("usbredir.toml");

        let mut config = RedirConfig::default();
        config.channel.debug = true;
        config.save(&path).unwrap();

        let reloaded = RedirConfig::load(Some(path)).unwrap();
        assert!(reloaded.channel.debug);
    }
}
