//! Companion CLI configuration
//!
//! Settings are layered with figment, lowest priority first:
//! - built-in defaults
//! - the user config file (`<config dir>/companion/config.toml`)
//! - `companion.toml` in the working directory, or the file given with `--config`
//! - `COMPANION_*` environment variables (`COMPANION_LINK__DEVICE_NAME=Desk`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use companion_ble::LinkConfig;

const CONFIG_FILE: &str = "companion.toml";
const SETTINGS_FILE: &str = "settings.json";

// ----------------------------------------------------------------------------
// CLI Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the companion CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Where the pairing record is kept; defaults to the platform data dir
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Link behavior
    pub link: LinkSettings,
}

/// Link settings in file-friendly units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    pub device_name: String,
    pub scan_timeout_secs: u64,
    pub connection_timeout_secs: u64,
    pub requested_mtu: u16,
    pub chunk_delay_ms: u64,
    pub auto_reconnect: bool,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_attempts: u32,
    pub pairing_timeout_secs: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        let defaults = LinkConfig::default();
        Self {
            device_name: default_device_name(),
            scan_timeout_secs: defaults.scan_timeout.as_secs(),
            connection_timeout_secs: defaults.connection_timeout.as_secs(),
            requested_mtu: defaults.requested_mtu,
            chunk_delay_ms: defaults.chunk_delay.as_millis() as u64,
            auto_reconnect: defaults.auto_reconnect,
            reconnect_delay_secs: defaults.reconnect_delay.as_secs(),
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            pairing_timeout_secs: defaults.pairing_timeout.as_secs(),
        }
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "Companion Desktop".to_string())
}

// ----------------------------------------------------------------------------
// Configuration Loading
// ----------------------------------------------------------------------------

impl CliConfig {
    /// Load with the standard priority order; `path` replaces `companion.toml`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));

        if let Some(user_config) = Self::user_config_path() {
            figment = figment.merge(Toml::file(user_config));
        }
        figment = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::Loading(format!(
                        "Configuration file {} does not exist",
                        path.display()
                    )));
                }
                figment.merge(Toml::file(path))
            }
            None => figment.merge(Toml::file(CONFIG_FILE)),
        };
        figment = figment.merge(Env::prefixed("COMPANION_").split("__"));

        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: CliConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/companion/config.toml`
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("companion").join("config.toml"))
    }

    /// Directory for the pairing record
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join("companion"))
                .ok_or_else(|| ConfigError::Environment("No data directory for this platform".to_string())),
        }
    }

    pub fn settings_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join(SETTINGS_FILE))
    }

    /// Link configuration for the library
    pub fn link_config(&self) -> LinkConfig {
        let link = &self.link;
        LinkConfig::new()
            .with_device_name(link.device_name.clone())
            .with_scan_timeout(Duration::from_secs(link.scan_timeout_secs))
            .with_connection_timeout(Duration::from_secs(link.connection_timeout_secs))
            .with_requested_mtu(link.requested_mtu)
            .with_chunk_delay(Duration::from_millis(link.chunk_delay_ms))
            .with_auto_reconnect(link.auto_reconnect)
            .with_reconnect_policy(
                Duration::from_secs(link.reconnect_delay_secs),
                link.max_reconnect_attempts,
            )
            .with_pairing_timeout(Duration::from_secs(link.pairing_timeout_secs))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link_config()
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| "# Failed to generate example config".to_string())
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Loading(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment error: {0}")]
    Environment(String),
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CliConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.link.max_reconnect_attempts, 3);
        assert_eq!(config.link.pairing_timeout_secs, 30);
        assert_eq!(config.link_config().scan_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companion.toml");
        std::fs::write(
            &path,
            "data_dir = \"/tmp/companion\"\n[link]\ndevice_name = \"Desk\"\nmax_reconnect_attempts = 5\n",
        )
        .unwrap();

        let figment = Figment::new()
            .merge(Serialized::defaults(CliConfig::default()))
            .merge(Toml::file(&path));
        let config = CliConfig::extract(figment).unwrap();

        assert_eq!(config.link.device_name, "Desk");
        assert_eq!(config.link.max_reconnect_attempts, 5);
        assert_eq!(config.link.scan_timeout_secs, 10);
        assert_eq!(
            config.settings_path().unwrap(),
            PathBuf::from("/tmp/companion/settings.json")
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = CliConfig::default();
        config.link.device_name = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = CliConfig::default();
        config.link.pairing_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = CliConfig::load(Some(Path::new("/nonexistent/companion.toml")));
        assert!(matches!(result, Err(ConfigError::Loading(_))));
    }

    #[test]
    fn test_example_config_generation() {
        let example = CliConfig::example_config();
        assert!(example.contains("[link]"));
        assert!(example.contains("device_name"));
    }
}
