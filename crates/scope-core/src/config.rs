//! Server configuration using Figment
//!
//! Configuration is layered, later layers win:
//! 1. Built-in defaults ([`ServerConfig::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `RIGOL_SCOPE_`
//! 4. Command-line overrides ([`ConfigOverrides`])
//!
//! # Example
//! ```no_run
//! use scope_core::config::{ConfigOverrides, ServerConfig};
//!
//! let overrides = ConfigOverrides {
//!     resource: Some("TCPIP::192.168.27.31::5555::SOCKET".into()),
//!     ..Default::default()
//! };
//! let config = ServerConfig::load(None, &overrides)?;
//! println!("PV prefix: {}", config.prefix());
//! # Ok::<(), scope_core::error::ConfigError>(())
//! ```

use crate::error::ConfigError;
use crate::registry::MIN_SLEEP_S;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Highest channel count of the supported RIGOL models.
pub const MAX_CHANNELS: usize = 4;

/// Top-level configuration of one scope server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Device name, the PV prefix is `<device><index>:`.
    pub device: String,
    /// Device index, the PV prefix is `<device><index>:`.
    pub index: String,
    /// Number of scope channels to serve.
    pub channels: usize,
    /// Resource string, e.g. `TCPIP::192.168.27.31::INSTR`.
    pub resource: String,
    /// Instrument I/O timeout in milliseconds.
    pub timeout_ms: u64,
    /// Initial value of the `sleep` PV, seconds between polling cycles.
    pub sleep_s: f64,
    /// Period of the infrequent parameter update, seconds.
    pub periodic_update_s: f64,
    /// Consecutive timeouts tolerated before the server exits.
    pub error_count_limit: u32,
    /// Listen address of the PV gateway.
    pub listen: String,
    /// Log verbosity: 0 info, 1 debug, 2+ trace.
    pub verbose: u8,
    /// Serve a simulated scope instead of connecting to the resource.
    pub mock: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            device: "rigol".to_string(),
            index: "0".to_string(),
            channels: MAX_CHANNELS,
            resource: "TCPIP::192.168.27.31::INSTR".to_string(),
            timeout_ms: 2000,
            sleep_s: 0.1,
            periodic_update_s: 1.0,
            error_count_limit: 2,
            listen: "0.0.0.0:5064".to_string(),
            verbose: 0,
            mock: false,
        }
    }
}

/// Command-line values that override every other layer when present.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    /// See [`ServerConfig::device`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// See [`ServerConfig::index`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// See [`ServerConfig::channels`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<usize>,
    /// See [`ServerConfig::resource`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// See [`ServerConfig::listen`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    /// See [`ServerConfig::verbose`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<u8>,
    /// See [`ServerConfig::mock`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mock: Option<bool>,
}

impl ServerConfig {
    /// Build the layered figment without extracting it.
    pub fn figment(path: Option<&Path>, overrides: &ConfigOverrides) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("RIGOL_SCOPE_"))
            .merge(Serialized::defaults(overrides))
    }

    /// Load and validate the configuration.
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let config: ServerConfig = Self::figment(path, overrides).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.is_empty() {
            return Err(ConfigError::Validation("device name must not be empty".into()));
        }
        if !(1..=MAX_CHANNELS).contains(&self.channels) {
            return Err(ConfigError::Validation(format!(
                "channels must be 1..={}, got {}",
                MAX_CHANNELS, self.channels
            )));
        }
        if self.resource.trim().is_empty() {
            return Err(ConfigError::Validation("resource must not be empty".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation("timeout_ms must be positive".into()));
        }
        if !(self.sleep_s.is_finite() && self.sleep_s >= MIN_SLEEP_S) {
            return Err(ConfigError::Validation(format!(
                "sleep_s must be at least {}, got {}",
                MIN_SLEEP_S, self.sleep_s
            )));
        }
        if !(self.periodic_update_s.is_finite() && self.periodic_update_s > 0.0) {
            return Err(ConfigError::Validation(format!(
                "periodic_update_s must be positive, got {}",
                self.periodic_update_s
            )));
        }
        if self.error_count_limit == 0 {
            return Err(ConfigError::Validation("error_count_limit must be at least 1".into()));
        }
        Ok(())
    }

    /// PV prefix, `<device><index>:`.
    pub fn prefix(&self) -> String {
        format!("{}{}:", self.device, self.index)
    }

    /// Instrument I/O timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Period of the infrequent parameter update.
    pub fn periodic_update(&self) -> Duration {
        Duration::from_secs_f64(self.periodic_update_s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.prefix(), "rigol0:");
        assert_eq!(config.timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn test_toml_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "device = \"scope\"\nindex = \"3\"\nchannels = 2\nsleep_s = 0.5"
        )
        .unwrap();

        let overrides = ConfigOverrides {
            channels: Some(1),
            ..Default::default()
        };
        let config = ServerConfig::figment(Some(file.path()), &overrides)
            .extract::<ServerConfig>()
            .unwrap();
        assert_eq!(config.prefix(), "scope3:");
        assert_eq!(config.channels, 1);
        assert_eq!(config.sleep_s, 0.5);
        assert_eq!(config.timeout_ms, 2000);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = ServerConfig {
            channels: 5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let config = ServerConfig {
            sleep_s: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            resource: "  ".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_load_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "channels = \"many\"").unwrap();
        let err = ServerConfig::load(Some(file.path()), &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
