//! Configuration types for the HSM broker.
//!
//! Configuration is loaded from YAML files and validated before use.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Device endpoint.
    pub device: DeviceConfig,

    /// Connection pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Request broker settings.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Key material for PIN commands. Only needed by `verify-pin`.
    #[serde(default)]
    pub keys: Option<KeysConfig>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Device address, e.g. "10.0.0.5:1500".
    pub address: String,

    /// TCP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Maximum number of simultaneous device connections.
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
}

/// Broker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Number of worker tasks draining the request queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-request deadline in milliseconds, covering queueing and the
    /// device round trip.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Keys used by the PIN command layer.
///
/// Values support environment variable expansion: "${HSM_TPK}".
#[derive(Clone, Deserialize, Serialize)]
pub struct KeysConfig {
    /// Terminal PIN key, encrypted under the LMK.
    pub tpk: String,

    /// PIN verification key, encrypted under the LMK.
    pub pvk: String,
}

impl KeysConfig {
    /// Get the TPK with environment variables expanded.
    #[must_use]
    pub fn tpk(&self) -> String {
        expand_env_vars(&self.tpk)
    }

    /// Get the PVK with environment variables expanded.
    #[must_use]
    pub fn pvk(&self) -> String {
        expand_env_vars(&self.pvk)
    }
}

impl std::fmt::Debug for KeysConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysConfig")
            .field("tpk", &"<redacted>")
            .field("pvk", &"<redacted>")
            .finish()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    static VAR: OnceLock<Regex> = OnceLock::new();
    let re = VAR.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex")
    });
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

// Default value functions

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_pool_capacity() -> usize {
    2
}

fn default_workers() -> usize {
    2
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_pool_capacity(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DeviceConfig {
    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check that the address looks like `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] otherwise.
    pub fn validate(&self) -> ConfigResult<()> {
        let valid = self
            .address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid {
            return Err(ConfigError::InvalidAddress(self.address.clone()));
        }
        Ok(())
    }
}

impl BrokerConfig {
    /// Request deadline as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration for `address` with every other value defaulted.
    #[must_use]
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            device: DeviceConfig {
                address: address.into(),
                connect_timeout_ms: default_connect_timeout_ms(),
            },
            pool: PoolConfig::default(),
            broker: BrokerConfig::default(),
            keys: None,
            logging: LoggingConfig::default(),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> ConfigResult<()> {
        self.device.validate()?;
        if self.pool.capacity == 0 {
            return Err(ConfigError::InvalidPoolCapacity(self.pool.capacity));
        }
        if self.broker.workers == 0 {
            return Err(ConfigError::InvalidWorkerCount(self.broker.workers));
        }
        if self.broker.request_timeout_ms == 0 {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config::for_address("127.0.0.1:1500")
    }

    #[test]
    fn test_valid_config_passes_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_from_yaml_string() {
        let yaml = r#"
device:
  address: "hsm.internal:1500"
  connect_timeout_ms: 2000
pool:
  capacity: 4
broker:
  workers: 8
  request_timeout_ms: 750
logging:
  level: debug
  json: true
"#;

        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.device.address, "hsm.internal:1500");
        assert_eq!(config.device.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.pool.capacity, 4);
        assert_eq!(config.broker.workers, 8);
        assert_eq!(config.broker.request_timeout(), Duration::from_millis(750));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert!(config.keys.is_none());
    }

    #[test]
    fn test_default_values_applied() {
        let yaml = r#"
device:
  address: "127.0.0.1:1500"
"#;

        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.device.connect_timeout_ms, 5_000);
        assert_eq!(config.pool.capacity, 2);
        assert_eq!(config.broker.workers, 2);
        assert_eq!(config.broker.request_timeout_ms, 5_000);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_zero_pool_capacity() {
        let mut config = valid_config();
        config.pool.capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPoolCapacity(0))
        ));
    }

    #[test]
    fn test_zero_workers() {
        let mut config = valid_config();
        config.broker.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWorkerCount(0))
        ));
    }

    #[test]
    fn test_zero_request_timeout() {
        let mut config = valid_config();
        config.broker.request_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroRequestTimeout)
        ));
    }

    #[test]
    fn test_invalid_address() {
        for address in ["localhost", ":1500", "host:notaport", "host:70000"] {
            let config = Config::for_address(address);
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidAddress(_))),
                "{address} should be rejected"
            );
        }
    }

    #[test]
    fn test_missing_device_section() {
        let result = Config::from_str("pool:\n  capacity: 1\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file("/nonexistent/hsm-broker.yaml");
        assert!(matches!(result, Err(ConfigError::IoError { .. })));
    }

    #[test]
    fn test_keys_env_var_expansion() {
        std::env::set_var("TEST_HSM_TPK", "U1234567890ABCDEF1234567890ABCDEF");

        let yaml = r#"
device:
  address: "127.0.0.1:1500"
keys:
  tpk: "${TEST_HSM_TPK}"
  pvk: "literal-pvk"
"#;
        let config = Config::from_str(yaml).unwrap();
        let keys = config.keys.unwrap();
        assert_eq!(keys.tpk(), "U1234567890ABCDEF1234567890ABCDEF");
        assert_eq!(keys.pvk(), "literal-pvk");

        std::env::remove_var("TEST_HSM_TPK");
    }

    #[test]
    fn test_env_var_expansion_missing_var() {
        assert_eq!(expand_env_vars("${NONEXISTENT_HSM_VAR}"), "");
        assert_eq!(expand_env_vars("prefix-${NONEXISTENT_HSM_VAR}"), "prefix-");
    }

    #[test]
    fn test_keys_debug_redacted() {
        let keys = KeysConfig {
            tpk: "secret-tpk".to_string(),
            pvk: "secret-pvk".to_string(),
        };
        let debug = format!("{keys:?}");
        assert!(!debug.contains("secret"));
    }
}
