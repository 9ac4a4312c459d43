//! Node configuration loaded from TOML with a validation pass that turns
//! nonsense into fatal startup errors.

use crate::foundation::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub operator: OperatorConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub bitcoin: BitcoinConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub pre_params: PreParamsConfig,
    #[serde(default)]
    pub spv: SpvConfig,
    #[serde(default)]
    pub sortition: SortitionConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Elliptic curve of the operator key pair. Only secp256k1 is supported.
    #[serde(default = "default_key_curve")]
    pub key_curve: String,
    /// Path to the operator key file.
    #[serde(default)]
    pub key_file: String,
}

fn default_key_curve() -> String {
    "secp256k1".to_string()
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self { key_curve: default_key_curve(), key_file: String::new() }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BitcoinConfig {
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreParamsConfig {
    /// Target number of pre-computed signing parameters kept ready.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    /// Pause between two generation attempts.
    #[serde(default = "default_generation_delay_millis")]
    pub generation_delay_millis: u64,
}

fn default_pool_size() -> usize {
    1000
}

fn default_generation_timeout_secs() -> u64 {
    120
}

fn default_generation_delay_millis() -> u64 {
    7_000
}

impl Default for PreParamsConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            generation_timeout_secs: default_generation_timeout_secs(),
            generation_delay_millis: default_generation_delay_millis(),
        }
    }
}

impl PreParamsConfig {
    pub fn generation_delay(&self) -> Duration {
        Duration::from_millis(self.generation_delay_millis)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpvConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Pause between two proving rounds that found nothing to do.
    #[serde(default = "default_idle_back_off_secs")]
    pub idle_back_off_secs: u64,
    /// Pause after an internal error before the maintainer restarts.
    #[serde(default = "default_restart_back_off_secs")]
    pub restart_back_off_secs: u64,
}

fn default_idle_back_off_secs() -> u64 {
    600
}

fn default_restart_back_off_secs() -> u64 {
    120
}

impl Default for SpvConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_back_off_secs: default_idle_back_off_secs(),
            restart_back_off_secs: default_restart_back_off_secs(),
        }
    }
}

impl SpvConfig {
    pub fn idle_back_off(&self) -> Duration {
        Duration::from_secs(self.idle_back_off_secs)
    }

    pub fn restart_back_off(&self) -> Duration {
        Duration::from_secs(self.restart_back_off_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SortitionConfig {
    #[serde(default = "default_status_check_tick_secs")]
    pub status_check_tick_secs: u64,
}

fn default_status_check_tick_secs() -> u64 {
    10
}

impl Default for SortitionConfig {
    fn default() -> Self {
        Self { status_check_tick_secs: default_status_check_tick_secs() }
    }
}

impl SortitionConfig {
    pub fn status_check_tick(&self) -> Duration {
        Duration::from_secs(self.status_check_tick_secs)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Every failure here is fatal; the process must not
    /// come up half-configured.
    pub fn validate(&self) -> Result<()> {
        if self.operator.key_curve != "secp256k1" {
            return Err(BridgeError::UnsupportedCurve(self.operator.key_curve.clone()));
        }
        if self.chain.endpoint.trim().is_empty() {
            return Err(BridgeError::ConfigError("chain endpoint is required".to_string()));
        }
        if self.bitcoin.endpoint.trim().is_empty() {
            return Err(BridgeError::ConfigError("bitcoin endpoint is required".to_string()));
        }
        if self.pre_params.pool_size == 0 {
            return Err(BridgeError::ConfigError("pre-params pool size must be positive".to_string()));
        }
        if self.sortition.status_check_tick_secs == 0 {
            return Err(BridgeError::ConfigError("sortition status check tick must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.chain.endpoint = "ws://localhost:8546".to_string();
        config.bitcoin.endpoint = "tcp://localhost:50001".to_string();
        config
    }

    #[test]
    fn defaults_fill_in_from_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [chain]
            endpoint = "ws://localhost:8546"

            [bitcoin]
            endpoint = "tcp://localhost:50001"
            "#,
        )
        .expect("parse");
        config.validate().expect("valid");

        assert_eq!(config.operator.key_curve, "secp256k1");
        assert_eq!(config.pre_params.pool_size, 1000);
        assert_eq!(config.spv.idle_back_off(), Duration::from_secs(600));
    }

    #[test]
    fn unsupported_curve_is_fatal() {
        let mut config = valid_config();
        config.operator.key_curve = "ed25519".to_string();
        assert!(matches!(config.validate(), Err(BridgeError::UnsupportedCurve(_))));
    }

    #[test]
    fn empty_endpoints_are_fatal() {
        let mut config = valid_config();
        config.chain.endpoint.clear();
        assert!(matches!(config.validate(), Err(BridgeError::ConfigError(_))));

        let mut config = valid_config();
        config.bitcoin.endpoint = "  ".to_string();
        assert!(matches!(config.validate(), Err(BridgeError::ConfigError(_))));
    }

    #[test]
    fn zero_pool_size_is_fatal() {
        let mut config = valid_config();
        config.pre_params.pool_size = 0;
        assert!(config.validate().is_err());
    }
}
