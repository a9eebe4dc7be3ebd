//! Facade configuration, loadable from a TOML file.

use std::{net::SocketAddr, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading or validating a [`ClientConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid duration {value:?}: {source}")]
    Duration { value: String, source: humantime::DurationError },

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// The facade's configuration surface (§3.3): monitor addresses, this
/// client's numeric identity, reconnect backoff bounds, and the keepalive
/// interval/timeout. Every timing field is a humantime string (`"500ms"`,
/// `"5m"`) on the wire and a [`ceph_timing::Duration`] once parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Monitor addresses to try, in order, when establishing the initial session.
    #[serde(default)]
    pub mon_addrs: Vec<SocketAddr>,

    /// This client's `entity_num` (§3.1's `Identity`); the entity type is always `Client`.
    #[serde(default)]
    pub client_num: u64,

    /// Local address to bind a listener on, for inbound peer connections.
    /// Absent means outbound-only.
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,

    /// Whether sessions opened with [`crate::CephClient::connect_mon`] are lossy (§4.2).
    /// Monitor sessions are conventionally lossless.
    #[serde(default)]
    pub mon_lossy: bool,

    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,
    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: String,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout: String,
}

fn default_backoff_base() -> String {
    "500ms".to_string()
}

fn default_backoff_max() -> String {
    "5m".to_string()
}

fn default_keepalive_interval() -> String {
    "10s".to_string()
}

fn default_keepalive_timeout() -> String {
    "15s".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mon_addrs: Vec::new(),
            client_num: 0,
            listen_addr: None,
            mon_lossy: false,
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_timeout: default_keepalive_timeout(),
        }
    }
}

impl ClientConfig {
    /// Loads a config from a TOML file on disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses `backoff_base`/`backoff_max` into a [`ceph_timing::Backoff`],
    /// rejecting a base greater than max the same way `Backoff::new` would
    /// only via `debug_assert!` (§9's "either ordering is acceptable" does
    /// not apply here — a misconfigured base/max pair is a genuine user
    /// error, not an internal ambiguity).
    pub fn backoff(&self) -> Result<ceph_timing::Backoff, ConfigError> {
        let base = self.parse_duration("backoff_base", &self.backoff_base)?;
        let max = self.parse_duration("backoff_max", &self.backoff_max)?;
        if base > max {
            return Err(ConfigError::Invalid("backoff_base must not exceed backoff_max"));
        }
        Ok(ceph_timing::Backoff::new(base, max))
    }

    pub fn keepalive(&self) -> Result<(ceph_timing::Duration, ceph_timing::Duration), ConfigError> {
        let interval = self.parse_duration("keepalive_interval", &self.keepalive_interval)?;
        let timeout = self.parse_duration("keepalive_timeout", &self.keepalive_timeout)?;
        Ok((interval, timeout))
    }

    fn parse_duration(&self, _field: &'static str, value: &str) -> Result<ceph_timing::Duration, ConfigError> {
        let parsed: std::time::Duration =
            humantime::parse_duration(value).map_err(|source| ConfigError::Duration { value: value.to_string(), source })?;
        Ok(parsed.into())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.backoff()?;
        self.keepalive()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_and_validate() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        let (interval, timeout) = config.keepalive().unwrap();
        assert_eq!(interval, ceph_timing::Duration::from_secs(10));
        assert_eq!(timeout, ceph_timing::Duration::from_secs(15));
    }

    #[test]
    fn parses_toml() {
        let toml = r#"
            mon_addrs = ["127.0.0.1:6789"]
            client_num = 42
            backoff_base = "100ms"
            backoff_max = "30s"
        "#;
        let config: ClientConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.client_num, 42);
        assert_eq!(config.mon_addrs.len(), 1);
        let backoff = config.backoff().unwrap();
        assert_eq!(backoff.current(), ceph_timing::Duration::from_millis(100));
    }

    #[test]
    fn rejects_base_above_max() {
        let mut config = ClientConfig::default();
        config.backoff_base = "1m".to_string();
        config.backoff_max = "10s".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_malformed_duration() {
        let mut config = ClientConfig::default();
        config.keepalive_interval = "not-a-duration".to_string();
        assert!(config.validate().is_err());
    }
}
