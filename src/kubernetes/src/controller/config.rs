use std::fs;

use serde::{Deserialize, Serialize};

use portd_cert::constants::{DEFAULT_TLS_CERT, DEFAULT_TLS_KEY};
use portd_cloud::provider::ProviderConfig;

use super::error::{ConfigError, Error};

pub const DEFAULT_HTTP_PORT: u32 = 8080;
pub const DEFAULT_HTTPS_PORT: u32 = 8443;
pub const DEFAULT_REQUEUE_INTERVAL: u64 = 30 * 60;
pub const DEFAULT_REGION: &str = "default";
pub const DEFAULT_SYNC_INTERVAL: u64 = 3;
pub const DEFAULT_NODE_BINDING_NAMESPACE: &str = "kube-system";
pub const DEFAULT_LEAK_CHECK_INTERVAL: u64 = 5 * 60;
pub const DEFAULT_LEAK_GRACE_PERIOD: u64 = 30 * 60;
pub const DEFAULT_CLOUD_TIMEOUT: u64 = 30;
pub const DEFAULT_STATUS_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_BASE: u64 = 1;
pub const DEFAULT_BACKOFF_MAX: u64 = 5 * 60;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Tls {
    pub cert: String,
    pub key: String,
}

/// Controller configuration. Durations are in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub http_port: u32,
    pub https_port: u32,
    pub tls: Tls,
    pub requeue_interval: u64,
    pub region: String,
    pub sync_interval: u64,
    pub bulk_mode: bool,
    pub node_binding_namespace: String,
    pub leak_check_interval: u64,
    pub leak_grace_period: u64,
    pub cloud_timeout: u64,
    pub status_retry_attempts: u32,
    pub backoff_base: u64,
    pub backoff_max: u64,
    pub provider: ProviderConfig,
}

impl Config {
    pub fn load(file: &str) -> Result<Self, Error> {
        let contents = fs::read_to_string(file).map_err(Error::StdIo)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(contents).map_err(|e| {
            tracing::error!(error=?e, "failed to parse config");
            Error::Config(ConfigError::FailedToLoad)
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.sync_interval == 0 || self.leak_check_interval == 0 || self.cloud_timeout == 0 {
            return Err(Error::Config(ConfigError::InvalidArgument(
                "intervals and timeouts must be positive".to_string(),
            )));
        }
        if self.backoff_base == 0 || self.backoff_base > self.backoff_max {
            return Err(Error::Config(ConfigError::InvalidArgument(
                "backoff_base must be positive and not exceed backoff_max".to_string(),
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            tls: Tls {
                cert: DEFAULT_TLS_CERT.to_string(),
                key: DEFAULT_TLS_KEY.to_string(),
            },
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            region: DEFAULT_REGION.to_string(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            bulk_mode: false,
            node_binding_namespace: DEFAULT_NODE_BINDING_NAMESPACE.to_string(),
            leak_check_interval: DEFAULT_LEAK_CHECK_INTERVAL,
            leak_grace_period: DEFAULT_LEAK_GRACE_PERIOD,
            cloud_timeout: DEFAULT_CLOUD_TIMEOUT,
            status_retry_attempts: DEFAULT_STATUS_RETRY_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            provider: ProviderConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portd_cloud::provider::ProviderKind;

    #[test]
    fn works_parse_partial_config() {
        let contents = r#"
http_port: 9080
region: ap-tokyo
bulk_mode: true
provider:
  kind: fake
  loadBalancers:
    - id: lb-1
      name: lb-1
      region: ap-tokyo
      layer: L4
      address: 203.0.113.1
"#;
        let config = Config::parse(contents).unwrap();
        assert_eq!(config.http_port, 9080);
        assert_eq!(config.https_port, DEFAULT_HTTPS_PORT);
        assert_eq!(config.region, "ap-tokyo");
        assert!(config.bulk_mode);
        assert_eq!(config.leak_grace_period, DEFAULT_LEAK_GRACE_PERIOD);
        assert_eq!(config.provider.kind, ProviderKind::Fake);
        assert_eq!(config.provider.load_balancers.len(), 1);
        assert_eq!(config.tls.cert, DEFAULT_TLS_CERT);
    }

    #[test]
    fn fails_parse_invalid_config() {
        assert!(Config::parse("sync_interval: 0").is_err());
        assert!(Config::parse("backoff_base: 600").is_err());
        assert!(Config::parse("http_port: [").is_err());
    }
}
