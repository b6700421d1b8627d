use std::{sync::Arc, time::Duration};

use portd_allocator::manager::PortPoolCache;
use portd_cloud::{client::LoadBalancerClient, fake::FakeClient};

use crate::retry::{ExponentialBackoff, RetryConfig};

use super::config::Config;

/// Runtime knobs derived from `Config`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub region: String,
    pub sync_interval: Duration,
    pub bulk_mode: bool,
    pub node_binding_namespace: String,
    pub leak_check_interval: Duration,
    pub leak_grace_period: chrono::Duration,
    pub cloud_timeout: Duration,
    pub status_retry: RetryConfig,
    pub backoff: ExponentialBackoff,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Settings {
            region: config.region.clone(),
            sync_interval: Duration::from_secs(config.sync_interval),
            bulk_mode: config.bulk_mode,
            node_binding_namespace: config.node_binding_namespace.clone(),
            leak_check_interval: Duration::from_secs(config.leak_check_interval),
            leak_grace_period: chrono::Duration::seconds(config.leak_grace_period as i64),
            cloud_timeout: Duration::from_secs(config.cloud_timeout),
            status_retry: RetryConfig::with_max_attempts(config.status_retry_attempts),
            backoff: ExponentialBackoff::new(
                Duration::from_secs(config.backoff_base),
                Duration::from_secs(config.backoff_max),
            ),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::from(&Config::default())
    }
}

/// State shared by the reconcilers and the webhooks.
#[derive(Clone)]
pub struct Component {
    pub cache: PortPoolCache,
    pub cloud: Arc<dyn LoadBalancerClient>,
    pub settings: Settings,
}

impl Component {
    pub fn new(
        cache: PortPoolCache,
        cloud: Arc<dyn LoadBalancerClient>,
        settings: Settings,
    ) -> Component {
        Component {
            cache,
            cloud,
            settings,
        }
    }

    // Backed by an empty fake provider.
    pub fn test() -> Component {
        Component::new(
            PortPoolCache::new(),
            Arc::new(FakeClient::new()),
            Settings::default(),
        )
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("cache", &self.cache)
            .field("namespaced", &self.cloud.is_namespaced())
            .field("settings", &self.settings)
            .finish()
    }
}
