use std::{str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use super::{
    client::{LoadBalanceObject, LoadBalancerClient},
    error::Error,
    fake::FakeClient,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderKind {
    #[default]
    Fake,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Fake => write!(f, "fake"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fake" => Ok(ProviderKind::Fake),
            _ => Err(Error::UnsupportedProvider(s.to_string())),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub namespaced: bool,
    // Load balancers known to the fake provider at startup.
    pub load_balancers: Vec<LoadBalanceObject>,
}

pub fn new_client(config: &ProviderConfig) -> Result<Arc<dyn LoadBalancerClient>, Error> {
    match config.kind {
        ProviderKind::Fake => {
            let client = FakeClient::new();
            client.set_namespaced(config.namespaced)?;
            for lb in config.load_balancers.iter() {
                client.add_load_balancer(lb.clone())?;
            }
            tracing::info!(
                provider = config.kind.to_string(),
                load_balancers = config.load_balancers.len(),
                "Create load balancer client"
            );
            Ok(Arc::new(client))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProtocolLayer;

    #[test]
    fn works_provider_kind_from_str() {
        assert_eq!(ProviderKind::from_str("fake").unwrap(), ProviderKind::Fake);
        assert_eq!(
            ProviderKind::from_str("aws").unwrap_err(),
            Error::UnsupportedProvider("aws".to_string())
        );
    }

    #[tokio::test]
    async fn works_new_client() {
        let config = ProviderConfig {
            kind: ProviderKind::Fake,
            namespaced: true,
            load_balancers: vec![LoadBalanceObject {
                id: "lb-1".to_string(),
                name: "gateway".to_string(),
                namespace: Some("infra".to_string()),
                region: "region-a".to_string(),
                layer: ProtocolLayer::L4,
                address: "203.0.113.10".to_string(),
            }],
        };
        let client = new_client(&config).unwrap();
        assert!(client.is_namespaced());
        let lb = client
            .describe_load_balancer_with_namespace("region-a", "infra", "gateway", ProtocolLayer::L4)
            .await
            .unwrap();
        assert_eq!(lb.id, "lb-1");
    }
}
