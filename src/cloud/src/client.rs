use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use portd_allocator::protocol::Protocol;

use super::error::Error;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolLayer {
    #[default]
    L4,
    L7,
}

impl std::fmt::Display for ProtocolLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolLayer::L4 => write!(f, "L4"),
            ProtocolLayer::L7 => write!(f, "L7"),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub ip: String,
    pub port: u16,
    pub weight: u32,
}

/// Identity of a listener on one load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerKey {
    pub load_balancer_id: String,
    pub protocol: Protocol,
    pub port: u16,
}

impl std::fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.load_balancer_id, self.protocol, self.port)
    }
}

/// Desired state of one listener.
///
/// `end_port` is 0 unless the listener covers a port segment.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerDef {
    pub load_balancer_id: String,
    pub protocol: Protocol,
    pub port: u16,
    pub end_port: u16,
    pub targets: Vec<Target>,
    // Set once the provider has created the listener.
    pub listener_id: Option<String>,
}

impl ListenerDef {
    pub fn key(&self) -> ListenerKey {
        ListenerKey {
            load_balancer_id: self.load_balancer_id.clone(),
            protocol: self.protocol,
            port: self.port,
        }
    }

    pub fn is_segment(&self) -> bool {
        self.end_port != 0
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalanceObject {
    pub id: String,
    pub name: String,
    pub namespace: Option<String>,
    pub region: String,
    pub layer: ProtocolLayer,
    // VIP or domain name
    pub address: String,
}

#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    async fn ensure_listener(&self, region: &str, listener: &ListenerDef) -> Result<String, Error>;

    async fn ensure_segment_listener(
        &self,
        region: &str,
        listener: &ListenerDef,
    ) -> Result<String, Error>;

    /// All listeners must belong to `load_balancer_id`.
    /// The call succeeds or fails as a whole.
    async fn ensure_multi_listeners(
        &self,
        region: &str,
        load_balancer_id: &str,
        listeners: &[ListenerDef],
    ) -> Result<HashMap<ListenerKey, String>, Error>;

    async fn ensure_multi_segment_listeners(
        &self,
        region: &str,
        load_balancer_id: &str,
        listeners: &[ListenerDef],
    ) -> Result<HashMap<ListenerKey, String>, Error>;

    async fn delete_listener(&self, region: &str, listener: &ListenerDef) -> Result<(), Error>;

    async fn delete_segment_listener(
        &self,
        region: &str,
        listener: &ListenerDef,
    ) -> Result<(), Error>;

    async fn delete_multi_listeners(
        &self,
        region: &str,
        load_balancer_id: &str,
        listeners: &[ListenerDef],
    ) -> Result<(), Error>;

    async fn describe_load_balancer(
        &self,
        region: &str,
        id: &str,
        layer: ProtocolLayer,
    ) -> Result<LoadBalanceObject, Error>;

    async fn describe_load_balancer_with_namespace(
        &self,
        region: &str,
        namespace: &str,
        name: &str,
        layer: ProtocolLayer,
    ) -> Result<LoadBalanceObject, Error>;

    // Namespaced providers address load balancers by namespace and name instead of id.
    fn is_namespaced(&self) -> bool;
}

pub fn check_batch(load_balancer_id: &str, listeners: &[ListenerDef]) -> Result<(), Error> {
    match listeners
        .iter()
        .find(|l| l.load_balancer_id != load_balancer_id)
    {
        Some(l) => Err(Error::InvalidListener(format!(
            "{} does not belong to {}",
            l.key(),
            load_balancer_id
        ))),
        None => Ok(()),
    }
}
