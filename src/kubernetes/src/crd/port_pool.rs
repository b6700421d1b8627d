use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use portd_allocator::{
    manager::pool_key,
    pool_item::{AllocationPolicy, ItemPhase, ItemStatus, LoadBalancerEndpoint},
    protocol::Protocol,
};

pub const PORT_POOL_FINALIZER: &str = "portpool.portd.lbport.io/finalizer";

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "portd.lbport.io",
    version = "v1alpha1",
    kind = "PortPool",
    namespaced
)]
#[kube(status = "PortPoolStatus")]
#[kube(
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PortPoolSpec {
    pub items: Vec<PortPoolItem>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortPoolItem {
    pub name: String,
    pub start_port: u16,
    pub end_port: u16,
    pub segment_length: Option<u16>,
    pub protocols: Vec<Protocol>,
    // Falls back to the controller's default region.
    pub region: Option<String>,
    pub load_balancer_ids: Vec<String>,
}

impl PortPoolItem {
    pub fn policy(&self) -> AllocationPolicy {
        AllocationPolicy {
            item_name: self.name.clone(),
            start_port: self.start_port,
            end_port: self.end_port,
            segment_length: self.segment_length,
            protocols: self.protocols.clone(),
        }
    }

    pub fn segment_length(&self) -> u16 {
        self.segment_length.unwrap_or(1).max(1)
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortPoolStatus {
    #[serde(default)]
    pub items: Vec<PortPoolItemStatus>,
}

/// Observed state of one pool item.
///
/// The layout is kept here as well so that an item removed from the spec
/// can still be rebuilt while bindings reference it.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortPoolItemStatus {
    pub name: String,
    pub phase: PoolItemPhase,
    pub start_port: u16,
    pub end_port: u16,
    pub segment_length: Option<u16>,
    pub protocols: Vec<Protocol>,
    pub region: String,
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerAddress>,
    pub message: Option<String>,
}

impl PortPoolItemStatus {
    pub fn policy(&self) -> AllocationPolicy {
        AllocationPolicy {
            item_name: self.name.clone(),
            start_port: self.start_port,
            end_port: self.end_port,
            segment_length: self.segment_length,
            protocols: self.protocols.clone(),
        }
    }

    pub fn item_status(&self) -> ItemStatus {
        ItemStatus {
            phase: self.phase.into(),
            region: self.region.clone(),
            load_balancers: self
                .load_balancers
                .iter()
                .map(|lb| LoadBalancerEndpoint {
                    id: lb.id.clone(),
                    address: lb.address.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
pub struct LoadBalancerAddress {
    pub id: String,
    pub address: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum PoolItemPhase {
    #[default]
    Active,
    Deleting,
}

impl From<PoolItemPhase> for ItemPhase {
    fn from(value: PoolItemPhase) -> Self {
        match value {
            PoolItemPhase::Active => ItemPhase::Active,
            PoolItemPhase::Deleting => ItemPhase::Deleting,
        }
    }
}

impl From<ItemPhase> for PoolItemPhase {
    fn from(value: ItemPhase) -> Self {
        match value {
            ItemPhase::Active => PoolItemPhase::Active,
            ItemPhase::Deleting => PoolItemPhase::Deleting,
        }
    }
}

impl std::fmt::Display for PoolItemPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolItemPhase::Active => write!(f, "Active"),
            PoolItemPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

impl PortPool {
    pub fn pool_key(&self) -> String {
        pool_key(
            self.metadata.name.as_deref().unwrap_or_default(),
            self.metadata.namespace.as_deref().unwrap_or_default(),
        )
    }
}
