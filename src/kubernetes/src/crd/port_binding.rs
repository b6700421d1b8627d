use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use portd_allocator::{
    manager::{pool_key, PortAllocation, SlotKey},
    port_list::SlotReference,
    protocol::Protocol,
};

pub use crate::binding::state::{BindingPhase, ItemPhase};

pub const PORT_BINDING_FINALIZER: &str = "portbinding.portd.lbport.io/finalizer";

// Port request written by users on pods and nodes.
pub const PORT_REQUEST_ANNOTATION: &str = "portd.lbport.io/ports";
pub const KEEP_DURATION_ANNOTATION: &str = "portd.lbport.io/keep-duration-seconds";
// Allocation result recorded by the mutating webhook.
pub const BINDING_ITEMS_ANNOTATION: &str = "portd.lbport.io/binding-items";
pub const BOUND_ADDRESSES_ANNOTATION: &str = "portd.lbport.io/bound-addresses";
pub const BOUND_LABEL: &str = "portd.lbport.io/bound";
pub const BINDING_READY_CONDITION: &str = "portd.lbport.io/binding-ready";

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "portd.lbport.io",
    version = "v1alpha1",
    kind = "PortBinding",
    namespaced
)]
#[kube(status = "PortBindingStatus")]
#[kube(
    printcolumn = r#"{"name":"KIND", "type":"string", "description":"Consumer kind", "jsonPath":".spec.consumer.kind"}"#,
    printcolumn = r#"{"name":"CONSUMER", "type":"string", "description":"Consumer name", "jsonPath":".spec.consumer.name"}"#,
    printcolumn = r#"{"name":"PHASE", "type":"string", "description":"Binding phase", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PortBindingSpec {
    pub consumer: Consumer,
    pub items: Vec<PortBindingItem>,
    // Keep the binding for a while after the consumer is gone.
    pub keep_duration_seconds: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Consumer {
    pub kind: ConsumerKind,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: Option<String>,
}

impl Consumer {
    pub fn reference(&self) -> SlotReference {
        SlotReference::new(
            &self.kind.to_string(),
            self.namespace.as_deref().unwrap_or_default(),
            &self.name,
        )
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConsumerKind {
    #[default]
    Pod,
    Node,
}

impl std::fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerKind::Pod => write!(f, "Pod"),
            ConsumerKind::Node => write!(f, "Node"),
        }
    }
}

/// One allocated slot bound to a consumer port.
///
/// `end_port` is 0 unless a port segment is bound.
/// `rs_start_port` is the first backend port on the consumer side.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PortBindingItem {
    pub pool_name: String,
    pub pool_namespace: String,
    pub pool_item_name: String,
    pub protocol: Protocol,
    pub start_port: u16,
    pub end_port: u16,
    pub rs_start_port: u16,
    #[serde(default)]
    pub host_port: bool,
}

impl PortBindingItem {
    pub fn from_allocation(
        pool_name: &str,
        pool_namespace: &str,
        allocation: &PortAllocation,
        rs_start_port: u16,
        host_port: bool,
    ) -> PortBindingItem {
        PortBindingItem {
            pool_name: pool_name.to_string(),
            pool_namespace: pool_namespace.to_string(),
            pool_item_name: allocation.item_name.clone(),
            protocol: allocation.protocol,
            start_port: allocation.slot.start_port,
            end_port: allocation.slot.end_port,
            rs_start_port,
            host_port,
        }
    }

    pub fn pool_key(&self) -> String {
        pool_key(&self.pool_name, &self.pool_namespace)
    }

    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            pool_key: self.pool_key(),
            item_name: self.pool_item_name.clone(),
            protocol: self.protocol,
            start_port: self.start_port,
            end_port: self.end_port,
        }
    }

    pub fn is_segment(&self) -> bool {
        self.end_port != 0
    }

    pub fn port_range(&self) -> String {
        if self.is_segment() {
            format!("{}-{}", self.start_port, self.end_port)
        } else {
            self.start_port.to_string()
        }
    }
}

impl std::fmt::Display for PortBindingItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.pool_namespace,
            self.pool_name,
            self.pool_item_name,
            self.protocol,
            self.port_range()
        )
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortBindingStatus {
    pub phase: BindingPhase,
    #[serde(default)]
    pub items: Vec<PortBindingItemStatus>,
    pub consumer_gone_at: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortBindingItemStatus {
    pub pool_name: String,
    pub pool_namespace: String,
    pub pool_item_name: String,
    pub protocol: Protocol,
    pub start_port: u16,
    pub end_port: u16,
    pub phase: ItemPhase,
    pub message: Option<String>,
}

impl PortBindingItemStatus {
    pub fn new(item: &PortBindingItem, phase: ItemPhase, message: Option<String>) -> Self {
        PortBindingItemStatus {
            pool_name: item.pool_name.clone(),
            pool_namespace: item.pool_namespace.clone(),
            pool_item_name: item.pool_item_name.clone(),
            protocol: item.protocol,
            start_port: item.start_port,
            end_port: item.end_port,
            phase,
            message,
        }
    }

    pub fn is_for(&self, item: &PortBindingItem) -> bool {
        self.pool_name == item.pool_name
            && self.pool_namespace == item.pool_namespace
            && self.pool_item_name == item.pool_item_name
            && self.protocol == item.protocol
            && self.start_port == item.start_port
            && self.end_port == item.end_port
    }
}

impl PortBinding {
    pub fn item_phase(&self, item: &PortBindingItem) -> Option<ItemPhase> {
        self.status
            .as_ref()
            .and_then(|s| s.items.iter().find(|i| i.is_for(item)))
            .map(|i| i.phase)
    }

    pub fn phase(&self) -> Option<BindingPhase> {
        self.status.as_ref().map(|s| s.phase)
    }
}
