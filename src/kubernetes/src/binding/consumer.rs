use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use portd_allocator::protocol::Protocol;

use crate::crd::{
    listener::{ListenerTarget, DEFAULT_TARGET_WEIGHT},
    port_binding::{PortBinding, PortBindingItem, BINDING_ITEMS_ANNOTATION},
    port_pool::LoadBalancerAddress,
};

const NODE_INTERNAL_IP: &str = "InternalIP";

/// The object a binding serves traffic to.
#[derive(Debug, Clone)]
pub enum ConsumerObject {
    Pod(Pod),
    Node(Node),
}

impl ConsumerObject {
    pub fn uid(&self) -> Option<String> {
        match self {
            ConsumerObject::Pod(pod) => pod.uid(),
            ConsumerObject::Node(node) => node.uid(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        match self {
            ConsumerObject::Pod(pod) => pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .map(|phase| phase == "Succeeded" || phase == "Failed")
                .unwrap_or(false),
            ConsumerObject::Node(node) => node.metadata.deletion_timestamp.is_some(),
        }
    }

    // Pod IP, or the host IP for host port items. Nodes use their internal IP.
    pub fn backend_ip(&self, host_port: bool) -> Option<String> {
        match self {
            ConsumerObject::Pod(pod) => {
                let status = pod.status.as_ref()?;
                if host_port {
                    status.host_ip.clone()
                } else {
                    status.pod_ip.clone()
                }
            }
            ConsumerObject::Node(node) => node
                .status
                .as_ref()?
                .addresses
                .as_ref()?
                .iter()
                .find(|a| a.type_ == NODE_INTERNAL_IP)
                .map(|a| a.address.clone()),
        }
    }

    pub fn bound_items(&self) -> Option<Vec<PortBindingItem>> {
        let annotations = match self {
            ConsumerObject::Pod(pod) => pod.annotations(),
            ConsumerObject::Node(node) => node.annotations(),
        };
        parse_binding_items(annotations.get(BINDING_ITEMS_ANNOTATION)?)
    }
}

pub fn parse_binding_items(value: &str) -> Option<Vec<PortBindingItem>> {
    match serde_json::from_str::<Vec<PortBindingItem>>(value) {
        Ok(items) => Some(items),
        Err(e) => {
            tracing::warn!(error=?e, "Invalid binding items annotation");
            None
        }
    }
}

pub fn same_items(a: &[PortBindingItem], b: &[PortBindingItem]) -> bool {
    a.len() == b.len() && a.iter().all(|i| b.contains(i))
}

pub fn desired_targets(
    consumer: &ConsumerObject,
    item: &PortBindingItem,
) -> Option<Vec<ListenerTarget>> {
    let ip = consumer.backend_ip(item.host_port)?;
    Some(vec![ListenerTarget {
        ip,
        port: item.rs_start_port,
        weight: DEFAULT_TARGET_WEIGHT,
    }])
}

/// Whether the consumer recorded in the binding still exists.
///
/// A recreated consumer with a new uid still counts when it carries the
/// same allocation, which is how bindings are reused across restarts.
pub fn is_present(binding: &PortBinding, consumer: Option<&ConsumerObject>) -> bool {
    let consumer = match consumer {
        Some(c) => c,
        None => return false,
    };
    if consumer.is_terminated() {
        return false;
    }
    match (&binding.spec.consumer.uid, consumer.uid()) {
        (Some(expected), Some(actual)) if *expected == actual => true,
        (None, _) => true,
        _ => consumer
            .bound_items()
            .map(|items| same_items(&items, &binding.spec.items))
            .unwrap_or(false),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    DeleteNow,
    DeleteAfter(std::time::Duration),
}

pub fn retention(
    keep_duration_seconds: Option<i64>,
    gone_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Retention {
    let keep = match keep_duration_seconds {
        Some(k) if k > 0 => k,
        _ => return Retention::DeleteNow,
    };
    let elapsed = gone_at
        .map(|at| now.signed_duration_since(at).num_seconds())
        .unwrap_or(0);
    if elapsed >= keep {
        return Retention::DeleteNow;
    }
    Retention::DeleteAfter(std::time::Duration::from_secs((keep - elapsed) as u64))
}

/// Address exposed on a load balancer for one binding item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundAddress {
    pub pool: String,
    pub item: String,
    pub protocol: Protocol,
    pub rs_port: u16,
    pub load_balancer_id: String,
    // `<address>:<port>` or `<address>:<start>-<end>` for segments
    pub address: String,
}

pub fn bound_addresses(
    item: &PortBindingItem,
    load_balancers: &[LoadBalancerAddress],
) -> Vec<BoundAddress> {
    load_balancers
        .iter()
        .map(|lb| BoundAddress {
            pool: item.pool_name.clone(),
            item: item.pool_item_name.clone(),
            protocol: item.protocol,
            rs_port: item.rs_start_port,
            load_balancer_id: lb.id.clone(),
            address: format!("{}:{}", lb.address, item.port_range()),
        })
        .collect()
}
