use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use portd_allocator::protocol::Protocol;
use portd_cloud::client::{ListenerDef, ListenerKey, Target};

use crate::{error::Error, util::sanitize_name};

pub const LISTENER_FINALIZER: &str = "listener.portd.lbport.io/finalizer";

pub const OWNER_KIND_LABEL: &str = "portd.lbport.io/owner-kind";
pub const OWNER_NAME_LABEL: &str = "portd.lbport.io/owner-name";
pub const POOL_LABEL: &str = "portd.lbport.io/pool";
pub const POOL_ITEM_LABEL: &str = "portd.lbport.io/pool-item";

pub const DEFAULT_TARGET_WEIGHT: u32 = 100;

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "portd.lbport.io",
    version = "v1alpha1",
    kind = "Listener",
    namespaced
)]
#[kube(status = "ListenerStatus")]
#[kube(
    printcolumn = r#"{"name":"LOADBALANCER", "type":"string", "description":"Load balancer id", "jsonPath":".spec.loadBalancerId"}"#,
    printcolumn = r#"{"name":"PROTOCOL", "type":"string", "description":"Listener protocol", "jsonPath":".spec.protocol"}"#,
    printcolumn = r#"{"name":"PORT", "type":"integer", "description":"Listener port", "jsonPath":".spec.port"}"#,
    printcolumn = r#"{"name":"PHASE", "type":"string", "description":"Sync phase", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    pub region: String,
    pub load_balancer_id: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default)]
    pub end_port: u16,
    #[serde(default)]
    pub targets: Vec<ListenerTarget>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerTarget {
    pub ip: String,
    pub port: u16,
    pub weight: u32,
}

impl From<&ListenerTarget> for Target {
    fn from(value: &ListenerTarget) -> Self {
        Target {
            ip: value.ip.clone(),
            port: value.port,
            weight: value.weight,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    pub phase: ListenerPhase,
    pub listener_id: Option<String>,
    pub observed_generation: Option<i64>,
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum ListenerPhase {
    #[default]
    NotSynced,
    Synced,
}

impl std::fmt::Display for ListenerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerPhase::NotSynced => write!(f, "NotSynced"),
            ListenerPhase::Synced => write!(f, "Synced"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    PoolItem,
    Ingress,
}

impl std::fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OwnerKind::PoolItem => write!(f, "PoolItem"),
            OwnerKind::Ingress => write!(f, "Ingress"),
        }
    }
}

impl std::str::FromStr for OwnerKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PoolItem" => Ok(OwnerKind::PoolItem),
            "Ingress" => Ok(OwnerKind::Ingress),
            _ => Err(Error::InvalidLabel(
                OWNER_KIND_LABEL.to_string(),
                s.to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOwner {
    pub kind: OwnerKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolItemRef {
    pub pool: String,
    pub item: String,
}

/// Ownership and pool membership of a listener.
/// These are serialized into labels only at the object boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerMeta {
    pub owner: ListenerOwner,
    pub pool_item: Option<PoolItemRef>,
}

impl ListenerMeta {
    pub fn for_pool_item(pool: &str, item: &str) -> ListenerMeta {
        ListenerMeta {
            owner: ListenerOwner {
                kind: OwnerKind::PoolItem,
                name: item.to_string(),
            },
            pool_item: Some(PoolItemRef {
                pool: pool.to_string(),
                item: item.to_string(),
            }),
        }
    }

    pub fn to_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([
            (OWNER_KIND_LABEL.to_string(), self.owner.kind.to_string()),
            (OWNER_NAME_LABEL.to_string(), self.owner.name.clone()),
        ]);
        if let Some(r) = &self.pool_item {
            labels.insert(POOL_LABEL.to_string(), r.pool.clone());
            labels.insert(POOL_ITEM_LABEL.to_string(), r.item.clone());
        }
        labels
    }

    pub fn from_labels(labels: &BTreeMap<String, String>) -> Result<ListenerMeta, Error> {
        let get = |key: &str| {
            labels
                .get(key)
                .cloned()
                .ok_or(Error::MissingLabel(key.to_string()))
        };
        let kind = get(OWNER_KIND_LABEL)?.parse::<OwnerKind>()?;
        let name = get(OWNER_NAME_LABEL)?;
        let pool_item = match (labels.get(POOL_LABEL), labels.get(POOL_ITEM_LABEL)) {
            (Some(pool), Some(item)) => Some(PoolItemRef {
                pool: pool.clone(),
                item: item.clone(),
            }),
            _ => None,
        };
        Ok(ListenerMeta {
            owner: ListenerOwner { kind, name },
            pool_item,
        })
    }

    // Label selector matching every listener of a pool item.
    pub fn pool_item_selector(pool: &str, item: &str) -> String {
        format!("{POOL_LABEL}={pool},{POOL_ITEM_LABEL}={item}")
    }
}

pub fn listener_name(
    pool: &str,
    item: &str,
    load_balancer_id: &str,
    protocol: Protocol,
    port: u16,
) -> String {
    sanitize_name(&format!(
        "{pool}-{item}-{load_balancer_id}-{}-{port}",
        protocol.to_string().to_ascii_lowercase()
    ))
}

impl Listener {
    // Synced only counts for the current generation of the spec.
    pub fn is_synced(&self) -> bool {
        match &self.status {
            Some(status) => {
                status.phase == ListenerPhase::Synced
                    && (self.metadata.generation.is_none()
                        || status.observed_generation == self.metadata.generation)
            }
            None => false,
        }
    }

    pub fn listener_id(&self) -> Option<String> {
        self.status.as_ref().and_then(|s| s.listener_id.clone())
    }

    pub fn meta(&self) -> Result<ListenerMeta, Error> {
        ListenerMeta::from_labels(self.labels())
    }

    pub fn key(&self) -> ListenerKey {
        ListenerKey {
            load_balancer_id: self.spec.load_balancer_id.clone(),
            protocol: self.spec.protocol,
            port: self.spec.port,
        }
    }

    pub fn to_def(&self) -> ListenerDef {
        ListenerDef {
            load_balancer_id: self.spec.load_balancer_id.clone(),
            protocol: self.spec.protocol,
            port: self.spec.port,
            end_port: self.spec.end_port,
            targets: self.spec.targets.iter().map(Target::from).collect(),
            listener_id: self.listener_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;
    use rstest::rstest;

    #[test]
    fn works_listener_meta_labels() {
        let meta = ListenerMeta::for_pool_item("p1", "it1");
        let labels = meta.to_labels();
        assert_eq!(labels.get(POOL_LABEL), Some(&"p1".to_string()));
        assert_eq!(labels.get(OWNER_KIND_LABEL), Some(&"PoolItem".to_string()));
        assert_eq!(ListenerMeta::from_labels(&labels).unwrap(), meta);
    }

    #[test]
    fn fails_listener_meta_labels() {
        let labels = BTreeMap::from([(OWNER_KIND_LABEL.to_string(), "Service".to_string())]);
        assert!(ListenerMeta::from_labels(&labels).is_err());
        let labels = BTreeMap::from([(OWNER_KIND_LABEL.to_string(), "Ingress".to_string())]);
        assert!(matches!(
            ListenerMeta::from_labels(&labels),
            Err(Error::MissingLabel(_))
        ));
    }

    #[test]
    fn works_listener_name() {
        assert_eq!(
            listener_name("p1", "it1", "lb-1", Protocol::UDP, 30000),
            "p1-it1-lb-1-udp-30000"
        );
    }

    #[rstest(
        phase,
        generation,
        observed,
        expected,
        case(None, Some(1), None, false),
        case(Some(ListenerPhase::Synced), Some(2), Some(2), true),
        case(Some(ListenerPhase::Synced), Some(3), Some(2), false),
        case(Some(ListenerPhase::NotSynced), Some(2), Some(2), false),
        case(Some(ListenerPhase::Synced), None, None, true),
    )]
    fn works_is_synced(
        phase: Option<ListenerPhase>,
        generation: Option<i64>,
        observed: Option<i64>,
        expected: bool,
    ) {
        let listener = Listener {
            metadata: ObjectMeta {
                name: Some("l1".to_string()),
                generation,
                ..Default::default()
            },
            spec: ListenerSpec::default(),
            status: phase.map(|phase| ListenerStatus {
                phase,
                observed_generation: observed,
                ..Default::default()
            }),
        };
        assert_eq!(listener.is_synced(), expected);
    }
}
