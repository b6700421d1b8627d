use std::collections::{BTreeMap, BTreeSet};

use portd_allocator::{
    manager::{PortAllocation, PortPoolCacheInner},
    pool_item::LoadBalancerEndpoint,
    protocol::Protocol,
};

use crate::{
    controller::error::Error,
    crd::port_binding::{PortBinding, PortBindingItem},
};

use super::annotation::{PortRequest, RequestedProtocol};

/// A port request bound to the real server port it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    pub request: PortRequest,
    pub protocol: RequestedProtocol,
    pub rs_port: u16,
}

/// An allocated binding item and the load balancers exposing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundItem {
    pub item: PortBindingItem,
    pub load_balancers: Vec<LoadBalancerEndpoint>,
}

impl BoundItem {
    // `<address>:<port>` on every load balancer, comma separated
    pub fn addresses(&self) -> String {
        self.load_balancers
            .iter()
            .map(|lb| format!("{}:{}", lb.address, self.item.port_range()))
            .collect::<Vec<String>>()
            .join(",")
    }
}

/// Allocates every request or none of them.
pub fn allocate(
    cache: &mut PortPoolCacheInner,
    requests: &[ResolvedRequest],
) -> Result<Vec<BoundItem>, Error> {
    let mut allocated: Vec<(PortAllocation, &ResolvedRequest)> = Vec::new();
    for req in requests.iter() {
        let res = match req.protocol {
            RequestedProtocol::Single(p) => cache
                .allocate_port_binding(&req.request.pool_key(), p, None)
                .map(|a| vec![a]),
            RequestedProtocol::All => {
                cache.allocate_all_protocol_port_binding(&req.request.pool_key(), None)
            }
        };
        match res {
            Ok(allocations) => {
                allocated.extend(allocations.into_iter().map(|a| (a, req)));
            }
            Err(e) => {
                tracing::warn!(
                    request = req.request.to_string(),
                    error = e.to_string(),
                    rollback = allocated.len(),
                    "Failed to allocate port, release allocated ones"
                );
                for (a, _) in allocated.iter() {
                    cache.release_port_binding(&a.key());
                }
                return Err(Error::Allocator(e));
            }
        }
    }

    Ok(allocated
        .into_iter()
        .map(|(a, req)| BoundItem {
            item: PortBindingItem::from_allocation(
                &req.request.pool_name,
                &req.request.pool_namespace,
                &a,
                req.rs_port,
                req.request.host_port,
            ),
            load_balancers: a.item_status.load_balancers.clone(),
        })
        .collect())
}

type RequestKey = (String, String, u16, bool);

fn request_key(pool_name: &str, pool_namespace: &str, rs_port: u16, host_port: bool) -> RequestKey {
    (pool_name.to_string(), pool_namespace.to_string(), rs_port, host_port)
}

/// Whether an existing binding already holds exactly what is requested,
/// so that a recreated consumer gets its previous ports back.
pub fn reusable(binding: &PortBinding, requests: &[ResolvedRequest]) -> bool {
    if binding.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let mut held: BTreeMap<RequestKey, BTreeSet<Protocol>> = BTreeMap::new();
    for item in binding.spec.items.iter() {
        held.entry(request_key(
            &item.pool_name,
            &item.pool_namespace,
            item.rs_start_port,
            item.host_port,
        ))
        .or_default()
        .insert(item.protocol);
    }

    let mut wanted: BTreeMap<RequestKey, Option<BTreeSet<Protocol>>> = BTreeMap::new();
    for req in requests.iter() {
        let key = request_key(
            &req.request.pool_name,
            &req.request.pool_namespace,
            req.rs_port,
            req.request.host_port,
        );
        match req.protocol {
            // any joint allocation
            RequestedProtocol::All => {
                wanted.insert(key, None);
            }
            RequestedProtocol::Single(p) => {
                if let Some(set) = wanted.entry(key).or_insert_with(|| Some(BTreeSet::new())) {
                    set.insert(p);
                }
            }
        }
    }

    if held.len() != wanted.len() {
        return false;
    }
    wanted.iter().all(|(key, protocols)| match (held.get(key), protocols) {
        (Some(h), None) => h.len() >= 2,
        (Some(h), Some(w)) => h == w,
        (None, _) => false,
    })
}

/// Bound items of an existing binding with the current load balancers.
pub fn reuse(cache: &PortPoolCacheInner, binding: &PortBinding) -> Vec<BoundItem> {
    binding
        .spec
        .items
        .iter()
        .map(|item| BoundItem {
            item: item.clone(),
            load_balancers: cache
                .get_item(&item.pool_key(), &item.pool_item_name)
                .map(|i| i.status().load_balancers.clone())
                .unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use portd_allocator::pool_item::{AllocationPolicy, ItemStatus};

    use super::*;
    use crate::{
        controller::webhook::annotation::PortRef,
        fixture::reconciler::{test_binding_item, test_port_binding, TEST_LB_ADDRESS, TEST_LB_ID},
    };

    fn cache_with(end_port: u16, protocols: Vec<Protocol>) -> PortPoolCacheInner {
        let mut cache = PortPoolCacheInner::default();
        cache
            .add_pool_item(
                "p1/default",
                AllocationPolicy {
                    item_name: "it1".to_string(),
                    start_port: 30000,
                    end_port,
                    segment_length: None,
                    protocols,
                },
                ItemStatus {
                    region: "default".to_string(),
                    load_balancers: vec![LoadBalancerEndpoint {
                        id: TEST_LB_ID.to_string(),
                        address: TEST_LB_ADDRESS.to_string(),
                    }],
                    ..Default::default()
                },
            )
            .unwrap();
        cache
    }

    fn resolved(protocol: RequestedProtocol, rs_port: u16) -> ResolvedRequest {
        ResolvedRequest {
            request: PortRequest {
                pool_name: "p1".to_string(),
                pool_namespace: "default".to_string(),
                protocol: Some(protocol),
                port: PortRef::Number(rs_port),
                host_port: false,
            },
            protocol,
            rs_port,
        }
    }

    #[test]
    fn allocate_every_request() {
        let mut cache = cache_with(30010, vec![Protocol::TCP]);
        let bound = allocate(
            &mut cache,
            &[
                resolved(RequestedProtocol::Single(Protocol::TCP), 8080),
                resolved(RequestedProtocol::Single(Protocol::TCP), 9090),
            ],
        )
        .unwrap();
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0].item.start_port, 30000);
        assert_eq!(bound[0].item.rs_start_port, 8080);
        assert_eq!(bound[1].item.start_port, 30001);
        assert_eq!(bound[0].addresses(), "203.0.113.1:30000");
    }

    #[test]
    fn rollback_on_partial_failure() {
        // one free port for two requests
        let mut cache = cache_with(30000, vec![Protocol::TCP]);
        let res = allocate(
            &mut cache,
            &[
                resolved(RequestedProtocol::Single(Protocol::TCP), 8080),
                resolved(RequestedProtocol::Single(Protocol::TCP), 9090),
            ],
        );
        assert!(res.is_err());
        assert!(cache.used_slots().is_empty());
    }

    #[test]
    fn allocate_all_protocols_jointly() {
        let mut cache = cache_with(30010, vec![Protocol::TCP, Protocol::UDP]);
        let bound = allocate(&mut cache, &[resolved(RequestedProtocol::All, 53)]).unwrap();
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0].item.start_port, bound[1].item.start_port);
        assert_ne!(bound[0].item.protocol, bound[1].item.protocol);
    }

    #[test]
    fn works_reusable() {
        let binding = test_port_binding();
        assert!(reusable(
            &binding,
            &[resolved(RequestedProtocol::Single(Protocol::TCP), 8080)]
        ));
        assert!(!reusable(
            &binding,
            &[resolved(RequestedProtocol::Single(Protocol::UDP), 8080)]
        ));
        assert!(!reusable(
            &binding,
            &[resolved(RequestedProtocol::Single(Protocol::TCP), 9090)]
        ));
        assert!(!reusable(&binding, &[resolved(RequestedProtocol::All, 8080)]));

        let mut joint = test_port_binding();
        let mut udp = test_binding_item(30000);
        udp.protocol = Protocol::UDP;
        joint.spec.items.push(udp);
        assert!(reusable(&joint, &[resolved(RequestedProtocol::All, 8080)]));
    }
}
