pub mod reconciler {
    use std::collections::BTreeMap;

    use http::{Request, Response};
    use hyper::Body;
    use k8s_openapi::api::core::v1::{
        Container, ContainerPort, Node, NodeAddress, NodeStatus, Pod, PodSpec, PodStatus,
    };
    use kube::{core::ObjectMeta, discovery::ApiResource, Resource, ResourceExt};
    use serde::Serialize;

    use portd_allocator::{manager::PortPoolCache, protocol::Protocol};
    use portd_cloud::{client::LoadBalanceObject, fake::FakeClient};

    use crate::controller::component::{Component, Settings};

    use crate::crd::{
        listener::{
            listener_name, Listener, ListenerMeta, ListenerPhase, ListenerSpec, ListenerStatus,
            ListenerTarget, LISTENER_FINALIZER,
        },
        port_binding::{
            Consumer, ConsumerKind, PortBinding, PortBindingItem, PortBindingSpec,
            BINDING_ITEMS_ANNOTATION, BOUND_LABEL, PORT_BINDING_FINALIZER,
            PORT_REQUEST_ANNOTATION,
        },
        port_pool::{
            LoadBalancerAddress, PoolItemPhase, PortPool, PortPoolItem, PortPoolItemStatus,
            PortPoolSpec, PortPoolStatus, PORT_POOL_FINALIZER,
        },
        GROUP,
    };

    pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
    pub struct ApiServerVerifier(pub ApiServerHandle);

    pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    fn base_uri<T: Resource<DynamicType = ()>>() -> String {
        let api_resource = ApiResource::erase::<T>(&());
        if api_resource.group.eq(GROUP) {
            format!("/apis/{}", api_resource.api_version)
        } else {
            format!("/api/{}", api_resource.api_version)
        }
    }

    fn collection_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        let api_resource = ApiResource::erase::<T>(&());
        match res.namespace() {
            Some(ns) => format!(
                "{}/namespaces/{}/{}",
                base_uri::<T>(),
                ns,
                api_resource.plural
            ),
            None => format!("{}/{}", base_uri::<T>(), api_resource.plural),
        }
    }

    pub fn get_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}/{}", collection_uri(res), res.name_any())
    }

    pub fn post_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}?", collection_uri(res))
    }

    pub fn put_uri<T: Resource<DynamicType = ()>>(res: &T, subresource: Option<&str>) -> String {
        let sub = match subresource {
            Some(s) => format!("/{s}"),
            None => String::new(),
        };
        format!("{}{}?", get_uri(res), sub)
    }

    pub fn list_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}?", collection_uri(res))
    }

    pub fn patch_uri<T: Resource<DynamicType = ()>>(res: &T, subresource: Option<&str>) -> String {
        put_uri(res, subresource)
    }

    pub fn delete_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}?", get_uri(res))
    }

    pub fn assert_resource_request<T: Resource<DynamicType = ()>>(
        request: &Request<Body>,
        res: &T,
        subresource: Option<&str>,
        list: bool,
        label_selector: Option<String>,
        method: http::Method,
    ) {
        assert_eq!(request.method(), method);
        let uri = match method {
            http::Method::GET => {
                if list {
                    list_uri(res)
                } else {
                    get_uri(res)
                }
            }
            http::Method::POST => post_uri(res),
            http::Method::PUT => put_uri(res, subresource),
            http::Method::PATCH => patch_uri(res, subresource),
            http::Method::DELETE => delete_uri(res),
            _ => panic!("unimplemented method"),
        };
        let uri = if let Some(selector) = label_selector {
            format!("{uri}{}", selector)
        } else {
            uri
        };
        assert_eq!(request.uri().to_string(), uri);
    }

    pub fn api_server_response_not_found<T: Resource<DynamicType = ()>>(res: &T) -> String {
        let api_resource = ApiResource::erase::<T>(&());
        let (group_kind, details) = if api_resource.group.eq(GROUP) {
            (
                format!("{}.{}", api_resource.plural, api_resource.group),
                format!(r#""group": "{}","#, api_resource.group),
            )
        } else {
            (api_resource.plural.clone(), String::new())
        };
        format!(
            r#"{{
  "kind": "Status",
  "apiVersion": "v1",
  "metadata": {{}},
  "status": "Failure",
  "message": "{} \"{}\" not found",
  "reason": "NotFound",
  "details": {{
    "name": "{}",
    {}
    "kind": "{}"
  }},
  "code": 404
}}"#,
            group_kind,
            res.name_any(),
            res.name_any(),
            details,
            api_resource.plural,
        )
    }

    pub fn api_server_response_conflict<T: Resource<DynamicType = ()>>(res: &T) -> String {
        let api_resource = ApiResource::erase::<T>(&());
        format!(
            r#"{{
  "kind": "Status",
  "apiVersion": "v1",
  "metadata": {{}},
  "status": "Failure",
  "message": "Operation cannot be fulfilled on {} \"{}\": the object has been modified",
  "reason": "Conflict",
  "code": 409
}}"#,
            api_resource.plural,
            res.name_any(),
        )
    }

    pub fn api_server_response_resource<T: Resource<DynamicType = ()> + Serialize>(
        res: &T,
    ) -> Vec<u8> {
        serde_json::to_vec(res).unwrap()
    }

    pub fn api_server_response_list<T: Resource<DynamicType = ()> + Serialize>(
        items: &[T],
    ) -> Vec<u8> {
        let api_resource = ApiResource::erase::<T>(&());
        serde_json::to_vec(&serde_json::json!({
            "apiVersion": api_resource.api_version,
            "kind": format!("{}List", api_resource.kind),
            "metadata": {},
            "items": items,
        }))
        .unwrap()
    }

    pub const TEST_NAMESPACE: &str = "default";
    pub const TEST_LB_ID: &str = "lb-1";
    pub const TEST_LB_ADDRESS: &str = "203.0.113.1";
    pub const TEST_POD_IP: &str = "10.1.0.5";

    // A component whose fake provider knows the test load balancer.
    pub fn test_component() -> (Component, FakeClient) {
        let cloud = FakeClient::new();
        cloud
            .add_load_balancer(LoadBalanceObject {
                id: TEST_LB_ID.to_string(),
                name: TEST_LB_ID.to_string(),
                region: "default".to_string(),
                address: TEST_LB_ADDRESS.to_string(),
                ..Default::default()
            })
            .unwrap();
        let component = Component::new(
            PortPoolCache::new(),
            std::sync::Arc::new(cloud.clone()),
            Settings::default(),
        );
        (component, cloud)
    }

    pub fn test_port_pool_item() -> PortPoolItem {
        PortPoolItem {
            name: "it1".to_string(),
            start_port: 30000,
            end_port: 30010,
            segment_length: None,
            protocols: vec![Protocol::TCP],
            region: None,
            load_balancer_ids: vec![TEST_LB_ID.to_string()],
        }
    }

    pub fn test_port_pool() -> PortPool {
        PortPool {
            metadata: ObjectMeta {
                name: Some("p1".to_string()),
                namespace: Some(TEST_NAMESPACE.to_string()),
                finalizers: Some(vec![PORT_POOL_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: PortPoolSpec {
                items: vec![test_port_pool_item()],
            },
            status: None,
        }
    }

    pub fn test_port_pool_item_status(item: &PortPoolItem) -> PortPoolItemStatus {
        PortPoolItemStatus {
            name: item.name.clone(),
            phase: PoolItemPhase::Active,
            start_port: item.start_port,
            end_port: item.end_port,
            segment_length: item.segment_length,
            protocols: item.protocols.clone(),
            region: "default".to_string(),
            load_balancers: item
                .load_balancer_ids
                .iter()
                .map(|id| LoadBalancerAddress {
                    id: id.clone(),
                    address: TEST_LB_ADDRESS.to_string(),
                })
                .collect(),
            message: None,
        }
    }

    pub fn test_port_pool_with_status() -> PortPool {
        let mut pool = test_port_pool();
        pool.status = Some(PortPoolStatus {
            items: pool.spec.items.iter().map(test_port_pool_item_status).collect(),
        });
        pool
    }

    pub fn test_binding_item(start_port: u16) -> PortBindingItem {
        PortBindingItem {
            pool_name: "p1".to_string(),
            pool_namespace: TEST_NAMESPACE.to_string(),
            pool_item_name: "it1".to_string(),
            protocol: Protocol::TCP,
            start_port,
            end_port: 0,
            rs_start_port: 8080,
            host_port: false,
        }
    }

    pub fn test_port_binding() -> PortBinding {
        PortBinding {
            metadata: ObjectMeta {
                name: Some("pod-0".to_string()),
                namespace: Some(TEST_NAMESPACE.to_string()),
                finalizers: Some(vec![PORT_BINDING_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: PortBindingSpec {
                consumer: Consumer {
                    kind: ConsumerKind::Pod,
                    name: "pod-0".to_string(),
                    namespace: Some(TEST_NAMESPACE.to_string()),
                    uid: Some("uid-0".to_string()),
                },
                items: vec![test_binding_item(30000)],
                keep_duration_seconds: None,
            },
            status: None,
        }
    }

    pub fn test_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("pod-0".to_string()),
                namespace: Some(TEST_NAMESPACE.to_string()),
                uid: Some("uid-0".to_string()),
                annotations: Some(BTreeMap::from([(
                    PORT_REQUEST_ANNOTATION.to_string(),
                    "p1 http".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ports: Some(vec![ContainerPort {
                        name: Some("http".to_string()),
                        container_port: 8080,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some(TEST_POD_IP.to_string()),
                host_ip: Some("192.168.0.2".to_string()),
                ..Default::default()
            }),
        }
    }

    // A pod admitted by the webhook with the given allocation.
    pub fn test_bound_pod(items: &[PortBindingItem]) -> Pod {
        let mut pod = test_pod();
        pod.annotations_mut().insert(
            BINDING_ITEMS_ANNOTATION.to_string(),
            serde_json::to_string(items).unwrap(),
        );
        pod.labels_mut()
            .insert(BOUND_LABEL.to_string(), "true".to_string());
        pod
    }

    pub fn test_node() -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-1".to_string()),
                uid: Some("node-uid-1".to_string()),
                annotations: Some(BTreeMap::from([(
                    PORT_REQUEST_ANNOTATION.to_string(),
                    "p1.default 10250".to_string(),
                )])),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    address: "192.168.0.10".to_string(),
                    type_: "InternalIP".to_string(),
                }]),
                ..Default::default()
            }),
        }
    }

    pub fn test_listener(
        item: &PortBindingItem,
        targets: Vec<ListenerTarget>,
        phase: Option<ListenerPhase>,
    ) -> Listener {
        let mut listener = Listener {
            metadata: ObjectMeta {
                name: Some(listener_name(
                    &item.pool_name,
                    &item.pool_item_name,
                    TEST_LB_ID,
                    item.protocol,
                    item.start_port,
                )),
                namespace: Some(item.pool_namespace.clone()),
                labels: Some(
                    ListenerMeta::for_pool_item(&item.pool_name, &item.pool_item_name)
                        .to_labels(),
                ),
                finalizers: Some(vec![LISTENER_FINALIZER.to_string()]),
                generation: Some(1),
                ..Default::default()
            },
            spec: ListenerSpec {
                region: "default".to_string(),
                load_balancer_id: TEST_LB_ID.to_string(),
                protocol: item.protocol,
                port: item.start_port,
                end_port: item.end_port,
                targets,
            },
            status: None,
        };
        listener.status = phase.map(|phase| ListenerStatus {
            phase,
            listener_id: Some("lsn-00000001".to_string()),
            observed_generation: Some(1),
            message: None,
        });
        listener
    }

    pub fn test_target() -> ListenerTarget {
        ListenerTarget {
            ip: TEST_POD_IP.to_string(),
            port: 8080,
            weight: 100,
        }
    }
}

pub async fn test_trace() {
    portd_trace::init::prepare_tracing(portd_trace::init::TraceConfig {
        level: "info".to_string(),
        format: String::new(),
        file: None,
    })
    .await;
}
