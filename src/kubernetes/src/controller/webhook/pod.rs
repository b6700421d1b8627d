use std::str::FromStr;

use actix_web::{
    web::{self, Data},
    HttpRequest, HttpResponse, Responder,
};
use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::{ContainerPort, EnvVar, Pod};
use kube::{
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    Api, ResourceExt,
};
use portd_allocator::protocol::Protocol;

use crate::{
    controller::error::Error,
    crd::port_binding::{
        PortBinding, BINDING_ITEMS_ANNOTATION, BINDING_READY_CONDITION, BOUND_LABEL,
        PORT_REQUEST_ANNOTATION,
    },
    util::escape_slash,
};

use super::{
    allocation::{allocate, reusable, reuse, BoundItem, ResolvedRequest},
    allocates, allowed,
    annotation::{env_name, parse_port_requests, PortRef, PortRequest, RequestedProtocol},
    check_content_type, forbidden, invalid, WebhookState,
};

#[tracing::instrument(skip_all)]
pub async fn handle_mutation(
    req: HttpRequest,
    body: web::Json<AdmissionReview<Pod>>,
    state: Data<WebhookState>,
) -> impl Responder {
    tracing::info!(method=?req.method(), uri=?req.uri(), "Call mutating webhook for Pod");

    if let Some(res) = check_content_type(&req) {
        return res;
    }

    let admission_req: AdmissionRequest<Pod> = match body.into_inner().try_into() {
        Ok(req) => req,
        Err(e) => {
            tracing::error!(error=?e, "Invalid request");
            return invalid(e.to_string());
        }
    };

    let resp = AdmissionResponse::from(&admission_req);

    // the pod spec is immutable after creation
    if !allocates(&admission_req, &[Operation::Create]) {
        tracing::info!(op=?admission_req.operation, dry_run = admission_req.dry_run, "Skip port allocation");
        return allowed(resp);
    }

    let pod = match admission_req.object {
        Some(pod) => pod,
        None => return allowed(resp),
    };
    let value = match pod.annotations().get(PORT_REQUEST_ANNOTATION) {
        Some(v) => v.clone(),
        None => return allowed(resp),
    };
    // allocated on creation already
    if pod.annotations().contains_key(BINDING_ITEMS_ANNOTATION) {
        return allowed(resp);
    }

    let ns = admission_req
        .namespace
        .clone()
        .or_else(|| pod.namespace())
        .unwrap_or_else(|| "default".to_string());
    let name = pod
        .metadata
        .name
        .clone()
        .or_else(|| pod.metadata.generate_name.clone())
        .unwrap_or_default();

    match mutate_pod(&state, &ns, &pod, &value).await {
        Ok(patch) => match resp.clone().with_patch(patch) {
            Ok(res) => {
                tracing::info!(
                    op=?admission_req.operation,
                    name = name,
                    namespace = ns,
                    "Accepted by mutating webhook"
                );
                HttpResponse::Ok().json(res.into_review())
            }
            Err(e) => {
                tracing::error!(error=?e, name = name, namespace = ns, "Failed to serialize patch");
                forbidden(resp, Error::SerializePatch(e).to_string())
            }
        },
        Err(e) => {
            tracing::warn!(
                op=?admission_req.operation,
                name = name,
                namespace = ns,
                error = e.to_string(),
                "Denied by mutating webhook"
            );
            forbidden(resp, e.to_string())
        }
    }
}

async fn mutate_pod(
    state: &WebhookState,
    ns: &str,
    pod: &Pod,
    value: &str,
) -> Result<json_patch::Patch, Error> {
    if !state.component.cache.is_ready() {
        return Err(Error::CacheNotReady);
    }
    let requests = parse_port_requests(value, ns)?;
    let resolved = resolve_requests(pod, &requests)?;

    // only pods with a stable name can find their previous binding
    let existing = match pod.metadata.name.as_ref() {
        Some(name) => Api::<PortBinding>::namespaced(state.client.clone(), ns)
            .get_opt(name)
            .await
            .map_err(Error::Kube)?,
        None => None,
    };

    let bound = {
        let mut cache = state.component.cache.lock().map_err(Error::Allocator)?;
        match existing.filter(|b| reusable(b, &resolved)) {
            Some(b) => {
                tracing::info!(binding = b.name_any(), namespace = ns, "Reuse PortBinding");
                reuse(&cache, &b)
            }
            None => allocate(&mut cache, &resolved)?,
        }
    };
    pod_patch(pod, &bound)
}

fn find_container_port<'a, P>(pod: &'a Pod, pred: P) -> Option<&'a ContainerPort>
where
    P: Fn(&ContainerPort) -> bool,
{
    pod.spec.as_ref()?.containers.iter().find_map(|c| {
        c.ports
            .as_ref()
            .and_then(|ports| ports.iter().find(|p| pred(p)))
    })
}

/// Binds each request to a container port of the pod.
pub fn resolve_requests(pod: &Pod, requests: &[PortRequest]) -> Result<Vec<ResolvedRequest>, Error> {
    requests
        .iter()
        .map(|req| {
            let port = match &req.port {
                PortRef::Name(name) => Some(
                    find_container_port(pod, |p| p.name.as_deref() == Some(name.as_str())).ok_or(
                        Error::InvalidPortRequest(format!("container port {name} is not found")),
                    )?,
                ),
                PortRef::Number(n) => find_container_port(pod, |p| p.container_port == *n as i32),
            };
            let container_port = match (&req.port, port) {
                (_, Some(p)) => p.container_port as u16,
                (PortRef::Number(n), None) => *n,
                (PortRef::Name(name), None) => {
                    return Err(Error::InvalidPortRequest(format!(
                        "container port {name} is not found"
                    )))
                }
            };
            let rs_port = if req.host_port {
                port.and_then(|p| p.host_port)
                    .map(|p| p as u16)
                    .unwrap_or(container_port)
            } else {
                container_port
            };
            let protocol = match req.protocol {
                Some(p) => p,
                None => RequestedProtocol::Single(
                    port.and_then(|p| p.protocol.as_deref())
                        .map(Protocol::from_str)
                        .transpose()
                        .map_err(Error::Allocator)?
                        .unwrap_or(Protocol::TCP),
                ),
            };
            Ok(ResolvedRequest {
                request: req.clone(),
                protocol,
                rs_port,
            })
        })
        .collect()
}

/// Env vars with the bound addresses, the readiness gate, the allocation
/// annotation and the bound label.
pub fn pod_patch(pod: &Pod, bound: &[BoundItem]) -> Result<json_patch::Patch, Error> {
    let mut ops = Vec::new();

    if let Some(spec) = pod.spec.as_ref() {
        let mut envs: Vec<(String, String)> = Vec::new();
        for b in bound.iter() {
            let name = env_name(&b.item.pool_name, b.item.rs_start_port, b.item.protocol);
            if !envs.iter().any(|(n, _)| *n == name) {
                envs.push((name, b.addresses()));
            }
        }
        if !envs.is_empty() {
            for (i, container) in spec.containers.iter().enumerate() {
                ops.append(&mut env_ops(i, container.env.as_deref(), &envs));
            }
        }

        let gate = serde_json::json!({ "conditionType": BINDING_READY_CONDITION });
        match spec.readiness_gates.as_ref() {
            None => ops.push(add("/spec/readinessGates".to_string(), serde_json::json!([gate]))),
            Some(gates) if !gates.iter().any(|g| g.condition_type == BINDING_READY_CONDITION) => {
                ops.push(add("/spec/readinessGates/-".to_string(), gate))
            }
            Some(_) => {}
        }
    }

    let items = bound.iter().map(|b| b.item.clone()).collect::<Vec<_>>();
    ops.append(&mut metadata_ops(
        pod.metadata.annotations.is_none(),
        pod.metadata.labels.is_none(),
        serde_json::to_string(&items).map_err(Error::Serialization)?,
    ));
    Ok(json_patch::Patch(ops))
}

// Existing entries with the same name are overwritten in place.
fn env_ops(index: usize, current: Option<&[EnvVar]>, envs: &[(String, String)]) -> Vec<PatchOperation> {
    let current = match current {
        Some(c) => c,
        None => {
            let values = envs
                .iter()
                .map(|(name, value)| serde_json::json!({"name": name, "value": value}))
                .collect::<Vec<serde_json::Value>>();
            return vec![add(format!("/spec/containers/{index}/env"), serde_json::json!(values))];
        }
    };
    let mut ops = Vec::new();
    for (name, value) in envs.iter() {
        let env = serde_json::json!({"name": name, "value": value});
        match current.iter().position(|e| e.name == *name) {
            Some(j) if current[j].value.as_deref() == Some(value.as_str())
                && current[j].value_from.is_none() => {}
            Some(j) => ops.push(PatchOperation::Replace(ReplaceOperation {
                path: format!("/spec/containers/{index}/env/{j}").into(),
                value: env,
            })),
            None => ops.push(add(format!("/spec/containers/{index}/env/-"), env)),
        }
    }
    ops
}

pub(super) fn metadata_ops(
    no_annotations: bool,
    no_labels: bool,
    items: String,
) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    if no_annotations {
        ops.push(add("/metadata/annotations".to_string(), serde_json::json!({})));
    }
    ops.push(add(
        format!("/metadata/annotations/{}", escape_slash(BINDING_ITEMS_ANNOTATION)),
        serde_json::Value::String(items),
    ));
    if no_labels {
        ops.push(add("/metadata/labels".to_string(), serde_json::json!({})));
    }
    ops.push(add(
        format!("/metadata/labels/{}", escape_slash(BOUND_LABEL)),
        serde_json::Value::String("true".to_string()),
    ));
    ops
}

fn add(path: String, value: serde_json::Value) -> PatchOperation {
    PatchOperation::Add(AddOperation {
        path: path.into(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use portd_allocator::pool_item::LoadBalancerEndpoint;

    use super::*;
    use crate::fixture::reconciler::{test_binding_item, test_pod, TEST_LB_ADDRESS, TEST_LB_ID};

    fn bound() -> Vec<BoundItem> {
        vec![BoundItem {
            item: test_binding_item(30000),
            load_balancers: vec![LoadBalancerEndpoint {
                id: TEST_LB_ID.to_string(),
                address: TEST_LB_ADDRESS.to_string(),
            }],
        }]
    }

    #[test]
    fn resolve_named_and_numbered_ports() {
        let pod = test_pod();
        let requests = parse_port_requests("p1 http; p1 udp 9000; p1 8080/hostport", "default").unwrap();
        let resolved = resolve_requests(&pod, &requests).unwrap();
        assert_eq!(resolved[0].rs_port, 8080);
        assert_eq!(resolved[0].protocol, RequestedProtocol::Single(Protocol::TCP));
        assert_eq!(resolved[1].rs_port, 9000);
        assert_eq!(resolved[1].protocol, RequestedProtocol::Single(Protocol::UDP));
        // no hostPort declared so the container port is used
        assert_eq!(resolved[2].rs_port, 8080);
        assert!(resolved[2].request.host_port);
    }

    #[test]
    fn reject_unknown_port_name() {
        let pod = test_pod();
        let requests = parse_port_requests("p1 grpc", "default").unwrap();
        assert!(resolve_requests(&pod, &requests).is_err());
    }

    #[test]
    fn works_pod_patch() {
        let pod = test_pod();
        let patch = pod_patch(&pod, &bound()).unwrap();
        let items = serde_json::to_string(&[test_binding_item(30000)]).unwrap();
        assert_json_eq!(
            serde_json::to_value(&patch).unwrap(),
            serde_json::json!([
                {"op": "add", "path": "/spec/containers/0/env", "value": [
                    {"name": "PORTD_P1_8080_TCP", "value": "203.0.113.1:30000"},
                ]},
                {"op": "add", "path": "/spec/readinessGates", "value": [
                    {"conditionType": BINDING_READY_CONDITION},
                ]},
                {"op": "add", "path": "/metadata/annotations/portd.lbport.io~1binding-items", "value": items},
                {"op": "add", "path": "/metadata/labels", "value": {}},
                {"op": "add", "path": "/metadata/labels/portd.lbport.io~1bound", "value": "true"},
            ])
        );
    }

    #[test]
    fn replace_stale_env() {
        let mut pod = test_pod();
        pod.spec.as_mut().unwrap().containers[0].env = Some(vec![
            EnvVar {
                name: "LOG_LEVEL".to_string(),
                value: Some("info".to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "PORTD_P1_8080_TCP".to_string(),
                value: Some("stale".to_string()),
                ..Default::default()
            },
        ]);
        let patch = serde_json::to_value(pod_patch(&pod, &bound()).unwrap()).unwrap();
        let env_patch = patch
            .as_array()
            .unwrap()
            .iter()
            .filter(|op| op["path"].as_str().unwrap().starts_with("/spec/containers/0/env"))
            .cloned()
            .collect::<Vec<serde_json::Value>>();
        assert_json_eq!(
            serde_json::json!(env_patch),
            serde_json::json!([
                {"op": "replace", "path": "/spec/containers/0/env/1", "value":
                    {"name": "PORTD_P1_8080_TCP", "value": "203.0.113.1:30000"}},
            ])
        );
    }

    #[test]
    fn keep_env_names_unique() {
        let mut pod = test_pod();
        pod.spec.as_mut().unwrap().containers[0].env = Some(vec![]);
        let mut items = bound();
        items.push(items[0].clone());
        let patch = serde_json::to_value(pod_patch(&pod, &items).unwrap()).unwrap();
        let adds = patch
            .as_array()
            .unwrap()
            .iter()
            .filter(|op| op["path"] == "/spec/containers/0/env/-")
            .count();
        assert_eq!(adds, 1);
    }
}
