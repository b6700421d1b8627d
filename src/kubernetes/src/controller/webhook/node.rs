use actix_web::{
    web::{self, Data},
    HttpRequest, HttpResponse, Responder,
};
use k8s_openapi::api::core::v1::Node;
use kube::{
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    Api, ResourceExt,
};
use portd_allocator::protocol::Protocol;

use crate::{
    controller::error::Error,
    crd::port_binding::{PortBinding, BINDING_ITEMS_ANNOTATION, PORT_REQUEST_ANNOTATION},
};

use super::{
    allocation::{allocate, reusable, reuse, BoundItem, ResolvedRequest},
    allocates, allowed,
    annotation::{parse_port_requests, PortRef, PortRequest, RequestedProtocol},
    check_content_type, forbidden, invalid,
    pod::metadata_ops,
    WebhookState,
};

#[tracing::instrument(skip_all)]
pub async fn handle_mutation(
    req: HttpRequest,
    body: web::Json<AdmissionReview<Node>>,
    state: Data<WebhookState>,
) -> impl Responder {
    tracing::info!(method=?req.method(), uri=?req.uri(), "Call mutating webhook for Node");

    if let Some(res) = check_content_type(&req) {
        return res;
    }

    let admission_req: AdmissionRequest<Node> = match body.into_inner().try_into() {
        Ok(req) => req,
        Err(e) => {
            tracing::error!(error=?e, "Invalid request");
            return invalid(e.to_string());
        }
    };

    let resp = AdmissionResponse::from(&admission_req);

    if !allocates(&admission_req, &[Operation::Create, Operation::Update]) {
        tracing::info!(op=?admission_req.operation, dry_run = admission_req.dry_run, "Skip port allocation");
        return allowed(resp);
    }

    let node = match admission_req.object {
        Some(node) => node,
        None => return allowed(resp),
    };
    let value = match node.annotations().get(PORT_REQUEST_ANNOTATION) {
        Some(v) => v.clone(),
        None => return allowed(resp),
    };
    if node.annotations().contains_key(BINDING_ITEMS_ANNOTATION) {
        return allowed(resp);
    }

    match mutate_node(&state, &node, &value).await {
        Ok(patch) => match resp.clone().with_patch(patch) {
            Ok(res) => {
                tracing::info!(op=?admission_req.operation, name = node.name_any(), "Accepted by mutating webhook");
                HttpResponse::Ok().json(res.into_review())
            }
            Err(e) => forbidden(resp, Error::SerializePatch(e).to_string()),
        },
        Err(e) => {
            tracing::warn!(
                op=?admission_req.operation,
                name = node.name_any(),
                error = e.to_string(),
                "Denied by mutating webhook"
            );
            forbidden(resp, e.to_string())
        }
    }
}

async fn mutate_node(
    state: &WebhookState,
    node: &Node,
    value: &str,
) -> Result<json_patch::Patch, Error> {
    if !state.component.cache.is_ready() {
        return Err(Error::CacheNotReady);
    }
    let ns = &state.component.settings.node_binding_namespace;
    let requests = parse_port_requests(value, ns)?;
    let resolved = resolve_requests(&requests)?;

    let existing = Api::<PortBinding>::namespaced(state.client.clone(), ns)
        .get_opt(&node.name_any())
        .await
        .map_err(Error::Kube)?;

    let bound = {
        let mut cache = state.component.cache.lock().map_err(Error::Allocator)?;
        match existing.filter(|b| reusable(b, &resolved)) {
            Some(b) => reuse(&cache, &b),
            None => allocate(&mut cache, &resolved)?,
        }
    };
    node_patch(node, &bound)
}

/// Node ports are plain numbers served on the node address.
pub fn resolve_requests(requests: &[PortRequest]) -> Result<Vec<ResolvedRequest>, Error> {
    requests
        .iter()
        .map(|req| match &req.port {
            PortRef::Number(n) => Ok(ResolvedRequest {
                request: PortRequest {
                    host_port: true,
                    ..req.clone()
                },
                protocol: req
                    .protocol
                    .unwrap_or(RequestedProtocol::Single(Protocol::TCP)),
                rs_port: *n,
            }),
            PortRef::Name(name) => Err(Error::InvalidPortRequest(format!(
                "named port {name} is not supported on nodes"
            ))),
        })
        .collect()
}

pub fn node_patch(node: &Node, bound: &[BoundItem]) -> Result<json_patch::Patch, Error> {
    let items = bound.iter().map(|b| b.item.clone()).collect::<Vec<_>>();
    Ok(json_patch::Patch(metadata_ops(
        node.metadata.annotations.is_none(),
        node.metadata.labels.is_none(),
        serde_json::to_string(&items).map_err(Error::Serialization)?,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::reconciler::test_node;

    #[test]
    fn resolve_node_requests_as_host_ports() {
        let requests = parse_port_requests("p1 10250; p1 udp 4789", "kube-system").unwrap();
        let resolved = resolve_requests(&requests).unwrap();
        assert!(resolved.iter().all(|r| r.request.host_port));
        assert_eq!(resolved[0].protocol, RequestedProtocol::Single(Protocol::TCP));
        assert_eq!(resolved[1].rs_port, 4789);
        assert_eq!(resolved[1].protocol, RequestedProtocol::Single(Protocol::UDP));
    }

    #[test]
    fn reject_named_node_port() {
        let requests = parse_port_requests("p1 kubelet", "kube-system").unwrap();
        assert!(resolve_requests(&requests).is_err());
    }

    #[test]
    fn node_patch_touches_metadata_only() {
        let patch = serde_json::to_value(node_patch(&test_node(), &[]).unwrap()).unwrap();
        let paths = patch
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["path"].as_str().unwrap().to_string())
            .collect::<Vec<String>>();
        assert_eq!(
            paths,
            vec![
                "/metadata/annotations/portd.lbport.io~1binding-items".to_string(),
                "/metadata/labels".to_string(),
                "/metadata/labels/portd.lbport.io~1bound".to_string(),
            ]
        );
    }
}
