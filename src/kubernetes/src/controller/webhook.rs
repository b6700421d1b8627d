use actix_web::{http, HttpResponse};
use kube::{
    core::{
        admission::{AdmissionRequest, AdmissionResponse, Operation},
        response::StatusSummary,
        Status,
    },
    Client, Resource,
};

use super::component::Component;

pub mod allocation;
pub mod annotation;
pub mod node;
pub mod pod;
pub mod port_pool;

/// Shared by the admission handlers.
#[derive(Clone)]
pub struct WebhookState {
    pub component: Component,
    pub client: Client,
}

pub(crate) fn forbidden(mut resp: AdmissionResponse, reason: String) -> HttpResponse {
    resp.allowed = false;
    resp.result = Status {
        status: Some(StatusSummary::Failure),
        code: http::StatusCode::FORBIDDEN.as_u16(),
        message: "Forbidden by webhook".to_string(),
        reason,
        details: None,
    };
    HttpResponse::Ok().json(resp.into_review())
}

pub(crate) fn allowed(mut resp: AdmissionResponse) -> HttpResponse {
    resp.allowed = true;
    resp.result = Status {
        status: Some(StatusSummary::Success),
        code: http::StatusCode::OK.as_u16(),
        ..Default::default()
    };
    HttpResponse::Ok().json(resp.into_review())
}

pub(crate) fn invalid(msg: String) -> HttpResponse {
    HttpResponse::InternalServerError()
        .json(&AdmissionResponse::invalid(msg).into_review())
}

// Rejects bodies which are not json.
pub(crate) fn check_content_type(req: &actix_web::HttpRequest) -> Option<HttpResponse> {
    if let Some(content_type) = req.head().headers.get("content-type") {
        if content_type != "application/json" {
            let msg = format!("invalid content-type: {:?}", content_type);
            return Some(HttpResponse::BadRequest().json(msg));
        }
    }
    None
}

// Dry runs never reach storage, so nothing may be allocated for them.
pub(crate) fn allocates<K: Resource>(req: &AdmissionRequest<K>, operations: &[Operation]) -> bool {
    !req.dry_run && operations.contains(&req.operation)
}
