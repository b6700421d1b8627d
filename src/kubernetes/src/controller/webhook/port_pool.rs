use std::collections::HashSet;

use actix_web::{
    web::{self, Data},
    HttpRequest, Responder,
};
use kube::{
    api::ListParams,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    Api, ResourceExt,
};

use crate::crd::port_pool::{PoolItemPhase, PortPool, PortPoolItem};

use super::{allowed, check_content_type, forbidden, invalid, WebhookState};

#[tracing::instrument(skip_all)]
pub async fn handle_validation(
    req: HttpRequest,
    body: web::Json<AdmissionReview<PortPool>>,
    state: Data<WebhookState>,
) -> impl Responder {
    tracing::info!(method=?req.method(), uri=?req.uri(), "Call validating webhook for PortPool");

    if let Some(res) = check_content_type(&req) {
        return res;
    }

    let admission_req: AdmissionRequest<PortPool> = match body.into_inner().try_into() {
        Ok(req) => req,
        Err(e) => {
            tracing::error!(error=?e, "Invalid request");
            return invalid(e.to_string());
        }
    };

    let resp = AdmissionResponse::from(&admission_req);

    let pool = match admission_req.object.as_ref() {
        Some(pool) => pool,
        None => return allowed(resp),
    };

    if let Err(reason) = validate_items(&pool.spec.items) {
        tracing::warn!(name = pool.name_any(), reason, "Invalid PortPool");
        return forbidden(resp, reason);
    }
    if let Some(old) = admission_req.old_object.as_ref() {
        if let Err(reason) = validate_update(&old.spec.items, &pool.spec.items) {
            tracing::warn!(name = pool.name_any(), reason, "Invalid PortPool update");
            return forbidden(resp, reason);
        }
        if let Err(reason) = validate_draining(&pool.spec.items, old) {
            tracing::warn!(name = pool.name_any(), reason, "PortPool overlaps a draining item");
            return forbidden(resp, reason);
        }
    }

    let pools = match Api::<PortPool>::all(state.client.clone())
        .list(&ListParams::default())
        .await
    {
        Ok(list) => list.items,
        Err(e) => {
            tracing::error!("CRD is not queryable; {e:?}. Is the CRD installed?");
            return invalid(e.to_string());
        }
    };
    let ns = admission_req
        .namespace
        .clone()
        .or_else(|| pool.namespace())
        .unwrap_or_default();
    let others = pools
        .iter()
        .filter(|p| !(p.name_any() == pool.name_any() && p.namespace().unwrap_or_default() == ns))
        .collect::<Vec<&PortPool>>();
    if let Err(reason) = validate_overlap(&pool.spec.items, &others) {
        tracing::warn!(name = pool.name_any(), reason, "PortPool overlaps another one");
        return forbidden(resp, reason);
    }

    allowed(resp)
}

fn overlaps(a: &PortPoolItem, b: &PortPoolItem) -> Option<String> {
    if a.start_port > b.end_port || b.start_port > a.end_port {
        return None;
    }
    a.load_balancer_ids
        .iter()
        .find(|id| b.load_balancer_ids.contains(id))
        .cloned()
}

// Items left in status after removal from the spec still hold their ports
// until every binding is released.
fn draining_items(pool: &PortPool) -> Vec<PortPoolItem> {
    let statuses = match pool.status.as_ref() {
        Some(status) => status.items.as_slice(),
        None => return Vec::new(),
    };
    statuses
        .iter()
        .filter(|s| {
            s.phase == PoolItemPhase::Deleting
                || !pool.spec.items.iter().any(|i| i.name == s.name)
        })
        .map(|s| PortPoolItem {
            name: s.name.clone(),
            start_port: s.start_port,
            end_port: s.end_port,
            segment_length: s.segment_length,
            protocols: s.protocols.clone(),
            region: Some(s.region.clone()),
            load_balancer_ids: s.load_balancers.iter().map(|lb| lb.id.clone()).collect(),
        })
        .collect()
}

pub fn validate_items(items: &[PortPoolItem]) -> Result<(), String> {
    let mut names = HashSet::new();
    for item in items.iter() {
        if !names.insert(item.name.as_str()) {
            return Err(format!("item {} is duplicated", item.name));
        }
        if item.start_port == 0 || item.start_port > item.end_port {
            return Err(format!(
                "item {}: invalid port range {}-{}",
                item.name, item.start_port, item.end_port
            ));
        }
        if item.segment_length == Some(0) {
            return Err(format!("item {}: segment length must be positive", item.name));
        }
        if (item.end_port - item.start_port) as u32 + 1 < item.segment_length() as u32 {
            return Err(format!(
                "item {}: port range {}-{} is shorter than segment length {}",
                item.name,
                item.start_port,
                item.end_port,
                item.segment_length()
            ));
        }
        if item.protocols.is_empty() {
            return Err(format!("item {}: no protocol", item.name));
        }
        let protocols = item.protocols.iter().collect::<HashSet<_>>();
        if protocols.len() != item.protocols.len() {
            return Err(format!("item {}: duplicated protocol", item.name));
        }
        if item.load_balancer_ids.is_empty() {
            return Err(format!("item {}: no load balancer", item.name));
        }
    }
    for (i, a) in items.iter().enumerate() {
        for b in items.iter().skip(i + 1) {
            if let Some(lb) = overlaps(a, b) {
                return Err(format!(
                    "items {} and {} overlap on load balancer {lb}",
                    a.name, b.name
                ));
            }
        }
    }
    Ok(())
}

pub fn validate_overlap(items: &[PortPoolItem], others: &[&PortPool]) -> Result<(), String> {
    for item in items.iter() {
        for other in others.iter() {
            let draining = draining_items(other);
            for o in other.spec.items.iter().chain(draining.iter()) {
                if let Some(lb) = overlaps(item, o) {
                    return Err(format!(
                        "item {} overlaps {}/{} item {} on load balancer {lb}",
                        item.name,
                        other.namespace().unwrap_or_default(),
                        other.name_any(),
                        o.name
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Rejects items that reuse the ports of an item this pool is still draining.
pub fn validate_draining(items: &[PortPoolItem], current: &PortPool) -> Result<(), String> {
    for d in draining_items(current).iter() {
        for item in items.iter().filter(|i| i.name != d.name) {
            if let Some(lb) = overlaps(item, d) {
                return Err(format!(
                    "item {} overlaps draining item {} on load balancer {lb}",
                    item.name, d.name
                ));
            }
        }
    }
    Ok(())
}

pub fn validate_update(old: &[PortPoolItem], new: &[PortPoolItem]) -> Result<(), String> {
    for item in new.iter() {
        let prev = match old.iter().find(|o| o.name == item.name) {
            Some(p) => p,
            None => continue,
        };
        if prev.start_port != item.start_port {
            return Err(format!("item {}: start port is immutable", item.name));
        }
        if prev.segment_length() != item.segment_length() {
            return Err(format!("item {}: segment length is immutable", item.name));
        }
        let prev_protocols = prev.protocols.iter().collect::<HashSet<_>>();
        let protocols = item.protocols.iter().collect::<HashSet<_>>();
        if prev_protocols != protocols {
            return Err(format!("item {}: protocols are immutable", item.name));
        }
        if item.end_port < prev.end_port {
            return Err(format!(
                "item {}: end port must not decrease ({} -> {})",
                item.name, prev.end_port, item.end_port
            ));
        }
    }
    Ok(())
}
