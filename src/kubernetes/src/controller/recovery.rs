use kube::{api::ListParams, Api, Client, ResourceExt};

use portd_allocator::{
    manager::PortPoolCacheInner,
    pool_item::{ItemPhase, ItemStatus},
};

use crate::{
    crd::{port_binding::PortBinding, port_pool::PortPool},
    retry::{retry_with_backoff_if, RetryConfig},
};

use super::{component::Component, error::Error};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub items: usize,
    pub slots: usize,
    // slots recorded in bindings that no pool item covers
    pub missing_slots: usize,
    // items the allocator refused, left out of the cache
    pub invalid_items: usize,
}

/// Materializes pool items and marks every bound slot as used.
///
/// Items already removed from a pool spec but still `Deleting` in its status
/// are restored too, so their bindings keep holding their ports.
pub fn rebuild(
    cache: &mut PortPoolCacheInner,
    pools: &[PortPool],
    bindings: &[PortBinding],
    default_region: &str,
) -> Result<RecoveryReport, Error> {
    let mut report = RecoveryReport::default();

    for pool in pools.iter() {
        let pool_key = pool.pool_key();
        let statuses = pool
            .status
            .as_ref()
            .map(|s| s.items.as_slice())
            .unwrap_or_default();

        for item in pool.spec.items.iter() {
            let status = statuses
                .iter()
                .find(|s| s.name == item.name)
                .map(|s| s.item_status())
                .unwrap_or_else(|| ItemStatus {
                    phase: ItemPhase::Active,
                    region: item
                        .region
                        .clone()
                        .unwrap_or_else(|| default_region.to_string()),
                    load_balancers: Vec::new(),
                });
            match cache.add_pool_item(&pool_key, item.policy(), status) {
                Ok(_) => report.items += 1,
                Err(e) => {
                    tracing::error!(error=?e, pool = pool_key, item = item.name, "Failed to restore pool item");
                    report.invalid_items += 1;
                }
            }
        }

        for status in statuses
            .iter()
            .filter(|s| !pool.spec.items.iter().any(|i| i.name == s.name))
        {
            let mut item_status = status.item_status();
            item_status.phase = ItemPhase::Deleting;
            match cache.add_pool_item(&pool_key, status.policy(), item_status) {
                Ok(_) => report.items += 1,
                Err(e) => {
                    tracing::error!(error=?e, pool = pool_key, item = status.name, "Failed to restore deleting pool item");
                    report.invalid_items += 1;
                }
            }
        }
    }

    for binding in bindings.iter() {
        let reference = binding.spec.consumer.reference();
        for item in binding.spec.items.iter() {
            if cache.set_port_binding_used(&item.slot_key(), Some(reference.clone())) {
                report.slots += 1;
            } else {
                tracing::warn!(
                    binding = binding.name_any(),
                    item = item.to_string(),
                    "Bound slot has no pool item"
                );
                report.missing_slots += 1;
            }
        }
    }

    Ok(report)
}

/// Rebuilds the port pool cache from the API server and marks it ready.
#[tracing::instrument(skip_all)]
pub async fn recover(client: Client, component: &Component) -> Result<RecoveryReport, Error> {
    let retry = RetryConfig::default();

    let pool_api = &Api::<PortPool>::all(client.clone());
    let pools = retry_with_backoff_if(
        &retry,
        "list PortPools",
        |_: &kube::Error| true,
        move || async move { pool_api.list(&ListParams::default()).await },
    )
    .await
    .map_err(Error::Kube)?;

    let binding_api = &Api::<PortBinding>::all(client.clone());
    let bindings = retry_with_backoff_if(
        &retry,
        "list PortBindings",
        |_: &kube::Error| true,
        move || async move { binding_api.list(&ListParams::default()).await },
    )
    .await
    .map_err(Error::Kube)?;

    let report = {
        let mut cache = component.cache.lock().map_err(Error::Allocator)?;
        rebuild(
            &mut cache,
            &pools.items,
            &bindings.items,
            &component.settings.region,
        )?
    };
    component.cache.mark_ready();

    tracing::info!(
        pools = pools.items.len(),
        items = report.items,
        slots = report.slots,
        missing_slots = report.missing_slots,
        invalid_items = report.invalid_items,
        "Recovered port pool cache"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use portd_allocator::protocol::Protocol;

    use super::*;
    use crate::{
        crd::port_pool::PoolItemPhase,
        fixture::reconciler::{
            test_binding_item, test_component, test_port_binding, test_port_pool,
            test_port_pool_with_status,
        },
    };

    #[test]
    fn rebuild_marks_bound_slots() {
        let (component, _) = test_component();
        let mut other = test_port_binding();
        other.metadata.name = Some("pod-1".to_string());
        other.spec.items = vec![test_binding_item(30002), test_binding_item(40000)];

        let mut cache = component.cache.lock().unwrap();
        let report = rebuild(
            &mut cache,
            &[test_port_pool_with_status()],
            &[test_port_binding(), other],
            "default",
        )
        .unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                items: 1,
                slots: 2,
                missing_slots: 1,
                invalid_items: 0,
            }
        );

        // first-fit skips the recovered slots
        let allocated = cache
            .allocate_port_binding("p1/default", Protocol::TCP, None)
            .unwrap();
        assert_eq!(allocated.slot.start_port, 30001);
        let allocated = cache
            .allocate_port_binding("p1/default", Protocol::TCP, None)
            .unwrap();
        assert_eq!(allocated.slot.start_port, 30003);
    }

    #[test]
    fn rebuild_restores_deleting_items() {
        let (component, _) = test_component();
        let mut pool = test_port_pool_with_status();
        let mut removed = pool.status.as_ref().unwrap().items[0].clone();
        removed.name = "it0".to_string();
        removed.phase = PoolItemPhase::Active;
        removed.start_port = 31000;
        removed.end_port = 31010;
        pool.status.as_mut().unwrap().items.push(removed);

        let mut cache = component.cache.lock().unwrap();
        rebuild(&mut cache, &[pool], &[], "default").unwrap();

        assert!(cache
            .get_item("p1/default", "it0")
            .unwrap()
            .status()
            .is_deleting());
        assert!(cache
            .allocate_port_binding("p1/default", Protocol::TCP, Some("it0"))
            .is_err());
    }

    #[test]
    fn rebuild_without_status_uses_default_region() {
        let (component, _) = test_component();
        let mut cache = component.cache.lock().unwrap();
        rebuild(&mut cache, &[test_port_pool()], &[], "ap-1").unwrap();

        let item = cache.get_item("p1/default", "it1").unwrap();
        assert_eq!(item.status().region, "ap-1");
        assert!(item.status().load_balancers.is_empty());
    }

    #[test]
    fn rebuild_skips_item_shorter_than_segment() {
        let (component, _) = test_component();
        let mut bad = test_port_pool();
        bad.metadata.name = Some("bad".to_string());
        bad.spec.items[0].start_port = 40000;
        bad.spec.items[0].end_port = 40003;
        bad.spec.items[0].segment_length = Some(5);

        let mut cache = component.cache.lock().unwrap();
        let report = rebuild(&mut cache, &[bad, test_port_pool()], &[], "default").unwrap();
        assert_eq!(report.items, 1);
        assert_eq!(report.invalid_items, 1);
        assert!(cache.get_item("bad/default", "it1").is_none());
        assert!(cache.get_item("p1/default", "it1").is_some());
    }
}
