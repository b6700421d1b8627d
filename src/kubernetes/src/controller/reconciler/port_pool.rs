use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::StreamExt;
use kube::{
    api::{DeleteParams, ListParams},
    runtime::{
        controller::{Action, Controller},
        events::EventType,
        finalizer::{finalizer, Event},
        watcher::Config,
    },
    Api, Client, ResourceExt,
};

use portd_allocator::pool_item::{ItemPhase, ItemStatus};
use portd_cloud::client::ProtocolLayer;

use crate::{
    context::{error_policy, publish_event, ContextWith, Ctx, State},
    controller::{component::Component, error::Error, metrics::Metrics},
    crd::{
        listener::{Listener, ListenerMeta},
        port_binding::PortBinding,
        port_pool::{
            LoadBalancerAddress, PoolItemPhase, PortPool, PortPoolItem, PortPoolItemStatus,
            PortPoolStatus, PORT_POOL_FINALIZER,
        },
    },
    util::get_namespace,
};

use super::update_status;

const DELETING_REQUEUE_SECS: u64 = 5;

#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler(pool: Arc<PortPool>, ctx: Arc<ContextWith<Component>>) -> Result<Action, Error> {
    portd_trace::telemetry::record_trace_id();

    let ns = get_namespace::<PortPool>(&pool).map_err(Error::KubeLibrary)?;
    let pools = Api::<PortPool>::namespaced(ctx.client().clone(), &ns);

    let metrics = ctx.metrics();
    let _timer = {
        let m = metrics.lock().map_err(|_| Error::FailedToGetLock)?;
        m.reconciliation(pool.as_ref());
        m.measure(pool.as_ref())
    };

    finalizer(&pools, PORT_POOL_FINALIZER, pool, |event| async {
        match event {
            Event::Apply(pool) => reconcile(&pools, &pool, ctx.clone()).await,
            Event::Cleanup(pool) => cleanup(&pools, &pool, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

#[tracing::instrument(skip_all)]
async fn reconcile(
    api: &Api<PortPool>,
    pool: &PortPool,
    ctx: Arc<ContextWith<Component>>,
) -> Result<Action, Error> {
    let ns = get_namespace::<PortPool>(pool).map_err(Error::KubeLibrary)?;
    tracing::info!(name = pool.name_any(), namespace = ns, "Reconcile PortPool");

    let mut statuses = Vec::new();
    let mut unresolved = false;
    for item in pool.spec.items.iter() {
        let (status, ok) = sync_item(pool, item, ctx.clone()).await?;
        unresolved |= !ok;
        statuses.push(status);
    }

    let spec_names = pool
        .spec
        .items
        .iter()
        .map(|i| i.name.clone())
        .collect::<BTreeSet<String>>();
    let (mut deleting, remaining) = retire_items(pool, &spec_names, ctx.clone()).await?;
    statuses.append(&mut deleting);

    write_status(api, pool, statuses, &ctx).await?;

    if remaining || unresolved {
        return Ok(Action::requeue(Duration::from_secs(DELETING_REQUEUE_SECS)));
    }
    Ok(Action::requeue(Duration::from_secs(ctx.interval())))
}

#[tracing::instrument(skip_all)]
async fn cleanup(
    api: &Api<PortPool>,
    pool: &PortPool,
    ctx: Arc<ContextWith<Component>>,
) -> Result<Action, Error> {
    let ns = get_namespace::<PortPool>(pool).map_err(Error::KubeLibrary)?;
    tracing::info!(name = pool.name_any(), namespace = ns, "Cleanup PortPool");

    let (statuses, remaining) = retire_items(pool, &BTreeSet::new(), ctx.clone()).await?;
    if !remaining {
        tracing::info!(name = pool.name_any(), namespace = ns, "All pool items are evicted");
        return Ok(Action::await_change());
    }

    let names = statuses
        .iter()
        .map(|s| s.name.clone())
        .collect::<Vec<String>>()
        .join(",");
    write_status(api, pool, statuses, &ctx).await?;
    Err(Error::PoolItemsRemain(names))
}

// Materializes one spec item in the cache. The flag is false when its load
// balancers could not be resolved.
async fn sync_item(
    pool: &PortPool,
    item: &PortPoolItem,
    ctx: Arc<ContextWith<Component>>,
) -> Result<(PortPoolItemStatus, bool), Error> {
    let component = &ctx.component;
    let pool_key = pool.pool_key();
    let ns = pool.namespace().unwrap_or_default();
    let region = item
        .region
        .clone()
        .unwrap_or_else(|| component.settings.region.clone());
    let prev = pool
        .status
        .as_ref()
        .and_then(|s| s.items.iter().find(|i| i.name == item.name))
        .cloned();

    let (load_balancers, message) = match resolve_load_balancers(&ctx, pool, &region, &ns, item).await {
        Ok(lbs) => (lbs, None),
        Err(e) => {
            tracing::warn!(
                pool = pool_key,
                item = item.name,
                error=?e,
                "Failed to resolve load balancers"
            );
            let lbs = prev.as_ref().map(|p| p.load_balancers.clone()).unwrap_or_default();
            (lbs, Some(e.to_string()))
        }
    };
    let resolved = message.is_none();

    let mut status = PortPoolItemStatus {
        name: item.name.clone(),
        phase: PoolItemPhase::Active,
        start_port: item.start_port,
        end_port: item.end_port,
        segment_length: item.segment_length,
        protocols: item.protocols.clone(),
        region: region.clone(),
        load_balancers,
        message,
    };

    // an item without any known address can not serve bindings yet
    if status.load_balancers.is_empty() && !item.load_balancer_ids.is_empty() {
        return Ok((status, false));
    }

    let item_status = status.item_status();
    let mut cache = component.cache.lock().map_err(Error::Allocator)?;
    let existing = cache
        .get_item(&pool_key, &item.name)
        .map(|i| (i.policy().end_port, i.status().clone()));
    match existing {
        None => {
            cache
                .add_pool_item(&pool_key, item.policy(), item_status)
                .map_err(Error::Allocator)?;
        }
        Some((end_port, current)) => {
            if item.end_port > end_port {
                tracing::info!(
                    pool = pool_key,
                    item = item.name,
                    end_port = item.end_port,
                    "Increase end port"
                );
                cache
                    .increase_end_port(&pool_key, &item.name, item.end_port)
                    .map_err(Error::Allocator)?;
            } else if item.end_port < end_port {
                tracing::warn!(
                    pool = pool_key,
                    item = item.name,
                    current = end_port,
                    requested = item.end_port,
                    "End port can not be decreased"
                );
                status.end_port = end_port;
                status.message = Some(format!("end port can not be decreased from {end_port}"));
            }
            if current != item_status {
                cache
                    .update_item_status(&pool_key, &item.name, item_status)
                    .map_err(Error::Allocator)?;
            }
        }
    }

    if let Some(cached) = cache.get_item(&pool_key, &item.name) {
        let metrics = ctx.metrics();
        let m = metrics.lock().map_err(|_| Error::FailedToGetLock)?;
        for list in cached.port_lists().iter() {
            m.ports_set(
                &pool_key,
                &item.name,
                &list.protocol().to_string(),
                list.allocated_port_num() as i64,
                list.available_port_num() as i64,
            );
        }
    }

    Ok((status, resolved))
}

async fn resolve_load_balancers(
    ctx: &Arc<ContextWith<Component>>,
    pool: &PortPool,
    region: &str,
    namespace: &str,
    item: &PortPoolItem,
) -> Result<Vec<LoadBalancerAddress>, Error> {
    let component = &ctx.component;
    let mut res = Vec::with_capacity(item.load_balancer_ids.len());
    for id in item.load_balancer_ids.iter() {
        let fut = if component.cloud.is_namespaced() {
            component.cloud.describe_load_balancer_with_namespace(
                region,
                namespace,
                id,
                ProtocolLayer::L4,
            )
        } else {
            component
                .cloud
                .describe_load_balancer(region, id, ProtocolLayer::L4)
        };
        let lb = match tokio::time::timeout(component.settings.cloud_timeout, fut).await {
            Ok(res) => res.map_err(Error::Cloud)?,
            Err(_) => {
                if let Ok(m) = ctx.metrics().lock() {
                    m.cloud_timeout_inc(id, "describe");
                }
                publish_event(
                    ctx.as_ref(),
                    pool,
                    EventType::Warning,
                    "CloudTimeout",
                    format!("describing load balancer {id} timed out"),
                )
                .await;
                return Err(Error::CloudTimeout(format!("describe load balancer {id}")));
            }
        };
        res.push(LoadBalancerAddress {
            id: id.clone(),
            address: lb.address,
        });
    }
    Ok(res)
}

/// Moves every cached item missing from `keep` to Deleting and evicts the
/// ones nothing references anymore.
///
/// Returns the statuses of the items still being deleted and whether any remain.
async fn retire_items(
    pool: &PortPool,
    keep: &BTreeSet<String>,
    ctx: Arc<ContextWith<Component>>,
) -> Result<(Vec<PortPoolItemStatus>, bool), Error> {
    let component = &ctx.component;
    let pool_key = pool.pool_key();
    let pool_name = pool.name_any();
    let ns = pool.namespace().unwrap_or_default();

    let retiring = {
        let mut cache = component.cache.lock().map_err(Error::Allocator)?;
        let names = cache
            .items(&pool_key)
            .iter()
            .filter(|i| !keep.contains(i.name()))
            .map(|i| (i.name().to_string(), i.policy().clone(), i.status().clone()))
            .collect::<Vec<_>>();
        for (name, _, status) in names.iter() {
            if !status.is_deleting() {
                tracing::info!(pool = pool_key, item = name, "Pool item is deleting");
                cache
                    .update_item_status(
                        &pool_key,
                        name,
                        ItemStatus {
                            phase: ItemPhase::Deleting,
                            ..status.clone()
                        },
                    )
                    .map_err(Error::Allocator)?;
            }
        }
        names
    };
    if retiring.is_empty() {
        return Ok((Vec::new(), false));
    }

    let bindings = Api::<PortBinding>::all(ctx.client().clone())
        .list(&ListParams::default())
        .await
        .map_err(Error::Kube)?;
    let listener_api = Api::<Listener>::namespaced(ctx.client().clone(), &ns);

    let mut statuses = Vec::new();
    for (name, policy, status) in retiring.into_iter() {
        let binding_refs = bindings
            .items
            .iter()
            .filter(|b| {
                b.spec.items.iter().any(|i| {
                    i.pool_name == pool_name && i.pool_namespace == ns && i.pool_item_name == name
                })
            })
            .count();

        let listeners = listener_api
            .list(&ListParams::default().labels(&ListenerMeta::pool_item_selector(&pool_name, &name)))
            .await
            .map_err(Error::Kube)?;
        for l in listeners.items.iter() {
            if l.spec.targets.is_empty() && l.metadata.deletion_timestamp.is_none() {
                tracing::info!(
                    pool = pool_key,
                    item = name,
                    listener = l.name_any(),
                    "Delete listener of deleting pool item"
                );
                listener_api
                    .delete(&l.name_any(), &DeleteParams::default())
                    .await
                    .map_err(Error::Kube)?;
            }
        }
        let listener_refs = listeners.items.len();

        if binding_refs == 0 && listener_refs == 0 {
            let mut cache = component.cache.lock().map_err(Error::Allocator)?;
            if let Some(evicted) = cache.delete_port_pool_item(&pool_key, &name) {
                let metrics = ctx.metrics();
                let m = metrics.lock().map_err(|_| Error::FailedToGetLock)?;
                for list in evicted.port_lists().iter() {
                    m.ports_remove(&pool_key, &name, &list.protocol().to_string());
                }
            }
            continue;
        }

        statuses.push(PortPoolItemStatus {
            name: name.clone(),
            phase: PoolItemPhase::Deleting,
            start_port: policy.start_port,
            end_port: policy.end_port,
            segment_length: policy.segment_length,
            protocols: policy.protocols.clone(),
            region: status.region.clone(),
            load_balancers: status
                .load_balancers
                .iter()
                .map(|lb| LoadBalancerAddress {
                    id: lb.id.clone(),
                    address: lb.address.clone(),
                })
                .collect(),
            message: Some(format!(
                "referenced by {binding_refs} bindings and {listener_refs} listeners"
            )),
        });
    }
    let remaining = !statuses.is_empty();
    Ok((statuses, remaining))
}

async fn write_status(
    api: &Api<PortPool>,
    pool: &PortPool,
    items: Vec<PortPoolItemStatus>,
    ctx: &Arc<ContextWith<Component>>,
) -> Result<(), Error> {
    let new_status = PortPoolStatus { items };
    if pool.status.as_ref() == Some(&new_status) {
        return Ok(());
    }
    update_status(
        api,
        &pool.name_any(),
        &ctx.component.settings.status_retry,
        |p: &mut PortPool| p.status = Some(new_status.clone()),
    )
    .await?;
    tracing::info!(
        name = pool.name_any(),
        items = new_status.items.len(),
        "Update PortPool status"
    );
    Ok(())
}

pub async fn run(state: State, interval: u64, component: Component, metrics: Arc<Mutex<Metrics>>) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let pools = Api::<PortPool>::all(client.clone());
    if let Err(e) = pools.list(&ListParams::default().limit(1)).await {
        tracing::error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        tracing::info!("Installation: portd crd | kubectl apply -f -");
        std::process::exit(1);
    }

    tracing::info!("Start PortPool reconciler");

    Controller::new(pools, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy::<PortPool, Error, ContextWith<Component>>,
            state.to_context_with(client, interval, component, metrics),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
