use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::{
    api::core::v1::{ConfigMap, Node, Pod},
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::ObjectMeta,
    runtime::{
        controller::{Action, Controller},
        events::EventType,
        finalizer::{finalizer, Event},
        reflector::ObjectRef,
        watcher::Config,
    },
    Api, Client, ResourceExt,
};

use crate::{
    binding::{
        consumer::{bound_addresses, desired_targets, is_present, retention, BoundAddress, ConsumerObject, Retention},
        item::{evaluate_apply, evaluate_cleanup, ListenerAction, ListenerView},
        state::{aggregate, needs_observation, on_apply, on_cleanup},
    },
    context::{error_policy, publish_event, ContextWith, Ctx, State},
    controller::{component::Component, error::Error, metrics::Metrics},
    crd::{
        listener::{
            listener_name, Listener, ListenerMeta, ListenerPhase, ListenerSpec, ListenerTarget,
        },
        port_binding::{
            BindingPhase, Consumer, ConsumerKind, ItemPhase, PortBinding, PortBindingItem,
            PortBindingItemStatus, PortBindingStatus, BINDING_READY_CONDITION, BOUND_ADDRESSES_ANNOTATION,
            BOUND_LABEL, PORT_BINDING_FINALIZER,
        },
        port_pool::{LoadBalancerAddress, PortPool},
    },
    util::{get_namespace, sanitize_name},
};

use super::update_status;

const NOT_READY_REQUEUE_SECS: u64 = 2;
const FIELD_MANAGER: &str = "portd-controller";

pub const NODE_CONFIG_MAP_PREFIX: &str = "portd-node-";
pub const NODE_CONFIG_MAP_KEY: &str = "addresses";

#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler(
    binding: Arc<PortBinding>,
    ctx: Arc<ContextWith<Component>>,
) -> Result<Action, Error> {
    portd_trace::telemetry::record_trace_id();

    let ns = get_namespace::<PortBinding>(&binding).map_err(Error::KubeLibrary)?;
    let bindings = Api::<PortBinding>::namespaced(ctx.client().clone(), &ns);

    let metrics = ctx.metrics();
    let _timer = {
        let m = metrics.lock().map_err(|_| Error::FailedToGetLock)?;
        m.reconciliation(binding.as_ref());
        m.measure(binding.as_ref())
    };

    finalizer(&bindings, PORT_BINDING_FINALIZER, binding, |event| async {
        match event {
            Event::Apply(pb) => reconcile(&bindings, &pb, ctx.clone()).await,
            Event::Cleanup(pb) => cleanup(&bindings, &pb, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

struct ItemObservation {
    phase: ItemPhase,
    message: Option<String>,
    load_balancers: Vec<LoadBalancerAddress>,
}

#[tracing::instrument(skip_all)]
async fn reconcile(
    api: &Api<PortBinding>,
    pb: &PortBinding,
    ctx: Arc<ContextWith<Component>>,
) -> Result<Action, Error> {
    let ns = get_namespace::<PortBinding>(pb).map_err(Error::KubeLibrary)?;
    tracing::info!(name = pb.name_any(), namespace = ns, "Reconcile PortBinding");

    let consumer = get_consumer(ctx.client(), &pb.spec.consumer, &ns).await?;
    let now = Utc::now();
    let consumer = match consumer {
        Some(c) if is_present(pb, Some(&c)) => c,
        _ => {
            let gone_at = pb
                .status
                .as_ref()
                .and_then(|s| s.consumer_gone_at.as_ref())
                .map(|t| t.0);
            return match retention(pb.spec.keep_duration_seconds, gone_at, now) {
                Retention::DeleteNow => {
                    tracing::info!(
                        name = pb.name_any(),
                        namespace = ns,
                        consumer = pb.spec.consumer.name,
                        "Consumer is gone, delete PortBinding"
                    );
                    delete_binding(api, &pb.name_any()).await?;
                    Ok(Action::await_change())
                }
                Retention::DeleteAfter(keep) => {
                    if gone_at.is_none() {
                        tracing::info!(
                            name = pb.name_any(),
                            namespace = ns,
                            keep_secs = keep.as_secs(),
                            "Consumer is gone, keep PortBinding"
                        );
                        update_status(
                            api,
                            &pb.name_any(),
                            &ctx.component.settings.status_retry,
                            |b: &mut PortBinding| {
                                let mut status = b.status.clone().unwrap_or_default();
                                status.consumer_gone_at = Some(Time(now));
                                b.status = Some(status);
                            },
                        )
                        .await?;
                    }
                    Ok(Action::requeue(keep))
                }
            };
        }
    };

    {
        let reference = pb.spec.consumer.reference();
        let mut cache = ctx.component.cache.lock().map_err(Error::Allocator)?;
        for item in pb.spec.items.iter() {
            cache.set_port_binding_used(&item.slot_key(), Some(reference.clone()));
        }
    }

    let mut pools = HashMap::new();
    let mut statuses = Vec::with_capacity(pb.spec.items.len());
    let mut addresses: Vec<BoundAddress> = Vec::new();
    for item in pb.spec.items.iter() {
        let prev = pb.item_phase(item);
        if !needs_observation(prev) {
            statuses.push(PortBindingItemStatus::new(item, ItemPhase::Initializing, None));
            continue;
        }
        let observed = observe_item(&ctx, &consumer, item, prev, &mut pools).await?;
        tracing::info!(
            name = pb.name_any(),
            namespace = ns,
            item = item.to_string(),
            phase = observed.phase.to_string(),
            "Observe binding item"
        );
        addresses.append(&mut bound_addresses(item, &observed.load_balancers));
        statuses.push(PortBindingItemStatus::new(item, observed.phase, observed.message));
    }

    let phases = statuses.iter().map(|s| s.phase).collect::<Vec<ItemPhase>>();
    let phase = aggregate(&phases, false);

    if phase == BindingPhase::Ready {
        apply_ready_effects(&ctx, pb, &consumer, &addresses).await?;
        if pb.phase() != Some(BindingPhase::Ready) {
            publish_event(
                ctx.as_ref(),
                pb,
                EventType::Normal,
                "Ready",
                format!("{} ports are bound", pb.spec.items.len()),
            )
            .await;
        }
    }

    write_status(
        api,
        pb,
        PortBindingStatus {
            phase,
            items: statuses,
            consumer_gone_at: None,
        },
        &ctx,
    )
    .await?;

    if phase == BindingPhase::Ready {
        return Ok(Action::requeue(Duration::from_secs(ctx.interval())));
    }
    Ok(Action::requeue(Duration::from_secs(NOT_READY_REQUEUE_SECS)))
}

#[tracing::instrument(skip_all)]
async fn cleanup(
    api: &Api<PortBinding>,
    pb: &PortBinding,
    ctx: Arc<ContextWith<Component>>,
) -> Result<Action, Error> {
    let ns = get_namespace::<PortBinding>(pb).map_err(Error::KubeLibrary)?;
    tracing::info!(name = pb.name_any(), namespace = ns, "Cleanup PortBinding");

    let mut statuses = Vec::with_capacity(pb.spec.items.len());
    for item in pb.spec.items.iter() {
        let listener_api = Api::<Listener>::namespaced(ctx.client().clone(), &item.pool_namespace);
        let listeners = listener_api
            .list(&ListParams::default().labels(&ListenerMeta::pool_item_selector(
                &item.pool_name,
                &item.pool_item_name,
            )))
            .await
            .map_err(Error::Kube)?
            .items
            .into_iter()
            .filter(|l| l.spec.protocol == item.protocol && l.spec.port == item.start_port)
            .collect::<Vec<Listener>>();

        let observed = listeners
            .iter()
            .map(|l| (l.spec.load_balancer_id.clone(), Some(ListenerView::from(l))))
            .collect::<Vec<_>>();
        let eval = evaluate_cleanup(&observed);
        for (lb, action) in eval.pending_actions() {
            if *action != ListenerAction::ClearTargets {
                continue;
            }
            if let Some(l) = listeners.iter().find(|l| l.spec.load_balancer_id == *lb) {
                set_targets(&ctx, &listener_api, l, Vec::new()).await?;
            }
        }
        let phase = on_cleanup(eval.converged);
        statuses.push(PortBindingItemStatus::new(item, phase, None));
    }

    let phases = statuses.iter().map(|s| s.phase).collect::<Vec<ItemPhase>>();
    if aggregate(&phases, true) == BindingPhase::Cleaned {
        {
            let mut cache = ctx.component.cache.lock().map_err(Error::Allocator)?;
            for item in pb.spec.items.iter() {
                cache.release_port_binding(&item.slot_key());
            }
        }
        if pb.spec.consumer.kind == ConsumerKind::Node {
            delete_node_config_map(ctx.client(), &ns, &pb.spec.consumer.name).await?;
        }
        tracing::info!(name = pb.name_any(), namespace = ns, "PortBinding is cleaned");
        publish_event(
            ctx.as_ref(),
            pb,
            EventType::Normal,
            "Cleaned",
            format!("{} ports are released", pb.spec.items.len()),
        )
        .await;
        return Ok(Action::await_change());
    }

    write_status(
        api,
        pb,
        PortBindingStatus {
            phase: BindingPhase::Deleting,
            items: statuses,
            consumer_gone_at: pb.status.as_ref().and_then(|s| s.consumer_gone_at.clone()),
        },
        &ctx,
    )
    .await?;
    Err(Error::BindingNotCleaned(pb.name_any()))
}

async fn observe_item(
    ctx: &Arc<ContextWith<Component>>,
    consumer: &ConsumerObject,
    item: &PortBindingItem,
    prev: Option<ItemPhase>,
    pools: &mut HashMap<String, Option<PortPool>>,
) -> Result<ItemObservation, Error> {
    let not_ready = |message: String| ItemObservation {
        phase: ItemPhase::NotReady,
        message: Some(message),
        load_balancers: Vec::new(),
    };

    let pool = match pools.get(&item.pool_key()) {
        Some(p) => p.clone(),
        None => {
            let p = Api::<PortPool>::namespaced(ctx.client().clone(), &item.pool_namespace)
                .get_opt(&item.pool_name)
                .await
                .map_err(Error::Kube)?;
            pools.insert(item.pool_key(), p.clone());
            p
        }
    };
    let pool_item = match pool.as_ref().and_then(|p| {
        p.status
            .as_ref()
            .and_then(|s| s.items.iter().find(|i| i.name == item.pool_item_name))
    }) {
        Some(i) => i.clone(),
        None => return Ok(not_ready(format!("pool item {} is not ready", item.pool_item_name))),
    };
    let desired = match desired_targets(consumer, item) {
        Some(t) => t,
        None => return Ok(not_ready(Error::ConsumerAddressNotAssigned.to_string())),
    };

    let listener_api = Api::<Listener>::namespaced(ctx.client().clone(), &item.pool_namespace);
    let mut observed = Vec::with_capacity(pool_item.load_balancers.len());
    let mut objects = HashMap::new();
    for lb in pool_item.load_balancers.iter() {
        let name = listener_name(
            &item.pool_name,
            &item.pool_item_name,
            &lb.id,
            item.protocol,
            item.start_port,
        );
        let listener = listener_api.get_opt(&name).await.map_err(Error::Kube)?;
        observed.push((lb.id.clone(), listener.as_ref().map(ListenerView::from)));
        if let Some(l) = listener {
            objects.insert(lb.id.clone(), l);
        }
    }

    let eval = evaluate_apply(&desired, &observed);
    for (lb, action) in eval.pending_actions() {
        match action {
            ListenerAction::Create(targets) => {
                let listener = new_listener(item, &pool_item.region, lb, targets.clone());
                tracing::info!(
                    listener = listener.name_any(),
                    item = item.to_string(),
                    "Create listener"
                );
                match listener_api.create(&PostParams::default(), &listener).await {
                    Ok(_) => {}
                    // created by a binding of the same port a moment ago
                    Err(kube::Error::Api(e)) if e.code == 409 => {}
                    Err(e) => return Err(Error::Kube(e)),
                }
            }
            ListenerAction::UpdateTargets(targets) => {
                if let Some(l) = objects.get(lb) {
                    set_targets(ctx, &listener_api, l, targets.clone()).await?;
                }
            }
            ListenerAction::ClearTargets | ListenerAction::None => {}
        }
    }

    let phase = on_apply(prev, eval.converged);
    let message = if eval.converged {
        None
    } else {
        Some("waiting for listeners to be synced".to_string())
    };
    Ok(ItemObservation {
        phase,
        message,
        load_balancers: pool_item.load_balancers.clone(),
    })
}

fn new_listener(
    item: &PortBindingItem,
    region: &str,
    load_balancer_id: &str,
    targets: Vec<ListenerTarget>,
) -> Listener {
    Listener {
        metadata: ObjectMeta {
            name: Some(listener_name(
                &item.pool_name,
                &item.pool_item_name,
                load_balancer_id,
                item.protocol,
                item.start_port,
            )),
            namespace: Some(item.pool_namespace.clone()),
            labels: Some(ListenerMeta::for_pool_item(&item.pool_name, &item.pool_item_name).to_labels()),
            ..Default::default()
        },
        spec: ListenerSpec {
            region: region.to_string(),
            load_balancer_id: load_balancer_id.to_string(),
            protocol: item.protocol,
            port: item.start_port,
            end_port: item.end_port,
            targets,
        },
        status: None,
    }
}

// Replaces the target group and hands the listener to the synchronizer.
async fn set_targets(
    ctx: &Arc<ContextWith<Component>>,
    api: &Api<Listener>,
    listener: &Listener,
    targets: Vec<ListenerTarget>,
) -> Result<(), Error> {
    tracing::info!(
        listener = listener.name_any(),
        targets = targets.len(),
        "Update listener targets"
    );
    let mut new = listener.clone();
    new.spec.targets = targets;
    api.replace(&listener.name_any(), &PostParams::default(), &new)
        .await
        .map_err(Error::Kube)?;
    update_status(
        api,
        &listener.name_any(),
        &ctx.component.settings.status_retry,
        |l: &mut Listener| {
            let mut status = l.status.clone().unwrap_or_default();
            status.phase = ListenerPhase::NotSynced;
            l.status = Some(status);
        },
    )
    .await?;
    Ok(())
}

async fn get_consumer(
    client: &Client,
    consumer: &Consumer,
    binding_namespace: &str,
) -> Result<Option<ConsumerObject>, Error> {
    match consumer.kind {
        ConsumerKind::Pod => {
            let ns = consumer.namespace.as_deref().unwrap_or(binding_namespace);
            Ok(Api::<Pod>::namespaced(client.clone(), ns)
                .get_opt(&consumer.name)
                .await
                .map_err(Error::Kube)?
                .map(ConsumerObject::Pod))
        }
        ConsumerKind::Node => Ok(Api::<Node>::all(client.clone())
            .get_opt(&consumer.name)
            .await
            .map_err(Error::Kube)?
            .map(ConsumerObject::Node)),
    }
}

async fn apply_ready_effects(
    ctx: &Arc<ContextWith<Component>>,
    pb: &PortBinding,
    consumer: &ConsumerObject,
    addresses: &[BoundAddress],
) -> Result<(), Error> {
    let value = serde_json::to_string(addresses).map_err(Error::Serialization)?;
    let annotation = serde_json::json!({
        "metadata": {
            "annotations": {
                BOUND_ADDRESSES_ANNOTATION: value,
            }
        }
    });

    match consumer {
        ConsumerObject::Pod(pod) => {
            let ns = pod.namespace().unwrap_or_default();
            let pods = Api::<Pod>::namespaced(ctx.client().clone(), &ns);
            if !has_ready_condition(pod) {
                let condition = serde_json::json!({
                    "status": {
                        "conditions": [{
                            "type": BINDING_READY_CONDITION,
                            "status": "True",
                            "lastTransitionTime": Time(Utc::now()),
                        }]
                    }
                });
                pods.patch_status(
                    &pod.name_any(),
                    &PatchParams::default(),
                    &Patch::Strategic(condition),
                )
                .await
                .map_err(Error::Kube)?;
                tracing::info!(pod = pod.name_any(), namespace = ns, "Set binding ready condition");
            }
            if pod.annotations().get(BOUND_ADDRESSES_ANNOTATION) != Some(&value) {
                pods.patch(&pod.name_any(), &PatchParams::default(), &Patch::Merge(annotation))
                    .await
                    .map_err(Error::Kube)?;
            }
        }
        ConsumerObject::Node(node) => {
            if node.annotations().get(BOUND_ADDRESSES_ANNOTATION) == Some(&value) {
                return Ok(());
            }
            Api::<Node>::all(ctx.client().clone())
                .patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(annotation))
                .await
                .map_err(Error::Kube)?;
            let ns = pb.namespace().unwrap_or_default();
            let cm = node_config_map(&node.name_any(), &ns, &value);
            Api::<ConfigMap>::namespaced(ctx.client().clone(), &ns)
                .patch(
                    &cm.name_any(),
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&cm),
                )
                .await
                .map_err(Error::Kube)?;
            tracing::info!(node = node.name_any(), config_map = cm.name_any(), "Write node addresses");
        }
    }
    Ok(())
}

fn has_ready_condition(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == BINDING_READY_CONDITION && c.status == "True")
        })
        .unwrap_or(false)
}

pub fn node_config_map_name(node: &str) -> String {
    sanitize_name(&format!("{NODE_CONFIG_MAP_PREFIX}{node}"))
}

fn node_config_map(node: &str, namespace: &str, addresses: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(node_config_map_name(node)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(BOUND_LABEL.to_string(), "true".to_string())])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            NODE_CONFIG_MAP_KEY.to_string(),
            addresses.to_string(),
        )])),
        ..Default::default()
    }
}

async fn delete_node_config_map(client: &Client, namespace: &str, node: &str) -> Result<(), Error> {
    match Api::<ConfigMap>::namespaced(client.clone(), namespace)
        .delete(&node_config_map_name(node), &DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}

async fn delete_binding(api: &Api<PortBinding>, name: &str) -> Result<(), Error> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}

async fn write_status(
    api: &Api<PortBinding>,
    pb: &PortBinding,
    new_status: PortBindingStatus,
    ctx: &Arc<ContextWith<Component>>,
) -> Result<(), Error> {
    if pb.status.as_ref() == Some(&new_status) {
        return Ok(());
    }
    update_status(
        api,
        &pb.name_any(),
        &ctx.component.settings.status_retry,
        |b: &mut PortBinding| b.status = Some(new_status.clone()),
    )
    .await?;
    tracing::info!(
        name = pb.name_any(),
        phase = new_status.phase.to_string(),
        "Update PortBinding status"
    );
    Ok(())
}

pub async fn run(state: State, interval: u64, component: Component, metrics: Arc<Mutex<Metrics>>) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let bindings = Api::<PortBinding>::all(client.clone());
    if let Err(e) = bindings.list(&ListParams::default().limit(1)).await {
        tracing::error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        tracing::info!("Installation: portd crd | kubectl apply -f -");
        std::process::exit(1);
    }

    let node_binding_namespace = component.settings.node_binding_namespace.clone();

    tracing::info!("Start PortBinding reconciler");

    Controller::new(bindings, Config::default().any_semantic())
        .watches(
            Api::<Pod>::all(client.clone()),
            Config::default().labels(&format!("{BOUND_LABEL}=true")),
            |pod| {
                pod.namespace()
                    .map(|ns| ObjectRef::new(&pod.name_any()).within(&ns))
            },
        )
        .watches(
            Api::<Node>::all(client.clone()),
            Config::default().labels(&format!("{BOUND_LABEL}=true")),
            move |node| Some(ObjectRef::new(&node.name_any()).within(&node_binding_namespace)),
        )
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy::<PortBinding, Error, ContextWith<Component>>,
            state.to_context_with(client, interval, component, metrics),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
