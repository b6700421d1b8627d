use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    core::ObjectMeta,
    runtime::{controller::Action, watcher::Config, Controller},
    Api, Client, ResourceExt,
};

use crate::{
    binding::consumer::{same_items, ConsumerObject},
    context::{error_policy, ContextWith, Ctx, State},
    controller::{component::Component, error::Error, metrics::Metrics},
    crd::port_binding::{
        Consumer, ConsumerKind, PortBinding, PortBindingItem, PortBindingSpec, BOUND_LABEL,
        KEEP_DURATION_ANNOTATION,
    },
    util::get_namespace,
};

const RECREATE_REQUEUE_SECS: u64 = 2;

/// Creates the PortBinding for a pod admitted by the webhook.
#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler(pod: Arc<Pod>, ctx: Arc<ContextWith<Component>>) -> Result<Action, Error> {
    portd_trace::telemetry::record_trace_id();

    let ns = get_namespace::<Pod>(&pod).map_err(Error::KubeLibrary)?;

    ctx.metrics()
        .lock()
        .map_err(|_| Error::FailedToGetLock)?
        .reconciliation(pod.as_ref());

    if pod.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let consumer = ConsumerObject::Pod(pod.as_ref().clone());
    if consumer.is_terminated() {
        return Ok(Action::await_change());
    }
    let items = match consumer.bound_items() {
        Some(items) if !items.is_empty() => items,
        _ => return Ok(Action::await_change()),
    };

    let bindings = Api::<PortBinding>::namespaced(ctx.client().clone(), &ns);
    ensure_binding(
        &bindings,
        &ns,
        &pod.name_any(),
        Consumer {
            kind: ConsumerKind::Pod,
            name: pod.name_any(),
            namespace: Some(ns.clone()),
            uid: pod.uid(),
        },
        items,
        keep_duration(pod.as_ref()),
    )
    .await
}

pub(super) fn keep_duration<K: ResourceExt>(obj: &K) -> Option<i64> {
    obj.annotations()
        .get(KEEP_DURATION_ANNOTATION)
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
}

/// Makes the named PortBinding reflect the consumer's allocation.
///
/// A binding holding the same items is adopted by the consumer, one with
/// different items is deleted first and recreated on a later pass.
pub(super) async fn ensure_binding(
    api: &Api<PortBinding>,
    namespace: &str,
    name: &str,
    consumer: Consumer,
    items: Vec<PortBindingItem>,
    keep_duration_seconds: Option<i64>,
) -> Result<Action, Error> {
    let existing = api.get_opt(name).await.map_err(Error::Kube)?;
    let binding = match existing {
        Some(b) => b,
        None => {
            let binding = PortBinding {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(
                        [(BOUND_LABEL.to_string(), "true".to_string())]
                            .into_iter()
                            .collect(),
                    ),
                    ..Default::default()
                },
                spec: PortBindingSpec {
                    consumer: consumer.clone(),
                    items,
                    keep_duration_seconds,
                },
                status: None,
            };
            api.create(&PostParams::default(), &binding)
                .await
                .map_err(Error::Kube)?;
            tracing::info!(
                name = name,
                consumer = consumer.name,
                kind = consumer.kind.to_string(),
                "Create PortBinding"
            );
            return Ok(Action::await_change());
        }
    };

    if binding.metadata.deletion_timestamp.is_some() {
        return Ok(Action::requeue(Duration::from_secs(RECREATE_REQUEUE_SECS)));
    }

    if !same_items(&binding.spec.items, &items) {
        tracing::warn!(
            name = name,
            consumer = consumer.name,
            "PortBinding holds other items, recreate it"
        );
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(Error::Kube)?;
        return Ok(Action::requeue(Duration::from_secs(RECREATE_REQUEUE_SECS)));
    }

    if binding.spec.consumer.uid != consumer.uid
        || binding.spec.keep_duration_seconds != keep_duration_seconds
    {
        tracing::info!(
            name = name,
            consumer = consumer.name,
            uid = consumer.uid,
            "Adopt PortBinding"
        );
        let patch = serde_json::json!({
            "spec": {
                "consumer": consumer,
                "keepDurationSeconds": keep_duration_seconds,
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(Error::Kube)?;
    }
    Ok(Action::await_change())
}

pub async fn run(state: State, interval: u64, component: Component, metrics: Arc<Mutex<Metrics>>) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let pods = Api::<Pod>::all(client.clone());

    tracing::info!("Start Pod watcher");

    Controller::new(pods, Config::default().labels(&format!("{BOUND_LABEL}=true")))
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy::<Pod, Error, ContextWith<Component>>,
            state.to_context_with(client, interval, component, metrics),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
