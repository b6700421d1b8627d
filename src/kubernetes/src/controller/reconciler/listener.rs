use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::StreamExt;
use json_patch::{AddOperation, PatchOperation, TestOperation};
use kube::{
    api::{ListParams, Patch, PatchParams},
    runtime::{controller::Action, watcher::Config, Controller},
    Api, Client, ResourceExt,
};

use crate::{
    context::{error_policy, Context, ContextWith, Ctx, State},
    controller::{
        component::Component,
        error::Error,
        metrics::Metrics,
        synchronizer::{SyncEvent, SyncOp, Synchronizer},
    },
    crd::listener::{Listener, LISTENER_FINALIZER},
    util::{get_namespace, has_finalizer},
};

/// Hands listener changes over to the per load balancer workers.
///
/// The finalizer is removed by the worker once the provider has deleted the
/// listener, so it is managed here instead of through `finalizer()`.
#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler(
    listener: Arc<Listener>,
    ctx: Arc<ContextWith<Synchronizer>>,
) -> Result<Action, Error> {
    portd_trace::telemetry::record_trace_id();

    let ns = get_namespace::<Listener>(&listener).map_err(Error::KubeLibrary)?;
    let listeners = Api::<Listener>::namespaced(ctx.client().clone(), &ns);

    ctx.metrics()
        .lock()
        .map_err(|_| Error::FailedToGetLock)?
        .reconciliation(listener.as_ref());

    if listener.metadata.deletion_timestamp.is_some() {
        if has_finalizer(listener.as_ref(), LISTENER_FINALIZER) {
            tracing::info!(
                name = listener.name_any(),
                namespace = ns,
                listener = listener.key().to_string(),
                "Enqueue listener deletion"
            );
            ctx.component
                .push(SyncEvent::new(SyncOp::Delete, listener.clone()))?;
        }
        return Ok(Action::requeue(Duration::from_secs(ctx.interval())));
    }

    if !has_finalizer(listener.as_ref(), LISTENER_FINALIZER) {
        add_finalizer(&listeners, &listener).await?;
        // the patch comes back as a new event
        return Ok(Action::await_change());
    }

    if !listener.is_synced() {
        tracing::info!(
            name = listener.name_any(),
            namespace = ns,
            listener = listener.key().to_string(),
            targets = listener.spec.targets.len(),
            "Enqueue listener sync"
        );
        ctx.component
            .push(SyncEvent::new(SyncOp::Ensure, listener.clone()))?;
    }

    Ok(Action::requeue(Duration::from_secs(ctx.interval())))
}

async fn add_finalizer(api: &Api<Listener>, listener: &Listener) -> Result<(), Error> {
    let ops = if listener.finalizers().is_empty() {
        vec![
            PatchOperation::Test(TestOperation {
                path: "/metadata/finalizers".into(),
                value: serde_json::Value::Null,
            }),
            PatchOperation::Add(AddOperation {
                path: "/metadata/finalizers".into(),
                value: serde_json::json!([LISTENER_FINALIZER]),
            }),
        ]
    } else {
        vec![
            PatchOperation::Test(TestOperation {
                path: "/metadata/finalizers".into(),
                value: serde_json::json!(listener.finalizers()),
            }),
            PatchOperation::Add(AddOperation {
                path: "/metadata/finalizers/-".into(),
                value: serde_json::Value::String(LISTENER_FINALIZER.to_string()),
            }),
        ]
    };
    api.patch::<Listener>(
        &listener.name_any(),
        &PatchParams::default(),
        &Patch::Json(json_patch::Patch(ops)),
    )
    .await
    .map_err(Error::Kube)?;
    Ok(())
}

pub async fn run(
    state: State,
    interval: u64,
    component: Component,
    metrics: Arc<Mutex<Metrics>>,
) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let listeners = Api::<Listener>::all(client.clone());
    if let Err(e) = listeners.list(&ListParams::default().limit(1)).await {
        tracing::error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        tracing::info!("Installation: portd crd | kubectl apply -f -");
        std::process::exit(1);
    }

    let synchronizer = Synchronizer::new(
        Context::clone(&state.to_context(client.clone(), interval, metrics.clone())),
        component,
    );

    tracing::info!("Start Listener reconciler");

    Controller::new(listeners, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy::<Listener, Error, ContextWith<Synchronizer>>,
            state.to_context_with(client, interval, synchronizer.clone(), metrics),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    synchronizer.shutdown();
}
