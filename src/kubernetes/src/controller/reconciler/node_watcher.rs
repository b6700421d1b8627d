use std::sync::{Arc, Mutex};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{
    runtime::{controller::Action, watcher::Config, Controller},
    Api, Client, ResourceExt,
};

use crate::{
    binding::consumer::ConsumerObject,
    context::{error_policy, ContextWith, Ctx, State},
    controller::{component::Component, error::Error, metrics::Metrics},
    crd::port_binding::{Consumer, ConsumerKind, PortBinding, BOUND_LABEL},
};

use super::pod_watcher::{ensure_binding, keep_duration};

/// Creates the PortBinding for a node admitted by the webhook.
/// Node bindings live in the configured node binding namespace.
#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler(node: Arc<Node>, ctx: Arc<ContextWith<Component>>) -> Result<Action, Error> {
    portd_trace::telemetry::record_trace_id();

    ctx.metrics()
        .lock()
        .map_err(|_| Error::FailedToGetLock)?
        .reconciliation(node.as_ref());

    if node.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let items = match ConsumerObject::Node(node.as_ref().clone()).bound_items() {
        Some(items) if !items.is_empty() => items,
        _ => return Ok(Action::await_change()),
    };

    let ns = ctx.component.settings.node_binding_namespace.clone();
    let bindings = Api::<PortBinding>::namespaced(ctx.client().clone(), &ns);
    ensure_binding(
        &bindings,
        &ns,
        &node.name_any(),
        Consumer {
            kind: ConsumerKind::Node,
            name: node.name_any(),
            namespace: None,
            uid: node.uid(),
        },
        items,
        keep_duration(node.as_ref()),
    )
    .await
}

pub async fn run(state: State, interval: u64, component: Component, metrics: Arc<Mutex<Metrics>>) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let nodes = Api::<Node>::all(client.clone());

    tracing::info!("Start Node watcher");

    Controller::new(nodes, Config::default().labels(&format!("{BOUND_LABEL}=true")))
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy::<Node, Error, ContextWith<Component>>,
            state.to_context_with(client, interval, component, metrics),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
