use std::sync::{Arc, Mutex};

use actix_web::{
    get, middleware, post,
    web::{self, Data},
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{core::admission::AdmissionReview, Client};
use prometheus::{Encoder, TextEncoder};
use rustls::ServerConfig;

use portd_allocator::manager::PortPoolCache;
use portd_cert::util::{load_certificates_from_pem, load_private_key_from_file};
use portd_cloud::provider::new_client;
use portd_trace::init::{prepare_tracing, TraceConfig};

use crate::{context::State, crd::port_pool::PortPool};

use super::{
    component::{Component, Settings},
    config::Config,
    metrics::Metrics,
    reconciler, recovery,
    webhook::{self, WebhookState},
};

pub fn start(config: Config, trace: TraceConfig) {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run(config, trace));
}

#[tracing::instrument(skip_all)]
async fn run(config: Config, trace_config: TraceConfig) {
    prepare_tracing(trace_config).await;

    let server_config = match tls_config(&config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error=?e, cert = config.tls.cert, key = config.tls.key, "Failed to load TLS settings");
            std::process::exit(1);
        }
    };

    let cloud = match new_client(&config.provider) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error=?e, "Failed to create load balancer client");
            std::process::exit(1);
        }
    };
    let component = Component::new(PortPoolCache::new(), cloud, Settings::from(&config));

    let state = State::new("portd-controller");
    let metrics = match Metrics::default().register(&state.registry) {
        Ok(m) => Arc::new(Mutex::new(m)),
        Err(e) => {
            tracing::error!(error=?e, "Failed to register metrics");
            std::process::exit(1);
        }
    };

    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let server_state = state.clone();
    let webhook_state = WebhookState {
        component: component.clone(),
        client: client.clone(),
    };
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .app_data(Data::new(webhook_state.clone()))
            .service(index)
            .service(health)
            .service(ready)
            .service(metrics_)
            .service(pod_mutating_webhook)
            .service(node_mutating_webhook)
            .service(port_pool_validating_webhook)
            .wrap(
                middleware::Logger::default()
                    .exclude("/healthz")
                    .exclude("/readyz"),
            )
    })
    .bind_rustls_021(format!("0.0.0.0:{}", config.https_port), server_config)
    .and_then(|s| s.bind(format!("0.0.0.0:{}", config.http_port)));
    let server = match server {
        Ok(s) => s.shutdown_timeout(5),
        Err(e) => {
            tracing::error!(error=?e, "Failed to bind server ports");
            std::process::exit(1);
        }
    };

    // Reconcilers only start once the cache reflects the cluster.
    let interval = config.requeue_interval;
    tokio::spawn(async move {
        while let Err(e) = recovery::recover(client.clone(), &component).await {
            tracing::error!(error=?e, "Failed to recover port pool cache");
            tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
        }
        start_reconcilers(state, interval, component, metrics);
    });

    if let Err(e) = server.run().await {
        tracing::error!(error=?e, "Server stopped");
    }
}

fn tls_config(config: &Config) -> anyhow::Result<ServerConfig> {
    let cert_chain = load_certificates_from_pem(&config.tls.cert)?;
    let private_key = load_private_key_from_file(&config.tls.key)?;
    let server_config = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)?;
    Ok(server_config)
}

fn start_reconcilers(
    state: State,
    interval: u64,
    component: Component,
    metrics: Arc<Mutex<Metrics>>,
) {
    tracing::info!("Start PortPool reconciler");
    let port_pool_state = state.clone();
    let port_pool_component = component.clone();
    let port_pool_metrics = metrics.clone();
    tokio::spawn(async move {
        reconciler::port_pool::run(
            port_pool_state,
            interval,
            port_pool_component,
            port_pool_metrics,
        )
        .await;
    });

    tracing::info!("Start PortBinding reconciler");
    let port_binding_state = state.clone();
    let port_binding_component = component.clone();
    let port_binding_metrics = metrics.clone();
    tokio::spawn(async move {
        reconciler::port_binding::run(
            port_binding_state,
            interval,
            port_binding_component,
            port_binding_metrics,
        )
        .await;
    });

    tracing::info!("Start Listener reconciler");
    let listener_state = state.clone();
    let listener_component = component.clone();
    let listener_metrics = metrics.clone();
    tokio::spawn(async move {
        reconciler::listener::run(
            listener_state,
            interval,
            listener_component,
            listener_metrics,
        )
        .await;
    });

    tracing::info!("Start Pod watcher");
    let pod_state = state.clone();
    let pod_component = component.clone();
    let pod_metrics = metrics.clone();
    tokio::spawn(async move {
        reconciler::pod_watcher::run(pod_state, interval, pod_component, pod_metrics).await;
    });

    tracing::info!("Start Node watcher");
    let node_state = state.clone();
    let node_component = component.clone();
    let node_metrics = metrics.clone();
    tokio::spawn(async move {
        reconciler::node_watcher::run(node_state, interval, node_component, node_metrics).await;
    });

    tokio::spawn(async move {
        reconciler::leak_checker::run(component, metrics).await;
    });
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

// Not ready until the port pool cache is recovered.
#[get("/readyz")]
async fn ready(w: Data<WebhookState>, _: HttpRequest) -> impl Responder {
    if w.component.cache.is_ready() {
        HttpResponse::Ok().json("ready")
    } else {
        HttpResponse::ServiceUnavailable().json("recovering")
    }
}

#[get("/metrics")]
async fn metrics_(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metrics, &mut buffer) {
        tracing::error!(error=?e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok().body(buffer)
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[post("/mutate-v1-pod")]
async fn pod_mutating_webhook(
    req: HttpRequest,
    body: web::Json<AdmissionReview<Pod>>,
    state: Data<WebhookState>,
) -> impl Responder {
    webhook::pod::handle_mutation(req, body, state).await
}

#[post("/mutate-v1-node")]
async fn node_mutating_webhook(
    req: HttpRequest,
    body: web::Json<AdmissionReview<Node>>,
    state: Data<WebhookState>,
) -> impl Responder {
    webhook::node::handle_mutation(req, body, state).await
}

#[post("/validate-portd-lbport-io-v1alpha1-portpool")]
async fn port_pool_validating_webhook(
    req: HttpRequest,
    body: web::Json<AdmissionReview<PortPool>>,
    state: Data<WebhookState>,
) -> impl Responder {
    webhook::port_pool::handle_validation(req, body, state).await
}
