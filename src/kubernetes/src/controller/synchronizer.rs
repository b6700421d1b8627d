use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use kube::{
    api::PostParams,
    runtime::events::EventType,
    Api, ResourceExt,
};
use tokio::{sync::watch, time::Instant};

use portd_cloud::{
    client::{ListenerDef, ListenerKey, LoadBalancerClient},
    error::Error as CloudError,
};

use crate::{
    context::{publish_event, Context, Ctx},
    crd::listener::{Listener, ListenerPhase, ListenerStatus, LISTENER_FINALIZER},
    retry::{retry_with_backoff_if, ExponentialBackoff},
};

use super::{component::Component, error::Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    Ensure,
    Delete,
}

impl std::fmt::Display for SyncOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOp::Ensure => write!(f, "ensure"),
            SyncOp::Delete => write!(f, "delete"),
        }
    }
}

/// One desired change of a listener, taken from the observed Listener object.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub op: SyncOp,
    pub listener: Arc<Listener>,
}

impl SyncEvent {
    pub fn new(op: SyncOp, listener: Arc<Listener>) -> SyncEvent {
        SyncEvent { op, listener }
    }

    pub fn key(&self) -> ListenerKey {
        self.listener.key()
    }

    pub fn def(&self) -> ListenerDef {
        self.listener.to_def()
    }

    pub fn region(&self) -> &str {
        &self.listener.spec.region
    }

    pub fn load_balancer_id(&self) -> &str {
        &self.listener.spec.load_balancer_id
    }
}

struct Pending {
    event: SyncEvent,
    not_before: Instant,
}

/// Local receive cache of one load balancer worker.
///
/// Only the latest event per listener is kept. Failed events wait for their
/// backoff before they are drained again.
pub struct ReceiveCache {
    pending: BTreeMap<ListenerKey, Pending>,
    failures: HashMap<ListenerKey, u32>,
    backoff: ExponentialBackoff,
}

impl ReceiveCache {
    pub fn new(backoff: ExponentialBackoff) -> ReceiveCache {
        ReceiveCache {
            pending: BTreeMap::new(),
            failures: HashMap::new(),
            backoff,
        }
    }

    // A freshly observed change forgets the backoff of its listener.
    pub fn push(&mut self, event: SyncEvent, now: Instant) {
        let key = event.key();
        self.failures.remove(&key);
        self.pending.insert(
            key,
            Pending {
                event,
                not_before: now,
            },
        );
    }

    pub fn drain_ready(&mut self, now: Instant) -> Vec<SyncEvent> {
        let ready = self
            .pending
            .iter()
            .filter(|(_, p)| p.not_before <= now)
            .map(|(k, _)| k.clone())
            .collect::<Vec<ListenerKey>>();
        ready
            .iter()
            .filter_map(|k| self.pending.remove(k))
            .map(|p| p.event)
            .collect()
    }

    /// Puts a failed event back with exponential backoff and returns the delay.
    ///
    /// An event pushed while the failed one was in flight is newer and wins.
    pub fn requeue_failed(&mut self, event: SyncEvent, now: Instant) -> Duration {
        let key = event.key();
        let failures = self.failures.entry(key.clone()).or_insert(0);
        *failures += 1;
        let delay = self.backoff.delay(*failures);
        self.pending.entry(key).or_insert(Pending {
            event,
            not_before: now + delay,
        });
        delay
    }

    pub fn mark_done(&mut self, key: &ListenerKey) {
        self.failures.remove(key);
    }

    pub fn failures(&self, key: &ListenerKey) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Buckets {
    pub ensure: Vec<SyncEvent>,
    pub ensure_segment: Vec<SyncEvent>,
    pub delete: Vec<SyncEvent>,
}

impl Buckets {
    pub fn from_events(events: Vec<SyncEvent>) -> Buckets {
        let mut buckets = Buckets::default();
        for event in events.into_iter() {
            match event.op {
                SyncOp::Delete => buckets.delete.push(event),
                SyncOp::Ensure if event.listener.spec.end_port != 0 => {
                    buckets.ensure_segment.push(event)
                }
                SyncOp::Ensure => buckets.ensure.push(event),
            }
        }
        buckets
    }

    pub fn is_empty(&self) -> bool {
        self.ensure.is_empty() && self.ensure_segment.is_empty() && self.delete.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    Cloud(CloudError),
    Timeout,
}

impl std::fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncFailure::Cloud(e) => write!(f, "{e}"),
            SyncFailure::Timeout => write!(f, "cloud call timed out"),
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
    // listener id returned by the provider for ensure operations
    pub succeeded: Vec<(SyncEvent, Option<String>)>,
    pub failed: Vec<(SyncEvent, SyncFailure)>,
}

async fn call<T, F>(timeout: Duration, fut: F) -> Result<T, SyncFailure>
where
    F: std::future::Future<Output = Result<T, CloudError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(SyncFailure::Cloud(e)),
        Err(_) => Err(SyncFailure::Timeout),
    }
}

fn ignore_not_found(res: Result<(), SyncFailure>) -> Result<(), SyncFailure> {
    match res {
        Err(SyncFailure::Cloud(e)) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[allow(clippy::too_many_arguments)]
async fn ensure_bucket(
    client: &dyn LoadBalancerClient,
    region: &str,
    load_balancer_id: &str,
    events: Vec<SyncEvent>,
    segment: bool,
    bulk: bool,
    timeout: Duration,
    outcome: &mut SyncOutcome,
) {
    if events.is_empty() {
        return;
    }
    if bulk {
        let defs = events.iter().map(|e| e.def()).collect::<Vec<ListenerDef>>();
        let res = if segment {
            call(
                timeout,
                client.ensure_multi_segment_listeners(region, load_balancer_id, &defs),
            )
            .await
        } else {
            call(
                timeout,
                client.ensure_multi_listeners(region, load_balancer_id, &defs),
            )
            .await
        };
        match res {
            Ok(ids) => {
                for event in events.into_iter() {
                    match ids.get(&event.key()) {
                        Some(id) => outcome.succeeded.push((event, Some(id.clone()))),
                        None => {
                            let key = event.key().to_string();
                            outcome
                                .failed
                                .push((event, SyncFailure::Cloud(CloudError::ListenerNotFound(key))))
                        }
                    }
                }
            }
            Err(f) => {
                for event in events.into_iter() {
                    outcome.failed.push((event, f.clone()));
                }
            }
        }
        return;
    }
    for event in events.into_iter() {
        let def = event.def();
        let res = if segment {
            call(timeout, client.ensure_segment_listener(region, &def)).await
        } else {
            call(timeout, client.ensure_listener(region, &def)).await
        };
        match res {
            Ok(id) => outcome.succeeded.push((event, Some(id))),
            Err(f) => outcome.failed.push((event, f)),
        }
    }
}

async fn delete_bucket(
    client: &dyn LoadBalancerClient,
    region: &str,
    load_balancer_id: &str,
    events: Vec<SyncEvent>,
    bulk: bool,
    timeout: Duration,
    outcome: &mut SyncOutcome,
) {
    if events.is_empty() {
        return;
    }
    if bulk {
        let defs = events.iter().map(|e| e.def()).collect::<Vec<ListenerDef>>();
        let res = ignore_not_found(
            call(
                timeout,
                client.delete_multi_listeners(region, load_balancer_id, &defs),
            )
            .await,
        );
        for event in events.into_iter() {
            match &res {
                Ok(()) => outcome.succeeded.push((event, None)),
                Err(f) => outcome.failed.push((event, f.clone())),
            }
        }
        return;
    }
    for event in events.into_iter() {
        let def = event.def();
        let res = if def.is_segment() {
            call(timeout, client.delete_segment_listener(region, &def)).await
        } else {
            call(timeout, client.delete_listener(region, &def)).await
        };
        match ignore_not_found(res) {
            Ok(()) => outcome.succeeded.push((event, None)),
            Err(f) => outcome.failed.push((event, f)),
        }
    }
}

/// Sends the buckets of one load balancer to the provider.
///
/// Deletions go first so that a port freed by one listener can be taken by another.
pub async fn sync_buckets(
    client: &dyn LoadBalancerClient,
    region: &str,
    load_balancer_id: &str,
    buckets: Buckets,
    bulk: bool,
    timeout: Duration,
) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();
    delete_bucket(
        client,
        region,
        load_balancer_id,
        buckets.delete,
        bulk,
        timeout,
        &mut outcome,
    )
    .await;
    ensure_bucket(
        client,
        region,
        load_balancer_id,
        buckets.ensure,
        false,
        bulk,
        timeout,
        &mut outcome,
    )
    .await;
    ensure_bucket(
        client,
        region,
        load_balancer_id,
        buckets.ensure_segment,
        true,
        bulk,
        timeout,
        &mut outcome,
    )
    .await;
    outcome
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKey {
    pub region: String,
    pub load_balancer_id: String,
}

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.region, self.load_balancer_id)
    }
}

pub type Queue = Arc<Mutex<ReceiveCache>>;

/// Per load balancer listener workers.
///
/// Workers share nothing but the object store. Each owns a receive cache
/// whose lock is only held while pushing or draining events.
#[derive(Clone)]
pub struct Synchronizer {
    ctx: Context,
    component: Component,
    workers: Arc<Mutex<HashMap<WorkerKey, Queue>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Synchronizer {
    pub fn new(ctx: Context, component: Component) -> Synchronizer {
        let (tx, _rx) = watch::channel(false);
        Synchronizer {
            ctx,
            component,
            workers: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(tx),
        }
    }

    /// Records the event and makes sure a worker drains its load balancer.
    pub fn push(&self, event: SyncEvent) -> Result<(), Error> {
        let (key, queue, spawned) = self.queue_for(&event)?;
        queue
            .lock()
            .map_err(|_| Error::FailedToGetLock)?
            .push(event, Instant::now());
        if spawned {
            tracing::info!(worker = key.to_string(), "Start listener worker");
            tokio::spawn(self.clone().work(key, queue));
        }
        Ok(())
    }

    // Same as push without starting a worker.
    pub fn enqueue(&self, event: SyncEvent) -> Result<WorkerKey, Error> {
        let (key, queue, _) = self.queue_for(&event)?;
        queue
            .lock()
            .map_err(|_| Error::FailedToGetLock)?
            .push(event, Instant::now());
        Ok(key)
    }

    pub fn pending(&self, key: &WorkerKey) -> Result<usize, Error> {
        let workers = self.workers.lock().map_err(|_| Error::FailedToGetLock)?;
        match workers.get(key) {
            Some(q) => Ok(q.lock().map_err(|_| Error::FailedToGetLock)?.len()),
            None => Ok(0),
        }
    }

    pub fn shutdown(&self) {
        tracing::info!("Shutdown listener workers");
        let _ = self.shutdown.send(true);
    }

    fn queue_for(&self, event: &SyncEvent) -> Result<(WorkerKey, Queue, bool), Error> {
        let key = WorkerKey {
            region: event.region().to_string(),
            load_balancer_id: event.load_balancer_id().to_string(),
        };
        let mut workers = self.workers.lock().map_err(|_| Error::FailedToGetLock)?;
        if let Some(q) = workers.get(&key) {
            return Ok((key, q.clone(), false));
        }
        let q = Arc::new(Mutex::new(ReceiveCache::new(
            self.component.settings.backoff,
        )));
        workers.insert(key.clone(), q.clone());
        Ok((key, q, true))
    }

    async fn work(self, key: WorkerKey, queue: Queue) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.component.settings.sync_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = shutdown.changed() => {
                    tracing::info!(worker = key.to_string(), "Stop listener worker");
                    return;
                }
            }
            if let Err(e) = self.drain(&key, &queue).await {
                tracing::error!(worker = key.to_string(), error=?e, "Failed to drain listener events");
            }
        }
    }

    /// Drains the ready events of one worker and reports the results.
    #[tracing::instrument(skip_all, fields(worker = %key))]
    pub async fn drain(&self, key: &WorkerKey, queue: &Queue) -> Result<usize, Error> {
        let events = queue
            .lock()
            .map_err(|_| Error::FailedToGetLock)?
            .drain_ready(Instant::now());
        if events.is_empty() {
            return Ok(0);
        }
        let count = events.len();
        tracing::info!(events = count, "Sync listeners");

        let outcome = sync_buckets(
            self.component.cloud.as_ref(),
            &key.region,
            &key.load_balancer_id,
            Buckets::from_events(events),
            self.component.settings.bulk_mode,
            self.component.settings.cloud_timeout,
        )
        .await;

        let mut retry = Vec::new();
        for (event, listener_id) in outcome.succeeded.into_iter() {
            if let Ok(m) = self.ctx.metrics().lock() {
                m.listener_sync_inc(&key.load_balancer_id, &event.op.to_string());
            }
            let res = match event.op {
                SyncOp::Ensure => self.mark_synced(&event, listener_id).await,
                SyncOp::Delete => self.remove_finalizer(&event).await,
            };
            match res {
                Ok(()) => {
                    queue
                        .lock()
                        .map_err(|_| Error::FailedToGetLock)?
                        .mark_done(&event.key());
                }
                Err(e) => {
                    tracing::warn!(
                        name = event.listener.name_any(),
                        error=?e,
                        "Failed to report listener sync result"
                    );
                    retry.push(event);
                }
            }
        }

        for (event, failure) in outcome.failed.into_iter() {
            tracing::warn!(
                name = event.listener.name_any(),
                listener = event.key().to_string(),
                op = event.op.to_string(),
                error = %failure,
                "Failed to sync listener"
            );
            if let Ok(m) = self.ctx.metrics().lock() {
                m.listener_sync_failure_inc(&key.load_balancer_id, &event.op.to_string());
                if failure == SyncFailure::Timeout {
                    m.cloud_timeout_inc(&key.load_balancer_id, &event.op.to_string());
                }
            }
            if failure == SyncFailure::Timeout {
                publish_event(
                    &self.ctx,
                    event.listener.as_ref(),
                    EventType::Warning,
                    "CloudTimeout",
                    format!("{} of listener {} timed out", event.op, event.key()),
                )
                .await;
            }
            retry.push(event);
        }

        let mut q = queue.lock().map_err(|_| Error::FailedToGetLock)?;
        let now = Instant::now();
        for event in retry.into_iter() {
            let name = event.listener.name_any();
            let delay = q.requeue_failed(event, now);
            tracing::info!(name, delay_ms = delay.as_millis() as u64, "Requeue listener event");
        }
        Ok(count)
    }

    async fn mark_synced(&self, event: &SyncEvent, listener_id: Option<String>) -> Result<(), Error> {
        let ns = event.listener.namespace().unwrap_or_default();
        let api = Api::<Listener>::namespaced(self.ctx.client().clone(), &ns);
        let api = &api;
        let name = event.listener.name_any();
        let name = name.as_str();
        let generation = event.listener.metadata.generation;

        retry_with_backoff_if(
            &self.component.settings.status_retry,
            "update listener status",
            |e: &Error| e.is_conflict(),
            move || {
                let listener_id = listener_id.clone();
                async move {
                    let current = match api.get_opt(name).await.map_err(Error::Kube)? {
                        Some(l) => l,
                        None => {
                            tracing::info!(name, "Listener is already gone");
                            return Ok(());
                        }
                    };
                    if current.metadata.generation != generation {
                        // a newer spec is on its way through the watch
                        return Ok(());
                    }
                    let mut new = current.clone();
                    new.status = Some(ListenerStatus {
                        phase: ListenerPhase::Synced,
                        listener_id: listener_id.or(current.listener_id()),
                        observed_generation: generation,
                        message: None,
                    });
                    let res = api
                        .replace_status(
                            name,
                            &PostParams::default(),
                            serde_json::to_vec(&new).map_err(Error::Serialization)?,
                        )
                        .await
                        .map_err(Error::Kube);
                    match res {
                        Ok(_) => tracing::info!(name, "Listener is synced"),
                        Err(e) if e.is_not_found() => {
                            tracing::info!(name, "Listener is already gone")
                        }
                        Err(e) => return Err(e),
                    }
                    Ok(())
                }
            },
        )
        .await
    }

    async fn remove_finalizer(&self, event: &SyncEvent) -> Result<(), Error> {
        let ns = event.listener.namespace().unwrap_or_default();
        let api = Api::<Listener>::namespaced(self.ctx.client().clone(), &ns);
        let api = &api;
        let name = event.listener.name_any();
        let name = name.as_str();

        retry_with_backoff_if(
            &self.component.settings.status_retry,
            "remove listener finalizer",
            |e: &Error| e.is_conflict(),
            move || async move {
                let current = match api.get_opt(name).await.map_err(Error::Kube)? {
                    Some(l) => l,
                    None => return Ok(()),
                };
                if !current.finalizers().iter().any(|f| f == LISTENER_FINALIZER) {
                    return Ok(());
                }
                let mut new = current.clone();
                new.metadata.finalizers = Some(
                    current
                        .finalizers()
                        .iter()
                        .filter(|f| *f != LISTENER_FINALIZER)
                        .cloned()
                        .collect(),
                );
                api.replace(name, &PostParams::default(), &new)
                    .await
                    .map_err(Error::Kube)?;
                tracing::info!(name, "Listener is deleted from the load balancer");
                Ok(())
            },
        )
        .await
    }

    pub fn queue(&self, key: &WorkerKey) -> Option<Queue> {
        self.workers.lock().ok()?.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portd_cloud::{client::LoadBalanceObject, fake::FakeClient};
    use rstest::rstest;

    use http::Response;
    use hyper::Body;

    use crate::fixture::reconciler::{
        api_server_response_not_found, assert_resource_request, test_binding_item,
        test_component, test_listener, test_target, timeout_after_1s, TEST_LB_ID,
    };

    fn event(op: SyncOp, port: u16, end_port: u16) -> SyncEvent {
        let mut item = test_binding_item(port);
        item.end_port = end_port;
        SyncEvent::new(op, Arc::new(test_listener(&item, vec![test_target()], None)))
    }

    fn fake() -> FakeClient {
        let client = FakeClient::new();
        client
            .add_load_balancer(LoadBalanceObject {
                id: TEST_LB_ID.to_string(),
                region: "default".to_string(),
                address: "203.0.113.1".to_string(),
                ..Default::default()
            })
            .unwrap();
        client
    }

    #[test]
    fn works_receive_cache_keeps_latest_event() {
        let mut cache = ReceiveCache::new(ExponentialBackoff::default());
        let now = Instant::now();
        cache.push(event(SyncOp::Ensure, 30000, 0), now);
        cache.push(event(SyncOp::Delete, 30000, 0), now);
        cache.push(event(SyncOp::Ensure, 30001, 0), now);
        assert_eq!(cache.len(), 2);

        let drained = cache.drain_ready(now);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].op, SyncOp::Delete);
        assert!(cache.is_empty());
    }

    #[test]
    fn works_receive_cache_backoff() {
        let mut cache = ReceiveCache::new(ExponentialBackoff::default());
        let now = Instant::now();
        let ev = event(SyncOp::Ensure, 30000, 0);
        let key = ev.key();

        assert_eq!(cache.requeue_failed(ev.clone(), now), Duration::from_secs(1));
        assert!(cache.drain_ready(now).is_empty());
        let drained = cache.drain_ready(now + Duration::from_secs(1));
        assert_eq!(drained.len(), 1);

        assert_eq!(cache.requeue_failed(ev.clone(), now), Duration::from_secs(2));
        assert_eq!(cache.failures(&key), 2);

        // a new observation resets the backoff and is drained right away
        cache.push(ev, now);
        assert_eq!(cache.failures(&key), 0);
        assert_eq!(cache.drain_ready(now).len(), 1);
    }

    #[test]
    fn works_requeue_does_not_overwrite_newer_event() {
        let mut cache = ReceiveCache::new(ExponentialBackoff::default());
        let now = Instant::now();
        cache.push(event(SyncOp::Delete, 30000, 0), now);
        cache.requeue_failed(event(SyncOp::Ensure, 30000, 0), now);
        let drained = cache.drain_ready(now);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].op, SyncOp::Delete);
    }

    #[test]
    fn works_buckets() {
        let buckets = Buckets::from_events(vec![
            event(SyncOp::Ensure, 30000, 0),
            event(SyncOp::Ensure, 30010, 30014),
            event(SyncOp::Delete, 30001, 0),
        ]);
        assert_eq!(buckets.ensure.len(), 1);
        assert_eq!(buckets.ensure_segment.len(), 1);
        assert_eq!(buckets.delete.len(), 1);
        assert!(Buckets::default().is_empty());
    }

    #[rstest(bulk, case(false), case(true))]
    #[tokio::test]
    async fn works_sync_buckets(bulk: bool) {
        let client = fake();
        let buckets = Buckets::from_events(vec![
            event(SyncOp::Ensure, 30000, 0),
            event(SyncOp::Ensure, 30010, 30014),
        ]);
        let outcome = sync_buckets(
            &client,
            "default",
            TEST_LB_ID,
            buckets,
            bulk,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(outcome.succeeded.len(), 2);
        assert!(outcome.failed.is_empty());
        assert!(outcome.succeeded.iter().all(|(_, id)| id.is_some()));

        let ev = event(SyncOp::Ensure, 30000, 0);
        let listener = client.listener(&ev.key()).unwrap();
        assert_eq!(listener.def.targets.len(), 1);

        // deleting twice is fine, the second one finds nothing
        for _ in 0..2 {
            let outcome = sync_buckets(
                &client,
                "default",
                TEST_LB_ID,
                Buckets::from_events(vec![event(SyncOp::Delete, 30000, 0)]),
                bulk,
                Duration::from_secs(1),
            )
            .await;
            assert_eq!(outcome.succeeded.len(), 1);
        }
        assert!(client.listener(&ev.key()).is_none());
    }

    #[tokio::test]
    async fn fails_sync_buckets_with_provider_error() {
        let client = fake();
        client.inject_failures(1).unwrap();
        let outcome = sync_buckets(
            &client,
            "default",
            TEST_LB_ID,
            Buckets::from_events(vec![event(SyncOp::Ensure, 30000, 0)]),
            false,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(outcome.failed.len(), 1);
        assert!(matches!(outcome.failed[0].1, SyncFailure::Cloud(_)));
    }

    #[tokio::test]
    async fn fails_sync_buckets_with_timeout() {
        let client = fake();
        client.set_latency(Some(Duration::from_millis(200))).unwrap();
        let outcome = sync_buckets(
            &client,
            "default",
            TEST_LB_ID,
            Buckets::from_events(vec![event(SyncOp::Ensure, 30000, 0)]),
            false,
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].1, SyncFailure::Timeout);
    }

    #[test]
    fn works_sync_event_accessors() {
        let ev = event(SyncOp::Ensure, 30000, 0);
        assert_eq!(ev.region(), "default");
        assert_eq!(ev.load_balancer_id(), TEST_LB_ID);
        assert_eq!(ev.def().targets[0].ip, test_target().ip);
    }

    #[tokio::test]
    async fn mark_synced_ignores_deleted_listener() {
        let (ctx, verifier, _) = Context::test();
        let (component, _) = test_component();
        let synchronizer = Synchronizer::new(Context::clone(&ctx), component);
        let ev = event(SyncOp::Ensure, 30000, 0);
        let listener = ev.listener.clone();

        let mocksrv = tokio::spawn(async move {
            let mut handle = verifier.0;
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_resource_request(
                &request,
                listener.as_ref(),
                None,
                false,
                None,
                http::Method::GET,
            );
            send.send_response(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::from(api_server_response_not_found(listener.as_ref())))
                    .unwrap(),
            );
        });

        synchronizer
            .mark_synced(&ev, Some("listener-1".to_string()))
            .await
            .unwrap();
        timeout_after_1s(mocksrv).await;
    }
}
