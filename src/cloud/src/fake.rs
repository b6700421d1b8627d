use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;

use super::{
    client::{
        check_batch, ListenerDef, ListenerKey, LoadBalanceObject, LoadBalancerClient,
        ProtocolLayer,
    },
    error::Error,
};

/// In-memory load balancer provider.
///
/// It backs the `fake` provider kind and the synchronizer tests.
#[derive(Clone, Debug, Default)]
pub struct FakeClient {
    inner: Arc<Mutex<FakeClientInner>>,
}

#[derive(Debug, Default)]
pub struct FakeClientInner {
    pub namespaced: bool,
    pub load_balancers: HashMap<String, LoadBalanceObject>,
    pub listeners: HashMap<ListenerKey, FakeListener>,
    pub calls: Vec<FakeCall>,
    // the next `failures` calls fail with a provider error
    pub failures: u32,
    pub latency: Option<Duration>,
    next_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeListener {
    pub id: String,
    pub def: ListenerDef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Ensure(ListenerKey),
    EnsureSegment(ListenerKey),
    EnsureMulti(String, usize),
    EnsureMultiSegment(String, usize),
    Delete(ListenerKey),
    DeleteSegment(ListenerKey),
    DeleteMulti(String, usize),
    Describe(String),
}

impl FakeClient {
    pub fn new() -> FakeClient {
        FakeClient::default()
    }

    pub fn new_with(inner: Arc<Mutex<FakeClientInner>>) -> FakeClient {
        FakeClient { inner }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, FakeClientInner>, Error> {
        self.inner.lock().map_err(|_| Error::FailedToGetLock)
    }

    pub fn add_load_balancer(&self, lb: LoadBalanceObject) -> Result<(), Error> {
        self.lock()?.load_balancers.insert(lb.id.clone(), lb);
        Ok(())
    }

    pub fn set_namespaced(&self, namespaced: bool) -> Result<(), Error> {
        self.lock()?.namespaced = namespaced;
        Ok(())
    }

    pub fn inject_failures(&self, n: u32) -> Result<(), Error> {
        self.lock()?.failures = n;
        Ok(())
    }

    pub fn set_latency(&self, latency: Option<Duration>) -> Result<(), Error> {
        self.lock()?.latency = latency;
        Ok(())
    }

    pub fn listener(&self, key: &ListenerKey) -> Option<FakeListener> {
        self.lock().ok()?.listeners.get(key).cloned()
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.lock().map(|i| i.calls.clone()).unwrap_or_default()
    }

    async fn wait(&self) -> Result<(), Error> {
        let latency = self.lock()?.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

impl FakeClientInner {
    fn record(&mut self, call: FakeCall) -> Result<(), Error> {
        self.calls.push(call);
        if self.failures > 0 {
            self.failures -= 1;
            return Err(Error::Provider("injected failure".to_string()));
        }
        Ok(())
    }

    fn check_load_balancer(&self, region: &str, id: &str) -> Result<(), Error> {
        match self.load_balancers.get(id) {
            Some(lb) if lb.region != region => Err(Error::InvalidRegion(region.to_string())),
            Some(_) => Ok(()),
            None => Err(Error::LoadBalancerNotFound(id.to_string())),
        }
    }

    fn upsert(&mut self, region: &str, listener: &ListenerDef, segment: bool) -> Result<String, Error> {
        self.check_load_balancer(region, &listener.load_balancer_id)?;
        if listener.is_segment() != segment {
            return Err(Error::InvalidListener(listener.key().to_string()));
        }
        let key = listener.key();
        if let Some(existing) = self.listeners.get_mut(&key) {
            existing.def = listener.clone();
            existing.def.listener_id = Some(existing.id.clone());
            return Ok(existing.id.clone());
        }
        self.next_id += 1;
        let id = format!("lsn-{:08}", self.next_id);
        let mut def = listener.clone();
        def.listener_id = Some(id.clone());
        self.listeners.insert(key, FakeListener { id: id.clone(), def });
        Ok(id)
    }

    fn remove(&mut self, region: &str, listener: &ListenerDef) -> Result<(), Error> {
        self.check_load_balancer(region, &listener.load_balancer_id)?;
        let key = listener.key();
        match self.listeners.remove(&key) {
            Some(_) => Ok(()),
            None => Err(Error::ListenerNotFound(key.to_string())),
        }
    }

    fn upsert_all(
        &mut self,
        region: &str,
        load_balancer_id: &str,
        listeners: &[ListenerDef],
        segment: bool,
    ) -> Result<HashMap<ListenerKey, String>, Error> {
        check_batch(load_balancer_id, listeners)?;
        self.check_load_balancer(region, load_balancer_id)?;
        if let Some(l) = listeners.iter().find(|l| l.is_segment() != segment) {
            return Err(Error::InvalidListener(l.key().to_string()));
        }
        let mut res = HashMap::new();
        for listener in listeners.iter() {
            let id = self.upsert(region, listener, segment)?;
            res.insert(listener.key(), id);
        }
        Ok(res)
    }
}

#[async_trait]
impl LoadBalancerClient for FakeClient {
    async fn ensure_listener(&self, region: &str, listener: &ListenerDef) -> Result<String, Error> {
        self.wait().await?;
        let mut inner = self.lock()?;
        inner.record(FakeCall::Ensure(listener.key()))?;
        inner.upsert(region, listener, false)
    }

    async fn ensure_segment_listener(
        &self,
        region: &str,
        listener: &ListenerDef,
    ) -> Result<String, Error> {
        self.wait().await?;
        let mut inner = self.lock()?;
        inner.record(FakeCall::EnsureSegment(listener.key()))?;
        inner.upsert(region, listener, true)
    }

    async fn ensure_multi_listeners(
        &self,
        region: &str,
        load_balancer_id: &str,
        listeners: &[ListenerDef],
    ) -> Result<HashMap<ListenerKey, String>, Error> {
        self.wait().await?;
        let mut inner = self.lock()?;
        inner.record(FakeCall::EnsureMulti(
            load_balancer_id.to_string(),
            listeners.len(),
        ))?;
        inner.upsert_all(region, load_balancer_id, listeners, false)
    }

    async fn ensure_multi_segment_listeners(
        &self,
        region: &str,
        load_balancer_id: &str,
        listeners: &[ListenerDef],
    ) -> Result<HashMap<ListenerKey, String>, Error> {
        self.wait().await?;
        let mut inner = self.lock()?;
        inner.record(FakeCall::EnsureMultiSegment(
            load_balancer_id.to_string(),
            listeners.len(),
        ))?;
        inner.upsert_all(region, load_balancer_id, listeners, true)
    }

    async fn delete_listener(&self, region: &str, listener: &ListenerDef) -> Result<(), Error> {
        self.wait().await?;
        let mut inner = self.lock()?;
        inner.record(FakeCall::Delete(listener.key()))?;
        inner.remove(region, listener)
    }

    async fn delete_segment_listener(
        &self,
        region: &str,
        listener: &ListenerDef,
    ) -> Result<(), Error> {
        self.wait().await?;
        let mut inner = self.lock()?;
        inner.record(FakeCall::DeleteSegment(listener.key()))?;
        inner.remove(region, listener)
    }

    async fn delete_multi_listeners(
        &self,
        region: &str,
        load_balancer_id: &str,
        listeners: &[ListenerDef],
    ) -> Result<(), Error> {
        self.wait().await?;
        let mut inner = self.lock()?;
        inner.record(FakeCall::DeleteMulti(
            load_balancer_id.to_string(),
            listeners.len(),
        ))?;
        check_batch(load_balancer_id, listeners)?;
        inner.check_load_balancer(region, load_balancer_id)?;
        // already deleted listeners are skipped in batch mode
        for listener in listeners.iter() {
            inner.listeners.remove(&listener.key());
        }
        Ok(())
    }

    async fn describe_load_balancer(
        &self,
        region: &str,
        id: &str,
        layer: ProtocolLayer,
    ) -> Result<LoadBalanceObject, Error> {
        self.wait().await?;
        let mut inner = self.lock()?;
        inner.record(FakeCall::Describe(id.to_string()))?;
        inner.check_load_balancer(region, id)?;
        inner
            .load_balancers
            .get(id)
            .filter(|lb| lb.layer == layer)
            .cloned()
            .ok_or(Error::LoadBalancerNotFound(id.to_string()))
    }

    async fn describe_load_balancer_with_namespace(
        &self,
        region: &str,
        namespace: &str,
        name: &str,
        layer: ProtocolLayer,
    ) -> Result<LoadBalanceObject, Error> {
        self.wait().await?;
        let mut inner = self.lock()?;
        inner.record(FakeCall::Describe(format!("{namespace}/{name}")))?;
        inner
            .load_balancers
            .values()
            .find(|lb| {
                lb.region == region
                    && lb.layer == layer
                    && lb.name == name
                    && lb.namespace.as_deref() == Some(namespace)
            })
            .cloned()
            .ok_or(Error::LoadBalancerNotFound(format!("{namespace}/{name}")))
    }

    fn is_namespaced(&self) -> bool {
        self.lock().map(|i| i.namespaced).unwrap_or(false)
    }
}
