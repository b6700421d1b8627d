use kube::Resource;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, IntGaugeVec, Registry};
use tokio::time::Instant;

use portd_trace::error::TraceableError;

#[derive(Debug, Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub allocated_ports: IntGaugeVec,
    pub available_ports: IntGaugeVec,
    pub leaked_slots: IntCounterVec,
    pub binding_conflicts: IntGaugeVec,
    pub listener_syncs: IntCounterVec,
    pub listener_sync_failures: IntCounterVec,
    pub cloud_timeouts: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "portd_controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["resource"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "portd_controller_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["resource", "instance", "error"],
        )
        .unwrap();
        let reconciliations = IntCounterVec::new(
            opts!(
                "portd_controller_reconciliation_total",
                "Total count of reconciliations",
            ),
            &["resource", "instance"],
        )
        .unwrap();
        let allocated_ports = IntGaugeVec::new(
            opts!(
                "portd_controller_allocated_ports",
                "The number of allocated port slots"
            ),
            &["pool", "item", "protocol"],
        )
        .unwrap();
        let available_ports = IntGaugeVec::new(
            opts!(
                "portd_controller_available_ports",
                "The number of allocatable port slots"
            ),
            &["pool", "item", "protocol"],
        )
        .unwrap();
        let leaked_slots = IntCounterVec::new(
            opts!(
                "portd_controller_leaked_slots_total",
                "The number of released leaked port slots"
            ),
            &["pool", "item"],
        )
        .unwrap();
        let binding_conflicts = IntGaugeVec::new(
            opts!(
                "portd_controller_binding_conflicts",
                "The number of port slots claimed by more than one PortBinding"
            ),
            &["pool"],
        )
        .unwrap();
        let listener_syncs = IntCounterVec::new(
            opts!(
                "portd_controller_listener_syncs_total",
                "The number of listeners synchronized to load balancers"
            ),
            &["load_balancer", "operation"],
        )
        .unwrap();
        let listener_sync_failures = IntCounterVec::new(
            opts!(
                "portd_controller_listener_sync_failures_total",
                "The number of failed listener synchronizations"
            ),
            &["load_balancer", "operation"],
        )
        .unwrap();
        let cloud_timeouts = IntCounterVec::new(
            opts!(
                "portd_controller_cloud_timeouts_total",
                "The number of timed out cloud calls"
            ),
            &["load_balancer", "operation"],
        )
        .unwrap();

        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            allocated_ports,
            available_ports,
            leaked_slots,
            binding_conflicts,
            listener_syncs,
            listener_sync_failures,
            cloud_timeouts,
        }
    }
}

impl Metrics {
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.allocated_ports.clone()))?;
        registry.register(Box::new(self.available_ports.clone()))?;
        registry.register(Box::new(self.leaked_slots.clone()))?;
        registry.register(Box::new(self.binding_conflicts.clone()))?;
        registry.register(Box::new(self.listener_syncs.clone()))?;
        registry.register(Box::new(self.listener_sync_failures.clone()))?;
        registry.register(Box::new(self.cloud_timeouts.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<T: Resource<DynamicType = ()>, E: TraceableError>(
        &self,
        resource: &T,
        error: &E,
    ) {
        let obj = resource.object_ref(&());
        self.failures
            .with_label_values(&[
                &obj.kind.unwrap_or_default(),
                &obj.name.unwrap_or_default(),
                &error.metric_label(),
            ])
            .inc()
    }

    pub fn reconciliation<T: Resource<DynamicType = ()>>(&self, resource: &T) {
        let obj = resource.object_ref(&());
        self.reconciliations
            .with_label_values(&[&obj.kind.unwrap_or_default(), &obj.name.unwrap_or_default()])
            .inc()
    }

    pub fn measure<T: Resource<DynamicType = ()>>(&self, resource: &T) -> ReconcileMeasurer {
        ReconcileMeasurer {
            start: Instant::now(),
            resource: resource.object_ref(&()).kind.unwrap_or_default(),
            metric: self.reconcile_duration.clone(),
        }
    }

    pub fn ports_set(&self, pool: &str, item: &str, protocol: &str, allocated: i64, available: i64) {
        self.allocated_ports
            .with_label_values(&[pool, item, protocol])
            .set(allocated);
        self.available_ports
            .with_label_values(&[pool, item, protocol])
            .set(available);
    }

    pub fn ports_remove(&self, pool: &str, item: &str, protocol: &str) {
        let _ = self
            .allocated_ports
            .remove_label_values(&[pool, item, protocol]);
        let _ = self
            .available_ports
            .remove_label_values(&[pool, item, protocol]);
    }

    pub fn leaked_slot_inc(&self, pool: &str, item: &str) {
        self.leaked_slots.with_label_values(&[pool, item]).inc()
    }

    pub fn binding_conflicts_set(&self, pool: &str, val: i64) {
        self.binding_conflicts.with_label_values(&[pool]).set(val)
    }

    pub fn listener_sync_inc(&self, load_balancer: &str, operation: &str) {
        self.listener_syncs
            .with_label_values(&[load_balancer, operation])
            .inc()
    }

    pub fn listener_sync_failure_inc(&self, load_balancer: &str, operation: &str) {
        self.listener_sync_failures
            .with_label_values(&[load_balancer, operation])
            .inc()
    }

    pub fn cloud_timeout_inc(&self, load_balancer: &str, operation: &str) {
        self.cloud_timeouts
            .with_label_values(&[load_balancer, operation])
            .inc()
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    resource: String,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[&self.resource])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::error::Error;
    use crate::crd::port_pool::{PortPool, PortPoolSpec};

    #[test]
    fn works_register_and_count() {
        let registry = Registry::default();
        let metrics = Metrics::default().register(&registry).unwrap();
        let pool = PortPool::new("p1", PortPoolSpec::default());

        metrics.reconciliation(&pool);
        metrics.reconcile_failure(&pool, &Error::CacheNotReady);
        {
            let _m = metrics.measure(&pool);
        }
        metrics.ports_set("p1/default", "it1", "TCP", 2, 11);

        assert_eq!(
            metrics
                .reconciliations
                .with_label_values(&["PortPool", "p1"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .failures
                .with_label_values(&["PortPool", "p1", "cachenotready"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .allocated_ports
                .with_label_values(&["p1/default", "it1", "TCP"])
                .get(),
            2
        );
        // registering the same collectors twice must fail
        assert!(Metrics::default().register(&registry).is_err());
    }
}
