use kube::Resource;
use prometheus::Registry;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec};
use tokio::time::Instant;

use prefixd_trace::error::TraceableError;

#[derive(Debug, Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub allocations: IntCounterVec,
    pub requester_retries: IntCounterVec,
    pub scheduling_failures: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "prefixd_controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["resource"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "prefixd_controller_reconciliation_errors_total",
                "Total count of reconciliation errors",
            ),
            &["resource", "instance", "error"],
        )
        .unwrap();
        let reconciliations = IntCounterVec::new(
            opts!(
                "prefixd_controller_reconciliation_total",
                "Total count of reconciliations",
            ),
            &["resource", "instance"],
        )
        .unwrap();
        let allocations = IntCounterVec::new(
            opts!(
                "prefixd_controller_allocation_total",
                "Total count of allocation decisions made by parents"
            ),
            &["kind", "result"],
        )
        .unwrap();
        let requester_retries = IntCounterVec::new(
            opts!(
                "prefixd_controller_requester_retries_total",
                "Total count of failed allocations replaced by their requester"
            ),
            &["kind"],
        )
        .unwrap();
        let scheduling_failures = IntCounterVec::new(
            opts!(
                "prefixd_controller_scheduling_failures_total",
                "Total count of allocations left unbound for lack of a capable parent"
            ),
            &["kind"],
        )
        .unwrap();

        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            allocations,
            requester_retries,
            scheduling_failures,
        }
    }
}

impl Metrics {
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.allocations.clone()))?;
        registry.register(Box::new(self.requester_retries.clone()))?;
        registry.register(Box::new(self.scheduling_failures.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<T: Resource<DynamicType = ()>, E: TraceableError>(
        &self,
        resource: &T,
        error: &E,
    ) {
        let object_ref = resource.object_ref(&());
        let label = error.metric_label();
        self.failures
            .with_label_values(&[
                &object_ref.kind.unwrap_or_default(),
                &object_ref.name.unwrap_or_default(),
                &label,
            ])
            .inc()
    }

    /// Counts a reconciliation and times it until the returned guard is dropped.
    pub fn reconciliation<T: Resource<DynamicType = ()>>(&self, resource: &T) -> ReconcileMeasurer {
        let object_ref = resource.object_ref(&());
        let kind = object_ref.kind.unwrap_or_default();
        self.reconciliations
            .with_label_values(&[&kind, &object_ref.name.unwrap_or_default()])
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            kind,
        }
    }

    pub fn allocation(&self, kind: &str, result: &str) {
        self.allocations.with_label_values(&[kind, result]).inc()
    }

    pub fn requester_retry(&self, kind: &str) {
        self.requester_retries.with_label_values(&[kind]).inc()
    }

    pub fn scheduling_failure(&self, kind: &str) {
        self.scheduling_failures.with_label_values(&[kind]).inc()
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    kind: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[&self.kind]).observe(duration);
    }
}
