use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use kube::{
    runtime::{controller::Action, events::Reporter},
    Resource, ResourceExt,
};
use serde::Serialize;
use tokio::sync::RwLock;

use prefixd_trace::error::TraceableError;

use crate::controller::{
    metrics::Metrics,
    store::{KubeStore, Store},
};

pub trait Ctx {
    type Store: Store;

    fn metrics(&self) -> &Metrics;
    fn store(&self) -> &Self::Store;
}

// Context for our reconciler
#[derive(Clone)]
pub struct Context<S: Store = KubeStore> {
    // Backing object store
    pub store: S,
    // Reconcile interval
    pub interval: u64,
    // Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    // Prometheus metrics
    pub metrics: Metrics,
}

impl<S: Store> Ctx for Context<S> {
    type Store = S;

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn store(&self) -> &S {
        &self.store
    }
}

pub struct ContextWith<T, S: Store = KubeStore> {
    pub inner: Context<S>,
    pub component: T,
}

impl<T, S: Store> Ctx for ContextWith<T, S> {
    type Store = S;

    fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    fn store(&self) -> &S {
        &self.inner.store
    }
}

impl<S: Store> Context<S> {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Marks the diagnostics with the time of the latest reconciliation.
    pub async fn touch(&self) {
        self.diagnostics.write().await.last_event = Utc::now();
    }
}

impl<T, S: Store> ContextWith<T, S> {
    pub fn interval(&self) -> Duration {
        self.inner.interval()
    }

    pub async fn touch(&self) {
        self.inner.touch().await
    }
}

#[derive(Debug, Clone, Default)]
pub struct State {
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub registry: prometheus::Registry,
}

impl State {
    pub fn new(component: &str) -> State {
        State {
            diagnostics: Arc::new(RwLock::new(Diagnostics::new(component.to_string()))),
            registry: prometheus::Registry::default(),
        }
    }
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub async fn reporter(&self) -> Reporter {
        self.diagnostics.read().await.reporter.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context<S: Store>(&self, store: S, interval: u64, metrics: Metrics) -> Arc<Context<S>> {
        Arc::new(Context {
            store,
            interval,
            metrics,
            diagnostics: self.diagnostics.clone(),
        })
    }

    pub fn to_context_with<T, S: Store>(
        &self,
        store: S,
        interval: u64,
        component: T,
        metrics: Metrics,
    ) -> Arc<ContextWith<T, S>> {
        Arc::new(ContextWith {
            inner: Context {
                store,
                interval,
                diagnostics: self.diagnostics.clone(),
                metrics,
            },
            component,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Diagnostics {
    pub fn new(component: String) -> Self {
        Self {
            last_event: Utc::now(),
            reporter: component.into(),
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "prefixd".into(),
        }
    }
}

#[tracing::instrument(skip_all)]
pub fn error_policy<T: Resource<DynamicType = ()>, E: TraceableError, C: Ctx>(
    resource: Arc<T>,
    error: &E,
    ctx: Arc<C>,
) -> Action {
    tracing::warn!(name = resource.name_any(), error=?error, "reconcile failed");
    ctx.metrics().reconcile_failure(resource.as_ref(), error);
    Action::requeue(Duration::from_secs(10))
}
