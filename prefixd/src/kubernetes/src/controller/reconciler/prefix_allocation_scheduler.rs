use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        events::EventType,
        reflector::ObjectRef,
        watcher::Config as WatcherConfig,
    },
    Client, Resource, ResourceExt,
};
use prefixd_trace::telemetry::record_trace_id;
use rand::seq::SliceRandom;

use crate::{
    context::{error_policy, Context, Ctx, State},
    controller::{
        config::Config,
        error::Error,
        metrics::Metrics,
        object::{AllocationObject, Object, PrefixObject},
        store::{allocated_with_family, KubeStore, Store},
    },
    crd::common::Phase,
    util::{get_namespaced_name, is_deleting},
};

use super::record;

/// Binds an unbound allocation to one of the prefixes its selector matches.
#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler<A: AllocationObject, S: Store>(
    allocation: Arc<A>,
    ctx: Arc<Context<S>>,
) -> Result<Action, Error> {
    record_trace_id();
    let _timer = ctx.metrics().reconciliation(allocation.as_ref());
    ctx.touch().await;

    schedule(allocation.as_ref(), ctx).await
}

#[tracing::instrument(skip_all)]
async fn schedule<A: AllocationObject, S: Store>(
    allocation: &A,
    ctx: Arc<Context<S>>,
) -> Result<Action, Error> {
    if allocation.prefix_ref().is_some()
        || is_deleting(allocation)
        || matches!(allocation.phase(), Some(Phase::Allocated) | Some(Phase::Failed))
    {
        return Ok(Action::await_change());
    }
    let selector = match allocation.prefix_selector() {
        Some(selector) => selector.clone(),
        None => return Ok(Action::await_change()),
    };

    tracing::info!(
        name = get_namespaced_name(allocation),
        "schedule allocation"
    );

    let request = match allocation.request_spec().to_request() {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(name = allocation.name_any(), error=?e, "invalid allocation request");
            let mut failed = allocation.clone();
            if failed.allocation_status_mut().set_phase(Phase::Failed) {
                ctx.store().replace_status(&failed).await?;
            }
            return Ok(Action::await_change());
        }
    };

    let candidates = ctx
        .store()
        .list::<A::Parent>(allocation.namespace().as_deref(), Some(&selector))
        .await?;
    let capable: Vec<A::Parent> = allocated_with_family(candidates, allocation.family())
        .into_iter()
        .filter(|p| p.can_serve(&request))
        .collect();

    let chosen = {
        let mut rng = rand::thread_rng();
        capable.choose(&mut rng).map(|p| p.name_any())
    };

    let kind = A::kind(&()).to_string();
    let parent = match chosen {
        Some(parent) => parent,
        None => {
            ctx.metrics().scheduling_failure(&kind);
            tracing::info!(
                name = allocation.name_any(),
                request = request.to_string(),
                "no prefix can serve the allocation"
            );
            record(
                ctx.store(),
                allocation,
                EventType::Warning,
                "NoCandidate",
                format!("no prefix can serve {}", request),
            )
            .await;
            if allocation.phase().is_none() {
                let mut pending = allocation.clone();
                pending.allocation_status_mut().set_phase(Phase::Pending);
                ctx.store().replace_status(&pending).await?;
            }
            return Ok(Action::requeue(ctx.interval()));
        }
    };

    let mut bound = allocation.clone();
    bound.set_prefix_ref(&parent);
    ctx.store().replace(&bound).await?;
    tracing::info!(name = allocation.name_any(), parent, "bind allocation");
    record(
        ctx.store(),
        allocation,
        EventType::Normal,
        "Scheduled",
        format!("bound to {}", parent),
    )
    .await;

    Ok(Action::await_change())
}

pub async fn run<A: AllocationObject>(state: State, config: Config, metrics: Metrics) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let allocations = A::api(client.clone(), None);
    if let Err(e) = allocations.list(&ListParams::default().limit(1)).await {
        tracing::error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        tracing::info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
    let parents = <A::Parent as Object>::api(client.clone(), None);
    let store = KubeStore::new(client, state.reporter().await);

    tracing::info!("Start {} scheduler", A::kind(&()));

    let controller = Controller::new(allocations, WatcherConfig::default().any_semantic());
    let reader = controller.store();
    controller
        .watches(
            parents,
            WatcherConfig::default(),
            move |parent: A::Parent| {
                reader
                    .state()
                    .into_iter()
                    .filter(|a| a.prefix_ref().is_none() && a.prefix_selector().is_some())
                    .filter(|a| a.namespace() == parent.namespace())
                    .map(|a| ObjectRef::from_obj(a.as_ref()))
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(
            reconciler::<A, KubeStore>,
            error_policy::<A, Error, Context<KubeStore>>,
            state.to_context(store, config.requeue_interval, metrics),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
