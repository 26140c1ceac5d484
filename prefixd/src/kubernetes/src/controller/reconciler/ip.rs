use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        events::EventType,
        finalizer::{finalizer, Event},
        watcher::Config as WatcherConfig,
    },
    Client, ResourceExt,
};
use prefixd_ipam::AllocationResult;
use prefixd_trace::telemetry::record_trace_id;

use crate::{
    context::{error_policy, ContextWith, Ctx, State},
    controller::{
        allocator::{AllocationState, Allocator},
        backoff::Backoff,
        config::Config,
        error::Error,
        metrics::Metrics,
        object::Object,
        store::{KubeStore, Store},
    },
    crd::{
        common::Phase,
        ip::{IPStatus, IP, IP_FINALIZER},
        prefix_allocation::PrefixAllocation,
    },
    util::get_namespaced_name,
};

use super::record;

type IPContext<S> = ContextWith<Arc<Allocator>, S>;

#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler<S: Store>(ip: Arc<IP>, ctx: Arc<IPContext<S>>) -> Result<Action, Error> {
    record_trace_id();
    let _timer = ctx.metrics().reconciliation(ip.as_ref());
    ctx.touch().await;

    let api = ctx.store().api::<IP>(ip.namespace().as_deref());
    finalizer(&api, IP_FINALIZER, ip, |event| async {
        match event {
            Event::Apply(ip) => reconcile(ip.as_ref(), ctx.clone()).await,
            Event::Cleanup(ip) => cleanup(ip.as_ref(), ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

#[tracing::instrument(skip_all)]
async fn reconcile<S: Store>(ip: &IP, ctx: Arc<IPContext<S>>) -> Result<Action, Error> {
    tracing::info!(name = get_namespaced_name(ip), "reconcile IP");

    if let Err(e) = ip.spec.validate() {
        tracing::warn!(name = ip.name_any(), error=?e, "invalid IP");
        record(ctx.store(), ip, EventType::Warning, "InvalidSpec", e.to_string()).await;
        if !is_allocated(ip) {
            update_phase(ip, ctx.store(), Phase::Failed, None).await?;
        }
        return Ok(Action::await_change());
    }

    if is_allocated(ip) {
        return Ok(Action::await_change());
    }

    match ctx.component.apply(ctx.store(), ctx.metrics(), ip).await? {
        AllocationState::Allocated(grant) => {
            let addr = match grant.result {
                AllocationResult::Prefix(prefix) => prefix.addr(),
                AllocationResult::Range(range) => {
                    return Err(Error::UnexpectedRange(range.to_string()))
                }
            };
            update_phase(ip, ctx.store(), Phase::Allocated, Some(addr.to_string())).await?;
            tracing::info!(
                name = ip.name_any(),
                ip = addr.to_string(),
                parent = grant.parent,
                "IP allocated"
            );
            record(
                ctx.store(),
                ip,
                EventType::Normal,
                "Allocated",
                format!("{} is granted by {}", addr, grant.parent),
            )
            .await;
            Ok(Action::await_change())
        }
        AllocationState::Pending => {
            update_phase(ip, ctx.store(), Phase::Pending, None).await?;
            Ok(Action::requeue(ctx.interval()))
        }
        AllocationState::Waiting(delay) => {
            update_phase(ip, ctx.store(), Phase::Pending, None).await?;
            Ok(Action::requeue(delay))
        }
    }
}

fn is_allocated(ip: &IP) -> bool {
    ip.status
        .as_ref()
        .map(|s| s.phase == Some(Phase::Allocated))
        .unwrap_or(false)
}

async fn update_phase<S: Store>(
    ip: &IP,
    store: &S,
    phase: Phase,
    addr: Option<String>,
) -> Result<(), Error> {
    let mut new = ip.clone();
    let status = new.status.get_or_insert_with(IPStatus::default);
    let mut changed = status.set_phase(phase);
    if addr.is_some() && status.ip != addr {
        status.ip = addr;
        changed = true;
    }
    if changed {
        store.replace_status(&new).await?;
    }
    Ok(())
}

#[tracing::instrument(skip_all)]
async fn cleanup<S: Store>(ip: &IP, ctx: Arc<IPContext<S>>) -> Result<Action, Error> {
    ctx.component.backoff().forget(&Backoff::key(ip));
    tracing::info!(name = ip.name_any(), "clean up IP");
    Ok(Action::await_change())
}

pub async fn run(state: State, config: Config, allocator: Arc<Allocator>, metrics: Metrics) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let ips = IP::api(client.clone(), None);
    if let Err(e) = ips.list(&ListParams::default().limit(1)).await {
        tracing::error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        tracing::info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
    let allocations = PrefixAllocation::api(client.clone(), None);
    let store = KubeStore::new(client, state.reporter().await);

    tracing::info!("Start IP reconciler");

    Controller::new(ips, WatcherConfig::default().any_semantic())
        .owns(allocations, WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            reconciler::<KubeStore>,
            error_policy::<IP, Error, IPContext<KubeStore>>,
            state.to_context_with(store, config.requeue_interval, allocator, metrics),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
