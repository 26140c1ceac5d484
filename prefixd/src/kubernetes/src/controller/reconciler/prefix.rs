use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        events::EventType,
        finalizer::{finalizer, Event},
        reflector::ObjectRef,
        watcher::Config as WatcherConfig,
    },
    Client, Resource, ResourceExt,
};
use prefixd_ipam::{request::check_compatible, AddressSet, AllocationResult, IpRange};
use prefixd_trace::telemetry::record_trace_id;

use crate::{
    context::{error_policy, ContextWith, Ctx, State},
    controller::{
        allocator::{AllocationState, Allocator},
        backoff::Backoff,
        config::Config,
        error::Error,
        metrics::Metrics,
        object::{AllocationObject, Object, PrefixObject},
        store::{allocations_referencing, KubeStore, Store},
    },
    crd::{
        common::{parse_blocks, Phase},
        prefix::PREFIX_FINALIZER,
    },
    util::{get_namespaced_name, is_deleting},
};

use super::record;

type PrefixContext<S> = ContextWith<Arc<Allocator>, S>;

#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler<P: PrefixObject, S: Store>(
    prefix: Arc<P>,
    ctx: Arc<PrefixContext<S>>,
) -> Result<Action, Error> {
    record_trace_id();
    let _timer = ctx.metrics().reconciliation(prefix.as_ref());
    ctx.touch().await;

    let api = ctx.store().api::<P>(prefix.namespace().as_deref());
    finalizer(&api, PREFIX_FINALIZER, prefix, |event| async {
        match event {
            Event::Apply(prefix) => reconcile(prefix.as_ref(), ctx.clone()).await,
            Event::Cleanup(prefix) => cleanup(prefix.as_ref(), ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

#[tracing::instrument(skip_all)]
async fn reconcile<P: PrefixObject, S: Store>(
    prefix: &P,
    ctx: Arc<PrefixContext<S>>,
) -> Result<Action, Error> {
    let spec = prefix.prefix_spec();
    tracing::info!(
        name = get_namespaced_name(prefix),
        kind = %P::kind(&()),
        "reconcile prefix"
    );

    if let Err(e) = spec.validate() {
        tracing::warn!(name = prefix.name_any(), error=?e, "invalid prefix");
        record(
            ctx.store(),
            prefix,
            EventType::Warning,
            "InvalidSpec",
            e.to_string(),
        )
        .await;
        // an allocated block is kept whatever happens to the spec
        if !prefix.is_allocated() {
            let mut failed = prefix.clone();
            if failed.prefix_status_mut().set_phase(Phase::Failed) {
                ctx.store().replace_status(&failed).await?;
            }
        }
        return Ok(Action::await_change());
    }

    let prefix = match allocate_self(prefix, &ctx).await? {
        SelfAllocation::Ready(prefix) => prefix,
        SelfAllocation::Requeue(action) => return Ok(action),
    };

    process_allocations(&prefix, &ctx).await?;

    Ok(Action::requeue(ctx.interval()))
}

enum SelfAllocation<P> {
    Ready(P),
    Requeue(Action),
}

#[tracing::instrument(skip_all)]
async fn allocate_self<P: PrefixObject, S: Store>(
    prefix: &P,
    ctx: &PrefixContext<S>,
) -> Result<SelfAllocation<P>, Error> {
    if prefix.is_allocated() {
        return Ok(SelfAllocation::Ready(prefix.clone()));
    }

    if prefix.prefix_spec().is_root() {
        let mut root = prefix.clone();
        root.prefix_status_mut().set_phase(Phase::Allocated);
        let root = ctx.store().replace_status(&root).await?;
        tracing::info!(
            name = root.name_any(),
            prefix = ?root.prefix_spec().prefix,
            "root prefix allocated"
        );
        return Ok(SelfAllocation::Ready(root));
    }

    let allocator = &ctx.component;
    match allocator.apply(ctx.store(), ctx.metrics(), prefix).await? {
        AllocationState::Allocated(grant) => {
            let granted = match grant.result {
                AllocationResult::Prefix(granted) => granted,
                AllocationResult::Range(range) => {
                    return Err(Error::UnexpectedRange(range.to_string()))
                }
            };
            let mut new = prefix.clone();
            if new.assign(&granted, &grant.parent) {
                new = ctx.store().replace(&new).await?;
            }
            new.prefix_status_mut().set_phase(Phase::Allocated);
            let new = ctx.store().replace_status(&new).await?;
            tracing::info!(
                name = new.name_any(),
                prefix = granted.to_string(),
                parent = grant.parent,
                "prefix allocated"
            );
            record(
                ctx.store(),
                &new,
                EventType::Normal,
                "Allocated",
                format!("{} is granted by {}", granted, grant.parent),
            )
            .await;
            Ok(SelfAllocation::Ready(new))
        }
        AllocationState::Pending => {
            mark_pending(prefix, ctx.store()).await?;
            Ok(SelfAllocation::Requeue(Action::requeue(ctx.interval())))
        }
        AllocationState::Waiting(delay) => {
            mark_pending(prefix, ctx.store()).await?;
            Ok(SelfAllocation::Requeue(Action::requeue(delay)))
        }
    }
}

async fn mark_pending<P: PrefixObject, S: Store>(prefix: &P, store: &S) -> Result<(), Error> {
    let mut pending = prefix.clone();
    if pending.prefix_status_mut().set_phase(Phase::Pending) {
        store.replace_status(&pending).await?;
    }
    Ok(())
}

/// Serves the allocations bound to this prefix and refreshes the used, reserved and available blocks.
#[tracing::instrument(skip_all)]
async fn process_allocations<P: PrefixObject, S: Store>(
    prefix: &P,
    ctx: &PrefixContext<S>,
) -> Result<(), Error> {
    let spec = prefix.prefix_spec();
    let family = spec.ip_family;
    let own = spec
        .own_prefix()
        .map_err(Error::CRD)?
        .ok_or_else(|| Error::NotAllocated(prefix.name_any()))?;
    let namespace = prefix.namespace();
    let kind = <P::Allocation as Resource>::kind(&()).to_string();

    let all = ctx
        .store()
        .list::<P::Allocation>(namespace.as_deref(), None)
        .await?;
    let children = allocations_referencing(&all, &prefix.name_any());

    let mut granted: Vec<AllocationResult> = Vec::new();
    let mut taken = AddressSet::new(family.into());
    for child in children
        .iter()
        .filter(|a| a.phase() == Some(Phase::Allocated))
    {
        match child.result() {
            Ok(Some(result)) if result.family() == taken.family() => {
                taken = taken.union(&result.to_set()).map_err(Error::Ipam)?;
                granted.push(result);
            }
            _ => tracing::warn!(
                name = child.name_any(),
                "ignore allocated allocation without a valid result"
            ),
        }
    }

    // intersection of the explicit reservations with the own block
    let own_set = AddressSet::from_prefix(&own);
    let explicit = parse_blocks(&spec.reservations, family).map_err(Error::CRD)?;
    let mut reserved = own_set.subtract(&own_set.subtract(&explicit));
    // reservation lengths never take a block a child already holds
    let mut available = own_set.subtract(&reserved).subtract(&taken);
    for length in spec.reservation_lengths.iter() {
        match available.remove_free_prefix(*length) {
            Some((block, rest)) => {
                reserved = reserved.union_prefix(&block).map_err(Error::Ipam)?;
                available = rest;
            }
            None => {
                tracing::warn!(name = prefix.name_any(), length, "no room for reservation")
            }
        }
    }

    let mut pending: Vec<&P::Allocation> = children
        .iter()
        .copied()
        .filter(|a| matches!(a.phase(), None | Some(Phase::Pending)))
        .collect();
    pending.sort_by(|a, b| {
        let created = |x: &P::Allocation| x.meta().creation_timestamp.as_ref().map(|t| t.0);
        created(*a)
            .cmp(&created(*b))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });

    for allocation in pending {
        let request = match allocation.request_spec().to_request() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(name = allocation.name_any(), error=?e, "invalid allocation request");
                fail(allocation, ctx, &kind).await?;
                continue;
            }
        };

        if let Err(reason) = check_compatible(&own, &request) {
            if allocation.prefix_selector().is_some() {
                tracing::info!(
                    name = allocation.name_any(),
                    parent = prefix.name_any(),
                    reason = reason.to_string(),
                    "evict allocation"
                );
                record(
                    ctx.store(),
                    allocation,
                    EventType::Warning,
                    "Evicted",
                    format!("{} cannot serve it: {}", prefix.name_any(), reason),
                )
                .await;
                ctx.store()
                    .delete::<P::Allocation>(namespace.as_deref(), &allocation.name_any())
                    .await?;
                ctx.metrics().allocation(&kind, "evicted");
            } else {
                tracing::info!(
                    name = allocation.name_any(),
                    parent = prefix.name_any(),
                    reason = reason.to_string(),
                    "allocation can never be served"
                );
                fail(allocation, ctx, &kind).await?;
            }
            continue;
        }

        match available.remove_exact_or_best_fit(&request) {
            Some((result, rest)) => {
                available = rest;
                granted.push(result);
                let mut granted = allocation.clone();
                let status = granted.allocation_status_mut();
                status.result = Some((&result).into());
                status.set_phase(Phase::Allocated);
                ctx.store().replace_status(&granted).await?;
                ctx.metrics().allocation(&kind, "allocated");
                tracing::info!(
                    name = allocation.name_any(),
                    parent = prefix.name_any(),
                    result = result.to_string(),
                    "allocated"
                );
            }
            None => {
                if allocation.phase().is_none() {
                    let mut waiting = allocation.clone();
                    waiting.allocation_status_mut().set_phase(Phase::Pending);
                    ctx.store().replace_status(&waiting).await?;
                    ctx.metrics().allocation(&kind, "pending");
                }
                tracing::info!(
                    name = allocation.name_any(),
                    parent = prefix.name_any(),
                    request = request.to_string(),
                    "no room for allocation"
                );
            }
        }
    }

    let mut new = prefix.clone();
    let status = new.prefix_status_mut();
    let before = status.clone();
    status.used = granted_strings(granted);
    status.reserved = to_strings(&reserved);
    status.available = to_strings(&available);
    if *status != before {
        ctx.store().replace_status(&new).await?;
    }
    Ok(())
}

async fn fail<A: AllocationObject, S: Store>(
    allocation: &A,
    ctx: &PrefixContext<S>,
    kind: &str,
) -> Result<(), Error> {
    let mut failed = allocation.clone();
    if failed.allocation_status_mut().set_phase(Phase::Failed) {
        ctx.store().replace_status(&failed).await?;
        ctx.metrics().allocation(kind, "failed");
    }
    Ok(())
}

fn to_strings(set: &AddressSet) -> Vec<String> {
    set.prefixes().iter().map(|p| p.to_string()).collect()
}

// Each grant is listed as it was handed out, ordered by its first address.
fn granted_strings(mut granted: Vec<AllocationResult>) -> Vec<String> {
    granted.sort_by_key(|result| {
        let range = match result {
            AllocationResult::Prefix(p) => IpRange::from_net(p),
            AllocationResult::Range(r) => *r,
        };
        (range.from(), range.to())
    });
    granted.iter().map(|result| result.to_string()).collect()
}

#[tracing::instrument(skip_all)]
async fn cleanup<P: PrefixObject, S: Store>(
    prefix: &P,
    ctx: Arc<PrefixContext<S>>,
) -> Result<Action, Error> {
    let all = ctx
        .store()
        .list::<P::Allocation>(prefix.namespace().as_deref(), None)
        .await?;
    let dependents = allocations_referencing(&all, &prefix.name_any()).len();
    if dependents > 0 {
        tracing::info!(
            name = prefix.name_any(),
            dependents,
            "prefix is still referenced"
        );
        return Err(Error::HasDependents(prefix.name_any(), dependents));
    }

    ctx.component.backoff().forget(&Backoff::key(prefix));
    tracing::info!(name = prefix.name_any(), "clean up prefix");
    Ok(Action::await_change())
}

pub async fn run<P: PrefixObject>(
    state: State,
    config: Config,
    allocator: Arc<Allocator>,
    metrics: Metrics,
) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let prefixes = P::api(client.clone(), None);
    if let Err(e) = prefixes.list(&ListParams::default().limit(1)).await {
        tracing::error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        tracing::info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
    let allocations = <P::Allocation as Object>::api(client.clone(), None);
    let store = KubeStore::new(client, state.reporter().await);

    tracing::info!("Start {} reconciler", P::kind(&()));

    Controller::new(prefixes, WatcherConfig::default().any_semantic())
        .owns(allocations.clone(), WatcherConfig::default())
        .watches(
            allocations,
            WatcherConfig::default(),
            |allocation: P::Allocation| {
                if is_deleting(&allocation) {
                    return None;
                }
                allocation.prefix_ref().map(|r| {
                    let parent = ObjectRef::<P>::new(&r.name);
                    match allocation.namespace() {
                        Some(ns) => parent.within(&ns),
                        None => parent,
                    }
                })
            },
        )
        .shutdown_on_signal()
        .run(
            reconciler::<P, KubeStore>,
            error_policy::<P, Error, PrefixContext<KubeStore>>,
            state.to_context_with(store, config.requeue_interval, allocator, metrics),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use assert_json_diff::assert_json_include;
    use chrono::Utc;
    use http::Response;
    use hyper::{body::to_bytes, Body};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::runtime::{controller::Action, finalizer::Error as FinalizerError};

    use crate::{
        context::ContextWith,
        controller::{allocator::Allocator, backoff::Backoff, error::Error},
        crd::{
            common::IpFamily,
            prefix::{Prefix, PREFIX_FINALIZER},
        },
        fixture::reconciler::{
            assert_resource_request, test_allocation, test_length_request, test_root_prefix,
            timeout_after_1s, ApiServerVerifier,
        },
    };

    use super::reconciler;

    enum Scenario {
        FinalizerCreation(Prefix),
        Cleanup(Prefix),
        CleanupBlocked(Prefix),
    }

    impl ApiServerVerifier {
        fn prefix_run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                match scenario {
                    Scenario::FinalizerCreation(prefix) => self.prefix_add_finalizer(&prefix).await,
                    Scenario::Cleanup(prefix) => {
                        self.prefix_list_allocations(false)
                            .await
                            .unwrap()
                            .prefix_remove_finalizer(&prefix)
                            .await
                    }
                    Scenario::CleanupBlocked(_) => self.prefix_list_allocations(true).await,
                }
                .expect("reconcile completed without error");
            })
        }

        async fn prefix_add_finalizer(mut self, prefix: &Prefix) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(&request, prefix, None, false, None, http::Method::PATCH);
            let expected_patch = serde_json::json!([
                { "op": "test", "path": "/metadata/finalizers", "value": null },
                { "op": "add", "path": "/metadata/finalizers", "value": vec![PREFIX_FINALIZER] }
            ]);
            let req_body = to_bytes(request.into_body()).await.unwrap();
            let runtime_patch: serde_json::Value =
                serde_json::from_slice(&req_body).expect("valid document from runtime");
            assert_json_include!(actual: runtime_patch, expected: expected_patch);
            let mut guarded = prefix.clone();
            guarded.metadata.finalizers = Some(vec![PREFIX_FINALIZER.to_string()]);
            let response = serde_json::to_vec(&guarded).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn prefix_list_allocations(mut self, referenced: bool) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().path(),
                "/apis/ipam.prefixd.io/v1alpha1/namespaces/default/prefixallocations"
            );
            let items = if referenced {
                vec![test_allocation(
                    "child-alloc",
                    Some("root"),
                    test_length_request(IpFamily::IPv4, 28),
                )]
            } else {
                vec![test_allocation(
                    "other-alloc",
                    Some("other"),
                    test_length_request(IpFamily::IPv4, 28),
                )]
            };
            let list = serde_json::json!({
                "apiVersion": "ipam.prefixd.io/v1alpha1",
                "kind": "PrefixAllocationList",
                "metadata": {},
                "items": items,
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&list).unwrap()))
                    .unwrap(),
            );
            Ok(self)
        }

        async fn prefix_remove_finalizer(mut self, prefix: &Prefix) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(&request, prefix, None, false, None, http::Method::PATCH);
            let expected_patch = serde_json::json!([
                { "op": "test", "path": "/metadata/finalizers/0", "value": PREFIX_FINALIZER },
                { "op": "remove", "path": "/metadata/finalizers/0" }
            ]);
            let req_body = to_bytes(request.into_body()).await.unwrap();
            let runtime_patch: serde_json::Value =
                serde_json::from_slice(&req_body).expect("valid document from runtime");
            assert_json_include!(actual: runtime_patch, expected: expected_patch);
            let mut released = prefix.clone();
            released.metadata.finalizers = None;
            let response = serde_json::to_vec(&released).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }
    }

    fn allocator() -> Arc<Allocator> {
        Arc::new(Allocator::new(
            Arc::new(Backoff::new(Duration::from_secs(1), Duration::from_secs(8))),
            None,
        ))
    }

    fn deleting_root() -> Prefix {
        let mut prefix = test_root_prefix("root", "10.0.0.0/24");
        prefix.metadata.deletion_timestamp = Some(Time(Utc::now()));
        prefix
    }

    #[tokio::test]
    async fn adds_finalizer_and_waits() {
        let (ctx, fakeserver, _) = ContextWith::test(allocator());
        let mut prefix = test_root_prefix("root", "10.0.0.0/24");
        prefix.metadata.finalizers = None;

        let mocksvr = fakeserver.prefix_run(Scenario::FinalizerCreation(prefix.clone()));
        let action = reconciler(Arc::new(prefix), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn removes_finalizer_without_dependents() {
        let (ctx, fakeserver, _) = ContextWith::test(allocator());
        let prefix = deleting_root();

        let mocksvr = fakeserver.prefix_run(Scenario::Cleanup(prefix.clone()));
        let action = reconciler(Arc::new(prefix), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn keeps_finalizer_while_referenced() {
        let (ctx, fakeserver, _) = ContextWith::test(allocator());
        let prefix = deleting_root();

        let mocksvr = fakeserver.prefix_run(Scenario::CleanupBlocked(prefix.clone()));
        let res = reconciler(Arc::new(prefix), ctx).await;
        match res {
            Err(Error::Finalizer(e)) => assert!(matches!(
                e.as_ref(),
                FinalizerError::CleanupFailed(Error::HasDependents(name, 1)) if name == "root"
            )),
            _ => panic!("cleanup must fail while an allocation references the prefix"),
        }
        timeout_after_1s(mocksvr).await;
    }
}
