use std::{
    cmp::Ordering,
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use kube::{core::ObjectMeta, Resource, ResourceExt};
use prefixd_ipam::AllocationResult;

use crate::{
    crd::common::Phase,
    util::{create_owner_reference, get_uid, is_deleting, is_owned_by},
};

use super::{
    backoff::Backoff,
    error::Error,
    metrics::Metrics,
    object::{AllocationObject, PrefixObject, Requester},
    store::Store,
};

/// Where a requester stands with its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationState {
    Allocated(Grant),
    /// The active allocation is still being worked on.
    Pending,
    /// The last attempt failed and the next one is deferred by this long.
    Waiting(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub result: AllocationResult,
    /// Name of the prefix that served the request.
    pub parent: String,
}

/// Drives the allocation objects owned by requesters.
pub struct Allocator {
    backoff: Arc<Backoff>,
    timeout: Option<Duration>,
}

impl Allocator {
    pub fn new(backoff: Arc<Backoff>, timeout: Option<Duration>) -> Allocator {
        Allocator { backoff, timeout }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Reconciles the allocations owned by `requester` and reports the outcome.
    #[tracing::instrument(skip_all)]
    pub async fn apply<R: Requester, S: Store>(
        &self,
        store: &S,
        metrics: &Metrics,
        requester: &R,
    ) -> Result<AllocationState, Error> {
        let namespace = requester.namespace();
        let uid = get_uid(requester).map_err(Error::KubeLibrary)?;
        let desired = requester.desired_allocation().map_err(Error::CRD)?;
        let kind = R::kind(&()).to_string();

        let owned: Vec<R::Allocation> = store
            .list::<R::Allocation>(namespace.as_deref(), None)
            .await?
            .into_iter()
            .filter(|a| !is_deleting(a))
            .filter(|a| is_owned_by(a.meta(), &uid) || a.labels().get(R::LABEL) == Some(&uid))
            .collect();

        let now = Utc::now();
        let (mut active, mut outdated): (Vec<_>, Vec<_>) = owned
            .into_iter()
            .partition(|a| a.allocation_spec().satisfies(&desired));
        active.sort_by(|a, b| self.prefer(a, b, now));
        if active.len() > 1 {
            outdated.extend(active.split_off(1));
        }

        let deletions = outdated.iter().map(|a| {
            tracing::info!(
                name = a.name_any(),
                requester = requester.name_any(),
                "delete outdated allocation"
            );
            store.delete::<R::Allocation>(
                namespace.as_deref(),
                a.meta().name.as_deref().unwrap_or_default(),
            )
        });
        for result in join_all(deletions).await {
            if let Err(e) = result {
                tracing::warn!(error=?e, "failed to delete outdated allocation");
            }
        }

        let key = Backoff::key(requester);
        let current = match active.into_iter().next() {
            Some(current) => current,
            None => {
                let created = self.create(store, requester, &uid).await?;
                tracing::info!(
                    name = created.name_any(),
                    requester = requester.name_any(),
                    "create allocation"
                );
                return Ok(AllocationState::Pending);
            }
        };

        match self.adjusted_phase(&current, now) {
            Some(Phase::Allocated) => {
                let result = current
                    .result()
                    .map_err(Error::CRD)?
                    .ok_or_else(|| Error::MissingResult(current.name_any()))?;
                let parent = current
                    .prefix_ref()
                    .map(|r| r.name.clone())
                    .ok_or_else(|| Error::NotFound(format!("parent of {}", current.name_any())))?;
                self.backoff.forget(&key);
                Ok(AllocationState::Allocated(Grant { result, parent }))
            }
            Some(Phase::Failed) => {
                let instant = Instant::now();
                if let Some(remaining) = self.backoff.remaining(&key, instant) {
                    tracing::info!(
                        requester = requester.name_any(),
                        remaining = ?remaining,
                        "allocation failed, waiting for backoff"
                    );
                    return Ok(AllocationState::Waiting(remaining));
                }
                if !self.can_retry::<R, S>(store, requester, &current).await? {
                    let delay = self.backoff.next(&key, instant);
                    tracing::info!(
                        requester = requester.name_any(),
                        delay = ?delay,
                        "parent cannot serve the request now"
                    );
                    return Ok(AllocationState::Waiting(delay));
                }
                store
                    .delete::<R::Allocation>(namespace.as_deref(), &current.name_any())
                    .await?;
                let created = self.create(store, requester, &uid).await?;
                let delay = self.backoff.next(&key, instant);
                metrics.requester_retry(&kind);
                tracing::info!(
                    name = created.name_any(),
                    requester = requester.name_any(),
                    delay = ?delay,
                    "retry allocation"
                );
                Ok(AllocationState::Pending)
            }
            _ => Ok(AllocationState::Pending),
        }
    }

    /// Phase as seen by the requester.
    /// A bound allocation stuck short of a terminal phase past the timeout counts as failed.
    pub fn adjusted_phase<A: AllocationObject>(
        &self,
        allocation: &A,
        now: DateTime<Utc>,
    ) -> Option<Phase> {
        let phase = allocation.phase();
        if matches!(phase, Some(Phase::Allocated) | Some(Phase::Failed)) {
            return phase;
        }
        let timeout = match self.timeout {
            Some(timeout) => timeout,
            None => return phase,
        };
        if allocation.prefix_ref().is_none() {
            return phase;
        }
        let since = allocation
            .allocation_status()
            .and_then(|s| s.last_phase_transition_time.as_ref())
            .or(allocation.meta().creation_timestamp.as_ref())
            .map(|t| t.0);
        match since {
            Some(since) if now.signed_duration_since(since).to_std().unwrap_or_default() > timeout => {
                Some(Phase::Failed)
            }
            _ => phase,
        }
    }

    // Allocated first, then pending, then failed. Older wins a tie.
    fn prefer<A: AllocationObject>(&self, a: &A, b: &A, now: DateTime<Utc>) -> Ordering {
        let rank = |x: &A| match self.adjusted_phase(x, now) {
            Some(Phase::Allocated) => 0,
            Some(Phase::Pending) | None => 1,
            Some(Phase::Failed) => 2,
        };
        let created = |x: &A| x.meta().creation_timestamp.as_ref().map(|t| t.0);
        rank(a)
            .cmp(&rank(b))
            .then_with(|| created(a).cmp(&created(b)))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    }

    async fn create<R: Requester, S: Store>(
        &self,
        store: &S,
        requester: &R,
        uid: &str,
    ) -> Result<R::Allocation, Error> {
        let spec = requester.desired_allocation().map_err(Error::CRD)?;
        let metadata = ObjectMeta {
            generate_name: Some(format!("{}-", requester.name_any())),
            namespace: requester.namespace(),
            labels: Some(BTreeMap::from([(R::LABEL.to_string(), uid.to_string())])),
            owner_references: Some(vec![create_owner_reference(requester)]),
            ..Default::default()
        };
        store.create(&R::Allocation::build(metadata, spec)).await
    }

    // A pinned parent must be able to serve the request right now.
    // Selector-bound requests can always be rescheduled.
    async fn can_retry<R: Requester, S: Store>(
        &self,
        store: &S,
        requester: &R,
        current: &R::Allocation,
    ) -> Result<bool, Error> {
        let (parent_ref, _) = requester.parent_binding();
        let parent_ref = match parent_ref {
            Some(parent_ref) => parent_ref,
            None => return Ok(true),
        };
        let parent = match store
            .get::<<R::Allocation as AllocationObject>::Parent>(
                requester.namespace().as_deref(),
                &parent_ref.name,
            )
            .await?
        {
            Some(parent) => parent,
            None => return Ok(false),
        };
        if !parent.is_allocated() || is_deleting(&parent) {
            return Ok(false);
        }
        let request = current.request_spec().to_request().map_err(Error::CRD)?;
        Ok(parent.can_serve(&request))
    }
}
