use std::fmt::Debug;

use ipnet::IpNet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{core::ObjectMeta, Api, Client, Resource};
use prefixd_ipam::{request::check_compatible, AllocationRequest, AllocationResult};
use serde::{de::DeserializeOwned, Serialize};

use crate::crd::{
    common::{IpFamily, LocalObjectRef, Phase},
    error::Error,
    ip::{IP, IP_UID_LABEL},
    prefix::{
        ClusterPrefix, Prefix, PrefixSpec, PrefixStatus, CLUSTER_PREFIX_UID_LABEL, PREFIX_UID_LABEL,
    },
    prefix_allocation::{
        AllocationRequestSpec, ClusterPrefixAllocation, PrefixAllocation, PrefixAllocationSpec,
        PrefixAllocationStatus,
    },
};

/// A custom resource the store can read and write.
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_object {
    ($($t:ty),*) => {
        $(
            impl Object for $t {
                fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )*
    };
}

macro_rules! cluster_object {
    ($($t:ty),*) => {
        $(
            impl Object for $t {
                fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

namespaced_object!(Prefix, PrefixAllocation, IP);
cluster_object!(ClusterPrefix, ClusterPrefixAllocation);

/// Anything that takes address space from a parent prefix through allocations.
pub trait Requester: Object {
    type Allocation: AllocationObject;

    /// Label marking allocations created by this requester. The value is the requester UID.
    const LABEL: &'static str;

    fn desired_request(&self) -> Result<AllocationRequest, Error>;

    /// Where the allocation should be served from. A selector takes precedence over a reference.
    fn parent_binding(&self) -> (Option<LocalObjectRef>, Option<LabelSelector>);

    fn desired_allocation(&self) -> Result<PrefixAllocationSpec, Error> {
        let request = self.desired_request()?;
        let (prefix_ref, prefix_selector) = self.parent_binding();
        Ok(PrefixAllocationSpec {
            prefix_ref,
            prefix_selector,
            request: AllocationRequestSpec::from(&request),
        })
    }
}

pub trait AllocationObject: Object {
    /// The kind of prefix serving this allocation.
    type Parent: PrefixObject;

    fn build(metadata: ObjectMeta, spec: PrefixAllocationSpec) -> Self;
    fn allocation_spec(&self) -> PrefixAllocationSpec;
    fn prefix_ref(&self) -> Option<&LocalObjectRef>;
    fn prefix_selector(&self) -> Option<&LabelSelector>;
    fn set_prefix_ref(&mut self, parent: &str);
    fn request_spec(&self) -> &AllocationRequestSpec;
    fn allocation_status(&self) -> Option<&PrefixAllocationStatus>;
    fn allocation_status_mut(&mut self) -> &mut PrefixAllocationStatus;

    fn phase(&self) -> Option<Phase> {
        self.allocation_status().and_then(|s| s.phase)
    }

    fn family(&self) -> IpFamily {
        self.request_spec().ip_family
    }

    fn result(&self) -> Result<Option<AllocationResult>, Error> {
        self.allocation_status()
            .and_then(|s| s.result.as_ref())
            .map(|r| r.to_result(self.family()))
            .transpose()
    }
}

pub trait PrefixObject: Requester {
    fn prefix_spec(&self) -> PrefixSpec;
    fn prefix_status(&self) -> Option<&PrefixStatus>;
    fn prefix_status_mut(&mut self) -> &mut PrefixStatus;

    /// Records the granted block and parent in the spec. Returns false when nothing changed.
    fn assign(&mut self, prefix: &IpNet, parent: &str) -> bool;

    fn is_allocated(&self) -> bool {
        self.prefix_status()
            .map(|s| s.is_allocated())
            .unwrap_or(false)
    }

    /// Whether `request` could be served according to the recorded bookkeeping.
    fn can_serve(&self, request: &AllocationRequest) -> bool {
        let spec = self.prefix_spec();
        let own = match spec.own_prefix() {
            Ok(Some(own)) => own,
            _ => return false,
        };
        if check_compatible(&own, request).is_err() {
            return false;
        }
        self.prefix_status()
            .and_then(|s| s.derive_available(&own, spec.ip_family).ok())
            .map(|available| available.can_serve(request))
            .unwrap_or(false)
    }
}

fn binding(
    parent_ref: &Option<LocalObjectRef>,
    selector: &Option<LabelSelector>,
) -> (Option<LocalObjectRef>, Option<LabelSelector>) {
    match selector {
        Some(selector) => (None, Some(selector.clone())),
        None => (parent_ref.clone(), None),
    }
}

impl Requester for Prefix {
    type Allocation = PrefixAllocation;
    const LABEL: &'static str = PREFIX_UID_LABEL;

    fn desired_request(&self) -> Result<AllocationRequest, Error> {
        self.spec.desired_request()
    }

    fn parent_binding(&self) -> (Option<LocalObjectRef>, Option<LabelSelector>) {
        binding(&self.spec.parent_ref, &self.spec.parent_selector)
    }
}

impl PrefixObject for Prefix {
    fn prefix_spec(&self) -> PrefixSpec {
        self.spec.clone()
    }

    fn prefix_status(&self) -> Option<&PrefixStatus> {
        self.status.as_ref()
    }

    fn prefix_status_mut(&mut self) -> &mut PrefixStatus {
        self.status.get_or_insert_with(PrefixStatus::default)
    }

    fn assign(&mut self, prefix: &IpNet, parent: &str) -> bool {
        self.spec.assign(prefix, parent)
    }
}

impl Requester for ClusterPrefix {
    type Allocation = ClusterPrefixAllocation;
    const LABEL: &'static str = CLUSTER_PREFIX_UID_LABEL;

    fn desired_request(&self) -> Result<AllocationRequest, Error> {
        self.prefix_spec().desired_request()
    }

    fn parent_binding(&self) -> (Option<LocalObjectRef>, Option<LabelSelector>) {
        binding(&self.spec.parent_ref, &self.spec.parent_selector)
    }
}

impl PrefixObject for ClusterPrefix {
    fn prefix_spec(&self) -> PrefixSpec {
        PrefixSpec::from(self.spec.clone())
    }

    fn prefix_status(&self) -> Option<&PrefixStatus> {
        self.status.as_ref()
    }

    fn prefix_status_mut(&mut self) -> &mut PrefixStatus {
        self.status.get_or_insert_with(PrefixStatus::default)
    }

    fn assign(&mut self, prefix: &IpNet, parent: &str) -> bool {
        self.spec.assign(prefix, parent)
    }
}

impl Requester for IP {
    type Allocation = PrefixAllocation;
    const LABEL: &'static str = IP_UID_LABEL;

    fn desired_request(&self) -> Result<AllocationRequest, Error> {
        self.spec.desired_request()
    }

    fn parent_binding(&self) -> (Option<LocalObjectRef>, Option<LabelSelector>) {
        binding(&self.spec.prefix_ref, &self.spec.prefix_selector)
    }
}

impl AllocationObject for PrefixAllocation {
    type Parent = Prefix;

    fn build(metadata: ObjectMeta, spec: PrefixAllocationSpec) -> Self {
        PrefixAllocation {
            metadata,
            spec,
            status: None,
        }
    }

    fn allocation_spec(&self) -> PrefixAllocationSpec {
        self.spec.clone()
    }

    fn prefix_ref(&self) -> Option<&LocalObjectRef> {
        self.spec.prefix_ref.as_ref()
    }

    fn prefix_selector(&self) -> Option<&LabelSelector> {
        self.spec.prefix_selector.as_ref()
    }

    fn set_prefix_ref(&mut self, parent: &str) {
        self.spec.prefix_ref = Some(LocalObjectRef::new(parent));
    }

    fn request_spec(&self) -> &AllocationRequestSpec {
        &self.spec.request
    }

    fn allocation_status(&self) -> Option<&PrefixAllocationStatus> {
        self.status.as_ref()
    }

    fn allocation_status_mut(&mut self) -> &mut PrefixAllocationStatus {
        self.status
            .get_or_insert_with(PrefixAllocationStatus::default)
    }
}

impl AllocationObject for ClusterPrefixAllocation {
    type Parent = ClusterPrefix;

    fn build(metadata: ObjectMeta, spec: PrefixAllocationSpec) -> Self {
        ClusterPrefixAllocation {
            metadata,
            spec: spec.into(),
            status: None,
        }
    }

    fn allocation_spec(&self) -> PrefixAllocationSpec {
        self.spec.clone().into()
    }

    fn prefix_ref(&self) -> Option<&LocalObjectRef> {
        self.spec.prefix_ref.as_ref()
    }

    fn prefix_selector(&self) -> Option<&LabelSelector> {
        self.spec.prefix_selector.as_ref()
    }

    fn set_prefix_ref(&mut self, parent: &str) {
        self.spec.prefix_ref = Some(LocalObjectRef::new(parent));
    }

    fn request_spec(&self) -> &AllocationRequestSpec {
        &self.spec.request
    }

    fn allocation_status(&self) -> Option<&PrefixAllocationStatus> {
        self.status.as_ref()
    }

    fn allocation_status_mut(&mut self) -> &mut PrefixAllocationStatus {
        self.status
            .get_or_insert_with(PrefixAllocationStatus::default)
    }
}
