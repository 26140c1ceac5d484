use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::CustomResource;
use prefixd_ipam::{AllocationRequest, AllocationResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    common::{now, parse_prefix, parse_range, IpFamily, LocalObjectRef, Phase},
    error::Error,
};

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "ipam.prefixd.io",
    version = "v1alpha1",
    kind = "PrefixAllocation",
    namespaced
)]
#[kube(status = "PrefixAllocationStatus")]
#[kube(
    printcolumn = r#"{"name":"PREFIXREF", "type":"string", "description":"Parent prefix", "jsonPath":".spec.prefixRef.name"}"#,
    printcolumn = r#"{"name":"PHASE", "type":"string", "description":"Phase", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"PREFIX", "type":"string", "description":"Granted prefix", "jsonPath":".status.result.prefix"}"#,
    printcolumn = r#"{"name":"RANGE", "type":"string", "description":"Granted range", "jsonPath":".status.result.range"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PrefixAllocationSpec {
    pub prefix_ref: Option<LocalObjectRef>,
    pub prefix_selector: Option<LabelSelector>,
    pub request: AllocationRequestSpec,
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "ipam.prefixd.io",
    version = "v1alpha1",
    kind = "ClusterPrefixAllocation"
)]
#[kube(status = "PrefixAllocationStatus")]
#[kube(
    printcolumn = r#"{"name":"PREFIXREF", "type":"string", "description":"Parent prefix", "jsonPath":".spec.prefixRef.name"}"#,
    printcolumn = r#"{"name":"PHASE", "type":"string", "description":"Phase", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"PREFIX", "type":"string", "description":"Granted prefix", "jsonPath":".status.result.prefix"}"#,
    printcolumn = r#"{"name":"RANGE", "type":"string", "description":"Granted range", "jsonPath":".status.result.range"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPrefixAllocationSpec {
    pub prefix_ref: Option<LocalObjectRef>,
    pub prefix_selector: Option<LabelSelector>,
    pub request: AllocationRequestSpec,
}

impl From<ClusterPrefixAllocationSpec> for PrefixAllocationSpec {
    fn from(value: ClusterPrefixAllocationSpec) -> Self {
        PrefixAllocationSpec {
            prefix_ref: value.prefix_ref,
            prefix_selector: value.prefix_selector,
            request: value.request,
        }
    }
}

impl From<PrefixAllocationSpec> for ClusterPrefixAllocationSpec {
    fn from(value: PrefixAllocationSpec) -> Self {
        ClusterPrefixAllocationSpec {
            prefix_ref: value.prefix_ref,
            prefix_selector: value.prefix_selector,
            request: value.request,
        }
    }
}

impl PrefixAllocationSpec {
    /// Whether an existing allocation still asks for what `desired` asks for.
    /// A binding made by the scheduler does not make a selector-based allocation outdated.
    pub fn satisfies(&self, desired: &PrefixAllocationSpec) -> bool {
        if self.request != desired.request || self.prefix_selector != desired.prefix_selector {
            return false;
        }
        match desired.prefix_ref.as_ref() {
            Some(r) => self.prefix_ref.as_ref() == Some(r),
            None => true,
        }
    }
}

/// Exactly one of the optional fields is set.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequestSpec {
    pub ip_family: IpFamily,
    pub prefix: Option<String>,
    pub prefix_length: Option<u8>,
    pub range: Option<String>,
    pub range_length: Option<u64>,
}

impl AllocationRequestSpec {
    pub fn to_request(&self) -> Result<AllocationRequest, Error> {
        let family = self.ip_family;
        let request = match (
            self.prefix.as_deref(),
            self.prefix_length,
            self.range.as_deref(),
            self.range_length,
        ) {
            (Some(prefix), None, None, None) => {
                AllocationRequest::Prefix(parse_prefix(prefix, family)?.trunc())
            }
            (None, Some(length), None, None) => AllocationRequest::PrefixLength {
                family: family.into(),
                length,
            },
            (None, None, Some(range), None) => {
                AllocationRequest::Range(parse_range(range, family)?)
            }
            (None, None, None, Some(length)) => AllocationRequest::RangeLength {
                family: family.into(),
                length: length as u128,
            },
            _ => return Err(Error::InvalidRequest),
        };
        request.validate().map_err(|_| match request {
            AllocationRequest::PrefixLength { length, .. } => {
                Error::InvalidPrefixLength(length, family)
            }
            _ => Error::InvalidRequest,
        })?;
        Ok(request)
    }
}

impl From<&AllocationRequest> for AllocationRequestSpec {
    fn from(value: &AllocationRequest) -> Self {
        let ip_family = value.family().into();
        match value {
            AllocationRequest::Prefix(prefix) => AllocationRequestSpec {
                ip_family,
                prefix: Some(prefix.to_string()),
                ..Default::default()
            },
            AllocationRequest::PrefixLength { length, .. } => AllocationRequestSpec {
                ip_family,
                prefix_length: Some(*length),
                ..Default::default()
            },
            AllocationRequest::Range(range) => AllocationRequestSpec {
                ip_family,
                range: Some(range.to_string()),
                ..Default::default()
            },
            AllocationRequest::RangeLength { length, .. } => AllocationRequestSpec {
                ip_family,
                range_length: Some(u64::try_from(*length).unwrap_or(u64::MAX)),
                ..Default::default()
            },
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrefixAllocationStatus {
    pub phase: Option<Phase>,
    pub result: Option<AllocationResultSpec>,
    pub last_phase_transition_time: Option<Time>,
}

impl PrefixAllocationStatus {
    pub fn set_phase(&mut self, phase: Phase) -> bool {
        if self.phase == Some(phase) {
            return false;
        }
        self.phase = Some(phase);
        self.last_phase_transition_time = Some(now());
        true
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResultSpec {
    pub prefix: Option<String>,
    pub range: Option<String>,
}

impl AllocationResultSpec {
    pub fn to_result(&self, family: IpFamily) -> Result<AllocationResult, Error> {
        match (self.prefix.as_deref(), self.range.as_deref()) {
            (Some(prefix), None) => Ok(AllocationResult::Prefix(parse_prefix(prefix, family)?)),
            (None, Some(range)) => Ok(AllocationResult::Range(parse_range(range, family)?)),
            _ => Err(Error::InvalidResult),
        }
    }
}

impl From<&AllocationResult> for AllocationResultSpec {
    fn from(value: &AllocationResult) -> Self {
        match value {
            AllocationResult::Prefix(prefix) => AllocationResultSpec {
                prefix: Some(prefix.to_string()),
                range: None,
            },
            AllocationResult::Range(range) => AllocationResultSpec {
                prefix: None,
                range: Some(range.to_string()),
            },
        }
    }
}
