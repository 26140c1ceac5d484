use ipnet::IpNet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::CustomResource;
use prefixd_ipam::{AddressSet, AllocationRequest};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    common::{now, parse_block, parse_blocks, parse_prefix, IpFamily, LocalObjectRef, Phase},
    error::Error,
};

pub const PREFIX_FINALIZER: &str = "prefix.ipam.prefixd.io/finalizer";
pub const PREFIX_UID_LABEL: &str = "ipam.prefixd.io/prefix-uid";
pub const CLUSTER_PREFIX_UID_LABEL: &str = "ipam.prefixd.io/cluster-prefix-uid";

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "ipam.prefixd.io",
    version = "v1alpha1",
    kind = "Prefix",
    namespaced
)]
#[kube(status = "PrefixStatus")]
#[kube(
    printcolumn = r#"{"name":"PREFIX", "type":"string", "description":"Assigned prefix", "jsonPath":".spec.prefix"}"#,
    printcolumn = r#"{"name":"FAMILY", "type":"string", "description":"Address family", "jsonPath":".spec.ipFamily"}"#,
    printcolumn = r#"{"name":"PARENT", "type":"string", "description":"Parent prefix", "jsonPath":".spec.parentRef.name"}"#,
    printcolumn = r#"{"name":"PHASE", "type":"string", "description":"Phase", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PrefixSpec {
    pub ip_family: IpFamily,
    pub prefix: Option<String>,
    pub prefix_length: Option<u8>,
    pub parent_ref: Option<LocalObjectRef>,
    pub parent_selector: Option<LabelSelector>,
    #[serde(default)]
    pub reservations: Vec<String>,
    #[serde(default)]
    pub reservation_lengths: Vec<u8>,
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "ipam.prefixd.io",
    version = "v1alpha1",
    kind = "ClusterPrefix"
)]
#[kube(status = "PrefixStatus")]
#[kube(
    printcolumn = r#"{"name":"PREFIX", "type":"string", "description":"Assigned prefix", "jsonPath":".spec.prefix"}"#,
    printcolumn = r#"{"name":"FAMILY", "type":"string", "description":"Address family", "jsonPath":".spec.ipFamily"}"#,
    printcolumn = r#"{"name":"PARENT", "type":"string", "description":"Parent prefix", "jsonPath":".spec.parentRef.name"}"#,
    printcolumn = r#"{"name":"PHASE", "type":"string", "description":"Phase", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPrefixSpec {
    pub ip_family: IpFamily,
    pub prefix: Option<String>,
    pub prefix_length: Option<u8>,
    pub parent_ref: Option<LocalObjectRef>,
    pub parent_selector: Option<LabelSelector>,
    #[serde(default)]
    pub reservations: Vec<String>,
    #[serde(default)]
    pub reservation_lengths: Vec<u8>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrefixStatus {
    pub phase: Option<Phase>,
    pub last_phase_transition_time: Option<Time>,
    #[serde(default)]
    pub used: Vec<String>,
    #[serde(default)]
    pub reserved: Vec<String>,
    #[serde(default)]
    pub available: Vec<String>,
}

impl PrefixStatus {
    pub fn is_allocated(&self) -> bool {
        self.phase == Some(Phase::Allocated)
    }

    /// Moves to `phase`, stamping the transition time when the phase actually changes.
    pub fn set_phase(&mut self, phase: Phase) -> bool {
        if self.phase == Some(phase) {
            return false;
        }
        self.phase = Some(phase);
        self.last_phase_transition_time = Some(now());
        true
    }

    /// Space that can still be handed out, derived from the recorded used and reserved blocks.
    pub fn derive_available(&self, own: &IpNet, family: IpFamily) -> Result<AddressSet, Error> {
        let used = parse_blocks(&self.used, family)?;
        let reserved = parse_blocks(&self.reserved, family)?;
        Ok(AddressSet::from_prefix(own)
            .subtract(&reserved)
            .subtract(&used))
    }
}

impl PrefixSpec {
    pub fn is_root(&self) -> bool {
        self.parent_ref.is_none() && self.parent_selector.is_none()
    }

    pub fn validate(&self) -> Result<(), Error> {
        let family = self.ip_family;
        let bits = prefixd_ipam::IpFamily::from(family).bits();

        if self.parent_ref.is_some() && self.parent_selector.is_some() && self.prefix.is_none() {
            return Err(Error::ParentRefAndSelector);
        }

        let prefix = self.own_prefix()?;
        if let Some(length) = self.prefix_length {
            if length > bits {
                return Err(Error::InvalidPrefixLength(length, family));
            }
        }

        if self.is_root() {
            if prefix.is_none() {
                return Err(Error::RootWithoutPrefix);
            }
            if self.prefix_length.is_some() {
                return Err(Error::RootWithPrefixLength);
            }
        } else if prefix.is_none() && self.prefix_length.is_none() {
            return Err(Error::MissingPrefix);
        }

        if let (Some(prefix), Some(length)) = (prefix, self.prefix_length) {
            if prefix.prefix_len() != length {
                return Err(Error::PrefixLengthMismatch(prefix.prefix_len(), length));
            }
        }

        for reservation in self.reservations.iter() {
            parse_block(reservation, family)?;
        }

        let own_length = prefix.map(|p| p.prefix_len()).or(self.prefix_length);
        for length in self.reservation_lengths.iter() {
            if *length > bits {
                return Err(Error::InvalidPrefixLength(*length, family));
            }
            if let Some(own_length) = own_length {
                if *length <= own_length {
                    return Err(Error::InvalidReservationLength(*length, own_length));
                }
            }
        }
        Ok(())
    }

    /// The block this prefix owns, once known.
    pub fn own_prefix(&self) -> Result<Option<IpNet>, Error> {
        self.prefix
            .as_deref()
            .map(|p| parse_prefix(p, self.ip_family).map(|p| p.trunc()))
            .transpose()
    }

    /// What this prefix asks its parent for.
    /// A length wins over an exact prefix so that a selector-granted child keeps asking for the same thing.
    pub fn desired_request(&self) -> Result<AllocationRequest, Error> {
        match (self.prefix_length, self.own_prefix()?) {
            (Some(length), _) => Ok(AllocationRequest::PrefixLength {
                family: self.ip_family.into(),
                length,
            }),
            (None, Some(prefix)) => Ok(AllocationRequest::Prefix(prefix)),
            (None, None) => Err(Error::MissingPrefix),
        }
    }

    /// Records a grant. Fields that are already set are never overwritten.
    pub fn assign(&mut self, prefix: &IpNet, parent: &str) -> bool {
        assign_fields(&mut self.prefix, &mut self.parent_ref, prefix, parent)
    }
}

impl ClusterPrefixSpec {
    pub fn assign(&mut self, prefix: &IpNet, parent: &str) -> bool {
        assign_fields(&mut self.prefix, &mut self.parent_ref, prefix, parent)
    }
}

impl From<ClusterPrefixSpec> for PrefixSpec {
    fn from(value: ClusterPrefixSpec) -> Self {
        PrefixSpec {
            ip_family: value.ip_family,
            prefix: value.prefix,
            prefix_length: value.prefix_length,
            parent_ref: value.parent_ref,
            parent_selector: value.parent_selector,
            reservations: value.reservations,
            reservation_lengths: value.reservation_lengths,
        }
    }
}

fn assign_fields(
    prefix: &mut Option<String>,
    parent_ref: &mut Option<LocalObjectRef>,
    granted: &IpNet,
    parent: &str,
) -> bool {
    let mut changed = false;
    if prefix.is_none() {
        *prefix = Some(granted.to_string());
        changed = true;
    }
    if parent_ref.is_none() {
        *parent_ref = Some(LocalObjectRef::new(parent));
        changed = true;
    }
    changed
}
