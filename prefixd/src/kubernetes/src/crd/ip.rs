use std::{net::IpAddr, str::FromStr};

use ipnet::IpNet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::CustomResource;
use prefixd_ipam::AllocationRequest;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    common::{now, IpFamily, LocalObjectRef, Phase},
    error::Error,
};

pub const IP_FINALIZER: &str = "ip.ipam.prefixd.io/finalizer";
pub const IP_UID_LABEL: &str = "ipam.prefixd.io/ip-uid";

/// A single address taken from a Prefix.
#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, PartialEq, JsonSchema)]
#[kube(group = "ipam.prefixd.io", version = "v1alpha1", kind = "IP", namespaced)]
#[kube(status = "IPStatus")]
#[kube(
    printcolumn = r#"{"name":"IP", "type":"string", "description":"Assigned address", "jsonPath":".status.ip"}"#,
    printcolumn = r#"{"name":"PREFIXREF", "type":"string", "description":"Parent prefix", "jsonPath":".spec.prefixRef.name"}"#,
    printcolumn = r#"{"name":"PHASE", "type":"string", "description":"Phase", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPSpec {
    pub ip_family: IpFamily,
    pub ip: Option<String>,
    pub prefix_ref: Option<LocalObjectRef>,
    pub prefix_selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IPStatus {
    pub phase: Option<Phase>,
    pub ip: Option<String>,
    pub last_phase_transition_time: Option<Time>,
}

impl IPStatus {
    pub fn set_phase(&mut self, phase: Phase) -> bool {
        if self.phase == Some(phase) {
            return false;
        }
        self.phase = Some(phase);
        self.last_phase_transition_time = Some(now());
        true
    }
}

impl IPSpec {
    pub fn validate(&self) -> Result<(), Error> {
        if self.prefix_ref.is_some() && self.prefix_selector.is_some() {
            return Err(Error::ParentRefAndSelector);
        }
        if self.prefix_ref.is_none() && self.prefix_selector.is_none() {
            return Err(Error::MissingParent);
        }
        self.address().map(|_| ())
    }

    pub fn address(&self) -> Result<Option<IpAddr>, Error> {
        let Some(ip) = self.ip.as_deref() else {
            return Ok(None);
        };
        let addr = IpAddr::from_str(ip).map_err(|_| Error::InvalidAddress(ip.to_string()))?;
        if IpFamily::from(prefixd_ipam::IpFamily::of_addr(&addr)) != self.ip_family {
            return Err(Error::FamilyMismatch(ip.to_string(), self.ip_family));
        }
        Ok(Some(addr))
    }

    /// A full-length prefix, pinned to `spec.ip` when it is set.
    pub fn desired_request(&self) -> Result<AllocationRequest, Error> {
        let family = prefixd_ipam::IpFamily::from(self.ip_family);
        match self.address()? {
            Some(addr) => Ok(AllocationRequest::Prefix(IpNet::from(addr))),
            None => Ok(AllocationRequest::PrefixLength {
                family,
                length: family.bits(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest(
        family,
        ip,
        expected,
        case(IpFamily::IPv4, None, AllocationRequest::PrefixLength { family: prefixd_ipam::IpFamily::V4, length: 32 }),
        case(IpFamily::IPv6, None, AllocationRequest::PrefixLength { family: prefixd_ipam::IpFamily::V6, length: 128 }),
        case(IpFamily::IPv4, Some("10.0.0.7"), AllocationRequest::Prefix(IpNet::from_str("10.0.0.7/32").unwrap())),
        case(IpFamily::IPv6, Some("2001:db8::7"), AllocationRequest::Prefix(IpNet::from_str("2001:db8::7/128").unwrap())),
    )]
    fn works_desired_request(family: IpFamily, ip: Option<&str>, expected: AllocationRequest) {
        let spec = IPSpec {
            ip_family: family,
            ip: ip.map(|s| s.to_string()),
            prefix_ref: Some(LocalObjectRef::new("root")),
            prefix_selector: None,
        };
        assert_eq!(spec.validate(), Ok(()));
        assert_eq!(spec.desired_request().unwrap(), expected);
    }

    #[rstest(
        spec,
        expected,
        case(IPSpec { ip_family: IpFamily::IPv4, ..Default::default() }, Error::MissingParent),
        case(IPSpec { ip_family: IpFamily::IPv4, ip: Some("10.0.0.300".to_string()), prefix_ref: Some(LocalObjectRef::new("root")), prefix_selector: None }, Error::InvalidAddress("10.0.0.300".to_string())),
        case(IPSpec { ip_family: IpFamily::IPv6, ip: Some("10.0.0.1".to_string()), prefix_ref: Some(LocalObjectRef::new("root")), prefix_selector: None }, Error::FamilyMismatch("10.0.0.1".to_string(), IpFamily::IPv6)),
        case(IPSpec { ip_family: IpFamily::IPv4, ip: None, prefix_ref: Some(LocalObjectRef::new("root")), prefix_selector: Some(LabelSelector::default()) }, Error::ParentRefAndSelector),
    )]
    fn fails_validate(spec: IPSpec, expected: Error) {
        assert_eq!(spec.validate(), Err(expected));
    }
}
