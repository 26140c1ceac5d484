use std::str::FromStr;

use chrono::Utc;
use ipnet::IpNet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use prefixd_ipam::{AddressSet, IpRange};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::error::Error;

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum IpFamily {
    #[default]
    #[serde(rename = "IPv4")]
    IPv4,
    #[serde(rename = "IPv6")]
    IPv6,
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IPv4 => write!(f, "IPv4"),
            Self::IPv6 => write!(f, "IPv6"),
        }
    }
}

impl From<IpFamily> for prefixd_ipam::IpFamily {
    fn from(value: IpFamily) -> Self {
        match value {
            IpFamily::IPv4 => prefixd_ipam::IpFamily::V4,
            IpFamily::IPv6 => prefixd_ipam::IpFamily::V6,
        }
    }
}

impl From<prefixd_ipam::IpFamily> for IpFamily {
    fn from(value: prefixd_ipam::IpFamily) -> Self {
        match value {
            prefixd_ipam::IpFamily::V4 => IpFamily::IPv4,
            prefixd_ipam::IpFamily::V6 => IpFamily::IPv6,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Pending,
    Allocated,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Allocated => write!(f, "Allocated"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Reference to an object by name. Namespaced objects resolve it in their own namespace.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectRef {
    pub name: String,
}

impl LocalObjectRef {
    pub fn new(name: &str) -> LocalObjectRef {
        LocalObjectRef {
            name: name.to_string(),
        }
    }
}

pub fn now() -> Time {
    Time(Utc::now())
}

pub fn parse_prefix(s: &str, family: IpFamily) -> Result<IpNet, Error> {
    let prefix = IpNet::from_str(s).map_err(|_| Error::InvalidCIDR(s.to_string()))?;
    if IpFamily::from(prefixd_ipam::IpFamily::of_net(&prefix)) != family {
        return Err(Error::FamilyMismatch(s.to_string(), family));
    }
    Ok(prefix)
}

pub fn parse_range(s: &str, family: IpFamily) -> Result<IpRange, Error> {
    let range = IpRange::from_str(s).map_err(|_| Error::InvalidRange(s.to_string()))?;
    if IpFamily::from(range.family()) != family {
        return Err(Error::FamilyMismatch(s.to_string(), family));
    }
    Ok(range)
}

/// Parses an address block written either as a CIDR or as a `from-to` range.
pub fn parse_block(s: &str, family: IpFamily) -> Result<AddressSet, Error> {
    if s.contains('-') {
        parse_range(s, family).map(|r| AddressSet::from_range(&r))
    } else {
        parse_prefix(s, family).map(|p| AddressSet::from_prefix(&p))
    }
}

/// Union of a list of address blocks.
pub fn parse_blocks(blocks: &[String], family: IpFamily) -> Result<AddressSet, Error> {
    let mut set = AddressSet::new(family.into());
    for block in blocks.iter() {
        set = set
            .union(&parse_block(block, family)?)
            .map_err(|_| Error::FamilyMismatch(block.clone(), family))?;
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest(
        blocks,
        family,
        expected,
        case(vec![], IpFamily::IPv4, vec![]),
        case(vec!["10.0.0.0/25".to_string(), "10.0.0.128/25".to_string()], IpFamily::IPv4, vec!["10.0.0.0/24"]),
        case(vec!["10.0.0.1-10.0.0.2".to_string()], IpFamily::IPv4, vec!["10.0.0.1/32", "10.0.0.2/32"]),
        case(vec!["2001:db8::/64".to_string()], IpFamily::IPv6, vec!["2001:db8::/64"]),
    )]
    fn works_parse_blocks(blocks: Vec<String>, family: IpFamily, expected: Vec<&str>) {
        let set = parse_blocks(&blocks, family).unwrap();
        let prefixes: Vec<String> = set.prefixes().iter().map(|p| p.to_string()).collect();
        assert_eq!(prefixes, expected);
    }

    #[rstest(
        block,
        family,
        expected,
        case("10.0.0.0/33", IpFamily::IPv4, Error::InvalidCIDR("10.0.0.0/33".to_string())),
        case("10.0.0.0/24", IpFamily::IPv6, Error::FamilyMismatch("10.0.0.0/24".to_string(), IpFamily::IPv6)),
        case("10.0.0.9-10.0.0.1", IpFamily::IPv4, Error::InvalidRange("10.0.0.9-10.0.0.1".to_string())),
    )]
    fn fails_parse_block(block: &str, family: IpFamily, expected: Error) {
        assert_eq!(parse_block(block, family).unwrap_err(), expected);
    }
}
