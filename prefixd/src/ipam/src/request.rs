use ipnet::IpNet;
use thiserror::Error;

use super::{
    error::Error,
    family::IpFamily,
    range::{host_mask, IpRange},
    set::AddressSet,
};

/// What a requester asks its parent for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationRequest {
    /// This exact block.
    Prefix(IpNet),
    /// Any free block of this length.
    PrefixLength { family: IpFamily, length: u8 },
    /// This exact range.
    Range(IpRange),
    /// Any `length` free, numerically adjacent addresses.
    RangeLength { family: IpFamily, length: u128 },
}

impl AllocationRequest {
    pub fn family(&self) -> IpFamily {
        match self {
            AllocationRequest::Prefix(p) => IpFamily::of_net(p),
            AllocationRequest::PrefixLength { family, .. } => *family,
            AllocationRequest::Range(r) => r.family(),
            AllocationRequest::RangeLength { family, .. } => *family,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        match self {
            AllocationRequest::PrefixLength { family, length } if *length > family.bits() => {
                Err(Error::InvalidPrefixLength(*length))
            }
            AllocationRequest::RangeLength { length, .. } if *length == 0 => {
                Err(Error::InvalidRangeLength(*length))
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for AllocationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationRequest::Prefix(p) => write!(f, "prefix {p}"),
            AllocationRequest::PrefixLength { family, length } => {
                write!(f, "{family} prefix of length /{length}")
            }
            AllocationRequest::Range(r) => write!(f, "range {r}"),
            AllocationRequest::RangeLength { family, length } => {
                write!(f, "{family} range of {length} addresses")
            }
        }
    }
}

/// What a parent granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AllocationResult {
    Prefix(IpNet),
    Range(IpRange),
}

impl AllocationResult {
    pub fn family(&self) -> IpFamily {
        match self {
            AllocationResult::Prefix(p) => IpFamily::of_net(p),
            AllocationResult::Range(r) => r.family(),
        }
    }

    pub fn to_set(&self) -> AddressSet {
        match self {
            AllocationResult::Prefix(p) => AddressSet::from_prefix(p),
            AllocationResult::Range(r) => AddressSet::from_range(r),
        }
    }

    /// CIDR blocks covering exactly the granted addresses.
    pub fn prefixes(&self) -> Vec<IpNet> {
        match self {
            AllocationResult::Prefix(p) => vec![*p],
            AllocationResult::Range(r) => AddressSet::from_range(r).prefixes(),
        }
    }
}

impl std::fmt::Display for AllocationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationResult::Prefix(p) => write!(f, "{p}"),
            AllocationResult::Range(r) => write!(f, "{r}"),
        }
    }
}

/// Reasons a request can never be satisfied by a parent, whatever its free space.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Incompatibility {
    #[error("requested family {requested} does not match parent family {parent}")]
    FamilyMismatch {
        requested: IpFamily,
        parent: IpFamily,
    },

    #[error("requested length /{requested} must be longer than parent length /{parent}")]
    PrefixTooShort { requested: u8, parent: u8 },

    #[error("requested block {0} equals the parent prefix")]
    SelfClaim(String),

    #[error("requested block {0} is not inside parent prefix {1}")]
    OutOfParent(String, IpNet),

    #[error("requested range of {requested} addresses does not fit in parent prefix {parent}")]
    RangeTooLong { requested: u128, parent: IpNet },

    #[error("invalid request: {0}")]
    Invalid(#[source] Error),
}

/// Checks whether `request` could ever be carved out of `parent`.
/// A child may never claim the whole parent block.
pub fn check_compatible(parent: &IpNet, request: &AllocationRequest) -> Result<(), Incompatibility> {
    request.validate().map_err(Incompatibility::Invalid)?;

    let parent = parent.trunc();
    let parent_family = IpFamily::of_net(&parent);
    if request.family() != parent_family {
        return Err(Incompatibility::FamilyMismatch {
            requested: request.family(),
            parent: parent_family,
        });
    }

    match request {
        AllocationRequest::Prefix(p) => {
            let p = p.trunc();
            if p == parent {
                return Err(Incompatibility::SelfClaim(p.to_string()));
            }
            if p.prefix_len() <= parent.prefix_len() || !parent.contains(&p) {
                return Err(Incompatibility::OutOfParent(p.to_string(), parent));
            }
        }
        AllocationRequest::PrefixLength { length, .. } => {
            if *length <= parent.prefix_len() {
                return Err(Incompatibility::PrefixTooShort {
                    requested: *length,
                    parent: parent.prefix_len(),
                });
            }
        }
        AllocationRequest::Range(r) => {
            if *r == IpRange::from_net(&parent) {
                return Err(Incompatibility::SelfClaim(r.to_string()));
            }
            if !parent.contains(&r.from()) || !parent.contains(&r.to()) {
                return Err(Incompatibility::OutOfParent(r.to_string(), parent));
            }
        }
        AllocationRequest::RangeLength { length, .. } => {
            // the parent size minus one is the host mask
            let last_index = host_mask(parent_family.bits() - parent.prefix_len());
            if length - 1 >= last_index {
                return Err(Incompatibility::RangeTooLong {
                    requested: *length,
                    parent,
                });
            }
        }
    }
    Ok(())
}

impl AddressSet {
    /// Serves `request` from the set: exact requests must be entirely free,
    /// length requests take the first fitting block.
    pub fn remove_exact_or_best_fit(
        &self,
        request: &AllocationRequest,
    ) -> Option<(AllocationResult, AddressSet)> {
        match request {
            AllocationRequest::Prefix(p) => {
                let p = p.trunc();
                self.remove_exact_prefix(&p)
                    .map(|rest| (AllocationResult::Prefix(p), rest))
            }
            AllocationRequest::PrefixLength { family, length } => {
                if *family != self.family() {
                    return None;
                }
                self.remove_free_prefix(*length)
                    .map(|(p, rest)| (AllocationResult::Prefix(p), rest))
            }
            AllocationRequest::Range(r) => self
                .remove_exact_range(r)
                .map(|rest| (AllocationResult::Range(*r), rest)),
            AllocationRequest::RangeLength { family, length } => {
                if *family != self.family() {
                    return None;
                }
                self.remove_free_range(*length)
                    .map(|(r, rest)| (AllocationResult::Range(r), rest))
            }
        }
    }

    /// Whether `request` could be served right now.
    pub fn can_serve(&self, request: &AllocationRequest) -> bool {
        self.remove_exact_or_best_fit(request).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    fn net(s: &str) -> IpNet {
        IpNet::from_str(s).unwrap()
    }

    fn range(s: &str) -> IpRange {
        IpRange::from_str(s).unwrap()
    }

    #[rstest(
        parent,
        request,
        case("10.0.0.0/24", AllocationRequest::PrefixLength { family: IpFamily::V4, length: 28 }),
        case("10.0.0.0/24", AllocationRequest::PrefixLength { family: IpFamily::V4, length: 32 }),
        case("10.0.0.0/24", AllocationRequest::Prefix(net("10.0.0.128/25"))),
        case("10.0.0.0/24", AllocationRequest::Range(range("10.0.0.1-10.0.0.255"))),
        case("10.0.0.0/24", AllocationRequest::RangeLength { family: IpFamily::V4, length: 255 }),
        case("2001:db8::/64", AllocationRequest::PrefixLength { family: IpFamily::V6, length: 128 }),
        case("::/0", AllocationRequest::RangeLength { family: IpFamily::V6, length: u128::MAX }),
    )]
    fn works_check_compatible(parent: &str, request: AllocationRequest) {
        assert_eq!(check_compatible(&net(parent), &request), Ok(()));
    }

    #[rstest(
        parent,
        request,
        expected,
        case("10.0.0.0/24", AllocationRequest::PrefixLength { family: IpFamily::V4, length: 24 }, Incompatibility::PrefixTooShort { requested: 24, parent: 24 }),
        case("10.0.0.0/24", AllocationRequest::PrefixLength { family: IpFamily::V4, length: 8 }, Incompatibility::PrefixTooShort { requested: 8, parent: 24 }),
        case("10.0.0.0/24", AllocationRequest::PrefixLength { family: IpFamily::V6, length: 64 }, Incompatibility::FamilyMismatch { requested: IpFamily::V6, parent: IpFamily::V4 }),
        case("10.0.0.0/24", AllocationRequest::Prefix(net("10.0.0.0/24")), Incompatibility::SelfClaim("10.0.0.0/24".to_string())),
        case("10.0.0.0/24", AllocationRequest::Prefix(net("10.0.1.0/28")), Incompatibility::OutOfParent("10.0.1.0/28".to_string(), net("10.0.0.0/24"))),
        case("10.0.0.0/24", AllocationRequest::Prefix(net("10.0.0.0/16")), Incompatibility::OutOfParent("10.0.0.0/16".to_string(), net("10.0.0.0/24"))),
        case("10.0.0.0/24", AllocationRequest::Range(range("10.0.0.0-10.0.0.255")), Incompatibility::SelfClaim("10.0.0.0-10.0.0.255".to_string())),
        case("10.0.0.0/24", AllocationRequest::Range(range("10.0.0.200-10.0.1.3")), Incompatibility::OutOfParent("10.0.0.200-10.0.1.3".to_string(), net("10.0.0.0/24"))),
        case("10.0.0.0/24", AllocationRequest::RangeLength { family: IpFamily::V4, length: 256 }, Incompatibility::RangeTooLong { requested: 256, parent: net("10.0.0.0/24") }),
        case("10.0.0.0/24", AllocationRequest::RangeLength { family: IpFamily::V4, length: 0 }, Incompatibility::Invalid(Error::InvalidRangeLength(0))),
        case("10.0.0.0/24", AllocationRequest::PrefixLength { family: IpFamily::V4, length: 33 }, Incompatibility::Invalid(Error::InvalidPrefixLength(33))),
    )]
    fn fails_check_compatible(parent: &str, request: AllocationRequest, expected: Incompatibility) {
        assert_eq!(check_compatible(&net(parent), &request), Err(expected));
    }

    #[rstest(
        available,
        request,
        expected,
        case("10.0.0.0/24", AllocationRequest::PrefixLength { family: IpFamily::V4, length: 28 }, Some(AllocationResult::Prefix(net("10.0.0.0/28")))),
        case("10.0.0.0/24", AllocationRequest::Prefix(net("10.0.0.64/26")), Some(AllocationResult::Prefix(net("10.0.0.64/26")))),
        // host bits of an exact request are ignored
        case("10.0.0.0/24", AllocationRequest::Prefix(net("10.0.0.65/26")), Some(AllocationResult::Prefix(net("10.0.0.64/26")))),
        case("10.0.0.0/24", AllocationRequest::Prefix(net("10.0.1.0/26")), None),
        case("10.0.0.0/24", AllocationRequest::Range(range("10.0.0.3-10.0.0.9")), Some(AllocationResult::Range(range("10.0.0.3-10.0.0.9")))),
        case("10.0.0.0/24", AllocationRequest::RangeLength { family: IpFamily::V4, length: 3 }, Some(AllocationResult::Range(range("10.0.0.0-10.0.0.2")))),
        case("10.0.0.0/24", AllocationRequest::RangeLength { family: IpFamily::V6, length: 3 }, None),
        case("10.0.0.0/24", AllocationRequest::PrefixLength { family: IpFamily::V6, length: 120 }, None),
    )]
    fn works_remove_exact_or_best_fit(
        available: &str,
        request: AllocationRequest,
        expected: Option<AllocationResult>,
    ) {
        let set = AddressSet::from_prefix(&net(available));
        let res = set.remove_exact_or_best_fit(&request);
        assert_eq!(res.as_ref().map(|(r, _)| *r), expected);
        if let Some((result, rest)) = res {
            assert_eq!(rest.union(&result.to_set()).unwrap(), set);
        }
    }

    #[test]
    fn packs_sequential_requests() {
        let request = AllocationRequest::PrefixLength {
            family: IpFamily::V4,
            length: 26,
        };
        let mut set = AddressSet::from_prefix(&net("10.0.0.0/24"));
        let mut granted = Vec::new();
        while let Some((result, rest)) = set.remove_exact_or_best_fit(&request) {
            granted.push(result.to_string());
            set = rest;
        }
        assert_eq!(
            granted,
            vec!["10.0.0.0/26", "10.0.0.64/26", "10.0.0.128/26", "10.0.0.192/26"]
        );
        assert!(set.is_empty());
        assert!(!set.can_serve(&request));
    }

    #[test]
    fn range_result_prefixes() {
        let result = AllocationResult::Range(range("10.0.0.3-10.0.0.9"));
        assert_eq!(
            result.prefixes(),
            vec![net("10.0.0.3/32"), net("10.0.0.4/30"), net("10.0.0.8/31")]
        );
    }
}
