use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use ipnet::IpNet;

use super::{error::Error, family::IpFamily};

/// Inclusive range of addresses of a single family.
/// Unlike a prefix it does not need to be aligned to a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpRange {
    from: IpAddr,
    to: IpAddr,
}

impl IpRange {
    pub fn new(from: IpAddr, to: IpAddr) -> Result<IpRange, Error> {
        if IpFamily::of_addr(&from) != IpFamily::of_addr(&to) {
            return Err(Error::ProtocolMismatch);
        }
        if addr_to_bits(&from) > addr_to_bits(&to) {
            return Err(Error::InvalidRange(from, to));
        }
        Ok(IpRange { from, to })
    }

    pub fn from_net(net: &IpNet) -> IpRange {
        IpRange {
            from: net.network(),
            to: net.broadcast(),
        }
    }

    pub fn from(&self) -> IpAddr {
        self.from
    }

    pub fn to(&self) -> IpAddr {
        self.to
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of_addr(&self.from)
    }

    /// Number of addresses in the range. Saturates for the whole IPv6 space.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u128 {
        (addr_to_bits(&self.to) - addr_to_bits(&self.from)).saturating_add(1)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        if IpFamily::of_addr(addr) != self.family() {
            return false;
        }
        let bits = addr_to_bits(addr);
        addr_to_bits(&self.from) <= bits && bits <= addr_to_bits(&self.to)
    }

    pub(crate) fn bounds(&self) -> (u128, u128) {
        (addr_to_bits(&self.from), addr_to_bits(&self.to))
    }

    pub(crate) fn from_bounds(start: u128, end: u128, family: IpFamily) -> IpRange {
        IpRange {
            from: bits_to_addr(start, family),
            to: bits_to_addr(end, family),
        }
    }
}

impl std::fmt::Display for IpRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

impl FromStr for IpRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, to) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidRangeFormat(s.to_string()))?;
        let from = IpAddr::from_str(from.trim())
            .map_err(|_| Error::InvalidRangeFormat(s.to_string()))?;
        let to =
            IpAddr::from_str(to.trim()).map_err(|_| Error::InvalidRangeFormat(s.to_string()))?;
        IpRange::new(from, to)
    }
}

pub(crate) fn addr_to_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(*a) as u128,
        IpAddr::V6(a) => u128::from(*a),
    }
}

pub(crate) fn bits_to_addr(bits: u128, family: IpFamily) -> IpAddr {
    match family {
        IpFamily::V4 => IpAddr::V4(Ipv4Addr::from(bits as u32)),
        IpFamily::V6 => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}

/// Mask covering the host part of a block with `host_bits` free bits.
/// This is the block size minus one, which stays representable for a /0 IPv6 block.
pub(crate) fn host_mask(host_bits: u8) -> u128 {
    if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    }
}
