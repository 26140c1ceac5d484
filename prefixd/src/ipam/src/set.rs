use std::net::IpAddr;

use ipnet::IpNet;

use super::{
    error::Error,
    family::IpFamily,
    range::{addr_to_bits, bits_to_addr, host_mask, IpRange},
};

/// A union of disjoint address ranges of one family.
///
/// Ranges are kept sorted by start address and adjacent ranges are merged,
/// so two sets covering the same addresses always compare equal.
/// Every operation returns a new set and leaves `self` untouched.
///
/// Blocks of the other family share no address with the set. Subtracting them is a no-op,
/// and they are never contained or removable. Only a union with them is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSet {
    family: IpFamily,
    ranges: Vec<(u128, u128)>,
}

impl AddressSet {
    pub fn new(family: IpFamily) -> AddressSet {
        AddressSet {
            family,
            ranges: Vec::new(),
        }
    }

    pub fn from_prefix(prefix: &IpNet) -> AddressSet {
        AddressSet {
            family: IpFamily::of_net(prefix),
            ranges: vec![net_bounds(prefix)],
        }
    }

    pub fn from_range(range: &IpRange) -> AddressSet {
        AddressSet {
            family: range.family(),
            ranges: vec![range.bounds()],
        }
    }

    pub fn from_prefixes<'a, I>(family: IpFamily, prefixes: I) -> Result<AddressSet, Error>
    where
        I: IntoIterator<Item = &'a IpNet>,
    {
        prefixes
            .into_iter()
            .try_fold(AddressSet::new(family), |set, p| set.union_prefix(p))
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of addresses in the set. Saturates at `u128::MAX`.
    pub fn len(&self) -> u128 {
        self.ranges
            .iter()
            .fold(0u128, |acc, (s, e)| acc.saturating_add((e - s).saturating_add(1)))
    }

    pub fn ranges(&self) -> Vec<IpRange> {
        self.ranges
            .iter()
            .map(|(s, e)| IpRange::from_bounds(*s, *e, self.family))
            .collect()
    }

    /// Minimal list of CIDR blocks covering exactly the addresses of the set, in ascending order.
    pub fn prefixes(&self) -> Vec<IpNet> {
        let bits = self.family.bits();
        let mut res = Vec::new();
        for (start, end) in self.ranges.iter() {
            let mut cur = *start;
            loop {
                let mut host_bits = (cur.trailing_zeros() as u8).min(bits);
                while host_bits > 0
                    && cur
                        .checked_add(host_mask(host_bits))
                        .map_or(true, |last| last > *end)
                {
                    host_bits -= 1;
                }
                if let Some(net) = to_net(cur, bits - host_bits, self.family) {
                    res.push(net);
                }
                let last = cur + host_mask(host_bits);
                if last >= *end {
                    break;
                }
                cur = last + 1;
            }
        }
        res
    }

    pub fn union(&self, other: &AddressSet) -> Result<AddressSet, Error> {
        if other.family != self.family {
            return Err(Error::ProtocolMismatch);
        }
        let mut ranges = self.ranges.clone();
        ranges.extend_from_slice(&other.ranges);
        Ok(AddressSet {
            family: self.family,
            ranges: normalize(ranges),
        })
    }

    pub fn union_prefix(&self, prefix: &IpNet) -> Result<AddressSet, Error> {
        self.union(&AddressSet::from_prefix(prefix))
    }

    pub fn union_range(&self, range: &IpRange) -> Result<AddressSet, Error> {
        self.union(&AddressSet::from_range(range))
    }

    pub fn subtract(&self, other: &AddressSet) -> AddressSet {
        if other.family != self.family {
            return self.clone();
        }
        other
            .ranges
            .iter()
            .fold(self.clone(), |set, (s, e)| set.subtract_bounds(*s, *e))
    }

    pub fn subtract_prefix(&self, prefix: &IpNet) -> AddressSet {
        if IpFamily::of_net(prefix) != self.family {
            return self.clone();
        }
        let (s, e) = net_bounds(prefix);
        self.subtract_bounds(s, e)
    }

    pub fn subtract_range(&self, range: &IpRange) -> AddressSet {
        if range.family() != self.family {
            return self.clone();
        }
        let (s, e) = range.bounds();
        self.subtract_bounds(s, e)
    }

    pub fn contains_addr(&self, addr: &IpAddr) -> bool {
        if IpFamily::of_addr(addr) != self.family {
            return false;
        }
        let bits = addr_to_bits(addr);
        self.contains_bounds(bits, bits)
    }

    /// Whether every address of `prefix` is in the set.
    pub fn contains_prefix(&self, prefix: &IpNet) -> bool {
        if IpFamily::of_net(prefix) != self.family {
            return false;
        }
        let (s, e) = net_bounds(prefix);
        self.contains_bounds(s, e)
    }

    /// Whether every address of `range` is in the set.
    pub fn contains_range(&self, range: &IpRange) -> bool {
        if range.family() != self.family {
            return false;
        }
        let (s, e) = range.bounds();
        self.contains_bounds(s, e)
    }

    /// Whether every address of `other` is in the set.
    pub fn contains_set(&self, other: &AddressSet) -> bool {
        if other.family != self.family {
            return other.is_empty();
        }
        other
            .ranges
            .iter()
            .all(|(s, e)| self.contains_bounds(*s, *e))
    }

    /// Removes `prefix`, which must be entirely free.
    pub fn remove_exact_prefix(&self, prefix: &IpNet) -> Option<AddressSet> {
        if !self.contains_prefix(prefix) {
            return None;
        }
        Some(self.subtract_prefix(prefix))
    }

    /// Removes `range`, which must be entirely free.
    pub fn remove_exact_range(&self, range: &IpRange) -> Option<AddressSet> {
        if !self.contains_range(range) {
            return None;
        }
        Some(self.subtract_range(range))
    }

    /// Carves a block of `prefix_len` out of the first range, in ascending address order,
    /// that can hold one. The block is the lowest aligned one in that range.
    pub fn remove_free_prefix(&self, prefix_len: u8) -> Option<(IpNet, AddressSet)> {
        let bits = self.family.bits();
        if prefix_len > bits {
            return None;
        }
        let mask = host_mask(bits - prefix_len);
        self.ranges.iter().find_map(|(s, e)| {
            let aligned = if s & mask == 0 {
                *s
            } else {
                (s | mask).checked_add(1)?
            };
            let last = aligned.checked_add(mask)?;
            if last > *e {
                return None;
            }
            let net = to_net(aligned, prefix_len, self.family)?;
            Some((net, self.subtract_bounds(aligned, last)))
        })
    }

    /// Carves the first `len` numerically adjacent free addresses. The result need not be CIDR aligned.
    pub fn remove_free_range(&self, len: u128) -> Option<(IpRange, AddressSet)> {
        if len == 0 {
            return None;
        }
        self.ranges.iter().find_map(|(s, e)| {
            if e - s < len - 1 {
                return None;
            }
            let last = s + (len - 1);
            Some((
                IpRange::from_bounds(*s, last, self.family),
                self.subtract_bounds(*s, last),
            ))
        })
    }

    fn contains_bounds(&self, start: u128, end: u128) -> bool {
        // adjacent ranges are merged, so a covered interval lies in a single range
        self.ranges.iter().any(|(s, e)| *s <= start && end <= *e)
    }

    fn subtract_bounds(&self, start: u128, end: u128) -> AddressSet {
        let mut ranges = Vec::with_capacity(self.ranges.len() + 1);
        for (s, e) in self.ranges.iter() {
            if *e < start || *s > end {
                ranges.push((*s, *e));
                continue;
            }
            if *s < start {
                ranges.push((*s, start - 1));
            }
            if *e > end {
                ranges.push((end + 1, *e));
            }
        }
        AddressSet {
            family: self.family,
            ranges,
        }
    }
}

fn normalize(mut ranges: Vec<(u128, u128)>) -> Vec<(u128, u128)> {
    ranges.sort_unstable();
    let mut merged: Vec<(u128, u128)> = Vec::with_capacity(ranges.len());
    for (s, e) in ranges.into_iter() {
        match merged.last_mut() {
            Some(last) if s <= last.1.saturating_add(1) => {
                last.1 = last.1.max(e);
            }
            _ => merged.push((s, e)),
        }
    }
    merged
}

fn net_bounds(net: &IpNet) -> (u128, u128) {
    (addr_to_bits(&net.network()), addr_to_bits(&net.broadcast()))
}

fn to_net(start: u128, prefix_len: u8, family: IpFamily) -> Option<IpNet> {
    IpNet::new(bits_to_addr(start, family), prefix_len).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    fn net(s: &str) -> IpNet {
        IpNet::from_str(s).unwrap()
    }

    fn set(prefixes: &[&str]) -> AddressSet {
        let nets: Vec<IpNet> = prefixes.iter().map(|p| net(p)).collect();
        let family = IpFamily::of_net(&nets[0]);
        AddressSet::from_prefixes(family, nets.iter()).unwrap()
    }

    fn strs(prefixes: Vec<IpNet>) -> Vec<String> {
        prefixes.iter().map(|p| p.to_string()).collect()
    }

    #[rstest(
        input,
        expected,
        case(vec!["10.0.0.0/25", "10.0.0.128/25"], vec!["10.0.0.0/24"]),
        case(vec!["10.0.0.128/25", "10.0.0.0/25"], vec!["10.0.0.0/24"]),
        case(vec!["10.0.0.0/24", "10.0.0.64/26"], vec!["10.0.0.0/24"]),
        case(vec!["10.0.0.0/26", "10.0.0.128/26"], vec!["10.0.0.0/26", "10.0.0.128/26"]),
        case(vec!["10.0.0.64/26", "10.0.0.128/25", "10.0.1.0/24"], vec!["10.0.0.64/26", "10.0.0.128/25", "10.0.1.0/24"]),
        case(vec!["2001:db8::/33", "2001:db8:8000::/33"], vec!["2001:db8::/32"]),
    )]
    fn works_union(input: Vec<&str>, expected: Vec<&str>) {
        assert_eq!(strs(set(&input).prefixes()), expected);
    }

    #[test]
    fn fails_union_mixed_family() {
        let v4 = set(&["10.0.0.0/24"]);
        assert_eq!(
            v4.union_prefix(&net("2001:db8::/64")).unwrap_err(),
            Error::ProtocolMismatch
        );
    }

    #[rstest(
        base,
        block,
        expected,
        case("10.0.0.0/24", "10.0.0.0/28", vec!["10.0.0.16/28", "10.0.0.32/27", "10.0.0.64/26", "10.0.0.128/25"]),
        case("10.0.0.0/24", "10.0.0.128/25", vec!["10.0.0.0/25"]),
        case("10.0.0.0/8", "10.0.0.0/9", vec!["10.128.0.0/9"]),
        case("10.0.0.0/24", "10.0.1.0/24", vec!["10.0.0.0/24"]),
        case("10.0.0.0/24", "10.0.0.0/16", vec![]),
        case("10.0.0.0/24", "2001:db8::/64", vec!["10.0.0.0/24"]),
    )]
    fn works_subtract_prefix(base: &str, block: &str, expected: Vec<&str>) {
        let res = AddressSet::from_prefix(&net(base)).subtract_prefix(&net(block));
        assert_eq!(strs(res.prefixes()), expected);
    }

    #[test]
    fn subtract_keeps_empty_set_distinct_from_nothing() {
        let res = set(&["10.0.0.0/24"]).subtract_prefix(&net("10.0.0.0/24"));
        assert!(res.is_empty());
        assert_eq!(res.family(), IpFamily::V4);
        assert_eq!(res.len(), 0);
    }

    #[rstest(
        base,
        block,
        expected,
        case(vec!["10.0.0.0/25", "10.0.0.128/25"], "10.0.0.64/26", true),
        case(vec!["10.0.0.0/25", "10.0.0.128/25"], "10.0.0.0/24", true),
        case(vec!["10.0.0.0/26", "10.0.0.128/26"], "10.0.0.0/24", false),
        case(vec!["10.0.0.0/24"], "10.0.1.0/30", false),
        case(vec!["10.0.0.0/24"], "::/0", false),
    )]
    fn works_contains_prefix(base: Vec<&str>, block: &str, expected: bool) {
        assert_eq!(set(&base).contains_prefix(&net(block)), expected);
    }

    #[test]
    fn works_contains_range_and_set() {
        let base = set(&["10.0.0.0/24"]);
        assert!(base.contains_range(&IpRange::from_str("10.0.0.3-10.0.0.17").unwrap()));
        assert!(!base.contains_range(&IpRange::from_str("10.0.0.250-10.0.1.1").unwrap()));
        assert!(base.contains_set(&set(&["10.0.0.0/28", "10.0.0.64/26"])));
        assert!(!base.contains_set(&set(&["10.0.0.0/28", "10.0.1.0/26"])));
        assert!(base.contains_addr(&IpAddr::from_str("10.0.0.255").unwrap()));
    }

    #[rstest(
        base,
        prefix_len,
        expected,
        expected_rest,
        case(vec!["10.0.0.0/24"], 28, Some("10.0.0.0/28"), vec!["10.0.0.16/28", "10.0.0.32/27", "10.0.0.64/26", "10.0.0.128/25"]),
        case(vec!["10.0.0.16/28", "10.0.0.32/27", "10.0.0.64/26", "10.0.0.128/25"], 28, Some("10.0.0.16/28"), vec!["10.0.0.32/27", "10.0.0.64/26", "10.0.0.128/25"]),
        // the first range cannot hold a /26, so the block comes from the next one
        case(vec!["10.0.0.16/28", "10.0.0.128/25"], 26, Some("10.0.0.128/26"), vec!["10.0.0.16/28", "10.0.0.192/26"]),
        case(vec!["10.0.0.0/24"], 24, Some("10.0.0.0/24"), vec![]),
        case(vec!["10.0.0.0/24"], 23, None, vec!["10.0.0.0/24"]),
        case(vec!["10.0.0.0/24"], 33, None, vec!["10.0.0.0/24"]),
    )]
    fn works_remove_free_prefix(
        base: Vec<&str>,
        prefix_len: u8,
        expected: Option<&str>,
        expected_rest: Vec<&str>,
    ) {
        let base = set(&base);
        match base.remove_free_prefix(prefix_len) {
            Some((block, rest)) => {
                assert_eq!(Some(block.to_string().as_str()), expected);
                assert_eq!(strs(rest.prefixes()), expected_rest);
            }
            None => {
                assert_eq!(expected, None);
                assert_eq!(strs(base.prefixes()), expected_rest);
            }
        }
    }

    #[test]
    fn remove_free_prefix_is_deterministic() {
        let base = set(&["10.0.0.0/24"]).subtract_prefix(&net("10.0.0.32/27"));
        let first = base.remove_free_prefix(27).unwrap();
        let second = base.remove_free_prefix(27).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.0, net("10.0.0.0/27"));
    }

    #[test]
    fn remove_free_prefix_from_unaligned_range() {
        let base = AddressSet::from_range(&IpRange::from_str("10.0.0.3-10.0.0.20").unwrap());
        let (block, rest) = base.remove_free_prefix(30).unwrap();
        assert_eq!(block, net("10.0.0.4/30"));
        assert_eq!(
            rest.ranges(),
            vec![
                IpRange::from_str("10.0.0.3-10.0.0.3").unwrap(),
                IpRange::from_str("10.0.0.8-10.0.0.20").unwrap(),
            ]
        );
    }

    #[test]
    fn remove_free_prefix_ipv6() {
        let base = AddressSet::from_prefix(&net("2001:db8::/64"));
        let (block, rest) = base.remove_free_prefix(96).unwrap();
        assert_eq!(block, net("2001:db8::/96"));
        assert_eq!(rest.len(), (1u128 << 64) - (1u128 << 32));
        let prefixes = rest.prefixes();
        assert_eq!(prefixes.len(), 32);
        assert_eq!(prefixes[0], net("2001:db8::1:0:0/96"));
        assert_eq!(prefixes[31], net("2001:db8:0:0:8000::/65"));
    }

    #[test]
    fn remove_free_prefix_whole_ipv6_space() {
        let base = AddressSet::from_prefix(&net("::/0"));
        let (block, rest) = base.remove_free_prefix(0).unwrap();
        assert_eq!(block, net("::/0"));
        assert!(rest.is_empty());
    }

    #[rstest(
        base,
        len,
        expected,
        case(vec!["10.0.0.0/24"], 5, Some("10.0.0.0-10.0.0.4")),
        case(vec!["10.0.0.2/31", "10.0.0.8/29"], 3, Some("10.0.0.8-10.0.0.10")),
        case(vec!["10.0.0.2/31", "10.0.0.8/29"], 2, Some("10.0.0.2-10.0.0.3")),
        case(vec!["10.0.0.2/31", "10.0.0.8/29"], 9, None),
        case(vec!["10.0.0.0/24"], 0, None),
    )]
    fn works_remove_free_range(base: Vec<&str>, len: u128, expected: Option<&str>) {
        let base = set(&base);
        let res = base.remove_free_range(len);
        assert_eq!(
            res.as_ref().map(|(r, _)| r.to_string()),
            expected.map(|e| e.to_string())
        );
        if let Some((range, rest)) = res {
            assert!(!rest.contains_range(&range));
            assert_eq!(rest.len() + len, base.len());
        }
    }

    #[rstest(
        base,
        block,
        case(vec!["10.0.0.0/28"], "10.0.0.64/26"),
        case(vec!["10.0.0.0/26", "10.0.0.128/26"], "10.0.0.64/26"),
        case(vec!["192.168.0.0/16"], "10.0.0.0/8"),
        case(vec!["2001:db8::/48"], "2001:db8:1::/48"),
    )]
    fn remove_exact_undoes_union(base: Vec<&str>, block: &str) {
        let base = set(&base);
        let block = net(block);
        let joined = base.union_prefix(&block).unwrap();
        assert_eq!(joined.remove_exact_prefix(&block), Some(base));
    }

    #[test]
    fn remove_exact_requires_free_block() {
        let base = set(&["10.0.0.0/24"]).subtract_prefix(&net("10.0.0.16/28"));
        assert_eq!(base.remove_exact_prefix(&net("10.0.0.0/27")), None);
        assert!(base.remove_exact_prefix(&net("10.0.0.0/28")).is_some());
        assert_eq!(
            base.remove_exact_range(&IpRange::from_str("10.0.0.10-10.0.0.20").unwrap()),
            None
        );
    }

    #[test]
    fn rederivation_is_idempotent() {
        let own = net("10.0.0.0/24");
        let used = [net("10.0.0.64/26"), net("10.0.0.0/28"), net("10.0.0.16/28")];
        let derive = || {
            used.iter()
                .fold(AddressSet::from_prefix(&own), |set, p| set.subtract_prefix(p))
        };
        assert_eq!(derive(), derive());
        assert_eq!(
            strs(derive().prefixes()),
            vec!["10.0.0.32/27", "10.0.0.128/25"]
        );
    }
}
