//! Address ranges and address specs
//!
//! A rule names its local and remote endpoints as a list of inclusive
//! ranges. IPv4 ranges compare numerically. IPv6 ranges also carry a scope
//! id, which only matters for link-local addresses, and only when both sides
//! are scoped.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use ipnet::IpNet;

use crate::error::{Error, Result};

/// An inclusive address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrRange {
    /// IPv4 range
    V4 {
        /// First address
        start: Ipv4Addr,
        /// Last address
        end: Ipv4Addr,
    },
    /// IPv6 range
    V6 {
        /// First address
        start: Ipv6Addr,
        /// Last address
        end: Ipv6Addr,
        /// Interface scope for link-local ranges, 0 for unscoped
        scope_id: u32,
    },
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

fn scopes_compatible(addr: &Ipv6Addr, a: u32, b: u32) -> bool {
    !is_link_local(addr) || a == 0 || b == 0 || a == b
}

impl AddrRange {
    /// Range from `start` to `end`, both inclusive and of one family
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self> {
        match (start, end) {
            (IpAddr::V4(s), IpAddr::V4(e)) if s <= e => Ok(AddrRange::V4 { start: s, end: e }),
            (IpAddr::V6(s), IpAddr::V6(e)) if s <= e => Ok(AddrRange::V6 {
                start: s,
                end: e,
                scope_id: 0,
            }),
            _ => Err(Error::InvalidParameter(format!(
                "invalid address range {} - {}",
                start, end
            ))),
        }
    }

    /// Range holding exactly `addr`
    pub fn single(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(a) => AddrRange::V4 { start: a, end: a },
            IpAddr::V6(a) => AddrRange::V6 {
                start: a,
                end: a,
                scope_id: 0,
            },
        }
    }

    /// Range holding exactly `addr`, with its port ignored and scope kept
    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => AddrRange::single(IpAddr::V4(*a.ip())),
            SocketAddr::V6(a) => AddrRange::V6 {
                start: *a.ip(),
                end: *a.ip(),
                scope_id: a.scope_id(),
            },
        }
    }

    /// The same range bound to an interface scope (IPv6 only)
    pub fn with_scope(self, scope: u32) -> Self {
        match self {
            AddrRange::V6 { start, end, .. } => AddrRange::V6 {
                start,
                end,
                scope_id: scope,
            },
            v4 => v4,
        }
    }

    /// Every address of one family
    pub fn any_v4() -> Self {
        AddrRange::V4 {
            start: Ipv4Addr::UNSPECIFIED,
            end: Ipv4Addr::BROADCAST,
        }
    }

    /// Every IPv6 address
    pub fn any_v6() -> Self {
        AddrRange::V6 {
            start: Ipv6Addr::UNSPECIFIED,
            end: Ipv6Addr::from(u128::MAX),
            scope_id: 0,
        }
    }

    /// Whether both ends are IPv4
    pub fn is_ipv4(&self) -> bool {
        matches!(self, AddrRange::V4 { .. })
    }

    /// Whether `addr` falls within the range
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        match (self, addr) {
            (AddrRange::V4 { start, end }, SocketAddr::V4(a)) => start <= a.ip() && a.ip() <= end,
            (
                AddrRange::V6 {
                    start,
                    end,
                    scope_id,
                },
                SocketAddr::V6(a),
            ) => {
                start <= a.ip()
                    && a.ip() <= end
                    && scopes_compatible(a.ip(), *scope_id, a.scope_id())
            }
            _ => false,
        }
    }
}

impl From<IpNet> for AddrRange {
    fn from(net: IpNet) -> Self {
        match net {
            IpNet::V4(n) => AddrRange::V4 {
                start: n.network(),
                end: n.broadcast(),
            },
            IpNet::V6(n) => AddrRange::V6 {
                start: n.network(),
                end: n.broadcast(),
                scope_id: 0,
            },
        }
    }
}

impl FromStr for AddrRange {
    type Err = Error;

    /// Parses `addr`, `addr/prefix`, `start-end` and IPv6 `addr%scope`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bad = || Error::InvalidParameter(format!("invalid address spec '{}'", s));

        if let Some((start, end)) = s.split_once('-') {
            let start: IpAddr = start.trim().parse().map_err(|_| bad())?;
            let end: IpAddr = end.trim().parse().map_err(|_| bad())?;
            return AddrRange::new(start, end);
        }
        if s.contains('/') {
            let net: IpNet = s.parse().map_err(|_| bad())?;
            return Ok(net.trunc().into());
        }
        if let Some((addr, scope)) = s.split_once('%') {
            let addr: Ipv6Addr = addr.parse().map_err(|_| bad())?;
            let scope: u32 = scope.parse().map_err(|_| bad())?;
            return Ok(AddrRange::single(IpAddr::V6(addr)).with_scope(scope));
        }
        let addr: IpAddr = s.parse().map_err(|_| bad())?;
        Ok(AddrRange::single(addr))
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrRange::V4 { start, end } if start == end => write!(f, "{}", start),
            AddrRange::V4 { start, end } => write!(f, "{}-{}", start, end),
            AddrRange::V6 {
                start,
                end,
                scope_id,
            } => {
                if start == end {
                    write!(f, "{}", start)?;
                } else {
                    write!(f, "{}-{}", start, end)?;
                }
                if *scope_id != 0 {
                    write!(f, "%{}", scope_id)?;
                }
                Ok(())
            }
        }
    }
}

/// A list of address ranges; an address matches if any range holds it
///
/// An empty spec matches nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressSpec {
    ranges: Vec<AddrRange>,
}

impl AddressSpec {
    /// Spec from explicit ranges
    pub fn new(ranges: Vec<AddrRange>) -> Self {
        Self { ranges }
    }

    /// Every IPv4 and IPv6 address
    pub fn any() -> Self {
        Self::new(vec![AddrRange::any_v4(), AddrRange::any_v6()])
    }

    /// Parse a comma-separated list of ranges
    pub fn parse(s: &str) -> Result<Self> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>>>()
            .map(Self::new)
    }

    /// Ranges in configuration order
    pub fn ranges(&self) -> &[AddrRange] {
        &self.ranges
    }

    /// Whether the spec holds no ranges
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Whether `addr` falls within any range of `spec`
///
/// Ranges of the other address family are skipped rather than ending the
/// search, so mixed-family specs work.
pub fn address_match(addr: &SocketAddr, spec: &AddressSpec) -> bool {
    spec.ranges
        .iter()
        .filter(|r| r.is_ipv4() == addr.is_ipv4())
        .any(|r| r.contains(addr))
}

/// Endpoint equality for session lookup
///
/// Families must agree and ports are ignored. IPv6 link-local addresses
/// also need compatible scopes: equal, or either one unscoped.
pub fn addr_equal(a: &SocketAddr, b: &SocketAddr) -> bool {
    match (a, b) {
        (SocketAddr::V4(x), SocketAddr::V4(y)) => x.ip() == y.ip(),
        (SocketAddr::V6(x), SocketAddr::V6(y)) => {
            x.ip() == y.ip() && scopes_compatible(x.ip(), x.scope_id(), y.scope_id())
        }
        _ => false,
    }
}

/// Whether `addr` is multicast
pub fn is_multicast(addr: &SocketAddr) -> bool {
    addr.ip().is_multicast()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV6;

    fn sa(s: &str) -> SocketAddr {
        SocketAddr::new(s.parse().unwrap(), 0)
    }

    fn sa6(s: &str, scope: u32) -> SocketAddr {
        SocketAddr::V6(SocketAddrV6::new(s.parse().unwrap(), 0, 0, scope))
    }

    #[test]
    fn test_parse_forms() {
        let cidr: AddrRange = "10.0.0.0/24".parse().unwrap();
        assert_eq!(
            cidr,
            AddrRange::V4 {
                start: "10.0.0.0".parse().unwrap(),
                end: "10.0.0.255".parse().unwrap()
            }
        );
        let range: AddrRange = "10.0.0.5 - 10.0.0.9".parse().unwrap();
        assert!(range.contains(&sa("10.0.0.7")));
        let scoped: AddrRange = "fe80::1%2".parse().unwrap();
        assert_eq!(scoped.to_string(), "fe80::1%2");
        assert!("10.0.0.9-10.0.0.1".parse::<AddrRange>().is_err());
        assert!("10.0.0.1-::1".parse::<AddrRange>().is_err());
        assert!("bogus".parse::<AddrRange>().is_err());
    }

    #[test]
    fn test_cidr_host_bits_truncated() {
        let r: AddrRange = "10.0.0.77/24".parse().unwrap();
        assert!(r.contains(&sa("10.0.0.1")));
    }

    #[test]
    fn test_address_match() {
        let spec = AddressSpec::parse("10.0.0.0/24, 2001:db8::/32").unwrap();
        assert!(address_match(&sa("10.0.0.5"), &spec));
        assert!(address_match(&sa("2001:db8::7"), &spec));
        assert!(!address_match(&sa("10.0.1.5"), &spec));
        assert!(!address_match(&sa("10.0.0.5"), &AddressSpec::default()));
    }

    #[test]
    fn test_mixed_family_spec_skips_other_family() {
        let spec = AddressSpec::parse("2001:db8::/32,192.0.2.0/24").unwrap();
        assert!(address_match(&sa("192.0.2.10"), &spec));
    }

    #[test]
    fn test_single_range_reflexive() {
        let r = AddrRange::single("192.0.2.1".parse().unwrap());
        assert!(r.contains(&sa("192.0.2.1")));
        assert!(!r.contains(&sa("192.0.2.2")));
        assert!(!r.contains(&sa("192.0.2.0")));
    }

    #[test]
    fn test_link_local_scope() {
        let r = AddrRange::single("fe80::1".parse().unwrap()).with_scope(2);
        assert!(r.contains(&sa6("fe80::1", 2)));
        assert!(r.contains(&sa6("fe80::1", 0)));
        assert!(!r.contains(&sa6("fe80::1", 3)));

        let unscoped = AddrRange::single("fe80::1".parse().unwrap());
        assert!(unscoped.contains(&sa6("fe80::1", 9)));

        // Scope ids are meaningless off-link
        let global = AddrRange::single("2001:db8::1".parse().unwrap()).with_scope(2);
        assert!(global.contains(&sa6("2001:db8::1", 3)));
    }

    #[test]
    fn test_addr_equal() {
        assert!(addr_equal(&"10.0.0.1:500".parse().unwrap(), &sa("10.0.0.1")));
        assert!(!addr_equal(&sa("10.0.0.1"), &sa("::ffff:10.0.0.1")));
        assert!(addr_equal(&sa6("fe80::1", 2), &sa6("fe80::1", 0)));
        assert!(!addr_equal(&sa6("fe80::1", 2), &sa6("fe80::1", 3)));
        assert!(addr_equal(&sa6("2001:db8::1", 2), &sa6("2001:db8::1", 3)));
    }

    #[test]
    fn test_multicast() {
        assert!(is_multicast(&sa("224.0.0.1")));
        assert!(is_multicast(&sa("ff02::1")));
        assert!(!is_multicast(&sa("10.0.0.1")));
    }
}
