//! Peer identities and identity patterns
//!
//! Rules restrict the identities a negotiation may present through include
//! and exclude pattern lists. Name-typed identities compare against shell
//! style patterns (`*` and `?`); address-typed identities compare by range
//! containment.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use super::addr::AddrRange;

/// ISAKMP identity payload types (RFC 2407 §4.6.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IdType {
    /// Single IPv4 address
    Ipv4Addr,
    /// Fully-qualified domain name
    Fqdn,
    /// user@domain
    UserFqdn,
    /// IPv4 subnet
    Ipv4Prefix,
    /// Single IPv6 address
    Ipv6Addr,
    /// IPv6 subnet
    Ipv6Prefix,
    /// IPv4 start-end range
    Ipv4Range,
    /// IPv6 start-end range
    Ipv6Range,
    /// DER-encoded distinguished name, carried here in LDAP string form
    DerAsn1Dn,
    /// Opaque key identifier
    KeyId,
}

impl IdType {
    /// Wire value of the identity type
    pub fn to_u8(self) -> u8 {
        match self {
            IdType::Ipv4Addr => 1,
            IdType::Fqdn => 2,
            IdType::UserFqdn => 3,
            IdType::Ipv4Prefix => 4,
            IdType::Ipv6Addr => 5,
            IdType::Ipv6Prefix => 6,
            IdType::Ipv4Range => 7,
            IdType::Ipv6Range => 8,
            IdType::DerAsn1Dn => 9,
            IdType::KeyId => 11,
        }
    }

    /// Identity type from its wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => IdType::Ipv4Addr,
            2 => IdType::Fqdn,
            3 => IdType::UserFqdn,
            4 => IdType::Ipv4Prefix,
            5 => IdType::Ipv6Addr,
            6 => IdType::Ipv6Prefix,
            7 => IdType::Ipv4Range,
            8 => IdType::Ipv6Range,
            9 => IdType::DerAsn1Dn,
            11 => IdType::KeyId,
            _ => return None,
        })
    }

    /// Whether identities of this type name addresses rather than principals
    pub fn is_address(self) -> bool {
        matches!(
            self,
            IdType::Ipv4Addr
                | IdType::Ipv4Prefix
                | IdType::Ipv4Range
                | IdType::Ipv6Addr
                | IdType::Ipv6Prefix
                | IdType::Ipv6Range
        )
    }
}

/// A concrete identity presented or expected in a negotiation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Payload type
    pub id_type: IdType,
    /// Textual value (address forms use the usual notation)
    pub value: String,
}

impl Identity {
    /// Identity from type and value
    pub fn new(id_type: IdType, value: impl Into<String>) -> Self {
        Self {
            id_type,
            value: value.into(),
        }
    }

    /// Address identity for an endpoint
    pub fn from_addr(addr: &SocketAddr) -> Self {
        let id_type = if addr.is_ipv4() {
            IdType::Ipv4Addr
        } else {
            IdType::Ipv6Addr
        };
        Self::new(id_type, addr.ip().to_string())
    }

    /// The address range an address-typed identity covers
    pub fn as_range(&self) -> Option<AddrRange> {
        if !self.id_type.is_address() {
            return None;
        }
        self.value.parse().ok()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.id_type, self.value)
    }
}

/// Include/exclude identity patterns
///
/// An empty include list accepts any identity not excluded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IdentitySpec {
    /// Patterns an identity must match one of
    pub includes: Vec<String>,
    /// Patterns an identity must match none of
    pub excludes: Vec<String>,
}

impl IdentitySpec {
    /// Spec accepting anything matching one of `includes`
    pub fn including<I, S>(includes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            includes: includes.into_iter().map(Into::into).collect(),
            excludes: Vec::new(),
        }
    }

    /// Add an exclusion
    pub fn excluding(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    /// Whether the spec places no restriction
    pub fn is_unrestricted(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    /// Whether `id` passes the include and exclude lists
    pub fn matches(&self, id: &Identity) -> bool {
        let included =
            self.includes.is_empty() || self.includes.iter().any(|p| pattern_matches(p, id));
        included && !self.excludes.iter().any(|p| pattern_matches(p, id))
    }

    /// Derive the identity to expect from the peer
    ///
    /// The first include that names a concrete identity wins. Explicit
    /// `EMAIL=`, `DNS=`, `DN=` and `IP=` prefixes decide the type; otherwise
    /// the shape of the string does. Patterns with wildcards never qualify.
    pub fn construct_id(&self) -> Option<Identity> {
        self.includes.iter().find_map(|p| concrete_identity(p))
    }
}

fn concrete_identity(pattern: &str) -> Option<Identity> {
    if pattern.contains(['*', '?']) {
        return None;
    }
    let id = if let Some(v) = pattern.strip_prefix("EMAIL=") {
        Identity::new(IdType::UserFqdn, v)
    } else if let Some(v) = pattern.strip_prefix("DNS=") {
        Identity::new(IdType::Fqdn, v)
    } else if let Some(v) = pattern.strip_prefix("DN=") {
        Identity::new(IdType::DerAsn1Dn, v)
    } else if let Some(v) = pattern.strip_prefix("IP=") {
        address_identity(v)?
    } else if pattern.contains('=') {
        Identity::new(IdType::DerAsn1Dn, pattern)
    } else if pattern.contains('@') {
        Identity::new(IdType::UserFqdn, pattern)
    } else if let Some(id) = address_identity(pattern) {
        id
    } else if pattern.contains('.') {
        Identity::new(IdType::Fqdn, pattern)
    } else {
        return None;
    };
    Some(id)
}

fn address_identity(s: &str) -> Option<Identity> {
    match s.parse::<IpAddr>().ok()? {
        IpAddr::V4(a) => Some(Identity::new(IdType::Ipv4Addr, a.to_string())),
        IpAddr::V6(a) => Some(Identity::new(IdType::Ipv6Addr, a.to_string())),
    }
}

fn strip_type_prefix(pattern: &str) -> &str {
    ["EMAIL=", "DNS=", "DN=", "IP="]
        .iter()
        .find_map(|prefix| pattern.strip_prefix(prefix))
        .unwrap_or(pattern)
}

fn pattern_matches(pattern: &str, id: &Identity) -> bool {
    let pattern = strip_type_prefix(pattern);
    if id.id_type.is_address() {
        return match (pattern.parse::<AddrRange>(), id.as_range()) {
            (Ok(allowed), Some(AddrRange::V4 { start, end })) => {
                range_covers(&allowed, IpAddr::V4(start), IpAddr::V4(end))
            }
            (Ok(allowed), Some(AddrRange::V6 { start, end, .. })) => {
                range_covers(&allowed, IpAddr::V6(start), IpAddr::V6(end))
            }
            _ => false,
        };
    }
    match id.id_type {
        IdType::Fqdn | IdType::UserFqdn => glob_match(
            pattern.to_ascii_lowercase().as_bytes(),
            id.value.to_ascii_lowercase().as_bytes(),
        ),
        _ => glob_match(pattern.as_bytes(), id.value.as_bytes()),
    }
}

fn range_covers(allowed: &AddrRange, start: IpAddr, end: IpAddr) -> bool {
    let lo = SocketAddr::new(start, 0);
    let hi = SocketAddr::new(end, 0);
    allowed.contains(&lo) && allowed.contains(&hi)
}

/// Shell-style match supporting `*` and `?`
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Whether a pre-shared-key negotiation may use these identities
///
/// Pre-shared keys are looked up by address, so both sides must identify
/// by address.
pub fn psk_identities_compatible(local: Option<&Identity>, remote: Option<&Identity>) -> bool {
    [local, remote]
        .iter()
        .all(|id| id.map_or(true, |id| id.id_type.is_address()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob() {
        assert!(glob_match(b"*.example.com", b"vpn.example.com"));
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"a?c", b"abc"));
        assert!(!glob_match(b"a?c", b"ac"));
        assert!(glob_match(b"*a*b", b"xxaxxb"));
        assert!(!glob_match(b"*.example.com", b"example.org"));
    }

    #[test]
    fn test_fqdn_case_insensitive() {
        let spec = IdentitySpec::including(["DNS=*.Example.COM"]);
        assert!(spec.matches(&Identity::new(IdType::Fqdn, "gw.example.com")));
        assert!(!spec.matches(&Identity::new(IdType::DerAsn1Dn, "gw.example.com")));
    }

    #[test]
    fn test_excludes_win() {
        let spec = IdentitySpec::including(["*@example.com"]).excluding("root@*");
        assert!(spec.matches(&Identity::new(IdType::UserFqdn, "alice@example.com")));
        assert!(!spec.matches(&Identity::new(IdType::UserFqdn, "root@example.com")));
    }

    #[test]
    fn test_unrestricted() {
        let spec = IdentitySpec::default();
        assert!(spec.is_unrestricted());
        assert!(spec.matches(&Identity::new(IdType::KeyId, "abc")));
    }

    #[test]
    fn test_address_identity_by_containment() {
        let spec = IdentitySpec::including(["IP=10.0.0.0/8"]);
        assert!(spec.matches(&Identity::new(IdType::Ipv4Addr, "10.1.2.3")));
        assert!(spec.matches(&Identity::new(IdType::Ipv4Prefix, "10.1.0.0/16")));
        assert!(!spec.matches(&Identity::new(IdType::Ipv4Addr, "11.0.0.1")));
        assert!(!spec.matches(&Identity::new(IdType::Ipv4Addr, "not an address")));
    }

    #[test]
    fn test_construct_id() {
        let spec = IdentitySpec::including(["*.wild.example", "EMAIL=bob@example.com"]);
        assert_eq!(
            spec.construct_id(),
            Some(Identity::new(IdType::UserFqdn, "bob@example.com"))
        );
        assert_eq!(
            IdentitySpec::including(["CN=gw, O=Example"]).construct_id(),
            Some(Identity::new(IdType::DerAsn1Dn, "CN=gw, O=Example"))
        );
        assert_eq!(
            IdentitySpec::including(["2001:db8::1"]).construct_id(),
            Some(Identity::new(IdType::Ipv6Addr, "2001:db8::1"))
        );
        assert_eq!(
            IdentitySpec::including(["gw.example.com"]).construct_id(),
            Some(Identity::new(IdType::Fqdn, "gw.example.com"))
        );
        assert_eq!(IdentitySpec::including(["IP=bogus"]).construct_id(), None);
        assert_eq!(IdentitySpec::default().construct_id(), None);
    }

    #[test]
    fn test_psk_compatibility() {
        let addr = Identity::new(IdType::Ipv4Addr, "10.0.0.1");
        let name = Identity::new(IdType::Fqdn, "gw.example.com");
        assert!(psk_identities_compatible(Some(&addr), Some(&addr)));
        assert!(psk_identities_compatible(None, Some(&addr)));
        assert!(!psk_identities_compatible(Some(&addr), Some(&name)));
    }

    #[test]
    fn test_wire_values() {
        for v in 0..=12u8 {
            if let Some(t) = IdType::from_u8(v) {
                assert_eq!(t.to_u8(), v);
            }
        }
        assert!(IdType::from_u8(10).is_none());
    }
}
