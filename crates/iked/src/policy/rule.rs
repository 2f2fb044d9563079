//! Policy rules
//!
//! A [`Rule`] says which endpoints and identities may negotiate, which
//! Phase-1 transforms they may use, and what Phase-2 lifetimes to apply.
//! Rules are shared read-only through `Arc`; a session that needs to adjust
//! one (lifetimes adopted from an ACQUIRE) works on its own copy.

use super::addr::AddressSpec;
use super::ident::IdentitySpec;
use super::lifetime::P2Lifetimes;

/// Phase-1 exchange mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExchangeMode {
    /// Either mode (responder rules only)
    Any,
    /// Identity-protecting main mode
    Main,
    /// Aggressive mode
    Aggressive,
}

impl ExchangeMode {
    /// Whether a rule with this mode admits an exchange in `mode`
    pub fn admits(self, mode: ExchangeMode) -> bool {
        self == ExchangeMode::Any || self == mode
    }
}

/// Phase-1 authentication method (RFC 2409 Appendix A)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AuthMethod {
    /// Pre-shared key
    PreSharedKey = 1,
    /// DSS signatures
    DssSig = 2,
    /// RSA signatures
    RsaSig = 3,
    /// RSA encryption
    RsaEncrypt = 4,
    /// Revised RSA encryption
    RsaRevisedEncrypt = 5,
}

/// Phase-1 encryption algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EncrAlg {
    /// DES-CBC
    DesCbc = 1,
    /// Blowfish-CBC
    BlowfishCbc = 3,
    /// 3DES-CBC
    TripleDesCbc = 5,
    /// AES-CBC, variable key size
    AesCbc = 7,
}

/// Phase-1 hash algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HashAlg {
    /// MD5
    Md5 = 1,
    /// SHA-1
    Sha1 = 2,
    /// SHA-256
    Sha256 = 4,
    /// SHA-384
    Sha384 = 5,
    /// SHA-512
    Sha512 = 6,
}

/// AES key sizes, largest first
pub const AES_KEY_SIZES: [u16; 3] = [256, 192, 128];

/// One configured Phase-1 transform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Phase1Transform {
    /// Authentication method
    pub auth: AuthMethod,
    /// Encryption algorithm
    pub encr: EncrAlg,
    /// Smallest acceptable key size; 0 leaves it to the algorithm
    pub key_bits_low: u16,
    /// Largest acceptable key size; 0 leaves it to the algorithm
    pub key_bits_high: u16,
    /// Hash algorithm
    pub hash: HashAlg,
    /// Oakley group
    pub dh_group: u16,
    /// Phase-1 lifetime, seconds
    pub lifetime_secs: u32,
    /// Phase-1 lifetime, kilobytes
    pub lifetime_kb: u32,
}

impl Phase1Transform {
    /// Transform with unrestricted key size and an eight hour lifetime
    pub fn new(auth: AuthMethod, encr: EncrAlg, hash: HashAlg, dh_group: u16) -> Self {
        Self {
            auth,
            encr,
            key_bits_low: 0,
            key_bits_high: 0,
            hash,
            dh_group,
            lifetime_secs: 28_800,
            lifetime_kb: 0,
        }
    }

    /// Restrict the key size range
    pub fn with_key_bits(mut self, low: u16, high: u16) -> Self {
        self.key_bits_low = low;
        self.key_bits_high = high;
        self
    }

    fn key_range(&self) -> (u16, u16) {
        let low = if self.key_bits_low == 0 { 128 } else { self.key_bits_low };
        let high = if self.key_bits_high == 0 { 256 } else { self.key_bits_high };
        (low, high)
    }

    /// Whether a peer's Phase-1 proposal satisfies this transform
    ///
    /// AES proposals without a key length count as 128-bit.
    pub fn accepts(&self, proposal: &Phase1Proposal) -> bool {
        if proposal.auth != self.auth
            || proposal.hash != self.hash
            || proposal.encr != self.encr
            || proposal.dh_group != self.dh_group
        {
            return false;
        }
        if self.encr == EncrAlg::AesCbc {
            let bits = if proposal.key_bits == 0 { 128 } else { proposal.key_bits };
            let (low, high) = self.key_range();
            return AES_KEY_SIZES.contains(&bits) && low <= bits && bits <= high;
        }
        true
    }

    /// Concrete proposals for this transform
    ///
    /// An AES transform expands to every standard key size in its range,
    /// largest first.
    pub fn proposals(&self) -> Vec<Phase1Proposal> {
        let base = Phase1Proposal {
            auth: self.auth,
            encr: self.encr,
            key_bits: 0,
            hash: self.hash,
            dh_group: self.dh_group,
            lifetime_secs: self.lifetime_secs,
            lifetime_kb: self.lifetime_kb,
        };
        if self.encr != EncrAlg::AesCbc {
            return vec![base];
        }
        let (low, high) = self.key_range();
        AES_KEY_SIZES
            .iter()
            .filter(|&&bits| low <= bits && bits <= high)
            .map(|&bits| Phase1Proposal {
                key_bits: bits,
                ..base
            })
            .collect()
    }
}

/// A concrete Phase-1 transform as offered on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase1Proposal {
    /// Authentication method
    pub auth: AuthMethod,
    /// Encryption algorithm
    pub encr: EncrAlg,
    /// Key size, 0 when the algorithm has a fixed one
    pub key_bits: u16,
    /// Hash algorithm
    pub hash: HashAlg,
    /// Oakley group
    pub dh_group: u16,
    /// Lifetime, seconds
    pub lifetime_secs: u32,
    /// Lifetime, kilobytes
    pub lifetime_kb: u32,
}

/// A policy rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Unique name
    pub label: String,
    /// Key-manager cookie the kernel uses to point ACQUIREs at this rule
    pub cookie: u32,
    /// Local endpoints
    pub local_addr: AddressSpec,
    /// Remote endpoints
    pub remote_addr: AddressSpec,
    /// Acceptable local identities
    pub local_id: IdentitySpec,
    /// Acceptable remote identities
    pub remote_id: IdentitySpec,
    /// Exchange mode
    pub mode: ExchangeMode,
    /// Phase-1 transforms in preference order
    pub transforms: Vec<Phase1Transform>,
    /// Phase-2 lifetimes
    pub p2_lifetimes: P2Lifetimes,
    /// Phase-2 PFS group, 0 for none
    pub p2_pfs: u16,
}

impl Rule {
    /// Rule matching nothing until endpoints and transforms are added
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            cookie: 0,
            local_addr: AddressSpec::default(),
            remote_addr: AddressSpec::default(),
            local_id: IdentitySpec::default(),
            remote_id: IdentitySpec::default(),
            mode: ExchangeMode::Main,
            transforms: Vec::new(),
            p2_lifetimes: P2Lifetimes::defaults(),
            p2_pfs: 0,
        }
    }

    /// Set the key-manager cookie
    pub fn with_cookie(mut self, cookie: u32) -> Self {
        self.cookie = cookie;
        self
    }

    /// Set both endpoint specs
    pub fn with_addresses(mut self, local: AddressSpec, remote: AddressSpec) -> Self {
        self.local_addr = local;
        self.remote_addr = remote;
        self
    }

    /// Set both identity specs
    pub fn with_identities(mut self, local: IdentitySpec, remote: IdentitySpec) -> Self {
        self.local_id = local;
        self.remote_id = remote;
        self
    }

    /// Set the exchange mode
    pub fn with_mode(mut self, mode: ExchangeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Append a Phase-1 transform
    pub fn with_transform(mut self, transform: Phase1Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Set Phase-2 lifetimes (normalized)
    pub fn with_p2_lifetimes(mut self, lifetimes: P2Lifetimes) -> Self {
        self.p2_lifetimes = super::lifetime::normalize_lifetimes(lifetimes);
        self
    }

    /// Set the Phase-2 PFS group
    pub fn with_p2_pfs(mut self, group: u16) -> Self {
        self.p2_pfs = group;
        self
    }

    /// Whether the first transform authenticates with a pre-shared key
    pub fn uses_psk(&self) -> bool {
        self.transforms
            .first()
            .map_or(false, |t| t.auth == AuthMethod::PreSharedKey)
    }

    /// Phase-1 proposals an initiator offers for this rule
    pub fn phase1_proposals(&self) -> Vec<Phase1Proposal> {
        self.transforms.iter().flat_map(Phase1Transform::proposals).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aes(low: u16, high: u16) -> Phase1Transform {
        Phase1Transform::new(AuthMethod::PreSharedKey, EncrAlg::AesCbc, HashAlg::Sha256, 14)
            .with_key_bits(low, high)
    }

    #[test]
    fn test_aes_expansion() {
        let bits: Vec<u16> = aes(0, 0).proposals().iter().map(|p| p.key_bits).collect();
        assert_eq!(bits, vec![256, 192, 128]);

        let bits: Vec<u16> = aes(128, 192).proposals().iter().map(|p| p.key_bits).collect();
        assert_eq!(bits, vec![192, 128]);

        let des = Phase1Transform::new(AuthMethod::RsaSig, EncrAlg::TripleDesCbc, HashAlg::Sha1, 2);
        assert_eq!(des.proposals().len(), 1);
    }

    #[test]
    fn test_accepts() {
        let t = aes(0, 192);
        let mut p = t.proposals()[0];
        assert!(t.accepts(&p));

        p.key_bits = 0; // treated as 128
        assert!(t.accepts(&p));

        p.key_bits = 256;
        assert!(!t.accepts(&p));

        p.key_bits = 160;
        assert!(!aes(0, 0).accepts(&p));

        let mut q = t.proposals()[0];
        q.dh_group = 2;
        assert!(!t.accepts(&q));
    }

    #[test]
    fn test_rule_builders() {
        let rule = Rule::new("office")
            .with_cookie(7)
            .with_transform(aes(0, 0))
            .with_p2_pfs(14);
        assert!(rule.uses_psk());
        assert_eq!(rule.phase1_proposals().len(), 3);
        assert_eq!(rule.p2_lifetimes, P2Lifetimes::defaults());
        assert!(!Rule::new("empty").uses_psk());
    }

    #[test]
    fn test_mode_admits() {
        assert!(ExchangeMode::Any.admits(ExchangeMode::Aggressive));
        assert!(ExchangeMode::Main.admits(ExchangeMode::Main));
        assert!(!ExchangeMode::Main.admits(ExchangeMode::Aggressive));
    }
}
