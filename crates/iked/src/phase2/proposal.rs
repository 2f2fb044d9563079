//! Phase-2 proposal construction
//!
//! Turns the extended proposal (`X_EPROP`) of a kernel ACQUIRE into Quick
//! Mode proposals, one per kernel combination, and matches a peer's
//! proposals against the combinations the kernel returns for an inverse
//! ACQUIRE.
//!
//! # Transforms
//!
//! AH algorithms map one-to-one onto AH transforms. For ESP every cipher is
//! paired with every integrity algorithm of the combination, and ciphers
//! with a variable key size are offered once per key size the kernel
//! accepts, largest first.

use crate::error::{Error, Result};
use crate::pfkey::constants::{aalg, AlgType, SaType};
use crate::pfkey::message::{AlgDesc, Ecomb, EpropExt};
use crate::phase2::algs::AlgorithmTable;
use crate::policy::P2Lifetimes;
use crate::negotiation::{PeerProposal, PeerProtocol, ProposedSa, PROTO_IPSEC_AH, PROTO_IPSEC_ESP};

/// Most transforms one protocol may carry
pub const MAX_TRANSFORMS: usize = 255;

/// IPsec DOI encapsulation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncapMode {
    /// Tunnel mode
    Tunnel = 1,
    /// Transport mode
    Transport = 2,
    /// UDP-encapsulated tunnel mode (NAT-T)
    UdpTunnel = 3,
    /// UDP-encapsulated transport mode (NAT-T)
    UdpTransport = 4,
}

impl EncapMode {
    /// Mode for the given traffic shape
    pub fn select(tunnel: bool, natt: bool) -> Self {
        match (tunnel, natt) {
            (true, false) => EncapMode::Tunnel,
            (false, false) => EncapMode::Transport,
            (true, true) => EncapMode::UdpTunnel,
            (false, true) => EncapMode::UdpTransport,
        }
    }
}

/// IPsec DOI life type: seconds
pub const LIFE_SECONDS: u16 = 1;
/// IPsec DOI life type: kilobytes
pub const LIFE_KILOBYTES: u16 = 2;

/// IPsec DOI SA attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaAttribute {
    /// Selects the unit of the next duration
    LifeType(u16),
    /// Lifetime in the unit of the preceding life type
    LifeDuration(u32),
    /// PFS group
    GroupDesc(u16),
    /// Encapsulation mode
    EncapsulationMode(EncapMode),
    /// Integrity algorithm (DOI numbering)
    AuthAlgorithm(u16),
    /// Cipher key length in bits
    KeyLength(u16),
}

impl SaAttribute {
    /// DOI attribute class
    pub fn class(&self) -> u16 {
        match self {
            SaAttribute::LifeType(_) => 1,
            SaAttribute::LifeDuration(_) => 2,
            SaAttribute::GroupDesc(_) => 3,
            SaAttribute::EncapsulationMode(_) => 4,
            SaAttribute::AuthAlgorithm(_) => 5,
            SaAttribute::KeyLength(_) => 6,
        }
    }
}

/// One transform of a protocol proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// Transform number, from 1
    pub number: u8,
    /// AH or ESP transform id
    pub transform_id: u8,
    /// SA attributes
    pub attributes: Vec<SaAttribute>,
}

/// Transforms offered for one protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolProposal {
    /// AH or ESP
    pub protocol: SaType,
    /// Our inbound SPI once allocated
    pub spi: u32,
    /// Alternatives in preference order
    pub transforms: Vec<Transform>,
}

/// A Quick Mode proposal: every protocol applies together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase2Proposal {
    /// Proposal number, from 1
    pub number: u8,
    /// AH before ESP
    pub protocols: Vec<ProtocolProposal>,
}

/// Session and traffic facts a proposal depends on
#[derive(Debug, Clone, Copy)]
pub struct ProposalContext<'a> {
    /// Kernel algorithm table
    pub algs: &'a AlgorithmTable,
    /// Lifetimes of the session's rule
    pub lifetimes: P2Lifetimes,
    /// PFS group, 0 for none
    pub pfs_group: u16,
    /// Tunnel mode (the ACQUIRE names inner addresses)
    pub tunnel: bool,
    /// Traffic crosses a NAT
    pub natt: bool,
}

/// DOI integrity algorithm for a PF_KEY one
pub fn doi_auth_alg(alg: u8) -> Option<u16> {
    Some(match alg {
        aalg::MD5_HMAC => 1,
        aalg::SHA1_HMAC => 2,
        aalg::SHA256_HMAC => 5,
        aalg::SHA384_HMAC => 6,
        aalg::SHA512_HMAC => 7,
        _ => return None,
    })
}

/// PF_KEY integrity algorithm for a DOI one
pub fn pfkey_auth_alg(doi: u16) -> Option<u8> {
    Some(match doi {
        1 => aalg::MD5_HMAC,
        2 => aalg::SHA1_HMAC,
        5 => aalg::SHA256_HMAC,
        6 => aalg::SHA384_HMAC,
        7 => aalg::SHA512_HMAC,
        _ => return None,
    })
}

fn lifetime_attributes(comb: &Ecomb, lifetimes: &P2Lifetimes) -> Vec<SaAttribute> {
    let mut attrs = Vec::new();
    if comb.hard_addtime != 0 {
        let secs = if lifetimes.hard_secs != 0 {
            lifetimes.hard_secs
        } else {
            comb.hard_addtime.min(u64::from(u32::MAX)) as u32
        };
        attrs.push(SaAttribute::LifeType(LIFE_SECONDS));
        attrs.push(SaAttribute::LifeDuration(secs));
    }
    let kb = if lifetimes.hard_kb != 0 {
        lifetimes.hard_kb
    } else {
        (comb.hard_bytes >> 10).min(u64::from(u32::MAX)) as u32
    };
    if kb != 0 {
        attrs.push(SaAttribute::LifeType(LIFE_KILOBYTES));
        attrs.push(SaAttribute::LifeDuration(kb));
    }
    attrs
}

/// Key sizes to offer for a cipher, largest first; `[0]` for fixed-key ciphers
fn key_sizes(desc: &AlgDesc, algs: &AlgorithmTable) -> Vec<u16> {
    let Some(kernel) = algs.find(desc.satype, desc.algtype, desc.alg) else {
        return vec![0];
    };
    if kernel.minbits == kernel.maxbits {
        return vec![0];
    }
    let min = if desc.minbits != 0 { desc.minbits } else { kernel.minbits };
    let max = if desc.maxbits != 0 { desc.maxbits } else { kernel.maxbits };
    if kernel.increment == 0 {
        return vec![max];
    }
    let step = u16::from(kernel.increment);
    let mut sizes = Vec::new();
    let mut bits = max;
    while bits >= min {
        sizes.push(bits);
        match bits.checked_sub(step) {
            Some(next) => bits = next,
            None => break,
        }
    }
    sizes
}

fn push_transform(transforms: &mut Vec<Transform>, transform_id: u8, attributes: Vec<SaAttribute>) -> Result<()> {
    if transforms.len() >= MAX_TRANSFORMS {
        return Err(Error::ResourceExhausted(format!(
            "more than {} transforms in one proposal",
            MAX_TRANSFORMS
        )));
    }
    transforms.push(Transform {
        number: transforms.len() as u8 + 1,
        transform_id,
        attributes,
    });
    Ok(())
}

fn build_one(number: u8, comb: &Ecomb, ctx: &ProposalContext<'_>) -> Result<Phase2Proposal> {
    let mut ah = Vec::new();
    let mut esp_auth = Vec::new();
    let mut esp_encr = Vec::new();
    for desc in &comb.algs {
        match (SaType::from_u8(desc.satype), AlgType::from_u8(desc.algtype)) {
            (Some(SaType::Ah), Some(AlgType::Auth)) => ah.push(desc),
            (Some(SaType::Esp), Some(AlgType::Auth)) => esp_auth.push(desc),
            (Some(SaType::Esp), Some(AlgType::Crypt)) => esp_encr.push(desc),
            _ => {
                return Err(Error::InvalidMessage(format!(
                    "unexpected algorithm descriptor (satype {}, type {})",
                    desc.satype, desc.algtype
                )))
            }
        }
    }
    if !ah.is_empty() && ctx.natt {
        return Err(Error::InvalidParameter("AH cannot traverse a NAT".into()));
    }
    if esp_encr.is_empty() && !esp_auth.is_empty() {
        return Err(Error::InvalidMessage("ESP integrity without a cipher".into()));
    }

    let mut base = lifetime_attributes(comb, &ctx.lifetimes);
    base.push(SaAttribute::EncapsulationMode(EncapMode::select(ctx.tunnel, ctx.natt)));
    if ctx.pfs_group != 0 {
        base.push(SaAttribute::GroupDesc(ctx.pfs_group));
    }

    let mut protocols = Vec::new();
    if !ah.is_empty() {
        let mut transforms = Vec::new();
        for desc in ah {
            let doi = doi_auth_alg(desc.alg).ok_or_else(|| {
                Error::InvalidMessage(format!("AH algorithm {} has no IKE number", desc.alg))
            })?;
            let mut attributes = base.clone();
            attributes.push(SaAttribute::AuthAlgorithm(doi));
            push_transform(&mut transforms, desc.alg, attributes)?;
        }
        protocols.push(ProtocolProposal {
            protocol: SaType::Ah,
            spi: 0,
            transforms,
        });
    }

    if !esp_encr.is_empty() {
        let auths: Vec<Option<u16>> = if esp_auth.is_empty() {
            vec![None]
        } else {
            esp_auth
                .iter()
                .map(|d| {
                    doi_auth_alg(d.alg).map(Some).ok_or_else(|| {
                        Error::InvalidMessage(format!("ESP integrity {} has no IKE number", d.alg))
                    })
                })
                .collect::<Result<_>>()?
        };
        let mut transforms = Vec::new();
        for cipher in esp_encr {
            let sizes = key_sizes(cipher, ctx.algs);
            for auth in &auths {
                for &bits in &sizes {
                    let mut attributes = base.clone();
                    if let Some(doi) = auth {
                        attributes.push(SaAttribute::AuthAlgorithm(*doi));
                    }
                    if bits != 0 {
                        attributes.push(SaAttribute::KeyLength(bits));
                    }
                    push_transform(&mut transforms, cipher.alg, attributes)?;
                }
            }
        }
        protocols.push(ProtocolProposal {
            protocol: SaType::Esp,
            spi: 0,
            transforms,
        });
    }

    if protocols.is_empty() {
        return Err(Error::InvalidMessage("combination without algorithms".into()));
    }
    Ok(Phase2Proposal { number, protocols })
}

/// Build the Quick Mode proposals for an ACQUIRE's extended proposal
///
/// Combinations naming algorithms the kernel never registered are skipped.
/// Any malformed combination fails the whole build.
pub fn build_proposal(eprop: &EpropExt, ctx: &ProposalContext<'_>) -> Result<Vec<Phase2Proposal>> {
    let mut proposals = Vec::new();
    for comb in eprop.combs.iter().filter(|c| ctx.algs.comb_supported(c)) {
        let number = u8::try_from(proposals.len() + 1)
            .map_err(|_| Error::ResourceExhausted("too many proposals".into()))?;
        proposals.push(build_one(number, comb, ctx)?);
    }
    if proposals.is_empty() {
        return Err(Error::InvalidMessage("no supported algorithm combination".into()));
    }
    Ok(proposals)
}

/// SA types a proposal needs SPIs for, AH first
pub fn spi_types(proposals: &[Phase2Proposal]) -> Vec<SaType> {
    let mut types = Vec::new();
    for wanted in [SaType::Ah, SaType::Esp] {
        if proposals
            .iter()
            .any(|p| p.protocols.iter().any(|pp| pp.protocol == wanted))
        {
            types.push(wanted);
        }
    }
    types
}

fn transform_fits(comb: &Ecomb, protocol: u8, sa: &ProposedSa) -> bool {
    let descs = |satype: SaType, algtype: AlgType| {
        comb.algs
            .iter()
            .filter(move |d| d.satype == satype.to_u8() && d.algtype == algtype.to_u8())
    };
    match protocol {
        PROTO_IPSEC_AH => descs(SaType::Ah, AlgType::Auth).any(|d| d.alg == sa.transform_id),
        PROTO_IPSEC_ESP => {
            let cipher_ok = descs(SaType::Esp, AlgType::Crypt).any(|d| {
                d.alg == sa.transform_id
                    && (sa.key_bits == 0
                        || d.maxbits == 0
                        || (d.minbits <= sa.key_bits && sa.key_bits <= d.maxbits))
            });
            let mut auths = descs(SaType::Esp, AlgType::Auth).peekable();
            let auth_ok = match auths.peek() {
                None => sa.auth_alg == 0,
                Some(_) => pfkey_auth_alg(u16::from(sa.auth_alg))
                    .map_or(false, |alg| auths.any(|d| d.alg == alg)),
            };
            cipher_ok && auth_ok
        }
        _ => false,
    }
}

fn comb_protocols(comb: &Ecomb) -> (bool, bool) {
    let has = |satype: SaType| comb.algs.iter().any(|d| d.satype == satype.to_u8());
    (has(SaType::Ah), has(SaType::Esp))
}

fn protocol_choice(comb: &Ecomb, protocol: &PeerProtocol) -> Option<usize> {
    protocol
        .transforms
        .iter()
        .position(|t| transform_fits(comb, protocol.protocol, t))
}

/// Pick the first peer proposal the kernel's policy accepts
///
/// A proposal is accepted when one kernel combination covers exactly its
/// protocols and accepts a transform of each. Returns the proposal index and
/// the chosen transform index per protocol.
pub fn match_peer_proposals(
    peer: &[PeerProposal],
    eprop: &EpropExt,
) -> Option<(usize, Vec<usize>)> {
    peer.iter().enumerate().find_map(|(index, proposal)| {
        let wants_ah = proposal.protocols.iter().any(|p| p.protocol == PROTO_IPSEC_AH);
        let wants_esp = proposal.protocols.iter().any(|p| p.protocol == PROTO_IPSEC_ESP);
        eprop
            .combs
            .iter()
            .filter(|c| comb_protocols(c) == (wants_ah, wants_esp))
            .find_map(|comb| {
                proposal
                    .protocols
                    .iter()
                    .map(|p| protocol_choice(comb, p))
                    .collect::<Option<Vec<usize>>>()
            })
            .map(|choice| (index, choice))
    })
}
