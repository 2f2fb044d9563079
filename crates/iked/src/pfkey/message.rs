//! PF_KEY message codec
//!
//! A message is a 16-byte `sadb_msg` header followed by a sequence of
//! extensions, each starting with a 4-byte `sadb_ext` header:
//!
//! ```text
//!  0               1               2               3
//! +---------------+---------------+---------------+---------------+
//! |    version    |     type      |     errno     |    satype     |
//! +---------------+---------------+---------------+---------------+
//! |          len (words)          |          diagnostic           |
//! +---------------+---------------+---------------+---------------+
//! |                              seq                              |
//! +---------------+---------------+---------------+---------------+
//! |                              pid                              |
//! +---------------+---------------+---------------+---------------+
//! |        ext len (words)        |            ext type           |
//! +---------------+---------------+---------------+---------------+
//! |                   ext body, padded to 8 bytes                 |
//! ```
//!
//! All lengths are in 64-bit words. Header fields are in host byte order;
//! SPIs and ports are in network byte order.
//!
//! [`Message::from_bytes`] checks every declared length against the outer
//! bound before touching the body, rejects duplicate extensions and decodes
//! every known typed body once so that the typed accessors afterwards cannot
//! fail. Extensions without a typed body here (sensitivity labels, extended
//! dumps, ...) are carried opaquely and re-encoded byte for byte.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut, BytesMut};
use zeroize::{Zeroize, Zeroizing};

use super::constants::{
    af, bytes_to_words, pad8, ExtType, MsgType, SaType, ALIGN, EXT_HEADER_LEN, EXT_MAX,
    MAX_MSG_LEN, MSG_HEADER_LEN, PF_KEY_V2,
};
use crate::error::{Error, Result};

/// One extension as it appears on the wire
///
/// `body` excludes the 4-byte extension header and includes any trailing
/// alignment padding, so `EXT_HEADER_LEN + body.len()` is always a multiple
/// of eight.
#[derive(Clone, PartialEq, Eq)]
pub struct Extension {
    ext_type: u16,
    body: Vec<u8>,
}

impl Extension {
    /// Wrap a raw body, padding it to the 64-bit boundary
    pub fn new(ext_type: u16, mut body: Vec<u8>) -> Self {
        let padded = pad8(EXT_HEADER_LEN + body.len()) - EXT_HEADER_LEN;
        body.resize(padded, 0);
        Extension { ext_type, body }
    }

    /// Raw extension type
    pub fn ext_type(&self) -> u16 {
        self.ext_type
    }

    /// Typed extension type, when known
    pub fn kind(&self) -> Option<ExtType> {
        ExtType::from_u16(self.ext_type)
    }

    /// Body bytes after the extension header
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Encoded length in bytes, header included
    pub fn wire_len(&self) -> usize {
        EXT_HEADER_LEN + self.body.len()
    }

    fn is_key(&self) -> bool {
        self.kind().map_or(false, ExtType::is_key)
    }

    /// Decode the typed body once to make sure it is well formed
    fn check(&self) -> Result<()> {
        let Some(kind) = self.kind() else {
            return Ok(());
        };
        match kind {
            ExtType::Sa => SaExt::decode(self).map(|_| ()),
            t if t.is_lifetime() => LifetimeExt::decode(self).map(|_| ()),
            t if t.is_address() => AddressExt::decode(self).map(|_| ()),
            t if t.is_key() => KeyExt::decode(self).map(|_| ()),
            ExtType::IdentitySrc | ExtType::IdentityDst => IdentExt::decode(self).map(|_| ()),
            ExtType::SpiRange => SpiRangeExt::decode(self).map(|_| ()),
            ExtType::SupportedAuth | ExtType::SupportedEncrypt => {
                SupportedExt::decode(self).map(|_| ())
            }
            ExtType::XEprop => EpropExt::decode(self).map(|_| ()),
            ExtType::XKmCookie => KmCookieExt::decode(self).map(|_| ()),
            ExtType::XPair => PairExt::decode(self).map(|_| ()),
            ExtType::XReplayValue => ReplayValueExt::decode(self).map(|_| ()),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Extension");
        s.field("ext_type", &self.ext_type);
        if self.is_key() {
            s.field("body", &"<redacted>");
        } else {
            s.field("body", &hex::encode(&self.body));
        }
        s.finish()
    }
}

impl Drop for Extension {
    fn drop(&mut self) {
        if self.is_key() {
            self.body.zeroize();
        }
    }
}

/// Typed extension body
pub trait ExtBody: Sized {
    /// Decode from a raw extension
    fn decode(ext: &Extension) -> Result<Self>;

    /// Encode into a raw extension
    fn encode(&self) -> Extension;
}

fn need(body: &[u8], required: usize) -> Result<()> {
    if body.len() < required {
        return Err(Error::BufferTooShort {
            required,
            available: body.len(),
        });
    }
    Ok(())
}

fn expect_kind(ext: &Extension, ok: impl Fn(ExtType) -> bool) -> Result<ExtType> {
    match ext.kind() {
        Some(kind) if ok(kind) => Ok(kind),
        _ => Err(Error::InvalidMessage(format!(
            "extension type {} used with the wrong body",
            ext.ext_type
        ))),
    }
}

/// `sadb_sa`: the association itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaExt {
    /// SPI (host value, network order on the wire)
    pub spi: u32,
    /// Replay window size
    pub replay: u8,
    /// SA state
    pub state: u8,
    /// Authentication algorithm
    pub auth: u8,
    /// Encryption algorithm
    pub encrypt: u8,
    /// SA flags
    pub flags: u32,
}

impl ExtBody for SaExt {
    fn decode(ext: &Extension) -> Result<Self> {
        expect_kind(ext, |k| k == ExtType::Sa)?;
        let mut b = ext.body();
        need(b, 12)?;
        Ok(SaExt {
            spi: b.get_u32(),
            replay: b.get_u8(),
            state: b.get_u8(),
            auth: b.get_u8(),
            encrypt: b.get_u8(),
            flags: b.get_u32_ne(),
        })
    }

    fn encode(&self) -> Extension {
        let mut b = BytesMut::with_capacity(12);
        b.put_u32(self.spi);
        b.put_u8(self.replay);
        b.put_u8(self.state);
        b.put_u8(self.auth);
        b.put_u8(self.encrypt);
        b.put_u32_ne(self.flags);
        Extension::new(ExtType::Sa.to_u16(), b.to_vec())
    }
}

/// `sadb_lifetime`: current, hard, soft or idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifetimeExt {
    /// Which lifetime this is
    pub kind: ExtType,
    /// Allocations
    pub allocations: u32,
    /// Bytes
    pub bytes: u64,
    /// Seconds since add
    pub addtime: u64,
    /// Seconds since first use
    pub usetime: u64,
}

impl LifetimeExt {
    /// Lifetime with only a seconds and bytes bound
    pub fn new(kind: ExtType, addtime: u64, bytes: u64) -> Self {
        LifetimeExt {
            kind,
            allocations: 0,
            bytes,
            addtime,
            usetime: 0,
        }
    }
}

impl ExtBody for LifetimeExt {
    fn decode(ext: &Extension) -> Result<Self> {
        let kind = expect_kind(ext, ExtType::is_lifetime)?;
        let mut b = ext.body();
        need(b, 28)?;
        Ok(LifetimeExt {
            kind,
            allocations: b.get_u32_ne(),
            bytes: b.get_u64_ne(),
            addtime: b.get_u64_ne(),
            usetime: b.get_u64_ne(),
        })
    }

    fn encode(&self) -> Extension {
        let mut b = BytesMut::with_capacity(28);
        b.put_u32_ne(self.allocations);
        b.put_u64_ne(self.bytes);
        b.put_u64_ne(self.addtime);
        b.put_u64_ne(self.usetime);
        Extension::new(self.kind.to_u16(), b.to_vec())
    }
}

/// `sadb_address` with its embedded `sockaddr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressExt {
    /// Which address this is
    pub kind: ExtType,
    /// Upper-layer protocol, 0 for any
    pub proto: u8,
    /// Prefix length (inner addresses)
    pub prefixlen: u8,
    /// Address, port and IPv6 scope
    pub addr: SocketAddr,
}

const SOCKADDR_IN_LEN: usize = 16;
const SOCKADDR_IN6_LEN: usize = 28;

impl AddressExt {
    /// Host address with no protocol or prefix
    pub fn new(kind: ExtType, addr: SocketAddr) -> Self {
        let prefixlen = match addr {
            SocketAddr::V4(_) => 32,
            SocketAddr::V6(_) => 128,
        };
        AddressExt {
            kind,
            proto: 0,
            prefixlen,
            addr,
        }
    }
}

impl ExtBody for AddressExt {
    fn decode(ext: &Extension) -> Result<Self> {
        let kind = expect_kind(ext, ExtType::is_address)?;
        let mut b = ext.body();
        need(b, 4 + 2)?;
        let proto = b.get_u8();
        let prefixlen = b.get_u8();
        b.advance(2);
        let family = (&b[..2]).get_u16_ne();
        let addr = if family == af::INET {
            need(b, SOCKADDR_IN_LEN)?;
            b.advance(2);
            let port = b.get_u16();
            let mut octets = [0u8; 4];
            b.copy_to_slice(&mut octets);
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port))
        } else if family == af::INET6 {
            need(b, SOCKADDR_IN6_LEN)?;
            b.advance(2);
            let port = b.get_u16();
            let flowinfo = b.get_u32();
            let mut octets = [0u8; 16];
            b.copy_to_slice(&mut octets);
            let scope_id = b.get_u32_ne();
            SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            ))
        } else {
            return Err(Error::UnsupportedAddressFamily(family));
        };
        Ok(AddressExt {
            kind,
            proto,
            prefixlen,
            addr,
        })
    }

    fn encode(&self) -> Extension {
        let mut b = BytesMut::with_capacity(4 + SOCKADDR_IN6_LEN);
        b.put_u8(self.proto);
        b.put_u8(self.prefixlen);
        b.put_u16_ne(0);
        match self.addr {
            SocketAddr::V4(v4) => {
                b.put_u16_ne(af::INET);
                b.put_u16(v4.port());
                b.put_slice(&v4.ip().octets());
                b.put_bytes(0, 8);
            }
            SocketAddr::V6(v6) => {
                b.put_u16_ne(af::INET6);
                b.put_u16(v6.port());
                b.put_u32(v6.flowinfo());
                b.put_slice(&v6.ip().octets());
                b.put_u32_ne(v6.scope_id());
            }
        }
        Extension::new(self.kind.to_u16(), b.to_vec())
    }
}

/// `sadb_key`: authentication or encryption keying material
#[derive(Clone, PartialEq, Eq)]
pub struct KeyExt {
    /// Which key this is
    pub kind: ExtType,
    /// Key length in bits
    pub bits: u16,
    /// Key bytes, wiped on drop
    pub key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for KeyExt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExt")
            .field("kind", &self.kind)
            .field("bits", &self.bits)
            .finish_non_exhaustive()
    }
}

impl ExtBody for KeyExt {
    fn decode(ext: &Extension) -> Result<Self> {
        let kind = expect_kind(ext, ExtType::is_key)?;
        let mut b = ext.body();
        need(b, 4)?;
        let bits = b.get_u16_ne();
        b.advance(2);
        let len = (bits as usize + 7) / 8;
        need(b, len)?;
        Ok(KeyExt {
            kind,
            bits,
            key: Zeroizing::new(b[..len].to_vec()),
        })
    }

    fn encode(&self) -> Extension {
        let mut body = Vec::with_capacity(4 + self.key.len());
        body.extend_from_slice(&self.bits.to_ne_bytes());
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(&self.key);
        Extension::new(self.kind.to_u16(), body)
    }
}

/// `sadb_ident`: source or destination identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentExt {
    /// Which identity this is
    pub kind: ExtType,
    /// Identity type (`IdentType`)
    pub id_type: u16,
    /// Numeric id
    pub id: u64,
    /// String form, NUL-terminated on the wire
    pub value: String,
}

impl ExtBody for IdentExt {
    fn decode(ext: &Extension) -> Result<Self> {
        let kind = expect_kind(ext, |k| {
            matches!(k, ExtType::IdentitySrc | ExtType::IdentityDst)
        })?;
        let mut b = ext.body();
        need(b, 12)?;
        let id_type = b.get_u16_ne();
        b.advance(2);
        let id = b.get_u64_ne();
        let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
        let value = String::from_utf8(b[..end].to_vec())
            .map_err(|_| Error::InvalidMessage("identity is not UTF-8".into()))?;
        Ok(IdentExt {
            kind,
            id_type,
            id,
            value,
        })
    }

    fn encode(&self) -> Extension {
        let mut b = BytesMut::with_capacity(12 + self.value.len() + 1);
        b.put_u16_ne(self.id_type);
        b.put_u16_ne(0);
        b.put_u64_ne(self.id);
        b.put_slice(self.value.as_bytes());
        b.put_u8(0);
        Extension::new(self.kind.to_u16(), b.to_vec())
    }
}

/// `sadb_spirange`: SPI bounds for GETSPI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiRangeExt {
    /// Lowest acceptable SPI
    pub min: u32,
    /// Highest acceptable SPI
    pub max: u32,
}

impl ExtBody for SpiRangeExt {
    fn decode(ext: &Extension) -> Result<Self> {
        expect_kind(ext, |k| k == ExtType::SpiRange)?;
        let mut b = ext.body();
        need(b, 8)?;
        Ok(SpiRangeExt {
            min: b.get_u32_ne(),
            max: b.get_u32_ne(),
        })
    }

    fn encode(&self) -> Extension {
        let mut b = BytesMut::with_capacity(12);
        b.put_u32_ne(self.min);
        b.put_u32_ne(self.max);
        b.put_u32_ne(0);
        Extension::new(ExtType::SpiRange.to_u16(), b.to_vec())
    }
}

/// One `sadb_alg` entry of a REGISTER reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedAlg {
    /// Algorithm id
    pub id: u8,
    /// IV length
    pub ivlen: u8,
    /// Minimum key bits
    pub minbits: u16,
    /// Maximum key bits
    pub maxbits: u16,
    /// Key-size step in bits
    pub increment: u8,
    /// Salt bits
    pub saltbits: u8,
}

/// `sadb_supported`: algorithms the kernel offers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedExt {
    /// Auth or encrypt list
    pub kind: ExtType,
    /// Algorithms
    pub algs: Vec<SupportedAlg>,
}

impl ExtBody for SupportedExt {
    fn decode(ext: &Extension) -> Result<Self> {
        let kind = expect_kind(ext, |k| {
            matches!(k, ExtType::SupportedAuth | ExtType::SupportedEncrypt)
        })?;
        let mut b = ext.body();
        need(b, 4)?;
        b.advance(4);
        let mut algs = Vec::with_capacity(b.len() / 8);
        while b.len() >= 8 {
            algs.push(SupportedAlg {
                id: b.get_u8(),
                ivlen: b.get_u8(),
                minbits: b.get_u16_ne(),
                maxbits: b.get_u16_ne(),
                increment: b.get_u8(),
                saltbits: b.get_u8(),
            });
        }
        Ok(SupportedExt { kind, algs })
    }

    fn encode(&self) -> Extension {
        let mut b = BytesMut::with_capacity(4 + 8 * self.algs.len());
        b.put_u32_ne(0);
        for a in &self.algs {
            b.put_u8(a.id);
            b.put_u8(a.ivlen);
            b.put_u16_ne(a.minbits);
            b.put_u16_ne(a.maxbits);
            b.put_u8(a.increment);
            b.put_u8(a.saltbits);
        }
        Extension::new(self.kind.to_u16(), b.to_vec())
    }
}

/// `sadb_x_algdesc`: one algorithm inside an extended combination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgDesc {
    /// SA type the algorithm belongs to (`SaType`)
    pub satype: u8,
    /// Algorithm category (`AlgType`)
    pub algtype: u8,
    /// Algorithm id
    pub alg: u8,
    /// Minimum key bits
    pub minbits: u16,
    /// Maximum key bits
    pub maxbits: u16,
}

const ECOMB_LEN: usize = 64;
const ALGDESC_LEN: usize = 8;

/// `sadb_x_ecomb`: one acceptable combination of algorithms and lifetimes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ecomb {
    /// Combination flags
    pub flags: u16,
    /// Soft allocation limit
    pub soft_allocations: u32,
    /// Hard allocation limit
    pub hard_allocations: u32,
    /// Soft byte limit
    pub soft_bytes: u64,
    /// Hard byte limit
    pub hard_bytes: u64,
    /// Soft add-time limit (seconds)
    pub soft_addtime: u64,
    /// Hard add-time limit (seconds)
    pub hard_addtime: u64,
    /// Soft use-time limit (seconds)
    pub soft_usetime: u64,
    /// Hard use-time limit (seconds)
    pub hard_usetime: u64,
    /// Algorithms, AH and ESP mixed
    pub algs: Vec<AlgDesc>,
}

/// `sadb_prop` with extended combinations (`X_EPROP`)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EpropExt {
    /// Replay window size
    pub replay: u8,
    /// Combinations in preference order
    pub combs: Vec<Ecomb>,
}

impl ExtBody for EpropExt {
    fn decode(ext: &Extension) -> Result<Self> {
        expect_kind(ext, |k| k == ExtType::XEprop)?;
        let mut b = ext.body();
        need(b, 4)?;
        let replay = b.get_u8();
        b.advance(1);
        let numecombs = b.get_u16_ne() as usize;
        let mut combs = Vec::with_capacity(numecombs.min(b.len() / ECOMB_LEN));
        for _ in 0..numecombs {
            need(b, ECOMB_LEN)?;
            let numalgs = b.get_u8() as usize;
            b.advance(1);
            let flags = b.get_u16_ne();
            b.advance(4);
            let mut comb = Ecomb {
                flags,
                soft_allocations: b.get_u32_ne(),
                hard_allocations: b.get_u32_ne(),
                soft_bytes: b.get_u64_ne(),
                hard_bytes: b.get_u64_ne(),
                soft_addtime: b.get_u64_ne(),
                hard_addtime: b.get_u64_ne(),
                soft_usetime: b.get_u64_ne(),
                hard_usetime: b.get_u64_ne(),
                algs: Vec::with_capacity(numalgs),
            };
            need(b, numalgs * ALGDESC_LEN)?;
            for _ in 0..numalgs {
                let satype = b.get_u8();
                let algtype = b.get_u8();
                let alg = b.get_u8();
                b.advance(1);
                comb.algs.push(AlgDesc {
                    satype,
                    algtype,
                    alg,
                    minbits: b.get_u16_ne(),
                    maxbits: b.get_u16_ne(),
                });
            }
            combs.push(comb);
        }
        Ok(EpropExt { replay, combs })
    }

    fn encode(&self) -> Extension {
        let algs: usize = self.combs.iter().map(|c| c.algs.len()).sum();
        let mut b = BytesMut::with_capacity(4 + self.combs.len() * ECOMB_LEN + algs * ALGDESC_LEN);
        b.put_u8(self.replay);
        b.put_u8(0);
        b.put_u16_ne(self.combs.len() as u16);
        for c in &self.combs {
            b.put_u8(c.algs.len() as u8);
            b.put_u8(0);
            b.put_u16_ne(c.flags);
            b.put_u32_ne(0);
            b.put_u32_ne(c.soft_allocations);
            b.put_u32_ne(c.hard_allocations);
            b.put_u64_ne(c.soft_bytes);
            b.put_u64_ne(c.hard_bytes);
            b.put_u64_ne(c.soft_addtime);
            b.put_u64_ne(c.hard_addtime);
            b.put_u64_ne(c.soft_usetime);
            b.put_u64_ne(c.hard_usetime);
            for a in &c.algs {
                b.put_u8(a.satype);
                b.put_u8(a.algtype);
                b.put_u8(a.alg);
                b.put_u8(0);
                b.put_u16_ne(a.minbits);
                b.put_u16_ne(a.maxbits);
            }
        }
        Extension::new(ExtType::XEprop.to_u16(), b.to_vec())
    }
}

/// `sadb_x_kmc`: key-manager cookie naming the rule behind an SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmCookieExt {
    /// Key-management protocol
    pub proto: u32,
    /// Cookie value
    pub cookie: u32,
}

/// Key-management protocol number for IKEv1
pub const KMP_IKE: u32 = 1;

impl ExtBody for KmCookieExt {
    fn decode(ext: &Extension) -> Result<Self> {
        expect_kind(ext, |k| k == ExtType::XKmCookie)?;
        let mut b = ext.body();
        need(b, 8)?;
        Ok(KmCookieExt {
            proto: b.get_u32_ne(),
            cookie: b.get_u32_ne(),
        })
    }

    fn encode(&self) -> Extension {
        let mut b = BytesMut::with_capacity(12);
        b.put_u32_ne(self.proto);
        b.put_u32_ne(self.cookie);
        b.put_u32_ne(0);
        Extension::new(ExtType::XKmCookie.to_u16(), b.to_vec())
    }
}

/// `sadb_x_pair`: SPI of the other half of an SA pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairExt {
    /// Paired SPI
    pub spi: u32,
}

impl ExtBody for PairExt {
    fn decode(ext: &Extension) -> Result<Self> {
        expect_kind(ext, |k| k == ExtType::XPair)?;
        let mut b = ext.body();
        need(b, 4)?;
        Ok(PairExt { spi: b.get_u32() })
    }

    fn encode(&self) -> Extension {
        Extension::new(ExtType::XPair.to_u16(), self.spi.to_be_bytes().to_vec())
    }
}

/// `sadb_x_replay_ctr`: replay counter snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayValueExt {
    /// 32-bit replay counter
    pub replay: u32,
    /// 64-bit replay counter
    pub counter: u64,
}

impl ExtBody for ReplayValueExt {
    fn decode(ext: &Extension) -> Result<Self> {
        expect_kind(ext, |k| k == ExtType::XReplayValue)?;
        let mut b = ext.body();
        need(b, 12)?;
        Ok(ReplayValueExt {
            replay: b.get_u32_ne(),
            counter: b.get_u64_ne(),
        })
    }

    fn encode(&self) -> Extension {
        let mut b = BytesMut::with_capacity(12);
        b.put_u32_ne(self.replay);
        b.put_u64_ne(self.counter);
        Extension::new(ExtType::XReplayValue.to_u16(), b.to_vec())
    }
}

/// A complete PF_KEY message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Protocol version, always `PF_KEY_V2` on output
    pub version: u8,
    /// Message type (raw, see [`MsgType`])
    pub msg_type: u8,
    /// errno reported by the kernel, or set on a negative ACQUIRE
    pub errno: u8,
    /// SA type (raw, see [`SaType`])
    pub satype: u8,
    /// Kernel diagnostic
    pub diagnostic: u16,
    /// Sequence number
    pub seq: u32,
    /// Sender pid, 0 for kernel-originated messages
    pub pid: u32,
    exts: Vec<Extension>,
}

impl Message {
    /// Empty message of the given type
    pub fn new(msg_type: MsgType, satype: SaType) -> Self {
        Message {
            version: PF_KEY_V2,
            msg_type: msg_type.to_u8(),
            errno: 0,
            satype: satype.to_u8(),
            diagnostic: 0,
            seq: 0,
            pid: 0,
            exts: Vec::new(),
        }
    }

    /// Typed message type
    pub fn kind(&self) -> Option<MsgType> {
        MsgType::from_u8(self.msg_type)
    }

    /// Typed SA type
    pub fn sa_type(&self) -> Option<SaType> {
        SaType::from_u8(self.satype)
    }

    /// Set the sequence number
    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    /// Set the sender pid
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Append a typed extension
    pub fn with<T: ExtBody>(mut self, body: T) -> Self {
        self.push(body.encode());
        self
    }

    /// Append a raw extension, replacing any extension of the same type
    pub fn push(&mut self, ext: Extension) {
        self.exts.retain(|e| e.ext_type != ext.ext_type);
        self.exts.push(ext);
    }

    /// Remove an extension
    pub fn remove(&mut self, kind: ExtType) -> Option<Extension> {
        let pos = self.exts.iter().position(|e| e.ext_type == kind.to_u16())?;
        Some(self.exts.remove(pos))
    }

    /// Keep only the extensions matching `f`
    pub fn retain(&mut self, f: impl FnMut(&Extension) -> bool) {
        self.exts.retain(f);
    }

    /// Extensions in wire order
    pub fn extensions(&self) -> &[Extension] {
        &self.exts
    }

    /// Raw extension of the given type
    pub fn ext(&self, kind: ExtType) -> Option<&Extension> {
        self.exts.iter().find(|e| e.ext_type == kind.to_u16())
    }

    /// Whether an extension of the given type is present
    pub fn has(&self, kind: ExtType) -> bool {
        self.ext(kind).is_some()
    }

    /// Typed extension of the given type
    ///
    /// Bodies were validated when the message was parsed or built, so a
    /// present extension decodes.
    pub fn get<T: ExtBody>(&self, kind: ExtType) -> Option<T> {
        self.ext(kind).and_then(|e| T::decode(e).ok())
    }

    /// Typed extension that must be present
    pub fn require<T: ExtBody>(&self, kind: ExtType) -> Result<T> {
        let ext = self
            .ext(kind)
            .ok_or(Error::MissingExtension(kind.to_u16()))?;
        T::decode(ext)
    }

    /// Association extension
    pub fn sa(&self) -> Option<SaExt> {
        self.get(ExtType::Sa)
    }

    /// Address extension
    pub fn address(&self, kind: ExtType) -> Option<SocketAddr> {
        self.get::<AddressExt>(kind).map(|a| a.addr)
    }

    /// Lifetime extension
    pub fn lifetime(&self, kind: ExtType) -> Option<LifetimeExt> {
        self.get(kind)
    }

    /// Key-manager cookie, with the kernel's "no cookie" value 0 folded to `None`
    pub fn km_cookie(&self) -> Option<u32> {
        self.get::<KmCookieExt>(ExtType::XKmCookie)
            .map(|k| k.cookie)
            .filter(|&c| c != 0)
    }

    /// Copy of the header alone
    pub fn header_only(&self) -> Message {
        Message {
            exts: Vec::new(),
            ..self.clone()
        }
    }

    /// Encoded length in bytes
    pub fn wire_len(&self) -> usize {
        MSG_HEADER_LEN + self.exts.iter().map(Extension::wire_len).sum::<usize>()
    }

    /// Serialize to wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.wire_len();
        let mut b = BytesMut::with_capacity(len);
        b.put_u8(self.version);
        b.put_u8(self.msg_type);
        b.put_u8(self.errno);
        b.put_u8(self.satype);
        b.put_u16_ne(bytes_to_words(len) as u16);
        b.put_u16_ne(self.diagnostic);
        b.put_u32_ne(self.seq);
        b.put_u32_ne(self.pid);
        for ext in &self.exts {
            b.put_u16_ne(bytes_to_words(ext.wire_len()) as u16);
            b.put_u16_ne(ext.ext_type);
            b.put_slice(&ext.body);
        }
        b.to_vec()
    }

    /// Parse from wire format
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MSG_HEADER_LEN {
            return Err(Error::BufferTooShort {
                required: MSG_HEADER_LEN,
                available: data.len(),
            });
        }
        if data.len() > MAX_MSG_LEN {
            return Err(Error::InvalidMessage(format!(
                "message of {} bytes exceeds the PF_KEY maximum",
                data.len()
            )));
        }

        let mut h = &data[..MSG_HEADER_LEN];
        let version = h.get_u8();
        if version != PF_KEY_V2 {
            return Err(Error::InvalidMessage(format!(
                "unsupported PF_KEY version {}",
                version
            )));
        }
        let msg_type = h.get_u8();
        let errno = h.get_u8();
        let satype = h.get_u8();
        let declared = h.get_u16_ne() as usize * ALIGN;
        let diagnostic = h.get_u16_ne();
        let seq = h.get_u32_ne();
        let pid = h.get_u32_ne();

        if declared < MSG_HEADER_LEN || declared != data.len() {
            return Err(Error::InvalidMessage(format!(
                "declared length {} does not match {} received bytes",
                declared,
                data.len()
            )));
        }

        let mut exts: Vec<Extension> = Vec::new();
        let mut seen = [false; EXT_MAX as usize + 1];
        let mut off = MSG_HEADER_LEN;
        while off < declared {
            let mut eh = &data[off..];
            if eh.len() < EXT_HEADER_LEN {
                return Err(Error::BufferTooShort {
                    required: EXT_HEADER_LEN,
                    available: eh.len(),
                });
            }
            let words = eh.get_u16_ne() as usize;
            let ext_type = eh.get_u16_ne();
            let ext_len = words * ALIGN;
            if ext_len == 0 {
                return Err(Error::InvalidMessage(format!(
                    "zero-length extension {} at offset {}",
                    ext_type, off
                )));
            }
            if off + ext_len > declared {
                return Err(Error::InvalidMessage(format!(
                    "extension {} overruns message ({} > {})",
                    ext_type,
                    off + ext_len,
                    declared
                )));
            }
            if ext_type == 0 || ext_type > EXT_MAX {
                return Err(Error::InvalidMessage(format!(
                    "unknown extension type {}",
                    ext_type
                )));
            }
            if seen[ext_type as usize] {
                return Err(Error::DuplicateExtension(ext_type));
            }
            seen[ext_type as usize] = true;

            let ext = Extension {
                ext_type,
                body: data[off + EXT_HEADER_LEN..off + ext_len].to_vec(),
            };
            ext.check()?;
            exts.push(ext);
            off += ext_len;
        }

        Ok(Message {
            version,
            msg_type,
            errno,
            satype,
            diagnostic,
            seq,
            pid,
            exts,
        })
    }
}

/// Source and destination as a pair, the common case for SA messages
pub fn endpoints(msg: &Message) -> Result<(SocketAddr, SocketAddr)> {
    let src = msg.require::<AddressExt>(ExtType::AddressSrc)?.addr;
    let dst = msg.require::<AddressExt>(ExtType::AddressDst)?.addr;
    Ok((src, dst))
}

/// Whether two addresses are in the same family
pub fn same_family(a: &IpAddr, b: &IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pfkey::constants::{aalg, ealg, saflags, AlgType};

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn sample_acquire() -> Message {
        Message::new(MsgType::Acquire, SaType::Unspec)
            .with_seq(42)
            .with(AddressExt::new(ExtType::AddressSrc, v4("10.0.0.5:0")))
            .with(AddressExt::new(ExtType::AddressDst, v4("192.0.2.1:0")))
            .with(EpropExt {
                replay: 32,
                combs: vec![Ecomb {
                    hard_addtime: 3600,
                    soft_addtime: 3000,
                    algs: vec![
                        AlgDesc {
                            satype: SaType::Esp.to_u8(),
                            algtype: AlgType::Crypt.to_u8(),
                            alg: ealg::AES_CBC,
                            minbits: 128,
                            maxbits: 256,
                        },
                        AlgDesc {
                            satype: SaType::Esp.to_u8(),
                            algtype: AlgType::Auth.to_u8(),
                            alg: aalg::SHA256_HMAC,
                            minbits: 256,
                            maxbits: 256,
                        },
                    ],
                    ..Ecomb::default()
                }],
            })
    }

    #[test]
    fn test_header_layout() {
        let msg = Message::new(MsgType::Flush, SaType::Unspec)
            .with_seq(7)
            .with_pid(99);
        let wire = msg.to_bytes();
        assert_eq!(wire.len(), 16);
        assert_eq!(wire[0], PF_KEY_V2);
        assert_eq!(wire[1], 9);
        assert_eq!(u16::from_ne_bytes([wire[4], wire[5]]), 2);
        assert_eq!(u32::from_ne_bytes([wire[8], wire[9], wire[10], wire[11]]), 7);
    }

    #[test]
    fn test_acquire_wire_exact() {
        let msg = sample_acquire();
        let wire = msg.to_bytes();
        assert_eq!(wire.len() % 8, 0);
        let parsed = Message::from_bytes(&wire).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.to_bytes(), wire);

        let eprop: EpropExt = parsed.require(ExtType::XEprop).unwrap();
        assert_eq!(eprop.combs[0].algs.len(), 2);
        assert_eq!(eprop.combs[0].hard_addtime, 3600);
    }

    #[test]
    fn test_opaque_extension_preserved() {
        let mut msg = Message::new(MsgType::Expire, SaType::Esp);
        msg.push(Extension::new(ExtType::Sensitivity.to_u16(), vec![1, 2, 3, 4, 5]));
        let wire = msg.to_bytes();
        let parsed = Message::from_bytes(&wire).unwrap();
        assert_eq!(parsed.to_bytes(), wire);
        assert_eq!(parsed.ext(ExtType::Sensitivity).unwrap().body().len(), 12);
    }

    #[test]
    fn test_ipv6_scope_preserved() {
        let addr = SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), 500, 0, 3));
        let msg = Message::new(MsgType::Add, SaType::Esp)
            .with(AddressExt::new(ExtType::AddressDst, addr));
        let parsed = Message::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.address(ExtType::AddressDst), Some(addr));
    }

    #[test]
    fn test_sa_spi_network_order() {
        let sa = SaExt {
            spi: 0x1234_5678,
            flags: saflags::INBOUND,
            ..SaExt::default()
        };
        let ext = sa.encode();
        assert_eq!(&ext.body()[..4], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(SaExt::decode(&ext).unwrap(), sa);
    }

    #[test]
    fn test_reject_short_header() {
        let err = Message::from_bytes(&[2, 3, 0]).unwrap_err();
        assert!(matches!(err, Error::BufferTooShort { required: 16, .. }));
    }

    #[test]
    fn test_reject_length_mismatch() {
        let mut wire = sample_acquire().to_bytes();
        wire.truncate(wire.len() - 8);
        assert!(matches!(
            Message::from_bytes(&wire),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_reject_extension_overrun() {
        let msg = Message::new(MsgType::Delete, SaType::Esp).with(SaExt::default());
        let mut wire = msg.to_bytes();
        // Claim the SA extension is 4 words long inside a 4-word message
        wire[16..18].copy_from_slice(&4u16.to_ne_bytes());
        assert!(matches!(
            Message::from_bytes(&wire),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_reject_zero_length_extension() {
        let msg = Message::new(MsgType::Delete, SaType::Esp).with(SaExt::default());
        let mut wire = msg.to_bytes();
        wire[16..18].copy_from_slice(&0u16.to_ne_bytes());
        assert!(Message::from_bytes(&wire).is_err());
    }

    #[test]
    fn test_reject_duplicate_extension() {
        let sa = SaExt::default().encode();
        let mut wire = Message::new(MsgType::Delete, SaType::Esp)
            .with(SaExt::default())
            .to_bytes();
        wire.extend_from_slice(&2u16.to_ne_bytes());
        wire.extend_from_slice(&1u16.to_ne_bytes());
        wire.extend_from_slice(sa.body());
        let words = (wire.len() / 8) as u16;
        wire[4..6].copy_from_slice(&words.to_ne_bytes());
        assert_eq!(
            Message::from_bytes(&wire),
            Err(Error::DuplicateExtension(1))
        );
    }

    #[test]
    fn test_reject_truncated_eprop() {
        let mut eprop = sample_acquire()
            .ext(ExtType::XEprop)
            .unwrap()
            .body()
            .to_vec();
        // Claim three combinations while carrying one
        eprop[2..4].copy_from_slice(&3u16.to_ne_bytes());
        let mut msg = Message::new(MsgType::Acquire, SaType::Unspec);
        msg.push(Extension::new(ExtType::XEprop.to_u16(), eprop));
        assert!(matches!(
            Message::from_bytes(&msg.to_bytes()),
            Err(Error::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_reject_unknown_family() {
        let mut ext = AddressExt::new(ExtType::AddressSrc, v4("10.0.0.1:0"))
            .encode()
            .body()
            .to_vec();
        ext[4..6].copy_from_slice(&99u16.to_ne_bytes());
        let mut msg = Message::new(MsgType::Acquire, SaType::Esp);
        msg.push(Extension::new(ExtType::AddressSrc.to_u16(), ext));
        assert_eq!(
            Message::from_bytes(&msg.to_bytes()),
            Err(Error::UnsupportedAddressFamily(99))
        );
    }

    #[test]
    fn test_key_extension_redacted() {
        let key = KeyExt {
            kind: ExtType::KeyEncrypt,
            bits: 128,
            key: Zeroizing::new(vec![0xAA; 16]),
        };
        let ext = key.encode();
        assert_eq!(ext.wire_len(), 24);
        assert!(!format!("{:?}", ext).contains("aaaa"));
        assert_eq!(KeyExt::decode(&ext).unwrap().key.as_slice(), &[0xAA; 16]);
    }

    #[test]
    fn test_identity_and_cookie() {
        let msg = Message::new(MsgType::Acquire, SaType::Esp)
            .with(IdentExt {
                kind: ExtType::IdentitySrc,
                id_type: 2,
                id: 0,
                value: "gw.example.com".into(),
            })
            .with(KmCookieExt {
                proto: KMP_IKE,
                cookie: 7,
            });
        let parsed = Message::from_bytes(&msg.to_bytes()).unwrap();
        let id: IdentExt = parsed.require(ExtType::IdentitySrc).unwrap();
        assert_eq!(id.value, "gw.example.com");
        assert_eq!(parsed.km_cookie(), Some(7));

        let zero = Message::new(MsgType::Acquire, SaType::Esp).with(KmCookieExt {
            proto: KMP_IKE,
            cookie: 0,
        });
        assert_eq!(zero.km_cookie(), None);
    }

    #[test]
    fn test_push_replaces_same_type() {
        let mut msg = Message::new(MsgType::Update, SaType::Esp);
        msg.push(SaExt { spi: 1, ..SaExt::default() }.encode());
        msg.push(SaExt { spi: 2, ..SaExt::default() }.encode());
        assert_eq!(msg.extensions().len(), 1);
        assert_eq!(msg.sa().unwrap().spi, 2);
    }
}
