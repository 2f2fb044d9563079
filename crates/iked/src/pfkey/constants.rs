//! PF_KEY v2 constants (RFC 2367 plus the vendor `X_` extensions)

/// PF_KEY protocol version carried in every header
pub const PF_KEY_V2: u8 = 2;

/// Size of `sadb_msg`, the fixed message header
pub const MSG_HEADER_LEN: usize = 16;

/// Size of `sadb_ext`, the common extension header
pub const EXT_HEADER_LEN: usize = 4;

/// Message and extension lengths are counted in 64-bit words
pub const ALIGN: usize = 8;

/// Largest message the kernel will accept (`u16::MAX` words)
pub const MAX_MSG_LEN: usize = u16::MAX as usize * ALIGN;

/// Bytes to 64-bit words, rounding up
pub fn bytes_to_words(len: usize) -> usize {
    (len + ALIGN - 1) / ALIGN
}

/// Round a byte length up to the next 64-bit boundary
pub fn pad8(len: usize) -> usize {
    bytes_to_words(len) * ALIGN
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident: $repr:ident, $from:ident, $to:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($repr)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )+
        }

        impl $name {
            /// Convert from the wire value
            pub fn $from(value: $repr) -> Option<Self> {
                match value {
                    $( $value => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Convert to the wire value
            pub fn $to(self) -> $repr {
                self as $repr
            }
        }
    };
}

wire_enum! {
    /// Message types (`sadb_msg_type`)
    MsgType: u8, from_u8, to_u8 {
        /// Reserved (0)
        Reserved = 0,
        /// Allocate an SPI (1)
        GetSpi = 1,
        /// Complete a larval SA (2)
        Update = 2,
        /// Add a complete SA (3)
        Add = 3,
        /// Delete an SA (4)
        Delete = 4,
        /// Query an SA (5)
        Get = 5,
        /// Kernel needs keys for outbound traffic (6)
        Acquire = 6,
        /// Register a key manager (7)
        Register = 7,
        /// SA lifetime reached (8)
        Expire = 8,
        /// Flush SAs (9)
        Flush = 9,
        /// Dump SAs (10)
        Dump = 10,
        /// Promiscuous listener (11)
        XPromisc = 11,
        /// Ask the kernel which policy covers given traffic (12)
        XInverseAcquire = 12,
        /// Update an SA and its pair (13)
        XUpdatePair = 13,
        /// Delete an SA and its pair (14)
        XDelPair = 14,
    }
}

wire_enum! {
    /// Security association types (`sadb_msg_satype`)
    SaType: u8, from_u8, to_u8 {
        /// Unspecified, used by FLUSH and extended ACQUIRE (0)
        Unspec = 0,
        /// Authentication Header (2)
        Ah = 2,
        /// Encapsulating Security Payload (3)
        Esp = 3,
    }
}

wire_enum! {
    /// Extension types (`sadb_ext_type`)
    ExtType: u16, from_u16, to_u16 {
        /// Association (1)
        Sa = 1,
        /// Current lifetime (2)
        LifetimeCurrent = 2,
        /// Hard lifetime (3)
        LifetimeHard = 3,
        /// Soft lifetime (4)
        LifetimeSoft = 4,
        /// Source address (5)
        AddressSrc = 5,
        /// Destination address (6)
        AddressDst = 6,
        /// Inner (tunnel) source address (7)
        InnerSrc = 7,
        /// Authentication key (8)
        KeyAuth = 8,
        /// Encryption key (9)
        KeyEncrypt = 9,
        /// Source identity (10)
        IdentitySrc = 10,
        /// Destination identity (11)
        IdentityDst = 11,
        /// Sensitivity label (12)
        Sensitivity = 12,
        /// Traditional proposal (13)
        Proposal = 13,
        /// Supported authentication algorithms (14)
        SupportedAuth = 14,
        /// Supported encryption algorithms (15)
        SupportedEncrypt = 15,
        /// SPI range (16)
        SpiRange = 16,
        /// Extended registration (17)
        XEreg = 17,
        /// Extended proposal (18)
        XEprop = 18,
        /// Key-manager cookie (19)
        XKmCookie = 19,
        /// NAT-T local address (20)
        NattLoc = 20,
        /// NAT-T remote address (21)
        NattRem = 21,
        /// Inner (tunnel) destination address (22)
        InnerDst = 22,
        /// Paired SA (23)
        XPair = 23,
        /// Replay value (24)
        XReplayValue = 24,
        /// Extended dump (25)
        XEdump = 25,
        /// Idle lifetime (26)
        XLifetimeIdle = 26,
        /// Outer sensitivity label (27)
        XOuterSens = 27,
    }
}

/// Highest extension type this codec knows
pub const EXT_MAX: u16 = 27;

impl ExtType {
    /// Extensions that carry keying material
    pub fn is_key(self) -> bool {
        matches!(self, ExtType::KeyAuth | ExtType::KeyEncrypt)
    }

    /// Extensions whose body is an `sadb_address`
    pub fn is_address(self) -> bool {
        matches!(
            self,
            ExtType::AddressSrc
                | ExtType::AddressDst
                | ExtType::InnerSrc
                | ExtType::InnerDst
                | ExtType::NattLoc
                | ExtType::NattRem
        )
    }

    /// Extensions whose body is an `sadb_lifetime`
    pub fn is_lifetime(self) -> bool {
        matches!(
            self,
            ExtType::LifetimeCurrent
                | ExtType::LifetimeHard
                | ExtType::LifetimeSoft
                | ExtType::XLifetimeIdle
        )
    }
}

wire_enum! {
    /// Identity types (`sadb_ident_type`)
    IdentType: u16, from_u16, to_u16 {
        /// Reserved (0)
        Reserved = 0,
        /// Address prefix (1)
        Prefix = 1,
        /// Fully-qualified domain name (2)
        Fqdn = 2,
        /// user@fqdn (3)
        UserFqdn = 3,
        /// DER-encoded distinguished name (4)
        DerDn = 4,
        /// DER-encoded general name (5)
        DerGn = 5,
        /// Key id (6)
        KeyId = 6,
        /// Address range (7)
        AddrRange = 7,
    }
}

wire_enum! {
    /// Algorithm categories inside an extended proposal
    AlgType: u8, from_u8, to_u8 {
        /// Authentication / integrity (1)
        Auth = 1,
        /// Encryption (2)
        Crypt = 2,
        /// Compression (3)
        Compress = 3,
    }
}

/// Encryption algorithm ids
pub mod ealg {
    /// No encryption
    pub const NONE: u8 = 0;
    /// DES-CBC
    pub const DES_CBC: u8 = 2;
    /// 3DES-CBC
    pub const DES_3CBC: u8 = 3;
    /// Blowfish
    pub const BLOWFISH: u8 = 7;
    /// NULL encryption
    pub const NULL: u8 = 11;
    /// AES-CBC
    pub const AES_CBC: u8 = 12;
    /// AES-CCM (16-byte ICV)
    pub const AES_CCM_16: u8 = 16;
    /// AES-GCM (16-byte ICV)
    pub const AES_GCM_16: u8 = 20;
}

/// Authentication algorithm ids
pub mod aalg {
    /// No authentication
    pub const NONE: u8 = 0;
    /// HMAC-MD5
    pub const MD5_HMAC: u8 = 2;
    /// HMAC-SHA1
    pub const SHA1_HMAC: u8 = 3;
    /// HMAC-SHA256
    pub const SHA256_HMAC: u8 = 5;
    /// HMAC-SHA384
    pub const SHA384_HMAC: u8 = 6;
    /// HMAC-SHA512
    pub const SHA512_HMAC: u8 = 7;
}

/// SA flags (`sadb_sa_flags`)
pub mod saflags {
    /// SA has carried traffic
    pub const USED: u32 = 0x0080_0000;
    /// SA is one half of a pair
    pub const PAIRED: u32 = 0x0200_0000;
    /// SA is outbound
    pub const OUTBOUND: u32 = 0x0400_0000;
    /// SA is inbound
    pub const INBOUND: u32 = 0x0800_0000;
    /// Local end is behind a NAT
    pub const NATT_LOC: u32 = 0x0000_0010;
    /// Remote end is behind a NAT
    pub const NATT_REM: u32 = 0x0000_0020;
    /// This node is the one behind the NAT
    pub const NATTED: u32 = 0x0000_1000;
}

/// SA states (`sadb_sa_state`)
pub mod sastate {
    /// Larval: SPI reserved, no keys
    pub const LARVAL: u8 = 0;
    /// Mature, usable
    pub const MATURE: u8 = 1;
    /// Soft lifetime reached
    pub const DYING: u8 = 2;
    /// Hard lifetime reached
    pub const DEAD: u8 = 3;
    /// Idle lifetime reached
    pub const IDLE: u8 = 4;
}

wire_enum! {
    /// Kernel diagnostic codes (`sadb_x_msg_diagnostic`)
    Diagnostic: u16, from_u16, to_u16 {
        /// No diagnostic
        None = 0,
        /// Unknown message type
        UnknownMsg = 1,
        /// Unknown extension type
        UnknownExt = 2,
        /// Bad extension length
        BadExtLen = 3,
        /// Unknown SA type
        UnknownSatype = 4,
        /// SA type needed
        SatypeNeeded = 5,
        /// No SA databases for SA type
        NoSadbs = 6,
        /// No extensions
        NoExt = 7,
        /// Bad source address family
        BadSrcAf = 8,
        /// Bad destination address family
        BadDstAf = 9,
        /// Bad inner source address family
        BadInnerSrcAf = 10,
        /// Address family mismatch
        AfMismatch = 11,
        /// Bad source address
        BadSrc = 12,
        /// Bad destination address
        BadDst = 13,
        /// Soft allocations exceed hard
        AllocHsErr = 14,
        /// Soft bytes exceed hard
        BytesHsErr = 15,
        /// Soft add time exceeds hard
        AddtimeHsErr = 16,
        /// Soft use time exceeds hard
        UsetimeHsErr = 17,
        /// Missing source address
        MissingSrc = 18,
        /// Missing destination address
        MissingDst = 19,
        /// Missing association
        MissingSa = 20,
        /// Missing encryption key
        MissingEkey = 21,
        /// Missing authentication key
        MissingAkey = 22,
        /// Missing SPI range
        MissingRange = 23,
        /// Duplicate source address
        DuplicateSrc = 24,
        /// Duplicate destination address
        DuplicateDst = 25,
        /// Duplicate association
        DuplicateSa = 26,
        /// Duplicate encryption key
        DuplicateEkey = 27,
        /// Duplicate authentication key
        DuplicateAkey = 28,
        /// Duplicate SPI range
        DuplicateRange = 29,
        /// Malformed source address
        MalformedSrc = 30,
        /// Malformed destination address
        MalformedDst = 31,
        /// Malformed association
        MalformedSa = 32,
        /// Malformed encryption key
        MalformedEkey = 33,
        /// Malformed authentication key
        MalformedAkey = 34,
        /// Malformed SPI range
        MalformedRange = 35,
        /// Authentication key present where not allowed
        AkeyPresent = 36,
        /// Encryption key present where not allowed
        EkeyPresent = 37,
        /// Proposal present where not allowed
        PropPresent = 38,
        /// Supported list present where not allowed
        SuppPresent = 39,
        /// Bad authentication algorithm
        BadAalg = 40,
        /// Bad encryption algorithm
        BadEalg = 41,
        /// Bad SA flags
        BadSaflags = 42,
        /// Bad SA state
        BadSastate = 43,
        /// Bad authentication key length
        BadAkeybits = 44,
        /// Bad encryption key length
        BadEkeybits = 45,
        /// Encryption not supported
        EncrNotsupp = 46,
        /// Weak encryption key
        WeakEkey = 47,
        /// Weak authentication key
        WeakAkey = 48,
        /// Duplicate key-management protocol
        DuplicateKmp = 49,
        /// Duplicate key-management cookie
        DuplicateKmc = 50,
        /// Missing NAT-T local address
        MissingNattLoc = 51,
        /// Missing NAT-T remote address
        MissingNattRem = 52,
        /// Duplicate NAT-T local address
        DuplicateNattLoc = 53,
        /// Duplicate NAT-T remote address
        DuplicateNattRem = 54,
        /// Malformed NAT-T local address
        MalformedNattLoc = 55,
        /// Malformed NAT-T remote address
        MalformedNattRem = 56,
        /// Duplicate NAT-T ports
        DuplicateNattPorts = 57,
        /// Missing inner source address
        MissingInnerSrc = 58,
        /// Missing inner destination address
        MissingInnerDst = 59,
        /// Duplicate inner source address
        DuplicateInnerSrc = 60,
        /// Duplicate inner destination address
        DuplicateInnerDst = 61,
        /// Malformed inner source address
        MalformedInnerSrc = 62,
        /// Malformed inner destination address
        MalformedInnerDst = 63,
        /// Bad inner source prefix
        PrefixInnerSrc = 64,
        /// Bad inner destination prefix
        PrefixInnerDst = 65,
        /// Bad inner destination address family
        BadInnerDstAf = 66,
        /// Inner address family mismatch
        InnerAfMismatch = 67,
        /// Bad NAT-T remote address family
        BadNattRemAf = 68,
        /// Bad NAT-T local address family
        BadNattLocAf = 69,
        /// Protocol mismatch
        ProtoMismatch = 70,
        /// Inner protocol mismatch
        InnerProtoMismatch = 71,
        /// Both port sets given
        DualPortSets = 72,
        /// Pairing not appropriate
        PairInappropriate = 73,
        /// Pair add mismatch
        PairAddMismatch = 74,
        /// Already paired
        PairAlready = 75,
        /// Pair SA not found
        PairSaNotfound = 76,
        /// Bad SA direction
        BadSaDirection = 77,
        /// SA not found
        SaNotfound = 78,
        /// SA expired
        SaExpired = 79,
        /// Bad security context
        BadCtx = 80,
        /// Invalid replay value
        InvalidReplay = 81,
        /// Missing lifetime
        MissingLifetime = 82,
    }
}

/// errno values that steer kernel reply handling
pub mod errno {
    /// Operation not permitted
    pub const EPERM: u8 = libc::EPERM as u8;
    /// No such entry
    pub const ENOENT: u8 = libc::ENOENT as u8;
    /// No such SA
    pub const ESRCH: u8 = libc::ESRCH as u8;
    /// Out of memory
    pub const ENOMEM: u8 = libc::ENOMEM as u8;
    /// Already exists
    pub const EEXIST: u8 = libc::EEXIST as u8;
    /// Invalid argument
    pub const EINVAL: u8 = libc::EINVAL as u8;
    /// Operation not supported
    pub const EOPNOTSUPP: u8 = libc::EOPNOTSUPP as u8;
    /// Address family not supported
    pub const EAFNOSUPPORT: u8 = libc::EAFNOSUPPORT as u8;
    /// Network unreachable
    pub const ENETUNREACH: u8 = libc::ENETUNREACH as u8;
    /// Timed out
    pub const ETIMEDOUT: u8 = libc::ETIMEDOUT as u8;
    /// Host unreachable
    pub const EHOSTUNREACH: u8 = libc::EHOSTUNREACH as u8;
}

/// Address families as they appear in `sockaddr`
pub mod af {
    /// IPv4
    pub const INET: u16 = libc::AF_INET as u16;
    /// IPv6
    pub const INET6: u16 = libc::AF_INET6 as u16;
}
