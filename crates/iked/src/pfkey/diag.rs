//! Kernel error classification
//!
//! Every PF_KEY reply carrying a non-zero errno is sorted into one of four
//! classes. The table is keyed by the kernel diagnostic first; the errno only
//! decides when the diagnostic is zero. Unknown diagnostics are fatal.

use super::constants::{errno, Diagnostic, MsgType, SaType};
use super::message::Message;

/// What to do about a kernel error reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Log and carry on
    Ignorable,
    /// Convert the failed ADD/UPDATE into a DELETE and tell the peer
    Resync,
    /// Fatal in debug builds, ignorable in release builds
    DebugFatal,
    /// The daemon must exit
    Fatal,
}

impl ErrorClass {
    /// Whether this class stops the daemon in the current build
    pub fn stops_daemon(self) -> bool {
        match self {
            ErrorClass::Fatal => true,
            ErrorClass::DebugFatal => cfg!(debug_assertions),
            ErrorClass::Ignorable | ErrorClass::Resync => false,
        }
    }
}

/// Classify an error reply
pub fn classify_error(reply: &Message) -> ErrorClass {
    classify(
        reply.errno,
        reply.diagnostic,
        reply.kind(),
        reply.sa_type(),
    )
}

/// Classify an errno/diagnostic pair for a reply of the given type
pub fn classify(
    err: u8,
    diagnostic: u16,
    msg_type: Option<MsgType>,
    satype: Option<SaType>,
) -> ErrorClass {
    use Diagnostic as D;

    let installs = matches!(msg_type, Some(MsgType::Add) | Some(MsgType::Update));

    if diagnostic == 0 {
        return match err {
            e if e == errno::EOPNOTSUPP => ErrorClass::Ignorable,
            e if e == errno::EHOSTUNREACH && installs => ErrorClass::Resync,
            e if e == errno::EEXIST
                && matches!(msg_type, Some(MsgType::Add) | Some(MsgType::GetSpi)) =>
            {
                ErrorClass::Ignorable
            }
            _ => ErrorClass::Fatal,
        };
    }

    let Some(diag) = Diagnostic::from_u16(diagnostic) else {
        return ErrorClass::Fatal;
    };

    match diag {
        D::None => ErrorClass::Ignorable,

        D::UnknownMsg | D::UnknownExt => ErrorClass::Fatal,

        D::BadExtLen
        | D::UnknownSatype
        | D::SatypeNeeded
        | D::NoSadbs
        | D::NoExt
        | D::BadSrcAf
        | D::BadDstAf
        | D::BadInnerSrcAf
        | D::AfMismatch
        | D::BadSrc
        | D::BadDst => ErrorClass::DebugFatal,

        D::AllocHsErr | D::BytesHsErr | D::AddtimeHsErr | D::UsetimeHsErr => {
            ErrorClass::Ignorable
        }

        D::MissingSrc
        | D::MissingDst
        | D::MissingSa
        | D::MissingEkey
        | D::MissingAkey
        | D::MissingRange
        | D::DuplicateSrc
        | D::DuplicateDst
        | D::DuplicateSa
        | D::DuplicateEkey
        | D::DuplicateAkey
        | D::DuplicateRange
        | D::MalformedSrc
        | D::MalformedDst
        | D::MalformedSa => ErrorClass::DebugFatal,

        D::MalformedAkey | D::MalformedEkey => {
            if installs {
                ErrorClass::Resync
            } else {
                ErrorClass::Fatal
            }
        }

        // Keys in an AH SA are a programming error; otherwise these come
        // from a retransmitted UPDATE that already went through.
        D::MalformedRange | D::EkeyPresent if satype == Some(SaType::Ah) => {
            ErrorClass::DebugFatal
        }
        D::MalformedRange | D::EkeyPresent | D::AkeyPresent => ErrorClass::Ignorable,

        D::PropPresent | D::SuppPresent | D::BadAalg | D::BadEalg => ErrorClass::DebugFatal,

        D::BadSaflags | D::BadSastate => ErrorClass::Fatal,

        D::BadAkeybits
        | D::BadEkeybits
        | D::EncrNotsupp
        | D::WeakEkey
        | D::WeakAkey
        | D::DuplicateKmp
        | D::DuplicateKmc
        | D::MissingNattLoc
        | D::MissingNattRem
        | D::DuplicateNattLoc
        | D::DuplicateNattRem
        | D::MalformedNattLoc
        | D::MalformedNattRem
        | D::DuplicateNattPorts
        | D::MissingInnerSrc
        | D::MissingInnerDst
        | D::DuplicateInnerSrc
        | D::DuplicateInnerDst
        | D::MalformedInnerSrc
        | D::MalformedInnerDst
        | D::PrefixInnerSrc
        | D::PrefixInnerDst
        | D::BadInnerDstAf
        | D::InnerAfMismatch
        | D::BadNattRemAf
        | D::BadNattLocAf
        | D::ProtoMismatch
        | D::InnerProtoMismatch
        | D::DualPortSets
        | D::PairInappropriate
        | D::PairAddMismatch
        | D::PairAlready
        | D::PairSaNotfound => ErrorClass::Ignorable,

        D::BadSaDirection
        | D::SaNotfound
        | D::SaExpired
        | D::BadCtx
        | D::InvalidReplay
        | D::MissingLifetime => ErrorClass::DebugFatal,
    }
}
