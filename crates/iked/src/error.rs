//! Error types for the key-management core
//!
//! A single error type covers the PF_KEY codec, the transaction engine,
//! policy selection and the Phase-1/Phase-2 layers. Most of these errors are
//! handled locally (the offending event is dropped or negatively
//! acknowledged); only the variants reported by [`Error::is_fatal`] are meant
//! to stop the daemon.

use std::fmt;

/// Result type for key-management operations
pub type Result<T> = std::result::Result<T, Error>;

/// Key-management errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed PF_KEY message
    InvalidMessage(String),

    /// Buffer too short for the structure being decoded
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// A required extension is absent
    MissingExtension(u16),

    /// An extension type appears more than once
    DuplicateExtension(u16),

    /// Address family is neither IPv4 nor IPv6
    UnsupportedAddressFamily(u16),

    /// Kernel reported an error classified as fatal
    KernelFatal {
        /// errno carried by the reply
        errno: u8,
        /// PF_KEY diagnostic code
        diagnostic: u16,
    },

    /// Kernel never answered a request
    KernelUnresponsive {
        /// Sequence number of the unanswered request
        seq: u32,
        /// Retransmissions attempted
        attempts: u32,
    },

    /// No rule in the rulebase applies
    NoMatchingRule,

    /// Session handle is stale or unknown
    SessionNotFound,

    /// Allocation or capacity limit reached
    ResourceExhausted(String),

    /// Invalid configuration parameter
    InvalidParameter(String),

    /// Operation not valid in the current state
    InvalidState(String),

    /// Negotiation engine rejected a request
    Engine(String),

    /// I/O error
    Io(String),

    /// Internal error (should not happen)
    Internal(String),
}

impl Error {
    /// Whether the daemon must stop after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::KernelFatal { .. } | Error::KernelUnresponsive { .. } | Error::Io(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidMessage(msg) => write!(f, "Invalid PF_KEY message: {}", msg),
            Error::BufferTooShort {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too short: need {} bytes, have {}",
                    required, available
                )
            }
            Error::MissingExtension(t) => write!(f, "Missing PF_KEY extension: {}", t),
            Error::DuplicateExtension(t) => write!(f, "Duplicate PF_KEY extension: {}", t),
            Error::UnsupportedAddressFamily(af) => {
                write!(f, "Unsupported address family: {}", af)
            }
            Error::KernelFatal { errno, diagnostic } => {
                write!(
                    f,
                    "Fatal kernel error: errno {}, diagnostic {}",
                    errno, diagnostic
                )
            }
            Error::KernelUnresponsive { seq, attempts } => {
                write!(
                    f,
                    "Kernel did not answer request {} after {} retransmissions",
                    seq, attempts
                )
            }
            Error::NoMatchingRule => write!(f, "No matching rule"),
            Error::SessionNotFound => write!(f, "Phase 1 session not found"),
            Error::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Engine(msg) => write!(f, "Negotiation engine error: {}", msg),
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Error> for fynx_platform::FynxError {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(msg) => fynx_platform::FynxError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                msg,
            )),
            Error::InvalidParameter(msg) => fynx_platform::FynxError::Config(msg),
            Error::KernelFatal { .. } | Error::KernelUnresponsive { .. } => {
                fynx_platform::FynxError::Kernel(err.to_string())
            }
            other => fynx_platform::FynxError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidMessage("bad length".to_string());
        assert_eq!(err.to_string(), "Invalid PF_KEY message: bad length");

        let err = Error::BufferTooShort {
            required: 16,
            available: 8,
        };
        assert_eq!(err.to_string(), "Buffer too short: need 16 bytes, have 8");

        let err = Error::KernelFatal {
            errno: 22,
            diagnostic: 1,
        };
        assert_eq!(err.to_string(), "Fatal kernel error: errno 22, diagnostic 1");
    }

    #[test]
    fn test_fatal_classes() {
        assert!(Error::KernelFatal {
            errno: 1,
            diagnostic: 0
        }
        .is_fatal());
        assert!(Error::KernelUnresponsive {
            seq: 3,
            attempts: 8
        }
        .is_fatal());
        assert!(!Error::NoMatchingRule.is_fatal());
        assert!(!Error::MissingExtension(5).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no pf_key");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_platform_conversion() {
        let err: fynx_platform::FynxError = Error::KernelFatal {
            errno: 22,
            diagnostic: 2,
        }
        .into();
        assert!(matches!(err, fynx_platform::FynxError::Kernel(_)));

        let err: fynx_platform::FynxError = Error::InvalidParameter("x".into()).into();
        assert!(matches!(err, fynx_platform::FynxError::Config(_)));
    }
}
