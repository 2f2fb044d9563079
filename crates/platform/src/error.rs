//! Error types shared across Fynx daemons

use std::fmt;

/// Unified error type for Fynx modules
#[derive(Debug)]
pub enum FynxError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed input, negotiation failure)
    Protocol(String),

    /// Kernel interface failure the module cannot recover from
    Kernel(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl FynxError {
    /// Whether the owning process should exit
    pub fn is_fatal(&self) -> bool {
        matches!(self, FynxError::Io(_) | FynxError::Kernel(_))
    }
}

impl fmt::Display for FynxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FynxError::Io(e) => write!(f, "IO error: {}", e),
            FynxError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FynxError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            FynxError::Kernel(msg) => write!(f, "Kernel error: {}", msg),
            FynxError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for FynxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FynxError::Io(e) => Some(e),
            FynxError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FynxError {
    fn from(err: std::io::Error) -> Self {
        FynxError::Io(err)
    }
}

/// Result type for Fynx operations
pub type FynxResult<T> = Result<T, FynxError>;
