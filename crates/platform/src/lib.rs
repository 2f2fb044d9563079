//! # Fynx Platform
//!
//! Core platform types and traits shared by Fynx daemons.
//!
//! This crate provides:
//! - Unified error types (`FynxError`, `FynxResult`)
//! - The `SecurityModule` lifecycle trait and its `ModuleStatus` report
//!
//! # Examples
//!
//! ```
//! use fynx_platform::{FynxError, FynxResult};
//!
//! fn open_kernel_socket() -> FynxResult<()> {
//!     Err(FynxError::Kernel("PF_KEY unavailable".to_string()))
//! }
//!
//! assert!(open_kernel_socket().unwrap_err().is_fatal());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{FynxError, FynxResult};
pub use traits::{ModuleStatus, SecurityModule};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
