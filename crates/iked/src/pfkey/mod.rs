//! PF_KEY v2 (RFC 2367) key-management socket protocol
//!
//! - [`constants`]: wire enumerations and flag values
//! - [`message`]: message and extension codec
//! - [`diag`]: kernel error classification
//! - [`engine`]: single-in-flight request queue with retransmission
//! - `socket`: the kernel socket itself (feature `kernel-socket`)

pub mod constants;
pub mod diag;
pub mod engine;
pub mod message;
#[cfg(all(unix, feature = "kernel-socket"))]
pub mod socket;

pub use constants::{ExtType, MsgType, SaType};
pub use diag::{classify_error, ErrorClass};
pub use engine::{Completion, KernelTransport, PendingTransaction, TransactionEngine};
pub use message::{Extension, ExtBody, Message};
#[cfg(all(unix, feature = "kernel-socket"))]
pub use socket::PfKeySocket;
