//! Phase-1 (ISAKMP) session lifecycle
//!
//! - [`session`]: sessions, handles and the session arena
//! - [`dpd`]: Dead Peer Detection sub-state machine
//! - [`addrcache`]: initial-contact address cache
//! - [`manager`]: lookup, creation, completion, teardown and DPD

pub mod addrcache;
pub mod dpd;
pub mod manager;
pub mod session;

pub use addrcache::AddressCache;
pub use dpd::{DpdState, DpdStatus};
pub use manager::{Phase1Manager, SessionOutcome};
pub use session::{PendingWork, Phase1Session, SessionHandle, SessionState, SessionTable};
