//! Policy and key-management core of an IKEv1 daemon.
//!
//! This crate sits between the kernel's PF_KEY interface and an ISAKMP
//! negotiation engine:
//!
//! - **PF_KEY transactions** - single-in-flight request queue with
//!   retransmission, reply correlation and error classification
//! - **Phase-1 lifecycle** - session creation from kernel ACQUIREs,
//!   responder admission, Dead Peer Detection and teardown
//! - **Policy** - rule selection over addresses, identities and cookies,
//!   with candidate pruning as a negotiation learns more
//! - **Phase-2** - ACQUIRE to Quick Mode proposal translation, SPI
//!   allocation, SA pair installation and lifetime reconciliation
//!
//! The negotiation engine itself (wire ISAKMP, Diffie-Hellman, key
//! derivation) is external and plugged in through
//! [`negotiation::NegotiationEngine`].
//!
//! # Features
//!
//! - `kernel-socket` (default) - the PF_KEY socket and the tokio event loop
//! - `serde` - serialization of configuration and metrics snapshots
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(all(unix, feature = "kernel-socket"))]
//! # async fn serve() -> fynx_iked::Result<()> {
//! use fynx_iked::pfkey::PfKeySocket;
//! use fynx_iked::policy::{AddressSpec, Rule, Rulebase};
//! use fynx_iked::{Daemon, DaemonConfig};
//! # struct Engine;
//! # impl fynx_iked::negotiation::NegotiationEngine for Engine {
//! #     fn initiate_phase1(&mut self, _: fynx_iked::negotiation::Phase1Request) -> fynx_iked::Result<u64> { Ok(1) }
//! #     fn initiate_phase2(&mut self, _: fynx_iked::negotiation::Phase2Request) -> fynx_iked::Result<u64> { Ok(2) }
//! #     fn send_notification(&mut self, _: fynx_iked::negotiation::Notification) -> fynx_iked::Result<()> { Ok(()) }
//! #     fn send_delete(&mut self, _: fynx_iked::negotiation::DeleteRequest) -> fynx_iked::Result<()> { Ok(()) }
//! #     fn delete_negotiation(&mut self, _: u64, _: bool) -> fynx_iked::Result<()> { Ok(()) }
//! # }
//! # let engine = Engine;
//!
//! fynx_iked::logging::init("info")?;
//!
//! let rulebase: Rulebase = [Rule::new("site-to-site")
//!     .with_addresses(AddressSpec::parse("10.0.0.1")?, AddressSpec::parse("192.0.2.0/24")?)]
//! .into_iter()
//! .collect();
//!
//! let socket = PfKeySocket::open()?;
//! let (_events_tx, events) = tokio::sync::mpsc::channel(64);
//! let mut daemon = Daemon::new(
//!     DaemonConfig::default(),
//!     socket.clone(),
//!     std::process::id(),
//!     engine,
//!     rulebase,
//! )?;
//! daemon.run(socket, events).await
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 2367](https://datatracker.ietf.org/doc/html/rfc2367) - PF_KEY Key Management API, Version 2
//! - [RFC 2407](https://datatracker.ietf.org/doc/html/rfc2407) - The Internet IP Security Domain of Interpretation for ISAKMP
//! - [RFC 2409](https://datatracker.ietf.org/doc/html/rfc2409) - The Internet Key Exchange (IKE)
//! - [RFC 3706](https://datatracker.ietf.org/doc/html/rfc3706) - Dead Peer Detection

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod action;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod negotiation;
pub mod pfkey;
pub mod phase1;
pub mod phase2;
pub mod policy;

pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use metrics::IkeMetrics;
