//! Phase-2 proposals and SA installation
//!
//! - [`algs`]: kernel algorithm table learned from REGISTER
//! - [`proposal`]: ACQUIRE to Quick Mode proposal translation and peer
//!   proposal matching
//! - [`install`]: SPI allocation, SA pair installation and lifetime
//!   reconciliation

pub mod algs;
pub mod install;
pub mod proposal;

pub use algs::AlgorithmTable;
pub use install::{InstallWait, SelectWait, SpiPurpose, SpiWait};
pub use proposal::{
    build_proposal, match_peer_proposals, spi_types, EncapMode, Phase2Proposal, ProposalContext,
    ProtocolProposal, SaAttribute, Transform,
};
