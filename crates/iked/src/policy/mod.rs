//! Rule-based policy
//!
//! - [`addr`]: address ranges and matching
//! - [`ident`]: identity patterns
//! - [`rule`]: rules and Phase-1 transforms
//! - [`rulebase`]: ordered rule sets, selection and pruning
//! - [`lifetime`]: Phase-2 lifetime normalization

pub mod addr;
pub mod ident;
pub mod lifetime;
pub mod rule;
pub mod rulebase;

pub use addr::{addr_equal, address_match, AddrRange, AddressSpec};
pub use ident::{IdType, Identity, IdentitySpec};
pub use lifetime::{normalize_lifetimes, P2Lifetimes};
pub use rule::{
    AuthMethod, EncrAlg, ExchangeMode, HashAlg, Phase1Proposal, Phase1Transform, Rule,
};
pub use rulebase::{RuleQuery, Rulebase};
