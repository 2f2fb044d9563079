//! Daemon configuration
//!
//! Runtime knobs for the transaction engine, DPD and the initial-contact
//! cache. Rules themselves are loaded separately into a
//! [`Rulebase`](crate::policy::Rulebase).

use std::net::IpAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::phase1::dpd::MAX_DPD_RETRIES;

/// Default IKE port
pub const IKE_PORT: u16 = 500;

/// Daemon configuration
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DaemonConfig {
    /// PF_KEY request retransmission interval
    pub pfkey_retransmit_interval: Duration,

    /// Retransmissions of one request before the kernel is declared
    /// unresponsive
    pub pfkey_max_retransmits: u32,

    /// Interval between R-U-THERE probes
    pub dpd_retry_interval: Duration,

    /// Unanswered probes before the peer is declared dead
    pub dpd_retry_limit: u32,

    /// How long a peer stays in the initial-contact cache
    pub initial_contact_pause: Duration,

    /// Addresses this daemon serves; empty means every address is local
    pub local_addresses: Vec<IpAddr>,

    /// Port used when addressing a peer without a session
    pub ike_port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pfkey_retransmit_interval: Duration::from_secs(5),
            pfkey_max_retransmits: 8,
            dpd_retry_interval: Duration::from_secs(5),
            dpd_retry_limit: MAX_DPD_RETRIES,
            initial_contact_pause: Duration::from_secs(2),
            local_addresses: Vec::new(),
            ike_port: IKE_PORT,
        }
    }
}

impl DaemonConfig {
    /// Create builder for daemon configuration
    pub fn builder() -> DaemonConfigBuilder {
        DaemonConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pfkey_retransmit_interval.is_zero() {
            return Err(Error::InvalidParameter(
                "pfkey_retransmit_interval cannot be zero".into(),
            ));
        }
        if self.dpd_retry_interval.is_zero() {
            return Err(Error::InvalidParameter(
                "dpd_retry_interval cannot be zero".into(),
            ));
        }
        if self.dpd_retry_limit == 0 || self.dpd_retry_limit > MAX_DPD_RETRIES {
            return Err(Error::InvalidParameter(format!(
                "dpd_retry_limit must be between 1 and {}",
                MAX_DPD_RETRIES
            )));
        }
        if self.ike_port == 0 {
            return Err(Error::InvalidParameter("ike_port cannot be zero".into()));
        }
        Ok(())
    }

    /// Whether `addr` is one of ours
    pub fn is_local(&self, addr: &IpAddr) -> bool {
        self.local_addresses.is_empty() || self.local_addresses.contains(addr)
    }
}

/// Builder for DaemonConfig
#[derive(Default)]
pub struct DaemonConfigBuilder {
    config: DaemonConfig,
}

impl DaemonConfigBuilder {
    /// Create new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set PF_KEY retransmission interval
    pub fn with_pfkey_retransmit_interval(mut self, interval: Duration) -> Self {
        self.config.pfkey_retransmit_interval = interval;
        self
    }

    /// Set PF_KEY retransmission ceiling
    pub fn with_pfkey_max_retransmits(mut self, max: u32) -> Self {
        self.config.pfkey_max_retransmits = max;
        self
    }

    /// Set DPD probe interval
    pub fn with_dpd_retry_interval(mut self, interval: Duration) -> Self {
        self.config.dpd_retry_interval = interval;
        self
    }

    /// Set DPD probe limit
    pub fn with_dpd_retry_limit(mut self, limit: u32) -> Self {
        self.config.dpd_retry_limit = limit;
        self
    }

    /// Set initial-contact cache lifetime
    pub fn with_initial_contact_pause(mut self, pause: Duration) -> Self {
        self.config.initial_contact_pause = pause;
        self
    }

    /// Add a local address
    pub fn with_local_address(mut self, addr: IpAddr) -> Self {
        self.config.local_addresses.push(addr);
        self
    }

    /// Set IKE port
    pub fn with_ike_port(mut self, port: u16) -> Self {
        self.config.ike_port = port;
        self
    }

    /// Build DaemonConfig with validation
    pub fn build(self) -> Result<DaemonConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
