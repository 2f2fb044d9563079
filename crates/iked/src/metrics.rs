//! Daemon statistics
//!
//! Counters for Phase-1 negotiations, PF_KEY traffic, DPD and SA
//! installation. All counters are atomics behind `Arc`, so clones handed to
//! the transaction engine and the session manager update the same values.
//!
//! # Example
//!
//! ```
//! use fynx_iked::metrics::IkeMetrics;
//!
//! let metrics = IkeMetrics::new();
//! metrics.record_p1_attempt(true);
//! metrics.record_p1_success(true);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.p1_success_initiator, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Key-management counters
#[derive(Debug, Clone)]
pub struct IkeMetrics {
    /// Phase-1 negotiations started as initiator
    pub p1_attempts_initiator: Arc<AtomicU64>,
    /// Phase-1 negotiations started as responder
    pub p1_attempts_responder: Arc<AtomicU64>,
    /// Phase-1 negotiations completed as initiator
    pub p1_success_initiator: Arc<AtomicU64>,
    /// Phase-1 negotiations completed as responder
    pub p1_success_responder: Arc<AtomicU64>,
    /// Phase-1 negotiations failed as initiator
    pub p1_failures_initiator: Arc<AtomicU64>,
    /// Phase-1 negotiations failed as responder
    pub p1_failures_responder: Arc<AtomicU64>,
    /// Sessions currently in the table
    pub p1_current: Arc<AtomicU64>,
    /// Sessions ever created
    pub p1_total: Arc<AtomicU64>,

    /// PF_KEY requests written (first transmissions and retransmissions)
    pub pfkey_requests: Arc<AtomicU64>,
    /// PF_KEY retransmissions
    pub pfkey_retransmits: Arc<AtomicU64>,
    /// PF_KEY replies matching no outstanding request
    pub pfkey_unmatched_replies: Arc<AtomicU64>,
    /// Negative ACQUIREs sent
    pub negative_acquires: Arc<AtomicU64>,

    /// R-U-THERE probes sent
    pub dpd_probes: Arc<AtomicU64>,
    /// DPD handshakes that got an acknowledgement
    pub dpd_successes: Arc<AtomicU64>,
    /// Peers declared dead
    pub dpd_failures: Arc<AtomicU64>,

    /// SAs written to the kernel
    pub sas_installed: Arc<AtomicU64>,
    /// ADD/UPDATE failures converted into DELETEs
    pub resyncs: Arc<AtomicU64>,
}

impl IkeMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self {
            p1_attempts_initiator: Arc::new(AtomicU64::new(0)),
            p1_attempts_responder: Arc::new(AtomicU64::new(0)),
            p1_success_initiator: Arc::new(AtomicU64::new(0)),
            p1_success_responder: Arc::new(AtomicU64::new(0)),
            p1_failures_initiator: Arc::new(AtomicU64::new(0)),
            p1_failures_responder: Arc::new(AtomicU64::new(0)),
            p1_current: Arc::new(AtomicU64::new(0)),
            p1_total: Arc::new(AtomicU64::new(0)),
            pfkey_requests: Arc::new(AtomicU64::new(0)),
            pfkey_retransmits: Arc::new(AtomicU64::new(0)),
            pfkey_unmatched_replies: Arc::new(AtomicU64::new(0)),
            negative_acquires: Arc::new(AtomicU64::new(0)),
            dpd_probes: Arc::new(AtomicU64::new(0)),
            dpd_successes: Arc::new(AtomicU64::new(0)),
            dpd_failures: Arc::new(AtomicU64::new(0)),
            sas_installed: Arc::new(AtomicU64::new(0)),
            resyncs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a Phase-1 negotiation start
    pub fn record_p1_attempt(&self, initiator: bool) {
        let counter = if initiator {
            &self.p1_attempts_initiator
        } else {
            &self.p1_attempts_responder
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a Phase-1 negotiation completing
    pub fn record_p1_success(&self, initiator: bool) {
        let counter = if initiator {
            &self.p1_success_initiator
        } else {
            &self.p1_success_responder
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a Phase-1 negotiation failing
    pub fn record_p1_failure(&self, initiator: bool) {
        let counter = if initiator {
            &self.p1_failures_initiator
        } else {
            &self.p1_failures_responder
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session entering the table
    pub fn record_session_created(&self) {
        self.p1_current.fetch_add(1, Ordering::Relaxed);
        self.p1_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session leaving the table
    pub fn record_session_removed(&self) {
        let _ = self
            .p1_current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Record a PF_KEY request write
    pub fn record_pfkey_request(&self) {
        self.pfkey_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a PF_KEY retransmission
    pub fn record_pfkey_retransmit(&self) {
        self.pfkey_retransmits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reply nobody was waiting for
    pub fn record_unmatched_reply(&self) {
        self.pfkey_unmatched_replies.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a negative ACQUIRE
    pub fn record_negative_acquire(&self) {
        self.negative_acquires.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an R-U-THERE probe
    pub fn record_dpd_probe(&self) {
        self.dpd_probes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a DPD exchange
    ///
    /// # Arguments
    ///
    /// * `success` - Whether the peer acknowledged
    pub fn record_dpd_result(&self, success: bool) {
        let counter = if success {
            &self.dpd_successes
        } else {
            &self.dpd_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an SA written to the kernel
    pub fn record_sa_installed(&self) {
        self.sas_installed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a resync delete
    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            p1_attempts_initiator: self.p1_attempts_initiator.load(Ordering::Relaxed),
            p1_attempts_responder: self.p1_attempts_responder.load(Ordering::Relaxed),
            p1_success_initiator: self.p1_success_initiator.load(Ordering::Relaxed),
            p1_success_responder: self.p1_success_responder.load(Ordering::Relaxed),
            p1_failures_initiator: self.p1_failures_initiator.load(Ordering::Relaxed),
            p1_failures_responder: self.p1_failures_responder.load(Ordering::Relaxed),
            p1_current: self.p1_current.load(Ordering::Relaxed),
            p1_total: self.p1_total.load(Ordering::Relaxed),
            pfkey_requests: self.pfkey_requests.load(Ordering::Relaxed),
            pfkey_retransmits: self.pfkey_retransmits.load(Ordering::Relaxed),
            pfkey_unmatched_replies: self.pfkey_unmatched_replies.load(Ordering::Relaxed),
            negative_acquires: self.negative_acquires.load(Ordering::Relaxed),
            dpd_probes: self.dpd_probes.load(Ordering::Relaxed),
            dpd_successes: self.dpd_successes.load(Ordering::Relaxed),
            dpd_failures: self.dpd_failures.load(Ordering::Relaxed),
            sas_installed: self.sas_installed.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

impl Default for IkeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of [`IkeMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
    /// Phase-1 starts as initiator
    pub p1_attempts_initiator: u64,
    /// Phase-1 starts as responder
    pub p1_attempts_responder: u64,
    /// Phase-1 completions as initiator
    pub p1_success_initiator: u64,
    /// Phase-1 completions as responder
    pub p1_success_responder: u64,
    /// Phase-1 failures as initiator
    pub p1_failures_initiator: u64,
    /// Phase-1 failures as responder
    pub p1_failures_responder: u64,
    /// Sessions in the table
    pub p1_current: u64,
    /// Sessions ever created
    pub p1_total: u64,
    /// PF_KEY request writes
    pub pfkey_requests: u64,
    /// PF_KEY retransmissions
    pub pfkey_retransmits: u64,
    /// Unmatched PF_KEY replies
    pub pfkey_unmatched_replies: u64,
    /// Negative ACQUIREs
    pub negative_acquires: u64,
    /// DPD probes
    pub dpd_probes: u64,
    /// DPD successes
    pub dpd_successes: u64,
    /// Dead peers
    pub dpd_failures: u64,
    /// SAs installed
    pub sas_installed: u64,
    /// Resync deletes
    pub resyncs: u64,
}

impl MetricsSnapshot {
    /// Phase-1 success rate over both roles (0.0 to 1.0)
    pub fn p1_success_rate(&self) -> f64 {
        let attempts = self.p1_attempts_initiator + self.p1_attempts_responder;
        if attempts == 0 {
            return 0.0;
        }
        (self.p1_success_initiator + self.p1_success_responder) as f64 / attempts as f64
    }

    /// DPD success rate (0.0 to 1.0)
    pub fn dpd_success_rate(&self) -> f64 {
        let finished = self.dpd_successes + self.dpd_failures;
        if finished == 0 {
            return 1.0; // No exchanges, no failures
        }
        self.dpd_successes as f64 / finished as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = IkeMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_p1_metrics() {
        let metrics = IkeMetrics::new();
        metrics.record_p1_attempt(true);
        metrics.record_p1_attempt(false);
        metrics.record_p1_success(true);
        metrics.record_p1_failure(false);

        let s = metrics.snapshot();
        assert_eq!(s.p1_attempts_initiator, 1);
        assert_eq!(s.p1_attempts_responder, 1);
        assert_eq!(s.p1_success_initiator, 1);
        assert_eq!(s.p1_failures_responder, 1);
        assert_eq!(s.p1_success_rate(), 0.5);
    }

    #[test]
    fn test_session_gauge() {
        let metrics = IkeMetrics::new();
        metrics.record_session_created();
        metrics.record_session_created();
        metrics.record_session_removed();
        metrics.record_session_removed();
        metrics.record_session_removed();

        let s = metrics.snapshot();
        assert_eq!(s.p1_current, 0);
        assert_eq!(s.p1_total, 2);
    }

    #[test]
    fn test_dpd_metrics() {
        let metrics = IkeMetrics::new();
        assert_eq!(metrics.snapshot().dpd_success_rate(), 1.0);

        metrics.record_dpd_probe();
        metrics.record_dpd_result(true);
        metrics.record_dpd_result(false);
        let s = metrics.snapshot();
        assert_eq!(s.dpd_probes, 1);
        assert_eq!(s.dpd_success_rate(), 0.5);
    }

    #[test]
    fn test_metrics_clone_shares_counters() {
        let metrics = IkeMetrics::new();
        let clone = metrics.clone();
        clone.record_pfkey_request();
        clone.record_resync();
        assert_eq!(metrics.snapshot().pfkey_requests, 1);
        assert_eq!(metrics.snapshot().resyncs, 1);
    }
}
