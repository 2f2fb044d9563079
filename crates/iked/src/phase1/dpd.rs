//! Dead Peer Detection (DPD)
//!
//! Implements the R-U-THERE exchange described in RFC 3706.
//!
//! # Overview
//!
//! DPD is driven by the kernel rather than by a periodic timer: when an
//! inbound SA goes idle, the kernel reports an idle EXPIRE and the daemon
//! asks the peer whether it is still there before deciding to keep or drop
//! the SA pair.
//!
//! # Algorithm
//!
//! 1. **Trigger**: idle EXPIRE for an inbound SA
//! 2. **Probe**: R-U-THERE carrying the next sequence number
//! 3. **Retry**: every retry interval, send another probe (new sequence)
//! 4. **Success**: an R-U-THERE-ACK echoing the last sequence refreshes the
//!    SA pair's idle lifetime
//! 5. **Failure**: once the retry limit is exceeded, the SA pair and the
//!    Phase-1 session are deleted
//!
//! # Example Flow
//!
//! ```text
//! Time:  0s       5s       10s      15s      ...      30s
//!        |--------|--------|--------|--------|--------|
//!        Idle     Probe    Probe    Probe             Dead:
//!        EXPIRE   #2       #3       #4                DELPAIR +
//!        Probe #1                                     Phase 1 delete
//!
//! Config: dpd_retry_interval=5s, dpd_retry_limit=5
//! ```
//!
//! # References
//!
//! - [RFC 3706](https://datatracker.ietf.org/doc/html/rfc3706) - Dead Peer Detection

use std::time::{Duration, Instant};

use crate::pfkey::message::Message;

/// Hard ceiling on DPD retries, also the peer sequence acceptance window
pub const MAX_DPD_RETRIES: u32 = 5;

/// R-U-THERE notify message type
pub const R_U_THERE: u16 = 36136;

/// R-U-THERE-ACK notify message type
pub const R_U_THERE_ACK: u16 = 36137;

/// ISAKMP cookie length
pub const COOKIE_LEN: usize = 8;

/// DPD status of a Phase-1 session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpdStatus {
    /// No exchange since the session was created or last succeeded long ago
    NotInitiated,

    /// Probes outstanding
    InProgress,

    /// The last exchange was acknowledged
    Successful,

    /// The retry limit was exceeded; terminal
    Failed,
}

impl DpdStatus {
    /// Lowercase name for logs
    pub fn as_str(self) -> &'static str {
        match self {
            DpdStatus::NotInitiated => "not-initiated",
            DpdStatus::InProgress => "in-progress",
            DpdStatus::Successful => "successful",
            DpdStatus::Failed => "failed",
        }
    }
}

/// Per-session DPD state
///
/// Tracks the sequence numbers in both directions, the probe count and
/// the idle EXPIRE that started the current exchange.
#[derive(Debug, Clone)]
pub struct DpdState {
    /// Current status
    status: DpdStatus,

    /// Whether the peer negotiated DPD
    peer_supports: bool,

    /// Last sequence number sent
    sent_seq: u32,

    /// Last sequence number accepted from the peer
    recv_seq: Option<u32>,

    /// Probes sent in the current exchange
    retries: u32,

    /// When the last exchange concluded
    last_result: Option<Instant>,

    /// Idle EXPIRE that started the current exchange
    trigger: Option<Message>,
}

impl DpdState {
    /// Create DPD state whose first probe follows `initial_seq`
    pub fn new(initial_seq: u32) -> Self {
        DpdState {
            status: DpdStatus::NotInitiated,
            peer_supports: false,
            sent_seq: initial_seq,
            recv_seq: None,
            retries: 0,
            last_result: None,
            trigger: None,
        }
    }

    /// Create DPD state with a random starting sequence
    pub fn random() -> Self {
        Self::new(rand::random())
    }

    /// Current status
    pub fn status(&self) -> DpdStatus {
        self.status
    }

    /// Whether probes are outstanding
    pub fn is_in_progress(&self) -> bool {
        self.status == DpdStatus::InProgress
    }

    /// Whether the peer negotiated DPD
    pub fn peer_supports(&self) -> bool {
        self.peer_supports
    }

    /// Record whether the peer negotiated DPD
    pub fn set_peer_supports(&mut self, supports: bool) {
        self.peer_supports = supports;
    }

    /// Probes sent in the current exchange
    pub fn retry_count(&self) -> u32 {
        self.retries
    }

    /// Last sequence number sent
    pub fn sent_seq(&self) -> u32 {
        self.sent_seq
    }

    /// The idle EXPIRE behind the current exchange
    pub fn trigger(&self) -> Option<&Message> {
        self.trigger.as_ref()
    }

    /// Start an exchange for `trigger`
    ///
    /// A trigger already held is kept; later ones only re-arm probing.
    pub fn begin(&mut self, trigger: Message) {
        self.status = DpdStatus::InProgress;
        if self.trigger.is_none() {
            self.trigger = Some(trigger);
        }
    }

    /// Advance to the next probe and return its sequence number
    pub fn next_probe(&mut self) -> u32 {
        self.sent_seq = self.sent_seq.wrapping_add(1);
        self.retries += 1;
        self.sent_seq
    }

    /// Whether more than `limit` probes went unanswered
    pub fn exhausted(&self, limit: u32) -> bool {
        self.retries > limit
    }

    /// Handle an R-U-THERE-ACK carrying `seq`
    ///
    /// Only an echo of the last sequence sent counts; anything else leaves
    /// the state untouched and returns false.
    pub fn mark_acked(&mut self, seq: u32, now: Instant) -> bool {
        if seq != self.sent_seq {
            return false;
        }
        self.status = DpdStatus::Successful;
        self.last_result = Some(now);
        self.retries = 0;
        true
    }

    /// Release the trigger of a concluded exchange
    ///
    /// Empty when a late acknowledgement arrives after the trigger was
    /// already used.
    pub fn take_trigger(&mut self) -> Option<Message> {
        self.trigger.take()
    }

    /// Handle a peer's R-U-THERE carrying `seq`
    ///
    /// The first probe is always accepted; later ones must lie within
    /// `MAX_DPD_RETRIES` ahead of the last accepted one.
    pub fn accept_probe(&mut self, seq: u32) -> bool {
        if let Some(last) = self.recv_seq {
            if seq.wrapping_sub(last) > MAX_DPD_RETRIES {
                return false;
            }
        }
        self.recv_seq = Some(seq);
        true
    }

    /// Declare the peer dead; returns the trigger for the SA pair delete
    pub fn mark_failed(&mut self, now: Instant) -> Option<Message> {
        self.status = DpdStatus::Failed;
        self.last_result = Some(now);
        self.retries = 0;
        self.trigger.take()
    }

    /// Outcome of an exchange concluded less than `window` ago
    pub fn recent_result(&self, now: Instant, window: Duration) -> Option<DpdStatus> {
        let at = self.last_result?;
        (now.saturating_duration_since(at) < window).then_some(self.status)
    }
}

impl Default for DpdState {
    fn default() -> Self {
        Self::random()
    }
}

/// Notification SPI for DPD: initiator cookie followed by responder cookie
pub fn probe_spi(cookie_i: &[u8; COOKIE_LEN], cookie_r: &[u8; COOKIE_LEN]) -> Vec<u8> {
    let mut spi = Vec::with_capacity(2 * COOKIE_LEN);
    spi.extend_from_slice(cookie_i);
    spi.extend_from_slice(cookie_r);
    spi
}

/// Sequence number carried in a DPD notification's data
pub fn decode_seq(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}
