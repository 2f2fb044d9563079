//! Structured logging for key-management operations
//!
//! Contextual logging through `tracing`. Cookies and SPIs are hex-encoded so
//! they line up with packet captures and kernel dumps.
//!
//! # Log Levels
//!
//! - **TRACE**: PF_KEY wire traffic
//! - **DEBUG**: policy walks, rule pruning, SA installation
//! - **INFO**: Phase-1 session lifecycle, DPD outcomes
//! - **WARN**: recoverable kernel errors, peer protocol violations
//! - **ERROR**: fatal kernel classifications
//!
//! # Example
//!
//! ```no_run
//! use fynx_iked::logging;
//!
//! logging::init("fynx_iked=debug").unwrap();
//! logging::log_session_state(&[1; 8], &[2; 8], "larval", "established");
//! ```

use std::net::SocketAddr;

use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};
use crate::pfkey::message::Message;

/// Install a global fmt subscriber filtered by `filter`
///
/// `RUST_LOG` takes precedence when set.
pub fn init(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .map_err(|e| Error::InvalidParameter(format!("log filter: {}", e)))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::Internal(format!("subscriber already set: {}", e)))
}

/// Log a PF_KEY message going to the kernel
///
/// # Arguments
///
/// * `msg` - Message being written
/// * `attempt` - 0 for the first transmission, then the retransmission count
pub fn log_pfkey_tx(msg: &Message, attempt: u32) {
    trace!(
        msg_type = msg.msg_type,
        satype = msg.satype,
        seq = msg.seq,
        errno = msg.errno,
        exts = msg.extensions().len(),
        attempt = attempt,
        "PF_KEY send"
    );
}

/// Log a reply that matched no outstanding request
///
/// Retransmission makes this legitimate: the second reply to a resent
/// request finds the queue already advanced.
pub fn log_pfkey_reply_unmatched(reply: &Message) {
    warn!(
        msg_type = reply.msg_type,
        satype = reply.satype,
        seq = reply.seq,
        errno = reply.errno,
        "PF_KEY reply matches no outstanding request, dropped"
    );
}

/// Log Phase-1 session creation
///
/// # Arguments
///
/// * `local` / `remote` - Session endpoints
/// * `rule` - Label of the selected rule
/// * `initiator` - Whether this end starts the negotiation
pub fn log_session_created(local: &SocketAddr, remote: &SocketAddr, rule: &str, initiator: bool) {
    info!(
        local = %local,
        remote = %remote,
        rule = rule,
        role = if initiator { "initiator" } else { "responder" },
        "Phase 1 session created"
    );
}

/// Log a Phase-1 session state transition
pub fn log_session_state(cookie_i: &[u8], cookie_r: &[u8], from: &str, to: &str) {
    info!(
        cookie_i = %hex::encode(cookie_i),
        cookie_r = %hex::encode(cookie_r),
        state_from = from,
        state_to = to,
        "Phase 1 session state transition"
    );
}

/// Log a DPD probe going out
pub fn log_dpd_probe(remote: &SocketAddr, seq: u32, attempt: u32) {
    debug!(
        peer = %remote,
        dpd_seq = seq,
        attempt = attempt,
        "Sending R-U-THERE"
    );
}

/// Log the outcome of a DPD exchange
pub fn log_dpd_result(remote: &SocketAddr, alive: bool) {
    if alive {
        info!(peer = %remote, "DPD handshake successful");
    } else {
        warn!(peer = %remote, "Peer considered dead after DPD retries");
    }
}

/// Log rule selection for a new session
///
/// # Arguments
///
/// * `label` - Selected rule label
/// * `pruned` - Rules removed from the session's candidate set
/// * `remaining` - Rules left in the candidate set
pub fn log_rule_selected(label: &str, pruned: usize, remaining: usize) {
    debug!(
        rule = label,
        pruned = pruned,
        remaining = remaining,
        "Rule selected"
    );
}

/// Log a negative ACQUIRE
pub fn log_negative_acquire(seq: u32, errno: u8, reason: &str) {
    warn!(
        seq = seq,
        errno = errno,
        reason = reason,
        "Sending negative ACQUIRE"
    );
}

/// Log a kernel error reply and its classification
pub fn log_kernel_error(reply: &Message, class: &str) {
    match class {
        "fatal" => error!(
            msg_type = reply.msg_type,
            satype = reply.satype,
            errno = reply.errno,
            diagnostic = reply.diagnostic,
            class = class,
            "PF_KEY error"
        ),
        _ => warn!(
            msg_type = reply.msg_type,
            satype = reply.satype,
            errno = reply.errno,
            diagnostic = reply.diagnostic,
            class = class,
            "PF_KEY error"
        ),
    }
}

/// Log one half of an SA pair being installed
///
/// # Arguments
///
/// * `spi` - SA's SPI
/// * `inbound` - Direction
/// * `secs` / `kb` - Hard lifetimes written to the kernel
pub fn log_sa_install(spi: u32, inbound: bool, secs: u32, kb: u32) {
    debug!(
        spi = %hex::encode(spi.to_be_bytes()),
        direction = if inbound { "inbound" } else { "outbound" },
        lifetime_secs = secs,
        lifetime_kb = kb,
        "Installing SA"
    );
}
