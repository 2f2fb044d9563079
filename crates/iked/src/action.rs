//! Side effects requested by the Phase-1 and Phase-2 layers
//!
//! Session and proposal logic never touches the kernel socket, the
//! negotiation engine or the clock directly. It appends [`Action`]s and the
//! daemon carries them out in order once the handler returns.

use std::time::Instant;

use crate::negotiation::{DeleteRequest, NegotiationId, Notification, Phase1Request, Phase2Request};
use crate::pfkey::{Completion, Message};
use crate::phase1::session::SessionHandle;

/// Timer events owned by the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Resend a DPD probe unless `seq` was answered meanwhile
    DpdRetry {
        /// Session probing
        session: SessionHandle,
        /// Sequence number of the probe this timer guards
        seq: u32,
    },
}

/// One deferred side effect
#[derive(Debug)]
pub enum Action {
    /// Write a message outside the transaction queue (negative ACQUIRE)
    KernelSend(Message),
    /// Queue a kernel request with its continuation
    KernelRequest(Message, Completion),
    /// Start a Phase-1 exchange
    Initiate(Phase1Request),
    /// Start a Quick Mode exchange
    InitiatePhase2(Phase2Request),
    /// Send a notification
    Notify(Notification),
    /// Send a DELETE for Phase-2 SAs
    SendDelete(DeleteRequest),
    /// Tear down a Phase-1 negotiation
    DeleteNegotiation {
        /// Negotiation to delete
        negotiation: NegotiationId,
        /// Tell the peer
        notify_peer: bool,
    },
    /// Build and start Phase-2 for a queued ACQUIRE
    StartPhase2 {
        /// Established session
        session: SessionHandle,
        /// The ACQUIRE
        acquire: Message,
    },
    /// Arm a timer
    Schedule {
        /// When it fires
        at: Instant,
        /// What it does
        event: TimerEvent,
    },
}

/// Appends actions; the one piece of state every handler threads through
pub type Actions = Vec<Action>;
