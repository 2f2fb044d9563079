//! Negotiation-engine interface
//!
//! The ISAKMP wire protocol lives outside this crate. The daemon drives it
//! through [`NegotiationEngine`] and hears back through [`EngineEvent`]s,
//! delivered over a channel so every callback is handled on the daemon's own
//! task, one at a time.

use std::net::SocketAddr;

use tokio::sync::oneshot;

use crate::error::Result;
use crate::phase1::session::SessionHandle;
use crate::phase2::proposal::Phase2Proposal;
use crate::policy::{ExchangeMode, Identity, Phase1Proposal};

/// Engine-side identifier of one negotiation
pub type NegotiationId = u64;

/// ISAKMP protocol id
pub const PROTO_ISAKMP: u8 = 1;
/// AH protocol id
pub const PROTO_IPSEC_AH: u8 = 2;
/// ESP protocol id
pub const PROTO_IPSEC_ESP: u8 = 3;

/// Notify message types used by the daemon
pub mod notify {
    /// ATTRIBUTES-NOT-SUPPORTED
    pub const ATTRIBUTES_NOT_SUPPORTED: u16 = 13;
    /// UNEQUAL-PAYLOAD-LENGTHS
    pub const UNEQUAL_PAYLOAD_LENGTHS: u16 = 30;
    /// RESPONDER-LIFETIME
    pub const RESPONDER_LIFETIME: u16 = 24576;
    /// INITIAL-CONTACT
    pub const INITIAL_CONTACT: u16 = 24578;
    /// R-U-THERE
    pub const R_U_THERE: u16 = crate::phase1::dpd::R_U_THERE;
    /// R-U-THERE-ACK
    pub const R_U_THERE_ACK: u16 = crate::phase1::dpd::R_U_THERE_ACK;
}

/// Where a notification or delete goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyTarget {
    /// Protected by an existing negotiation
    Negotiation(NegotiationId),
    /// Straight to a peer with no usable negotiation
    Peer {
        /// Our address
        local: SocketAddr,
        /// Peer address, port included
        remote: SocketAddr,
    },
}

/// An informational notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Destination
    pub target: NotifyTarget,
    /// Protocol id
    pub protocol: u8,
    /// SPI field
    pub spi: Vec<u8>,
    /// Notify message type
    pub message_type: u16,
    /// Notification data
    pub data: Vec<u8>,
}

impl Notification {
    /// DPD probe
    pub fn r_u_there(negotiation: NegotiationId, spi: Vec<u8>, seq: u32) -> Self {
        Self {
            target: NotifyTarget::Negotiation(negotiation),
            protocol: PROTO_ISAKMP,
            spi,
            message_type: notify::R_U_THERE,
            data: seq.to_be_bytes().to_vec(),
        }
    }

    /// Answer to a peer's DPD probe, echoing its SPI and data
    pub fn r_u_there_ack(negotiation: NegotiationId, spi: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            target: NotifyTarget::Negotiation(negotiation),
            protocol: PROTO_ISAKMP,
            spi,
            message_type: notify::R_U_THERE_ACK,
            data,
        }
    }

    /// Rejection of a malformed attribute list
    pub fn attributes_not_supported(negotiation: NegotiationId, protocol: u8, spi: Vec<u8>) -> Self {
        Self {
            target: NotifyTarget::Negotiation(negotiation),
            protocol,
            spi,
            message_type: notify::ATTRIBUTES_NOT_SUPPORTED,
            data: Vec::new(),
        }
    }

    /// Rejection of a truncated attribute list
    pub fn unequal_payload_lengths(negotiation: NegotiationId, protocol: u8, spi: Vec<u8>) -> Self {
        Self {
            target: NotifyTarget::Negotiation(negotiation),
            protocol,
            spi,
            message_type: notify::UNEQUAL_PAYLOAD_LENGTHS,
            data: Vec::new(),
        }
    }

    /// Tell an initiator we installed shorter lifetimes than it offered
    ///
    /// Either value may be zero, in which case it is left out.
    pub fn responder_lifetime(
        negotiation: NegotiationId,
        protocol: u8,
        spi: u32,
        secs: u32,
        kb: u32,
    ) -> Self {
        Self {
            target: NotifyTarget::Negotiation(negotiation),
            protocol,
            spi: spi.to_be_bytes().to_vec(),
            message_type: notify::RESPONDER_LIFETIME,
            data: encode_lifetime_attributes(secs, kb),
        }
    }

    /// INITIAL-CONTACT for a fresh Phase-1
    pub fn initial_contact(negotiation: NegotiationId, spi: Vec<u8>) -> Self {
        Self {
            target: NotifyTarget::Negotiation(negotiation),
            protocol: PROTO_ISAKMP,
            spi,
            message_type: notify::INITIAL_CONTACT,
            data: Vec::new(),
        }
    }
}

/// SA attribute class: life type
pub const ATTR_LIFE_TYPE: u16 = 11;
/// SA attribute class: life duration
pub const ATTR_LIFE_DURATION: u16 = 12;
/// Life type value: seconds
pub const LIFE_TYPE_SECONDS: u16 = 1;
/// Life type value: kilobytes
pub const LIFE_TYPE_KILOBYTES: u16 = 2;

const ATTR_FORMAT_BASIC: u16 = 0x8000;

fn push_lifetime(out: &mut Vec<u8>, life_type: u16, value: u32) {
    out.extend_from_slice(&(ATTR_FORMAT_BASIC | ATTR_LIFE_TYPE).to_be_bytes());
    out.extend_from_slice(&life_type.to_be_bytes());
    match u16::try_from(value) {
        Ok(short) => {
            out.extend_from_slice(&(ATTR_FORMAT_BASIC | ATTR_LIFE_DURATION).to_be_bytes());
            out.extend_from_slice(&short.to_be_bytes());
        }
        Err(_) => {
            out.extend_from_slice(&ATTR_LIFE_DURATION.to_be_bytes());
            out.extend_from_slice(&4u16.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
}

/// Encode a life type/duration attribute list
pub fn encode_lifetime_attributes(secs: u32, kb: u32) -> Vec<u8> {
    let mut out = Vec::new();
    if secs != 0 {
        push_lifetime(&mut out, LIFE_TYPE_SECONDS, secs);
    }
    if kb != 0 {
        push_lifetime(&mut out, LIFE_TYPE_KILOBYTES, kb);
    }
    out
}

/// Phase-1 negotiation to start as initiator
#[derive(Debug, Clone)]
pub struct Phase1Request {
    /// Session on whose behalf the negotiation runs
    pub session: SessionHandle,
    /// Our address
    pub local: SocketAddr,
    /// Peer address
    pub remote: SocketAddr,
    /// Exchange mode from the selected rule
    pub mode: ExchangeMode,
    /// Proposals built from the rule's transforms
    pub proposals: Vec<Phase1Proposal>,
    /// Identity to present
    pub local_id: Option<Identity>,
    /// Identity expected from the peer
    pub remote_id: Option<Identity>,
    /// Send INITIAL-CONTACT with the exchange
    pub initial_contact: bool,
}

/// Quick Mode to start under an established Phase-1
#[derive(Debug, Clone)]
pub struct Phase2Request {
    /// Phase-1 negotiation to run under
    pub negotiation: NegotiationId,
    /// Owning session
    pub session: SessionHandle,
    /// Our address
    pub local: SocketAddr,
    /// Peer address
    pub remote: SocketAddr,
    /// Proposals with SPIs filled in
    pub proposals: Vec<Phase2Proposal>,
    /// PFS group, 0 for none
    pub pfs_group: u16,
    /// Kernel sequence number of the ACQUIRE being answered
    pub acquire_seq: u32,
}

/// DELETE notification for Phase-2 SAs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    /// Destination
    pub target: NotifyTarget,
    /// AH or ESP protocol id
    pub protocol: u8,
    /// SPIs to delete
    pub spis: Vec<u32>,
}

/// The external ISAKMP engine
pub trait NegotiationEngine {
    /// Start a Phase-1 exchange
    fn initiate_phase1(&mut self, request: Phase1Request) -> Result<NegotiationId>;

    /// Start a Quick Mode exchange
    fn initiate_phase2(&mut self, request: Phase2Request) -> Result<NegotiationId>;

    /// Send an informational notification
    fn send_notification(&mut self, notification: Notification) -> Result<()>;

    /// Send a DELETE for Phase-2 SAs
    fn send_delete(&mut self, request: DeleteRequest) -> Result<()>;

    /// Tear down a Phase-1 negotiation, optionally telling the peer
    fn delete_negotiation(&mut self, negotiation: NegotiationId, notify_peer: bool) -> Result<()>;
}

/// What a Phase-1 exchange settled on
#[derive(Debug, Clone)]
pub struct Phase1Info {
    /// Engine id of the negotiation
    pub negotiation: NegotiationId,
    /// Initiator cookie
    pub cookie_i: [u8; 8],
    /// Responder cookie
    pub cookie_r: [u8; 8],
    /// Our identity as sent
    pub local_id: Option<Identity>,
    /// Peer identity as received
    pub remote_id: Option<Identity>,
    /// Peer advertised DPD support
    pub peer_dpd: bool,
    /// Phase-1 lifetime in seconds, 0 for none
    pub lifetime_secs: u32,
}

/// An SA attribute as proposed by the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposedSa {
    /// Transform id (AH/ESP algorithm)
    pub transform_id: u8,
    /// Integrity algorithm (ESP), 0 for none
    pub auth_alg: u8,
    /// Key length in bits, 0 for fixed
    pub key_bits: u16,
}

/// One protocol of a peer's Phase-2 proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerProtocol {
    /// AH or ESP protocol id
    pub protocol: u8,
    /// Peer's SPI
    pub spi: u32,
    /// Transforms in peer preference order
    pub transforms: Vec<ProposedSa>,
}

/// One of a peer's Phase-2 proposals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerProposal {
    /// Proposal number
    pub number: u8,
    /// Protocols that must all be accepted
    pub protocols: Vec<PeerProtocol>,
}

/// Responder SA selection request
#[derive(Debug, Clone)]
pub struct SelectRequest {
    /// Quick Mode negotiation asking
    pub negotiation: NegotiationId,
    /// Session it runs under
    pub session: SessionHandle,
    /// Traffic source as proposed by the peer
    pub src: SocketAddr,
    /// Traffic destination (us)
    pub dst: SocketAddr,
    /// Peer proposals in preference order
    pub proposals: Vec<PeerProposal>,
}

/// Outcome handed back to the engine's continuation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Accepted
    Selection {
        /// Index of the accepted proposal
        proposal: usize,
        /// Chosen transform index per protocol
        transforms: Vec<usize>,
        /// Our inbound SPI per protocol
        spis: Vec<u32>,
    },
    /// Nothing acceptable
    NoProposalChosen,
}

/// Continuation for a responder SA selection
pub type SelectReply = oneshot::Sender<SelectOutcome>;

/// Keying result for one protocol of a completed Quick Mode
#[derive(Debug, Clone)]
pub struct NegotiatedSa {
    /// AH or ESP
    pub protocol: u8,
    /// Our (inbound) SPI
    pub inbound_spi: u32,
    /// Peer's (outbound) SPI
    pub outbound_spi: u32,
    /// Chosen transform
    pub transform: ProposedSa,
    /// Encapsulation mode attribute
    pub encap: u16,
    /// Peer's proposed lifetime in seconds, 0 for none
    pub peer_secs: u32,
    /// Peer's proposed lifetime in kilobytes, 0 for none
    pub peer_kb: u32,
    /// Outbound keying material
    pub outbound_keys: SaKeys,
    /// Inbound keying material
    pub inbound_keys: SaKeys,
}

/// Keys for one SA; zeroized on drop
#[derive(Clone, Default)]
pub struct SaKeys {
    /// Integrity key
    pub auth: zeroize::Zeroizing<Vec<u8>>,
    /// Encryption key
    pub encr: zeroize::Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for SaKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaKeys")
            .field("auth_len", &self.auth.len())
            .field("encr_len", &self.encr.len())
            .finish()
    }
}

/// A finished Quick Mode
#[derive(Debug, Clone)]
pub struct Phase2Result {
    /// Quick Mode negotiation
    pub negotiation: NegotiationId,
    /// Session it ran under
    pub session: SessionHandle,
    /// Our address
    pub local: SocketAddr,
    /// Peer address
    pub remote: SocketAddr,
    /// Kernel sequence number of the ACQUIRE it answers, 0 as responder
    pub acquire_seq: u32,
    /// Whether we initiated it
    pub initiator: bool,
    /// Per-protocol results, AH first
    pub sas: Vec<NegotiatedSa>,
}

/// A notification received from a peer
#[derive(Debug, Clone)]
pub struct ReceivedNotify {
    /// Negotiation it arrived under
    pub negotiation: NegotiationId,
    /// Session it belongs to
    pub session: SessionHandle,
    /// Protocol id
    pub protocol: u8,
    /// SPI field
    pub spi: Vec<u8>,
    /// Notify message type
    pub message_type: u16,
    /// Notification data
    pub data: Vec<u8>,
}

/// Callbacks from the negotiation engine
#[derive(Debug)]
pub enum EngineEvent {
    /// A peer started a Phase-1 toward us
    NewConnection {
        /// Engine id of the new negotiation
        negotiation: NegotiationId,
        /// Our address
        local: SocketAddr,
        /// Peer address
        remote: SocketAddr,
        /// Exchange mode in use
        mode: ExchangeMode,
        /// Where the new session handle (or rejection) goes
        reply: oneshot::Sender<Option<SessionHandle>>,
    },
    /// Peer's Phase-1 proposals need a choice
    SelectPhase1Sa {
        /// Session answering
        session: SessionHandle,
        /// Peer proposals
        proposals: Vec<Phase1Proposal>,
        /// Chosen index or rejection
        reply: oneshot::Sender<Option<usize>>,
    },
    /// Phase-1 finished
    Phase1Done {
        /// Session
        session: SessionHandle,
        /// Outcome; `None` on failure
        info: Option<Phase1Info>,
    },
    /// Peer's Phase-2 proposals need a choice
    SelectSa {
        /// What was proposed
        request: SelectRequest,
        /// Continuation
        reply: SelectReply,
    },
    /// Quick Mode finished with keys
    Phase2Done(Phase2Result),
    /// A notification arrived
    Notification(ReceivedNotify),
    /// A Phase-1 is about to expire and must not take new work
    Phase1Expiring {
        /// Session
        session: SessionHandle,
    },
    /// The engine released a Phase-1 negotiation
    SaFreed {
        /// Session it belonged to
        session: SessionHandle,
    },
}
