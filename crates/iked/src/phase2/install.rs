//! Phase-2 SA installation
//!
//! Continuations for the kernel requests behind a Quick Mode: SPI
//! allocation (one GETSPI per SA type, AH before ESP), responder SA
//! selection through an inverse ACQUIRE, and the ADD/UPDATE pair that
//! installs each negotiated SA. The transaction engine carries these as
//! [`Completion`] payloads and hands them back with the kernel's reply.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::action::{Action, Actions};
use crate::error::Error;
use crate::logging::log_sa_install;
use crate::metrics::IkeMetrics;
use crate::negotiation::{
    notify, NegotiatedSa, NegotiationId, Notification, NotifyTarget, Phase2Request, Phase2Result,
    ReceivedNotify, SelectOutcome, SelectReply, SelectRequest, ATTR_LIFE_DURATION, ATTR_LIFE_TYPE,
    LIFE_TYPE_KILOBYTES, LIFE_TYPE_SECONDS, PROTO_IPSEC_AH, PROTO_IPSEC_ESP,
};
use crate::pfkey::constants::{errno, saflags, sastate, AlgType, ExtType, MsgType, SaType};
use crate::pfkey::engine::Completion;
use crate::pfkey::message::{
    AddressExt, AlgDesc, Ecomb, EpropExt, KeyExt, LifetimeExt, Message, PairExt, SaExt, SpiRangeExt,
};
use crate::phase1::{Phase1Manager, PendingWork, SessionHandle};
use crate::phase2::algs::AlgorithmTable;
use crate::phase2::proposal::{
    build_proposal, match_peer_proposals, pfkey_auth_alg, spi_types, Phase2Proposal,
    ProposalContext,
};
use crate::policy::lifetime::{lesser_of, DEF_P2_LIFETIME_HARD};
use crate::policy::{normalize_lifetimes, P2Lifetimes};

/// Replay window requested for every installed SA
pub const REPLAY_WINDOW: u8 = 32;

/// Soft expiries this close to the SA's scheduled soft time came from the
/// timer, not the byte counter
pub const SOFT_EXPIRE_SLACK_SECS: u64 = 8;

/// What an SPI chain is for
#[derive(Debug)]
pub enum SpiPurpose {
    /// Our ACQUIRE: the proposals go to the engine once SPIs are filled in
    Initiate {
        /// The ACQUIRE being answered
        acquire: Message,
        /// Proposals awaiting SPIs
        proposals: Vec<Phase2Proposal>,
    },
    /// A peer's Quick Mode: the selection goes back through `reply`
    Respond {
        /// Index of the accepted peer proposal
        proposal: usize,
        /// Chosen transform per protocol
        transforms: Vec<usize>,
        /// Protocol ids of the accepted proposal, in its order
        protocols: Vec<u8>,
        /// Engine continuation
        reply: SelectReply,
    },
}

/// Chain of GETSPI requests, one per SA type
#[derive(Debug)]
pub struct SpiWait {
    /// Owning session
    pub session: SessionHandle,
    /// Source of the inbound SAs (the peer)
    pub src: SocketAddr,
    /// Destination of the inbound SAs (us)
    pub dst: SocketAddr,
    /// SA types still needing an SPI
    pub remaining: VecDeque<SaType>,
    /// SPIs allocated so far
    pub allocated: Vec<(SaType, u32)>,
    /// Where the SPIs go
    pub purpose: SpiPurpose,
}

/// Responder selection waiting on the kernel's inverse ACQUIRE
#[derive(Debug)]
pub struct SelectWait {
    /// Owning session
    pub session: SessionHandle,
    /// The peer's proposals
    pub request: SelectRequest,
    /// Engine continuation
    pub reply: SelectReply,
}

/// One half of an SA pair on its way into the kernel
#[derive(Debug, Clone)]
pub struct InstallWait {
    /// Owning session
    pub session: SessionHandle,
    /// Quick Mode negotiation
    pub negotiation: NegotiationId,
    /// Our address
    pub local: SocketAddr,
    /// Peer address
    pub remote: SocketAddr,
    /// AH or ESP
    pub satype: SaType,
    /// SA's SPI
    pub spi: u32,
    /// Direction
    pub inbound: bool,
    /// Hard lifetime in seconds as installed
    pub hard_secs: u32,
    /// Hard lifetime in kilobytes as installed
    pub hard_kb: u32,
    /// RESPONDER-LIFETIME to send once installed
    pub responder_lifetime: Option<(u32, u32)>,
}

fn protocol_id(satype: SaType) -> u8 {
    match satype {
        SaType::Ah => PROTO_IPSEC_AH,
        _ => PROTO_IPSEC_ESP,
    }
}

fn sa_type(protocol: u8) -> Option<SaType> {
    match protocol {
        PROTO_IPSEC_AH => Some(SaType::Ah),
        PROTO_IPSEC_ESP => Some(SaType::Esp),
        _ => None,
    }
}

/// GETSPI for an inbound SA from `src` to `dst`
pub fn getspi_request(satype: SaType, src: SocketAddr, dst: SocketAddr) -> Message {
    Message::new(MsgType::GetSpi, satype)
        .with(AddressExt::new(ExtType::AddressSrc, src))
        .with(AddressExt::new(ExtType::AddressDst, dst))
        .with(SpiRangeExt {
            min: 0,
            max: u32::MAX,
        })
}

/// X_INVERSE_ACQUIRE asking which policy covers a peer's proposed traffic
pub fn inverse_acquire_request(request: &SelectRequest) -> Message {
    Message::new(MsgType::XInverseAcquire, SaType::Unspec)
        .with(AddressExt::new(ExtType::AddressSrc, request.dst))
        .with(AddressExt::new(ExtType::AddressDst, request.src))
}

fn start_chain(mut wait: SpiWait, mgr: Option<&Phase1Manager>, out: &mut Actions) {
    match wait.remaining.pop_front() {
        Some(satype) => {
            let request = getspi_request(satype, wait.src, wait.dst);
            out.push(Action::KernelRequest(request, Completion::GetSpi(wait)));
        }
        None => finish_chain(wait, mgr, out),
    }
}

/// Turn an ACQUIRE into proposals and start allocating their SPIs
///
/// The session must be established. A build failure negatively
/// acknowledges the ACQUIRE: `ENOMEM` when the proposal could not be held,
/// `EINVAL` otherwise.
pub fn start_phase2(
    mgr: &Phase1Manager,
    algs: &AlgorithmTable,
    session: SessionHandle,
    acquire: Message,
    out: &mut Actions,
) {
    let Some(s) = mgr.get(session) else {
        mgr.nack(PendingWork::Acquire(acquire), errno::EPERM, "session gone", out);
        return;
    };
    let Some(eprop) = acquire.get::<EpropExt>(ExtType::XEprop) else {
        mgr.nack(PendingWork::Acquire(acquire), errno::EINVAL, "no extended proposal", out);
        return;
    };
    let (Some(src), Some(dst)) = (
        acquire.address(ExtType::AddressSrc),
        acquire.address(ExtType::AddressDst),
    ) else {
        mgr.nack(PendingWork::Acquire(acquire), errno::EINVAL, "missing address", out);
        return;
    };

    let ctx = ProposalContext {
        algs,
        lifetimes: s.rule.p2_lifetimes,
        pfs_group: s.rule.p2_pfs,
        tunnel: acquire.has(ExtType::InnerSrc) || acquire.has(ExtType::InnerDst),
        natt: acquire.has(ExtType::NattLoc) || acquire.has(ExtType::NattRem),
    };
    let proposals = match build_proposal(&eprop, &ctx) {
        Ok(p) => p,
        Err(e) => {
            let err = match e {
                Error::ResourceExhausted(_) => errno::ENOMEM,
                _ => errno::EINVAL,
            };
            mgr.nack(PendingWork::Acquire(acquire), err, &e.to_string(), out);
            return;
        }
    };

    debug!(
        seq = acquire.seq,
        proposals = proposals.len(),
        remote = %dst,
        "Phase-2 proposal built"
    );
    let remaining: VecDeque<SaType> = spi_types(&proposals).into_iter().collect();
    start_chain(
        SpiWait {
            session,
            src: dst,
            dst: src,
            remaining,
            allocated: Vec::new(),
            purpose: SpiPurpose::Initiate { acquire, proposals },
        },
        Some(mgr),
        out,
    );
}

/// GETSPI reply: allocate the next SPI or hand the finished set on
pub fn on_getspi_reply(
    mgr: &Phase1Manager,
    mut wait: SpiWait,
    reply: &Message,
    ok: bool,
    out: &mut Actions,
) {
    let spi = if ok { reply.sa().map(|sa| sa.spi) } else { None };
    let Some(spi) = spi else {
        let err = if reply.errno != 0 { reply.errno } else { errno::EINVAL };
        fail_chain(mgr, wait, err, out);
        return;
    };
    let satype = reply.sa_type().unwrap_or(SaType::Unspec);
    debug!(spi = %hex::encode(spi.to_be_bytes()), satype = reply.satype, "SPI allocated");
    wait.allocated.push((satype, spi));

    match wait.remaining.pop_front() {
        Some(next) => {
            let request = getspi_request(next, wait.src, wait.dst);
            out.push(Action::KernelRequest(request, Completion::GetSpi(wait)));
        }
        None => finish_chain(wait, Some(mgr), out),
    }
}

fn fail_chain(mgr: &Phase1Manager, wait: SpiWait, err: u8, out: &mut Actions) {
    match wait.purpose {
        SpiPurpose::Initiate { acquire, .. } => {
            mgr.nack(PendingWork::Acquire(acquire), err, "SPI allocation failed", out);
        }
        SpiPurpose::Respond { reply, .. } => {
            let _ = reply.send(SelectOutcome::NoProposalChosen);
        }
    }
}

fn finish_chain(wait: SpiWait, mgr: Option<&Phase1Manager>, out: &mut Actions) {
    let spis: Vec<(SaType, u32)> = wait.allocated.clone();
    let lookup = |satype: SaType| {
        spis.iter()
            .find(|(t, _)| *t == satype)
            .map_or(0, |(_, spi)| *spi)
    };
    match wait.purpose {
        SpiPurpose::Initiate {
            acquire,
            mut proposals,
        } => {
            for proposal in &mut proposals {
                for protocol in &mut proposal.protocols {
                    protocol.spi = lookup(protocol.protocol);
                }
            }
            let established = mgr
                .and_then(|m| m.get(wait.session))
                .and_then(|s| s.negotiation.map(|n| (n, s.local, s.remote, s.rule.p2_pfs)));
            match established {
                Some((negotiation, local, remote, pfs_group)) => {
                    out.push(Action::InitiatePhase2(Phase2Request {
                        negotiation,
                        session: wait.session,
                        local,
                        remote,
                        proposals,
                        pfs_group,
                        acquire_seq: acquire.seq,
                    }));
                }
                None => {
                    if let Some(m) = mgr {
                        m.nack(PendingWork::Acquire(acquire), errno::EPERM, "session gone", out);
                    }
                }
            }
        }
        SpiPurpose::Respond {
            proposal,
            transforms,
            protocols,
            reply,
        } => {
            let spis = protocols
                .iter()
                .map(|p| sa_type(*p).map_or(0, lookup))
                .collect();
            let _ = reply.send(SelectOutcome::Selection {
                proposal,
                transforms,
                spis,
            });
        }
    }
}

/// Inverse ACQUIRE reply: match the peer's proposals and allocate SPIs
pub fn on_inverse_acquire_reply(wait: SelectWait, reply: &Message, ok: bool, out: &mut Actions) {
    let eprop = if ok {
        reply.get::<EpropExt>(ExtType::XEprop)
    } else {
        None
    };
    let choice = eprop.and_then(|e| match_peer_proposals(&wait.request.proposals, &e));
    let Some((index, transforms)) = choice else {
        debug!(
            negotiation = wait.request.negotiation,
            errno = reply.errno,
            "No acceptable Phase-2 proposal"
        );
        let _ = wait.reply.send(SelectOutcome::NoProposalChosen);
        return;
    };

    let protocols: Vec<u8> = wait.request.proposals[index]
        .protocols
        .iter()
        .map(|p| p.protocol)
        .collect();
    let mut remaining = VecDeque::new();
    for (protocol, satype) in [(PROTO_IPSEC_AH, SaType::Ah), (PROTO_IPSEC_ESP, SaType::Esp)] {
        if protocols.contains(&protocol) {
            remaining.push_back(satype);
        }
    }

    start_chain(
        SpiWait {
            session: wait.session,
            src: wait.request.src,
            dst: wait.request.dst,
            remaining,
            allocated: Vec::new(),
            purpose: SpiPurpose::Respond {
                proposal: index,
                transforms,
                protocols,
                reply: wait.reply,
            },
        },
        None,
        out,
    );
}

fn key_ext(kind: ExtType, key: &Zeroizing<Vec<u8>>) -> Option<KeyExt> {
    if key.is_empty() {
        return None;
    }
    Some(KeyExt {
        kind,
        bits: u16::try_from(key.len() * 8).unwrap_or(u16::MAX),
        key: key.clone(),
    })
}

fn lifetime_exts(msg: Message, lt: &P2Lifetimes) -> Message {
    msg.with(LifetimeExt::new(
        ExtType::LifetimeHard,
        u64::from(lt.hard_secs),
        u64::from(lt.hard_kb) << 10,
    ))
    .with(LifetimeExt::new(
        ExtType::LifetimeSoft,
        u64::from(lt.soft_secs),
        u64::from(lt.soft_kb) << 10,
    ))
    .with(LifetimeExt::new(
        ExtType::XLifetimeIdle,
        u64::from(lt.idle_secs),
        0,
    ))
}

fn install_request(
    kind: MsgType,
    satype: SaType,
    sa: &NegotiatedSa,
    inbound: bool,
    src: SocketAddr,
    dst: SocketAddr,
    lt: &P2Lifetimes,
) -> Message {
    let (auth, encrypt) = match satype {
        SaType::Ah => (sa.transform.transform_id, 0),
        _ => (
            pfkey_auth_alg(u16::from(sa.transform.auth_alg)).unwrap_or(0),
            sa.transform.transform_id,
        ),
    };
    let (spi, pair, keys, flags) = if inbound {
        (sa.inbound_spi, sa.outbound_spi, &sa.inbound_keys, saflags::INBOUND)
    } else {
        (sa.outbound_spi, sa.inbound_spi, &sa.outbound_keys, saflags::OUTBOUND)
    };

    let mut msg = Message::new(kind, satype)
        .with(SaExt {
            spi,
            replay: REPLAY_WINDOW,
            state: sastate::MATURE,
            auth,
            encrypt,
            flags,
        })
        .with(AddressExt::new(ExtType::AddressSrc, src))
        .with(AddressExt::new(ExtType::AddressDst, dst));
    msg = lifetime_exts(msg, lt);
    if let Some(k) = key_ext(ExtType::KeyAuth, &keys.auth) {
        msg = msg.with(k);
    }
    if let Some(k) = key_ext(ExtType::KeyEncrypt, &keys.encr) {
        msg = msg.with(k);
    }
    if !inbound {
        msg = msg.with(PairExt { spi: pair });
    }
    msg
}

/// Install the SA pairs of a finished Quick Mode
///
/// Each protocol gets an outbound ADD (carrying the ACQUIRE's sequence
/// number when we initiated) and an inbound UPDATE of the larval SA
/// reserved by GETSPI. The installed lifetime is the least of the rule's,
/// the peer's and the session's cached value.
pub fn phase2_done(mgr: &mut Phase1Manager, result: Phase2Result, out: &mut Actions) {
    let Some(session) = mgr.get_mut(result.session) else {
        warn!(negotiation = result.negotiation, "Phase-2 finished for a vanished session");
        return;
    };
    let rule = session.rule.p2_lifetimes;

    for sa in &result.sas {
        let Some(satype) = sa_type(sa.protocol) else {
            warn!(protocol = sa.protocol, "Negotiated SA of unknown protocol");
            continue;
        };

        let hard_secs = lesser_of(lesser_of(rule.hard_secs, sa.peer_secs), session.p2_lifetime_secs);
        let hard_kb = lesser_of(lesser_of(rule.hard_kb, sa.peer_kb), session.p2_lifetime_kb);
        let lifetimes = normalize_lifetimes(P2Lifetimes {
            hard_secs,
            soft_secs: rule.soft_secs,
            idle_secs: rule.idle_secs,
            hard_kb,
            soft_kb: rule.soft_kb,
        });
        session.p2_lifetime_secs = lifetimes.hard_secs;
        session.p2_lifetime_kb = lifetimes.hard_kb;

        let responder_lifetime = if result.initiator {
            None
        } else {
            let secs = if sa.peer_secs == 0 || lifetimes.hard_secs < sa.peer_secs {
                lifetimes.hard_secs
            } else {
                0
            };
            let kb = if sa.peer_kb != 0 && lifetimes.hard_kb < sa.peer_kb {
                lifetimes.hard_kb
            } else {
                0
            };
            (secs != 0 || kb != 0).then_some((secs, kb))
        };

        let wait = |spi: u32, inbound: bool, responder_lifetime| InstallWait {
            session: result.session,
            negotiation: result.negotiation,
            local: result.local,
            remote: result.remote,
            satype,
            spi,
            inbound,
            hard_secs: lifetimes.hard_secs,
            hard_kb: lifetimes.hard_kb,
            responder_lifetime,
        };

        let mut add = install_request(
            MsgType::Add,
            satype,
            sa,
            false,
            result.local,
            result.remote,
            &lifetimes,
        );
        if result.initiator {
            add.seq = result.acquire_seq;
        }
        out.push(Action::KernelRequest(
            add,
            Completion::Install(wait(sa.outbound_spi, false, None)),
        ));

        let update = install_request(
            MsgType::Update,
            satype,
            sa,
            true,
            result.remote,
            result.local,
            &lifetimes,
        );
        out.push(Action::KernelRequest(
            update,
            Completion::Install(wait(sa.inbound_spi, true, responder_lifetime)),
        ));
    }
}

/// Re-issue an inbound UPDATE whose larval SA already lapsed as an ADD
///
/// The ADD keeps the UPDATE's sequence number.
///
/// Returns the request and continuation back when the failure is something
/// else.
pub fn retry_as_add(
    request: Message,
    wait: InstallWait,
    reply: &Message,
    out: &mut Actions,
) -> Option<(Message, InstallWait)> {
    if reply.errno != errno::ESRCH || request.kind() != Some(MsgType::Update) {
        return Some((request, wait));
    }
    debug!(spi = %hex::encode(wait.spi.to_be_bytes()), "Larval SA gone, adding instead");
    let mut add = request;
    add.msg_type = MsgType::Add.to_u8();
    out.push(Action::KernelRequest(add, Completion::Install(wait)));
    None
}

/// DELETE undoing a failed ADD or UPDATE
///
/// Keeps only the SA and its addresses, so no keying material is echoed.
pub fn resync_request(request: &Message) -> Option<Message> {
    match request.kind()? {
        MsgType::Add | MsgType::Update => {}
        _ => return None,
    }
    let mut delete = request.clone();
    delete.retain(|e| {
        matches!(
            e.kind(),
            Some(ExtType::Sa) | Some(ExtType::AddressSrc) | Some(ExtType::AddressDst)
        )
    });
    delete.msg_type = MsgType::Delete.to_u8();
    delete.seq = 0;
    delete.errno = 0;
    delete.diagnostic = 0;
    Some(delete)
}

/// Undo a half-installed SA and tell the peer
pub fn resync(
    mgr: &Phase1Manager,
    request: &Message,
    wait: Option<&InstallWait>,
    metrics: &IkeMetrics,
    out: &mut Actions,
) {
    let Some(delete) = resync_request(request) else {
        return;
    };
    metrics.record_resync();
    warn!(seq = request.seq, satype = request.satype, "Resyncing half-installed SA");
    out.push(Action::KernelRequest(delete, Completion::Delete));

    if let Some(w) = wait {
        let target = mgr
            .get(w.session)
            .and_then(|s| s.negotiation)
            .map_or(
                NotifyTarget::Peer {
                    local: w.local,
                    remote: w.remote,
                },
                NotifyTarget::Negotiation,
            );
        out.push(Action::SendDelete(crate::negotiation::DeleteRequest {
            target,
            protocol: protocol_id(w.satype),
            spis: vec![w.spi],
        }));
    }
}

/// ADD/UPDATE reply for one half of an SA pair
pub fn on_install_reply(wait: InstallWait, ok: bool, metrics: &IkeMetrics, out: &mut Actions) {
    if !ok {
        warn!(
            spi = %hex::encode(wait.spi.to_be_bytes()),
            inbound = wait.inbound,
            "SA installation failed"
        );
        return;
    }
    log_sa_install(wait.spi, wait.inbound, wait.hard_secs, wait.hard_kb);
    metrics.record_sa_installed();
    if let Some((secs, kb)) = wait.responder_lifetime {
        out.push(Action::Notify(Notification::responder_lifetime(
            wait.negotiation,
            protocol_id(wait.satype),
            wait.spi,
            secs,
            kb,
        )));
    }
}

/// Lifetimes carried by a RESPONDER-LIFETIME notification
///
/// On malformed data the error is the notify type to answer with.
pub fn parse_lifetime_attributes(data: &[u8]) -> std::result::Result<(Option<u32>, Option<u32>), u16> {
    let mut secs = None;
    let mut kb = None;
    let mut selector: Option<u32> = None;
    let mut rest = data;

    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(notify::UNEQUAL_PAYLOAD_LENGTHS);
        }
        let raw = u16::from_be_bytes([rest[0], rest[1]]);
        let class = raw & 0x7fff;
        let value = if raw & 0x8000 != 0 {
            let v = u32::from(u16::from_be_bytes([rest[2], rest[3]]));
            rest = &rest[4..];
            v
        } else {
            let len = usize::from(u16::from_be_bytes([rest[2], rest[3]]));
            if len > 4 || rest.len() < 4 + len {
                return Err(notify::UNEQUAL_PAYLOAD_LENGTHS);
            }
            let v = rest[4..4 + len]
                .iter()
                .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
            rest = &rest[4 + len..];
            v
        };

        match class {
            ATTR_LIFE_TYPE => {
                if selector.is_some()
                    || (value != u32::from(LIFE_TYPE_SECONDS) && value != u32::from(LIFE_TYPE_KILOBYTES))
                {
                    return Err(notify::ATTRIBUTES_NOT_SUPPORTED);
                }
                selector = Some(value);
            }
            ATTR_LIFE_DURATION => {
                let slot = match selector.take() {
                    Some(s) if s == u32::from(LIFE_TYPE_SECONDS) => &mut secs,
                    Some(_) => &mut kb,
                    None => return Err(notify::ATTRIBUTES_NOT_SUPPORTED),
                };
                if slot.is_some() {
                    return Err(notify::ATTRIBUTES_NOT_SUPPORTED);
                }
                *slot = Some(value);
            }
            _ => {}
        }
    }
    Ok((secs, kb))
}

/// Peer shortened the lifetime of SAs we initiated
///
/// Values above the rule's are clamped and do not count as updates. When
/// something changed, the session cache is refreshed and the outbound SA
/// gets a lifetime-only UPDATE.
pub fn on_responder_lifetime(mgr: &mut Phase1Manager, notify: &ReceivedNotify, out: &mut Actions) {
    let Some(satype) = sa_type(notify.protocol) else {
        debug!(protocol = notify.protocol, "RESPONDER-LIFETIME for unknown protocol");
        return;
    };
    let Ok(spi_bytes) = <[u8; 4]>::try_from(notify.spi.as_slice()) else {
        debug!(len = notify.spi.len(), "RESPONDER-LIFETIME with odd SPI size");
        return;
    };
    let spi = u32::from_be_bytes(spi_bytes);

    let reject = |message_type: u16| Notification {
        target: NotifyTarget::Negotiation(notify.negotiation),
        protocol: notify.protocol,
        spi: notify.spi.clone(),
        message_type,
        data: Vec::new(),
    };
    let (secs, kb) = match parse_lifetime_attributes(&notify.data) {
        Ok((None, None)) => {
            out.push(Action::Notify(reject(notify::ATTRIBUTES_NOT_SUPPORTED)));
            return;
        }
        Ok(v) => v,
        Err(message_type) => {
            warn!(message_type, "Malformed RESPONDER-LIFETIME");
            out.push(Action::Notify(reject(message_type)));
            return;
        }
    };

    let Some(session) = mgr.get_mut(notify.session) else {
        return;
    };
    let rule = session.rule.p2_lifetimes;
    let clamp = |offered: Option<u32>, mine: u32| match offered {
        Some(v) if mine != 0 && v > mine => (mine, false),
        Some(v) => (v, true),
        None => (mine, false),
    };
    let (hard_secs, secs_updated) = clamp(secs, rule.hard_secs);
    let (hard_kb, kb_updated) = clamp(kb, rule.hard_kb);
    if !secs_updated && !kb_updated {
        return;
    }

    let lifetimes = normalize_lifetimes(P2Lifetimes {
        hard_secs,
        soft_secs: rule.soft_secs,
        idle_secs: rule.idle_secs,
        hard_kb,
        soft_kb: rule.soft_kb,
    });
    session.p2_lifetime_secs = lifetimes.hard_secs;
    session.p2_lifetime_kb = lifetimes.hard_kb;
    debug!(
        spi = %hex::encode(spi_bytes),
        secs = lifetimes.hard_secs,
        kb = lifetimes.hard_kb,
        "Peer shortened Phase-2 lifetime"
    );

    let update = Message::new(MsgType::Update, satype)
        .with(SaExt {
            spi,
            state: sastate::MATURE,
            ..SaExt::default()
        })
        .with(AddressExt::new(ExtType::AddressSrc, session.local))
        .with(AddressExt::new(ExtType::AddressDst, session.remote))
        .with(LifetimeExt::new(
            ExtType::LifetimeHard,
            u64::from(lifetimes.hard_secs),
            u64::from(lifetimes.hard_kb) << 10,
        ))
        .with(LifetimeExt::new(
            ExtType::LifetimeSoft,
            u64::from(lifetimes.soft_secs),
            u64::from(lifetimes.soft_kb) << 10,
        ));
    out.push(Action::KernelRequest(update, Completion::UpdateLifetime));
}

/// ACQUIRE that rekeys the SA behind a soft EXPIRE
///
/// Only SAs that carried traffic are rekeyed. An inbound SA whose soft
/// expiry is its timer (not its byte count) is left for the peer to
/// rekey. `wallclock` is seconds since the epoch, like the kernel's
/// add time.
pub fn rekey_acquire(
    expire: &Message,
    algs: &AlgorithmTable,
    is_local: impl Fn(&IpAddr) -> bool,
    wallclock: u64,
) -> Option<Message> {
    let sa = expire.sa()?;
    if sa.flags & saflags::USED == 0 {
        return None;
    }
    let satype = expire.sa_type()?;
    let current = expire.lifetime(ExtType::LifetimeCurrent)?;
    let soft = expire.lifetime(ExtType::LifetimeSoft)?;
    let mut src = expire.address(ExtType::AddressSrc)?;
    let mut dst = expire.address(ExtType::AddressDst)?;
    let mut inner_src = expire.address(ExtType::InnerSrc);
    let mut inner_dst = expire.address(ExtType::InnerDst);

    let inbound = !is_local(&src.ip());
    if inbound {
        std::mem::swap(&mut src, &mut dst);
        std::mem::swap(&mut inner_src, &mut inner_dst);
        let soft_at = current.addtime.saturating_add(soft.addtime);
        if soft.addtime != 0 && wallclock.abs_diff(soft_at) < SOFT_EXPIRE_SLACK_SECS {
            debug!(spi = %hex::encode(sa.spi.to_be_bytes()), "Inbound soft expire left to the peer");
            return None;
        }
    }

    let desc = |algtype: AlgType, alg: u8| {
        let (minbits, maxbits) = algs
            .find(satype.to_u8(), algtype.to_u8(), alg)
            .map_or((0, 0), |a| (a.minbits, a.maxbits));
        AlgDesc {
            satype: satype.to_u8(),
            algtype: algtype.to_u8(),
            alg,
            minbits,
            maxbits,
        }
    };
    let mut descs = Vec::new();
    if sa.auth != 0 {
        descs.push(desc(AlgType::Auth, sa.auth));
    }
    if sa.encrypt != 0 {
        descs.push(desc(AlgType::Crypt, sa.encrypt));
    }
    if descs.is_empty() {
        return None;
    }

    let comb = Ecomb {
        flags: (sa.flags & 0xffff) as u16,
        hard_addtime: u64::from(DEF_P2_LIFETIME_HARD),
        algs: descs,
        ..Ecomb::default()
    };
    let mut acquire = Message::new(MsgType::Acquire, satype)
        .with(AddressExt::new(ExtType::AddressSrc, src))
        .with(AddressExt::new(ExtType::AddressDst, dst))
        .with(EpropExt {
            replay: sa.replay,
            combs: vec![comb],
        });
    if let Some(a) = inner_src {
        acquire = acquire.with(AddressExt::new(ExtType::InnerSrc, a));
    }
    if let Some(a) = inner_dst {
        acquire = acquire.with(AddressExt::new(ExtType::InnerDst, a));
    }
    Some(acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::negotiation::{PeerProposal, PeerProtocol, Phase1Info, ProposedSa, SaKeys};
    use crate::pfkey::constants::{aalg, ealg};
    use crate::pfkey::message::{SupportedAlg, SupportedExt};
    use crate::policy::{AddressSpec, Rule, Rulebase};
    use std::time::Instant;
    use tokio::sync::oneshot;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn table() -> AlgorithmTable {
        let alg = |id, minbits, maxbits, increment| SupportedAlg {
            id,
            ivlen: 16,
            minbits,
            maxbits,
            increment,
            saltbits: 0,
        };
        let mut t = AlgorithmTable::new();
        t.update_from_register(
            &Message::new(MsgType::Register, SaType::Esp)
                .with(SupportedExt {
                    kind: ExtType::SupportedAuth,
                    algs: vec![alg(aalg::SHA1_HMAC, 160, 160, 0)],
                })
                .with(SupportedExt {
                    kind: ExtType::SupportedEncrypt,
                    algs: vec![alg(ealg::AES_CBC, 128, 256, 64)],
                }),
        );
        t
    }

    fn esp_eprop() -> EpropExt {
        let d = |algtype: AlgType, alg| AlgDesc {
            satype: SaType::Esp.to_u8(),
            algtype: algtype.to_u8(),
            alg,
            minbits: 128,
            maxbits: 256,
        };
        EpropExt {
            replay: 32,
            combs: vec![Ecomb {
                hard_addtime: 3600,
                algs: vec![d(AlgType::Auth, aalg::SHA1_HMAC), d(AlgType::Crypt, ealg::AES_CBC)],
                ..Ecomb::default()
            }],
        }
    }

    fn acquire(seq: u32) -> Message {
        Message::new(MsgType::Acquire, SaType::Esp)
            .with_seq(seq)
            .with(AddressExt::new(ExtType::AddressSrc, sa("10.0.0.1:0")))
            .with(AddressExt::new(ExtType::AddressDst, sa("10.0.0.2:0")))
            .with(esp_eprop())
    }

    fn established() -> (Phase1Manager, SessionHandle) {
        let mut mgr = Phase1Manager::new(&DaemonConfig::default(), IkeMetrics::new());
        let rulebase: Rulebase = [Rule::new("any").with_addresses(AddressSpec::any(), AddressSpec::any())]
            .into_iter()
            .collect();
        let h = mgr
            .new_responder_session(
                &rulebase,
                7,
                sa("10.0.0.1:500"),
                sa("10.0.0.2:500"),
                crate::policy::ExchangeMode::Main,
            )
            .unwrap();
        let mut out = Actions::new();
        mgr.on_established(
            h,
            Phase1Info {
                negotiation: 7,
                cookie_i: [1; 8],
                cookie_r: [2; 8],
                local_id: None,
                remote_id: None,
                peer_dpd: false,
                lifetime_secs: 0,
            },
            Instant::now(),
            &mut out,
        );
        (mgr, h)
    }

    fn getspi_reply(request: &Message, spi: u32) -> Message {
        let mut reply = request.clone().with(SaExt {
            spi,
            ..SaExt::default()
        });
        reply.seq = 9;
        reply
    }

    #[test]
    fn test_start_phase2_chains_spi_then_initiates() {
        let (mgr, h) = established();
        let algs = table();
        let mut out = Actions::new();
        start_phase2(&mgr, &algs, h, acquire(41), &mut out);

        let (request, wait) = match out.pop() {
            Some(Action::KernelRequest(m, Completion::GetSpi(w))) => (m, w),
            other => panic!("expected GETSPI, got {:?}", other),
        };
        assert_eq!(request.kind(), Some(MsgType::GetSpi));
        assert_eq!(request.address(ExtType::AddressSrc), Some(sa("10.0.0.2:0")));
        assert_eq!(request.address(ExtType::AddressDst), Some(sa("10.0.0.1:0")));

        on_getspi_reply(&mgr, wait, &getspi_reply(&request, 0x1234), true, &mut out);
        match out.pop() {
            Some(Action::InitiatePhase2(req)) => {
                assert_eq!(req.negotiation, 7);
                assert_eq!(req.acquire_seq, 41);
                assert_eq!(req.proposals[0].protocols[0].spi, 0x1234);
            }
            other => panic!("expected Quick Mode, got {:?}", other),
        }
    }

    #[test]
    fn test_start_phase2_nacks_unusable_acquire() {
        let (mgr, h) = established();
        let mut out = Actions::new();
        // Empty algorithm table: no combination survives
        start_phase2(&mgr, &AlgorithmTable::new(), h, acquire(5), &mut out);
        match out.pop() {
            Some(Action::KernelSend(nack)) => {
                assert_eq!(nack.seq, 5);
                assert_eq!(nack.errno, errno::EINVAL);
            }
            other => panic!("expected negative ACQUIRE, got {:?}", other),
        }
    }

    #[test]
    fn test_getspi_failure_nacks() {
        let (mgr, h) = established();
        let algs = table();
        let mut out = Actions::new();
        start_phase2(&mgr, &algs, h, acquire(6), &mut out);
        let Some(Action::KernelRequest(request, Completion::GetSpi(wait))) = out.pop() else {
            panic!("expected GETSPI");
        };
        let mut reply = request.header_only();
        reply.errno = errno::ENOMEM;
        on_getspi_reply(&mgr, wait, &reply, false, &mut out);
        match out.pop() {
            Some(Action::KernelSend(nack)) => assert_eq!(nack.errno, errno::ENOMEM),
            other => panic!("expected negative ACQUIRE, got {:?}", other),
        }
    }

    #[test]
    fn test_inverse_acquire_selects_and_replies() {
        let (mgr, h) = established();
        let (tx, mut rx) = oneshot::channel();
        let request = SelectRequest {
            negotiation: 8,
            session: h,
            src: sa("10.0.0.2:0"),
            dst: sa("10.0.0.1:0"),
            proposals: vec![PeerProposal {
                number: 1,
                protocols: vec![PeerProtocol {
                    protocol: PROTO_IPSEC_ESP,
                    spi: 0xaaaa,
                    transforms: vec![ProposedSa {
                        transform_id: ealg::AES_CBC,
                        auth_alg: 2,
                        key_bits: 128,
                    }],
                }],
            }],
        };
        let inverse = inverse_acquire_request(&request);
        assert_eq!(inverse.address(ExtType::AddressSrc), Some(sa("10.0.0.1:0")));

        let reply = Message::new(MsgType::Acquire, SaType::Unspec).with(esp_eprop());
        let mut out = Actions::new();
        on_inverse_acquire_reply(
            SelectWait {
                session: h,
                request,
                reply: tx,
            },
            &reply,
            true,
            &mut out,
        );
        let Some(Action::KernelRequest(getspi, Completion::GetSpi(wait))) = out.pop() else {
            panic!("expected GETSPI");
        };
        assert_eq!(getspi.sa_type(), Some(SaType::Esp));
        on_getspi_reply(&mgr, wait, &getspi_reply(&getspi, 0x77), true, &mut out);

        assert_eq!(
            rx.try_recv().unwrap(),
            SelectOutcome::Selection {
                proposal: 0,
                transforms: vec![0],
                spis: vec![0x77],
            }
        );
    }

    #[test]
    fn test_inverse_acquire_without_policy() {
        let (_mgr, h) = established();
        let (tx, mut rx) = oneshot::channel();
        let request = SelectRequest {
            negotiation: 8,
            session: h,
            src: sa("10.0.0.2:0"),
            dst: sa("10.0.0.1:0"),
            proposals: Vec::new(),
        };
        let mut reply = Message::new(MsgType::XInverseAcquire, SaType::Unspec);
        reply.errno = errno::ENOENT;
        let mut out = Actions::new();
        on_inverse_acquire_reply(
            SelectWait {
                session: h,
                request,
                reply: tx,
            },
            &reply,
            false,
            &mut out,
        );
        assert!(out.is_empty());
        assert_eq!(rx.try_recv().unwrap(), SelectOutcome::NoProposalChosen);
    }

    fn negotiated(peer_secs: u32, peer_kb: u32) -> NegotiatedSa {
        NegotiatedSa {
            protocol: PROTO_IPSEC_ESP,
            inbound_spi: 0x100,
            outbound_spi: 0x200,
            transform: ProposedSa {
                transform_id: ealg::AES_CBC,
                auth_alg: 2,
                key_bits: 128,
            },
            encap: 1,
            peer_secs,
            peer_kb,
            outbound_keys: SaKeys {
                auth: Zeroizing::new(vec![1; 20]),
                encr: Zeroizing::new(vec![2; 16]),
            },
            inbound_keys: SaKeys {
                auth: Zeroizing::new(vec![3; 20]),
                encr: Zeroizing::new(vec![4; 16]),
            },
        }
    }

    fn result(initiator: bool, sas: Vec<NegotiatedSa>, h: SessionHandle) -> Phase2Result {
        Phase2Result {
            negotiation: 9,
            session: h,
            local: sa("10.0.0.1:500"),
            remote: sa("10.0.0.2:500"),
            acquire_seq: if initiator { 41 } else { 0 },
            initiator,
            sas,
        }
    }

    #[test]
    fn test_phase2_done_installs_pair() {
        let (mut mgr, h) = established();
        let mut out = Actions::new();
        phase2_done(&mut mgr, result(true, vec![negotiated(0, 0)], h), &mut out);
        assert_eq!(out.len(), 2);

        match &out[0] {
            Action::KernelRequest(add, Completion::Install(w)) => {
                assert_eq!(add.kind(), Some(MsgType::Add));
                assert_eq!(add.seq, 41);
                let ext = add.sa().unwrap();
                assert_eq!(ext.spi, 0x200);
                assert_eq!(ext.auth, aalg::SHA1_HMAC);
                assert_eq!(ext.encrypt, ealg::AES_CBC);
                assert_eq!(add.address(ExtType::AddressDst), Some(sa("10.0.0.2:500")));
                assert!(add.has(ExtType::KeyEncrypt));
                assert!(!w.inbound);
                assert_eq!(w.hard_secs, 3600);
            }
            other => panic!("expected ADD, got {:?}", other),
        }
        match &out[1] {
            Action::KernelRequest(update, Completion::Install(w)) => {
                assert_eq!(update.kind(), Some(MsgType::Update));
                assert_eq!(update.seq, 0);
                assert_eq!(update.sa().unwrap().spi, 0x100);
                assert!(w.inbound);
                assert!(w.responder_lifetime.is_none());
            }
            other => panic!("expected UPDATE, got {:?}", other),
        }
        assert_eq!(mgr.get(h).unwrap().p2_lifetime_secs, 3600);
    }

    #[test]
    fn test_responder_shorter_lifetime_notifies() {
        let (mut mgr, h) = established();
        let mut out = Actions::new();
        phase2_done(&mut mgr, result(false, vec![negotiated(172_800, 0)], h), &mut out);

        let Action::KernelRequest(_, Completion::Install(inbound)) = &out[1] else {
            panic!("expected inbound install");
        };
        assert_eq!(inbound.responder_lifetime, Some((3600, 0)));

        let mut notes = Actions::new();
        on_install_reply(inbound.clone(), true, &IkeMetrics::new(), &mut notes);
        match notes.pop() {
            Some(Action::Notify(n)) => {
                assert_eq!(n.message_type, notify::RESPONDER_LIFETIME);
                assert_eq!(n.spi, 0x100u32.to_be_bytes().to_vec());
            }
            other => panic!("expected RESPONDER-LIFETIME, got {:?}", other),
        }
    }

    #[test]
    fn test_cached_lifetime_wins() {
        let (mut mgr, h) = established();
        mgr.get_mut(h).unwrap().p2_lifetime_secs = 600;
        let mut out = Actions::new();
        phase2_done(&mut mgr, result(true, vec![negotiated(1200, 0)], h), &mut out);
        let Action::KernelRequest(add, _) = &out[0] else {
            panic!("expected ADD");
        };
        assert_eq!(add.lifetime(ExtType::LifetimeHard).unwrap().addtime, 600);
    }

    #[test]
    fn test_update_retried_as_add_on_esrch() {
        let (mut mgr, h) = established();
        let mut out = Actions::new();
        phase2_done(&mut mgr, result(true, vec![negotiated(0, 0)], h), &mut out);
        let Some(Action::KernelRequest(update, Completion::Install(wait))) = out.pop() else {
            panic!("expected UPDATE");
        };

        let mut reply = update.header_only();
        reply.errno = errno::ESRCH;
        let mut retried = Actions::new();
        assert!(retry_as_add(update, wait, &reply, &mut retried).is_none());
        match retried.pop() {
            Some(Action::KernelRequest(add, Completion::Install(w))) => {
                assert_eq!(add.kind(), Some(MsgType::Add));
                assert!(w.inbound);
            }
            other => panic!("expected ADD, got {:?}", other),
        }
    }

    #[test]
    fn test_resync_strips_keys() {
        let (mut mgr, h) = established();
        let mut out = Actions::new();
        phase2_done(&mut mgr, result(true, vec![negotiated(0, 0)], h), &mut out);
        let Action::KernelRequest(add, Completion::Install(wait)) = &out[0] else {
            panic!("expected ADD");
        };

        let mut actions = Actions::new();
        resync(&mgr, add, Some(wait), &IkeMetrics::new(), &mut actions);
        match &actions[0] {
            Action::KernelRequest(delete, Completion::Delete) => {
                assert_eq!(delete.kind(), Some(MsgType::Delete));
                assert!(!delete.has(ExtType::KeyAuth));
                assert!(!delete.has(ExtType::KeyEncrypt));
                assert!(!delete.has(ExtType::LifetimeHard));
                assert_eq!(delete.sa().unwrap().spi, 0x200);
            }
            other => panic!("expected DELETE, got {:?}", other),
        }
        match &actions[1] {
            Action::SendDelete(req) => {
                assert_eq!(req.target, NotifyTarget::Negotiation(7));
                assert_eq!(req.spis, vec![0x200]);
            }
            other => panic!("expected peer DELETE, got {:?}", other),
        }
        assert!(resync_request(&Message::new(MsgType::GetSpi, SaType::Esp)).is_none());
    }

    #[test]
    fn test_parse_lifetime_attributes() {
        let data = crate::negotiation::encode_lifetime_attributes(600, 100_000);
        assert_eq!(parse_lifetime_attributes(&data), Ok((Some(600), Some(100_000))));
        assert_eq!(parse_lifetime_attributes(&[]), Ok((None, None)));

        // Duration with no preceding life type
        let orphan = [0x80, 0x0c, 0x02, 0x58];
        assert_eq!(
            parse_lifetime_attributes(&orphan),
            Err(notify::ATTRIBUTES_NOT_SUPPORTED)
        );
        // Unknown life type
        let bad_type = [0x80, 0x0b, 0x00, 0x07];
        assert_eq!(
            parse_lifetime_attributes(&bad_type),
            Err(notify::ATTRIBUTES_NOT_SUPPORTED)
        );
        // Truncated variable-length value
        let truncated = [0x80, 0x0b, 0x00, 0x01, 0x00, 0x0c, 0x00, 0x04, 0x00];
        assert_eq!(
            parse_lifetime_attributes(&truncated),
            Err(notify::UNEQUAL_PAYLOAD_LENGTHS)
        );
        // Seconds given twice
        let mut twice = crate::negotiation::encode_lifetime_attributes(600, 0);
        twice.extend(crate::negotiation::encode_lifetime_attributes(700, 0));
        assert_eq!(
            parse_lifetime_attributes(&twice),
            Err(notify::ATTRIBUTES_NOT_SUPPORTED)
        );
    }

    fn lifetime_notify(h: SessionHandle, data: Vec<u8>) -> ReceivedNotify {
        ReceivedNotify {
            negotiation: 9,
            session: h,
            protocol: PROTO_IPSEC_ESP,
            spi: 0x200u32.to_be_bytes().to_vec(),
            message_type: notify::RESPONDER_LIFETIME,
            data,
        }
    }

    #[test]
    fn test_responder_lifetime_updates_outbound_sa() {
        let (mut mgr, h) = established();
        let data = crate::negotiation::encode_lifetime_attributes(600, 0);
        let mut out = Actions::new();
        on_responder_lifetime(&mut mgr, &lifetime_notify(h, data), &mut out);

        match out.pop() {
            Some(Action::KernelRequest(update, Completion::UpdateLifetime)) => {
                assert_eq!(update.kind(), Some(MsgType::Update));
                assert_eq!(update.sa().unwrap().spi, 0x200);
                assert_eq!(update.lifetime(ExtType::LifetimeHard).unwrap().addtime, 600);
            }
            other => panic!("expected lifetime UPDATE, got {:?}", other),
        }
        assert_eq!(mgr.get(h).unwrap().p2_lifetime_secs, 600);
    }

    #[test]
    fn test_responder_lifetime_above_rule_ignored() {
        let (mut mgr, h) = established();
        let data = crate::negotiation::encode_lifetime_attributes(172_800, 0);
        let mut out = Actions::new();
        on_responder_lifetime(&mut mgr, &lifetime_notify(h, data), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_responder_lifetime_malformed_answered() {
        let (mut mgr, h) = established();
        let mut out = Actions::new();
        on_responder_lifetime(&mut mgr, &lifetime_notify(h, vec![0x80, 0x0c, 0, 1]), &mut out);
        match out.pop() {
            Some(Action::Notify(n)) => assert_eq!(n.message_type, notify::ATTRIBUTES_NOT_SUPPORTED),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    fn soft_expire(src: &str, dst: &str, flags: u32, added: u64, soft: u64) -> Message {
        Message::new(MsgType::Expire, SaType::Esp)
            .with(SaExt {
                spi: 0x300,
                replay: 32,
                state: sastate::DYING,
                auth: aalg::SHA1_HMAC,
                encrypt: ealg::AES_CBC,
                flags,
            })
            .with(LifetimeExt::new(ExtType::LifetimeCurrent, added, 0))
            .with(LifetimeExt::new(ExtType::LifetimeSoft, soft, 0))
            .with(AddressExt::new(ExtType::AddressSrc, sa(src)))
            .with(AddressExt::new(ExtType::AddressDst, sa(dst)))
    }

    #[test]
    fn test_rekey_acquire_from_soft_expire() {
        let local: IpAddr = "10.0.0.1".parse().unwrap();
        let is_local = |a: &IpAddr| *a == local;
        let algs = table();

        let outbound = soft_expire("10.0.0.1:0", "10.0.0.2:0", saflags::USED, 1000, 3240);
        let acquire = rekey_acquire(&outbound, &algs, is_local, 4240).unwrap();
        assert_eq!(acquire.kind(), Some(MsgType::Acquire));
        assert_eq!(acquire.seq, 0);
        assert_eq!(acquire.address(ExtType::AddressSrc), Some(sa("10.0.0.1:0")));
        let eprop = acquire.get::<EpropExt>(ExtType::XEprop).unwrap();
        assert_eq!(eprop.combs[0].hard_addtime, 3600);
        assert_eq!(eprop.combs[0].algs.len(), 2);
        assert_eq!(eprop.combs[0].algs[1].maxbits, 256);

        // Unused SAs are not rekeyed
        let idle = soft_expire("10.0.0.1:0", "10.0.0.2:0", 0, 1000, 3240);
        assert!(rekey_acquire(&idle, &algs, is_local, 4240).is_none());

        // Inbound timer expiry belongs to the peer; a byte-count one is ours
        let inbound = soft_expire("10.0.0.2:0", "10.0.0.1:0", saflags::USED, 1000, 3240);
        assert!(rekey_acquire(&inbound, &algs, is_local, 4242).is_none());
        let acquire = rekey_acquire(&inbound, &algs, is_local, 2000).unwrap();
        assert_eq!(acquire.address(ExtType::AddressDst), Some(sa("10.0.0.2:0")));
    }
}
