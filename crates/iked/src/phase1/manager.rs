//! Phase-1 lifecycle manager
//!
//! Owns the session table and the per-local-address initial-contact caches,
//! and runs DPD. Every entry point takes `&mut Actions` and leaves the side
//! effects (kernel writes, engine calls, timers) to the daemon.
//!
//! Kernel work handed to [`Phase1Manager::get_or_create_session`] is always
//! consumed: it is dispatched, queued on a session, or negatively
//! acknowledged.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::action::{Action, Actions, TimerEvent};
use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::logging::{
    log_dpd_probe, log_dpd_result, log_negative_acquire, log_session_created, log_session_state,
};
use crate::metrics::IkeMetrics;
use crate::negotiation::{NegotiationId, Notification, Phase1Info, Phase1Request};
use crate::pfkey::constants::{errno, saflags, sastate, ExtType, IdentType, MsgType, SaType};
use crate::pfkey::engine::Completion;
use crate::pfkey::message::{same_family, AddressExt, EpropExt, IdentExt, LifetimeExt, Message, SaExt};
use crate::phase1::addrcache::AddressCache;
use crate::phase1::dpd::{decode_seq, DpdStatus};
use crate::phase1::session::{Phase1Session, PendingWork, SessionHandle, SessionState, SessionTable};
use crate::policy::addr::is_multicast;
use crate::policy::lifetime::adopt_acquire_lifetimes;
use crate::policy::{addr_equal, ExchangeMode, IdType, Identity, Phase1Proposal, RuleQuery, Rulebase};

/// What became of work handed to [`Phase1Manager::get_or_create_session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// An established session took the work at once
    Ready(SessionHandle),
    /// The work is queued on a larval session
    Pending(SessionHandle),
    /// The work was negatively acknowledged
    Failed,
}

/// Session table, address caches and DPD driver
#[derive(Debug)]
pub struct Phase1Manager {
    sessions: SessionTable,
    addrcaches: HashMap<IpAddr, AddressCache>,
    dpd_retry_interval: Duration,
    dpd_retry_limit: u32,
    initial_contact_pause: Duration,
    metrics: IkeMetrics,
}

/// Map a kernel identity extension onto a policy identity
pub fn kernel_identity(ext: &IdentExt) -> Option<Identity> {
    let v6 = ext.value.contains(':');
    let id_type = match IdentType::from_u16(ext.id_type)? {
        IdentType::Prefix if v6 => IdType::Ipv6Prefix,
        IdentType::Prefix => IdType::Ipv4Prefix,
        IdentType::AddrRange if v6 => IdType::Ipv6Range,
        IdentType::AddrRange => IdType::Ipv4Range,
        IdentType::Fqdn => IdType::Fqdn,
        IdentType::UserFqdn => IdType::UserFqdn,
        IdentType::DerDn => IdType::DerAsn1Dn,
        IdentType::KeyId => IdType::KeyId,
        IdentType::Reserved | IdentType::DerGn => return None,
    };
    Some(Identity::new(id_type, ext.value.clone()))
}

/// X_UPDATEPAIR or X_DELPAIR for the SA pair behind an idle EXPIRE
///
/// UPDATEPAIR re-arms the idle lifetime the kernel reported.
pub fn pair_request(kind: MsgType, trigger: &Message) -> Option<Message> {
    let sa = trigger.sa()?;
    let src = trigger.address(ExtType::AddressSrc)?;
    let dst = trigger.address(ExtType::AddressDst)?;

    let mut msg = Message::new(kind, SaType::Unspec)
        .with(SaExt {
            spi: sa.spi,
            state: sastate::MATURE,
            ..SaExt::default()
        })
        .with(AddressExt::new(ExtType::AddressDst, dst))
        .with(AddressExt::new(ExtType::AddressSrc, src));
    msg.satype = trigger.satype;
    if kind == MsgType::XUpdatePair {
        let idle = trigger
            .lifetime(ExtType::XLifetimeIdle)
            .map_or(0, |l| l.addtime);
        msg = msg.with(LifetimeExt::new(ExtType::XLifetimeIdle, idle, 0));
    }
    Some(msg)
}

impl Phase1Manager {
    /// Create a manager using `config`'s DPD and initial-contact settings
    pub fn new(config: &DaemonConfig, metrics: IkeMetrics) -> Self {
        Self {
            sessions: SessionTable::new(),
            addrcaches: HashMap::new(),
            dpd_retry_interval: config.dpd_retry_interval,
            dpd_retry_limit: config.dpd_retry_limit,
            initial_contact_pause: config.initial_contact_pause,
            metrics,
        }
    }

    /// Session behind `handle`
    pub fn get(&self, handle: SessionHandle) -> Option<&Phase1Session> {
        self.sessions.get(handle)
    }

    /// Mutable session behind `handle`
    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Phase1Session> {
        self.sessions.get_mut(handle)
    }

    /// Every live session
    pub fn sessions(&self) -> impl Iterator<Item = (SessionHandle, &Phase1Session)> {
        self.sessions.iter()
    }

    /// Live session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Initial-contact cache for a local address, if one was ever used
    pub fn address_cache(&self, local: &IpAddr) -> Option<&AddressCache> {
        self.addrcaches.get(local)
    }

    /// Find a session by endpoints, and optionally identities and rule cookie
    ///
    /// Sessions marked expiring are skipped unless `allow_expiring` is set.
    pub fn find_session(
        &self,
        local: &SocketAddr,
        remote: &SocketAddr,
        local_id: Option<&Identity>,
        remote_id: Option<&Identity>,
        cookie: Option<u32>,
        allow_expiring: bool,
    ) -> Option<SessionHandle> {
        self.sessions
            .iter()
            .find(|(_, s)| {
                (allow_expiring || s.state != SessionState::Expiring)
                    && addr_equal(&s.local, local)
                    && addr_equal(&s.remote, remote)
                    && id_compatible(s.local_id.as_ref(), local_id)
                    && id_compatible(s.remote_id.as_ref(), remote_id)
                    && cookie.map_or(true, |c| s.rule.cookie == c)
            })
            .map(|(h, _)| h)
    }

    /// Route kernel work to a session, creating one if needed
    ///
    /// An existing session keeps `want_phase2` once set. A new session works
    /// on a private clone of `rulebase` and starts a Phase-1 as initiator.
    pub fn get_or_create_session(
        &mut self,
        rulebase: &Rulebase,
        work: PendingWork,
        want_phase2: bool,
        now: Instant,
        out: &mut Actions,
    ) -> SessionOutcome {
        let Some((local, remote)) = work.endpoints() else {
            self.nack(work, errno::EINVAL, "missing addresses", out);
            return SessionOutcome::Failed;
        };
        if is_multicast(&remote) {
            self.nack(work, errno::ENETUNREACH, "multicast destination", out);
            return SessionOutcome::Failed;
        }
        if !same_family(&local.ip(), &remote.ip()) {
            self.nack(work, errno::EAFNOSUPPORT, "mixed address families", out);
            return SessionOutcome::Failed;
        }

        let cookie = work.message().km_cookie();
        if let Some(handle) = self.find_session(&local, &remote, None, None, cookie, false) {
            return self.attach(handle, work, want_phase2, now, out);
        }

        let local_id = work
            .message()
            .get::<IdentExt>(ExtType::IdentitySrc)
            .and_then(|e| kernel_identity(&e));
        let remote_id = work
            .message()
            .get::<IdentExt>(ExtType::IdentityDst)
            .and_then(|e| kernel_identity(&e));

        let mut candidates = rulebase.clone();
        let query = RuleQuery {
            local: &local,
            remote: &remote,
            cookie,
            local_id: local_id.as_ref(),
            remote_id: remote_id.as_ref(),
        };
        let Some(selected) = candidates.select_rule(&query) else {
            self.nack(work, errno::ENOENT, "no matching rule", out);
            return SessionOutcome::Failed;
        };

        let mut rule = (*selected).clone();
        if let PendingWork::Acquire(acquire) = &work {
            if let Some(comb) = acquire
                .get::<EpropExt>(ExtType::XEprop)
                .and_then(|e| e.combs.into_iter().next())
            {
                rule.p2_lifetimes = adopt_acquire_lifetimes(rule.p2_lifetimes, &comb);
            }
        }

        let request_local_id = rule
            .local_id
            .construct_id()
            .or_else(|| Some(Identity::from_addr(&local)));
        let request_remote_id = rule.remote_id.construct_id();
        let mode = rule.mode;
        let proposals = rule.phase1_proposals();

        let mut session = Phase1Session::new(local, remote, rule, candidates, true);
        session.cookie_i = rand::random();
        session.want_phase2 = want_phase2;
        session.local_id = request_local_id.clone();
        session.remote_id = request_remote_id.clone();

        let pause = self.initial_contact_pause;
        let cache = self.addrcaches.entry(local.ip()).or_default();
        let initial_contact = want_phase2 && cache.check(&remote, now).is_none();
        cache.add(&remote, now + pause, now);

        log_session_created(&local, &remote, &session.rule.label, true);
        self.metrics.record_session_created();
        self.metrics.record_p1_attempt(true);

        session.pending.push_back(work);
        let handle = self.sessions.insert(session);
        out.push(Action::Initiate(Phase1Request {
            session: handle,
            local,
            remote,
            mode,
            proposals,
            local_id: request_local_id,
            remote_id: request_remote_id,
            initial_contact,
        }));
        SessionOutcome::Pending(handle)
    }

    fn attach(
        &mut self,
        handle: SessionHandle,
        work: PendingWork,
        want_phase2: bool,
        now: Instant,
        out: &mut Actions,
    ) -> SessionOutcome {
        let Some(session) = self.sessions.get_mut(handle) else {
            self.nack(work, errno::EPERM, "session vanished", out);
            return SessionOutcome::Failed;
        };
        session.want_phase2 |= want_phase2;
        if session.is_established() {
            self.dispatch(handle, work, now, out);
            SessionOutcome::Ready(handle)
        } else {
            debug!(remote = %session.remote, "Work queued on larval session");
            session.pending.push_back(work);
            SessionOutcome::Pending(handle)
        }
    }

    fn dispatch(&mut self, handle: SessionHandle, work: PendingWork, now: Instant, out: &mut Actions) {
        match work {
            PendingWork::Acquire(acquire) => out.push(Action::StartPhase2 {
                session: handle,
                acquire,
            }),
            PendingWork::Dpd(expire) => self.dpd_trigger(handle, expire, now, out),
        }
    }

    /// Accept a peer's Phase-1 as responder
    ///
    /// The session's candidate set keeps only the rules admitting `mode` and
    /// both endpoints.
    pub fn new_responder_session(
        &mut self,
        rulebase: &Rulebase,
        negotiation: NegotiationId,
        local: SocketAddr,
        remote: SocketAddr,
        mode: ExchangeMode,
    ) -> Result<SessionHandle> {
        if rulebase.is_empty() {
            return Err(Error::NoMatchingRule);
        }
        let mut candidates = rulebase.clone();
        candidates.prune_for_responder(mode, &local, &remote);
        let rule = candidates
            .get(0)
            .map(|r| (**r).clone())
            .ok_or(Error::NoMatchingRule)?;

        log_session_created(&local, &remote, &rule.label, false);
        self.metrics.record_session_created();
        self.metrics.record_p1_attempt(false);

        let mut session = Phase1Session::new(local, remote, rule, candidates, false);
        session.negotiation = Some(negotiation);
        session.want_phase2 = true;
        Ok(self.sessions.insert(session))
    }

    /// Pick one of a peer's Phase-1 proposals
    ///
    /// Candidates that cannot accept the choice are pruned; a responder
    /// session's rule becomes the first survivor.
    pub fn select_phase1_proposal(
        &mut self,
        handle: SessionHandle,
        proposals: &[Phase1Proposal],
    ) -> Option<usize> {
        let session = self.sessions.get_mut(handle)?;
        let chosen = session.rulebase.select_phase1_proposal(proposals)?;
        if !session.initiator {
            if let Some(rule) = session.rulebase.get(0) {
                session.rule = (**rule).clone();
            }
        }
        Some(chosen)
    }

    /// Phase-1 completed: record the outcome and drain queued work in order
    pub fn on_established(
        &mut self,
        handle: SessionHandle,
        info: Phase1Info,
        now: Instant,
        out: &mut Actions,
    ) {
        let pause = self.initial_contact_pause;
        let Some(session) = self.sessions.get_mut(handle) else {
            return;
        };
        let from = session.state;
        session.cookie_i = info.cookie_i;
        session.cookie_r = info.cookie_r;
        if info.local_id.is_some() {
            session.local_id = info.local_id;
        }
        if info.remote_id.is_some() {
            session.remote_id = info.remote_id;
        }
        session.negotiation = Some(info.negotiation);
        session.dpd.set_peer_supports(info.peer_dpd);
        session.state = SessionState::Established;
        log_session_state(
            &session.cookie_i,
            &session.cookie_r,
            from.as_str(),
            SessionState::Established.as_str(),
        );
        self.metrics.record_p1_success(session.initiator);

        let cache = self.addrcaches.entry(session.local.ip()).or_default();
        if !session.initiator && session.want_phase2 && cache.check(&session.remote, now).is_none() {
            out.push(Action::Notify(Notification::initial_contact(
                info.negotiation,
                session.cookies(),
            )));
        }
        let lifetime = match info.lifetime_secs {
            0 => pause,
            secs => Duration::from_secs(u64::from(secs)),
        };
        cache.add(&session.remote, now + lifetime, now);

        let queued: Vec<PendingWork> = session.pending.drain(..).collect();
        for work in queued {
            self.dispatch(handle, work, now, out);
        }
    }

    /// Phase-1 failed before completing
    pub fn on_phase1_failed(&mut self, handle: SessionHandle, out: &mut Actions) {
        if let Some(session) = self.sessions.get(handle) {
            info!(remote = %session.remote, "Phase 1 negotiation failed");
            self.metrics.record_p1_failure(session.initiator);
        }
        self.teardown(handle, false, out);
    }

    /// Keep new work off a session that is about to go away
    pub fn mark_expiring(&mut self, handle: SessionHandle) {
        if let Some(session) = self.sessions.get_mut(handle) {
            let from = session.state;
            session.state = SessionState::Expiring;
            log_session_state(
                &session.cookie_i,
                &session.cookie_r,
                from.as_str(),
                SessionState::Expiring.as_str(),
            );
        }
    }

    /// Remove a session
    ///
    /// The session is unlinked first, so nothing can queue on it while its
    /// negotiation is deleted and its remaining work is refused: ETIMEDOUT
    /// after a DPD failure, EPERM otherwise.
    pub fn teardown(&mut self, handle: SessionHandle, notify_peer: bool, out: &mut Actions) -> bool {
        self.remove_session(handle, Some(notify_peer), out)
    }

    /// The engine released the session's negotiation
    pub fn on_sa_freed(&mut self, handle: SessionHandle, out: &mut Actions) -> bool {
        self.remove_session(handle, None, out)
    }

    fn remove_session(
        &mut self,
        handle: SessionHandle,
        delete_negotiation: Option<bool>,
        out: &mut Actions,
    ) -> bool {
        let Some(mut session) = self.sessions.remove(handle) else {
            return false;
        };
        if let (Some(negotiation), Some(notify_peer)) = (session.negotiation, delete_negotiation) {
            out.push(Action::DeleteNegotiation {
                negotiation,
                notify_peer,
            });
        }
        if session.want_phase2 {
            if let Some(cache) = self.addrcaches.get_mut(&session.local.ip()) {
                cache.delete(&session.remote);
            }
        }

        let err = if session.dpd.status() == DpdStatus::Failed {
            errno::ETIMEDOUT
        } else {
            errno::EPERM
        };
        for work in session.pending.drain(..) {
            self.nack(work, err, "session deleted", out);
        }

        log_session_state(&session.cookie_i, &session.cookie_r, session.state.as_str(), "deleted");
        self.metrics.record_session_removed();
        true
    }

    /// Administrative delete of every session between two endpoints
    ///
    /// Expiring sessions are included.
    pub fn delete_sessions(&mut self, local: &SocketAddr, remote: &SocketAddr, out: &mut Actions) -> usize {
        let mut deleted = 0;
        while let Some(handle) = self.find_session(local, remote, None, None, None, true) {
            self.teardown(handle, true, out);
            deleted += 1;
        }
        deleted
    }

    /// Kernel FLUSH: forget every peer and delete every session
    pub fn flush(&mut self, out: &mut Actions) {
        for cache in self.addrcaches.values_mut() {
            cache.flush();
        }
        for handle in self.sessions.handles() {
            self.teardown(handle, true, out);
        }
    }

    /// Refuse kernel work
    ///
    /// An ACQUIRE gets its header echoed back with `err`. A DPD trigger only
    /// produces kernel traffic when the peer timed out, and then deletes the
    /// idle SA pair.
    pub fn nack(&self, work: PendingWork, err: u8, reason: &str, out: &mut Actions) {
        match work {
            PendingWork::Acquire(acquire) => {
                let mut reply = acquire.header_only();
                reply.errno = err;
                log_negative_acquire(acquire.seq, err, reason);
                self.metrics.record_negative_acquire();
                out.push(Action::KernelSend(reply));
            }
            PendingWork::Dpd(expire) => {
                if err != errno::ETIMEDOUT {
                    debug!(errno = err, reason, "Idle expire dropped");
                    return;
                }
                if let Some(delpair) = pair_request(MsgType::XDelPair, &expire) {
                    out.push(Action::KernelRequest(delpair, Completion::UpdateLifetime));
                }
            }
        }
    }

    /// Kernel idle EXPIRE for an inbound SA
    ///
    /// Outbound SAs and NAT-T SAs not yet marked as traversing a NAT are
    /// ignored. Without a session toward the peer a DPD-only one is created.
    pub fn on_idle_expire(&mut self, rulebase: &Rulebase, expire: Message, now: Instant, out: &mut Actions) {
        let Some(sa) = expire.sa() else {
            debug!("Idle expire without SA extension");
            return;
        };
        if sa.flags & saflags::OUTBOUND != 0 {
            return;
        }
        if sa.flags & (saflags::NATT_LOC | saflags::NATT_REM) != 0 && sa.flags & saflags::NATTED == 0 {
            return;
        }
        self.get_or_create_session(rulebase, PendingWork::Dpd(expire), false, now, out);
    }

    /// Decide what an idle EXPIRE on an established session calls for
    pub fn dpd_trigger(&mut self, handle: SessionHandle, expire: Message, now: Instant, out: &mut Actions) {
        let Some(session) = self.sessions.get_mut(handle) else {
            return;
        };
        if !session.dpd.peer_supports() {
            if let Some(update) = pair_request(MsgType::XUpdatePair, &expire) {
                out.push(Action::KernelRequest(update, Completion::UpdateLifetime));
            }
            return;
        }
        if session.dpd.is_in_progress() {
            debug!(remote = %session.remote, "DPD already running");
            return;
        }

        let idle = expire
            .lifetime(ExtType::XLifetimeIdle)
            .map_or(0, |l| l.addtime);
        match session.dpd.recent_result(now, Duration::from_secs(idle)) {
            Some(DpdStatus::Successful) => {
                if let Some(update) = pair_request(MsgType::XUpdatePair, &expire) {
                    out.push(Action::KernelRequest(update, Completion::UpdateLifetime));
                }
            }
            Some(_) => {
                if let Some(delete) = pair_request(MsgType::XDelPair, &expire) {
                    out.push(Action::KernelRequest(delete, Completion::UpdateLifetime));
                }
            }
            None => {
                session.dpd.begin(expire);
                self.send_probe(handle, now, out);
            }
        }
    }

    fn send_probe(&mut self, handle: SessionHandle, now: Instant, out: &mut Actions) {
        let interval = self.dpd_retry_interval;
        let Some(session) = self.sessions.get_mut(handle) else {
            return;
        };
        let Some(negotiation) = session.negotiation else {
            return;
        };
        let seq = session.dpd.next_probe();
        out.push(Action::Notify(Notification::r_u_there(
            negotiation,
            session.cookies(),
            seq,
        )));
        out.push(Action::Schedule {
            at: now + interval,
            event: TimerEvent::DpdRetry {
                session: handle,
                seq,
            },
        });
        log_dpd_probe(&session.remote, seq, session.dpd.retry_count());
        self.metrics.record_dpd_probe();
    }

    /// DPD retry timer
    ///
    /// Stale timers (session gone, exchange over, or a newer probe sent) do
    /// nothing. Past the retry limit the peer is declared dead.
    pub fn on_dpd_retry(&mut self, handle: SessionHandle, seq: u32, now: Instant, out: &mut Actions) {
        let limit = self.dpd_retry_limit;
        let Some(session) = self.sessions.get_mut(handle) else {
            return;
        };
        if !session.dpd.is_in_progress() || session.dpd.sent_seq() != seq {
            return;
        }
        if !session.dpd.exhausted(limit) {
            self.send_probe(handle, now, out);
            return;
        }

        let remote = session.remote;
        if let Some(trigger) = session.dpd.mark_failed(now) {
            if let Some(delete) = pair_request(MsgType::XDelPair, &trigger) {
                out.push(Action::KernelRequest(delete, Completion::UpdateLifetime));
            }
        }
        log_dpd_result(&remote, false);
        self.metrics.record_dpd_result(false);
        self.teardown(handle, true, out);
    }

    /// Peer's R-U-THERE-ACK
    ///
    /// Counts only with both cookies echoed in the SPI field and the last
    /// sequence number sent. Returns whether it counted.
    pub fn on_dpd_ack(
        &mut self,
        handle: SessionHandle,
        spi: &[u8],
        data: &[u8],
        now: Instant,
        out: &mut Actions,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(handle) else {
            return false;
        };
        if !session.dpd.peer_supports() || spi != session.cookies().as_slice() {
            warn!(remote = %session.remote, "DPD ack with wrong cookies ignored");
            return false;
        }
        let Some(seq) = decode_seq(data) else {
            warn!(remote = %session.remote, "DPD ack without sequence number ignored");
            return false;
        };
        if !session.dpd.mark_acked(seq, now) {
            warn!(
                remote = %session.remote,
                seq,
                expected = session.dpd.sent_seq(),
                "DPD ack with stale sequence ignored"
            );
            return false;
        }
        if let Some(trigger) = session.dpd.take_trigger() {
            if let Some(update) = pair_request(MsgType::XUpdatePair, &trigger) {
                out.push(Action::KernelRequest(update, Completion::UpdateLifetime));
            }
        }
        log_dpd_result(&session.remote, true);
        self.metrics.record_dpd_result(true);
        true
    }

    /// Peer's R-U-THERE; answered when its sequence number is in window
    pub fn on_dpd_probe(&mut self, handle: SessionHandle, spi: &[u8], data: &[u8], out: &mut Actions) {
        let Some(session) = self.sessions.get_mut(handle) else {
            return;
        };
        let Some(negotiation) = session.negotiation else {
            return;
        };
        if spi != session.cookies().as_slice() {
            warn!(remote = %session.remote, "DPD probe with wrong cookies ignored");
            return;
        }
        let Some(seq) = decode_seq(data) else {
            return;
        };
        if !session.dpd.accept_probe(seq) {
            warn!(remote = %session.remote, seq, "DPD probe out of window ignored");
            return;
        }
        out.push(Action::Notify(Notification::r_u_there_ack(
            negotiation,
            spi.to_vec(),
            data.to_vec(),
        )));
    }

    /// Peer's INITIAL-CONTACT: drop every SA we still hold with it
    pub fn on_peer_initial_contact(&mut self, handle: SessionHandle, out: &mut Actions) {
        let Some(session) = self.sessions.get(handle) else {
            return;
        };
        if !session.want_phase2 {
            return;
        }
        info!(remote = %session.remote, "Initial contact, deleting old SAs");
        for satype in [SaType::Ah, SaType::Esp] {
            for (src, dst) in [
                (session.remote, session.local),
                (session.local, session.remote),
            ] {
                let delete = Message::new(MsgType::Delete, satype)
                    .with(SaExt::default())
                    .with(AddressExt::new(ExtType::AddressSrc, src))
                    .with(AddressExt::new(ExtType::AddressDst, dst));
                out.push(Action::KernelRequest(delete, Completion::Delete));
            }
        }
    }
}

fn id_compatible(held: Option<&Identity>, wanted: Option<&Identity>) -> bool {
    match (held, wanted) {
        (Some(h), Some(w)) => h == w,
        _ => true,
    }
}
