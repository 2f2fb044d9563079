//! Key-management daemon core
//!
//! [`Daemon`] owns every layer: the PF_KEY transaction engine, the Phase-1
//! manager, the rulebase and the kernel algorithm table. Kernel messages,
//! negotiation-engine callbacks and timer expiries each run to completion;
//! handlers only describe their side effects as [`Action`]s, which the
//! daemon then carries out in order.
//!
//! # Example
//!
//! ```
//! use std::time::Instant;
//! use fynx_iked::config::DaemonConfig;
//! use fynx_iked::daemon::Daemon;
//! use fynx_iked::negotiation::*;
//! use fynx_iked::error::Result;
//! use fynx_iked::policy::Rulebase;
//!
//! struct NullEngine;
//!
//! impl NegotiationEngine for NullEngine {
//!     fn initiate_phase1(&mut self, _: Phase1Request) -> Result<NegotiationId> { Ok(1) }
//!     fn initiate_phase2(&mut self, _: Phase2Request) -> Result<NegotiationId> { Ok(2) }
//!     fn send_notification(&mut self, _: Notification) -> Result<()> { Ok(()) }
//!     fn send_delete(&mut self, _: DeleteRequest) -> Result<()> { Ok(()) }
//!     fn delete_negotiation(&mut self, _: NegotiationId, _: bool) -> Result<()> { Ok(()) }
//! }
//!
//! let mut daemon = Daemon::new(
//!     DaemonConfig::default(),
//!     Vec::<Vec<u8>>::new(),
//!     4242,
//!     NullEngine,
//!     Rulebase::new(),
//! )
//! .unwrap();
//! daemon.register(Instant::now()).unwrap();
//! assert_eq!(daemon.transport().len(), 1);
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use fynx_platform::{FynxResult, ModuleStatus, SecurityModule};
use tracing::{debug, error, info, trace, warn};

use crate::action::{Action, Actions, TimerEvent};
use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::logging::log_kernel_error;
use crate::metrics::IkeMetrics;
use crate::negotiation::{
    notify, DeleteRequest, EngineEvent, NegotiationEngine, NegotiationId, NotifyTarget,
    ReceivedNotify, SelectOutcome, SelectReply, SelectRequest, PROTO_IPSEC_AH, PROTO_IPSEC_ESP,
};
use crate::pfkey::constants::{errno, ExtType, MsgType, SaType};
use crate::pfkey::diag::{classify_error, ErrorClass};
use crate::pfkey::engine::{Completion, KernelTransport, PendingTransaction, TransactionEngine};
use crate::pfkey::message::{EpropExt, IdentExt, Message, PairExt};
use crate::phase1::manager::kernel_identity;
use crate::phase1::{Phase1Manager, PendingWork, SessionHandle};
use crate::phase2::algs::AlgorithmTable;
use crate::phase2::install::{self, SelectWait};
use crate::policy::{ExchangeMode, Identity, Rulebase};

/// The policy and key-management core
pub struct Daemon<T, E> {
    config: DaemonConfig,
    kernel: TransactionEngine<T>,
    negotiator: E,
    rulebase: Rulebase,
    phase1: Phase1Manager,
    algs: AlgorithmTable,
    timers: BTreeMap<(Instant, u64), TimerEvent>,
    timer_seq: u64,
    metrics: IkeMetrics,
    running: bool,
}

impl<T: KernelTransport, E: NegotiationEngine> Daemon<T, E> {
    /// Create a daemon writing PF_KEY requests to `transport` as `pid`
    pub fn new(
        config: DaemonConfig,
        transport: T,
        pid: u32,
        negotiator: E,
        rulebase: Rulebase,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = IkeMetrics::new();
        let kernel = TransactionEngine::new(
            transport,
            pid,
            config.pfkey_retransmit_interval,
            config.pfkey_max_retransmits,
            metrics.clone(),
        );
        let phase1 = Phase1Manager::new(&config, metrics.clone());
        Ok(Self {
            config,
            kernel,
            negotiator,
            rulebase,
            phase1,
            algs: AlgorithmTable::new(),
            timers: BTreeMap::new(),
            timer_seq: 0,
            metrics,
            running: false,
        })
    }

    /// Daemon configuration
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Counters
    pub fn metrics(&self) -> &IkeMetrics {
        &self.metrics
    }

    /// Current rulebase
    pub fn rulebase(&self) -> &Rulebase {
        &self.rulebase
    }

    /// Replace the rulebase; existing sessions keep their private copies
    pub fn set_rulebase(&mut self, rulebase: Rulebase) {
        info!(rules = rulebase.len(), "Rulebase replaced");
        self.rulebase = rulebase;
    }

    /// Phase-1 sessions and address caches
    pub fn phase1(&self) -> &Phase1Manager {
        &self.phase1
    }

    /// Algorithms the kernel registered
    pub fn algorithms(&self) -> &AlgorithmTable {
        &self.algs
    }

    /// PF_KEY transport
    pub fn transport(&self) -> &T {
        self.kernel.transport()
    }

    /// PF_KEY transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        self.kernel.transport_mut()
    }

    /// Negotiation engine
    pub fn negotiator(&self) -> &E {
        &self.negotiator
    }

    /// Negotiation engine, mutably
    pub fn negotiator_mut(&mut self) -> &mut E {
        &mut self.negotiator
    }

    /// Earliest PF_KEY retransmission or DPD retry
    pub fn next_deadline(&self) -> Option<Instant> {
        let timer = self.timers.keys().next().map(|(at, _)| *at);
        match (timer, self.kernel.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// REGISTER for AH and ESP
    pub fn register(&mut self, now: Instant) -> Result<()> {
        for satype in [SaType::Ah, SaType::Esp] {
            self.kernel
                .submit(Message::new(MsgType::Register, satype), Completion::Register, now)?;
        }
        Ok(())
    }

    /// Raw bytes read from the PF_KEY socket
    ///
    /// Undecodable messages are logged and dropped.
    pub fn on_kernel_bytes(&mut self, wire: &[u8], now: Instant) -> Result<()> {
        match Message::from_bytes(wire) {
            Ok(msg) => self.on_kernel_message(msg, now),
            Err(e) => {
                warn!(error = %e, len = wire.len(), "Undecodable PF_KEY message dropped");
                Ok(())
            }
        }
    }

    /// One decoded kernel message
    ///
    /// Messages carrying our pid are replies; anything else is unsolicited.
    pub fn on_kernel_message(&mut self, msg: Message, now: Instant) -> Result<()> {
        let mut out = Actions::new();
        if msg.pid == self.kernel.pid() {
            if let Some(txn) = self.kernel.on_reply(&msg, now)? {
                self.complete(txn, &msg, &mut out)?;
            }
        } else if msg.errno != 0 {
            trace!(seq = msg.seq, errno = msg.errno, "Error reply for another process dropped");
        } else {
            match msg.kind() {
                Some(MsgType::Acquire) => self.on_acquire(msg, now, &mut out),
                Some(MsgType::Expire) => self.on_expire(msg, now, &mut out),
                Some(MsgType::Delete) | Some(MsgType::XDelPair) => self.on_delete(&msg, &mut out),
                Some(MsgType::Flush) => self.on_flush(&msg, &mut out),
                Some(MsgType::Register) => {
                    self.algs.update_from_register(&msg);
                }
                _ => trace!(msg_type = msg.msg_type, "Unsolicited PF_KEY message ignored"),
            }
        }
        self.execute(out, now)
    }

    fn kernel_error(&self, reply: &Message) -> Result<ErrorClass> {
        let class = classify_error(reply);
        let label = match class {
            ErrorClass::Ignorable => "ignorable",
            ErrorClass::Resync => "resync",
            ErrorClass::DebugFatal => "debug-fatal",
            ErrorClass::Fatal => "fatal",
        };
        log_kernel_error(reply, label);
        if class.stops_daemon() {
            return Err(Error::KernelFatal {
                errno: reply.errno,
                diagnostic: reply.diagnostic,
            });
        }
        Ok(class)
    }

    fn complete(&mut self, txn: PendingTransaction, reply: &Message, out: &mut Actions) -> Result<()> {
        let PendingTransaction {
            request,
            completion,
            attempts,
        } = txn;
        let ok = reply.errno == 0;

        match completion {
            Completion::Install(wait) => {
                if ok {
                    install::on_install_reply(wait, true, &self.metrics, out);
                    return Ok(());
                }
                let Some((request, wait)) = install::retry_as_add(request, wait, reply, out) else {
                    return Ok(());
                };
                match self.kernel_error(reply)? {
                    ErrorClass::Resync => {
                        install::resync(&self.phase1, &request, Some(&wait), &self.metrics, out)
                    }
                    ErrorClass::Ignorable => {
                        debug!(attempts, "Install already applied");
                        install::on_install_reply(wait, true, &self.metrics, out);
                    }
                    _ => install::on_install_reply(wait, false, &self.metrics, out),
                }
            }
            Completion::GetSpi(wait) => {
                if !ok {
                    warn!(seq = reply.seq, errno = reply.errno, "GETSPI failed");
                }
                install::on_getspi_reply(&self.phase1, wait, reply, ok, out);
            }
            Completion::InverseAcquire(wait) => {
                install::on_inverse_acquire_reply(wait, reply, ok, out);
            }
            Completion::Delete => {
                if !ok && reply.errno != errno::ESRCH {
                    self.kernel_error(reply)?;
                }
            }
            Completion::UpdateLifetime => {
                if !ok {
                    debug!(
                        msg_type = reply.msg_type,
                        errno = reply.errno,
                        "Lifetime update failed"
                    );
                }
            }
            Completion::Register => {
                if !ok {
                    warn!(satype = reply.satype, errno = reply.errno, "REGISTER failed");
                } else if !self.algs.update_from_register(reply) {
                    debug!(satype = reply.satype, "REGISTER reply without algorithms");
                }
            }
        }
        Ok(())
    }

    fn on_acquire(&mut self, msg: Message, now: Instant, out: &mut Actions) {
        if msg.sa_type().is_none() {
            debug!(satype = msg.satype, "ACQUIRE for unknown SA type dropped");
            return;
        }
        if msg.address(ExtType::AddressSrc).is_none() || msg.address(ExtType::AddressDst).is_none() {
            self.phase1
                .nack(PendingWork::Acquire(msg), errno::EINVAL, "missing addresses", out);
            return;
        }
        let supported = msg
            .get::<EpropExt>(ExtType::XEprop)
            .map_or(false, |e| e.combs.iter().any(|c| self.algs.comb_supported(c)));
        if !supported {
            self.phase1.nack(
                PendingWork::Acquire(msg),
                errno::EINVAL,
                "no supported algorithm combination",
                out,
            );
            return;
        }
        self.phase1
            .get_or_create_session(&self.rulebase, PendingWork::Acquire(msg), true, now, out);
    }

    fn on_expire(&mut self, msg: Message, now: Instant, out: &mut Actions) {
        if msg.has(ExtType::LifetimeHard) {
            self.on_delete(&msg, out);
        } else if msg.has(ExtType::XLifetimeIdle) {
            self.phase1.on_idle_expire(&self.rulebase, msg, now, out);
        } else if msg.has(ExtType::LifetimeSoft) {
            let wallclock = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let config = &self.config;
            match install::rekey_acquire(&msg, &self.algs, |a| config.is_local(a), wallclock) {
                Some(acquire) => {
                    debug!(seq = msg.seq, "Soft expire, rekeying");
                    self.on_acquire(acquire, now, out);
                }
                None => debug!(seq = msg.seq, "Soft expire not rekeyed"),
            }
        } else {
            debug!(seq = msg.seq, "EXPIRE without lifetime dropped");
        }
    }

    fn on_delete(&mut self, msg: &Message, out: &mut Actions) {
        let (Some(sa), Some(src), Some(dst)) = (
            msg.sa(),
            msg.address(ExtType::AddressSrc),
            msg.address(ExtType::AddressDst),
        ) else {
            debug!("DELETE without SA or addresses dropped");
            return;
        };
        let Some(satype) = msg.sa_type() else {
            return;
        };
        let ident = |kind| msg.get::<IdentExt>(kind).and_then(|e| kernel_identity(&e));
        let src_id = ident(ExtType::IdentitySrc);
        let dst_id = ident(ExtType::IdentityDst);
        let cookie = msg.km_cookie().filter(|c| *c != 0);

        self.notify_delete(dst, src, dst_id.as_ref(), src_id.as_ref(), cookie, sa.spi, satype, out);
        if let Some(pair) = msg.get::<PairExt>(ExtType::XPair) {
            self.notify_delete(src, dst, src_id.as_ref(), dst_id.as_ref(), cookie, pair.spi, satype, out);
        }
    }

    /// Tell the peer about an inbound SA we lost
    #[allow(clippy::too_many_arguments)]
    fn notify_delete(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        local_id: Option<&Identity>,
        remote_id: Option<&Identity>,
        cookie: Option<u32>,
        spi: u32,
        satype: SaType,
        out: &mut Actions,
    ) {
        if !self.config.is_local(&local.ip()) {
            trace!(spi = %hex::encode(spi.to_be_bytes()), "Outbound SA, no delete notification");
            return;
        }
        let negotiation = self
            .phase1
            .find_session(&local, &remote, local_id, remote_id, cookie, false)
            .and_then(|h| self.phase1.get(h))
            .filter(|s| s.is_established())
            .and_then(|s| s.negotiation);
        let target = match negotiation {
            Some(n) => NotifyTarget::Negotiation(n),
            None => NotifyTarget::Peer {
                local,
                remote: SocketAddr::new(remote.ip(), self.config.ike_port),
            },
        };
        let protocol = match satype {
            SaType::Ah => PROTO_IPSEC_AH,
            _ => PROTO_IPSEC_ESP,
        };
        debug!(spi = %hex::encode(spi.to_be_bytes()), remote = %remote, "Sending delete notification");
        out.push(Action::SendDelete(DeleteRequest {
            target,
            protocol,
            spis: vec![spi],
        }));
    }

    fn on_flush(&mut self, msg: &Message, out: &mut Actions) {
        if msg.sa_type() != Some(SaType::Unspec) {
            return;
        }
        info!(sessions = self.phase1.len(), "Kernel flush");
        self.phase1.flush(out);
    }

    /// A peer opened a Phase-1 toward us
    ///
    /// Rejected when no rule admits the mode and both endpoints.
    pub fn new_connection(
        &mut self,
        negotiation: NegotiationId,
        local: SocketAddr,
        remote: SocketAddr,
        mode: ExchangeMode,
    ) -> Option<SessionHandle> {
        match self
            .phase1
            .new_responder_session(&self.rulebase, negotiation, local, remote, mode)
        {
            Ok(h) => Some(h),
            Err(e) => {
                info!(remote = %remote, error = %e, "Phase 1 connection rejected");
                None
            }
        }
    }

    /// Responder SA selection: ask the kernel which policy covers the traffic
    pub fn select_sa(&mut self, request: SelectRequest, reply: SelectReply, now: Instant) -> Result<()> {
        if self.phase1.get(request.session).is_none() {
            let _ = reply.send(SelectOutcome::NoProposalChosen);
            return Ok(());
        }
        let inverse = install::inverse_acquire_request(&request);
        let wait = SelectWait {
            session: request.session,
            request,
            reply,
        };
        self.execute(
            vec![Action::KernelRequest(inverse, Completion::InverseAcquire(wait))],
            now,
        )
    }

    /// Administrative delete of every session between two endpoints
    pub fn delete_sessions(&mut self, local: &SocketAddr, remote: &SocketAddr, now: Instant) -> Result<usize> {
        let mut out = Actions::new();
        let deleted = self.phase1.delete_sessions(local, remote, &mut out);
        self.execute(out, now)?;
        Ok(deleted)
    }

    /// A callback from the negotiation engine
    pub fn on_engine_event(&mut self, event: EngineEvent, now: Instant) -> Result<()> {
        let mut out = Actions::new();
        match event {
            EngineEvent::NewConnection {
                negotiation,
                local,
                remote,
                mode,
                reply,
            } => {
                let handle = self.new_connection(negotiation, local, remote, mode);
                let _ = reply.send(handle);
            }
            EngineEvent::SelectPhase1Sa {
                session,
                proposals,
                reply,
            } => {
                let _ = reply.send(self.phase1.select_phase1_proposal(session, &proposals));
            }
            EngineEvent::Phase1Done {
                session,
                info: Some(info),
            } => self.phase1.on_established(session, info, now, &mut out),
            EngineEvent::Phase1Done { session, info: None } => {
                self.phase1.on_phase1_failed(session, &mut out)
            }
            EngineEvent::SelectSa { request, reply } => return self.select_sa(request, reply, now),
            EngineEvent::Phase2Done(result) => install::phase2_done(&mut self.phase1, result, &mut out),
            EngineEvent::Notification(n) => self.on_notification(n, now, &mut out),
            EngineEvent::Phase1Expiring { session } => self.phase1.mark_expiring(session),
            EngineEvent::SaFreed { session } => {
                self.phase1.on_sa_freed(session, &mut out);
            }
        }
        self.execute(out, now)
    }

    fn on_notification(&mut self, n: ReceivedNotify, now: Instant, out: &mut Actions) {
        match n.message_type {
            notify::R_U_THERE_ACK => {
                self.phase1.on_dpd_ack(n.session, &n.spi, &n.data, now, out);
            }
            notify::R_U_THERE => self.phase1.on_dpd_probe(n.session, &n.spi, &n.data, out),
            notify::INITIAL_CONTACT => self.phase1.on_peer_initial_contact(n.session, out),
            notify::RESPONDER_LIFETIME => install::on_responder_lifetime(&mut self.phase1, &n, out),
            other => debug!(message_type = other, "Notification ignored"),
        }
    }

    /// Run expired timers: PF_KEY retransmission first, then DPD retries
    pub fn on_timer(&mut self, now: Instant) -> Result<()> {
        self.kernel.on_timeout(now)?;

        let mut out = Actions::new();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            match entry.remove() {
                TimerEvent::DpdRetry { session, seq } => {
                    self.phase1.on_dpd_retry(session, seq, now, &mut out)
                }
            }
        }
        self.execute(out, now)
    }

    fn schedule(&mut self, at: Instant, event: TimerEvent) {
        self.timer_seq += 1;
        self.timers.insert((at, self.timer_seq), event);
    }

    /// Carry out actions in order, including any they give rise to
    fn execute(&mut self, actions: Actions, now: Instant) -> Result<()> {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::KernelSend(msg) => self.kernel.send_unqueued(&msg)?,
                Action::KernelRequest(msg, completion) => {
                    self.kernel.submit(msg, completion, now)?;
                }
                Action::Initiate(request) => {
                    let session = request.session;
                    match self.negotiator.initiate_phase1(request) {
                        Ok(negotiation) => {
                            if let Some(s) = self.phase1.get_mut(session) {
                                s.negotiation = Some(negotiation);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Phase 1 initiation failed");
                            let mut more = Actions::new();
                            self.phase1.on_phase1_failed(session, &mut more);
                            queue.extend(more);
                        }
                    }
                }
                Action::InitiatePhase2(request) => {
                    let seq = request.acquire_seq;
                    if let Err(e) = self.negotiator.initiate_phase2(request) {
                        warn!(error = %e, acquire_seq = seq, "Quick Mode initiation failed");
                    }
                }
                Action::Notify(notification) => {
                    if let Err(e) = self.negotiator.send_notification(notification) {
                        warn!(error = %e, "Notification not sent");
                    }
                }
                Action::SendDelete(request) => {
                    if let Err(e) = self.negotiator.send_delete(request) {
                        debug!(error = %e, "Delete notification not sent");
                    }
                }
                Action::DeleteNegotiation {
                    negotiation,
                    notify_peer,
                } => {
                    if let Err(e) = self.negotiator.delete_negotiation(negotiation, notify_peer) {
                        debug!(error = %e, negotiation, "Negotiation delete failed");
                    }
                }
                Action::StartPhase2 { session, acquire } => {
                    let mut more = Actions::new();
                    install::start_phase2(&self.phase1, &self.algs, session, acquire, &mut more);
                    queue.extend(more);
                }
                Action::Schedule { at, event } => self.schedule(at, event),
            }
        }
        Ok(())
    }
}

#[cfg(all(unix, feature = "kernel-socket"))]
impl<E: NegotiationEngine> Daemon<crate::pfkey::socket::PfKeySocket, E> {
    /// Serve until the engine's event channel closes or a fatal error
    ///
    /// `socket` is a clone of the transport, used for reading. REGISTER is
    /// sent first.
    pub async fn run(
        &mut self,
        socket: crate::pfkey::socket::PfKeySocket,
        mut events: tokio::sync::mpsc::Receiver<EngineEvent>,
    ) -> Result<()> {
        let mut buf = crate::pfkey::socket::PfKeySocket::recv_buffer();
        self.register(Instant::now())?;
        self.running = true;
        info!(pid = self.kernel.pid(), "Key-management daemon running");

        loop {
            let deadline = self.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let result = tokio::select! {
                read = socket.recv(&mut buf) => match read {
                    Ok(n) => self.on_kernel_bytes(&buf[..n], Instant::now()),
                    Err(e) => Err(e),
                },
                event = events.recv() => match event {
                    Some(event) => self.on_engine_event(event, Instant::now()),
                    None => break,
                },
                _ = timer => self.on_timer(Instant::now()),
            };

            if let Err(e) = result {
                if e.is_fatal() {
                    error!(error = %e, "Key-management daemon stopping");
                    self.running = false;
                    return Err(e);
                }
                warn!(error = %e, "Event handling failed");
            }
        }

        self.running = false;
        info!("Engine channel closed, daemon stopping");
        Ok(())
    }
}

impl<T: KernelTransport, E: NegotiationEngine> SecurityModule for Daemon<T, E> {
    fn id(&self) -> &'static str {
        "iked"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &'static str {
        "IKE policy and key-management core"
    }

    fn init(&mut self) -> FynxResult<()> {
        self.register(Instant::now())?;
        self.running = true;
        Ok(())
    }

    fn shutdown(&mut self) -> FynxResult<()> {
        let mut out = Actions::new();
        self.phase1.flush(&mut out);
        self.execute(out, Instant::now())?;
        self.running = false;
        Ok(())
    }

    fn status(&self) -> ModuleStatus {
        ModuleStatus {
            running: self.running,
            sessions: self.phase1.len(),
            backlog: self.kernel.in_flight() + self.kernel.backlog(),
        }
    }
}

impl<T, E> std::fmt::Debug for Daemon<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("rules", &self.rulebase.len())
            .field("phase1", &self.phase1)
            .field("timers", &self.timers.len())
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}
