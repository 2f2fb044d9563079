//! PF_KEY transaction engine
//!
//! Requests are queued FIFO and only the head of the queue is ever on the
//! wire. A reply that matches the head completes it and releases the next
//! request; a retransmission timer resends the head until the kernel answers
//! or the retransmission ceiling is reached.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use super::constants::MsgType;
use super::message::Message;
use crate::error::{Error, Result};
use crate::logging::{log_pfkey_reply_unmatched, log_pfkey_tx};
use crate::metrics::IkeMetrics;
use crate::phase2::install::{InstallWait, SelectWait, SpiWait};

/// Where serialized requests go
pub trait KernelTransport {
    /// Write one complete PF_KEY message
    fn send(&mut self, wire: &[u8]) -> Result<()>;
}

/// Collects every write; used by tests and dry runs
impl KernelTransport for Vec<Vec<u8>> {
    fn send(&mut self, wire: &[u8]) -> Result<()> {
        self.push(wire.to_vec());
        Ok(())
    }
}

/// What happens once the kernel answers a request
#[derive(Debug)]
pub enum Completion {
    /// GETSPI in a chain of SPI allocations
    GetSpi(SpiWait),
    /// ADD or UPDATE installing one half of an SA pair
    Install(InstallWait),
    /// DELETE, including resync deletes
    Delete,
    /// X_UPDATEPAIR/X_DELPAIR from DPD or a lifetime-only UPDATE
    UpdateLifetime,
    /// REGISTER for one SA type
    Register,
    /// X_INVERSE_ACQUIRE for responder SA selection
    InverseAcquire(SelectWait),
}

/// A request waiting for, or on, the wire
#[derive(Debug)]
pub struct PendingTransaction {
    /// The request; key extensions are wiped when this is dropped
    pub request: Message,
    /// Continuation to run with the reply
    pub completion: Completion,
    /// Retransmissions so far
    pub attempts: u32,
}

impl PendingTransaction {
    /// Whether the request was sent more than once
    pub fn retransmitted(&self) -> bool {
        self.attempts > 0
    }
}

/// Whether `reply` answers `request`
///
/// Sequence number and SA type must agree; the type must agree too, except
/// that the kernel answers X_INVERSE_ACQUIRE with an ACQUIRE.
pub fn reply_matches(request: &Message, reply: &Message) -> bool {
    request.seq == reply.seq
        && request.satype == reply.satype
        && (request.msg_type == reply.msg_type
            || (reply.kind() == Some(MsgType::Acquire)
                && request.kind() == Some(MsgType::XInverseAcquire)))
}

/// Single-in-flight request queue over a kernel transport
pub struct TransactionEngine<T> {
    transport: T,
    pid: u32,
    next_seq: u32,
    queue: VecDeque<PendingTransaction>,
    deadline: Option<Instant>,
    retransmit_interval: Duration,
    max_retransmits: u32,
    metrics: IkeMetrics,
}

impl<T: KernelTransport> TransactionEngine<T> {
    /// Create an engine writing to `transport` on behalf of `pid`
    pub fn new(
        transport: T,
        pid: u32,
        retransmit_interval: Duration,
        max_retransmits: u32,
        metrics: IkeMetrics,
    ) -> Self {
        Self {
            transport,
            pid,
            next_seq: 0,
            queue: VecDeque::new(),
            deadline: None,
            retransmit_interval,
            max_retransmits,
            metrics,
        }
    }

    /// Our pid, as stamped on every request
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Requests on the wire (0 or 1)
    pub fn in_flight(&self) -> usize {
        usize::from(!self.queue.is_empty())
    }

    /// Requests waiting behind the one on the wire
    pub fn backlog(&self) -> usize {
        self.queue.len().saturating_sub(1)
    }

    /// When the head must be retransmitted
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn allocate_seq(&mut self) -> u32 {
        self.next_seq = self.next_seq.wrapping_add(1);
        if self.next_seq == 0 {
            self.next_seq = 1;
        }
        self.next_seq
    }

    /// Queue a request, sending it at once if nothing is outstanding
    ///
    /// A zero sequence number is replaced by the next one; a preset one is
    /// kept, which is how a re-issued request keeps its identity.
    pub fn submit(
        &mut self,
        mut request: Message,
        completion: Completion,
        now: Instant,
    ) -> Result<u32> {
        if request.seq == 0 {
            request.seq = self.allocate_seq();
        }
        request.pid = self.pid;
        let seq = request.seq;

        self.queue.push_back(PendingTransaction {
            request,
            completion,
            attempts: 0,
        });
        if self.queue.len() == 1 {
            self.transmit_head(now)?;
        }
        Ok(seq)
    }

    /// Write a message outside the queue, for negative ACQUIREs
    pub fn send_unqueued(&mut self, msg: &Message) -> Result<()> {
        let wire = Zeroizing::new(msg.to_bytes());
        log_pfkey_tx(msg, 0);
        self.transport.send(&wire)
    }

    fn transmit_head(&mut self, now: Instant) -> Result<()> {
        let Some(head) = self.queue.front() else {
            self.deadline = None;
            return Ok(());
        };
        let wire = Zeroizing::new(head.request.to_bytes());
        log_pfkey_tx(&head.request, head.attempts);
        self.metrics.record_pfkey_request();
        self.transport.send(&wire)?;
        self.deadline = Some(now + self.retransmit_interval);
        Ok(())
    }

    /// Correlate a reply carrying our pid
    ///
    /// On a match the retry timer stops, the next queued request goes out
    /// and the completed transaction is handed back for its continuation.
    pub fn on_reply(&mut self, reply: &Message, now: Instant) -> Result<Option<PendingTransaction>> {
        let matched = self
            .queue
            .front()
            .map_or(false, |head| reply_matches(&head.request, reply));
        if !matched {
            self.metrics.record_unmatched_reply();
            log_pfkey_reply_unmatched(reply);
            return Ok(None);
        }

        self.deadline = None;
        let done = self.queue.pop_front();
        self.transmit_head(now)?;
        Ok(done)
    }

    /// Retransmit the head if its timer has expired
    pub fn on_timeout(&mut self, now: Instant) -> Result<()> {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return Ok(()),
        }
        let max = self.max_retransmits;
        let Some(head) = self.queue.front_mut() else {
            self.deadline = None;
            return Ok(());
        };
        if head.attempts >= max {
            return Err(Error::KernelUnresponsive {
                seq: head.request.seq,
                attempts: head.attempts,
            });
        }
        head.attempts += 1;
        self.metrics.record_pfkey_retransmit();
        self.transmit_head(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pfkey::constants::{errno, SaType};
    use crate::pfkey::message::SaExt;

    const PID: u32 = 4242;

    fn engine() -> TransactionEngine<Vec<Vec<u8>>> {
        TransactionEngine::new(
            Vec::new(),
            PID,
            Duration::from_secs(5),
            3,
            IkeMetrics::new(),
        )
    }

    fn sent(e: &TransactionEngine<Vec<Vec<u8>>>) -> Vec<Message> {
        e.transport()
            .iter()
            .map(|w| Message::from_bytes(w).unwrap())
            .collect()
    }

    fn reply_to(req: &Message) -> Message {
        req.header_only()
    }

    #[test]
    fn test_seq_assigned_and_pid_stamped() {
        let mut e = engine();
        let now = Instant::now();
        let seq = e
            .submit(Message::new(MsgType::Delete, SaType::Esp), Completion::Delete, now)
            .unwrap();
        assert_eq!(seq, 1);
        let wire = sent(&e);
        assert_eq!(wire[0].seq, 1);
        assert_eq!(wire[0].pid, PID);
    }

    #[test]
    fn test_preset_seq_kept() {
        let mut e = engine();
        let seq = e
            .submit(
                Message::new(MsgType::Add, SaType::Esp).with_seq(77),
                Completion::Delete,
                Instant::now(),
            )
            .unwrap();
        assert_eq!(seq, 77);
    }

    #[test]
    fn test_single_in_flight_ordering() {
        let mut e = engine();
        let now = Instant::now();
        for spi in 1..=4u32 {
            e.submit(
                Message::new(MsgType::Delete, SaType::Esp).with(SaExt {
                    spi,
                    ..SaExt::default()
                }),
                Completion::Delete,
                now,
            )
            .unwrap();
        }
        assert_eq!(e.in_flight(), 1);
        assert_eq!(e.backlog(), 3);
        assert_eq!(e.transport().len(), 1);

        for expected in 1..=4u32 {
            let head = sent(&e).pop().unwrap();
            assert_eq!(head.sa().unwrap().spi, expected);
            let done = e.on_reply(&reply_to(&head), now).unwrap().unwrap();
            assert_eq!(done.request.seq, head.seq);
        }
        assert_eq!(e.transport().len(), 4);
        assert_eq!(e.in_flight(), 0);
        assert!(e.next_deadline().is_none());
    }

    #[test]
    fn test_unmatched_reply_dropped() {
        let mut e = engine();
        let now = Instant::now();
        e.submit(Message::new(MsgType::Add, SaType::Esp), Completion::Delete, now)
            .unwrap();

        let wrong_seq = Message::new(MsgType::Add, SaType::Esp).with_seq(99);
        assert!(e.on_reply(&wrong_seq, now).unwrap().is_none());

        let wrong_satype = Message::new(MsgType::Add, SaType::Ah).with_seq(1);
        assert!(e.on_reply(&wrong_satype, now).unwrap().is_none());

        let wrong_type = Message::new(MsgType::Update, SaType::Esp).with_seq(1);
        assert!(e.on_reply(&wrong_type, now).unwrap().is_none());
        assert_eq!(e.in_flight(), 1);
    }

    #[test]
    fn test_acquire_answers_inverse_acquire() {
        let mut e = engine();
        let now = Instant::now();
        e.submit(
            Message::new(MsgType::XInverseAcquire, SaType::Unspec),
            Completion::Delete,
            now,
        )
        .unwrap();
        let reply = Message::new(MsgType::Acquire, SaType::Unspec).with_seq(1);
        assert!(e.on_reply(&reply, now).unwrap().is_some());
    }

    #[test]
    fn test_timeout_retransmits_same_seq() {
        let mut e = engine();
        let t0 = Instant::now();
        e.submit(Message::new(MsgType::Add, SaType::Esp), Completion::Delete, t0)
            .unwrap();

        // Not yet due
        e.on_timeout(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(e.transport().len(), 1);

        let t1 = t0 + Duration::from_secs(5);
        e.on_timeout(t1).unwrap();
        let wire = sent(&e);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0], wire[1]);

        let mut reply = reply_to(&wire[1]);
        reply.errno = errno::EEXIST;
        let done = e.on_reply(&reply, t1).unwrap().unwrap();
        assert_eq!(done.request.seq, 1);
        assert!(done.retransmitted());
    }

    #[test]
    fn test_unresponsive_kernel_is_fatal() {
        let mut e = engine();
        let mut now = Instant::now();
        e.submit(Message::new(MsgType::Add, SaType::Esp), Completion::Delete, now)
            .unwrap();
        for _ in 0..3 {
            now += Duration::from_secs(5);
            e.on_timeout(now).unwrap();
        }
        now += Duration::from_secs(5);
        let err = e.on_timeout(now).unwrap_err();
        assert_eq!(err, Error::KernelUnresponsive { seq: 1, attempts: 3 });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_send_unqueued_bypasses_queue() {
        let mut e = engine();
        let now = Instant::now();
        e.submit(Message::new(MsgType::Add, SaType::Esp), Completion::Delete, now)
            .unwrap();
        let mut nack = Message::new(MsgType::Acquire, SaType::Esp).with_seq(9);
        nack.errno = errno::ENOENT;
        e.send_unqueued(&nack).unwrap();
        assert_eq!(e.transport().len(), 2);
        assert_eq!(e.in_flight(), 1);
    }
}
