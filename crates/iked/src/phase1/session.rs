//! Phase-1 sessions and the session table
//!
//! Sessions live in an arena addressed by [`SessionHandle`]. A handle carries
//! the slot's generation, so a handle captured before a teardown (in a timer
//! or a pending kernel request) simply stops resolving once the slot is
//! reused.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::negotiation::NegotiationId;
use crate::pfkey::constants::ExtType;
use crate::pfkey::message::Message;
use crate::phase1::dpd::{DpdState, COOKIE_LEN};
use crate::policy::{Identity, Rule, Rulebase};

/// Stable reference to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl SessionHandle {
    /// Slot index
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Phase-1 lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Negotiation under way
    Larval,
    /// Usable for Phase-2 and DPD
    Established,
    /// About to be torn down; skipped by lookups
    Expiring,
}

impl SessionState {
    /// Lowercase name for logs
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Larval => "larval",
            SessionState::Established => "established",
            SessionState::Expiring => "expiring",
        }
    }
}

/// Kernel work waiting for a usable session
#[derive(Debug, Clone)]
pub enum PendingWork {
    /// ACQUIRE to turn into a Phase-2 proposal
    Acquire(Message),
    /// Idle EXPIRE to turn into a DPD probe
    Dpd(Message),
}

impl PendingWork {
    /// The captured kernel message
    pub fn message(&self) -> &Message {
        match self {
            PendingWork::Acquire(m) | PendingWork::Dpd(m) => m,
        }
    }

    /// Our address and the peer's as seen by this work item
    ///
    /// An ACQUIRE describes outbound traffic (source is local); an idle
    /// EXPIRE describes an inbound SA (destination is local).
    pub fn endpoints(&self) -> Option<(SocketAddr, SocketAddr)> {
        let msg = self.message();
        let src = msg.address(ExtType::AddressSrc)?;
        let dst = msg.address(ExtType::AddressDst)?;
        Some(match self {
            PendingWork::Acquire(_) => (src, dst),
            PendingWork::Dpd(_) => (dst, src),
        })
    }
}

/// One Phase-1 session
#[derive(Debug, Clone)]
pub struct Phase1Session {
    /// Initiator cookie
    pub cookie_i: [u8; COOKIE_LEN],
    /// Responder cookie, zero until the exchange completes
    pub cookie_r: [u8; COOKIE_LEN],
    /// Our address
    pub local: SocketAddr,
    /// Peer address
    pub remote: SocketAddr,
    /// Identity we presented
    pub local_id: Option<Identity>,
    /// Identity the peer presented
    pub remote_id: Option<Identity>,
    /// Private copy of the selected rule
    pub rule: Rule,
    /// Private candidate set; only ever shrinks
    pub rulebase: Rulebase,
    /// Lifecycle state
    pub state: SessionState,
    /// Whether we started the exchange
    pub initiator: bool,
    /// Engine id once known
    pub negotiation: Option<NegotiationId>,
    /// Whether Phase-2 work rides on this session
    pub want_phase2: bool,
    /// DPD sub-state
    pub dpd: DpdState,
    /// Cached Phase-2 lifetime in seconds, 0 for unset
    pub p2_lifetime_secs: u32,
    /// Cached Phase-2 lifetime in kilobytes, 0 for unset
    pub p2_lifetime_kb: u32,
    /// Work queued while larval, drained FIFO
    pub pending: VecDeque<PendingWork>,
}

impl Phase1Session {
    /// New larval session
    pub fn new(
        local: SocketAddr,
        remote: SocketAddr,
        rule: Rule,
        rulebase: Rulebase,
        initiator: bool,
    ) -> Self {
        Self {
            cookie_i: [0; COOKIE_LEN],
            cookie_r: [0; COOKIE_LEN],
            local,
            remote,
            local_id: None,
            remote_id: None,
            rule,
            rulebase,
            state: SessionState::Larval,
            initiator,
            negotiation: None,
            want_phase2: false,
            dpd: DpdState::random(),
            p2_lifetime_secs: 0,
            p2_lifetime_kb: 0,
            pending: VecDeque::new(),
        }
    }

    /// Whether the exchange has completed
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Both cookies, initiator first
    pub fn cookies(&self) -> Vec<u8> {
        crate::phase1::dpd::probe_spi(&self.cookie_i, &self.cookie_r)
    }
}

struct Slot {
    generation: u32,
    session: Option<Phase1Session>,
}

/// Arena of sessions
#[derive(Default)]
pub struct SessionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl SessionTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a session and return its handle
    pub fn insert(&mut self, session: Phase1Session) -> SessionHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.session = Some(session);
            return SessionHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            session: Some(session),
        });
        SessionHandle {
            index,
            generation: 0,
        }
    }

    /// Session behind `handle`, if it still exists
    pub fn get(&self, handle: SessionHandle) -> Option<&Phase1Session> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.session.as_ref())
    }

    /// Mutable session behind `handle`
    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Phase1Session> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.session.as_mut())
    }

    /// Unlink a session; its handle never resolves again
    pub fn remove(&mut self, handle: SessionHandle) -> Option<Phase1Session> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)?;
        let session = slot.session.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(session)
    }

    /// Live sessions in slot order
    pub fn iter(&self) -> impl Iterator<Item = (SessionHandle, &Phase1Session)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.session.as_ref().map(|s| {
                (
                    SessionHandle {
                        index: i as u32,
                        generation: slot.generation,
                    },
                    s,
                )
            })
        })
    }

    /// Handles of every live session
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.iter().map(|(h, _)| h).collect()
    }

    /// Live session count
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("live", &self.live)
            .field("slots", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pfkey::constants::{MsgType, SaType};
    use crate::pfkey::message::AddressExt;

    fn session(remote: &str) -> Phase1Session {
        Phase1Session::new(
            "10.0.0.1:500".parse().unwrap(),
            remote.parse().unwrap(),
            Rule::new("test"),
            Rulebase::new(),
            true,
        )
    }

    #[test]
    fn test_insert_get_remove() {
        let mut table = SessionTable::new();
        let h = table.insert(session("10.0.0.2:500"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(h).unwrap().state, SessionState::Larval);

        let removed = table.remove(h).unwrap();
        assert_eq!(removed.remote, "10.0.0.2:500".parse().unwrap());
        assert!(table.get(h).is_none());
        assert!(table.remove(h).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut table = SessionTable::new();
        let old = table.insert(session("10.0.0.2:500"));
        table.remove(old);
        let new = table.insert(session("10.0.0.3:500"));

        assert_eq!(old.index(), new.index());
        assert!(table.get(old).is_none());
        assert!(table.get_mut(old).is_none());
        assert_eq!(table.get(new).unwrap().remote.port(), 500);
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut table = SessionTable::new();
        let a = table.insert(session("10.0.0.2:500"));
        let b = table.insert(session("10.0.0.3:500"));
        table.remove(a);

        let handles = table.handles();
        assert_eq!(handles, vec![b]);
    }

    #[test]
    fn test_pending_work_endpoints() {
        let msg = Message::new(MsgType::Acquire, SaType::Esp)
            .with(AddressExt::new(ExtType::AddressSrc, "10.0.0.1:0".parse().unwrap()))
            .with(AddressExt::new(ExtType::AddressDst, "10.0.0.2:0".parse().unwrap()));

        let (local, remote) = PendingWork::Acquire(msg.clone()).endpoints().unwrap();
        assert_eq!(local.ip().to_string(), "10.0.0.1");
        assert_eq!(remote.ip().to_string(), "10.0.0.2");

        let (local, remote) = PendingWork::Dpd(msg).endpoints().unwrap();
        assert_eq!(local.ip().to_string(), "10.0.0.2");
        assert_eq!(remote.ip().to_string(), "10.0.0.1");
    }
}
