//! Initial-contact address cache
//!
//! One cache exists per local address. An entry says "a Phase-1 toward this
//! peer was started or completed recently", which suppresses a second
//! INITIAL-CONTACT when several ACQUIREs for the same peer arrive at once.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use crate::policy::addr_equal;

/// Fixed number of hash buckets
pub const ADDRCACHE_BUCKETS: usize = 64;

/// One cached peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrEntry {
    /// Peer address; the port is ignored, the IPv6 scope is kept for link-local
    pub addr: SocketAddr,
    /// Last time the entry was added or refreshed
    pub added: Instant,
    /// When the entry stops counting
    pub expires: Instant,
    /// How many Phase-1 requests refreshed the entry
    pub requests: u32,
}

/// Fixed-bucket peer cache for one local address
#[derive(Debug, Clone)]
pub struct AddressCache {
    buckets: Vec<Vec<AddrEntry>>,
}

fn bucket_of(addr: &SocketAddr) -> usize {
    let folded = match addr.ip() {
        IpAddr::V4(v4) => v4.octets().iter().fold(0u8, |acc, b| acc ^ b),
        IpAddr::V6(v6) => v6.octets().iter().fold(0u8, |acc, b| acc ^ b),
    };
    folded as usize % ADDRCACHE_BUCKETS
}

impl AddressCache {
    /// Empty cache
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); ADDRCACHE_BUCKETS],
        }
    }

    fn position(&self, bucket: usize, addr: &SocketAddr) -> Option<usize> {
        self.buckets[bucket]
            .iter()
            .position(|e| addr_equal(&e.addr, addr))
    }

    /// Add or refresh `addr`
    ///
    /// A refresh keeps the later of the old and new expiry and bumps the
    /// request count.
    pub fn add(&mut self, addr: &SocketAddr, expires: Instant, now: Instant) {
        let bucket = bucket_of(addr);
        let index = match self.position(bucket, addr) {
            Some(i) => i,
            None => {
                let mut stored = *addr;
                stored.set_port(0);
                if let SocketAddr::V6(v6) = &mut stored {
                    if !is_link_local(v6.ip()) {
                        v6.set_scope_id(0);
                    }
                }
                self.buckets[bucket].push(AddrEntry {
                    addr: stored,
                    added: now,
                    expires,
                    requests: 0,
                });
                self.buckets[bucket].len() - 1
            }
        };
        let entry = &mut self.buckets[bucket][index];
        entry.requests += 1;
        entry.added = now;
        entry.expires = entry.expires.max(expires);
    }

    /// Live entry for `addr`; expired entries read as absent
    pub fn check(&self, addr: &SocketAddr, now: Instant) -> Option<&AddrEntry> {
        let bucket = bucket_of(addr);
        self.position(bucket, addr)
            .map(|i| &self.buckets[bucket][i])
            .filter(|e| e.expires > now)
    }

    /// Forget `addr`
    pub fn delete(&mut self, addr: &SocketAddr) -> bool {
        let bucket = bucket_of(addr);
        match self.position(bucket, addr) {
            Some(i) => {
                self.buckets[bucket].swap_remove(i);
                true
            }
            None => false,
        }
    }

    /// Forget everything
    pub fn flush(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    /// Entries held, expired ones included
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Whether the cache holds nothing
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::new()
    }
}

fn is_link_local(ip: &std::net::Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}
