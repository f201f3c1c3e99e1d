//! Inventory tracking
//!
//! Remembers which peers announced which objects and which requests are in
//! flight, so an object is fetched from one peer at a time. A request that
//! goes unanswered for the retention window is moved to another announcer.

use crate::crypto::MiniPow;
use crate::p2p::PeerId;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// An announced object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvKey {
    Trx(u64),
    Block(MiniPow),
}

impl fmt::Display for InvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvKey::Trx(id) => write!(f, "trx {:016x}", id),
            InvKey::Block(id) => write!(f, "block {}", id.short()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    peer: PeerId,
    since: Instant,
}

#[derive(Debug)]
pub struct InventoryTracker {
    window: Duration,
    in_flight: HashMap<InvKey, InFlight>,
    announcers: HashMap<InvKey, Vec<PeerId>>,
    /// Objects received recently, with the time they arrived
    seen: HashMap<InvKey, Instant>,
}

impl InventoryTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            in_flight: HashMap::new(),
            announcers: HashMap::new(),
            seen: HashMap::new(),
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Record that `peer` has `key`. Returns true when the object should be
    /// requested from `peer` now.
    pub fn announce(&mut self, key: InvKey, peer: PeerId) -> bool {
        if self.seen.contains_key(&key) {
            return false;
        }
        let announcers = self.announcers.entry(key).or_default();
        if !announcers.contains(&peer) {
            announcers.push(peer);
        }
        !self.in_flight.contains_key(&key)
    }

    pub fn mark_requested(&mut self, key: InvKey, peer: PeerId, now: Instant) {
        self.in_flight.insert(key, InFlight { peer, since: now });
    }

    pub fn is_in_flight(&self, key: &InvKey) -> bool {
        self.in_flight.contains_key(key)
    }

    /// The object arrived; late responses to other requests become no-ops
    pub fn received(&mut self, key: InvKey, now: Instant) {
        self.in_flight.remove(&key);
        self.announcers.remove(&key);
        self.seen.insert(key, now);
    }

    /// Requests older than the window, each reassigned to a different
    /// announcer picked at random. Requests with nobody left to ask are
    /// dropped.
    pub fn expired(&mut self, now: Instant) -> Vec<(InvKey, PeerId)> {
        let stale: Vec<(InvKey, PeerId)> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now.saturating_duration_since(f.since) >= self.window)
            .map(|(key, f)| (*key, f.peer))
            .collect();

        let mut retries = Vec::new();
        for (key, previous) in stale {
            match self.reassign(key, previous, now) {
                Some(peer) => retries.push((key, peer)),
                None => {
                    self.in_flight.remove(&key);
                    self.announcers.remove(&key);
                }
            }
        }
        retries
    }

    fn reassign(&mut self, key: InvKey, previous: PeerId, now: Instant) -> Option<PeerId> {
        let announcers = self.announcers.get_mut(&key)?;
        announcers.retain(|p| *p != previous);
        let peer = *announcers.choose(&mut rand::thread_rng())?;
        self.in_flight.insert(key, InFlight { peer, since: now });
        Some(peer)
    }

    /// Forget a peer; its in-flight requests move to other announcers
    pub fn peer_disconnected(&mut self, peer: PeerId, now: Instant) -> Vec<(InvKey, PeerId)> {
        let orphaned: Vec<InvKey> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.peer == peer)
            .map(|(key, _)| *key)
            .collect();

        let mut retries = Vec::new();
        for key in orphaned {
            match self.reassign(key, peer, now) {
                Some(next) => retries.push((key, next)),
                None => {
                    self.in_flight.remove(&key);
                }
            }
        }
        for announcers in self.announcers.values_mut() {
            announcers.retain(|p| *p != peer);
        }
        self.announcers.retain(|_, a| !a.is_empty());
        retries
    }

    /// Forget received objects older than the window
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < window);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
