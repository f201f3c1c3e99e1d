//! Peer management
//!
//! Tracks connected peers by their transport-assigned id together with a
//! misbehavior score. Malformed messages cost points; a peer reaching 100
//! is banned and its messages are ignored.

use crate::constants::MALFORMED_MESSAGE_PENALTY;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Misbehavior score at which a peer is banned
pub const BAN_THRESHOLD: u32 = 100;

/// Opaque peer identity, stable for the lifetime of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    /// Banned due to misbehavior
    Banned,
}

/// Information about a peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Remote address, when the transport knows one
    pub addr: Option<SocketAddr>,
    pub state: PeerState,
    pub connected_at: Instant,
    pub last_seen: Instant,
    /// Highest best chain height the peer has shown us
    pub best_height: u32,
    pub malformed_messages: u32,
    /// Misbehavior score (100 = ban)
    pub misbehavior_score: u32,
}

impl PeerInfo {
    pub fn new(id: PeerId, addr: Option<SocketAddr>) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            state: PeerState::Connected,
            connected_at: now,
            last_seen: now,
            best_height: 0,
            malformed_messages: 0,
            misbehavior_score: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Add misbehavior points
    pub fn add_misbehavior(&mut self, points: u32) {
        self.misbehavior_score = self.misbehavior_score.saturating_add(points);
        if self.should_ban() {
            self.state = PeerState::Banned;
        }
    }

    pub fn should_ban(&self) -> bool {
        self.misbehavior_score >= BAN_THRESHOLD
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Peer manager
#[derive(Debug, Default)]
pub struct PeerManager {
    peers: HashMap<PeerId, PeerInfo>,
    max_connections: usize,
}

impl PeerManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_connections,
        }
    }

    /// Register a new connection. Returns false when the peer is banned or
    /// the connection limit is reached.
    pub fn peer_connected(&mut self, id: PeerId, addr: Option<SocketAddr>) -> bool {
        if let Some(existing) = self.peers.get(&id) {
            return existing.state == PeerState::Connected;
        }
        if self.connected_count() >= self.max_connections {
            return false;
        }
        self.peers.insert(id, PeerInfo::new(id, addr));
        true
    }

    pub fn peer_disconnected(&mut self, id: PeerId) {
        self.peers.remove(&id);
    }

    /// Record activity from a peer
    pub fn touch(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.touch();
        }
    }

    pub fn set_best_height(&mut self, id: PeerId, height: u32) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.best_height = peer.best_height.max(height);
        }
    }

    /// Count a malformed message; returns true if the peer is now banned
    pub fn report_malformed(&mut self, id: PeerId) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.malformed_messages += 1;
                peer.add_misbehavior(MALFORMED_MESSAGE_PENALTY);
                peer.should_ban()
            }
            None => false,
        }
    }

    /// Report misbehavior; returns true if the peer is now banned
    pub fn report_misbehavior(&mut self, id: PeerId, points: u32) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.add_misbehavior(points);
                peer.should_ban()
            }
            None => false,
        }
    }

    pub fn is_banned(&self, id: PeerId) -> bool {
        self.peers
            .get(&id)
            .map(|p| p.state == PeerState::Banned)
            .unwrap_or(false)
    }

    pub fn is_connected(&self, id: PeerId) -> bool {
        self.peers
            .get(&id)
            .map(|p| p.state == PeerState::Connected)
            .unwrap_or(false)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerInfo> {
        self.peers.get(&id)
    }

    /// Ids of connected, non-banned peers in ascending order
    pub fn connected_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .map(|p| p.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }

    /// Connected peers that have been silent longer than `timeout`
    pub fn stale_peers(&self, timeout: Duration) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Connected && p.is_stale(timeout))
            .map(|p| p.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_connection() {
        let mut pm = PeerManager::new(2);
        assert!(pm.peer_connected(PeerId(1), None));
        assert!(pm.peer_connected(PeerId(2), None));
        assert!(!pm.peer_connected(PeerId(3), None));
        assert_eq!(pm.connected_ids(), vec![PeerId(1), PeerId(2)]);

        pm.peer_disconnected(PeerId(1));
        assert_eq!(pm.connected_count(), 1);
        assert!(pm.peer_connected(PeerId(3), None));
    }

    #[test]
    fn test_malformed_messages_lead_to_ban() {
        let mut pm = PeerManager::new(8);
        pm.peer_connected(PeerId(7), None);

        for _ in 0..9 {
            assert!(!pm.report_malformed(PeerId(7)));
        }
        assert!(pm.is_connected(PeerId(7)));
        assert!(pm.report_malformed(PeerId(7)));
        assert!(pm.is_banned(PeerId(7)));
        assert!(pm.connected_ids().is_empty());
        assert_eq!(pm.get(PeerId(7)).unwrap().malformed_messages, 10);
    }

    #[test]
    fn test_banned_peer_cannot_reconnect_under_same_id() {
        let mut pm = PeerManager::new(8);
        pm.peer_connected(PeerId(1), None);
        pm.report_misbehavior(PeerId(1), 150);
        assert!(!pm.peer_connected(PeerId(1), None));
    }

    #[test]
    fn test_best_height_only_grows() {
        let mut pm = PeerManager::new(8);
        pm.peer_connected(PeerId(1), None);
        pm.set_best_height(PeerId(1), 10);
        pm.set_best_height(PeerId(1), 4);
        assert_eq!(pm.get(PeerId(1)).unwrap().best_height, 10);
    }
}
