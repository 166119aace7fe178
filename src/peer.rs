//! Peer records and the registry that tracks their liveness.
//!
//! Peers are never deleted. A peer that stops announcing is marked inactive
//! by the timeout sweep and comes back as `Updated` when it is heard again.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

/// Another ZTalk node seen on the LAN.
///
/// Equality and hashing look at `peer_id` only.
#[derive(Debug, Clone, Serialize)]
pub struct Peer {
    pub peer_id: String,
    pub display_name: String,
    pub ip_address: Ipv4Addr,
    pub port: u16,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
    pub properties: BTreeMap<String, String>,
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer_id.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) at {}:{}",
            self.display_name, self.peer_id, self.ip_address, self.port
        )
    }
}

/// What happened to a peer. Each event carries a snapshot of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Added(Peer),
    Updated(Peer),
    Removed(Peer),
    TimedOut(Peer),
}

impl PeerEvent {
    pub fn peer(&self) -> &Peer {
        match self {
            Self::Added(peer) | Self::Updated(peer) | Self::Removed(peer) | Self::TimedOut(peer) => {
                peer
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Updated(_) => "updated",
            Self::Removed(_) => "removed",
            Self::TimedOut(_) => "timeout",
        }
    }
}

impl fmt::Display for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {}: {}", self.kind(), self.peer())
    }
}

/// Peer id → peer record.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting of `peer_id`.
    ///
    /// Returns `Added` the first time the id is seen and `Updated` on every
    /// later sighting, including one that revives an inactive peer.
    pub fn observe(
        &mut self,
        peer_id: &str,
        display_name: &str,
        ip_address: Ipv4Addr,
        port: u16,
        properties: BTreeMap<String, String>,
    ) -> PeerEvent {
        self.observe_at(Utc::now(), peer_id, display_name, ip_address, port, properties)
    }

    pub fn observe_at(
        &mut self,
        now: DateTime<Utc>,
        peer_id: &str,
        display_name: &str,
        ip_address: Ipv4Addr,
        port: u16,
        properties: BTreeMap<String, String>,
    ) -> PeerEvent {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.display_name = display_name.to_string();
                peer.ip_address = ip_address;
                peer.port = port;
                peer.properties = properties;
                peer.last_seen = now;
                peer.active = true;
                PeerEvent::Updated(peer.clone())
            }
            None => {
                let peer = Peer {
                    peer_id: peer_id.to_string(),
                    display_name: display_name.to_string(),
                    ip_address,
                    port,
                    last_seen: now,
                    active: true,
                    properties,
                };
                self.peers.insert(peer.peer_id.clone(), peer.clone());
                PeerEvent::Added(peer)
            }
        }
    }

    /// Marks an active peer inactive after its service was withdrawn.
    pub fn mark_removed(&mut self, peer_id: &str) -> Option<PeerEvent> {
        let peer = self.peers.get_mut(peer_id).filter(|peer| peer.active)?;
        peer.active = false;
        Some(PeerEvent::Removed(peer.clone()))
    }

    /// Marks every active peer silent for longer than `threshold` inactive.
    pub fn sweep_timeouts(&mut self, threshold: Duration) -> Vec<PeerEvent> {
        self.sweep_timeouts_at(Utc::now(), threshold)
    }

    pub fn sweep_timeouts_at(&mut self, now: DateTime<Utc>, threshold: Duration) -> Vec<PeerEvent> {
        let threshold = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);

        let mut events: Vec<PeerEvent> = self
            .peers
            .values_mut()
            .filter(|peer| peer.active && now - peer.last_seen > threshold)
            .map(|peer| {
                peer.active = false;
                PeerEvent::TimedOut(peer.clone())
            })
            .collect();
        events.sort_by(|a, b| a.peer().peer_id.cmp(&b.peer().peer_id));
        events
    }

    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn list_active(&self) -> Vec<Peer> {
        self.sorted(|peer| peer.active)
    }

    pub fn list_all(&self) -> Vec<Peer> {
        self.sorted(|_| true)
    }

    fn sorted(&self, keep: impl Fn(&Peer) -> bool) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().filter(|peer| keep(peer)).cloned().collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 20);

    fn observe(registry: &mut PeerRegistry, now: DateTime<Utc>, id: &str) -> PeerEvent {
        registry.observe_at(now, id, "alice", ADDR, 8989, BTreeMap::new())
    }

    #[test]
    fn test_first_sighting_added_then_updated() {
        let mut registry = PeerRegistry::new();
        let now = Utc::now();

        let first = observe(&mut registry, now, "peer-1");
        assert!(matches!(first, PeerEvent::Added(_)));

        let props = BTreeMap::from([("version".to_string(), "1.0".to_string())]);
        let second = registry.observe_at(
            now + TimeDelta::seconds(5),
            "peer-1",
            "alice2",
            Ipv4Addr::new(10, 0, 0, 21),
            9000,
            props,
        );
        match second {
            PeerEvent::Updated(peer) => {
                assert_eq!(peer.display_name, "alice2");
                assert_eq!(peer.ip_address, Ipv4Addr::new(10, 0, 0, 21));
                assert_eq!(peer.port, 9000);
                assert_eq!(peer.properties["version"], "1.0");
                assert_eq!(peer.last_seen, now + TimeDelta::seconds(5));
            }
            other => panic!("expected Updated, got {:?}", other),
        }
        assert_eq!(registry.list_all().len(), 1);
    }

    #[test]
    fn test_peer_equality_by_id() {
        let mut registry = PeerRegistry::new();
        let now = Utc::now();
        let a = observe(&mut registry, now, "same").peer().clone();
        let mut b = a.clone();
        b.display_name = "someone else".to_string();
        b.port = 1;
        assert_eq!(a, b);
    }

    #[test]
    fn test_timeout_marks_inactive_but_keeps_peer() {
        let mut registry = PeerRegistry::new();
        let seen = Utc::now();
        observe(&mut registry, seen, "peer-42");

        let events = registry.sweep_timeouts_at(seen + TimeDelta::seconds(91), Duration::from_secs(90));

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PeerEvent::TimedOut(peer) if peer.peer_id == "peer-42"));
        assert!(registry.list_active().is_empty());
        assert_eq!(registry.list_all().len(), 1);
        assert!(!registry.get("peer-42").unwrap().active);
    }

    #[test]
    fn test_timeout_exactly_at_threshold_keeps_peer() {
        let mut registry = PeerRegistry::new();
        let seen = Utc::now();
        observe(&mut registry, seen, "peer-1");

        let events = registry.sweep_timeouts_at(seen + TimeDelta::seconds(90), Duration::from_secs(90));
        assert!(events.is_empty());
        assert_eq!(registry.list_active().len(), 1);
    }

    #[test]
    fn test_timeout_independence() {
        let mut registry = PeerRegistry::new();
        let start = Utc::now();
        observe(&mut registry, start, "old");
        observe(&mut registry, start + TimeDelta::seconds(60), "fresh");

        let events = registry.sweep_timeouts_at(start + TimeDelta::seconds(100), Duration::from_secs(90));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].peer().peer_id, "old");
        let active: Vec<String> = registry.list_active().into_iter().map(|p| p.peer_id).collect();
        assert_eq!(active, vec!["fresh".to_string()]);
    }

    #[test]
    fn test_timed_out_peer_reported_once() {
        let mut registry = PeerRegistry::new();
        let seen = Utc::now();
        observe(&mut registry, seen, "peer-1");

        let later = seen + TimeDelta::seconds(200);
        assert_eq!(registry.sweep_timeouts_at(later, Duration::from_secs(90)).len(), 1);
        assert!(registry.sweep_timeouts_at(later, Duration::from_secs(90)).is_empty());
    }

    #[test]
    fn test_revived_peer_is_updated_and_active() {
        let mut registry = PeerRegistry::new();
        let seen = Utc::now();
        observe(&mut registry, seen, "peer-1");
        registry.sweep_timeouts_at(seen + TimeDelta::seconds(91), Duration::from_secs(90));

        let event = observe(&mut registry, seen + TimeDelta::seconds(95), "peer-1");
        assert!(matches!(event, PeerEvent::Updated(ref peer) if peer.active));
        assert_eq!(registry.list_active().len(), 1);
    }

    #[test]
    fn test_mark_removed() {
        let mut registry = PeerRegistry::new();
        observe(&mut registry, Utc::now(), "peer-1");

        let event = registry.mark_removed("peer-1");
        assert!(matches!(event, Some(PeerEvent::Removed(ref peer)) if !peer.active));
        assert!(registry.mark_removed("peer-1").is_none());
        assert!(registry.mark_removed("unknown").is_none());
        assert_eq!(registry.list_all().len(), 1);
    }

    #[test]
    fn test_event_kind_and_display() {
        let mut registry = PeerRegistry::new();
        let event = observe(&mut registry, Utc::now(), "peer-1");
        assert_eq!(event.kind(), "added");
        assert_eq!(event.to_string(), "peer added: alice (peer-1) at 10.0.0.20:8989");
    }
}
