//! Connection registry: the single source of truth for per-peer state
//!
//! Every other component refers to peers by id and reads snapshots from
//! here. All mutations happen under one write lock, so a read-modify-write
//! on a peer (state change plus event selection) is never observed half done.

use crate::events::EventBus;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, Span};

/// Lifecycle state of a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Session created, negotiation not complete
    Connecting,
    /// Negotiation complete and transport confirmed live
    Connected,
    /// Transport closed or interrupted
    Disconnected,
    /// Transport failed
    Failed,
}

/// Last sampled health snapshot for one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMetrics {
    /// Outbound bitrate in bits per second
    pub bitrate: f64,
    /// Round-trip latency in milliseconds
    pub latency_ms: f64,
    /// Outbound video frames per second
    pub frame_rate: f64,
    /// Packets reported lost by the remote side
    pub packets_lost: f64,
}

/// One remote participant
#[derive(Debug, Clone)]
pub struct PeerSession {
    /// Peer identifier
    pub peer_id: String,
    /// Lifecycle state
    pub state: PeerState,
    /// When the registry entry was created
    pub created_at: Instant,
    /// Last state or metrics update
    pub last_activity_at: Instant,
    /// Last sampled metrics
    pub metrics: PeerMetrics,
}

impl PeerSession {
    fn new(peer_id: String) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            state: PeerState::Connecting,
            created_at: now,
            last_activity_at: now,
            metrics: PeerMetrics::default(),
        }
    }

    /// Time since the entry was created
    pub fn duration(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last update
    pub fn idle_for(&self) -> Duration {
        self.last_activity_at.elapsed()
    }
}

/// Registry change notification
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A peer entry was created
    Added(PeerSession),
    /// A peer entered `Connected`
    Connected(PeerSession),
    /// A peer left `Connected`
    Disconnected(PeerSession),
    /// Any other state or metrics update
    Updated(PeerSession),
    /// A peer entry was removed
    Removed(PeerSession),
}

impl RegistryEvent {
    /// Peer the event refers to
    pub fn peer_id(&self) -> &str {
        match self {
            RegistryEvent::Added(s)
            | RegistryEvent::Connected(s)
            | RegistryEvent::Disconnected(s)
            | RegistryEvent::Updated(s)
            | RegistryEvent::Removed(s) => &s.peer_id,
        }
    }
}

/// Averages over active peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    /// Peers in `Connected`
    pub active_connections: usize,
    /// All registered peers
    pub total_connections: usize,
    /// Mean metrics over active peers (zeros when none)
    pub average: PeerMetrics,
}

/// Authoritative per-peer state table
pub struct ConnectionRegistry {
    peers: RwLock<HashMap<String, PeerSession>>,
    events: EventBus<RegistryEvent>,
    span: Span,
}

impl ConnectionRegistry {
    /// Create an empty registry logging under `parent`
    pub fn new(parent: &Span) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            events: EventBus::default(),
            span: info_span!(parent: parent, "registry"),
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a peer in `Connecting`
    ///
    /// If the peer is already present the existing record is returned
    /// unchanged and no event is emitted.
    pub fn add(&self, peer_id: &str) -> PeerSession {
        let _enter = self.span.enter();
        let mut peers = self.peers.write();

        if let Some(existing) = peers.get(peer_id) {
            debug!("Peer {} already registered, keeping existing entry", peer_id);
            return existing.clone();
        }

        let session = PeerSession::new(peer_id.to_string());
        peers.insert(peer_id.to_string(), session.clone());
        self.events.emit(RegistryEvent::Added(session.clone()));
        info!("Connection added: {}", peer_id);

        session
    }

    /// Remove a peer; no-op if absent
    pub fn remove(&self, peer_id: &str) -> Option<PeerSession> {
        let _enter = self.span.enter();
        let removed = self.peers.write().remove(peer_id);

        if let Some(ref session) = removed {
            self.events.emit(RegistryEvent::Removed(session.clone()));
            info!("Connection removed: {}", peer_id);
        }

        removed
    }

    /// Snapshot of one peer
    pub fn get(&self, peer_id: &str) -> Option<PeerSession> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Check if a peer is registered
    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    /// Set a peer's lifecycle state
    ///
    /// Emits exactly one event: `Connected` on entering `Connected`,
    /// `Disconnected` on leaving it, `Updated` otherwise (including a
    /// repeated state). Returns the updated snapshot, or `None` if the peer
    /// is not registered.
    pub fn update_state(&self, peer_id: &str, state: PeerState) -> Option<PeerSession> {
        let _enter = self.span.enter();
        let mut peers = self.peers.write();
        let session = peers.get_mut(peer_id)?;

        let previous = session.state;
        session.state = state;
        session.last_activity_at = Instant::now();
        let snapshot = session.clone();

        let event = match (previous == PeerState::Connected, state == PeerState::Connected) {
            (false, true) => RegistryEvent::Connected(snapshot.clone()),
            (true, false) => RegistryEvent::Disconnected(snapshot.clone()),
            _ => RegistryEvent::Updated(snapshot.clone()),
        };
        // Emitted under the lock so subscribers see events in mutation order.
        self.events.emit(event);
        drop(peers);

        info!("Connection state updated: {} {:?} -> {:?}", peer_id, previous, state);
        Some(snapshot)
    }

    /// Replace a peer's metrics snapshot
    pub fn update_metrics(&self, peer_id: &str, metrics: PeerMetrics) -> Option<PeerSession> {
        let mut peers = self.peers.write();
        let session = peers.get_mut(peer_id)?;

        session.metrics = metrics;
        session.last_activity_at = Instant::now();
        let snapshot = session.clone();
        self.events.emit(RegistryEvent::Updated(snapshot.clone()));

        Some(snapshot)
    }

    /// Peers in `Connected`
    pub fn list_active(&self) -> Vec<PeerSession> {
        self.peers
            .read()
            .values()
            .filter(|s| s.state == PeerState::Connected)
            .cloned()
            .collect()
    }

    /// All registered peers regardless of state
    pub fn list_all(&self) -> Vec<PeerSession> {
        self.peers.read().values().cloned().collect()
    }

    /// Number of peers in `Connected`
    pub fn active_count(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|s| s.state == PeerState::Connected)
            .count()
    }

    /// Number of registered peers
    pub fn total_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Check if a peer is in `Connected`
    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers
            .read()
            .get(peer_id)
            .is_some_and(|s| s.state == PeerState::Connected)
    }

    /// Time since the peer was registered, if present
    pub fn connection_duration(&self, peer_id: &str) -> Option<Duration> {
        self.peers.read().get(peer_id).map(PeerSession::duration)
    }

    /// Average metrics over active peers
    pub fn aggregate(&self) -> AggregateStats {
        let peers = self.peers.read();
        let active: Vec<&PeerSession> = peers
            .values()
            .filter(|s| s.state == PeerState::Connected)
            .collect();

        let mut stats = AggregateStats {
            active_connections: active.len(),
            total_connections: peers.len(),
            average: PeerMetrics::default(),
        };

        if active.is_empty() {
            return stats;
        }

        let count = active.len() as f64;
        let totals = active.iter().fold(PeerMetrics::default(), |acc, s| PeerMetrics {
            bitrate: acc.bitrate + s.metrics.bitrate,
            latency_ms: acc.latency_ms + s.metrics.latency_ms,
            frame_rate: acc.frame_rate + s.metrics.frame_rate,
            packets_lost: acc.packets_lost + s.metrics.packets_lost,
        });

        stats.average = PeerMetrics {
            bitrate: totals.bitrate / count,
            latency_ms: totals.latency_ms / count,
            frame_rate: totals.frame_rate / count,
            packets_lost: totals.packets_lost / count,
        };
        stats
    }

    /// Remove every peer, emitting `Removed` for each
    pub fn clear(&self) {
        let _enter = self.span.enter();
        let drained: Vec<PeerSession> = self.peers.write().drain().map(|(_, s)| s).collect();

        for session in drained {
            self.events.emit(RegistryEvent::Removed(session));
        }
        info!("All connections cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(&Span::none())
    }

    #[test]
    fn test_add_then_remove() {
        let registry = registry();
        let session = registry.add("alice");
        assert_eq!(session.state, PeerState::Connecting);
        assert!(registry.contains("alice"));

        assert!(registry.remove("alice").is_some());
        assert!(registry.get("alice").is_none());
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_remove_absent_is_silent() {
        let registry = registry();
        let mut events = registry.subscribe();

        assert!(registry.remove("ghost").is_none());
        assert!(registry.remove("ghost").is_none());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_add_existing_returns_existing() {
        let registry = registry();
        registry.add("alice");
        registry.update_state("alice", PeerState::Connected);

        let mut events = registry.subscribe();
        let again = registry.add("alice");
        assert_eq!(again.state, PeerState::Connected);
        assert_eq!(registry.total_count(), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_connected_fires_exactly_once() {
        let registry = registry();
        registry.add("alice");
        let mut events = registry.subscribe();

        registry.update_state("alice", PeerState::Connected);
        registry.update_state("alice", PeerState::Connected);

        assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Connected(_)));
        assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Updated(_)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_disconnected_only_when_leaving_connected() {
        let registry = registry();
        registry.add("bob");
        let mut events = registry.subscribe();

        registry.update_state("bob", PeerState::Failed);
        assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Updated(_)));

        registry.update_state("bob", PeerState::Connected);
        registry.update_state("bob", PeerState::Disconnected);
        assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Connected(_)));
        match events.try_recv().unwrap() {
            RegistryEvent::Disconnected(s) => assert_eq!(s.state, PeerState::Disconnected),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_update_unknown_peer() {
        let registry = registry();
        assert!(registry.update_state("nobody", PeerState::Connected).is_none());
        assert!(registry.update_metrics("nobody", PeerMetrics::default()).is_none());
    }

    #[test]
    fn test_list_active_filters_connected() {
        let registry = registry();
        registry.add("a");
        registry.add("b");
        registry.add("c");
        registry.update_state("b", PeerState::Connected);

        let active = registry.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].peer_id, "b");
        assert_eq!(registry.list_all().len(), 3);
        assert!(registry.is_connected("b"));
        assert!(!registry.is_connected("a"));
    }

    #[test]
    fn test_aggregate_without_active_is_zero() {
        let registry = registry();
        registry.add("a");

        let stats = registry.aggregate();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.average, PeerMetrics::default());
    }

    #[test]
    fn test_aggregate_averages_active_only() {
        let registry = registry();
        for id in ["a", "b", "c"] {
            registry.add(id);
        }
        registry.update_state("a", PeerState::Connected);
        registry.update_state("b", PeerState::Connected);

        registry.update_metrics(
            "a",
            PeerMetrics {
                bitrate: 1_000_000.0,
                latency_ms: 100.0,
                frame_rate: 30.0,
                packets_lost: 2.0,
            },
        );
        registry.update_metrics(
            "b",
            PeerMetrics {
                bitrate: 3_000_000.0,
                latency_ms: 50.0,
                frame_rate: 20.0,
                packets_lost: 0.0,
            },
        );
        registry.update_metrics(
            "c",
            PeerMetrics {
                bitrate: 9_000_000.0,
                ..Default::default()
            },
        );

        let stats = registry.aggregate();
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.average.bitrate, 2_000_000.0);
        assert_eq!(stats.average.latency_ms, 75.0);
        assert_eq!(stats.average.frame_rate, 25.0);
        assert_eq!(stats.average.packets_lost, 1.0);
    }

    #[test]
    fn test_clear_emits_removed() {
        let registry = registry();
        registry.add("a");
        registry.add("b");
        let mut events = registry.subscribe();

        registry.clear();
        assert_eq!(registry.total_count(), 0);
        assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Removed(_)));
        assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Removed(_)));
        assert!(events.try_recv().is_err());
    }
}
