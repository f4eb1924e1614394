//! Session orchestration: peer id to engine session mapping and the
//! offer/answer state machine

use super::engine::{EngineEvent, RtcEngine, SessionHandle};
use crate::broadcast::MediaSource;
use crate::events::EventBus;
use crate::registry::{ConnectionRegistry, PeerMetrics, PeerState};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

/// Orchestrator notifications
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A local ICE candidate to forward to the peer
    LocalCandidate { peer_id: String, candidate: Value },
    /// The peer's transport state changed (already written to the registry)
    StateChanged { peer_id: String, state: PeerState },
}

struct SessionEntry {
    handle: SessionHandle,
    /// Held for the duration of one negotiation step
    negotiation: Arc<tokio::sync::Mutex<()>>,
}

/// Owns the peer id to engine session mapping
pub struct SessionOrchestrator {
    engine: Arc<dyn RtcEngine>,
    registry: Arc<ConnectionRegistry>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    /// Reverse lookup for engine callbacks; stale handles are absent
    handles: RwLock<HashMap<SessionHandle, String>>,
    source: RwLock<Option<Arc<MediaSource>>>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    events: EventBus<OrchestratorEvent>,
    pump: AbortHandle,
    span: Span,
}

impl SessionOrchestrator {
    /// Create the orchestrator and start the engine event pump
    ///
    /// Must be called within a tokio runtime.
    pub fn new(engine: Arc<dyn RtcEngine>, registry: Arc<ConnectionRegistry>, parent: &Span) -> Arc<Self> {
        let span = info_span!(parent: parent, "orchestrator");
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let pump = tokio::spawn(event_pump(weak.clone(), engine_rx).instrument(span.clone()));

            Self {
                engine,
                registry,
                sessions: RwLock::new(HashMap::new()),
                handles: RwLock::new(HashMap::new()),
                source: RwLock::new(None),
                engine_tx,
                events: EventBus::default(),
                pump: pump.abort_handle(),
                span,
            }
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Create a fresh session for `peer_id`
    ///
    /// Any existing session for the peer is torn down first. The new session
    /// is bound to the current local source and the peer is registered as
    /// `Connecting`.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn create_session(&self, peer_id: &str) -> Result<SessionHandle> {
        self.teardown(peer_id).await;

        let handle = self
            .engine
            .create_session(peer_id, self.engine_tx.clone())
            .await
            .map_err(|e| {
                error!("Failed to create session for {}: {}", peer_id, e);
                e
            })?;

        // Record the session before the first await so a cancelled caller
        // still leaves it reachable by close_session.
        let replaced = {
            let mut sessions = self.sessions.write();
            let mut handles = self.handles.write();
            handles.insert(handle, peer_id.to_string());
            let replaced = sessions.insert(
                peer_id.to_string(),
                SessionEntry {
                    handle,
                    negotiation: Arc::new(tokio::sync::Mutex::new(())),
                },
            );
            if let Some(old) = &replaced {
                handles.remove(&old.handle);
            }
            replaced
        };

        // A concurrent create for the same peer won the insert race.
        if let Some(old) = replaced {
            warn!("Replacing concurrently created session {} for {}", old.handle, peer_id);
            self.close_detached(old).await;
        }

        let source = self.source.read().clone();
        if let Some(source) = source {
            if let Err(e) = self.engine.attach_tracks(handle, Some(source)).await {
                error!("Failed to attach local source for {}: {}", peer_id, e);
                self.discard(peer_id, handle).await;
                return Err(e);
            }
        }

        if self.registry.contains(peer_id) {
            self.registry.update_state(peer_id, PeerState::Connecting);
        } else {
            self.registry.add(peer_id);
        }

        info!("Created {} for {}", handle, peer_id);
        Ok(handle)
    }

    /// Create and apply a local offer
    #[instrument(parent = &self.span, skip(self))]
    pub async fn create_offer(&self, peer_id: &str) -> Result<Value> {
        let (handle, negotiation) = self.session(peer_id)?;
        let _guard = negotiation.lock().await;

        let result = async {
            let offer = self.engine.create_offer(handle).await?;
            self.engine.set_local_description(handle, offer.clone()).await?;
            Ok::<Value, Error>(offer)
        }
        .await;

        logged(peer_id, "create offer", result)
    }

    /// Apply a remote offer and return the local answer
    #[instrument(parent = &self.span, skip(self, offer))]
    pub async fn handle_remote_offer(&self, peer_id: &str, offer: Value) -> Result<Value> {
        let (handle, negotiation) = self.session(peer_id)?;
        let _guard = negotiation.lock().await;

        let result = async {
            self.engine.set_remote_description(handle, offer).await?;
            let answer = self.engine.create_answer(handle).await?;
            self.engine.set_local_description(handle, answer.clone()).await?;
            Ok::<Value, Error>(answer)
        }
        .await;

        logged(peer_id, "handle remote offer", result)
    }

    /// Apply a remote answer to our outstanding offer
    #[instrument(parent = &self.span, skip(self, answer))]
    pub async fn handle_remote_answer(&self, peer_id: &str, answer: Value) -> Result<()> {
        let (handle, negotiation) = self.session(peer_id)?;
        let _guard = negotiation.lock().await;

        let result = self.engine.set_remote_description(handle, answer).await;
        logged(peer_id, "handle remote answer", result)
    }

    /// Add a trickled remote candidate
    #[instrument(parent = &self.span, skip(self, candidate))]
    pub async fn handle_remote_ice_candidate(&self, peer_id: &str, candidate: Value) -> Result<()> {
        let (handle, negotiation) = self.session(peer_id)?;
        let _guard = negotiation.lock().await;

        let result = self.engine.add_ice_candidate(handle, candidate).await;
        logged(peer_id, "add remote ICE candidate", result)
    }

    /// Replace the local source on every live session
    ///
    /// Every session is attempted; the first failure is returned after all
    /// sessions were visited.
    #[instrument(parent = &self.span, skip(self, source))]
    pub async fn set_local_source(&self, source: Option<Arc<MediaSource>>) -> Result<()> {
        *self.source.write() = source.clone();

        let targets: Vec<(String, SessionHandle)> = self
            .sessions
            .read()
            .iter()
            .map(|(peer, entry)| (peer.clone(), entry.handle))
            .collect();

        let mut first_error = None;
        for (peer_id, handle) in targets {
            if let Err(e) = self.engine.attach_tracks(handle, source.clone()).await {
                error!("Failed to re-attach local source for {}: {}", peer_id, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Current local source
    pub fn local_source(&self) -> Option<Arc<MediaSource>> {
        self.source.read().clone()
    }

    /// Sample engine statistics for a peer
    pub async fn get_stats(&self, peer_id: &str) -> Result<PeerMetrics> {
        let (handle, _) = self.session(peer_id)?;
        self.engine.get_stats(handle).await
    }

    /// Push an outgoing bitrate cap to the engine
    pub async fn apply_bitrate(&self, peer_id: &str, bitrate: u64) -> Result<()> {
        let (handle, _) = self.session(peer_id)?;
        self.engine.apply_bitrate(handle, bitrate).await
    }

    /// Close a peer's session and drop its registry entry; no-op if absent
    #[instrument(parent = &self.span, skip(self))]
    pub async fn close_session(&self, peer_id: &str) {
        if self.teardown(peer_id).await {
            info!("Closed session for {}", peer_id);
        }
        self.registry.remove(peer_id);
    }

    /// Close every session
    pub async fn close_all(&self) {
        let peers = self.peers();
        for peer_id in peers {
            self.close_session(&peer_id).await;
        }
    }

    /// Peers with a live session
    pub fn peers(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.read().contains_key(peer_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Engine handle of a peer's current session
    pub fn handle(&self, peer_id: &str) -> Option<SessionHandle> {
        self.sessions.read().get(peer_id).map(|e| e.handle)
    }

    fn session(&self, peer_id: &str) -> Result<(SessionHandle, Arc<tokio::sync::Mutex<()>>)> {
        self.sessions
            .read()
            .get(peer_id)
            .map(|e| (e.handle, e.negotiation.clone()))
            .ok_or_else(|| Error::SessionNotFound(peer_id.to_string()))
    }

    /// Remove the peer's session from the tables and close it in the engine
    async fn teardown(&self, peer_id: &str) -> bool {
        let entry = {
            let mut sessions = self.sessions.write();
            let entry = sessions.remove(peer_id);
            if let Some(entry) = &entry {
                self.handles.write().remove(&entry.handle);
            }
            entry
        };

        let Some(entry) = entry else {
            return false;
        };

        self.close_detached(entry).await;
        true
    }

    /// Remove `handle` from the tables if it is still the peer's session, then close it
    async fn discard(&self, peer_id: &str, handle: SessionHandle) {
        let entry = {
            let mut sessions = self.sessions.write();
            if sessions.get(peer_id).is_some_and(|e| e.handle == handle) {
                self.handles.write().remove(&handle);
                sessions.remove(peer_id)
            } else {
                None
            }
        };

        match entry {
            Some(entry) => self.close_detached(entry).await,
            None => {
                if let Err(e) = self.engine.close(handle).await {
                    warn!("Error closing {} for {}: {}", handle, peer_id, e);
                }
            }
        }
    }

    /// Close an entry already removed from the tables
    ///
    /// The close runs on its own task so it completes even if the caller
    /// is cancelled.
    async fn close_detached(&self, entry: SessionEntry) {
        let engine = self.engine.clone();
        let closing = tokio::spawn(
            async move {
                // Wait out an in-flight negotiation step before closing.
                let _guard = entry.negotiation.lock().await;
                if let Err(e) = engine.close(entry.handle).await {
                    warn!("Error closing {}: {}", entry.handle, e);
                }
            }
            .instrument(self.span.clone()),
        );

        if let Err(e) = closing.await {
            warn!("Session close task failed: {}", e);
        }
    }

    fn on_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::StateChanged { handle, state } => {
                let Some(peer_id) = self.handles.read().get(&handle).cloned() else {
                    debug!("Ignoring {:?} from stale {}", state, handle);
                    return;
                };

                let peer_state = PeerState::from(state);
                info!("Peer {} transport {:?} -> {:?}", peer_id, state, peer_state);
                self.registry.update_state(&peer_id, peer_state);
                self.events.emit(OrchestratorEvent::StateChanged {
                    peer_id,
                    state: peer_state,
                });
            }
            EngineEvent::LocalCandidate { handle, candidate } => {
                let Some(peer_id) = self.handles.read().get(&handle).cloned() else {
                    debug!("Ignoring candidate from stale {}", handle);
                    return;
                };
                self.events
                    .emit(OrchestratorEvent::LocalCandidate { peer_id, candidate });
            }
        }
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn event_pump(orchestrator: Weak<SessionOrchestrator>, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        orchestrator.on_engine_event(event);
    }
    debug!("Engine event pump terminated");
}

fn logged<T>(peer_id: &str, operation: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        error!("Failed to {} for {}: {}", operation, peer_id, e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::MediaTrack;
    use crate::session::engine::EngineConnectionState;
    use crate::session::mock::{MockEngine, MockOp};
    use serde_json::json;

    fn setup() -> (Arc<MockEngine>, Arc<ConnectionRegistry>, Arc<SessionOrchestrator>) {
        let engine = Arc::new(MockEngine::new());
        let registry = Arc::new(ConnectionRegistry::new(&Span::none()));
        let orchestrator = SessionOrchestrator::new(engine.clone(), registry.clone(), &Span::none());
        (engine, registry, orchestrator)
    }

    #[tokio::test]
    async fn test_create_session_registers_connecting() {
        let (engine, registry, orchestrator) = setup();

        orchestrator.create_session("alice").await.unwrap();
        assert!(orchestrator.has_session("alice"));
        assert_eq!(registry.get("alice").unwrap().state, PeerState::Connecting);
        assert_eq!(engine.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_recreate_tears_down_previous() {
        let (engine, registry, orchestrator) = setup();

        let first = orchestrator.create_session("alice").await.unwrap();
        registry.update_state("alice", PeerState::Failed);
        let second = orchestrator.create_session("alice").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(engine.open_sessions(), 1);
        assert_eq!(engine.closed_sessions(), 1);
        assert_eq!(registry.get("alice").unwrap().state, PeerState::Connecting);
        assert_eq!(orchestrator.handle("alice"), Some(second));
    }

    #[tokio::test]
    async fn test_negotiation_without_session_fails() {
        let (_engine, _registry, orchestrator) = setup();

        let err = orchestrator.create_offer("ghost").await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
        assert!(orchestrator
            .handle_remote_answer("ghost", json!({"type": "answer", "sdp": ""}))
            .await
            .is_err());
        assert!(orchestrator
            .handle_remote_ice_candidate("ghost", json!({"candidate": ""}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_offer_answer_flow() {
        let (engine, _registry, orchestrator) = setup();
        orchestrator.create_session("bob").await.unwrap();

        let offer = orchestrator.create_offer("bob").await.unwrap();
        assert_eq!(offer["type"], "offer");
        assert_eq!(engine.local_description("bob").unwrap(), offer);

        orchestrator
            .handle_remote_answer("bob", json!({"type": "answer", "sdp": "remote"}))
            .await
            .unwrap();
        assert_eq!(engine.remote_description("bob").unwrap()["sdp"], "remote");

        orchestrator
            .handle_remote_ice_candidate("bob", json!({"candidate": "candidate:1 1 udp"}))
            .await
            .unwrap();
        assert_eq!(engine.candidates("bob").len(), 1);
    }

    #[tokio::test]
    async fn test_remote_offer_produces_answer() {
        let (_engine, _registry, orchestrator) = setup();
        orchestrator.create_session("viewer").await.unwrap();

        let answer = orchestrator
            .handle_remote_offer("viewer", json!({"type": "offer", "sdp": "v=0"}))
            .await
            .unwrap();
        assert_eq!(answer["type"], "answer");
    }

    #[tokio::test]
    async fn test_engine_error_is_returned() {
        let (engine, _registry, orchestrator) = setup();
        orchestrator.create_session("carol").await.unwrap();
        engine.fail_next(MockOp::CreateOffer, 1);

        assert!(matches!(
            orchestrator.create_offer("carol").await,
            Err(Error::EngineError(_))
        ));
        // The session survives and the next attempt works
        assert!(orchestrator.create_offer("carol").await.is_ok());
    }

    #[tokio::test]
    async fn test_state_changes_reach_registry() {
        let (engine, registry, orchestrator) = setup();
        let mut events = orchestrator.subscribe();
        orchestrator.create_session("dave").await.unwrap();

        engine.emit_state("dave", EngineConnectionState::Connected);
        match events.recv().await.unwrap() {
            OrchestratorEvent::StateChanged { peer_id, state } => {
                assert_eq!(peer_id, "dave");
                assert_eq!(state, PeerState::Connected);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(registry.is_connected("dave"));

        engine.emit_candidate("dave", json!({"candidate": "candidate:2"}));
        assert!(matches!(
            events.recv().await.unwrap(),
            OrchestratorEvent::LocalCandidate { .. }
        ));
    }

    #[tokio::test]
    async fn test_stale_handle_events_ignored() {
        let (engine, registry, orchestrator) = setup();
        let mut events = orchestrator.subscribe();

        let stale = orchestrator.create_session("erin").await.unwrap();
        orchestrator.create_session("erin").await.unwrap();

        engine.emit_state_for(stale, EngineConnectionState::Failed);
        engine.emit_state("erin", EngineConnectionState::Connected);

        match events.recv().await.unwrap() {
            OrchestratorEvent::StateChanged { state, .. } => assert_eq!(state, PeerState::Connected),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(registry.get("erin").unwrap().state, PeerState::Connected);
    }

    #[tokio::test]
    async fn test_local_source_attached_and_replaced() {
        let (engine, _registry, orchestrator) = setup();
        let first = Arc::new(MediaSource::new(vec![MediaTrack::video("Display 1")]));
        orchestrator.set_local_source(Some(first.clone())).await.unwrap();

        orchestrator.create_session("a").await.unwrap();
        orchestrator.create_session("b").await.unwrap();
        assert_eq!(engine.attached_source("a").unwrap().id, first.id);

        let second = Arc::new(MediaSource::new(vec![MediaTrack::video("Display 2")]));
        orchestrator.set_local_source(Some(second.clone())).await.unwrap();
        assert_eq!(engine.attached_source("a").unwrap().id, second.id);
        assert_eq!(engine.attached_source("b").unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (engine, registry, orchestrator) = setup();
        orchestrator.create_session("frank").await.unwrap();

        orchestrator.close_session("frank").await;
        orchestrator.close_session("frank").await;
        assert!(!orchestrator.has_session("frank"));
        assert!(!registry.contains("frank"));
        assert_eq!(engine.closed_sessions(), 1);

        orchestrator.create_session("g").await.unwrap();
        orchestrator.create_session("h").await.unwrap();
        orchestrator.close_all().await;
        orchestrator.close_all().await;
        assert_eq!(orchestrator.session_count(), 0);
        assert_eq!(registry.total_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_create_still_closes_on_teardown() {
        let (engine, registry, orchestrator) = setup();
        let source = Arc::new(MediaSource::new(vec![MediaTrack::video("Display 1")]));
        orchestrator.set_local_source(Some(source)).await.unwrap();
        engine.stall_next(MockOp::AttachTracks, 1);

        let creating = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.create_session("hank").await }
        });
        while engine.calls(MockOp::AttachTracks) == 0 {
            tokio::task::yield_now().await;
        }
        creating.abort();
        assert!(creating.await.unwrap_err().is_cancelled());

        assert!(orchestrator.has_session("hank"));
        assert_eq!(engine.open_sessions(), 1);

        orchestrator.close_session("hank").await;
        assert_eq!(engine.open_sessions(), 0);
        assert!(!registry.contains("hank"));
    }

    #[tokio::test]
    async fn test_attach_failure_closes_new_session() {
        let (engine, registry, orchestrator) = setup();
        let source = Arc::new(MediaSource::new(vec![MediaTrack::audio("mic")]));
        orchestrator.set_local_source(Some(source)).await.unwrap();
        engine.fail_next(MockOp::AttachTracks, 1);

        assert!(orchestrator.create_session("iris").await.is_err());
        assert!(!orchestrator.has_session("iris"));
        assert!(!registry.contains("iris"));
        assert_eq!(engine.open_sessions(), 0);
        assert_eq!(engine.closed_sessions(), 1);
    }

    #[tokio::test]
    async fn test_create_session_failure_leaves_no_entry() {
        let (engine, registry, orchestrator) = setup();
        engine.fail_next(MockOp::CreateSession, 1);

        assert!(orchestrator.create_session("gina").await.is_err());
        assert!(!orchestrator.has_session("gina"));
        assert!(!registry.contains("gina"));
    }
}
