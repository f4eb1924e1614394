//! In-memory RTC engine for testing
//!
//! Produces canned descriptions, records everything the orchestrator asks
//! of it, and lets tests inject state transitions, candidates, stats and
//! failures per operation.

use super::engine::{EngineConnectionState, EngineEvent, RtcEngine, SessionHandle};
use crate::broadcast::MediaSource;
use crate::registry::PeerMetrics;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Engine operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateSession,
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription,
    AddIceCandidate,
    AttachTracks,
    GetStats,
}

#[derive(Default)]
struct MockSession {
    peer_id: String,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
    local: Option<Value>,
    remote: Option<Value>,
    candidates: Vec<Value>,
    source: Option<Arc<MediaSource>>,
    bitrate: Option<u64>,
    closed: bool,
}

#[derive(Default)]
struct MockState {
    sessions: HashMap<SessionHandle, MockSession>,
    failures: HashMap<MockOp, u32>,
    stalls: HashMap<MockOp, u32>,
    calls: HashMap<MockOp, u32>,
    stats: HashMap<String, PeerMetrics>,
}

/// Mock engine for tests
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
    next_handle: AtomicU64,
    auto_connect: bool,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Connected` as soon as an answer is applied on either side
    pub fn with_auto_connect() -> Self {
        Self {
            auto_connect: true,
            ..Self::default()
        }
    }

    /// Make the next `count` calls of `op` fail
    pub fn fail_next(&self, op: MockOp, count: u32) {
        self.state.lock().failures.insert(op, count);
    }

    /// Make the next `count` calls of `op` hang forever
    pub fn stall_next(&self, op: MockOp, count: u32) {
        self.state.lock().stalls.insert(op, count);
    }

    /// Number of times `op` was invoked
    pub fn calls(&self, op: MockOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Stats returned for every session of `peer_id`
    pub fn set_stats(&self, peer_id: &str, metrics: PeerMetrics) {
        self.state.lock().stats.insert(peer_id.to_string(), metrics);
    }

    /// Latest open session of a peer
    pub fn handle_for(&self, peer_id: &str) -> Option<SessionHandle> {
        let state = self.state.lock();
        state
            .sessions
            .iter()
            .filter(|(_, s)| s.peer_id == peer_id && !s.closed)
            .map(|(h, _)| *h)
            .max()
    }

    /// Emit a state transition on the peer's latest open session
    pub fn emit_state(&self, peer_id: &str, new_state: EngineConnectionState) -> bool {
        let Some(handle) = self.handle_for(peer_id) else {
            return false;
        };
        self.emit_state_for(handle, new_state)
    }

    /// Emit a state transition on a specific session, even a closed one
    pub fn emit_state_for(&self, handle: SessionHandle, new_state: EngineConnectionState) -> bool {
        let state = self.state.lock();
        state
            .sessions
            .get(&handle)
            .and_then(|s| s.events.as_ref())
            .is_some_and(|tx| {
                tx.send(EngineEvent::StateChanged {
                    handle,
                    state: new_state,
                })
                .is_ok()
            })
    }

    /// Emit a gathered local candidate on the peer's latest open session
    pub fn emit_candidate(&self, peer_id: &str, candidate: Value) -> bool {
        let Some(handle) = self.handle_for(peer_id) else {
            return false;
        };
        let state = self.state.lock();
        state
            .sessions
            .get(&handle)
            .and_then(|s| s.events.as_ref())
            .is_some_and(|tx| tx.send(EngineEvent::LocalCandidate { handle, candidate }).is_ok())
    }

    /// Sessions not yet closed
    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.values().filter(|s| !s.closed).count()
    }

    /// Sessions closed so far
    pub fn closed_sessions(&self) -> usize {
        self.state.lock().sessions.values().filter(|s| s.closed).count()
    }

    pub fn remote_description(&self, peer_id: &str) -> Option<Value> {
        self.with_session(peer_id, |s| s.remote.clone()).flatten()
    }

    pub fn local_description(&self, peer_id: &str) -> Option<Value> {
        self.with_session(peer_id, |s| s.local.clone()).flatten()
    }

    pub fn candidates(&self, peer_id: &str) -> Vec<Value> {
        self.with_session(peer_id, |s| s.candidates.clone()).unwrap_or_default()
    }

    pub fn attached_source(&self, peer_id: &str) -> Option<Arc<MediaSource>> {
        self.with_session(peer_id, |s| s.source.clone()).flatten()
    }

    pub fn applied_bitrate(&self, peer_id: &str) -> Option<u64> {
        self.with_session(peer_id, |s| s.bitrate).flatten()
    }

    fn with_session<T>(&self, peer_id: &str, f: impl FnOnce(&MockSession) -> T) -> Option<T> {
        let handle = self.handle_for(peer_id)?;
        self.state.lock().sessions.get(&handle).map(f)
    }

    /// Count the call and consume a scheduled failure
    fn enter(&self, op: MockOp) -> Result<()> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;

        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::EngineError(format!("injected {:?} failure", op)));
            }
        }
        Ok(())
    }

    /// Hang here if a stall is scheduled for `op`
    async fn stall(&self, op: MockOp) {
        let stalled = {
            let mut state = self.state.lock();
            match state.stalls.get_mut(&op) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    fn update<T>(&self, handle: SessionHandle, f: impl FnOnce(&mut MockSession) -> T) -> Result<T> {
        let mut state = self.state.lock();
        match state.sessions.get_mut(&handle) {
            Some(session) if !session.closed => Ok(f(session)),
            _ => Err(Error::SessionNotFound(handle.to_string())),
        }
    }

    fn notify_connected(&self, handle: SessionHandle, description: &Value) {
        if self.auto_connect && description["type"] == "answer" {
            self.emit_state_for(handle, EngineConnectionState::Connected);
        }
    }
}

#[async_trait]
impl RtcEngine for MockEngine {
    async fn create_session(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<SessionHandle> {
        self.enter(MockOp::CreateSession)?;
        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);

        self.state.lock().sessions.insert(
            handle,
            MockSession {
                peer_id: peer_id.to_string(),
                events: Some(events),
                ..Default::default()
            },
        );
        Ok(handle)
    }

    async fn create_offer(&self, handle: SessionHandle) -> Result<Value> {
        self.enter(MockOp::CreateOffer)?;
        self.update(handle, |_| json!({"type": "offer", "sdp": format!("mock-offer-{}", handle.0)}))
    }

    async fn create_answer(&self, handle: SessionHandle) -> Result<Value> {
        self.enter(MockOp::CreateAnswer)?;
        self.update(handle, |s| {
            s.remote
                .as_ref()
                .filter(|r| r["type"] == "offer")
                .map(|_| json!({"type": "answer", "sdp": format!("mock-answer-{}", handle.0)}))
        })?
        .ok_or_else(|| Error::NegotiationError("no remote offer applied".to_string()))
    }

    async fn set_local_description(&self, handle: SessionHandle, description: Value) -> Result<()> {
        self.update(handle, |s| s.local = Some(description.clone()))?;
        self.notify_connected(handle, &description);
        Ok(())
    }

    async fn set_remote_description(&self, handle: SessionHandle, description: Value) -> Result<()> {
        self.enter(MockOp::SetRemoteDescription)?;
        if description.get("type").and_then(Value::as_str).is_none() {
            return Err(Error::NegotiationError("description has no type".to_string()));
        }
        self.update(handle, |s| s.remote = Some(description.clone()))?;
        self.notify_connected(handle, &description);
        Ok(())
    }

    async fn add_ice_candidate(&self, handle: SessionHandle, candidate: Value) -> Result<()> {
        self.enter(MockOp::AddIceCandidate)?;
        self.update(handle, |s| s.candidates.push(candidate))
    }

    async fn attach_tracks(&self, handle: SessionHandle, source: Option<Arc<MediaSource>>) -> Result<()> {
        self.enter(MockOp::AttachTracks)?;
        self.stall(MockOp::AttachTracks).await;
        self.update(handle, |s| s.source = source)
    }

    async fn apply_bitrate(&self, handle: SessionHandle, bitrate: u64) -> Result<()> {
        self.update(handle, |s| s.bitrate = Some(bitrate))
    }

    async fn get_stats(&self, handle: SessionHandle) -> Result<PeerMetrics> {
        self.enter(MockOp::GetStats)?;
        let state = self.state.lock();
        let session = state
            .sessions
            .get(&handle)
            .filter(|s| !s.closed)
            .ok_or_else(|| Error::SessionNotFound(handle.to_string()))?;
        Ok(state.stats.get(&session.peer_id).copied().unwrap_or_default())
    }

    async fn close(&self, handle: SessionHandle) -> Result<()> {
        if let Some(session) = self.state.lock().sessions.get_mut(&handle) {
            session.closed = true;
        }
        Ok(())
    }
}
