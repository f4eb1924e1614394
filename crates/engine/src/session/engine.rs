//! RTC engine seam
//!
//! The session orchestrator never touches SDP, ICE or media itself; it
//! drives an [`RtcEngine`] through opaque [`SessionHandle`]s. Descriptions
//! and candidates cross this boundary as JSON values in the shape the
//! remote browser produces (`{"type", "sdp"}` and `RTCIceCandidateInit`).

use crate::broadcast::MediaSource;
use crate::registry::{PeerMetrics, PeerState};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opaque engine session id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Transport state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Closed,
    Failed,
}

impl From<EngineConnectionState> for PeerState {
    fn from(state: EngineConnectionState) -> Self {
        match state {
            EngineConnectionState::New | EngineConnectionState::Connecting => PeerState::Connecting,
            EngineConnectionState::Connected => PeerState::Connected,
            EngineConnectionState::Disconnected | EngineConnectionState::Closed => {
                PeerState::Disconnected
            }
            EngineConnectionState::Failed => PeerState::Failed,
        }
    }
}

/// Callback traffic from engine sessions
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Transport state transition
    StateChanged {
        handle: SessionHandle,
        state: EngineConnectionState,
    },
    /// A local ICE candidate was gathered
    LocalCandidate {
        handle: SessionHandle,
        candidate: Value,
    },
}

/// Real-time transport capability consumed by the orchestrator
///
/// Implementations must be safe to call concurrently for different
/// handles. Calls for one handle are serialized by the caller.
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Create a session for `peer_id`; state and candidate callbacks go to `events`
    async fn create_session(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<SessionHandle>;

    /// Produce a local offer
    async fn create_offer(&self, handle: SessionHandle) -> Result<Value>;

    /// Produce a local answer; the remote offer is already applied
    async fn create_answer(&self, handle: SessionHandle) -> Result<Value>;

    async fn set_local_description(&self, handle: SessionHandle, description: Value) -> Result<()>;

    async fn set_remote_description(&self, handle: SessionHandle, description: Value) -> Result<()>;

    async fn add_ice_candidate(&self, handle: SessionHandle, candidate: Value) -> Result<()>;

    /// Replace the tracks sent on this session; `None` detaches everything
    async fn attach_tracks(&self, handle: SessionHandle, source: Option<Arc<MediaSource>>) -> Result<()>;

    /// Apply an outgoing bitrate cap in bits per second
    async fn apply_bitrate(&self, _handle: SessionHandle, _bitrate: u64) -> Result<()> {
        Ok(())
    }

    /// Sample current health metrics
    async fn get_stats(&self, handle: SessionHandle) -> Result<PeerMetrics>;

    /// Tear the session down; closing an unknown handle is not an error
    async fn close(&self, handle: SessionHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(PeerState::from(EngineConnectionState::New), PeerState::Connecting);
        assert_eq!(PeerState::from(EngineConnectionState::Connecting), PeerState::Connecting);
        assert_eq!(PeerState::from(EngineConnectionState::Connected), PeerState::Connected);
        assert_eq!(PeerState::from(EngineConnectionState::Disconnected), PeerState::Disconnected);
        assert_eq!(PeerState::from(EngineConnectionState::Closed), PeerState::Disconnected);
        assert_eq!(PeerState::from(EngineConnectionState::Failed), PeerState::Failed);
    }
}
