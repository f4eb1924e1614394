//! [`RtcEngine`] backed by webrtc-rs
//!
//! One `RTCPeerConnection` per session. Outgoing tracks are
//! `TrackLocalStaticSample`s shared by every session, keyed by the
//! [`MediaTrack`] id, so one encoded frame written with
//! [`WebRtcEngine::write_sample`] fans out to all peers.
//!
//! The engine does not encode media. The bitrate applied per session is
//! recorded and [`WebRtcEngine::target_bitrate`] reports the value the
//! encoder feeding the shared tracks should honor.

use super::engine::{EngineConnectionState, EngineEvent, RtcEngine, SessionHandle};
use crate::broadcast::{MediaSource, MediaTrack, TrackKind};
use crate::config::IceConfig;
use crate::registry::PeerMetrics;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Span};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Counters from the previous stats sample of a session
#[derive(Debug, Clone, Copy)]
struct StatsSample {
    at: Instant,
    bytes_sent: u64,
    video_frames: u64,
}

struct RtcSession {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: tokio::sync::Mutex<Vec<Arc<RTCRtpSender>>>,
    /// Ids of the shared tracks currently sent on this session
    track_ids: Mutex<Vec<String>>,
    bitrate: AtomicU64,
    last_sample: Mutex<Option<StatsSample>>,
}

/// webrtc-rs engine
pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    sessions: RwLock<HashMap<SessionHandle, Arc<RtcSession>>>,
    tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
    video_frames: AtomicU64,
    next_handle: AtomicU64,
    span: Span,
}

impl WebRtcEngine {
    /// Build the engine with default codecs and interceptors
    pub fn new(ice: &IceConfig, parent: &Span) -> Result<Self> {
        let span = info_span!(parent: parent, "webrtc_engine");

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::EngineError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::EngineError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers = ice_servers(ice);
        info!(parent: &span, servers = ice_servers.len(), "WebRTC engine ready");

        Ok(Self {
            api,
            ice_servers,
            sessions: RwLock::new(HashMap::new()),
            tracks: Mutex::new(HashMap::new()),
            video_frames: AtomicU64::new(0),
            next_handle: AtomicU64::new(0),
            span,
        })
    }

    /// Write one encoded frame stamped with the current wall clock
    pub async fn write_frame(&self, track_id: &str, data: Bytes, duration: Duration) -> Result<()> {
        let sample = Sample {
            data,
            duration,
            timestamp: SystemTime::now(),
            ..Default::default()
        };
        self.write_sample(track_id, &sample).await
    }

    /// Write one encoded frame to a shared outgoing track
    pub async fn write_sample(&self, track_id: &str, sample: &Sample) -> Result<()> {
        let track = self
            .tracks
            .lock()
            .get(track_id)
            .cloned()
            .ok_or_else(|| Error::MediaSourceError(format!("Unknown track: {}", track_id)))?;

        track
            .write_sample(sample)
            .await
            .map_err(|e| Error::MediaSourceError(format!("Failed to write sample: {}", e)))?;

        if track.kind() == webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video {
            self.video_frames.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Lowest bitrate applied across open sessions
    ///
    /// Shared tracks carry one encoding, so the most constrained peer wins.
    pub fn target_bitrate(&self) -> Option<u64> {
        self.sessions
            .read()
            .values()
            .map(|s| s.bitrate.load(Ordering::Relaxed))
            .filter(|b| *b > 0)
            .min()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn session(&self, handle: SessionHandle) -> Result<Arc<RtcSession>> {
        self.sessions
            .read()
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(handle.to_string()))
    }

    /// Swap the session's senders for one per track of `source`
    async fn replace_tracks(&self, session: &RtcSession, source: Option<Arc<MediaSource>>) -> Result<()> {
        let mut senders = session.senders.lock().await;
        session.track_ids.lock().clear();

        for sender in senders.drain(..) {
            session
                .pc
                .remove_track(&sender)
                .await
                .map_err(|e| Error::MediaSourceError(format!("Failed to remove track: {}", e)))?;
        }

        let Some(source) = source else {
            debug!(parent: &self.span, peer_id = %session.peer_id, "Detached all tracks");
            return Ok(());
        };

        for track in &source.tracks {
            let local = self.local_track(track, &source.id);
            let sender = session
                .pc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::MediaSourceError(format!("Failed to add track: {}", e)))?;
            senders.push(sender);
            session.track_ids.lock().push(track.id.clone());
        }

        debug!(
            parent: &self.span,
            peer_id = %session.peer_id,
            tracks = senders.len(),
            "Attached tracks"
        );
        Ok(())
    }

    /// Drop shared tracks no live session sends anymore
    fn prune_tracks(&self) {
        let live: HashSet<String> = self
            .sessions
            .read()
            .values()
            .flat_map(|session| session.track_ids.lock().clone())
            .collect();

        let mut tracks = self.tracks.lock();
        let before = tracks.len();
        tracks.retain(|id, _| live.contains(id));
        if tracks.len() < before {
            debug!(parent: &self.span, pruned = before - tracks.len(), "Released unused tracks");
        }
    }

    /// Shared outgoing track for a capture track, created on first use
    fn local_track(&self, track: &MediaTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
        let mut tracks = self.tracks.lock();
        tracks
            .entry(track.id.clone())
            .or_insert_with(|| {
                let capability = match track.kind {
                    TrackKind::Video => RTCRtpCodecCapability {
                        mime_type: "video/VP8".to_string(),
                        clock_rate: 90000,
                        ..Default::default()
                    },
                    TrackKind::Audio => RTCRtpCodecCapability {
                        mime_type: "audio/opus".to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        ..Default::default()
                    },
                };
                Arc::new(TrackLocalStaticSample::new(
                    capability,
                    track.id.clone(),
                    stream_id.to_string(),
                ))
            })
            .clone()
    }
}

fn ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers: Vec<RTCIceServer> = ice
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();

    for turn in &ice.turn_servers {
        servers.push(RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }
    servers
}

fn map_state(state: RTCPeerConnectionState) -> EngineConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => EngineConnectionState::New,
        RTCPeerConnectionState::Connecting => EngineConnectionState::Connecting,
        RTCPeerConnectionState::Connected => EngineConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => EngineConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => EngineConnectionState::Failed,
        RTCPeerConnectionState::Closed => EngineConnectionState::Closed,
    }
}

/// `{"type", "sdp"}` into a parsed session description
fn parse_description(value: &Value) -> Result<RTCSessionDescription> {
    let sdp = value
        .get("sdp")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NegotiationError("description has no sdp".to_string()))?
        .to_string();

    match value.get("type").and_then(Value::as_str) {
        Some("offer") => RTCSessionDescription::offer(sdp),
        Some("answer") => RTCSessionDescription::answer(sdp),
        Some("pranswer") => RTCSessionDescription::pranswer(sdp),
        other => {
            return Err(Error::NegotiationError(format!(
                "unsupported description type: {:?}",
                other
            )))
        }
    }
    .map_err(|e| Error::NegotiationError(format!("Failed to parse description: {}", e)))
}

fn description_value(description: &RTCSessionDescription) -> Result<Value> {
    Ok(serde_json::to_value(description)?)
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn create_session(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<SessionHandle> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(|e| {
            Error::EngineError(format!("Failed to create peer connection: {}", e))
        })?);

        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);

        let state_tx = events.clone();
        let span = self.span.clone();
        let peer = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            debug!(parent: &span, peer_id = %peer, state = %s, "Peer connection state changed");
            let _ = state_tx.send(EngineEvent::StateChanged {
                handle,
                state: map_state(s),
            });
            Box::pin(async {})
        }));

        let candidate_tx = events;
        let span = self.span.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            let span = span.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json().map(serde_json::to_value) {
                    Ok(Ok(candidate)) => {
                        let _ = candidate_tx.send(EngineEvent::LocalCandidate { handle, candidate });
                    }
                    Ok(Err(e)) => warn!(parent: &span, "Failed to encode ICE candidate: {}", e),
                    Err(e) => warn!(parent: &span, "Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        self.sessions.write().insert(
            handle,
            Arc::new(RtcSession {
                peer_id: peer_id.to_string(),
                pc,
                senders: tokio::sync::Mutex::new(Vec::new()),
                track_ids: Mutex::new(Vec::new()),
                bitrate: AtomicU64::new(0),
                last_sample: Mutex::new(None),
            }),
        );

        info!(parent: &self.span, peer_id, %handle, "Created peer connection");
        Ok(handle)
    }

    async fn create_offer(&self, handle: SessionHandle) -> Result<Value> {
        let session = self.session(handle)?;
        let offer = session
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to create offer: {}", e)))?;
        description_value(&offer)
    }

    async fn create_answer(&self, handle: SessionHandle) -> Result<Value> {
        let session = self.session(handle)?;
        let answer = session
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to create answer: {}", e)))?;
        description_value(&answer)
    }

    async fn set_local_description(&self, handle: SessionHandle, description: Value) -> Result<()> {
        let session = self.session(handle)?;
        let description = parse_description(&description)?;
        session
            .pc
            .set_local_description(description)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, handle: SessionHandle, description: Value) -> Result<()> {
        let session = self.session(handle)?;
        let description = parse_description(&description)?;
        session
            .pc
            .set_remote_description(description)
            .await
            .map_err(|e| Error::NegotiationError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, handle: SessionHandle, candidate: Value) -> Result<()> {
        let session = self.session(handle)?;
        let candidate: RTCIceCandidateInit = serde_json::from_value(candidate).map_err(|e| {
            Error::IceCandidateError(format!("Failed to parse ICE candidate: {}", e))
        })?;

        session
            .pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn attach_tracks(&self, handle: SessionHandle, source: Option<Arc<MediaSource>>) -> Result<()> {
        let session = self.session(handle)?;
        let result = self.replace_tracks(&session, source).await;
        self.prune_tracks();
        result
    }

    async fn apply_bitrate(&self, handle: SessionHandle, bitrate: u64) -> Result<()> {
        let session = self.session(handle)?;
        session.bitrate.store(bitrate, Ordering::Relaxed);
        Ok(())
    }

    async fn get_stats(&self, handle: SessionHandle) -> Result<PeerMetrics> {
        let session = self.session(handle)?;
        let report = session.pc.get_stats().await;

        let mut bytes_sent = 0u64;
        let mut rtt: Option<f64> = None;
        let mut packets_lost = 0i64;

        for stats in report.reports.values() {
            match stats {
                StatsReportType::OutboundRTP(outbound) => bytes_sent += outbound.bytes_sent,
                StatsReportType::RemoteInboundRTP(remote) => {
                    packets_lost += remote.packets_lost;
                    if let Some(value) = remote.round_trip_time {
                        rtt = Some(rtt.map_or(value, |current| current.max(value)));
                    }
                }
                _ => {}
            }
        }

        let now = StatsSample {
            at: Instant::now(),
            bytes_sent,
            video_frames: self.video_frames.load(Ordering::Relaxed),
        };
        let previous = session.last_sample.lock().replace(now);

        let (bitrate, frame_rate) = match previous {
            Some(prev) => {
                let elapsed = now.at.duration_since(prev.at).as_secs_f64();
                if elapsed > 0.0 {
                    (
                        now.bytes_sent.saturating_sub(prev.bytes_sent) as f64 * 8.0 / elapsed,
                        now.video_frames.saturating_sub(prev.video_frames) as f64 / elapsed,
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };

        Ok(PeerMetrics {
            bitrate,
            latency_ms: rtt.map_or(0.0, |seconds| seconds * 1000.0),
            frame_rate,
            packets_lost: packets_lost.max(0) as f64,
        })
    }

    async fn close(&self, handle: SessionHandle) -> Result<()> {
        let Some(session) = self.sessions.write().remove(&handle) else {
            return Ok(());
        };

        info!(parent: &self.span, peer_id = %session.peer_id, %handle, "Closing peer connection");
        self.prune_tracks();
        session
            .pc
            .close()
            .await
            .map_err(|e| Error::EngineError(format!("Failed to close connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServerConfig;
    use serde_json::json;

    fn engine() -> WebRtcEngine {
        WebRtcEngine::new(&IceConfig::default(), &Span::none()).unwrap()
    }

    #[test]
    fn test_ice_servers_include_turn() {
        let ice = IceConfig {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![TurnServerConfig {
                url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
        };

        let servers = ice_servers(&ice);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].urls, vec!["turn:turn.example.com:3478".to_string()]);
    }

    #[test]
    fn test_parse_description_rejects_bad_input() {
        assert!(parse_description(&json!({"type": "offer"})).is_err());
        assert!(parse_description(&json!({"type": "rollback", "sdp": "v=0"})).is_err());
        assert!(parse_description(&json!({"sdp": "v=0"})).is_err());
    }

    #[tokio::test]
    async fn test_offer_with_tracks() {
        let engine = engine();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = engine.create_session("alice", tx).await.unwrap();

        let source = Arc::new(MediaSource::new(vec![
            MediaTrack::video("screen"),
            MediaTrack::audio("mic"),
        ]));
        engine.attach_tracks(handle, Some(source.clone())).await.unwrap();

        let offer = engine.create_offer(handle).await.unwrap();
        assert_eq!(offer["type"], "offer");
        let sdp = offer["sdp"].as_str().unwrap();
        assert!(sdp.contains("m=video"));
        assert!(sdp.contains("m=audio"));

        engine.set_local_description(handle, offer).await.unwrap();

        // Re-attaching replaces the senders instead of adding more
        engine.attach_tracks(handle, Some(source)).await.unwrap();
        assert_eq!(engine.tracks.lock().len(), 2);

        engine.close(handle).await.unwrap();
        assert_eq!(engine.session_count(), 0);
        assert!(engine.create_offer(handle).await.is_err());
    }

    #[tokio::test]
    async fn test_source_swaps_release_old_tracks() {
        let engine = engine();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = engine.create_session("alice", tx.clone()).await.unwrap();
        let b = engine.create_session("bob", tx).await.unwrap();

        for source in [
            MediaSource::new(vec![MediaTrack::video("camera"), MediaTrack::audio("mic")]),
            MediaSource::new(vec![MediaTrack::video("screen")]),
        ] {
            let source = Arc::new(source);
            engine.attach_tracks(a, Some(source.clone())).await.unwrap();
            engine.attach_tracks(b, Some(source)).await.unwrap();
        }

        let current = Arc::new(MediaSource::new(vec![
            MediaTrack::video("window"),
            MediaTrack::audio("line-in"),
        ]));
        engine.attach_tracks(a, Some(current.clone())).await.unwrap();
        engine.attach_tracks(b, Some(current.clone())).await.unwrap();

        {
            let tracks = engine.tracks.lock();
            assert_eq!(tracks.len(), 2);
            assert!(current.tracks.iter().all(|t| tracks.contains_key(&t.id)));
        }

        // Still sent on bob after alice detaches
        engine.attach_tracks(a, None).await.unwrap();
        assert_eq!(engine.tracks.lock().len(), 2);

        engine.close(b).await.unwrap();
        assert!(engine.tracks.lock().is_empty());
        engine.close(a).await.unwrap();
    }

    #[tokio::test]
    async fn test_target_bitrate_is_minimum() {
        let engine = engine();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = engine.create_session("alice", tx.clone()).await.unwrap();
        let b = engine.create_session("bob", tx).await.unwrap();

        assert_eq!(engine.target_bitrate(), None);
        engine.apply_bitrate(a, 2_000_000).await.unwrap();
        engine.apply_bitrate(b, 800_000).await.unwrap();
        assert_eq!(engine.target_bitrate(), Some(800_000));

        engine.close(b).await.unwrap();
        assert_eq!(engine.target_bitrate(), Some(2_000_000));
        engine.close(a).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_track_sample() {
        let engine = engine();
        let err = engine.write_sample("missing", &Sample::default()).await.unwrap_err();
        assert!(matches!(err, Error::MediaSourceError(_)));

        let err = engine
            .write_frame("missing", Bytes::from_static(&[0u8; 4]), Duration::from_millis(33))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaSourceError(_)));
    }
}
