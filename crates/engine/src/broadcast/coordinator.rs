//! Broadcast coordination: one local source fanned out to every peer

use super::envelope::BitrateEnvelope;
use super::source::MediaSource;
use crate::config::BitrateBounds;
use crate::registry::ConnectionRegistry;
use crate::session::SessionOrchestrator;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, info_span, instrument, warn, Span};

#[derive(Default)]
struct MediaState {
    video: Option<MediaSource>,
    audio: Option<MediaSource>,
    combined: Option<Arc<MediaSource>>,
}

/// Binds the local source to sessions and owns per-peer bitrate envelopes
pub struct BroadcastCoordinator {
    orchestrator: Arc<SessionOrchestrator>,
    registry: Arc<ConnectionRegistry>,
    /// Serializes source swaps with peer add/remove
    media: tokio::sync::Mutex<MediaState>,
    envelopes: Mutex<HashMap<String, BitrateEnvelope>>,
    /// Serializes envelope mutations
    adapt: tokio::sync::Mutex<()>,
    defaults: RwLock<BitrateBounds>,
    span: Span,
}

impl BroadcastCoordinator {
    pub fn new(
        orchestrator: Arc<SessionOrchestrator>,
        registry: Arc<ConnectionRegistry>,
        defaults: BitrateBounds,
        parent: &Span,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            media: tokio::sync::Mutex::new(MediaState::default()),
            envelopes: Mutex::new(HashMap::new()),
            adapt: tokio::sync::Mutex::new(()),
            defaults: RwLock::new(defaults),
            span: info_span!(parent: parent, "broadcast"),
        }
    }

    /// Replace the whole local source
    #[instrument(parent = &self.span, skip_all)]
    pub async fn set_local_source(&self, source: Option<MediaSource>) -> Result<()> {
        let mut media = self.media.lock().await;
        media.video = source.clone();
        media.audio = source;
        self.recombine(&mut media).await
    }

    /// Replace the video part of the local source
    #[instrument(parent = &self.span, skip_all)]
    pub async fn set_video_source(&self, source: Option<MediaSource>) -> Result<()> {
        let mut media = self.media.lock().await;
        media.video = source;
        self.recombine(&mut media).await
    }

    /// Replace the audio part of the local source
    #[instrument(parent = &self.span, skip_all)]
    pub async fn set_audio_source(&self, source: Option<MediaSource>) -> Result<()> {
        let mut media = self.media.lock().await;
        media.audio = source;
        self.recombine(&mut media).await
    }

    async fn recombine(&self, media: &mut MediaState) -> Result<()> {
        let combined = MediaSource::combine(media.video.as_ref(), media.audio.as_ref()).map(Arc::new);
        match &combined {
            Some(source) => info!(
                "Local source {} ({} track(s)) attached to {} session(s)",
                source.id,
                source.tracks.len(),
                self.orchestrator.session_count()
            ),
            None => info!("Local source released"),
        }
        media.combined = combined.clone();
        self.orchestrator.set_local_source(combined).await
    }

    /// Current combined source
    pub async fn local_source(&self) -> Option<Arc<MediaSource>> {
        self.media.lock().await.combined.clone()
    }

    /// Start broadcasting to a new peer and return the offer to send
    #[instrument(parent = &self.span, skip(self))]
    pub async fn add_peer(&self, peer_id: &str) -> Result<Value> {
        let _media = self.media.lock().await;

        self.orchestrator.create_session(peer_id).await?;
        self.assign_default_envelope(peer_id).await;

        let offer = self.orchestrator.create_offer(peer_id).await?;
        info!("Peer {} added, offer created", peer_id);
        Ok(offer)
    }

    /// Accept a viewer-initiated offer and return the answer to send
    #[instrument(parent = &self.span, skip(self, offer))]
    pub async fn handle_offer(&self, peer_id: &str, offer: Value) -> Result<Value> {
        let _media = self.media.lock().await;

        if !self.orchestrator.has_session(peer_id) {
            self.orchestrator.create_session(peer_id).await?;
            self.assign_default_envelope(peer_id).await;
        }

        self.orchestrator.handle_remote_offer(peer_id, offer).await
    }

    /// Stop broadcasting to a peer; no-op if unknown
    #[instrument(parent = &self.span, skip(self))]
    pub async fn remove_peer(&self, peer_id: &str) {
        let _media = self.media.lock().await;

        self.orchestrator.close_session(peer_id).await;
        if self.envelopes.lock().remove(peer_id).is_some() {
            info!("Peer {} removed", peer_id);
        }
    }

    async fn assign_default_envelope(&self, peer_id: &str) {
        let envelope = BitrateEnvelope::new(*self.defaults.read());
        self.envelopes.lock().insert(peer_id.to_string(), envelope);

        if let Err(e) = self.orchestrator.apply_bitrate(peer_id, envelope.current()).await {
            warn!("Failed to apply initial bitrate for {}: {}", peer_id, e);
        }
    }

    /// Move a peer's bitrate toward `target`, clamped into its envelope
    ///
    /// Returns the applied value, or `None` when the clamped target equals
    /// the current bitrate.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn adapt_bitrate(&self, peer_id: &str, target: i64) -> Result<Option<u64>> {
        let _adapt = self.adapt.lock().await;

        let next = {
            let envelopes = self.envelopes.lock();
            let envelope = envelopes
                .get(peer_id)
                .ok_or_else(|| Error::SessionNotFound(peer_id.to_string()))?;
            let next = envelope.clamp(target);
            if next == envelope.current() {
                debug!("Bitrate for {} unchanged at {}", peer_id, next);
                return Ok(None);
            }
            next
        };

        self.orchestrator.apply_bitrate(peer_id, next).await?;

        if let Some(envelope) = self.envelopes.lock().get_mut(peer_id) {
            envelope.set(next as i64);
        }
        info!("Bitrate for {} set to {} bps", peer_id, next);
        Ok(Some(next))
    }

    /// Replace a peer's envelope range, keeping its current bitrate inside
    pub async fn set_envelope(&self, peer_id: &str, floor: u64, ceiling: u64) -> Result<BitrateEnvelope> {
        let _adapt = self.adapt.lock().await;

        let (before, after) = {
            let mut envelopes = self.envelopes.lock();
            let envelope = envelopes
                .get_mut(peer_id)
                .ok_or_else(|| Error::SessionNotFound(peer_id.to_string()))?;
            let before = envelope.current();
            envelope.rebound(floor, ceiling);
            (before, *envelope)
        };

        if after.current() != before {
            self.orchestrator.apply_bitrate(peer_id, after.current()).await?;
        }
        Ok(after)
    }

    /// Envelope bounds assigned to peers added from now on
    pub fn set_default_bounds(&self, bounds: BitrateBounds) -> Result<()> {
        bounds.validate()?;
        *self.defaults.write() = bounds;
        Ok(())
    }

    pub fn default_bounds(&self) -> BitrateBounds {
        *self.defaults.read()
    }

    pub fn envelope(&self, peer_id: &str) -> Option<BitrateEnvelope> {
        self.envelopes.lock().get(peer_id).copied()
    }

    pub fn current_bitrate(&self, peer_id: &str) -> Option<u64> {
        self.envelope(peer_id).map(|e| e.current())
    }

    /// Peers with a session whose transport is connected
    pub fn connected_peers(&self) -> Vec<String> {
        self.orchestrator
            .peers()
            .into_iter()
            .filter(|p| self.registry.is_connected(p))
            .collect()
    }

    /// Peers with a session in any state
    pub fn peer_count(&self) -> usize {
        self.orchestrator.session_count()
    }

    /// Close every session, drop envelopes and release the source
    #[instrument(parent = &self.span, skip(self))]
    pub async fn stop(&self) {
        let mut media = self.media.lock().await;

        self.orchestrator.close_all().await;
        self.envelopes.lock().clear();
        *media = MediaState::default();
        if let Err(e) = self.orchestrator.set_local_source(None).await {
            warn!("Error releasing local source: {}", e);
        }
        info!("Broadcast stopped");
    }
}
