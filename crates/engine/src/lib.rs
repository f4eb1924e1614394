//! Broadcast session engine
//!
//! One host captures a local media source and streams it to many remote
//! viewers over WebRTC, coordinated through a WebSocket signaling relay.
//!
//! # Features
//!
//! - **Connection registry**: authoritative per-peer lifecycle and metrics
//! - **Signaling channel**: persistent link with offline queue, FIFO flush and
//!   capped exponential reconnect
//! - **Fault recovery**: classified errors, bounded per-key retries, a
//!   one-shot "manual intervention required" notice
//! - **Session orchestration**: one RTC engine session per peer behind the
//!   [`RtcEngine`] seam
//! - **Broadcast coordination**: the local source attached to every session,
//!   per-peer bitrate envelopes
//! - **Quality control**: periodic stats sampling and stepwise bitrate
//!   adaptation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Viewers (browser)                                       │
//! │  ↕ WebSocket relay             ↕ WebRTC                  │
//! │  BroadcastHost                                           │
//! │  ├─ SignalingChannel ──────► inbound router              │
//! │  ├─ BroadcastCoordinator (source, envelopes)             │
//! │  │   └─ SessionOrchestrator ─► RtcEngine (per peer)      │
//! │  ├─ QualityController (stats → adapt_bitrate)            │
//! │  ├─ FaultRecoveryManager (retry / backoff / exhaustion)  │
//! │  └─ ConnectionRegistry (peer state, events)              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use beamcast_engine::BroadcastConfig;
//!
//! let mut config = BroadcastConfig::default();
//! config.signaling.url = "wss://relay.example.com/ws".to_string();
//! config.quality.bitrate_step = 250_000;
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.bitrate.start, 2_000_000);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! # #[cfg(all(feature = "webrtc-engine", feature = "ws-signaling"))]
//! # let _ = tokio_test::block_on(async {
//! use beamcast_engine::{BroadcastConfig, BroadcastHost, WebRtcEngine, WebSocketConnector};
//! use std::sync::Arc;
//! use tracing::Span;
//!
//! let config = BroadcastConfig::default();
//! let engine = Arc::new(WebRtcEngine::new(&config.ice, &Span::current())?);
//! let host = BroadcastHost::new(
//!     config.clone(),
//!     engine,
//!     Arc::new(WebSocketConnector::default()),
//!     &Span::current(),
//! )?;
//!
//! host.start(&config.signaling.url).await?;
//! println!("{:?}", host.stats());
//! host.shutdown().await?;
//! # Ok::<(), beamcast_engine::Error>(())
//! # });
//! ```

#![warn(clippy::all)]

pub mod broadcast;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod quality;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod signaling;

// Re-exports for public API
pub use broadcast::{BitrateEnvelope, BroadcastCoordinator, MediaSource, MediaTrack, TrackKind};
pub use config::{
    BitrateBounds, BroadcastConfig, IceConfig, QualityConfig, QualityThresholds, RecoveryConfig,
    SignalingConfig, TurnServerConfig,
};
pub use error::{Error, Result};
pub use events::EventBus;
pub use host::{BroadcastHost, HostEvent, PeerReport};
pub use quality::{Adjustment, CycleReport, QualityController, QualityEvent};
pub use recovery::{
    ErrorKind, ErrorRecord, FaultRecoveryManager, HandleOutcome, RecoveryContext, RecoveryEvent,
    RecoveryKey,
};
pub use registry::{
    AggregateStats, ConnectionRegistry, PeerMetrics, PeerSession, PeerState, RegistryEvent,
};
pub use session::{
    EngineConnectionState, EngineEvent, OrchestratorEvent, RtcEngine, SessionHandle,
    SessionOrchestrator,
};
#[cfg(any(test, feature = "test-util"))]
pub use session::{MockEngine, MockOp};
#[cfg(feature = "webrtc-engine")]
pub use session::WebRtcEngine;
pub use signaling::{LinkState, SignalingChannel, SignalingConnector, SignalingEvent, SignalingMessage};
#[cfg(feature = "ws-signaling")]
pub use signaling::WebSocketConnector;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
