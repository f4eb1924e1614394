//! Per-peer RTC sessions
//!
//! [`SessionOrchestrator`] owns one engine session per remote peer and
//! drives offer/answer and ICE through the [`RtcEngine`] seam.

pub mod engine;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod orchestrator;
#[cfg(feature = "webrtc-engine")]
pub mod webrtc_engine;

pub use engine::{EngineConnectionState, EngineEvent, RtcEngine, SessionHandle};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockEngine, MockOp};
pub use orchestrator::{OrchestratorEvent, SessionOrchestrator};
#[cfg(feature = "webrtc-engine")]
pub use webrtc_engine::WebRtcEngine;
