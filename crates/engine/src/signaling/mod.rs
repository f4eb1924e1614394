//! Signaling: wire protocol, queued channel, and transports

pub mod channel;
pub mod protocol;

#[cfg(feature = "ws-signaling")]
pub mod websocket;

pub use channel::{LinkState, SignalingChannel, SignalingConnector, SignalingEvent, SignalingLink};
pub use protocol::{Decoded, SignalingMessage};

#[cfg(feature = "ws-signaling")]
pub use websocket::WebSocketConnector;
