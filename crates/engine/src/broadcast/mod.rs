//! Broadcast: local media source, per-peer bitrate envelopes, and the
//! coordinator that fans the source out to every session

pub mod coordinator;
pub mod envelope;
pub mod source;

pub use coordinator::BroadcastCoordinator;
pub use envelope::BitrateEnvelope;
pub use source::{MediaSource, MediaTrack, TrackKind};
