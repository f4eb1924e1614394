//! Broadcast engine integration test harness
//!
//! Provides:
//! - `ScriptedConnector`: in-memory signaling links, optionally failing the
//!   first N connects, with the relay end of each link handed to the test
//! - `Relay`: a real WebSocket relay on a random port that pairs one host
//!   with any number of viewers
//! - `Viewer`: a WebSocket client playing the browser side
//!
//! Basic usage pattern:
//!
//! 1. Build a `BroadcastHost` with a `MockEngine` and either connector
//! 2. Drive the viewer side through `RelayEnd` or `Viewer`
//! 3. Assert on host stats, engine recordings and `HostEvent`s

#![allow(dead_code)]

pub mod relay;

use async_trait::async_trait;
use beamcast_engine::{BroadcastConfig, Error, Result, SignalingConnector};
use beamcast_engine::signaling::SignalingLink;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

pub use relay::{Relay, Viewer};

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,beamcast_engine=debug")
        .with_test_writer()
        .try_init();
}

/// Config with heartbeats off and the quality loop driven by hand
pub fn test_config() -> BroadcastConfig {
    let mut config = BroadcastConfig::default();
    config.signaling.url = "ws://relay.test/ws".to_string();
    config.signaling.heartbeat_interval_ms = 0;
    config.quality.enabled = false;
    config
}

/// Relay side of one in-memory link
pub struct RelayEnd {
    pub to_host: mpsc::UnboundedSender<String>,
    pub from_host: mpsc::UnboundedReceiver<String>,
}

impl RelayEnd {
    /// Send a JSON message to the host
    pub fn send(&self, message: Value) {
        self.to_host
            .send(message.to_string())
            .expect("host link closed");
    }

    /// Next message from the host of the given `type`, skipping others
    pub async fn recv_type(&mut self, kind: &str) -> Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let text = self.from_host.recv().await.expect("host link closed");
                let value: Value = serde_json::from_str(&text).expect("host sent invalid JSON");
                if value["type"] == kind {
                    return value;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {} message from host", kind))
    }

    /// Every message the host has sent so far
    pub fn drain(&mut self) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Ok(text) = self.from_host.try_recv() {
            messages.push(serde_json::from_str(&text).expect("host sent invalid JSON"));
        }
        messages
    }
}

/// Connector that refuses the first `fail_first` connects
pub struct ScriptedConnector {
    calls: AtomicU32,
    fail_first: AtomicU32,
    ends: mpsc::UnboundedSender<RelayEnd>,
}

impl ScriptedConnector {
    pub fn new(fail_first: u32) -> (Self, mpsc::UnboundedReceiver<RelayEnd>) {
        let (ends, ends_rx) = mpsc::unbounded_channel();
        (
            Self {
                calls: AtomicU32::new(0),
                fail_first: AtomicU32::new(fail_first),
                ends,
            },
            ends_rx,
        )
    }

    /// Connect attempts so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Let every further connect succeed
    pub fn heal(&self) {
        self.fail_first.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingConnector for ScriptedConnector {
    async fn connect(&self, _endpoint: &str) -> Result<SignalingLink> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first.load(Ordering::SeqCst) {
            return Err(Error::WebSocketError("connection refused".to_string()));
        }

        let (outbound, from_host) = mpsc::unbounded_channel();
        let (to_host, inbound) = mpsc::unbounded_channel();
        let _ = self.ends.send(RelayEnd { to_host, from_host });
        Ok(SignalingLink { outbound, inbound })
    }
}

/// Poll `condition` until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
