//! Configuration types for the broadcast engine

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a broadcast host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Signaling channel settings
    pub signaling: SignalingConfig,

    /// ICE servers handed to the RTC engine
    pub ice: IceConfig,

    /// Fault recovery policy
    pub recovery: RecoveryConfig,

    /// Quality control loop settings
    pub quality: QualityConfig,

    /// Default per-peer bitrate envelope
    pub bitrate: BitrateBounds,

    /// Upper bound for graceful shutdown before forcing termination (default: 5000ms)
    pub shutdown_timeout_ms: u64,
}

/// Signaling channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket signaling server URL (ws:// or wss://)
    pub url: String,

    /// Register as broadcast host after connecting (default: true)
    pub register_as_host: bool,

    /// Base reconnection delay in milliseconds (default: 1000ms)
    pub reconnect_base_delay_ms: u64,

    /// Maximum automatic reconnection attempts (default: 3)
    pub max_reconnect_attempts: u32,

    /// Transport connect timeout in milliseconds (default: 5000ms)
    pub connect_timeout_ms: u64,

    /// Heartbeat ping interval in milliseconds, 0 disables (default: 15000ms)
    pub heartbeat_interval_ms: u64,
}

/// ICE server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Fault recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Maximum recovery attempts per error key (default: 3)
    pub max_attempts: u32,

    /// Base retry delay in milliseconds, doubled per attempt (default: 1000ms)
    pub base_delay_ms: u64,

    /// Number of error records retained (default: 100)
    pub error_log_capacity: usize,
}

/// Thresholds that drive bitrate adaptation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// Round-trip latency above which bitrate is decreased (default: 150ms)
    pub max_latency_ms: f64,

    /// Frame rate below which bitrate is decreased (default: 24fps)
    pub min_frame_rate: f64,

    /// Packet loss above which bitrate is decreased (default: 5)
    pub max_packet_loss: f64,
}

/// Quality control loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Run the adaptation loop (default: true)
    pub enabled: bool,

    /// Control cycle interval in milliseconds (default: 2000ms)
    pub interval_ms: u64,

    /// Bitrate change per cycle in bits per second (default: 500_000)
    pub bitrate_step: u64,

    /// Adaptation thresholds
    pub thresholds: QualityThresholds,
}

/// Default bitrate envelope assigned to new peers, in bits per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitrateBounds {
    /// Lowest allowed bitrate (default: 500_000)
    pub floor: u64,

    /// Highest allowed bitrate (default: 5_000_000)
    pub ceiling: u64,

    /// Bitrate a new peer starts at (default: 2_000_000)
    pub start: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            ice: IceConfig::default(),
            recovery: RecoveryConfig::default(),
            quality: QualityConfig::default(),
            bitrate: BitrateBounds::default(),
            shutdown_timeout_ms: 5000,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765".to_string(),
            register_as_host: true,
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 3,
            connect_timeout_ms: 5000,
            heartbeat_interval_ms: 15000,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            error_log_capacity: 100,
        }
    }
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            max_latency_ms: 150.0,
            min_frame_rate: 24.0,
            max_packet_loss: 5.0,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 2000,
            bitrate_step: 500_000,
            thresholds: QualityThresholds::default(),
        }
    }
}

impl Default for BitrateBounds {
    fn default() -> Self {
        Self {
            floor: 500_000,
            ceiling: 5_000_000,
            start: 2_000_000,
        }
    }
}

impl SignalingConfig {
    /// Reconnect delay for a 1-indexed attempt: `base × 2^(attempt−1)`
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.reconnect_base_delay_ms, attempt)
    }
}

impl RecoveryConfig {
    /// Retry delay for a 1-indexed attempt: `base × 2^(attempt−1)`
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay_ms, attempt)
    }
}

/// Exponential backoff shared by signaling reconnects and fault recovery
pub(crate) fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
}

impl BroadcastConfig {
    /// Load a configuration file
    ///
    /// `.json` files are parsed as JSON, everything else as YAML. Missing
    /// fields fall back to their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            _ => serde_yaml::from_str(&text)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling.url` is not a WebSocket URL
    /// - `signaling.max_reconnect_attempts` or `recovery.max_attempts` is 0
    /// - `quality.interval_ms` or `quality.bitrate_step` is 0
    /// - thresholds are not positive
    /// - the bitrate envelope is not `0 < floor <= start <= ceiling`
    pub fn validate(&self) -> Result<()> {
        if !self.signaling.url.starts_with("ws://") && !self.signaling.url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling.url must start with ws:// or wss://, got {}",
                self.signaling.url
            )));
        }

        if self.signaling.max_reconnect_attempts == 0 {
            return Err(Error::InvalidConfig(
                "signaling.max_reconnect_attempts must be at least 1".to_string(),
            ));
        }

        if self.recovery.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "recovery.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.recovery.error_log_capacity == 0 {
            return Err(Error::InvalidConfig(
                "recovery.error_log_capacity must be at least 1".to_string(),
            ));
        }

        if self.quality.interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "quality.interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.quality.bitrate_step == 0 {
            return Err(Error::InvalidConfig(
                "quality.bitrate_step must be greater than 0".to_string(),
            ));
        }

        let t = &self.quality.thresholds;
        if !(t.max_latency_ms > 0.0 && t.min_frame_rate > 0.0 && t.max_packet_loss > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "quality thresholds must be positive, got {:?}",
                t
            )));
        }

        self.bitrate.validate()
    }

    /// Preset for constrained or lossy networks
    ///
    /// Starts peers lower, tolerates more latency and steps in smaller increments.
    ///
    /// # Example
    ///
    /// ```
    /// use beamcast_engine::config::BroadcastConfig;
    ///
    /// let config = BroadcastConfig::mobile_network_preset("ws://localhost:8765");
    /// assert_eq!(config.bitrate.start, 1_000_000);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn mobile_network_preset(signaling_url: &str) -> Self {
        Self {
            signaling: SignalingConfig {
                url: signaling_url.to_string(),
                max_reconnect_attempts: 5,
                ..Default::default()
            },
            quality: QualityConfig {
                bitrate_step: 250_000,
                thresholds: QualityThresholds {
                    max_latency_ms: 300.0,
                    min_frame_rate: 15.0,
                    max_packet_loss: 10.0,
                },
                ..Default::default()
            },
            bitrate: BitrateBounds {
                floor: 250_000,
                ceiling: 2_500_000,
                start: 1_000_000,
            },
            ..Default::default()
        }
    }

    /// Preset for LAN viewers where bandwidth is plentiful
    pub fn high_quality_preset(signaling_url: &str) -> Self {
        Self {
            signaling: SignalingConfig {
                url: signaling_url.to_string(),
                ..Default::default()
            },
            quality: QualityConfig {
                interval_ms: 1000,
                bitrate_step: 1_000_000,
                ..Default::default()
            },
            bitrate: BitrateBounds {
                floor: 1_000_000,
                ceiling: 8_000_000,
                start: 4_000_000,
            },
            ..Default::default()
        }
    }
}

impl BitrateBounds {
    /// Check `0 < floor <= start <= ceiling`
    pub fn validate(&self) -> Result<()> {
        if self.floor == 0 || self.floor > self.ceiling {
            return Err(Error::InvalidConfig(format!(
                "bitrate floor must be in 1..=ceiling ({}), got {}",
                self.ceiling, self.floor
            )));
        }

        if self.start < self.floor || self.start > self.ceiling {
            return Err(Error::InvalidConfig(format!(
                "bitrate start must be within [{}, {}], got {}",
                self.floor, self.ceiling, self.start
            )));
        }

        Ok(())
    }
}
