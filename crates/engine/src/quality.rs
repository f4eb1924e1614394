//! Quality control loop: sample peer health, step bitrate up or down
//!
//! Each cycle visits every peer the orchestrator knows, writes fresh
//! metrics to the registry and pushes at most one bitrate step per peer
//! through the broadcast coordinator. A failure for one peer is logged and
//! the cycle moves on.

use crate::broadcast::BroadcastCoordinator;
use crate::config::{QualityConfig, QualityThresholds};
use crate::events::EventBus;
use crate::registry::{ConnectionRegistry, PeerMetrics};
use crate::session::SessionOrchestrator;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Direction of a bitrate step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Increase,
    Decrease,
    Hold,
}

impl QualityThresholds {
    pub fn latency_acceptable(&self, latency_ms: f64) -> bool {
        latency_ms <= self.max_latency_ms
    }

    /// A frame rate of 0 means no sample yet and is not penalized
    pub fn frame_rate_acceptable(&self, frame_rate: f64) -> bool {
        frame_rate <= 0.0 || frame_rate >= self.min_frame_rate
    }

    pub fn packet_loss_acceptable(&self, packets_lost: f64) -> bool {
        packets_lost <= self.max_packet_loss
    }
}

/// Decide the step for one peer; decrease wins over increase
pub fn evaluate(metrics: &PeerMetrics, thresholds: &QualityThresholds) -> Adjustment {
    let degraded = !thresholds.latency_acceptable(metrics.latency_ms)
        || !thresholds.frame_rate_acceptable(metrics.frame_rate)
        || !thresholds.packet_loss_acceptable(metrics.packets_lost);
    if degraded {
        return Adjustment::Decrease;
    }

    let healthy = metrics.latency_ms < 0.5 * thresholds.max_latency_ms
        && metrics.frame_rate >= thresholds.min_frame_rate
        && metrics.packets_lost < 0.5 * thresholds.max_packet_loss;
    if healthy {
        Adjustment::Increase
    } else {
        Adjustment::Hold
    }
}

/// Per-peer result of one control cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub peer_id: String,
    pub metrics: PeerMetrics,
    pub adjustment: Adjustment,
    /// Bitrate after the cycle, if the peer has an envelope
    pub bitrate: Option<u64>,
}

/// Quality notifications
#[derive(Debug, Clone, PartialEq)]
pub enum QualityEvent {
    /// A peer's bitrate was stepped
    BitrateChanged {
        peer_id: String,
        adjustment: Adjustment,
        bitrate: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    thresholds: QualityThresholds,
    step: u64,
}

/// Periodic bitrate adaptation
pub struct QualityController {
    orchestrator: Arc<SessionOrchestrator>,
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<BroadcastCoordinator>,
    settings: RwLock<Settings>,
    interval: Duration,
    task: Mutex<Option<AbortHandle>>,
    events: EventBus<QualityEvent>,
    span: Span,
}

impl QualityController {
    pub fn new(
        config: &QualityConfig,
        orchestrator: Arc<SessionOrchestrator>,
        registry: Arc<ConnectionRegistry>,
        coordinator: Arc<BroadcastCoordinator>,
        parent: &Span,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            registry,
            coordinator,
            settings: RwLock::new(Settings {
                thresholds: config.thresholds,
                step: config.bitrate_step,
            }),
            interval: Duration::from_millis(config.interval_ms.max(1)),
            task: Mutex::new(None),
            events: EventBus::default(),
            span: info_span!(parent: parent, "quality"),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QualityEvent> {
        self.events.subscribe()
    }

    /// Start the periodic loop; no-op if already running
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let controller: Weak<Self> = Arc::downgrade(self);
        let period = self.interval;
        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    ticker.tick().await;
                    let Some(controller) = controller.upgrade() else {
                        break;
                    };
                    controller.run_cycle().await;
                }
            }
            .instrument(self.span.clone()),
        );

        *task = Some(handle.abort_handle());
        info!(parent: &self.span, "Quality monitoring started ({:?} interval)", period);
    }

    /// Stop the periodic loop
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!(parent: &self.span, "Quality monitoring stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Run one control cycle over every known peer
    pub async fn run_cycle(&self) -> Vec<CycleReport> {
        let settings = *self.settings.read();
        let mut reports = Vec::new();

        for peer_id in self.orchestrator.peers() {
            match self.adjust_peer(&peer_id, settings).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(parent: &self.span, "Quality cycle skipped {}: {}", peer_id, e),
            }
        }

        debug!(parent: &self.span, "Quality cycle visited {} peer(s)", reports.len());
        reports
    }

    async fn adjust_peer(&self, peer_id: &str, settings: Settings) -> Result<CycleReport> {
        let metrics = self.orchestrator.get_stats(peer_id).await?;
        self.registry.update_metrics(peer_id, metrics);

        let adjustment = evaluate(&metrics, &settings.thresholds);
        let current = self.coordinator.current_bitrate(peer_id);

        let bitrate = match (adjustment, current) {
            (Adjustment::Hold, _) | (_, None) => current,
            (direction, Some(current)) => {
                let step = i64::try_from(settings.step).unwrap_or(i64::MAX);
                let from = i64::try_from(current).unwrap_or(i64::MAX);
                let target = match direction {
                    Adjustment::Increase => from.saturating_add(step),
                    _ => from.saturating_sub(step),
                };

                match self.coordinator.adapt_bitrate(peer_id, target).await? {
                    Some(bitrate) => {
                        info!(
                            parent: &self.span,
                            "{:?} bitrate for {}: {} -> {} (latency {:.0}ms, {:.1}fps, {} lost)",
                            direction,
                            peer_id,
                            current,
                            bitrate,
                            metrics.latency_ms,
                            metrics.frame_rate,
                            metrics.packets_lost
                        );
                        self.events.emit(QualityEvent::BitrateChanged {
                            peer_id: peer_id.to_string(),
                            adjustment: direction,
                            bitrate,
                        });
                        Some(bitrate)
                    }
                    None => Some(current),
                }
            }
        };

        Ok(CycleReport {
            peer_id: peer_id.to_string(),
            metrics,
            adjustment,
            bitrate,
        })
    }

    /// Current bitrate of a peer
    pub fn current_bitrate(&self, peer_id: &str) -> Option<u64> {
        self.coordinator.current_bitrate(peer_id)
    }

    pub fn thresholds(&self) -> QualityThresholds {
        self.settings.read().thresholds
    }

    /// Replace the adaptation thresholds; takes effect next cycle
    pub fn set_thresholds(&self, thresholds: QualityThresholds) -> Result<()> {
        let valid = thresholds.max_latency_ms > 0.0
            && thresholds.min_frame_rate > 0.0
            && thresholds.max_packet_loss > 0.0;
        if !valid {
            return Err(Error::InvalidConfig(format!(
                "quality thresholds must be positive, got {:?}",
                thresholds
            )));
        }

        self.settings.write().thresholds = thresholds;
        Ok(())
    }

    /// Replace the per-cycle step in bits per second
    pub fn set_step(&self, step: u64) -> Result<()> {
        if step == 0 {
            return Err(Error::InvalidConfig("bitrate step must be greater than 0".to_string()));
        }
        self.settings.write().step = step;
        Ok(())
    }
}

impl Drop for QualityController {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
