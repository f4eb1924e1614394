//! Broadcast host: wires the components into one control surface
//!
//! `BroadcastHost` owns the registry, signaling channel, recovery manager,
//! session orchestrator, broadcast coordinator and quality controller, and
//! runs the router tasks between them:
//!
//! ```text
//! signaling inbound ──► peer-joined / offer / answer / ice / peer-left ──► coordinator, orchestrator
//! orchestrator      ──► local candidates ──► signaling
//!                   ──► Failed transitions ──► recovery (connection-failed)
//! signaling events  ──► max reconnect attempts ──► recovery (signaling-error)
//! recovery events   ──► exhausted peer ──► cancel its recovery, remove the peer
//! every component   ──► HostEvent bus
//! ```

use crate::broadcast::{BroadcastCoordinator, MediaSource};
use crate::config::{BitrateBounds, BroadcastConfig, QualityThresholds};
use crate::events::EventBus;
use crate::quality::{QualityController, QualityEvent};
use crate::recovery::{ErrorKind, FaultRecoveryManager, RecoveryContext, RecoveryEvent};
use crate::registry::{AggregateStats, ConnectionRegistry, PeerMetrics, PeerState, RegistryEvent};
use crate::session::{OrchestratorEvent, RtcEngine, SessionOrchestrator};
use crate::signaling::{SignalingChannel, SignalingConnector, SignalingEvent, SignalingMessage};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::AbortHandle;
use tracing::{debug, info, info_span, instrument, warn, Instrument, Span};

/// How long a re-created peer session may take to reach `Connected`
/// before the recovery attempt counts as failed
pub const PEER_RECOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Unified host notifications
#[derive(Debug, Clone)]
pub enum HostEvent {
    Registry(RegistryEvent),
    Signaling(SignalingEvent),
    Recovery(RecoveryEvent),
    Quality(QualityEvent),
    /// A peer was removed after its recovery attempts ran out
    PeerDropped { peer_id: String },
}

/// Per-peer view for the control surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerReport {
    pub peer_id: String,
    pub state: PeerState,
    pub metrics: PeerMetrics,
    /// Current envelope bitrate in bits per second
    pub bitrate: Option<u64>,
    pub connected_for: Duration,
}

/// Shared handles the router tasks and recovery callbacks work on
#[derive(Clone)]
struct Wiring {
    registry: Arc<ConnectionRegistry>,
    signaling: SignalingChannel,
    recovery: FaultRecoveryManager,
    orchestrator: Arc<SessionOrchestrator>,
    coordinator: Arc<BroadcastCoordinator>,
    events: EventBus<HostEvent>,
    span: Span,
}

impl Wiring {
    /// Forget the peer's recovery state, then close its session
    async fn drop_peer(&self, peer_id: &str) {
        self.recovery.cancel_peer(peer_id);
        self.coordinator.remove_peer(peer_id).await;
    }
}

/// One broadcast: a local source fanned out to every viewer that joins
pub struct BroadcastHost {
    config: BroadcastConfig,
    wiring: Wiring,
    quality: Arc<QualityController>,
    running: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
    span: Span,
}

impl BroadcastHost {
    /// Build and wire every component
    ///
    /// Must be called within a tokio runtime. Router tasks start
    /// immediately; signaling connects on [`BroadcastHost::start`].
    pub fn new(
        config: BroadcastConfig,
        engine: Arc<dyn RtcEngine>,
        connector: Arc<dyn SignalingConnector>,
        parent: &Span,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let span = info_span!(parent: parent, "host", host_id = %uuid::Uuid::new_v4());

        let registry = Arc::new(ConnectionRegistry::new(&span));
        let signaling = SignalingChannel::new(config.signaling.clone(), connector, &span);
        let recovery = FaultRecoveryManager::new(config.recovery.clone(), &span);
        let orchestrator = SessionOrchestrator::new(engine, registry.clone(), &span);
        let coordinator = Arc::new(BroadcastCoordinator::new(
            orchestrator.clone(),
            registry.clone(),
            config.bitrate,
            &span,
        ));
        let quality = QualityController::new(
            &config.quality,
            orchestrator.clone(),
            registry.clone(),
            coordinator.clone(),
            &span,
        );

        let wiring = Wiring {
            registry,
            signaling,
            recovery,
            orchestrator,
            coordinator,
            events: EventBus::default(),
            span: span.clone(),
        };

        register_recoveries(&wiring);
        let tasks = spawn_routers(&wiring, &quality);

        Ok(Arc::new(Self {
            config,
            wiring,
            quality,
            running: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
            span,
        }))
    }

    /// Subscribe to every component's notifications
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.wiring.events.subscribe()
    }

    /// Connect signaling and start quality monitoring
    ///
    /// If the first connect fails the error is returned, but automatic
    /// reconnection is already scheduled and the host stays started.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn start(&self, endpoint: &str) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Broadcast already running");
            return Ok(());
        }

        if self.config.quality.enabled {
            self.quality.start();
        }

        info!("Starting broadcast via {}", endpoint);
        self.wiring.signaling.connect(endpoint).await
    }

    /// Stop quality monitoring, close every session and disconnect signaling
    ///
    /// Bounded by `shutdown_timeout_ms`; on timeout the remaining work is
    /// abandoned and `OperationTimeout` is returned.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let limit = Duration::from_millis(self.config.shutdown_timeout_ms);
        self.quality.stop();
        self.wiring.recovery.cancel_all();

        let result = tokio::time::timeout(limit, self.wiring.coordinator.stop()).await;
        self.wiring.signaling.disconnect();

        match result {
            Ok(()) => {
                info!("Broadcast stopped");
                Ok(())
            }
            Err(_) => {
                warn!("Shutdown did not finish within {:?}", limit);
                Err(Error::OperationTimeout(format!(
                    "shutdown exceeded {}ms",
                    self.config.shutdown_timeout_ms
                )))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start broadcasting to a peer and send it an offer
    pub async fn add_peer(&self, peer_id: &str) -> Result<()> {
        invite(&self.wiring, peer_id).await
    }

    /// Stop broadcasting to a peer and cancel its recovery
    pub async fn remove_peer(&self, peer_id: &str) {
        self.wiring.drop_peer(peer_id).await;
    }

    /// Replace the whole local source
    pub async fn set_source(&self, source: Option<MediaSource>) -> Result<()> {
        let result = self.wiring.coordinator.set_local_source(source).await;
        self.report_source_failure(&result);
        result
    }

    pub async fn set_video_source(&self, source: Option<MediaSource>) -> Result<()> {
        let result = self.wiring.coordinator.set_video_source(source).await;
        self.report_source_failure(&result);
        result
    }

    pub async fn set_audio_source(&self, source: Option<MediaSource>) -> Result<()> {
        let result = self.wiring.coordinator.set_audio_source(source).await;
        self.report_source_failure(&result);
        result
    }

    fn report_source_failure(&self, result: &Result<()>) {
        if let Err(e) = result {
            self.wiring
                .recovery
                .handle(ErrorKind::DisplayError, e.to_string(), None);
        }
    }

    /// Aggregate connection statistics
    pub fn stats(&self) -> AggregateStats {
        self.wiring.registry.aggregate()
    }

    /// Snapshot of one peer
    pub fn peer_stats(&self, peer_id: &str) -> Option<PeerReport> {
        self.wiring.registry.get(peer_id).map(|session| PeerReport {
            bitrate: self.wiring.coordinator.current_bitrate(&session.peer_id),
            connected_for: session.duration(),
            peer_id: session.peer_id,
            state: session.state,
            metrics: session.metrics,
        })
    }

    /// Snapshots of every registered peer
    pub fn peers(&self) -> Vec<PeerReport> {
        let mut ids: Vec<String> = self
            .wiring
            .registry
            .list_all()
            .into_iter()
            .map(|s| s.peer_id)
            .collect();
        ids.sort();
        ids.iter().filter_map(|id| self.peer_stats(id)).collect()
    }

    pub fn set_thresholds(&self, thresholds: QualityThresholds) -> Result<()> {
        self.quality.set_thresholds(thresholds)
    }

    /// Bitrate bounds assigned to peers that join from now on
    pub fn set_bitrate_bounds(&self, bounds: BitrateBounds) -> Result<()> {
        self.wiring.coordinator.set_default_bounds(bounds)
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.wiring.registry
    }

    pub fn signaling(&self) -> &SignalingChannel {
        &self.wiring.signaling
    }

    pub fn recovery(&self) -> &FaultRecoveryManager {
        &self.wiring.recovery
    }

    pub fn orchestrator(&self) -> &Arc<SessionOrchestrator> {
        &self.wiring.orchestrator
    }

    pub fn coordinator(&self) -> &Arc<BroadcastCoordinator> {
        &self.wiring.coordinator
    }

    pub fn quality(&self) -> &Arc<QualityController> {
        &self.quality
    }
}

impl Drop for BroadcastHost {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.quality.stop();
        self.wiring.recovery.cancel_all();
        self.wiring.signaling.disconnect();
    }
}

/// Create the peer's session and send the offer
async fn invite(wiring: &Wiring, peer_id: &str) -> Result<()> {
    let offer = wiring.coordinator.add_peer(peer_id).await?;
    wiring
        .signaling
        .send(SignalingMessage::offer(peer_id, offer))
}

fn register_recoveries(wiring: &Wiring) {
    let signaling = wiring.signaling.clone();
    wiring
        .recovery
        .register_recovery(ErrorKind::SignalingError, move |_ctx: RecoveryContext| {
            let signaling = signaling.clone();
            async move { signaling.connect_default().await }
        });

    let peers = wiring.clone();
    wiring
        .recovery
        .register_recovery(ErrorKind::ConnectionFailed, move |ctx: RecoveryContext| {
            let wiring = peers.clone();
            async move {
                let peer_id = ctx.key.peer_id.ok_or_else(|| {
                    Error::RecoveryError("connection failure without a peer".to_string())
                })?;
                reconnect_peer(&wiring, &peer_id).await
            }
        });

    let display = wiring.clone();
    wiring
        .recovery
        .register_recovery(ErrorKind::DisplayError, move |_ctx: RecoveryContext| {
            let wiring = display.clone();
            async move {
                let source = wiring.coordinator.local_source().await;
                wiring.orchestrator.set_local_source(source).await
            }
        });
}

/// Re-create a failed peer session and wait for it to connect
async fn reconnect_peer(wiring: &Wiring, peer_id: &str) -> Result<()> {
    let mut registry_rx = wiring.registry.subscribe();
    invite(wiring, peer_id).await?;

    let connected = async {
        loop {
            if wiring.registry.is_connected(peer_id) {
                return Ok(());
            }
            match registry_rx.recv().await {
                Ok(RegistryEvent::Connected(s)) if s.peer_id == peer_id => return Ok(()),
                Ok(RegistryEvent::Updated(s) | RegistryEvent::Disconnected(s))
                    if s.peer_id == peer_id && s.state == PeerState::Failed =>
                {
                    return Err(Error::EngineError(format!("{} failed again", peer_id)));
                }
                Ok(RegistryEvent::Removed(s)) if s.peer_id == peer_id => {
                    return Err(Error::SessionNotFound(peer_id.to_string()));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    return Err(Error::RecoveryError("registry closed".to_string()));
                }
            }
        }
    };

    tokio::time::timeout(PEER_RECOVERY_TIMEOUT, connected)
        .await
        .map_err(|_| Error::OperationTimeout(format!("{} did not reconnect", peer_id)))?
}

fn spawn_routers(wiring: &Wiring, quality: &Arc<QualityController>) -> Vec<AbortHandle> {
    let mut tasks = Vec::new();

    if let Some(incoming) = wiring.signaling.take_incoming() {
        tasks.push(spawn(wiring, route_signaling_messages(wiring.clone(), incoming)));
    }
    tasks.push(spawn(wiring, route_orchestrator_events(wiring.clone(), wiring.orchestrator.subscribe())));
    tasks.push(spawn(wiring, route_signaling_events(wiring.clone(), wiring.signaling.subscribe())));
    tasks.push(spawn(wiring, route_recovery_events(wiring.clone(), wiring.recovery.subscribe())));
    tasks.push(spawn(
        wiring,
        forward(wiring.events.clone(), wiring.registry.subscribe(), HostEvent::Registry),
    ));
    tasks.push(spawn(
        wiring,
        forward(wiring.events.clone(), quality.subscribe(), HostEvent::Quality),
    ));

    tasks
}

fn spawn<F>(wiring: &Wiring, task: F) -> AbortHandle
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(task.instrument(wiring.span.clone())).abort_handle()
}

/// Next event, skipping over lag; `None` once the sender is gone
async fn next_event<E: Clone>(rx: &mut broadcast::Receiver<E>) -> Option<E> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => warn!("Event router lagged, skipped {} event(s)", skipped),
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn forward<E: Clone + Send + 'static>(bus: EventBus<HostEvent>, mut rx: broadcast::Receiver<E>, wrap: fn(E) -> HostEvent) {
    while let Some(event) = next_event(&mut rx).await {
        bus.emit(wrap(event));
    }
}

async fn route_signaling_messages(
    wiring: Wiring,
    mut incoming: tokio::sync::mpsc::UnboundedReceiver<SignalingMessage>,
) {
    // Handled in arrival order: an offer is applied before the candidates
    // that follow it.
    while let Some(message) = incoming.recv().await {
        handle_message(&wiring, message).await;
    }
    debug!("Signaling inbound stream closed");
}

async fn handle_message(wiring: &Wiring, message: SignalingMessage) {
    match message {
        SignalingMessage::PeerJoined { peer_id } => {
            info!("Viewer {} joined", peer_id);
            if let Err(e) = invite(wiring, &peer_id).await {
                warn!("Failed to invite {}: {}", peer_id, e);
                wiring.recovery.handle_error(&e, Some(&peer_id));
            }
        }
        SignalingMessage::PeerLeft { peer_id } => {
            info!("Viewer {} left", peer_id);
            wiring.drop_peer(&peer_id).await;
        }
        SignalingMessage::Offer {
            peer_id: Some(peer_id),
            data,
        } => {
            let result = async {
                let answer = wiring.coordinator.handle_offer(&peer_id, data).await?;
                wiring
                    .signaling
                    .send(SignalingMessage::answer(peer_id.clone(), answer))
            }
            .await;

            if let Err(e) = result {
                warn!("Failed to answer {}: {}", peer_id, e);
                wiring.recovery.handle_error(&e, Some(&peer_id));
            }
        }
        SignalingMessage::Answer {
            peer_id: Some(peer_id),
            data,
        } => {
            match wiring.orchestrator.handle_remote_answer(&peer_id, data).await {
                Ok(()) => {}
                Err(Error::SessionNotFound(_)) => debug!("Answer from unknown peer {}", peer_id),
                Err(e) => {
                    warn!("Failed to apply answer from {}: {}", peer_id, e);
                    wiring.recovery.handle_error(&e, Some(&peer_id));
                }
            }
        }
        SignalingMessage::IceCandidate {
            peer_id: Some(peer_id),
            data,
        } => {
            // A bad candidate is not fatal; ICE continues with the others.
            if let Err(e) = wiring.orchestrator.handle_remote_ice_candidate(&peer_id, data).await {
                warn!("Dropped ICE candidate from {}: {}", peer_id, e);
            }
        }
        other => debug!("Ignoring {} without a routable peer", other.kind()),
    }
}

async fn route_orchestrator_events(wiring: Wiring, mut rx: broadcast::Receiver<OrchestratorEvent>) {
    while let Some(event) = next_event(&mut rx).await {
        match event {
            OrchestratorEvent::LocalCandidate { peer_id, candidate } => {
                if let Err(e) = wiring
                    .signaling
                    .send(SignalingMessage::ice_candidate(peer_id.clone(), candidate))
                {
                    warn!("Failed to forward candidate for {}: {}", peer_id, e);
                }
            }
            OrchestratorEvent::StateChanged {
                peer_id,
                state: PeerState::Failed,
            } => {
                wiring.recovery.handle_for_peer(
                    ErrorKind::ConnectionFailed,
                    &peer_id,
                    format!("Connection to {} failed", peer_id),
                    None,
                );
            }
            OrchestratorEvent::StateChanged { .. } => {}
        }
    }
}

async fn route_signaling_events(wiring: Wiring, mut rx: broadcast::Receiver<SignalingEvent>) {
    while let Some(event) = next_event(&mut rx).await {
        if let SignalingEvent::MaxReconnectAttempts { attempts } = &event {
            wiring.recovery.handle(
                ErrorKind::SignalingError,
                format!("Signaling reconnection gave up after {} attempts", attempts),
                Some(json!({ "attempts": attempts })),
            );
        }
        wiring.events.emit(HostEvent::Signaling(event));
    }
}

async fn route_recovery_events(wiring: Wiring, mut rx: broadcast::Receiver<RecoveryEvent>) {
    while let Some(event) = next_event(&mut rx).await {
        let dropped = match &event {
            RecoveryEvent::Exhausted { key, .. } if key.kind == ErrorKind::ConnectionFailed => {
                key.peer_id.clone()
            }
            _ => None,
        };
        wiring.events.emit(HostEvent::Recovery(event));

        if let Some(peer_id) = dropped {
            warn!("Dropping {} after failed recovery", peer_id);
            wiring.drop_peer(&peer_id).await;
            wiring.events.emit(HostEvent::PeerDropped { peer_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{EngineConnectionState, MockEngine, MockOp};
    use crate::signaling::SignalingLink;
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::mpsc;

    /// Connector handing out one in-memory link per connect
    struct LoopConnector {
        links: Mutex<Vec<(mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>)>>,
    }

    #[async_trait]
    impl SignalingConnector for LoopConnector {
        async fn connect(&self, _endpoint: &str) -> Result<SignalingLink> {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.links.lock().push((in_tx, out_rx));
            Ok(SignalingLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    fn config() -> BroadcastConfig {
        let mut config = BroadcastConfig::default();
        config.signaling.url = "ws://relay.test/ws".to_string();
        config.signaling.heartbeat_interval_ms = 0;
        config.quality.enabled = false;
        config
    }

    async fn host(engine: Arc<MockEngine>) -> (Arc<BroadcastHost>, Arc<LoopConnector>) {
        let connector = Arc::new(LoopConnector {
            links: Mutex::new(Vec::new()),
        });
        let host = BroadcastHost::new(config(), engine, connector.clone(), &Span::none()).unwrap();
        host.start("ws://relay.test/ws").await.unwrap();
        (host, connector)
    }

    fn link(connector: &LoopConnector) -> (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
        connector.links.lock().remove(0)
    }

    async fn next_of_type(rx: &mut mpsc::UnboundedReceiver<String>, kind: &str) -> Value {
        loop {
            let text = rx.recv().await.unwrap();
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }

    #[tokio::test]
    async fn test_peer_joined_sends_offer() {
        let engine = Arc::new(MockEngine::with_auto_connect());
        let (host, connector) = host(engine.clone()).await;
        let (to_host, mut from_host) = link(&connector);

        to_host
            .send(r#"{"type":"peer-joined","peerId":"alice"}"#.to_string())
            .unwrap();

        let offer = next_of_type(&mut from_host, "offer").await;
        assert_eq!(offer["peerId"], "alice");
        assert_eq!(offer["data"]["type"], "offer");

        to_host
            .send(
                json!({"type": "answer", "peerId": "alice", "data": {"type": "answer", "sdp": "v=0"}})
                    .to_string(),
            )
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while host.stats().active_connections != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let report = host.peer_stats("alice").unwrap();
        assert_eq!(report.state, PeerState::Connected);
        assert_eq!(report.bitrate, Some(2_000_000));
    }

    #[tokio::test]
    async fn test_local_candidates_forwarded() {
        let engine = Arc::new(MockEngine::new());
        let (host, connector) = host(engine.clone()).await;
        let (_to_host, mut from_host) = link(&connector);

        host.add_peer("bob").await.unwrap();
        next_of_type(&mut from_host, "offer").await;

        engine.emit_candidate("bob", json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host"}));
        let candidate = next_of_type(&mut from_host, "ice-candidate").await;
        assert_eq!(candidate["peerId"], "bob");
        assert_eq!(candidate["data"]["candidate"], "candidate:1 1 udp 1 10.0.0.1 9 typ host");
    }

    #[tokio::test]
    async fn test_viewer_offer_answered() {
        let engine = Arc::new(MockEngine::new());
        let (_host, connector) = host(engine.clone()).await;
        let (to_host, mut from_host) = link(&connector);

        to_host
            .send(json!({"type": "offer", "peerId": "carol", "data": {"type": "offer", "sdp": "v=0"}}).to_string())
            .unwrap();

        let answer = next_of_type(&mut from_host, "answer").await;
        assert_eq!(answer["peerId"], "carol");
        assert_eq!(answer["data"]["type"], "answer");
        assert_eq!(engine.remote_description("carol").unwrap()["sdp"], "v=0");
    }

    #[tokio::test]
    async fn test_peer_left_removes_peer() {
        let engine = Arc::new(MockEngine::new());
        let (host, connector) = host(engine.clone()).await;
        let (to_host, mut from_host) = link(&connector);

        host.add_peer("dave").await.unwrap();
        next_of_type(&mut from_host, "offer").await;
        assert!(host.registry().contains("dave"));

        let mut events = host.subscribe();
        to_host
            .send(r#"{"type":"user-left","userId":"dave"}"#.to_string())
            .unwrap();

        loop {
            if let HostEvent::Registry(RegistryEvent::Removed(s)) = events.recv().await.unwrap() {
                assert_eq!(s.peer_id, "dave");
                break;
            }
        }
        assert!(!host.orchestrator().has_session("dave"));
        assert_eq!(engine.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_peer_dropped_after_exhaustion() {
        let engine = Arc::new(MockEngine::new());
        let (host, connector) = host(engine.clone()).await;
        let (_to_host, mut from_host) = link(&connector);
        let mut events = host.subscribe();

        host.add_peer("erin").await.unwrap();
        next_of_type(&mut from_host, "offer").await;

        // Every re-created session fails to produce an offer.
        engine.fail_next(MockOp::CreateOffer, u32::MAX);
        assert!(engine.emit_state("erin", EngineConnectionState::Failed));

        let mut exhausted = 0;
        loop {
            match events.recv().await.unwrap() {
                HostEvent::Recovery(RecoveryEvent::Exhausted { key, .. }) => {
                    assert_eq!(key.peer_id.as_deref(), Some("erin"));
                    exhausted += 1;
                }
                HostEvent::PeerDropped { peer_id } => {
                    assert_eq!(peer_id, "erin");
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(exhausted, 1);
        assert!(!host.registry().contains("erin"));
        assert_eq!(engine.calls(MockOp::CreateOffer), 4);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let engine = Arc::new(MockEngine::new());
        let (host, _connector) = host(engine.clone()).await;

        host.add_peer("frank").await.unwrap();
        host.add_peer("grace").await.unwrap();
        assert_eq!(engine.open_sessions(), 2);

        host.shutdown().await.unwrap();
        assert!(!host.is_running());
        assert_eq!(engine.open_sessions(), 0);
        assert!(!host.signaling().is_connected());
        assert_eq!(host.stats().total_connections, 0);

        // Second shutdown is a no-op
        host.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = config();
        config.bitrate.floor = 10_000_000;
        let connector = Arc::new(LoopConnector {
            links: Mutex::new(Vec::new()),
        });
        let result = BroadcastHost::new(config, Arc::new(MockEngine::new()), connector, &Span::none());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
