//! Signaling channel: queued, order-preserving delivery with bounded
//! reconnection
//!
//! The transport itself is behind [`SignalingConnector`]; the channel owns
//! everything above it: the outbound FIFO used while disconnected, host
//! registration, heartbeat, inbound decoding and the reconnect loop.

use super::protocol::{Decoded, SignalingMessage};
use crate::config::SignalingConfig;
use crate::events::EventBus;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, info_span, instrument, trace, warn, Instrument, Span};

/// A live duplex text link produced by a connector
///
/// Dropping `outbound` closes the link; `inbound` yields `None` once the
/// remote side is gone.
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens signaling transports
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<SignalingLink>;
}

/// Channel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Channel notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Link established and queue flushed
    Connected,
    /// Link lost or closed
    Disconnected,
    /// A reconnect attempt will run after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Automatic reconnection gave up; a manual `connect` is required
    MaxReconnectAttempts { attempts: u32 },
    /// Relay confirmed our role
    Registered { role: String },
    /// Relay greeting
    Welcome {
        client_id: Option<String>,
        host_connected: bool,
    },
    /// Relay reports the host went away
    HostDisconnected,
}

struct State {
    link: LinkState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    queue: VecDeque<SignalingMessage>,
    endpoint: Option<String>,
    attempts: u32,
    epoch: u64,
    manual_disconnect: bool,
    client_id: Option<String>,
    reconnect: Option<AbortHandle>,
    reader: Option<AbortHandle>,
    heartbeat: Option<AbortHandle>,
}

struct Inner {
    config: SignalingConfig,
    connector: Arc<dyn SignalingConnector>,
    state: Mutex<State>,
    incoming_tx: mpsc::UnboundedSender<SignalingMessage>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingMessage>>>,
    events: EventBus<SignalingEvent>,
    span: Span,
}

/// Persistent signaling connection with offline queue
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<Inner>,
}

impl SignalingChannel {
    pub fn new(config: SignalingConfig, connector: Arc<dyn SignalingConnector>, parent: &Span) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state: Mutex::new(State {
                    link: LinkState::Disconnected,
                    outbound: None,
                    queue: VecDeque::new(),
                    endpoint: None,
                    attempts: 0,
                    epoch: 0,
                    manual_disconnect: false,
                    client_id: None,
                    reconnect: None,
                    reader: None,
                    heartbeat: None,
                }),
                incoming_tx,
                incoming_rx: Mutex::new(Some(incoming_rx)),
                events: EventBus::default(),
                span: info_span!(parent: parent, "signaling"),
            }),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SignalingEvent> {
        self.inner.events.subscribe()
    }

    /// Take the inbound negotiation stream (peer-joined/left, offer, answer, ice-candidate)
    ///
    /// Returns `None` after the first call.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<SignalingMessage>> {
        self.inner.incoming_rx.lock().take()
    }

    /// Connect to `endpoint`
    ///
    /// Cancels any pending automatic reconnect and resets the attempt
    /// counter. On failure the error is returned and automatic reconnection
    /// is scheduled.
    #[instrument(parent = &self.inner.span, skip(self))]
    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if let Some(task) = state.reconnect.take() {
                task.abort();
            }
            state.attempts = 0;
            state.manual_disconnect = false;
            state.endpoint = Some(endpoint.to_string());

            if state.link == LinkState::Connected {
                debug!("Already connected");
                return Ok(());
            }
        }

        info!("Connecting to signaling server: {}", endpoint);
        match establish(&self.inner, endpoint, false).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Signaling connect failed: {}", e);
                schedule_reconnect(&self.inner);
                Err(e)
            }
        }
    }

    /// Connect to the last used endpoint, or the configured URL if none
    pub async fn connect_default(&self) -> Result<()> {
        let url = self
            .inner
            .state
            .lock()
            .endpoint
            .clone()
            .unwrap_or_else(|| self.inner.config.url.clone());
        self.connect(&url).await
    }

    /// Close the link and stop automatic reconnection
    pub fn disconnect(&self) {
        let was_connected = {
            let mut state = self.inner.state.lock();
            state.manual_disconnect = true;
            state.epoch += 1;
            for task in [state.reconnect.take(), state.reader.take(), state.heartbeat.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
            state.outbound = None;
            let was_connected = state.link == LinkState::Connected;
            state.link = LinkState::Disconnected;
            if was_connected {
                self.inner.events.emit(SignalingEvent::Disconnected);
            }
            was_connected
        };

        if was_connected {
            info!(parent: &self.inner.span, "Signaling disconnected");
        }
    }

    /// Transmit if connected, otherwise enqueue
    pub fn send(&self, message: SignalingMessage) -> Result<()> {
        let text = message.to_json()?;
        let mut state = self.inner.state.lock();

        if state.link == LinkState::Connected {
            if let Some(outbound) = &state.outbound {
                if outbound.send(text).is_ok() {
                    trace!(parent: &self.inner.span, "Sent {}", message.kind());
                    return Ok(());
                }
            }
        }

        debug!(parent: &self.inner.span, "Not connected, queueing {}", message.kind());
        state.queue.push_back(message);
        Ok(())
    }

    pub fn state(&self) -> LinkState {
        self.inner.state.lock().link
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Messages waiting for the next connection
    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Client id assigned by the relay's welcome
    pub fn client_id(&self) -> Option<String> {
        self.inner.state.lock().client_id.clone()
    }

    /// Automatic reconnect attempts since the last successful connection
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().attempts
    }
}

/// Open a link and make it current
///
/// `from_reconnect` marks calls made by the reconnect loop so the loop's own
/// bookkeeping is cleared atomically with the state change.
async fn establish(inner: &Arc<Inner>, endpoint: &str, from_reconnect: bool) -> Result<()> {
    let epoch = {
        let mut state = inner.state.lock();
        state.link = LinkState::Connecting;
        state.epoch += 1;
        state.epoch
    };

    let timeout = Duration::from_millis(inner.config.connect_timeout_ms);
    let result = match tokio::time::timeout(timeout, inner.connector.connect(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(Error::OperationTimeout(format!(
            "signaling connect to {} timed out after {:?}",
            endpoint, timeout
        ))),
    };

    let mut state = inner.state.lock();
    if state.epoch != epoch || state.manual_disconnect {
        return Err(Error::SignalingError("connection attempt superseded".to_string()));
    }

    let link = match result {
        Ok(link) => link,
        Err(e) => {
            state.link = LinkState::Disconnected;
            return Err(e);
        }
    };

    if inner.config.register_as_host {
        let register = SignalingMessage::RegisterHost.to_json()?;
        if link.outbound.send(register).is_err() {
            state.link = LinkState::Disconnected;
            return Err(Error::SignalingError("link closed during registration".to_string()));
        }
    }

    let mut flushed = 0;
    while let Some(message) = state.queue.pop_front() {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping unencodable {}: {}", message.kind(), e);
                continue;
            }
        };
        if link.outbound.send(text).is_err() {
            state.queue.push_front(message);
            break;
        }
        flushed += 1;
    }
    if flushed > 0 {
        info!("Flushed {} queued message(s)", flushed);
    }

    state.link = LinkState::Connected;
    state.outbound = Some(link.outbound);
    state.attempts = 0;
    if from_reconnect {
        state.reconnect = None;
    }

    let reader = tokio::spawn(read_loop(inner.clone(), epoch, link.inbound).instrument(inner.span.clone()));
    state.reader = Some(reader.abort_handle());

    if inner.config.heartbeat_interval_ms > 0 {
        let heartbeat = tokio::spawn(heartbeat_loop(inner.clone(), epoch).instrument(inner.span.clone()));
        state.heartbeat = Some(heartbeat.abort_handle());
    }

    inner.events.emit(SignalingEvent::Connected);
    info!("Connected to signaling server");
    Ok(())
}

fn schedule_reconnect(inner: &Arc<Inner>) {
    let mut state = inner.state.lock();
    if state.manual_disconnect || state.reconnect.is_some() {
        return;
    }
    let Some(endpoint) = state.endpoint.clone() else {
        return;
    };

    let task = tokio::spawn(reconnect_loop(inner.clone(), endpoint).instrument(inner.span.clone()));
    state.reconnect = Some(task.abort_handle());
}

async fn reconnect_loop(inner: Arc<Inner>, endpoint: String) {
    let max_attempts = inner.config.max_reconnect_attempts;

    loop {
        let attempt = {
            let mut state = inner.state.lock();
            if state.manual_disconnect {
                state.reconnect = None;
                return;
            }
            if state.attempts >= max_attempts {
                state.reconnect = None;
                inner.events.emit(SignalingEvent::MaxReconnectAttempts {
                    attempts: state.attempts,
                });
                warn!(
                    "Maximum reconnection attempts ({}) reached, manual connect required",
                    max_attempts
                );
                return;
            }
            state.attempts += 1;
            state.attempts
        };

        let delay = inner.config.reconnect_delay(attempt);
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay, attempt, max_attempts
        );
        inner.events.emit(SignalingEvent::Reconnecting { attempt, delay });
        tokio::time::sleep(delay).await;

        match establish(&inner, &endpoint, true).await {
            Ok(()) => return,
            Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }
}

async fn read_loop(inner: Arc<Inner>, epoch: u64, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = inbound.recv().await {
        dispatch(&inner, &text);
    }

    let manual = {
        let mut state = inner.state.lock();
        if state.epoch != epoch {
            return;
        }
        state.link = LinkState::Disconnected;
        state.outbound = None;
        state.reader = None;
        if let Some(task) = state.heartbeat.take() {
            task.abort();
        }
        inner.events.emit(SignalingEvent::Disconnected);
        state.manual_disconnect
    };

    warn!("Signaling link closed");
    if !manual {
        schedule_reconnect(&inner);
    }
}

async fn heartbeat_loop(inner: Arc<Inner>, epoch: u64) {
    let period = Duration::from_millis(inner.config.heartbeat_interval_ms);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        ticker.tick().await;
        let state = inner.state.lock();
        if state.epoch != epoch || state.link != LinkState::Connected {
            return;
        }
        let Ok(ping) = SignalingMessage::Ping.to_json() else {
            return;
        };
        if let Some(outbound) = &state.outbound {
            let _ = outbound.send(ping);
        }
    }
}

fn dispatch(inner: &Arc<Inner>, text: &str) {
    let message = match SignalingMessage::decode(text) {
        Ok(Decoded::Message(message)) => message,
        Ok(Decoded::Unknown(kind)) => {
            debug!("Ignoring unknown message type: {}", kind);
            return;
        }
        Err(e) => {
            warn!("Dropping malformed signaling message: {}", e);
            return;
        }
    };

    match message {
        SignalingMessage::Welcome {
            client_id,
            host_connected,
        } => {
            info!("Welcome from relay, client id {:?}", client_id);
            inner.state.lock().client_id = client_id.clone();
            inner.events.emit(SignalingEvent::Welcome {
                client_id,
                host_connected,
            });
        }
        SignalingMessage::Registered { role } => {
            info!("Registered as {}", role);
            inner.events.emit(SignalingEvent::Registered { role });
        }
        SignalingMessage::HostDisconnected => {
            inner.events.emit(SignalingEvent::HostDisconnected);
        }
        SignalingMessage::Ping => {
            let state = inner.state.lock();
            if let (Some(outbound), Ok(pong)) = (&state.outbound, SignalingMessage::Pong.to_json()) {
                let _ = outbound.send(pong);
            }
        }
        SignalingMessage::Pong => trace!("pong"),
        SignalingMessage::RegisterHost => debug!("Ignoring echoed register-host"),
        message => {
            let _ = inner.incoming_tx.send(message);
        }
    }
}
