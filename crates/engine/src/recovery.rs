//! Fault recovery: error classification, bounded retry with exponential
//! backoff, and terminal escalation
//!
//! Each recovery key (error kind, optionally scoped to a peer) moves through
//! `Idle -> Retrying -> (Idle | Exhausted)`. A retry run is one spawned task
//! holding an explicit bounded loop; its abort handle is kept next to the
//! retry state so peer removal and shutdown can cancel pending timers.

use crate::config::RecoveryConfig;
use crate::events::EventBus;
use crate::{Error, Result};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Peer transport or negotiation failed
    ConnectionFailed,
    /// Signaling transport failed
    SignalingError,
    /// Local capture could not be started
    CaptureError,
    /// Audio capture or playback failed
    AudioError,
    /// The captured display went away
    DisplayError,
    /// Anything unclassified
    Unknown,
}

impl ErrorKind {
    /// Kinds that trigger automatic recovery
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionFailed | ErrorKind::SignalingError | ErrorKind::DisplayError
        )
    }

    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailed => "connection-failed",
            ErrorKind::SignalingError => "signaling-error",
            ErrorKind::CaptureError => "capture-error",
            ErrorKind::AudioError => "audio-error",
            ErrorKind::DisplayError => "display-error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry bookkeeping key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecoveryKey {
    pub kind: ErrorKind,
    pub peer_id: Option<String>,
}

impl RecoveryKey {
    pub fn global(kind: ErrorKind) -> Self {
        Self {
            kind,
            peer_id: None,
        }
    }

    pub fn for_peer(kind: ErrorKind, peer_id: impl Into<String>) -> Self {
        Self {
            kind,
            peer_id: Some(peer_id.into()),
        }
    }
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer_id {
            Some(peer) => write!(f, "{} ({})", self.kind, peer),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// One reported error
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: SystemTime,
    pub recoverable: bool,
    pub peer_id: Option<String>,
}

/// Retry state for an active recovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub last_attempt_at: Option<Instant>,
    pub in_progress: bool,
}

/// What a recovery callback is told about the attempt it serves
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub key: RecoveryKey,
    pub attempt: u32,
    pub error: ErrorRecord,
}

/// Outcome of reporting an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Kind is not recoverable; the error was only recorded
    NotRecoverable,
    /// A new recovery run was started
    Started,
    /// A run for this key is already active
    InProgress,
    /// The key is exhausted; a `reset` is required before retrying
    Exhausted,
}

/// Recovery manager notifications
#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    /// An error was recorded
    ErrorReported(ErrorRecord),
    /// A retry is about to wait `delay` before invoking the callback
    AttemptScheduled {
        key: RecoveryKey,
        attempt: u32,
        delay: Duration,
    },
    /// The callback succeeded and retry state was cleared
    Recovered { key: RecoveryKey, attempts: u32 },
    /// Max attempts reached; emitted once per exhaustion
    Exhausted { key: RecoveryKey, error: ErrorRecord },
}

type RecoveryCallback = Arc<dyn Fn(RecoveryContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct RetryEntry {
    state: RetryState,
    run_id: u64,
    task: Option<AbortHandle>,
}

struct Inner {
    config: RecoveryConfig,
    callbacks: RwLock<HashMap<ErrorKind, RecoveryCallback>>,
    retries: Mutex<HashMap<RecoveryKey, RetryEntry>>,
    exhausted: Mutex<HashSet<RecoveryKey>>,
    log: Mutex<VecDeque<ErrorRecord>>,
    next_run: Mutex<u64>,
    events: EventBus<RecoveryEvent>,
    span: Span,
}

/// Bounded retry/backoff policy engine
#[derive(Clone)]
pub struct FaultRecoveryManager {
    inner: Arc<Inner>,
}

impl FaultRecoveryManager {
    pub fn new(config: RecoveryConfig, parent: &Span) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                callbacks: RwLock::new(HashMap::new()),
                retries: Mutex::new(HashMap::new()),
                exhausted: Mutex::new(HashSet::new()),
                log: Mutex::new(VecDeque::new()),
                next_run: Mutex::new(0),
                events: EventBus::default(),
                span: info_span!(parent: parent, "recovery"),
            }),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RecoveryEvent> {
        self.inner.events.subscribe()
    }

    /// Register the recovery callback for a kind, replacing any previous one
    pub fn register_recovery<F, Fut>(&self, kind: ErrorKind, callback: F)
    where
        F: Fn(RecoveryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let callback: RecoveryCallback = Arc::new(move |ctx| Box::pin(callback(ctx)));
        self.inner.callbacks.write().insert(kind, callback);
    }

    /// Report an error not tied to any peer
    pub fn handle(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> HandleOutcome {
        self.report(RecoveryKey::global(kind), message.into(), details)
    }

    /// Report an error scoped to one peer
    pub fn handle_for_peer(
        &self,
        kind: ErrorKind,
        peer_id: &str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> HandleOutcome {
        self.report(RecoveryKey::for_peer(kind, peer_id), message.into(), details)
    }

    /// Report a crate error, classified by [`Error::kind`]
    pub fn handle_error(&self, err: &Error, peer_id: Option<&str>) -> HandleOutcome {
        let key = RecoveryKey {
            kind: err.kind(),
            peer_id: peer_id.map(str::to_string),
        };
        self.report(key, err.to_string(), None)
    }

    fn report(
        &self,
        key: RecoveryKey,
        message: String,
        details: Option<serde_json::Value>,
    ) -> HandleOutcome {
        let _enter = self.inner.span.enter();
        let record = ErrorRecord {
            kind: key.kind,
            message,
            details,
            timestamp: SystemTime::now(),
            recoverable: key.kind.is_recoverable(),
            peer_id: key.peer_id.clone(),
        };

        error!("[{}] {}", key, record.message);
        self.inner.push_log(record.clone());
        self.inner.events.emit(RecoveryEvent::ErrorReported(record.clone()));

        if !record.recoverable {
            return HandleOutcome::NotRecoverable;
        }

        if self.inner.exhausted.lock().contains(&key) {
            debug!("Recovery for {} exhausted, awaiting reset", key);
            return HandleOutcome::Exhausted;
        }

        let run_id = {
            let mut retries = self.inner.retries.lock();
            if retries.contains_key(&key) {
                debug!("Recovery already in progress for {}", key);
                return HandleOutcome::InProgress;
            }

            let run_id = {
                let mut next = self.inner.next_run.lock();
                *next += 1;
                *next
            };
            retries.insert(
                key.clone(),
                RetryEntry {
                    state: RetryState {
                        attempts: 0,
                        last_attempt_at: None,
                        in_progress: true,
                    },
                    run_id,
                    task: None,
                },
            );
            run_id
        };

        let task = tokio::spawn(
            run_recovery(self.inner.clone(), key.clone(), record)
                .instrument(self.inner.span.clone()),
        );

        if let Some(entry) = self.inner.retries.lock().get_mut(&key) {
            if entry.run_id == run_id {
                entry.task = Some(task.abort_handle());
            }
        }

        HandleOutcome::Started
    }

    /// Retry state for an active run, if any
    pub fn retry_state(&self, key: &RecoveryKey) -> Option<RetryState> {
        self.inner.retries.lock().get(key).map(|e| e.state)
    }

    /// Check if a key has exhausted its attempts
    pub fn is_exhausted(&self, key: &RecoveryKey) -> bool {
        self.inner.exhausted.lock().contains(key)
    }

    /// Cancel any active run for `key` and clear its exhausted flag
    pub fn reset(&self, key: &RecoveryKey) {
        if let Some(entry) = self.inner.retries.lock().remove(key) {
            abort(entry);
        }
        self.inner.exhausted.lock().remove(key);
    }

    /// Cancel every run and clear every exhausted flag
    pub fn reset_all(&self) {
        self.cancel_all();
        self.inner.exhausted.lock().clear();
    }

    /// Cancel pending retries for one peer's keys and forget its exhaustion
    pub fn cancel_peer(&self, peer_id: &str) {
        let cancelled: Vec<RetryEntry> = {
            let mut retries = self.inner.retries.lock();
            let keys: Vec<RecoveryKey> = retries
                .keys()
                .filter(|k| k.peer_id.as_deref() == Some(peer_id))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| retries.remove(k)).collect()
        };

        if !cancelled.is_empty() {
            debug!(parent: &self.inner.span, "Cancelled {} recovery run(s) for {}", cancelled.len(), peer_id);
        }
        cancelled.into_iter().for_each(abort);

        self.inner
            .exhausted
            .lock()
            .retain(|k| k.peer_id.as_deref() != Some(peer_id));
    }

    /// Cancel every active run
    pub fn cancel_all(&self) {
        let drained: Vec<RetryEntry> = self.inner.retries.lock().drain().map(|(_, e)| e).collect();
        drained.into_iter().for_each(abort);
    }

    /// Error log, oldest first
    pub fn error_log(&self) -> Vec<ErrorRecord> {
        self.inner.log.lock().iter().cloned().collect()
    }

    /// The `count` most recent records, oldest first
    pub fn recent_errors(&self, count: usize) -> Vec<ErrorRecord> {
        let log = self.inner.log.lock();
        let skip = log.len().saturating_sub(count);
        log.iter().skip(skip).cloned().collect()
    }

    pub fn clear_error_log(&self) {
        self.inner.log.lock().clear();
    }
}

impl Inner {
    fn push_log(&self, record: ErrorRecord) {
        let mut log = self.log.lock();
        if log.len() >= self.config.error_log_capacity.max(1) {
            log.pop_front();
        }
        log.push_back(record);
    }
}

fn abort(entry: RetryEntry) {
    if let Some(task) = entry.task {
        task.abort();
    }
}

async fn run_recovery(inner: Arc<Inner>, key: RecoveryKey, error: ErrorRecord) {
    let max_attempts = inner.config.max_attempts;

    loop {
        let attempt = {
            let mut retries = inner.retries.lock();
            let Some(entry) = retries.get_mut(&key) else {
                return;
            };

            if entry.state.attempts >= max_attempts {
                retries.remove(&key);
                drop(retries);
                exhaust(&inner, &key, &error);
                return;
            }

            entry.state.attempts += 1;
            entry.state.last_attempt_at = Some(Instant::now());
            entry.state.attempts
        };

        let delay = inner.config.retry_delay(attempt);
        info!(
            "Attempting recovery for {} (attempt {}/{}) in {:?}",
            key, attempt, max_attempts, delay
        );
        inner.events.emit(RecoveryEvent::AttemptScheduled {
            key: key.clone(),
            attempt,
            delay,
        });

        tokio::time::sleep(delay).await;

        let callback = inner.callbacks.read().get(&key.kind).cloned();
        let result = match callback {
            Some(callback) => {
                callback(RecoveryContext {
                    key: key.clone(),
                    attempt,
                    error: error.clone(),
                })
                .await
            }
            None => Err(Error::RecoveryError(format!(
                "no recovery callback registered for {}",
                key.kind
            ))),
        };

        match result {
            Ok(()) => {
                inner.retries.lock().remove(&key);
                info!("Recovery successful for {} after {} attempt(s)", key, attempt);
                inner.events.emit(RecoveryEvent::Recovered {
                    key: key.clone(),
                    attempts: attempt,
                });
                return;
            }
            Err(e) => {
                warn!("Recovery attempt {} failed for {}: {}", attempt, key, e);
            }
        }
    }
}

fn exhaust(inner: &Inner, key: &RecoveryKey, cause: &ErrorRecord) {
    // Only the first exhaustion of a key emits the terminal event.
    if !inner.exhausted.lock().insert(key.clone()) {
        return;
    }

    let record = ErrorRecord {
        kind: key.kind,
        message: format!(
            "Maximum retry attempts ({}) reached for {}. Manual intervention required.",
            inner.config.max_attempts, key
        ),
        details: Some(serde_json::json!({ "lastError": cause.message })),
        timestamp: SystemTime::now(),
        recoverable: false,
        peer_id: key.peer_id.clone(),
    };

    error!("{}", record.message);
    inner.push_log(record.clone());
    inner.events.emit(RecoveryEvent::Exhausted {
        key: key.clone(),
        error: record,
    });
}
