//! Capture source: keeps a radio receiver scanning across transient failures.
//!
//! The retry loop moves through `Idle -> Starting -> Scanning` and falls back
//! to `Retrying` on any start or runtime failure, waiting `min(5 * attempt, 30)`
//! seconds between attempts. After [`MAX_ATTEMPTS`] consecutive failures it
//! settles in the terminal `Failed` state.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::normalize::RawDetection;

/// Consecutive failed starts before the capture source gives up.
pub const MAX_ATTEMPTS: u32 = 10;

/// Interval between liveness checks while scanning. Also bounds how long a
/// stop request can wait.
pub const LIVENESS_POLL: Duration = Duration::from_secs(5);

/// Upper bound on a receiver's `stop`, so a stalled backend cannot hold up
/// shutdown.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const BACKOFF_STEP_SECS: u64 = 5;
const BACKOFF_CAP_SECS: u64 = 30;

/// Callback receiving every detection. Runs on the backend's delivery path
/// and must return quickly.
pub type DetectionSink = Arc<dyn Fn(RawDetection) + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("bluetooth adapter not ready: {0}")]
    AdapterNotReady(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Other(String),
    #[error("capture failed after {0} consecutive attempts")]
    Exhausted(u32),
}

impl CaptureError {
    /// Sort a backend failure message into one of the known categories.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("not ready")
            || lower.contains("notready")
            || lower.contains("powered off")
        {
            CaptureError::AdapterNotReady(message)
        } else if lower.contains("permission denied")
            || lower.contains("not permitted")
            || lower.contains("notauthorized")
            || lower.contains("access denied")
        {
            CaptureError::PermissionDenied(message)
        } else {
            CaptureError::Other(message)
        }
    }
}

/// A radio receiver the capture source can drive.
pub trait Receiver: Send + Sync {
    /// Begin scanning, delivering each detection to `sink`.
    fn start(&self, sink: DetectionSink) -> BoxFuture<'_, Result<(), CaptureError>>;

    /// Stop scanning. Called best-effort; failures are logged by the caller.
    fn stop(&self) -> BoxFuture<'_, Result<(), CaptureError>>;

    /// Periodic liveness check while scanning. An error is treated as a
    /// runtime failure and sends the capture source back into its retry loop.
    fn check(&self) -> BoxFuture<'_, Result<(), CaptureError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Starting,
    Scanning,
    Retrying { attempt: u32, delay: Duration },
    Stopping,
    Failed,
}

impl ScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Starting => "starting",
            ScanState::Scanning => "scanning",
            ScanState::Retrying { .. } => "retrying",
            ScanState::Stopping => "stopping",
            ScanState::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Retrying { attempt, delay } => write!(
                f,
                "retrying (attempt {attempt}/{MAX_ATTEMPTS}, in {}s)",
                delay.as_secs()
            ),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Linear backoff: 5s per failed attempt, capped at 30s.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs((BACKOFF_STEP_SECS * u64::from(attempt)).min(BACKOFF_CAP_SECS))
}

pub struct CaptureSource {
    shared: Arc<Shared>,
    sink: Mutex<Option<DetectionSink>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

struct Shared {
    receiver: Arc<dyn Receiver>,
    adapter: String,
    state: watch::Sender<ScanState>,
    attempt: AtomicU32,
    errors: AtomicU64,
}

impl CaptureSource {
    pub fn new(receiver: Arc<dyn Receiver>, adapter: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ScanState::Idle);
        CaptureSource {
            shared: Arc::new(Shared {
                receiver,
                adapter: adapter.into(),
                state,
                attempt: AtomicU32::new(0),
                errors: AtomicU64::new(0),
            }),
            sink: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Register the detection sink. Takes effect on the next start.
    pub fn on_detection<F>(&self, sink: F)
    where
        F: Fn(RawDetection) + Send + Sync + 'static,
    {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(sink));
    }

    /// Spawn the retry loop. Does nothing if it is already running.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            warn!("Capture source already running");
            return;
        }

        let registered = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let sink: DetectionSink = match registered {
            Some(sink) => sink,
            None => Arc::new(|_: RawDetection| {}),
        };

        info!("Starting capture on adapter {}", self.shared.adapter);
        self.shared.attempt.store(0, Ordering::Relaxed);
        self.shared.state.send_replace(ScanState::Starting);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&self.shared).run(sink, cancel.clone()));
        *task = Some((cancel, handle));
    }

    /// Stop scanning. Idempotent, and a no-op once the source has failed.
    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((cancel, handle)) = task else {
            return;
        };
        if self.state() == ScanState::Failed {
            return;
        }

        info!("Stopping capture");
        self.shared.state.send_replace(ScanState::Stopping);
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!("Capture task ended abnormally: {}", e);
        }
        self.shared.state.send_replace(ScanState::Idle);
        info!("Capture stopped");
    }

    pub fn state(&self) -> ScanState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the source reaches the terminal `Failed` state.
    pub async fn failed(&self) -> CaptureError {
        let mut state = self.subscribe();
        // The sender lives in `self`, so this only ends once `Failed` is seen.
        let _ = state.wait_for(|s| *s == ScanState::Failed).await;
        CaptureError::Exhausted(MAX_ATTEMPTS)
    }

    /// Consecutive failed attempts since the last successful start.
    pub fn attempt(&self) -> u32 {
        self.shared.attempt.load(Ordering::Relaxed)
    }

    /// Total start and runtime failures over the process lifetime.
    pub fn errors(&self) -> u64 {
        self.shared.errors.load(Ordering::Relaxed)
    }

    pub fn adapter(&self) -> &str {
        &self.shared.adapter
    }
}

enum Outcome {
    StopRequested,
    Failed(CaptureError),
}

impl Shared {
    async fn run(self: Arc<Self>, sink: DetectionSink, cancel: CancellationToken) {
        loop {
            self.set_state(ScanState::Starting);
            debug!(
                "Starting scan (attempt {})",
                self.attempt.load(Ordering::Relaxed) + 1
            );

            let error = match self.scan_once(&sink, &cancel).await {
                Outcome::StopRequested => return,
                Outcome::Failed(error) => error,
            };

            // `scan_once` zeroes the counter on every successful start.
            let attempt = self.attempt.fetch_add(1, Ordering::Relaxed) + 1;
            self.errors.fetch_add(1, Ordering::Relaxed);
            self.report(&error, attempt);

            if attempt >= MAX_ATTEMPTS {
                error!(
                    "Failed to start scanner after {} attempts. Giving up.",
                    MAX_ATTEMPTS
                );
                self.set_state(ScanState::Failed);
                return;
            }

            let delay = backoff_delay(attempt);
            info!("Retrying in {} seconds...", delay.as_secs());
            self.set_state(ScanState::Retrying { attempt, delay });
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One pass through `Starting -> Scanning`, until a stop request or a failure.
    async fn scan_once(&self, sink: &DetectionSink, cancel: &CancellationToken) -> Outcome {
        let started = tokio::select! {
            _ = cancel.cancelled() => {
                self.stop_receiver().await;
                return Outcome::StopRequested;
            }
            result = self.receiver.start(Arc::clone(sink)) => result,
        };
        if let Err(error) = started {
            return Outcome::Failed(error);
        }

        self.attempt.store(0, Ordering::Relaxed);
        self.set_state(ScanState::Scanning);
        info!("Scanning on adapter {}", self.adapter);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop_receiver().await;
                    return Outcome::StopRequested;
                }
                _ = tokio::time::sleep(LIVENESS_POLL) => {
                    if let Err(error) = self.receiver.check().await {
                        self.stop_receiver().await;
                        return Outcome::Failed(error);
                    }
                }
            }
        }
    }

    async fn stop_receiver(&self) {
        match tokio::time::timeout(STOP_TIMEOUT, self.receiver.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Error stopping scanner: {}", e),
            Err(_) => warn!(
                "Scanner did not stop within {}s, abandoning it",
                STOP_TIMEOUT.as_secs()
            ),
        }
    }

    fn report(&self, error: &CaptureError, attempt: u32) {
        match error {
            CaptureError::AdapterNotReady(_) => error!(
                "Bluetooth adapter not ready (attempt {}/{}). \
                 Try: sudo hciconfig {} down && sudo hciconfig {} up",
                attempt, MAX_ATTEMPTS, self.adapter, self.adapter
            ),
            CaptureError::PermissionDenied(_) => error!(
                "Permission denied accessing Bluetooth adapter (attempt {}/{}). \
                 Try: sudo usermod -a -G bluetooth $USER (then logout/login)",
                attempt, MAX_ATTEMPTS
            ),
            other => error!("Scanner error (attempt {}/{}): {}", attempt, MAX_ATTEMPTS, other),
        }
    }

    fn set_state(&self, state: ScanState) {
        self.state.send_if_modified(|current| {
            // Failed is terminal and Stopping belongs to `stop()`.
            if matches!(*current, ScanState::Failed | ScanState::Stopping) || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}
