//! The measurement session state machine.
//!
//! A session sequences latency → download → upload, reports progress
//! after every completed step, and exposes a result snapshot for the
//! display layer. Failures inside a phase fail the whole run; nothing
//! is retried and nothing is persisted across runs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::{ErrorKind, MeasureError};
use crate::phase::{self, PhaseAggregate};
use crate::probe;
use crate::stats;
use crate::transfer;

/// Defaults mirror the reference web client.
pub const DEFAULT_PINGS: u32 = 8;
pub const DEFAULT_PARALLEL: u32 = 4;
pub const DEFAULT_DOWNLOAD_BYTES: u64 = 20 * 1024 * 1024;
pub const DEFAULT_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for one measurement session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the measurement server.
    pub server: Url,
    /// Number of sequential latency probes.
    pub pings: u32,
    /// Parallel streams per bandwidth phase.
    pub parallel: u32,
    /// Bytes each download stream fetches.
    pub download_bytes: u64,
    /// Bytes each upload stream sends.
    pub upload_bytes: u64,
    /// Per-operation timeout.
    pub timeout: Duration,
}

impl SessionConfig {
    /// Defaults against the given server.
    pub fn new(server: Url) -> Self {
        Self {
            server,
            pings: DEFAULT_PINGS,
            parallel: DEFAULT_PARALLEL,
            download_bytes: DEFAULT_DOWNLOAD_BYTES,
            upload_bytes: DEFAULT_UPLOAD_BYTES,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Discrete steps a full run completes: one per ping and one per
    /// parallel task in each bandwidth phase.
    fn total_steps(&self) -> u32 {
        self.pings + 2 * self.parallel
    }

    fn validate(&self) -> Result<(), MeasureError> {
        if self.pings == 0 {
            return Err(MeasureError::config("pings must be at least 1"));
        }
        if self.parallel == 0 {
            return Err(MeasureError::config("parallel must be at least 1"));
        }
        Ok(())
    }
}

/// States of the measurement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    MeasuringLatency,
    MeasuringDownload,
    MeasuringUpload,
    Completed,
    Failed,
}

impl SessionState {
    /// True while a run holds the state machine.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SessionState::MeasuringLatency
                | SessionState::MeasuringDownload
                | SessionState::MeasuringUpload
        )
    }
}

/// Result snapshot handed to the display layer after every completed
/// step and phase boundary. Fields stay `None` until their phase has
/// produced a value.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub average_latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub progress_percent: u8,
    pub state: SessionState,
    pub error: Option<String>,
}

/// Observer for snapshot updates.
///
/// Implementations must be non-blocking to avoid skewing the
/// measurements they are reporting on.
pub trait ProgressObserver: Send + Sync {
    fn on_update(&self, snapshot: &Snapshot);
}

/// Monotonically increasing step counter driving the 0-100 display.
struct Progress {
    completed: AtomicU32,
    total: u32,
}

impl Progress {
    fn new(total: u32) -> Self {
        Self { completed: AtomicU32::new(0), total: total.max(1) }
    }

    fn reset(&self) {
        self.completed.store(0, Ordering::SeqCst);
    }

    fn advance(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Snap to 100 regardless of rounding drift.
    fn force_complete(&self) {
        self.completed.store(self.total, Ordering::SeqCst);
    }

    fn percent(&self) -> u8 {
        let completed =
            u64::from(self.completed.load(Ordering::SeqCst).min(self.total));
        (completed * 100 / u64::from(self.total)) as u8
    }
}

#[derive(Debug, Default)]
struct Results {
    average_latency_ms: Option<f64>,
    jitter_ms: Option<f64>,
    download_mbps: Option<f64>,
    upload_mbps: Option<f64>,
    error: Option<String>,
    error_kind: Option<ErrorKind>,
}

/// One measurement session.
///
/// Rerunning a finished session is allowed; overlapping runs are not.
/// Starting while a run is in progress is a no-op.
pub struct Session {
    config: SessionConfig,
    client: Client,
    base: String,
    state: Mutex<SessionState>,
    results: Mutex<Results>,
    progress: Progress,
    cancel: Mutex<CancellationToken>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("base", &self.base)
            .field("state", &self.state)
            .field("results", &self.results)
            .field("has_observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, MeasureError> {
        config.validate()?;

        let base = config.server.as_str().trim_end_matches('/').to_string();
        let progress = Progress::new(config.total_steps());

        Ok(Self {
            config,
            client: Client::new(),
            base,
            state: Mutex::new(SessionState::Idle),
            results: Mutex::new(Results::default()),
            progress,
            cancel: Mutex::new(CancellationToken::new()),
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Abort the in-flight run, if any. The affected operations fail
    /// with a cancellation error and the session transitions to Failed.
    pub fn abort(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// State at this instant.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Classification of the terminal error, if the last run failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.results.lock().unwrap().error_kind
    }

    /// Current result snapshot.
    pub fn snapshot(&self) -> Snapshot {
        let state = *self.state.lock().unwrap();
        let results = self.results.lock().unwrap();

        Snapshot {
            average_latency_ms: results.average_latency_ms,
            jitter_ms: results.jitter_ms,
            download_mbps: results.download_mbps,
            upload_mbps: results.upload_mbps,
            progress_percent: self.progress.percent(),
            state,
            error: results.error.clone(),
        }
    }

    /// Run one full session: latency → download → upload.
    ///
    /// A no-op returning the unchanged snapshot when a run is already
    /// in progress. Otherwise clears prior results, resets progress and
    /// sequences the three phases; the first failure transitions to
    /// Failed and ends the run.
    pub async fn run(&self) -> Snapshot {
        let cancel = {
            let mut state = self.state.lock().unwrap();
            if state.is_running() {
                info!("session already running; start ignored");
                drop(state);
                return self.snapshot();
            }
            *state = SessionState::MeasuringLatency;

            *self.results.lock().unwrap() = Results::default();
            self.progress.reset();

            let fresh = CancellationToken::new();
            *self.cancel.lock().unwrap() = fresh.clone();
            fresh
        };
        self.publish();

        match self.run_phases(&cancel).await {
            Ok(()) => {
                self.progress.force_complete();
                self.set_state(SessionState::Completed);
                info!("session completed");
            }
            Err(error) => {
                warn!("session failed: {}", error);
                {
                    let mut results = self.results.lock().unwrap();
                    results.error = Some(error.to_string());
                    results.error_kind = Some(error.kind);
                }
                self.set_state(SessionState::Failed);
            }
        }
        self.publish();

        self.snapshot()
    }

    async fn run_phases(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), MeasureError> {
        self.measure_latency(cancel).await?;

        self.set_state(SessionState::MeasuringDownload);
        self.publish();
        self.measure_download(cancel).await?;

        self.set_state(SessionState::MeasuringUpload);
        self.publish();
        self.measure_upload(cancel).await?;

        Ok(())
    }

    async fn measure_latency(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), MeasureError> {
        let mut samples = Vec::with_capacity(self.config.pings as usize);

        for index in 0..self.config.pings {
            let elapsed = match tokio::time::timeout(
                self.config.timeout,
                probe::probe_once(&self.client, &self.base, &cancel.child_token()),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(MeasureError::timeout(format!(
                        "probe {} exceeded {} ms",
                        index,
                        self.config.timeout.as_millis()
                    )));
                }
            };

            samples.push(elapsed);
            self.step();
        }

        let average = stats::mean(&samples);
        let jitter = stats::jitter(&samples);
        info!(
            "latency: {:.1} ms avg, {:.1} ms jitter over {} probes",
            average,
            jitter,
            samples.len()
        );

        let mut results = self.results.lock().unwrap();
        results.average_latency_ms = Some(average);
        results.jitter_ms = Some(jitter);

        Ok(())
    }

    async fn measure_download(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), MeasureError> {
        let bytes = self.config.download_bytes;
        let aggregate = phase::run(
            self.config.parallel,
            self.config.timeout,
            cancel,
            || self.step(),
            |token| async move {
                transfer::download(&self.client, &self.base, bytes, &token)
                    .await
            },
        )
        .await?;

        self.results.lock().unwrap().download_mbps =
            sanitize_mbps("download", aggregate);

        Ok(())
    }

    async fn measure_upload(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), MeasureError> {
        let bytes = self.config.upload_bytes;
        let aggregate = phase::run(
            self.config.parallel,
            self.config.timeout,
            cancel,
            || self.step(),
            |token| async move {
                transfer::upload(&self.client, &self.base, bytes, &token).await
            },
        )
        .await?;

        self.results.lock().unwrap().upload_mbps =
            sanitize_mbps("upload", aggregate);

        Ok(())
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap() = next;
    }

    fn step(&self) {
        self.progress.advance();
        self.publish();
    }

    fn publish(&self) {
        if let Some(observer) = &self.observer {
            observer.on_update(&self.snapshot());
        }
    }
}

/// A zero-duration measurement yields a non-finite throughput; record
/// it as unmeasured rather than handing infinity to the display.
fn sanitize_mbps(label: &str, aggregate: PhaseAggregate) -> Option<f64> {
    if aggregate.mbps.is_finite() {
        info!(
            "{}: {} bytes in {:.1} ms ({:.2} Mbps)",
            label, aggregate.total_bytes, aggregate.max_elapsed_ms, aggregate.mbps
        );
        Some(aggregate.mbps)
    } else {
        warn!(
            "{} finished too fast to measure ({} bytes in {} ms)",
            label, aggregate.total_bytes, aggregate.max_elapsed_ms
        );
        None
    }
}
