//! Generic polling harness shared by every stage worker.
//!
//! Lifecycle: validate required environment, initialize once, then repeat
//! `process_cycle` and sleep until shutdown is requested. A failing or
//! panicking cycle is logged and the loop carries on. Shutdown is observed
//! between cycles only; a cycle in progress always runs to completion.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use vet_core::config::{missing_vars, ConfigError, EnvSource, BASE_REQUIRED_ENV_VARS};

use crate::services::ServiceError;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("batch reported failure: {0}")]
    BatchFailed(String),
    #[error("invalid worker settings for {0}")]
    InvalidSettings(String),
    #[error("worker used before initialize")]
    NotInitialized,
    #[error("cycle panicked: {0}")]
    Panicked(String),
}

/// Capability a worker plugs into the loop.
pub trait Worker: Send {
    fn name(&self) -> &str;

    /// Variables needed on top of [`BASE_REQUIRED_ENV_VARS`].
    fn stage_env_vars(&self) -> &[&'static str] {
        &[]
    }

    /// Build stage dependencies. Called once, before the first cycle.
    fn initialize(&mut self, env: &dyn EnvSource) -> Result<(), WorkerError>;

    fn process_cycle(&mut self) -> Result<(), WorkerError>;
}

/// Liveness snapshot for supervisors and health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub interval: Duration,
    pub cycle_count: u64,
    pub running: bool,
    /// Error of the most recent cycle; cleared by the next clean cycle.
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Shared, cloneable view of one worker's [`WorkerStatus`].
#[derive(Debug, Clone)]
pub struct StatusHandle(Arc<Mutex<WorkerStatus>>);

impl StatusHandle {
    fn new(name: &str, interval: Duration) -> Self {
        Self(Arc::new(Mutex::new(WorkerStatus {
            name: name.to_string(),
            interval,
            cycle_count: 0,
            running: false,
            last_error: None,
            last_run_at: None,
            started_at: None,
        })))
    }

    pub fn snapshot(&self) -> WorkerStatus {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, WorkerStatus> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct WorkerLoop<W: Worker> {
    worker: W,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    status: StatusHandle,
    initialized: bool,
}

impl<W: Worker> WorkerLoop<W> {
    pub fn new(worker: W, interval: Duration, shutdown: Arc<AtomicBool>) -> Self {
        let status = StatusHandle::new(worker.name(), interval);
        Self {
            worker,
            interval,
            shutdown,
            status,
            initialized: false,
        }
    }

    pub fn name(&self) -> &str {
        self.worker.name()
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.snapshot()
    }

    /// Base variables followed by the worker's own.
    pub fn required_env_vars(&self) -> Vec<&'static str> {
        let mut vars = BASE_REQUIRED_ENV_VARS.to_vec();
        for var in self.worker.stage_env_vars() {
            if !vars.contains(var) {
                vars.push(var);
            }
        }
        vars
    }

    pub fn validate_env(&self, env: &dyn EnvSource) -> Result<(), ConfigError> {
        let missing = missing_vars(env, &self.required_env_vars());
        if missing.is_empty() {
            return Ok(());
        }
        Err(ConfigError::MissingEnvVar {
            name: missing.join(", "),
        })
    }

    /// Validate and initialize; a no-op once it has succeeded.
    pub fn prepare(&mut self, env: &dyn EnvSource) -> Result<(), WorkerError> {
        if self.initialized {
            return Ok(());
        }
        self.validate_env(env)?;
        self.worker.initialize(env)?;
        self.initialized = true;
        tracing::info!(worker = %self.worker.name(), interval_secs = self.interval.as_secs_f64(), "worker initialized");
        Ok(())
    }

    /// Run until shutdown is requested. Only configuration and
    /// initialization errors are returned.
    pub fn start(&mut self, env: &dyn EnvSource) -> Result<(), WorkerError> {
        self.prepare(env)?;
        self.mark_running(true);
        while !self.shutdown.load(Ordering::SeqCst) {
            self.run_cycle();
            self.sleep_interval();
        }
        self.mark_running(false);
        tracing::info!(worker = %self.worker.name(), "worker stopped");
        Ok(())
    }

    /// Prepare, then run exactly one cycle. Returns whether it was clean.
    pub fn run_once(&mut self, env: &dyn EnvSource) -> Result<bool, WorkerError> {
        self.prepare(env)?;
        self.mark_running(true);
        let clean = self.run_cycle();
        self.mark_running(false);
        Ok(clean)
    }

    /// One guarded cycle. Errors and panics are logged and recorded in the
    /// status, never propagated.
    pub fn run_cycle(&mut self) -> bool {
        let worker = &mut self.worker;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| worker.process_cycle())) {
            Ok(result) => result,
            Err(payload) => Err(WorkerError::Panicked(panic_message(payload.as_ref()))),
        };

        let mut status = self.status.lock();
        status.cycle_count += 1;
        status.last_run_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                status.last_error = None;
                true
            }
            Err(err) => {
                tracing::error!(
                    worker = %status.name,
                    cycle = status.cycle_count,
                    error = %err,
                    "cycle failed; retrying after sleep"
                );
                status.last_error = Some(err.to_string());
                false
            }
        }
    }

    fn mark_running(&self, running: bool) {
        let mut status = self.status.lock();
        status.running = running;
        if running && status.started_at.is_none() {
            status.started_at = Some(Utc::now());
        }
    }

    /// Sleep the interval in short slices so a stop request is seen promptly.
    fn sleep_interval(&self) {
        let mut remaining = self.interval;
        while !remaining.is_zero() && !self.shutdown.load(Ordering::SeqCst) {
            let slice = remaining.min(SLEEP_SLICE);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
