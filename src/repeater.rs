//! # Generic infinite-retry loop with once-per-streak error logging.
//!
//! [`Repeat`] is the trait every long-lived feature implements: one-time
//! [`prepare`](Repeat::prepare), then [`run`](Repeat::run) called forever.
//! [`Repeater`] drives the loop inside a task owned by the
//! [`TaskScheduler`](crate::TaskScheduler), so start/stop are deterministic.
//!
//! ## Loop body
//! ```text
//! prepare() ── Cancelled ──► stop silently
//!          └── Err ────────► log once, never start
//! loop {
//!   run() ── Ok ──────────► log "resumed" once if the previous iteration failed
//!        ├── Cancelled ───► stop
//!        └── Err ─────────► log only the first failure of a streak, keep looping
//! }
//! ```
//!
//! The implementer of [`Repeat::run`] is responsible for rate limiting
//! between iterations (typically a cancellable sleep before returning).
//!
//! ## Example
//! ```
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//! use eventvisor::{Repeat, RepeatError, Repeater, TaskScheduler};
//!
//! struct Ticker;
//!
//! #[async_trait]
//! impl Repeat for Ticker {
//!     fn name(&self) -> &str {
//!         "ticker"
//!     }
//!
//!     async fn prepare(&self, _ctx: CancellationToken) -> Result<(), RepeatError> {
//!         Ok(())
//!     }
//!
//!     async fn run(&self, ctx: CancellationToken) -> Result<(), RepeatError> {
//!         tokio::select! {
//!             _ = ctx.cancelled() => Err(RepeatError::Cancelled),
//!             _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => Ok(()),
//!         }
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let scheduler = TaskScheduler::new();
//! let repeater = Repeater::new(scheduler.clone(), std::sync::Arc::new(Ticker));
//! repeater.start().await;
//! assert!(repeater.active().await);
//! repeater.stop().await;
//! assert!(!repeater.active().await);
//! # scheduler.shutdown().await;
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::RepeatError;
use crate::scheduler::{TaskHandle, TaskScheduler};

/// # Repeatable unit of work.
///
/// Implementors should observe `ctx` at every suspension point and return
/// [`RepeatError::Cancelled`] to abort the loop deliberately.
#[async_trait]
pub trait Repeat: Send + Sync + 'static {
    /// Stable, human-readable name for logs.
    fn name(&self) -> &str;

    /// One-time preparation, called before the first [`run`](Repeat::run).
    ///
    /// Any error other than [`RepeatError::Cancelled`] aborts the repeater
    /// after a single error log.
    async fn prepare(&self, ctx: CancellationToken) -> Result<(), RepeatError>;

    /// One iteration of the loop.
    ///
    /// Called again immediately after returning; implementations that can
    /// fail in a tight loop should sleep before returning an error.
    async fn run(&self, ctx: CancellationToken) -> Result<(), RepeatError>;
}

/// Shared handle to a repeatable unit.
pub type RepeatRef = Arc<dyn Repeat>;

/// Drives a [`Repeat`] inside a scheduler-owned task.
///
/// `start()` cancels any previous instance before scheduling a new one;
/// `stop()` cancels the managed task via the scheduler and waits for it.
pub struct Repeater {
    scheduler: Arc<TaskScheduler>,
    repeat: RepeatRef,
    task: Mutex<Option<TaskHandle>>,
}

impl Repeater {
    /// Creates a repeater; the loop is not started yet.
    pub fn new(scheduler: Arc<TaskScheduler>, repeat: RepeatRef) -> Self {
        Self {
            scheduler,
            repeat,
            task: Mutex::new(None),
        }
    }

    /// Starts (or restarts) the managed loop task.
    ///
    /// Holds the task slot for the whole stop-then-start sequence, so
    /// concurrent `start()` calls serialize and exactly one loop survives.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            self.scheduler.cancel(&handle, true).await;
        }

        let repeat = self.repeat.clone();
        let handle = self
            .scheduler
            .create(repeat.name().to_string(), move |ctx| {
                repeat_loop(repeat, ctx)
            })
            .await;
        *task = Some(handle);
    }

    /// Cancels the managed loop task and waits for it to exit.
    ///
    /// A no-op when the repeater was never started.
    pub async fn stop(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            self.scheduler.cancel(&handle, true).await;
        }
    }

    /// True while the managed task exists and has not finished.
    pub async fn active(&self) -> bool {
        match &*self.task.lock().await {
            Some(handle) => self.scheduler.is_active(handle).await,
            None => false,
        }
    }
}

/// The managed loop body: `prepare` once, then `run` until cancelled.
async fn repeat_loop(repeat: RepeatRef, ctx: CancellationToken) {
    let name = repeat.name().to_string();

    match repeat.prepare(ctx.clone()).await {
        Ok(()) => {}
        Err(RepeatError::Cancelled) => {
            info!(repeat = %name, "cancelled during prepare");
            return;
        }
        Err(err) => {
            error!(repeat = %name, error = %err, "error during prepare");
            return;
        }
    }

    let mut last_ok = true;
    loop {
        if ctx.is_cancelled() {
            return;
        }

        match repeat.run(ctx.clone()).await {
            Ok(()) => {
                if !last_ok {
                    info!(repeat = %name, "resumed");
                    last_ok = true;
                }
            }
            Err(RepeatError::Cancelled) => {
                if !ctx.is_cancelled() {
                    info!(repeat = %name, "cancelled during runtime");
                }
                return;
            }
            Err(err) => {
                // Only log the first error of a streak to prevent log spam.
                if last_ok {
                    error!(repeat = %name, error = %err, "error during runtime");
                    last_ok = false;
                }
            }
        }
    }
}
