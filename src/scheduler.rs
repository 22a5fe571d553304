//! # Background task scheduling.
//!
//! [`TaskScheduler`] owns every long-running task of one application instance:
//! it spawns them, hands out cloneable [`TaskHandle`]s, cancels them
//! cooperatively, and periodically drops finished entries so fire-and-forget
//! tasks do not accumulate.
//!
//! ## Architecture
//! ```text
//! create(name, f) ──► tokio::spawn(f(child_token)) ──► live map { id → Entry }
//!                                                          │
//! cancel(handle, wait_for) ──► token.cancel() ─► join ─────┤ (entry removed)
//!                                │                         │
//!                                └─ grace exceeded → abort │
//!                                                          │
//! cleanup loop (every cleanup_interval) ── drops finished ─┘
//! ```
//!
//! ## Rules
//! - The scheduler owns the `JoinHandle`s; callers only ever hold a [`TaskHandle`].
//! - Cancelling an unknown or already-finished task is a no-op, not an error.
//! - Panics inside tasks are contained by the join handle and logged, never propagated.
//! - `shutdown()` cancels every remaining task and waits for all of them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Scheduler tuning knobs.
///
/// ## Field semantics
/// - `grace`: maximum wait for a cancelled task to exit before it is aborted
/// - `cleanup_interval`: how often finished entries are dropped from the live map
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Maximum time to wait for a cancelled task before aborting it.
    pub grace: Duration,
    /// Interval of the periodic finished-entry sweep.
    pub cleanup_interval: Duration,
}

impl Default for SchedulerConfig {
    /// Defaults: `grace = 60s`, `cleanup_interval = 300s`.
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Handle to a scheduled task.
///
/// Cheap to clone; the scheduler keeps the actual `JoinHandle`. The handle
/// stays valid after the task finishes — operations on a finished or removed
/// task are no-ops.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    id: u64,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Unique identity of this task within its scheduler.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once cancellation has been requested for this task.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct Entry {
    name: String,
    join: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Lifecycle-safe owner of background tasks for one application instance.
pub struct TaskScheduler {
    tasks: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    cfg: SchedulerConfig,
}

impl TaskScheduler {
    /// Creates a scheduler with default configuration and starts its cleanup sweep.
    pub fn new() -> Arc<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Creates a scheduler with the given configuration and starts its cleanup sweep.
    pub fn with_config(cfg: SchedulerConfig) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            cfg,
        });
        scheduler.clone().spawn_cleanup();
        scheduler
    }

    /// Registers `f` as a new background task and returns its handle.
    ///
    /// `f` receives a fresh [`CancellationToken`] and should observe it at
    /// every suspension point to honor cooperative shutdown. This method
    /// never blocks on the task itself.
    pub async fn create<F, Fut>(&self, name: impl Into<String>, f: F) -> TaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let join = tokio::spawn(f(cancel.clone()));

        debug!(task = %name, id, "scheduled");
        let handle = TaskHandle {
            id,
            cancel: cancel.clone(),
        };
        let mut tasks = self.tasks.lock().await;
        tasks.insert(id, Entry { name, join, cancel });
        handle
    }

    /// Requests cancellation of a task and removes it from the live set.
    ///
    /// If `wait_for` is true, blocks until the task has actually stopped and
    /// returns whether it exited cleanly. Cancellation itself is not an
    /// error: panics and aborts are logged and swallowed. Cancelling an
    /// unknown or already-finished task is a no-op returning `false`.
    pub async fn cancel(&self, handle: &TaskHandle, wait_for: bool) -> bool {
        let entry = { self.tasks.lock().await.remove(&handle.id) };
        let Some(entry) = entry else {
            handle.cancel.cancel();
            return false;
        };

        entry.cancel.cancel();
        if !wait_for {
            return false;
        }

        let abort = entry.join.abort_handle();
        match time::timeout(self.cfg.grace, entry.join).await {
            Ok(Ok(())) => {
                debug!(task = %entry.name, id = handle.id, "cancelled");
                true
            }
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    warn!(task = %entry.name, id = handle.id, "panicked during cancel");
                }
                false
            }
            Err(_elapsed) => {
                warn!(
                    task = %entry.name,
                    id = handle.id,
                    grace = ?self.cfg.grace,
                    "grace exceeded; aborting"
                );
                abort.abort();
                false
            }
        }
    }

    /// True while the task exists in the live set and has not finished.
    pub async fn is_active(&self, handle: &TaskHandle) -> bool {
        self.tasks
            .lock()
            .await
            .get(&handle.id)
            .map(|e| !e.join.is_finished())
            .unwrap_or(false)
    }

    /// Number of entries currently in the live set, finished or not.
    pub async fn live_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Cancels every remaining task and waits for all of them before returning.
    pub async fn shutdown(&self) {
        let entries: Vec<Entry> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().map(|(_, e)| e).collect()
        };

        for entry in &entries {
            entry.cancel.cancel();
        }

        for entry in entries {
            let abort = entry.join.abort_handle();
            match time::timeout(self.cfg.grace, entry.join).await {
                Ok(_) => {}
                Err(_elapsed) => {
                    warn!(task = %entry.name, "stuck during shutdown; aborting");
                    abort.abort();
                }
            }
        }
    }

    /// Periodically removes finished entries from the live set, bounding
    /// memory for fire-and-forget tasks. The sweep removes the scheduler's
    /// reference only; running tasks are untouched.
    fn spawn_cleanup(self: Arc<Self>) {
        let interval = self.cfg.cleanup_interval;
        tokio::spawn(async move {
            loop {
                time::sleep(interval).await;
                if Arc::strong_count(&self) == 1 {
                    // last reference is ours: the scheduler was dropped
                    break;
                }
                self.tasks.lock().await.retain(|_, e| !e.join.is_finished());
            }
        });
    }
}
