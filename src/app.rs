//! # Application context.
//!
//! [`App`] is the typed composition root: it owns the [`TaskScheduler`] and
//! the features installed on top of it. Features receive the context (or the
//! pieces of it they need) explicitly at setup time instead of reaching into
//! process globals.

use std::sync::Arc;

use tracing::info;

use crate::eventbus::Eventbus;
use crate::scheduler::{SchedulerConfig, TaskScheduler};

/// One application instance: scheduler plus installed features.
pub struct App {
    scheduler: Arc<TaskScheduler>,
    eventbus: Option<Eventbus>,
}

impl App {
    /// Creates an application with a default-configured scheduler.
    pub fn new() -> Self {
        Self::with_scheduler(TaskScheduler::new())
    }

    /// Creates an application with a custom scheduler configuration.
    pub fn with_config(cfg: SchedulerConfig) -> Self {
        Self::with_scheduler(TaskScheduler::with_config(cfg))
    }

    fn with_scheduler(scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            scheduler,
            eventbus: None,
        }
    }

    /// The scheduler owning this application's background tasks.
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub(crate) fn set_eventbus(&mut self, eventbus: Eventbus) {
        self.eventbus = Some(eventbus);
    }

    pub(crate) fn eventbus(&self) -> Option<&Eventbus> {
        self.eventbus.as_ref()
    }

    /// Starts every installed feature.
    pub async fn start(&self) {
        if let Some(eventbus) = &self.eventbus {
            eventbus.start().await;
        }
        info!("application started");
    }

    /// Stops every installed feature, then the scheduler and everything it
    /// still owns.
    pub async fn shutdown(&self) {
        if let Some(eventbus) = &self.eventbus {
            eventbus.stop().await;
        }
        self.scheduler.shutdown().await;
        info!("application stopped");
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}
