//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

use super::{JobEvent, JobEventKind};
use crate::core::JobId;

/// Receives job events for audit and monitoring.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &JobEvent);

    /// Emits an event without blocking. Must never panic.
    fn try_emit(&self, event: &JobEvent);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &JobEvent) {}

    fn try_emit(&self, _event: &JobEvent) {}
}

/// A sink that logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event: &JobEvent) {
        if self.level == Level::DEBUG {
            debug!(
                job_id = %event.job_id,
                correlation_id = %event.correlation_id,
                kind = %event.kind,
                status = %event.status,
                progress = event.progress,
                "Job event: {}", event.kind
            );
        } else {
            info!(
                job_id = %event.job_id,
                correlation_id = %event.correlation_id,
                kind = %event.kind,
                status = %event.status,
                progress = event.progress,
                "Job event: {}", event.kind
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &JobEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &JobEvent) {
        self.log_event(event);
    }
}

/// A sink that keeps every event, for tests and inspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<JobEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events for one job, in emission order.
    #[must_use]
    pub fn events_for(&self, job_id: JobId) -> Vec<JobEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Kinds of the events for one job, in emission order.
    #[must_use]
    pub fn kinds_for(&self, job_id: JobId) -> Vec<JobEventKind> {
        self.events
            .read()
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.kind)
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &JobEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &JobEvent) {
        self.events.write().push(event.clone());
    }
}
