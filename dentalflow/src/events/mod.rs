//! Job events: audit sinks and per-job progress streams.
//!
//! Every state transition produces a [`JobEvent`] carrying the job's
//! correlation id. The state machine hands it to the configured
//! [`EventSink`] and to the [`ProgressHub`], which fans it out to
//! subscribers of that job.

mod progress;
mod sink;

pub use progress::{JobEvent, JobEventKind, ProgressHub, ProgressStream};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
