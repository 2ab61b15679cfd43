//! Observability utilities.

mod logging;
mod timing;

pub use logging::init_tracing;
pub use timing::SpanTimer;
